//! Handoff Sidecar - Entry point

use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use handoff_sidecar::config::TelemetrySettings;
use handoff_sidecar::shutdown::wait_for_os_signal;
use handoff_sidecar::{ExtensionsApiHost, QueueBackend, Sidecar, SidecarConfig};

/// Command-line arguments.
struct Args {
    /// Path to configuration file.
    config: Option<PathBuf>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = args.next().map(PathBuf::from);
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("handoff-sidecar {}", handoff_sidecar::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
            }
        }

        Self { config }
    }
}

fn print_help() {
    println!(
        r"Handoff Sidecar - durable outcome forwarding for short-lived workers

USAGE:
    handoff-sidecar [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file (TOML or JSON)
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT VARIABLES:
    AWS_LAMBDA_RUNTIME_API       Host lifecycle API address (host:port, required)
    DESTINATION_QUEUE_URL        SQS queue URL (selects the SQS client)
    HANDOFF_QUEUE_ENDPOINT       Queue endpoint URL (takes precedence)
    HANDOFF_QUEUE_KIND           Queue client: http or sqs (default: http)
    HANDOFF_QUEUE_REGION         AWS region for SQS (default: from AWS config)
    HANDOFF_LISTEN_PORT          Ingress port on 127.0.0.1 (default: 8080)
    HANDOFF_SAFETY_MARGIN_MS     No retry starts this close to the deadline (default: 1000)
    HANDOFF_MAX_ATTEMPTS         Cap on send attempts per forward (default: none)
    HANDOFF_DRAIN_GRACE_MS       Wait for in-flight forwards on shutdown (default: 2000)
    HANDOFF_EXTENSION_NAME       Name registered with the host (default: handoff)
    RUST_LOG                     Log filter (default: handoff_sidecar=info,warn)

EXAMPLES:
    # Run with configuration file
    handoff-sidecar --config /opt/handoff/sidecar.toml

    # Run with environment variables
    DESTINATION_QUEUE_URL=https://sqs.us-east-1.amazonaws.com/123456789012/outcomes handoff-sidecar
"
    );
}

fn init_tracing(telemetry: &TelemetrySettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if telemetry.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => match SidecarConfig::from_file(path) {
            Ok(config) => config.with_env_overrides(),
            Err(e) => {
                eprintln!("Failed to load configuration: {e}");
                std::process::exit(1);
            }
        },
        None => SidecarConfig::default().with_env_overrides(),
    };

    init_tracing(&config.telemetry);

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting handoff sidecar v{}", handoff_sidecar::VERSION);
    info!(
        "Ingress on {}:{}",
        config.ingress.listen_addr, config.ingress.listen_port
    );
    info!("Queue ({:?}): {}", config.queue.kind, config.queue.endpoint);

    let metrics = if config.telemetry.metrics {
        handoff_sidecar::metrics::install_recorder()
    } else {
        None
    };

    let host = match ExtensionsApiHost::from_config(&config) {
        Ok(host) => host,
        Err(e) => {
            error!("Failed to create host client: {}", e);
            std::process::exit(1);
        }
    };

    let queue = match QueueBackend::from_config(&config).await {
        Ok(queue) => queue,
        Err(e) => {
            error!("Failed to create queue client: {}", e);
            std::process::exit(1);
        }
    };

    let sidecar = Sidecar::new(config, host, queue).with_metrics(metrics);

    if let Err(e) = sidecar.run(wait_for_os_signal()).await {
        error!("Sidecar error: {}", e);
        std::process::exit(1);
    }
}
