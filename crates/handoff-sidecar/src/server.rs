//! Local ingress server.
//!
//! Workers POST a JSON [`ForwardRequest`] to `/` and block until the sidecar
//! answers. The answer is synchronous: `200` with an empty body only once the
//! queue has acknowledged the payload, a JSON [`ErrorResponse`] otherwise.
//!
//! # Endpoints
//!
//! - `POST /` - submit a forward request
//! - `GET /_handoff/health` - lifecycle phase and in-flight count
//! - `GET /_handoff/metrics` - Prometheus text, when a recorder is installed
//! - `GET /_handoff/version` - sidecar name and version
//!
//! Once draining begins the accept loop stops, open connections are closed
//! gracefully, and any request that still reaches the handler is refused
//! with `503`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use handoff_core::ForwardRequest;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SidecarConfig;
use crate::context::{Phase, SidecarContext};
use crate::error::{ErrorResponse, SidecarError, SidecarResult};
use crate::forwarder::Forwarder;
use crate::health::HealthStatus;
use crate::metrics;
use crate::queue::QueueClient;
use crate::shutdown::ShutdownSignal;

/// Type alias for HTTP response body.
pub type ResponseBody = Full<Bytes>;

/// Type alias for the HTTP response.
pub type HttpResponse = Response<ResponseBody>;

/// Header used to correlate a submission across logs.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The ingress server, bound but not yet serving.
pub struct IngressServer<Q> {
    listener: TcpListener,
    local_addr: SocketAddr,
    ingress: Ingress<Q>,
}

/// Request handling shared by every connection.
struct Ingress<Q> {
    forwarder: Arc<Forwarder<Q>>,
    context: Arc<SidecarContext>,
    max_payload_bytes: usize,
    metrics: Option<PrometheusHandle>,
}

impl<Q: QueueClient> IngressServer<Q> {
    /// Bind the configured loopback address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or already in use.
    pub async fn bind(
        config: &SidecarConfig,
        forwarder: Arc<Forwarder<Q>>,
        context: Arc<SidecarContext>,
    ) -> SidecarResult<Self> {
        let addr = config.ingress_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SidecarError::server(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "ingress listening");

        Ok(Self {
            listener,
            local_addr,
            ingress: Ingress {
                forwarder,
                context,
                max_payload_bytes: config.ingress.max_payload_bytes,
                metrics: None,
            },
        })
    }

    /// Serve Prometheus metrics from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.ingress.metrics = handle;
        self
    }

    /// Address actually bound. Differs from the configured one for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until the context starts draining.
    ///
    /// Returns once the listener is closed. Connections already open keep
    /// running until their current request completes.
    pub async fn run(self) {
        let Self {
            listener, ingress, ..
        } = self;
        let ingress = Arc::new(ingress);
        let shutdown = ingress.context.shutdown().clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let ingress = Arc::clone(&ingress);
                            let shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = ingress.serve_connection(stream, shutdown).await {
                                    debug!(remote = %remote_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                () = shutdown.recv() => {
                    info!("draining, ingress stopped accepting connections");
                    break;
                }
            }
        }

        drop(listener);
    }
}

impl<Q: QueueClient> Ingress<Q> {
    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        shutdown: ShutdownSignal,
    ) -> Result<(), hyper::Error> {
        let io = TokioIo::new(stream);
        let ingress = Arc::clone(&self);

        let service = service_fn(move |req: Request<Incoming>| {
            let ingress = Arc::clone(&ingress);
            async move { Ok::<_, Infallible>(ingress.handle_request(req).await) }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => result,
            () = shutdown.recv() => {
                // Let the request in progress finish, then close.
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        }
    }

    async fn handle_request<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let span = info_span!("ingress", request_id = %request_id, method = %method, path = %path);

        async move {
            debug!("request received");

            match (method.as_str(), path.as_str()) {
                ("POST", "/") => {
                    let response = match self.handle_submit(req).await {
                        Ok(()) => {
                            debug!("payload handed off");
                            empty_response(StatusCode::OK)
                        }
                        Err(e) => {
                            warn!(error = %e, "submission failed");
                            error_response(
                                status_of(&e),
                                &ErrorResponse::from(&e).with_request_id(&request_id),
                            )
                        }
                    };
                    metrics::record_ingress(response.status().as_u16());
                    response
                }
                ("GET", "/_handoff/health") => self.handle_health(),
                ("GET", "/_handoff/metrics") => self.handle_metrics(),
                ("GET", "/_handoff/version") => handle_version(),
                (_, "/") => error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    &ErrorResponse::new("method_not_allowed", "submissions must use POST")
                        .with_request_id(&request_id),
                ),
                _ => error_response(
                    StatusCode::NOT_FOUND,
                    &ErrorResponse::new("not_found", format!("no route for {path}"))
                        .with_request_id(&request_id),
                ),
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_submit<B>(&self, req: Request<B>) -> SidecarResult<()>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.ensure_accepting()?;

        let limit = self.max_payload_bytes;
        let declared = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(size) = declared.filter(|size| *size > limit) {
            return Err(SidecarError::PayloadTooLarge { size, limit });
        }

        let body = Limited::new(req.into_body(), limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    SidecarError::PayloadTooLarge {
                        size: declared.unwrap_or(limit + 1),
                        limit,
                    }
                } else {
                    SidecarError::invalid_submission(format!("failed to read body: {e}"))
                }
            })?
            .to_bytes();

        let request = ForwardRequest::from_slice(&body)
            .map_err(|e| SidecarError::invalid_submission(format!("malformed forward request: {e}")))?;

        // Counted as in flight before the phase check: a concurrent drain
        // either waits for this forward or this request sees `Draining`.
        let guard = self.context.in_flight().acquire();
        self.ensure_accepting()?;

        let deadline = self.forwarder.current_deadline();
        let ack = self
            .forwarder
            .forward_with_guard(&request, deadline, guard)
            .await?;
        debug!(message_id = ?ack.message_id, outcome = request.outcome.kind(), "forwarded");
        Ok(())
    }

    fn ensure_accepting(&self) -> SidecarResult<()> {
        match self.context.phase() {
            Phase::Registered => Ok(()),
            Phase::Starting => Err(SidecarError::not_accepting("sidecar is not registered yet")),
            Phase::Draining => Err(SidecarError::not_accepting("sidecar is shutting down")),
        }
    }

    fn handle_health(&self) -> HttpResponse {
        let status = HealthStatus::from_context(&self.context);
        let code = StatusCode::from_u16(status.status_code()).unwrap_or(StatusCode::OK);
        let body = serde_json::to_string(&status)
            .unwrap_or_else(|_| format!(r#"{{"status":"{}"}}"#, status.status()));
        json_response(code, body)
    }

    fn handle_metrics(&self) -> HttpResponse {
        match &self.metrics {
            Some(handle) => Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(handle.render())))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
            None => error_response(
                StatusCode::NOT_FOUND,
                &ErrorResponse::new("not_found", "metrics are disabled"),
            ),
        }
    }
}

fn handle_version() -> HttpResponse {
    let body = serde_json::json!({
        "name": "handoff-sidecar",
        "version": crate::VERSION,
    });
    json_response(StatusCode::OK, body.to_string())
}

fn status_of(err: &SidecarError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn empty_response(status: StatusCode) -> HttpResponse {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn json_response(status: StatusCode, body: String) -> HttpResponse {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn error_response(status: StatusCode, body: &ErrorResponse) -> HttpResponse {
    let body = serde_json::to_string(body).unwrap_or_else(|_| {
        format!(r#"{{"error":"{}","retriable":false}}"#, body.error)
    });
    json_response(status, body)
}
