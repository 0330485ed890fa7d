//! Middleware talking to a real sidecar over loopback HTTP.

use std::time::Duration;

use bytes::Bytes;
use handoff_core::{ForwardRequest, LifecycleEvent, Outcome, SendError, ShutdownReason};
use handoff_sidecar::{MemoryQueue, RunningSidecar, ScriptedHost, Sidecar, SidecarConfig};
use handoff_worker::{
    ForwardingError, Handoff, HandoffConfig, IngressClient, InvocationContext, InvocationError,
    Settled,
};

async fn start_sidecar(queue: MemoryQueue) -> (ScriptedHost, RunningSidecar<ScriptedHost>) {
    let config = SidecarConfig::builder()
        .queue_endpoint("http://queue.test")
        .listen_port(0)
        .backoff(Duration::from_millis(5), 2, Duration::from_millis(20))
        .build()
        .unwrap();
    let host = ScriptedHost::new("ext-worker");
    let running = Sidecar::new(config, host.clone(), queue)
        .start()
        .await
        .unwrap();
    (host, running)
}

fn handoff_for(running: &RunningSidecar<ScriptedHost>) -> Handoff<IngressClient> {
    let config =
        HandoffConfig::default().with_ingress_url(format!("http://{}/", running.local_addr()));
    Handoff::new(IngressClient::new(&config).unwrap(), config)
}

async fn stop(host: ScriptedHost, running: RunningSidecar<ScriptedHost>) {
    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_success_reaches_queue_before_returning() {
    let queue = MemoryQueue::new();
    let (host, running) = start_sidecar(queue.clone()).await;
    let handoff = handoff_for(&running);
    let ctx = InvocationContext::with_remaining("req-1", Duration::from_secs(5));

    let value = handoff
        .invoke(Bytes::from_static(b"{\"n\":1}"), &ctx, |_, _| async {
            Ok::<_, String>(Bytes::from_static(b"X"))
        })
        .await
        .unwrap();

    assert_eq!(value, Bytes::from_static(b"X"));
    assert_eq!(queue.send_count(), 1);
    let forwarded = ForwardRequest::from_slice(&queue.sent()[0]).unwrap();
    assert_eq!(forwarded.outcome, Outcome::success("X"));
    assert_eq!(forwarded.original_event, Bytes::from_static(b"{\"n\":1}"));

    stop(host, running).await;
}

#[tokio::test]
async fn test_business_failure_is_recorded_and_reraised() {
    let queue = MemoryQueue::new();
    let (host, running) = start_sidecar(queue.clone()).await;
    let handoff = handoff_for(&running);
    let ctx = InvocationContext::with_remaining("req-2", Duration::from_secs(5));

    let err = handoff
        .invoke(Bytes::from_static(b"{}"), &ctx, |_, _| async {
            Err::<Bytes, _>("Boom")
        })
        .await
        .unwrap_err();

    assert_eq!(err, InvocationError::Business("Boom".to_string()));
    let forwarded = ForwardRequest::from_slice(&queue.sent()[0]).unwrap();
    assert_eq!(forwarded.outcome, Outcome::failure("Boom"));

    stop(host, running).await;
}

#[tokio::test]
async fn test_queue_rejection_surfaces_as_forwarding_failure() {
    let queue = MemoryQueue::always(Err(SendError::fatal("queue does not exist")));
    let (host, running) = start_sidecar(queue.clone()).await;
    let handoff = handoff_for(&running);
    let ctx = InvocationContext::with_remaining("req-3", Duration::from_secs(5));

    let settlement = handoff
        .run(Bytes::from_static(b"{}"), &ctx, |_, _| async {
            Ok::<_, String>(Bytes::from_static(b"X"))
        })
        .await;

    assert_eq!(settlement.settled(), Some(Settled::ForwardingFailed));
    match settlement.result {
        Err(InvocationError::Forwarding(ForwardingError::Rejected {
            status, retriable, ..
        })) => {
            assert_eq!(status, 502);
            assert!(!retriable);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(queue.send_count(), 1);

    stop(host, running).await;
}

#[tokio::test]
async fn test_draining_sidecar_fails_the_invocation() {
    let queue = MemoryQueue::new();
    let (host, running) = start_sidecar(queue.clone()).await;
    let handoff = handoff_for(&running);
    stop(host, running).await;

    let ctx = InvocationContext::with_remaining("req-4", Duration::from_secs(5));
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        handoff.invoke(Bytes::from_static(b"{}"), &ctx, |_, _| async {
            Ok::<_, String>(Bytes::from_static(b"X"))
        }),
    )
    .await
    .expect("invocation must not hang on a stopped sidecar")
    .unwrap_err();

    assert!(err.is_forwarding());
    assert_eq!(queue.send_count(), 0);
}
