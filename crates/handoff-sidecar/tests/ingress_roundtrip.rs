//! End-to-end tests over real loopback HTTP.

use std::time::Duration;

use bytes::Bytes;
use handoff_core::{Ack, ForwardRequest, LifecycleEvent, Outcome, SendError, ShutdownReason};
use handoff_sidecar::{
    ErrorResponse, MemoryQueue, Phase, RunningSidecar, ScriptedHost, Sidecar, SidecarConfig,
};

fn config() -> SidecarConfig {
    SidecarConfig::builder()
        .queue_endpoint("http://queue.test")
        .listen_port(0)
        .backoff(Duration::from_millis(5), 2, Duration::from_millis(20))
        .drain_grace(Duration::from_secs(2))
        .build()
        .unwrap()
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn submission(event: &'static str, outcome: Outcome) -> ForwardRequest {
    ForwardRequest::new(Bytes::from_static(event.as_bytes()), outcome)
}

async fn start(queue: MemoryQueue) -> (ScriptedHost, RunningSidecar<ScriptedHost>) {
    let host = ScriptedHost::new("ext-e2e");
    let running = Sidecar::new(config(), host.clone(), queue)
        .start()
        .await
        .unwrap();
    (host, running)
}

fn url(running: &RunningSidecar<ScriptedHost>) -> String {
    format!("http://{}/", running.local_addr())
}

#[tokio::test]
async fn test_submission_is_forwarded_verbatim() {
    let queue = MemoryQueue::new();
    let (host, running) = start(queue.clone()).await;
    let request = submission(r#"{"order":7}"#, Outcome::success("shipped"));

    let response = client()
        .post(url(&running))
        .json(&request)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.unwrap().is_empty());
    assert_eq!(queue.sent(), vec![request.to_payload().unwrap()]);

    let forwarded = ForwardRequest::from_slice(&queue.sent()[0]).unwrap();
    assert_eq!(forwarded, request);

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_failure_outcomes_are_forwarded_too() {
    let queue = MemoryQueue::new();
    let (host, running) = start(queue.clone()).await;
    let request = submission(r#"{"order":8}"#, Outcome::failure("out of stock"));

    let response = client().post(url(&running)).json(&request).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let forwarded = ForwardRequest::from_slice(&queue.sent()[0]).unwrap();
    assert_eq!(forwarded.outcome, Outcome::failure("out of stock"));

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_overlapping_submissions_are_served_concurrently() {
    let delay = Duration::from_millis(500);
    let queue = MemoryQueue::new().with_delay(delay);
    let (host, running) = start(queue.clone()).await;
    let client = client();
    let first = submission(r#"{"order":1}"#, Outcome::success("a"));
    let second = submission(r#"{"order":2}"#, Outcome::success("b"));

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        client.post(url(&running)).json(&first).send(),
        client.post(url(&running)).json(&second).send(),
    );
    let elapsed = started.elapsed();

    assert_eq!(a.unwrap().status(), 200);
    assert_eq!(b.unwrap().status(), 200);
    assert_eq!(queue.send_count(), 2);
    assert!(elapsed < delay * 2, "submissions were serialized: {elapsed:?}");

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_transient_queue_failures_are_retried() {
    let queue = MemoryQueue::scripted([
        Err(SendError::retriable("throttled")),
        Err(SendError::retriable("throttled")),
        Ok(Ack::with_message_id("m-1")),
    ]);
    let (host, running) = start(queue.clone()).await;

    let response = client()
        .post(url(&running))
        .json(&submission("{}", Outcome::success("ok")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(queue.send_count(), 3);

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_rejected_payload_answers_error_body() {
    let queue = MemoryQueue::always(Err(SendError::fatal("queue does not exist")));
    let (host, running) = start(queue.clone()).await;

    let response = client()
        .post(url(&running))
        .json(&submission("{}", Outcome::success("ok")))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: ErrorResponse = response.json().await.unwrap();
    assert!(!body.retriable);
    assert!(body.message.contains("queue does not exist"));
    assert_eq!(queue.send_count(), 1);

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}

#[tokio::test]
async fn test_submission_after_shutdown_is_refused_without_hanging() {
    let queue = MemoryQueue::new();
    let (host, running) = start(queue.clone()).await;
    let target = url(&running);
    let context = running.context();

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Timeout));
    let reason = running.run_until(std::future::pending()).await.unwrap();
    assert_eq!(reason, ShutdownReason::Timeout);
    assert_eq!(context.phase(), Phase::Draining);

    let attempt = tokio::time::timeout(
        Duration::from_secs(5),
        client()
            .post(&target)
            .json(&submission("{}", Outcome::success("late")))
            .send(),
    )
    .await
    .expect("submission after shutdown must not hang");

    match attempt {
        Ok(response) => assert_eq!(response.status(), 503),
        Err(e) => assert!(e.is_connect() || e.is_request(), "unexpected error: {e}"),
    }
    assert_eq!(queue.send_count(), 0);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_forward() {
    let queue = MemoryQueue::new().with_delay(Duration::from_millis(300));
    let (host, running) = start(queue.clone()).await;
    let target = url(&running);
    let context = running.context();

    let submit = tokio::spawn(async move {
        client()
            .post(&target)
            .json(&submission("{}", Outcome::success("slow")))
            .send()
            .await
            .map(|r| r.status().as_u16())
    });

    // Wait until the forward is in flight.
    let mut waited = Duration::ZERO;
    while context.in_flight().in_flight() == 0 {
        assert!(waited < Duration::from_secs(2), "forward never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += Duration::from_millis(5);
    }

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();

    assert_eq!(context.in_flight().in_flight(), 0);
    assert_eq!(submit.await.unwrap().unwrap(), 200);
    assert_eq!(queue.send_count(), 1);
}

#[tokio::test]
async fn test_health_reports_phase() {
    let (host, running) = start(MemoryQueue::new()).await;
    let health = format!("http://{}/_handoff/health", running.local_addr());

    let body: serde_json::Value = client().get(&health).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["phase"], "registered");
    assert_eq!(body["extension_id"], "ext-e2e");

    host.push_event(LifecycleEvent::shutdown(ShutdownReason::Spindown));
    running.run_until(std::future::pending()).await.unwrap();
}
