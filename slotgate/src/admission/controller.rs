//! Admission decisions for inbound requests.
//!
//! Every request is counted, checked against the overcapacity policy, parked
//! until a slot frees up, and then forwarded. The counter ticket and the slot
//! permit are guards: whichever way handling ends (response, backend error,
//! panic, or the client going away while queued) both are given back exactly
//! once.

use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tracing::Instrument;
use uuid::Uuid;

use super::counter::ConcurrencyCounter;
use super::policy::OvercapacityPolicy;
use super::pool::{SlotPermit, SlotPool};
use crate::forwarder::{ForwardError, Forwarder};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Maximum Capacity Exceeded")]
    CapacityExceeded { count: usize },
    #[error("Timed out after {0:?} waiting for a backend slot")]
    QueueTimeout(Duration),
    #[error("Slot pool closed")]
    PoolClosed,
    #[error("Forwarder panicked")]
    ForwarderPanicked,
    #[error(transparent)]
    Backend(#[from] ForwardError),
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::CapacityExceeded { .. } | AdmissionError::QueueTimeout(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AdmissionError::PoolClosed | AdmissionError::ForwarderPanicked => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AdmissionError::Backend(e) => e.status(),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[derive(Debug, Default)]
struct Totals {
    forwarded: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    backend_failures: AtomicU64,
}

/// Point-in-time view of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub policy: OvercapacityPolicy,
    /// Requests counted right now (forwarding or queued).
    pub in_flight: usize,
    pub available_slots: usize,
    pub total_slots: usize,
    pub forwarded: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub backend_failures: u64,
}

/// Gate between inbound requests and the backend.
///
/// Owns its counter and slot pool, so independent instances never share state.
pub struct AdmissionController {
    counter: ConcurrencyCounter,
    pool: SlotPool,
    policy: OvercapacityPolicy,
    queue_timeout: Option<Duration>,
    forwarder: Arc<dyn Forwarder>,
    totals: Totals,
}

impl AdmissionController {
    pub fn new(
        max_concurrent_requests: NonZeroUsize,
        policy: OvercapacityPolicy,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        Self {
            counter: ConcurrencyCounter::new(),
            pool: SlotPool::new(max_concurrent_requests),
            policy,
            queue_timeout: None,
            forwarder,
            totals: Totals::default(),
        }
    }

    /// Cap how long a request may wait for a slot. `None` waits forever.
    pub fn with_queue_timeout(mut self, queue_timeout: Option<Duration>) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn policy(&self) -> OvercapacityPolicy {
        self.policy
    }

    pub fn counter(&self) -> &ConcurrencyCounter {
        &self.counter
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            policy: self.policy,
            in_flight: self.counter.read(),
            available_slots: self.pool.available(),
            total_slots: self.pool.capacity(),
            forwarded: self.totals.forwarded.load(Ordering::Relaxed),
            rejected: self.totals.rejected.load(Ordering::Relaxed),
            timed_out: self.totals.timed_out.load(Ordering::Relaxed),
            backend_failures: self.totals.backend_failures.load(Ordering::Relaxed),
        }
    }

    /// Admit, queue, forward or reject one request. Always yields a response.
    pub async fn handle(&self, request: Request) -> Response {
        let span = tracing::info_span!(
            "request",
            id = %Uuid::new_v4(),
            method = %request.method(),
            uri = %request.uri(),
        );

        match self.admit_and_forward(request).instrument(span).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    async fn admit_and_forward(&self, request: Request) -> Result<Response, AdmissionError> {
        let ticket = match self.counter.enter(self.policy.ceiling()) {
            Ok(ticket) => ticket,
            Err(count) => {
                self.totals.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(count, policy = %self.policy, "Surpassed capacity, rejecting with 503");
                return Err(AdmissionError::CapacityExceeded { count });
            }
        };
        tracing::debug!(in_flight = ticket.count_at_entry(), "New request");

        let permit = self.acquire_slot().await?;
        tracing::debug!(
            slot = %permit.slot_id(),
            in_flight = self.counter.read(),
            "Forwarding to backend"
        );

        let result = AssertUnwindSafe(self.forwarder.forward(request))
            .catch_unwind()
            .await;

        self.pool.release(permit);
        drop(ticket);

        let result = match result {
            Ok(result) => result,
            Err(_) => {
                self.totals.backend_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Bug: forwarder panicked");
                return Err(AdmissionError::ForwarderPanicked);
            }
        };

        match result {
            Ok(response) => {
                self.totals.forwarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    status = response.status().as_u16(),
                    in_flight = self.counter.read(),
                    "Request completed"
                );
                Ok(response)
            }
            Err(e) => {
                self.totals.backend_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Backend request failed");
                Err(e.into())
            }
        }
    }

    async fn acquire_slot(&self) -> Result<SlotPermit, AdmissionError> {
        let permit = match self.queue_timeout {
            None => self.pool.acquire().await,
            Some(limit) => match tokio::time::timeout(limit, self.pool.acquire()).await {
                Ok(permit) => permit,
                Err(_) => {
                    self.totals.timed_out.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(?limit, "Gave up waiting for a backend slot");
                    return Err(AdmissionError::QueueTimeout(limit));
                }
            },
        };

        permit.ok_or_else(|| {
            tracing::error!("Bug: slot pool closed while controller alive");
            AdmissionError::PoolClosed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::ProxyForwarder;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::watch;

    fn request() -> Request {
        HttpRequest::get("/work").body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn controller(
        capacity: usize,
        policy: OvercapacityPolicy,
        forwarder: Arc<dyn Forwarder>,
    ) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(
            NonZeroUsize::new(capacity).unwrap(),
            policy,
            forwarder,
        ))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Sleeps for a fixed latency and records the peak number of concurrent calls.
    struct PeakForwarder {
        latency: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl PeakForwarder {
        fn new(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Forwarder for PeakForwarder {
        async fn forward(&self, _request: Request) -> Result<Response, ForwardError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok((StatusCode::OK, "ok").into_response())
        }
    }

    /// Blocks every call until the latch opens.
    struct LatchedForwarder {
        open: watch::Receiver<bool>,
        entered: AtomicUsize,
    }

    impl LatchedForwarder {
        fn new() -> (Arc<Self>, watch::Sender<bool>) {
            let (tx, rx) = watch::channel(false);
            let forwarder = Arc::new(Self {
                open: rx,
                entered: AtomicUsize::new(0),
            });
            (forwarder, tx)
        }

        fn entered(&self) -> usize {
            self.entered.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Forwarder for LatchedForwarder {
        async fn forward(&self, _request: Request) -> Result<Response, ForwardError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.clone();
            let _ = open.wait_for(|open| *open).await;
            Ok((StatusCode::OK, "released").into_response())
        }
    }

    /// First call goes to a dead backend, later calls succeed.
    struct FlakyForwarder {
        dead: ProxyForwarder,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Forwarder for FlakyForwarder {
        async fn forward(&self, request: Request) -> Result<Response, ForwardError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return self.dead.forward(request).await;
            }
            Ok((StatusCode::OK, "recovered").into_response())
        }
    }

    struct PanickingForwarder;

    #[async_trait::async_trait]
    impl Forwarder for PanickingForwarder {
        async fn forward(&self, _request: Request) -> Result<Response, ForwardError> {
            panic!("forwarder blew up");
        }
    }

    fn dead_backend() -> ProxyForwarder {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        ProxyForwarder::new(format!("http://127.0.0.1:{port}/").parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn hold_forwards_everything_with_bounded_concurrency() {
        let forwarder = PeakForwarder::new(Duration::from_millis(100));
        let gate = controller(5, OvercapacityPolicy::Hold, forwarder.clone());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.handle(request()).await.status() })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), StatusCode::OK);
        }

        let peak = forwarder.peak.load(Ordering::SeqCst);
        assert!(peak <= 5, "peak backend concurrency was {peak}");
        assert_eq!(gate.counter().read(), 0);
        assert_eq!(gate.pool().acquired(), 20);
        assert_eq!(gate.pool().released(), 20);

        let stats = gate.stats();
        assert_eq!(stats.forwarded, 20);
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.available_slots, 5);
    }

    #[tokio::test]
    async fn reject_at_pool_capacity_turns_away_the_overflow() {
        let (forwarder, latch) = LatchedForwarder::new();
        let gate = controller(
            5,
            OvercapacityPolicy::Reject { max_allowed: 5 },
            forwarder.clone(),
        );

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move {
                    let response = gate.handle(request()).await;
                    (response.status(), body_text(response).await)
                })
            })
            .collect();

        wait_until(|| forwarder.entered() == 5 && gate.stats().rejected == 5).await;
        assert_eq!(gate.counter().read(), 5);
        assert_eq!(gate.pool().in_use(), 5);

        latch.send(true).unwrap();

        let mut ok = 0;
        let mut rejected = 0;
        for task in tasks {
            let (status, body) = task.await.unwrap();
            match status {
                StatusCode::OK => ok += 1,
                StatusCode::SERVICE_UNAVAILABLE => {
                    assert_eq!(body, "Maximum Capacity Exceeded");
                    rejected += 1;
                }
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!((ok, rejected), (5, 5));
        assert_eq!(gate.counter().read(), 0);
        assert_eq!(gate.pool().available(), 5);
    }

    #[tokio::test]
    async fn reject_above_capacity_lets_some_requests_queue() {
        let (forwarder, latch) = LatchedForwarder::new();
        let gate = controller(
            2,
            OvercapacityPolicy::Reject { max_allowed: 4 },
            forwarder.clone(),
        );

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let gate = Arc::clone(&gate);
                tokio::spawn(async move { gate.handle(request()).await.status() })
            })
            .collect();

        wait_until(|| forwarder.entered() == 2 && gate.stats().rejected == 2).await;
        // Two forwarding, two queued for a slot.
        assert_eq!(gate.counter().read(), 4);
        assert_eq!(gate.pool().in_use(), 2);

        latch.send(true).unwrap();

        let statuses: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 4);
        assert_eq!(
            statuses
                .iter()
                .filter(|s| **s == StatusCode::SERVICE_UNAVAILABLE)
                .count(),
            2
        );
        assert_eq!(forwarder.entered(), 4);
        assert_eq!(gate.counter().read(), 0);
    }

    #[tokio::test]
    async fn backend_failure_releases_slot_and_count() {
        let forwarder = Arc::new(FlakyForwarder {
            dead: dead_backend(),
            calls: AtomicUsize::new(0),
        });
        let gate = controller(1, OvercapacityPolicy::Hold, forwarder);

        let first = gate.handle(request()).await;
        assert_eq!(first.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(gate.counter().read(), 0);
        assert_eq!(gate.pool().available(), 1);

        let second = gate.handle(request()).await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_text(second).await, "recovered");

        let stats = gate.stats();
        assert_eq!(stats.backend_failures, 1);
        assert_eq!(stats.forwarded, 1);
    }

    #[tokio::test]
    async fn panic_while_forwarding_answers_500_and_releases() {
        let gate = controller(2, OvercapacityPolicy::Hold, Arc::new(PanickingForwarder));

        let response = gate.handle(request()).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "Forwarder panicked");
        assert_eq!(gate.counter().read(), 0);
        assert_eq!(gate.pool().available(), 2);
        assert_eq!(gate.pool().acquired(), gate.pool().released());
        assert_eq!(gate.stats().backend_failures, 1);
    }

    #[tokio::test]
    async fn abandoned_queued_request_is_uncounted() {
        let (forwarder, latch) = LatchedForwarder::new();
        let gate = controller(1, OvercapacityPolicy::Hold, forwarder.clone());

        let holder = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.handle(request()).await.status() }
        });
        wait_until(|| forwarder.entered() == 1).await;

        let queued = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.handle(request()).await.status() }
        });
        wait_until(|| gate.counter().read() == 2).await;

        queued.abort();
        assert!(queued.await.unwrap_err().is_cancelled());
        assert_eq!(gate.counter().read(), 1);

        latch.send(true).unwrap();
        assert_eq!(holder.await.unwrap(), StatusCode::OK);
        assert_eq!(forwarder.entered(), 1);
        assert_eq!(gate.counter().read(), 0);
        assert_eq!(gate.pool().available(), 1);
    }

    #[tokio::test]
    async fn queue_timeout_gives_up_with_503() {
        let (forwarder, latch) = LatchedForwarder::new();
        let gate = Arc::new(
            AdmissionController::new(
                NonZeroUsize::new(1).unwrap(),
                OvercapacityPolicy::Hold,
                forwarder.clone(),
            )
            .with_queue_timeout(Some(Duration::from_millis(50))),
        );

        let holder = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.handle(request()).await.status() }
        });
        wait_until(|| forwarder.entered() == 1).await;

        let response = gate.handle(request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_text(response).await.contains("waiting for a backend slot"));
        assert_eq!(gate.stats().timed_out, 1);
        assert_eq!(gate.counter().read(), 1);

        latch.send(true).unwrap();
        assert_eq!(holder.await.unwrap(), StatusCode::OK);
        assert_eq!(gate.counter().read(), 0);
    }

    #[test]
    fn admission_errors_map_to_statuses() {
        assert_eq!(
            AdmissionError::CapacityExceeded { count: 6 }.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AdmissionError::QueueTimeout(Duration::from_secs(1)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AdmissionError::Backend(ForwardError::ReadRequestBody("eof".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
