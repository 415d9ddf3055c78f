//! Subscription manager (spec.md §4.5, component C5).
//!
//! Built directly on `dg-supervisor` (C1): one worker per `(session,
//! subscription_id)` key. Each worker's own background task owns the
//! upstream log stream and the `last_delivered` dedup pointer; on a stream
//! error or natural end it self-notifies over its [`Loopback`] rather than
//! reaching back into the supervisor, matching spec.md §9's "back-references
//! must be weak or channel-only". Grounded on the pack's keyed subscription
//! fleet in `interest-subs.rs` (`SubscriptionManager<N>` over a `DashMap`),
//! adapted here to run each subscription as a `dg-supervisor` worker instead
//! of a bare map entry.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use dg_backend::{Backend, RawLog};
use dg_errors::GatewayError;
use dg_supervisor::{Loopback, Supervisor, SupervisorError, Worker};
use dg_types::subscription::{LogFilter, LogPointer};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a new subscription needs: a backend to open the upstream stream
/// against, the filter to apply, the channel raw logs are forwarded on, and
/// the resume point. `None` means nothing has been delivered yet (a fresh
/// subscription), so even a log at the literal `(0, 0)` coordinate is
/// forwarded; `Some(pointer)` means every log at or before `pointer` was
/// already delivered (re-creating after a session worker restart).
pub struct SubscriptionConfig {
    pub backend: Arc<dyn Backend>,
    pub filter: LogFilter,
    pub sink: mpsc::Sender<RawLog>,
    pub resume_from: Option<LogPointer>,
}

#[derive(Debug, Clone, Copy)]
pub enum SubscriptionRequest {
    /// Sent by the worker's own forwarder task (over its `Loopback`) when
    /// the upstream subscription ends or fails.
    Resubscribe,
}

async fn run_forwarder(
    backend: Arc<dyn Backend>,
    filter: LogFilter,
    sink: mpsc::Sender<RawLog>,
    last_delivered: Arc<Mutex<Option<LogPointer>>>,
    cancel: CancellationToken,
    loopback: Loopback<SubscriptionWorker>,
) {
    let from = *last_delivered.lock();
    let stream = backend
        .subscribe_logs(filter.addresses.clone(), filter.topics.clone())
        .await;

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(%error, ?from, "subscription.subscribe_failed");
            loopback.notify(SubscriptionRequest::Resubscribe);
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            maybe_log = stream.next() => {
                let Some(log) = maybe_log else { break };
                let pointer = LogPointer::new(log.block_number, log.log_index);
                let mut guard = last_delivered.lock();
                if let Some(floor) = *guard {
                    if pointer <= floor {
                        continue;
                    }
                }
                *guard = Some(pointer);
                drop(guard);
                if sink.send(log).await.is_err() {
                    return;
                }
            }
        }
    }

    tracing::debug!("subscription.upstream_ended");
    loopback.notify(SubscriptionRequest::Resubscribe);
}

struct SubscriptionWorker {
    backend: Arc<dyn Backend>,
    filter: LogFilter,
    sink: mpsc::Sender<RawLog>,
    last_delivered: Arc<Mutex<Option<LogPointer>>>,
    cancel: CancellationToken,
    loopback: Loopback<Self>,
}

impl SubscriptionWorker {
    fn spawn_forwarder(&self) {
        tokio::spawn(run_forwarder(
            self.backend.clone(),
            self.filter.clone(),
            self.sink.clone(),
            self.last_delivered.clone(),
            self.cancel.clone(),
            self.loopback.clone(),
        ));
    }
}

impl Drop for SubscriptionWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Worker for SubscriptionWorker {
    type UserValue = SubscriptionConfig;
    type Request = SubscriptionRequest;
    type Response = ();
    type Error = GatewayError;

    fn on_create(
        _key: &str,
        config: Self::UserValue,
        loopback: Loopback<Self>,
    ) -> Result<Self, Self::Error> {
        let worker = Self {
            backend: config.backend,
            filter: config.filter,
            sink: config.sink,
            last_delivered: Arc::new(Mutex::new(config.resume_from)),
            cancel: CancellationToken::new(),
            loopback,
        };
        worker.spawn_forwarder();
        Ok(worker)
    }

    async fn handle(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        match request {
            SubscriptionRequest::Resubscribe => {
                self.spawn_forwarder();
                Ok(())
            }
        }
    }
}

fn subscription_key(session: &str, subscription_id: u64) -> String {
    format!("{session}:{subscription_id}")
}

/// Current/lifetime/per-session subscription counts (spec.md §4.5 "Metrics").
#[derive(Debug, Clone, Default)]
pub struct SubscriptionMetrics {
    pub current: u64,
    pub lifetime_total: u64,
}

/// Owns every active subscription worker fleet-wide. One
/// [`SubscriptionConfig`] per `(session, subscription_id)`.
pub struct SubscriptionManager {
    supervisor: Supervisor<SubscriptionWorker>,
    current: AtomicU64,
    lifetime_total: AtomicU64,
    per_session: DashMap<String, AtomicU64>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            supervisor: Supervisor::new(),
            current: AtomicU64::new(0),
            lifetime_total: AtomicU64::new(0),
            per_session: DashMap::new(),
        }
    }

    pub async fn start(&self) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.stop().await
    }

    pub async fn create(
        &self,
        session: &str,
        subscription_id: u64,
        config: SubscriptionConfig,
    ) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor
            .create(subscription_key(session, subscription_id), config)
            .await?;
        self.current.fetch_add(1, Ordering::Relaxed);
        self.lifetime_total.fetch_add(1, Ordering::Relaxed);
        self.per_session
            .entry(session.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn destroy(
        &self,
        session: &str,
        subscription_id: u64,
    ) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor
            .destroy(subscription_key(session, subscription_id))
            .await?;
        self.current.fetch_sub(1, Ordering::Relaxed);
        if let Some(counter) = self.per_session.get(session) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn exists(&self, session: &str, subscription_id: u64) -> bool {
        self.supervisor
            .exists(subscription_key(session, subscription_id))
            .await
    }

    pub fn active_count_for_session(&self, session: &str) -> u64 {
        self.per_session
            .get(session)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> SubscriptionMetrics {
        SubscriptionMetrics {
            current: self.current.load(Ordering::Relaxed),
            lifetime_total: self.lifetime_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, Bytes};
    use dg_backend::mock::MockBackend;
    use std::time::Duration;

    fn log(address: Address, block: u64, index: u64) -> RawLog {
        RawLog {
            address,
            topics: vec![],
            data: Bytes::new(),
            block_number: block,
            log_index: index,
        }
    }

    #[tokio::test]
    async fn forwards_matching_logs_and_dedups_already_delivered() {
        let backend = Arc::new(MockBackend::new());
        let manager = SubscriptionManager::new();
        manager.start().await.unwrap();

        let address = Address::repeat_byte(7);
        let (tx, mut rx) = mpsc::channel(8);
        manager
            .create(
                "s1",
                0,
                SubscriptionConfig {
                    backend: backend.clone(),
                    filter: LogFilter {
                        addresses: vec![address],
                        topics: vec![],
                    },
                    sink: tx,
                    resume_from: Some(LogPointer::new(5, 2)),
                },
            )
            .await
            .unwrap();

        // Already delivered per resume_from: dropped.
        backend.emit_log(log(address, 5, 2));
        backend.emit_log(log(address, 5, 1));
        // New: forwarded.
        backend.emit_log(log(address, 5, 3));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.block_number, 5);
        assert_eq!(received.log_index, 3);

        assert_eq!(manager.metrics().current, 1);
        assert_eq!(manager.active_count_for_session("s1"), 1);

        manager.destroy("s1", 0).await.unwrap();
        assert!(!manager.exists("s1", 0).await);
        assert_eq!(manager.active_count_for_session("s1"), 0);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn fresh_subscription_delivers_a_log_at_the_origin_pointer() {
        let backend = Arc::new(MockBackend::new());
        let manager = SubscriptionManager::new();
        manager.start().await.unwrap();

        let address = Address::repeat_byte(8);
        let (tx, mut rx) = mpsc::channel(8);
        manager
            .create(
                "s2",
                0,
                SubscriptionConfig {
                    backend: backend.clone(),
                    filter: LogFilter {
                        addresses: vec![address],
                        topics: vec![],
                    },
                    sink: tx,
                    resume_from: None,
                },
            )
            .await
            .unwrap();

        // A genuine log at (0, 0) must not be mistaken for "nothing
        // delivered yet" and silently dropped.
        backend.emit_log(log(address, 0, 0));

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.block_number, 0);
        assert_eq!(received.log_index, 0);

        manager.destroy("s2", 0).await.unwrap();
        manager.stop().await.unwrap();
    }
}
