//! Generic keyed-actor supervisor (spec.md §4.1, component C1).
//!
//! A [`Supervisor`] owns a fleet of [`Worker`]s addressed by string key.
//! Every structural mutation — create, destroy, routing a request to a key,
//! broadcasting to the whole fleet, or picking any one worker — goes
//! through a single internal event loop task, so the fleet's bookkeeping
//! never needs a lock. [`dg-subscriptions`](../dg_subscriptions/index.html)
//! and the gateway's per-session request manager are both built on this
//! crate.

mod error;
mod master;
mod worker;

pub use error::SupervisorError;
pub use master::Supervisor;
pub use worker::{Loopback, Worker};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone)]
    enum Req {
        Echo(u32),
        Fail,
        Panic,
        ResubscribeSelf,
    }

    struct Counter {
        total: Arc<AtomicU32>,
        loopback: Loopback<Self>,
        resubscribed: bool,
    }

    #[async_trait]
    impl Worker for Counter {
        type UserValue = Arc<AtomicU32>;
        type Request = Req;
        type Response = u32;
        type Error = String;

        fn on_create(
            _key: &str,
            total: Self::UserValue,
            loopback: Loopback<Self>,
        ) -> Result<Self, Self::Error> {
            Ok(Self {
                total,
                loopback,
                resubscribed: false,
            })
        }

        async fn handle(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
            match request {
                Req::Echo(n) => {
                    self.total.fetch_add(n, Ordering::SeqCst);
                    Ok(n)
                }
                Req::Fail => Err("nope".to_string()),
                Req::Panic => panic!("boom"),
                Req::ResubscribeSelf => {
                    self.loopback.notify(Req::Echo(0));
                    self.resubscribed = true;
                    Ok(if self.resubscribed { 1 } else { 0 })
                }
            }
        }

        fn is_fatal(error: &Self::Error) -> bool {
            error.as_str() == "fatal"
        }
    }

    async fn running_supervisor() -> Supervisor<Counter> {
        let sup = Supervisor::new();
        sup.start().await.unwrap();
        sup
    }

    #[tokio::test]
    async fn create_then_request_round_trips() {
        let sup = running_supervisor().await;
        sup.create("alice", Arc::new(AtomicU32::new(0))).await.unwrap();
        let response = sup.request("alice", Req::Echo(7)).await.unwrap();
        assert_eq!(response, 7);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn request_for_missing_key_is_no_such_worker() {
        let sup = running_supervisor().await;
        let err = sup.request("ghost", Req::Echo(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoSuchWorker));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_is_already_exists() {
        let sup = running_supervisor().await;
        sup.create("a", Arc::new(AtomicU32::new(0))).await.unwrap();
        let err = sup
            .create("a", Arc::new(AtomicU32::new(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyExists));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_then_exists_is_false() {
        let sup = running_supervisor().await;
        sup.create("a", Arc::new(AtomicU32::new(0))).await.unwrap();
        assert!(sup.exists("a").await);
        sup.destroy("a").await.unwrap();
        assert!(!sup.exists("a").await);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_every_active_worker_exactly_once() {
        let sup = running_supervisor().await;
        for key in ["a", "b", "c"] {
            sup.create(key, Arc::new(AtomicU32::new(0))).await.unwrap();
        }
        let responses = sup.broadcast(Req::Echo(1)).await;
        assert_eq!(responses.len(), 3);
        assert!(responses.into_iter().all(|r| r.unwrap() == 1));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_on_empty_fleet_returns_single_error() {
        let sup = running_supervisor().await;
        let responses = sup.broadcast(Req::Echo(1)).await;
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], Err(SupervisorError::EmptyFleet)));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn execute_picks_some_active_worker() {
        let sup = running_supervisor().await;
        sup.create("only", Arc::new(AtomicU32::new(0))).await.unwrap();
        let response = sup.execute(Req::Echo(5)).await.unwrap();
        assert_eq!(response, 5);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn non_fatal_handler_error_keeps_the_worker_alive() {
        let sup = running_supervisor().await;
        sup.create("a", Arc::new(AtomicU32::new(0))).await.unwrap();
        let err = sup.request("a", Req::Fail).await.unwrap_err();
        assert!(matches!(err, SupervisorError::HandlerError(_)));
        assert!(sup.exists("a").await);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn panic_in_handler_is_contained_and_destroys_the_worker() {
        let sup = running_supervisor().await;
        sup.create("a", Arc::new(AtomicU32::new(0))).await.unwrap();
        let err = sup.request("a", Req::Panic).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Panicked(_)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sup.exists("a").await);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn loopback_self_notification_does_not_deadlock() {
        let sup = running_supervisor().await;
        sup.create("a", Arc::new(AtomicU32::new(0))).await.unwrap();
        let response = sup.request("a", Req::ResubscribeSelf).await.unwrap();
        assert_eq!(response, 1);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_start_fails() {
        let sup = running_supervisor().await;
        assert!(matches!(
            sup.start().await,
            Err(SupervisorError::AlreadyStopped)
        ));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn double_stop_fails() {
        let sup = running_supervisor().await;
        sup.stop().await.unwrap();
        assert!(matches!(
            sup.stop().await,
            Err(SupervisorError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn requests_after_stop_report_stopped() {
        let sup = running_supervisor().await;
        sup.stop().await.unwrap();
        let err = sup.request("a", Req::Echo(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Stopped));
    }
}
