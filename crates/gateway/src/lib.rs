//! Request manager (spec.md §4.6, component C6).
//!
//! One [`dg_supervisor::Worker`] per session, keyed by the derived session
//! key (spec.md §4.7 GLOSSARY "Session key"). A session worker owns the
//! mailbox key space for its session, the signer pool (C4), and its own
//! subscription fleet (C5): every deploy/execute/subscribe/poll request for
//! a session is serialized through that one worker, which is exactly what
//! C1's per-key dispatch already guarantees. "Completion callback" (spec.md
//! §4.4/§4.6) is realized as a spawned task that awaits the executor's
//! future and writes the resulting event into the mailbox once it resolves
//! — the idiomatic async equivalent of a callback, not a literal
//! callback-registration API.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes};
use dg_backend::{Backend, RawLog};
use dg_errors::GatewayError;
use dg_executor::{TxExecutor, TxOutcome};
use dg_mailbox::{Mailbox, MailboxPage};
use dg_subscriptions::{SubscriptionConfig, SubscriptionManager};
use dg_supervisor::{Loopback, Supervisor, SupervisorError, Worker};
use dg_types::{
    event::Event,
    subscription::LogFilter,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SUBSCRIPTION_FORWARD_CAPACITY: usize = 64;
const DEFAULT_POLL_COUNT: u32 = 10;

/// Maps a [`SupervisorError<GatewayError>`] onto the plain [`GatewayError`]
/// the HTTP layer knows how to render. `NoSuchWorker` here means "this
/// session has expired or was never created" — call sites that need a more
/// specific not-found (e.g. an unknown subscription id) check that
/// condition themselves before falling through to this conversion.
fn supervisor_to_gateway(error: SupervisorError<GatewayError>) -> GatewayError {
    match error {
        SupervisorError::HandlerError(e) | SupervisorError::HandlerRejected(e) => e,
        SupervisorError::NoSuchWorker => GatewayError::QueueNotFound,
        SupervisorError::AlreadyExists => GatewayError::DuplicateSubscriptionId,
        SupervisorError::Panicked(msg) => GatewayError::UnexpectedRpcFailure(msg),
        SupervisorError::WorkerExited(msg) => GatewayError::UnexpectedRpcFailure(msg),
        SupervisorError::Cancelled => GatewayError::Cancelled,
        SupervisorError::EmptyFleet => {
            GatewayError::UnexpectedRpcFailure("no active sessions".to_string())
        }
        SupervisorError::Stopped | SupervisorError::AlreadyStopped => {
            GatewayError::UnexpectedRpcFailure("gateway is stopped".to_string())
        }
    }
}

fn subscription_mailbox_key(session: &str, subscription_id: u64) -> String {
    format!("{session}:{subscription_id}")
}

/// Request accepted by one session's worker.
pub enum SessionRequest {
    Deploy {
        data: Bytes,
        cancel: CancellationToken,
    },
    Execute {
        address: Address,
        data: Bytes,
        cancel: CancellationToken,
    },
    Subscribe {
        filter: LogFilter,
    },
    Unsubscribe {
        subscription_id: u64,
    },
    Poll {
        offset: u64,
        count: u32,
        discard_previous: bool,
    },
    PollSubscription {
        subscription_id: u64,
        offset: u64,
        count: u32,
        discard_previous: bool,
    },
}

pub enum SessionResponse {
    Submitted { id: u64 },
    Subscribed { subscription_id: u64 },
    Unsubscribed,
    Polled(MailboxPage),
}

/// Everything a session worker needs, supplied once per session at
/// first-touch (see [`RequestManager::ensure_session`]).
pub struct SessionConfig {
    pub mailbox: Arc<dyn Mailbox>,
    pub executor: Arc<TxExecutor>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub backend: Arc<dyn Backend>,
    pub session_ttl: Duration,
}

/// Converts a completed signer outcome into the mailbox event it produces
/// (spec.md §3 "Event"). A deploy outcome feeding into an execute slot (or
/// vice versa) cannot happen: the executor always returns the variant that
/// matches the request it was given.
fn outcome_to_event(id: u64, outcome: Result<TxOutcome, SupervisorError<GatewayError>>) -> Event {
    match outcome {
        Ok(TxOutcome::DeploySucceeded { address }) => Event::Deploy { id, address },
        Ok(TxOutcome::ExecuteSucceeded { address, output }) => Event::Execute { id, address, output },
        Err(e) => {
            let error = supervisor_to_gateway(e);
            Event::Error {
                id,
                error_code: error.code(),
                description: error.to_string(),
            }
        }
    }
}

fn spawn_subscription_forwarder(mailbox: Arc<dyn Mailbox>, key: String, mut rx: mpsc::Receiver<RawLog>) {
    tokio::spawn(async move {
        while let Some(log) = rx.recv().await {
            let id = match mailbox.reserve(&key).await {
                Ok(id) => id,
                Err(error) => {
                    tracing::warn!(%error, key = %key, "subscription.forward.mailbox_reserve_failed");
                    continue;
                }
            };
            let event = Event::Data {
                id,
                data: log.data,
                topics: log.topics,
            };
            mailbox.insert_at(&key, id, event).await;
        }
    });
}

struct SessionWorker {
    session: String,
    mailbox: Arc<dyn Mailbox>,
    executor: Arc<TxExecutor>,
    subscriptions: Arc<SubscriptionManager>,
    backend: Arc<dyn Backend>,
    session_ttl: Duration,
    next_subscription_id: u64,
}

impl SessionWorker {
    async fn handle_deploy(&self, data: Bytes, cancel: CancellationToken) -> Result<SessionResponse, GatewayError> {
        let id = self.mailbox.reserve(&self.session).await?;
        let executor = self.executor.clone();
        let mailbox = self.mailbox.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            let event = outcome_to_event(id, executor.deploy(data, cancel).await);
            mailbox.insert_at(&session, id, event).await;
        });
        Ok(SessionResponse::Submitted { id })
    }

    async fn handle_execute(
        &self,
        address: Address,
        data: Bytes,
        cancel: CancellationToken,
    ) -> Result<SessionResponse, GatewayError> {
        let id = self.mailbox.reserve(&self.session).await?;
        let executor = self.executor.clone();
        let mailbox = self.mailbox.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            let event = outcome_to_event(id, executor.execute(address, data, cancel).await);
            mailbox.insert_at(&session, id, event).await;
        });
        Ok(SessionResponse::Submitted { id })
    }

    async fn handle_subscribe(&mut self, filter: LogFilter) -> Result<SessionResponse, GatewayError> {
        let subscription_id = self.next_subscription_id;
        self.next_subscription_id += 1;

        let key = subscription_mailbox_key(&self.session, subscription_id);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_FORWARD_CAPACITY);
        spawn_subscription_forwarder(self.mailbox.clone(), key, rx);

        self.subscriptions
            .create(
                &self.session,
                subscription_id,
                SubscriptionConfig {
                    backend: self.backend.clone(),
                    filter,
                    sink: tx,
                    resume_from: None,
                },
            )
            .await
            .map_err(supervisor_to_gateway)?;

        Ok(SessionResponse::Subscribed { subscription_id })
    }

    async fn handle_unsubscribe(&self, subscription_id: u64) -> Result<SessionResponse, GatewayError> {
        match self.subscriptions.destroy(&self.session, subscription_id).await {
            Ok(()) => {
                self.mailbox
                    .remove(&subscription_mailbox_key(&self.session, subscription_id))
                    .await;
                tracing::debug!(session = %self.session, subscription_id, "session.unsubscribed");
                Ok(SessionResponse::Unsubscribed)
            }
            Err(SupervisorError::NoSuchWorker) => Err(GatewayError::SubscriptionNotFound),
            Err(e) => Err(supervisor_to_gateway(e)),
        }
    }

    async fn handle_poll(
        &self,
        offset: u64,
        count: u32,
        discard_previous: bool,
    ) -> Result<SessionResponse, GatewayError> {
        if discard_previous {
            self.mailbox.discard(&self.session, offset).await?;
        }
        let count = if count == 0 { DEFAULT_POLL_COUNT } else { count };
        let page = self.mailbox.get(&self.session, offset, count).await;
        Ok(SessionResponse::Polled(page))
    }

    async fn handle_poll_subscription(
        &self,
        subscription_id: u64,
        offset: u64,
        count: u32,
        discard_previous: bool,
    ) -> Result<SessionResponse, GatewayError> {
        if !self.subscriptions.exists(&self.session, subscription_id).await {
            return Err(GatewayError::SubscriptionNotFound);
        }
        let key = subscription_mailbox_key(&self.session, subscription_id);
        if discard_previous {
            self.mailbox.discard(&key, offset).await?;
        }
        let count = if count == 0 { DEFAULT_POLL_COUNT } else { count };
        let page = self.mailbox.get(&key, offset, count).await;
        Ok(SessionResponse::Polled(page))
    }
}

#[async_trait::async_trait]
impl Worker for SessionWorker {
    type UserValue = SessionConfig;
    type Request = SessionRequest;
    type Response = SessionResponse;
    type Error = GatewayError;

    fn on_create(
        key: &str,
        config: Self::UserValue,
        _loopback: Loopback<Self>,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            session: key.to_string(),
            mailbox: config.mailbox,
            executor: config.executor,
            subscriptions: config.subscriptions,
            backend: config.backend,
            session_ttl: config.session_ttl,
            next_subscription_id: 0,
        })
    }

    async fn handle(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        match request {
            SessionRequest::Deploy { data, cancel } => self.handle_deploy(data, cancel).await,
            SessionRequest::Execute { address, data, cancel } => {
                self.handle_execute(address, data, cancel).await
            }
            SessionRequest::Subscribe { filter } => self.handle_subscribe(filter).await,
            SessionRequest::Unsubscribe { subscription_id } => {
                self.handle_unsubscribe(subscription_id).await
            }
            SessionRequest::Poll {
                offset,
                count,
                discard_previous,
            } => self.handle_poll(offset, count, discard_previous).await,
            SessionRequest::PollSubscription {
                subscription_id,
                offset,
                count,
                discard_previous,
            } => {
                self.handle_poll_subscription(subscription_id, offset, count, discard_previous)
                    .await
            }
        }
    }

    fn max_inactivity(&self) -> Duration {
        self.session_ttl
    }
}

/// Owns every active session, lazily creating a session's worker on first
/// touch (spec.md §4.6 "Sessions are created implicitly on first use").
pub struct RequestManager {
    supervisor: Supervisor<SessionWorker>,
    mailbox: Arc<dyn Mailbox>,
    executor: Arc<TxExecutor>,
    subscriptions: Arc<SubscriptionManager>,
    backend: Arc<dyn Backend>,
    session_ttl: Duration,
}

impl RequestManager {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        executor: Arc<TxExecutor>,
        subscriptions: Arc<SubscriptionManager>,
        backend: Arc<dyn Backend>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            supervisor: Supervisor::new(),
            mailbox,
            executor,
            subscriptions,
            backend,
            session_ttl,
        }
    }

    pub async fn start(&self) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.stop().await
    }

    /// Creates the session's worker if it doesn't exist yet. Tolerates a
    /// race between two first-requests for the same new session: whichever
    /// `create` loses just sees `AlreadyExists`, which is success here.
    async fn ensure_session(&self, session: &str) -> Result<(), GatewayError> {
        if self.supervisor.exists(session).await {
            return Ok(());
        }
        let config = SessionConfig {
            mailbox: self.mailbox.clone(),
            executor: self.executor.clone(),
            subscriptions: self.subscriptions.clone(),
            backend: self.backend.clone(),
            session_ttl: self.session_ttl,
        };
        match self.supervisor.create(session.to_string(), config).await {
            Ok(()) | Err(SupervisorError::AlreadyExists) => Ok(()),
            Err(e) => Err(supervisor_to_gateway(e)),
        }
    }

    async fn dispatch(&self, session: &str, request: SessionRequest) -> Result<SessionResponse, GatewayError> {
        self.ensure_session(session).await?;
        self.supervisor
            .request(session, request)
            .await
            .map_err(supervisor_to_gateway)
    }

    /// `cancel` governs only the backend submission itself (gas estimate,
    /// send, receipt wait): the request is always accepted and given a
    /// mailbox id, and a cancellation that fires after submission starts
    /// surfaces as an `Event::Error { error_code: GatewayError::Cancelled }`
    /// in that same mailbox slot rather than an error from this call.
    pub async fn deploy(&self, session: &str, data: Bytes, cancel: CancellationToken) -> Result<u64, GatewayError> {
        match self.dispatch(session, SessionRequest::Deploy { data, cancel }).await? {
            SessionResponse::Submitted { id } => Ok(id),
            _ => unreachable!("Deploy always yields Submitted"),
        }
    }

    pub async fn execute(
        &self,
        session: &str,
        address: Address,
        data: Bytes,
        cancel: CancellationToken,
    ) -> Result<u64, GatewayError> {
        match self
            .dispatch(session, SessionRequest::Execute { address, data, cancel })
            .await?
        {
            SessionResponse::Submitted { id } => Ok(id),
            _ => unreachable!("Execute always yields Submitted"),
        }
    }

    pub async fn subscribe(&self, session: &str, filter: LogFilter) -> Result<u64, GatewayError> {
        match self.dispatch(session, SessionRequest::Subscribe { filter }).await? {
            SessionResponse::Subscribed { subscription_id } => Ok(subscription_id),
            _ => unreachable!("Subscribe always yields Subscribed"),
        }
    }

    pub async fn unsubscribe(&self, session: &str, subscription_id: u64) -> Result<(), GatewayError> {
        match self
            .dispatch(session, SessionRequest::Unsubscribe { subscription_id })
            .await?
        {
            SessionResponse::Unsubscribed => Ok(()),
            _ => unreachable!("Unsubscribe always yields Unsubscribed"),
        }
    }

    pub async fn poll(
        &self,
        session: &str,
        offset: u64,
        count: u32,
        discard_previous: bool,
    ) -> Result<MailboxPage, GatewayError> {
        match self
            .dispatch(
                session,
                SessionRequest::Poll {
                    offset,
                    count,
                    discard_previous,
                },
            )
            .await?
        {
            SessionResponse::Polled(page) => Ok(page),
            _ => unreachable!("Poll always yields Polled"),
        }
    }

    pub async fn poll_subscription(
        &self,
        session: &str,
        subscription_id: u64,
        offset: u64,
        count: u32,
        discard_previous: bool,
    ) -> Result<MailboxPage, GatewayError> {
        match self
            .dispatch(
                session,
                SessionRequest::PollSubscription {
                    subscription_id,
                    offset,
                    count,
                    discard_previous,
                },
            )
            .await?
        {
            SessionResponse::Polled(page) => Ok(page),
            _ => unreachable!("PollSubscription always yields Polled"),
        }
    }
}

/// Parses the `filter` query parameter on `/v0/api/event/subscribe`
/// (spec.md §4.6, §6): a percent-decoded, repeatable `key=value` string
/// using `address` and `topic` keys. `serde_urlencoded` is used instead of
/// a hand-rolled splitter because it natively supports repeated keys (more
/// than one `topic=`) while percent-decoding each value.
pub fn parse_log_filter(raw: &str) -> Result<LogFilter, GatewayError> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(raw).map_err(|e| GatewayError::QueryParseError(e.to_string()))?;

    let mut filter = LogFilter::default();
    for (key, value) in pairs {
        match key.as_str() {
            "address" => {
                let address: Address = value
                    .parse()
                    .map_err(|_| GatewayError::InvalidAddress(value.clone()))?;
                filter.addresses.push(address);
            }
            "topic" => {
                let bytes = const_hex::decode(value.trim_start_matches("0x"))
                    .map_err(|_| GatewayError::InvalidHex(value.clone()))?;
                let topic = alloy_primitives::B256::try_from(bytes.as_slice())
                    .map_err(|_| GatewayError::InvalidHex(value.clone()))?;
                filter.topics.push(topic);
            }
            other => return Err(GatewayError::UnsupportedTopic(other.to_string())),
        }
    }

    if filter.addresses.is_empty() {
        return Err(GatewayError::QueryParseError(
            "filter must specify at least one address".to_string(),
        ));
    }

    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dg_backend::mock::{MockBackend, CANONICAL_DEPLOY_ADDRESS};
    use dg_executor::{LowBalanceHook, SignerConfig};
    use dg_mailbox::InMemoryMailbox;
    use dg_retry::RetryConfig;
    use std::time::Duration as StdDuration;

    fn no_op_low_balance_hook() -> LowBalanceHook {
        Arc::new(|_, _| {})
    }

    async fn test_manager(backend: Arc<MockBackend>) -> RequestManager {
        let executor = Arc::new(TxExecutor::new());
        executor.start().await.unwrap();
        executor
            .add_signer(SignerConfig {
                address: Address::repeat_byte(1),
                backend: backend.clone(),
                retry_config: RetryConfig {
                    attempts: dg_retry::Attempts::Bounded(2),
                    base_timeout: StdDuration::from_millis(1),
                    max_timeout: StdDuration::from_millis(2),
                    random: false,
                    ..Default::default()
                },
                low_balance_threshold: alloy_primitives::U256::ZERO,
                low_balance_hook: no_op_low_balance_hook(),
            })
            .await
            .unwrap();

        let subscriptions = Arc::new(SubscriptionManager::new());
        subscriptions.start().await.unwrap();

        let mailbox: Arc<dyn Mailbox> = Arc::new(InMemoryMailbox::new());
        let manager = RequestManager::new(
            mailbox,
            executor,
            subscriptions,
            backend,
            StdDuration::from_secs(3600),
        );
        manager.start().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn deploy_creates_session_lazily_and_reports_canonical_address() {
        let backend = Arc::new(MockBackend::new());
        let manager = test_manager(backend).await;

        let id = manager
            .deploy("session-a", Bytes::from_static(b"ctor"), CancellationToken::new())
            .await
            .unwrap();

        let page = tokio::time::timeout(StdDuration::from_secs(1), async {
            loop {
                let page = manager.poll("session-a", id, 1, false).await.unwrap();
                if !page.events.is_empty() {
                    return page;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            &page.events[0],
            Event::Deploy { address, .. } if *address == CANONICAL_DEPLOY_ADDRESS
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn deploy_gas_estimate_failure_reports_error_event() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_gas_estimate_for(Bytes::from_static(b"bad-ctor"));
        let manager = test_manager(backend).await;

        let id = manager
            .deploy("session-c", Bytes::from_static(b"bad-ctor"), CancellationToken::new())
            .await
            .unwrap();

        let page = tokio::time::timeout(StdDuration::from_secs(1), async {
            loop {
                let page = manager.poll("session-c", id, 1, false).await.unwrap();
                if !page.events.is_empty() {
                    return page;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            &page.events[0],
            Event::Error { id: 0, error_code: 1002, .. }
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn execute_receipt_status_zero_reports_error_event() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_receipt_for(Bytes::from_static(b"reverting-call"), Bytes::from_static(b"revert reason"));
        let manager = test_manager(backend).await;

        let id = manager
            .execute(
                "session-d",
                Address::repeat_byte(9),
                Bytes::from_static(b"reverting-call"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let page = tokio::time::timeout(StdDuration::from_secs(1), async {
            loop {
                let page = manager.poll("session-d", id, 1, false).await.unwrap();
                if !page.events.is_empty() {
                    return page;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        match &page.events[0] {
            Event::Error { error_code: 1000, description, .. } => {
                assert!(description.contains("status 0"));
            }
            other => panic!("expected status-zero error event, got {other:?}"),
        }
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_then_log_delivers_data_event() {
        let backend = Arc::new(MockBackend::new());
        let manager = test_manager(backend.clone()).await;
        manager
            .deploy("session-e", Bytes::from_static(b"warm"), CancellationToken::new())
            .await
            .unwrap();

        let address = Address::repeat_byte(0xab);
        let topic = alloy_primitives::B256::repeat_byte(0x01);
        let filter = LogFilter {
            addresses: vec![address],
            topics: vec![topic],
        };
        let subscription_id = manager.subscribe("session-e", filter).await.unwrap();

        // Give the subscription worker a moment to register with the backend
        // before emitting, since `create` only guarantees the worker exists,
        // not that its stream has started.
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        backend.emit_log(dg_backend::RawLog {
            address,
            topics: vec![topic],
            data: Bytes::from_static(b"payload"),
            block_number: 1,
            log_index: 0,
        });

        let page = tokio::time::timeout(StdDuration::from_secs(1), async {
            loop {
                let page = manager
                    .poll_subscription("session-e", subscription_id, 0, 1, false)
                    .await
                    .unwrap();
                if !page.events.is_empty() {
                    return page;
                }
                tokio::time::sleep(StdDuration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            &page.events[0],
            Event::Data { data, topics, .. } if data == &Bytes::from_static(b"payload") && topics == &vec![topic]
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_unknown_subscription_reports_not_found() {
        let backend = Arc::new(MockBackend::new());
        let manager = test_manager(backend).await;
        manager
            .deploy("session-b", Bytes::from_static(b"warm"), CancellationToken::new())
            .await
            .unwrap();

        let err = manager.unsubscribe("session-b", 42).await.unwrap_err();
        assert!(matches!(err, GatewayError::SubscriptionNotFound));
        manager.stop().await.unwrap();
    }

    #[test]
    fn parse_log_filter_accepts_repeated_topic_keys() {
        let filter = parse_log_filter("address=0x0000000000000000000000000000000000000001&topic=0x0000000000000000000000000000000000000000000000000000000000000001&topic=0x0000000000000000000000000000000000000000000000000000000000000002").unwrap();
        assert_eq!(filter.addresses.len(), 1);
        assert_eq!(filter.topics.len(), 2);
    }

    #[test]
    fn parse_log_filter_rejects_missing_address() {
        let err = parse_log_filter("topic=0x01").unwrap_err();
        assert!(matches!(err, GatewayError::QueryParseError(_)));
    }

    #[test]
    fn parse_log_filter_rejects_unknown_key() {
        let err = parse_log_filter("address=0x0000000000000000000000000000000000000001&bogus=1").unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedTopic(_)));
    }
}
