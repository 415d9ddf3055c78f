use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SupervisorError;

/// A single keyed worker's behavior (spec.md §3 "Worker", §4.1).
///
/// `on_create` is the user handler the supervisor invokes synchronously
/// while creating a worker; returning an error aborts creation before any
/// task is spawned. `handle` runs on the worker's own task for every
/// request routed to it (per-key, broadcast, or any-worker) or forwarded
/// from its own [`Loopback`].
#[async_trait]
pub trait Worker: Send + 'static {
    type UserValue: Send + 'static;
    type Request: Send + 'static;
    type Response: Send + 'static;
    type Error: Send + std::fmt::Display + 'static;

    fn on_create(
        key: &str,
        user_value: Self::UserValue,
        loopback: Loopback<Self>,
    ) -> Result<Self, Self::Error>
    where
        Self: Sized;

    async fn handle(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error>;

    /// Inactivity budget after which the supervisor destroys this worker if
    /// no request has arrived.
    fn max_inactivity(&self) -> Duration {
        Duration::from_secs(3600)
    }

    /// Whether an error returned from `handle` should be treated as fatal
    /// (the worker is destroyed) rather than transient (the worker keeps
    /// running and serves the next request). Defaults to non-fatal; a
    /// panic inside `handle` is always fatal regardless of this.
    fn is_fatal(_error: &Self::Error) -> bool {
        false
    }
}

/// Where a worker's `handle` outcome should be delivered: a single caller
/// waiting on a oneshot (`request`/`execute`), a shared collector all
/// broadcast recipients feed (`broadcast`), or nowhere (self-notifications
/// via [`Loopback::notify`]).
pub(crate) enum ReplySlot<W: Worker + ?Sized> {
    Oneshot(tokio::sync::oneshot::Sender<Result<W::Response, SupervisorError<W::Error>>>),
    Shared(mpsc::Sender<Result<W::Response, SupervisorError<W::Error>>>),
    None,
}

pub(crate) struct Envelope<W: Worker + ?Sized> {
    pub(crate) value: W::Request,
    pub(crate) reply: ReplySlot<W>,
}

/// Channel-only handle a worker can use to enqueue events back into its own
/// mailbox (e.g. "resubscribe" triggers from a background task), without
/// holding a reference to the supervisor itself (design note, spec.md §9).
pub struct Loopback<W: Worker + ?Sized> {
    pub(crate) tx: mpsc::Sender<Envelope<W>>,
}

impl<W: Worker + ?Sized> Clone for Loopback<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<W: Worker + ?Sized> Loopback<W> {
    /// Best-effort self-notification. Dropped silently if the worker's
    /// mailbox is full or already gone — callers use this only for
    /// idempotent triggers (e.g. "please resubscribe"), never for payloads
    /// that must not be lost.
    pub fn notify(&self, value: W::Request) {
        let envelope = Envelope {
            value,
            reply: ReplySlot::None,
        };
        let _ = self.tx.try_send(envelope);
    }
}
