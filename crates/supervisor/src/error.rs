use std::fmt;

/// Errors the supervisor itself can report, on top of whatever a worker's
/// own handler returns (spec.md §4.1).
///
/// Not `Clone`: `HandlerError` carries the worker's own error type, which we
/// never require to be `Clone`. Exit bookkeeping that needs to fan a single
/// outcome out to several waiters (destroy, shutdown) uses [`Self::WorkerExited`]
/// instead, which only carries a stringified description.
#[derive(Debug)]
pub enum SupervisorError<E> {
    AlreadyExists,
    HandlerRejected(E),
    NoSuchWorker,
    HandlerError(E),
    Panicked(String),
    /// A worker's mailbox loop ended with a fatal condition while other
    /// callers (e.g. concurrent `destroy` calls) were waiting on it.
    WorkerExited(String),
    Cancelled,
    EmptyFleet,
    Stopped,
    AlreadyStopped,
}

impl<E: fmt::Display> fmt::Display for SupervisorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => write!(f, "worker already exists"),
            Self::HandlerRejected(e) => write!(f, "on_create rejected: {e}"),
            Self::NoSuchWorker => write!(f, "no such worker"),
            Self::HandlerError(e) => write!(f, "handler error: {e}"),
            Self::Panicked(msg) => write!(f, "worker panicked: {msg}"),
            Self::WorkerExited(msg) => write!(f, "worker exited: {msg}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::EmptyFleet => write!(f, "no active workers"),
            Self::Stopped => write!(f, "supervisor is stopped"),
            Self::AlreadyStopped => write!(f, "supervisor is already stopped or stopping"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for SupervisorError<E> {}
