//! Shared data model for the developer gateway core (spec.md §3).
//!
//! These types cross every component boundary (C1–C7) and are deliberately
//! free of any component's internal state — only the shapes a caller can
//! observe.

pub mod event;
pub mod http;
pub mod request;
pub mod subscription;

pub use event::Event;
pub use http::{HealthMetrics, HealthReport, TraceId, VersionInfo};
pub use request::TxRequest;
pub use subscription::{LogFilter, LogPointer};

pub use alloy_primitives::{Address, Bytes, B256};

/// A worker key, e.g. a session key or a `(session, subscription_id)` pair
/// flattened to a string. Kept as a plain `String` rather than a newtype so
/// every component can use it directly as a `HashMap`/`DashMap` key.
pub type WorkerKey = String;

/// Builds the mailbox/worker key for a subscription under a session.
pub fn subscription_key(session: &str, subscription_id: u64) -> WorkerKey {
    format!("{session}:sub:{subscription_id}")
}
