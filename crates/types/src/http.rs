//! Ambient response/request shapes for the HTTP surface (spec.md §6):
//! these aren't part of the core's request/event fabric, but the external
//! interface contract the core threads through (trace ids on error
//! responses, health/version reporting) is still part of the data model.

use serde::{Deserialize, Serialize};

/// `X-OASIS-TRACE-ID` (spec.md §6): echoed back verbatim on every response,
/// logged alongside error envelopes. Kept as a newtype instead of a bare
/// `i64` so call sites can't confuse it with an event or mailbox offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub i64);

/// `GET /v0/api/health` response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub health: &'static str,
    pub metrics: HealthMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub subscriptions_current: u64,
    pub subscriptions_lifetime_total: u64,
}

/// `GET /v0/api/version` response body.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
}
