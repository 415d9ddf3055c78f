//! Shared application state handed to every axum handler (spec.md §6).

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::Address;
use dg_auth::AuthMiddleware;
use dg_gateway::RequestManager;
use dg_subscriptions::SubscriptionManager;

#[derive(Clone)]
pub struct AppState {
    pub request_manager: Arc<RequestManager>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub auth: Arc<AuthMiddleware>,
    /// Keyed by address so `getPublicKey` can look up the signer that owns
    /// it without going through the executor (which only exposes
    /// `Backend`, not raw key material).
    pub signer_wallets: Arc<HashMap<Address, PrivateKeySigner>>,
    pub max_body_bytes: usize,
    /// Deadline after which a deploy/execute's in-flight backend submission
    /// is cancelled (spec.md §4.1/§5).
    pub request_timeout: Duration,
}
