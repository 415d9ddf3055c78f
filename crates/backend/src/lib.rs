//! Backend RPC client abstraction used by the transaction executor (C4) and
//! subscription manager (C5). Grounded on `native-bridge::sidecar::submitter::Submitter`
//! and `tempo-faucet`'s direct `alloy::providers::Provider` use: a thin trait
//! in front of alloy lets the executor and subscription manager be tested
//! against [`mock::MockBackend`] instead of a live chain.

mod alloy_backend;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use alloy_backend::AlloyBackend;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use dg_errors::GatewayError;
use futures::stream::BoxStream;

/// A transaction ready to sign and submit. Mirrors the handful of fields
/// the executor actually fills in (spec.md §4.4); everything else
/// (`alloy::rpc::types::TransactionRequest`'s full field set) is backend
/// detail.
#[derive(Debug, Clone, Default)]
pub struct TxEnvelope {
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub nonce: u64,
    pub gas: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub transaction_hash: B256,
    pub status: bool,
    pub contract_address: Option<Address>,
    pub output: Bytes,
}

#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub log_index: u64,
}

/// Everything the core needs from an Ethereum-shaped execution backend.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn get_transaction_count(&self, address: Address) -> Result<u64, GatewayError>;

    async fn get_balance(&self, address: Address) -> Result<U256, GatewayError>;

    /// Non-recoverable failures are distinguished from recoverable ones by
    /// message text (spec.md §4.4.2): `"Requested gas greater than block
    /// gas limit"` and `"Invalid transaction nonce"` are non-recoverable;
    /// callers classify the returned error string through the retry
    /// engine's [`dg_retry::Attempt`].
    async fn estimate_gas(&self, tx: &TxEnvelope) -> Result<u64, GatewayError>;

    async fn send_transaction(&self, tx: TxEnvelope) -> Result<B256, GatewayError>;

    async fn get_receipt(&self, tx_hash: B256) -> Result<TxReceipt, GatewayError>;

    /// Opens a subscription to logs matching `addresses`/`topics` (empty
    /// vectors match anything), yielding [`RawLog`]s as they arrive. The
    /// stream ends (or errors) when the upstream subscription drops —
    /// callers (C5) treat that as a resubscribe trigger.
    async fn subscribe_logs(
        &self,
        addresses: Vec<Address>,
        topics: Vec<B256>,
    ) -> Result<BoxStream<'static, RawLog>, GatewayError>;
}
