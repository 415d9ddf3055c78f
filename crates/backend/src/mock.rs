//! In-process [`Backend`] double used by unit tests and the workspace
//! integration suite to drive the literal scenarios of spec.md §8 without a
//! live chain. Grounded on the pack's provider/middleware test-double
//! pattern (`ethers-rs`'s `TestMiddleware`/`Middleware` wrapper in
//! `examples/other_examples/1cc852ac_*-middleware.rs.rs`), adapted to
//! `async-trait` instead of `ethers`' associated-error style.

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use dg_errors::GatewayError;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Backend, RawLog, TxEnvelope, TxReceipt};

/// Canonical deploy address the mock reports for every successful deploy,
/// matching the literal scenario in spec.md §8 ("canonical mock address").
pub const CANONICAL_DEPLOY_ADDRESS: Address = Address::ZERO;

struct MockState {
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    gas_estimate_failures: HashSet<Bytes>,
    status_zero_inputs: HashMap<Bytes, Bytes>,
    receipts: HashMap<B256, TxReceipt>,
    next_hash: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            nonces: HashMap::new(),
            balances: HashMap::new(),
            gas_estimate_failures: HashSet::new(),
            status_zero_inputs: HashMap::new(),
            receipts: HashMap::new(),
            next_hash: 1,
        }
    }
}

pub struct MockBackend {
    state: Mutex<MockState>,
    logs: broadcast::Sender<RawLog>,
}

impl Default for MockBackend {
    fn default() -> Self {
        let (logs, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState::default()),
            logs,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().nonces.insert(address, nonce);
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    /// Any `estimate_gas` call whose input equals `input` fails with
    /// `GasEstimateFailed`, matching the "deploy gas-estimate failure"
    /// scenario.
    pub fn fail_gas_estimate_for(&self, input: impl Into<Bytes>) {
        self.state.lock().gas_estimate_failures.insert(input.into());
    }

    /// Any `send_transaction` call whose input equals `input` produces a
    /// receipt with `status == 0` and the given revert `output`, matching
    /// the "execute receipt status zero" scenario.
    pub fn fail_receipt_for(&self, input: impl Into<Bytes>, output: impl Into<Bytes>) {
        self.state
            .lock()
            .status_zero_inputs
            .insert(input.into(), output.into());
    }

    pub fn emit_log(&self, log: RawLog) {
        let _ = self.logs.send(log);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_transaction_count(&self, address: Address) -> Result<u64, GatewayError> {
        Ok(*self.state.lock().nonces.entry(address).or_insert(0))
    }

    async fn get_balance(&self, address: Address) -> Result<U256, GatewayError> {
        Ok(self
            .state
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or(U256::from(1_000_000_000_000_000_000u128)))
    }

    async fn estimate_gas(&self, tx: &TxEnvelope) -> Result<u64, GatewayError> {
        if self.state.lock().gas_estimate_failures.contains(&tx.input) {
            return Err(GatewayError::GasEstimateFailed(
                "mock: configured failure".to_string(),
            ));
        }
        Ok(21_000)
    }

    async fn send_transaction(&self, tx: TxEnvelope) -> Result<B256, GatewayError> {
        let mut state = self.state.lock();
        let hash_seed = state.next_hash;
        state.next_hash += 1;
        let mut hash_bytes = [0u8; 32];
        hash_bytes[24..32].copy_from_slice(&hash_seed.to_be_bytes());
        let tx_hash = B256::from(hash_bytes);

        let receipt = if let Some(output) = state.status_zero_inputs.get(&tx.input).cloned() {
            TxReceipt {
                transaction_hash: tx_hash,
                status: false,
                contract_address: None,
                output,
            }
        } else {
            TxReceipt {
                transaction_hash: tx_hash,
                status: true,
                contract_address: tx.to.is_none().then_some(CANONICAL_DEPLOY_ADDRESS),
                output: Bytes::new(),
            }
        };
        state.receipts.insert(tx_hash, receipt);
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<TxReceipt, GatewayError> {
        self.state
            .lock()
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or_else(|| GatewayError::ReceiptFetchFailed("no such mock receipt".to_string()))
    }

    async fn subscribe_logs(
        &self,
        addresses: Vec<Address>,
        topics: Vec<B256>,
    ) -> Result<BoxStream<'static, RawLog>, GatewayError> {
        use futures::StreamExt;

        let receiver = self.logs.subscribe();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let addresses = addresses.clone();
            let topics = topics.clone();
            async move {
                let log = item.ok()?;
                if !addresses.is_empty() && !addresses.contains(&log.address) {
                    return None;
                }
                if !topics.is_empty() && !topics.iter().all(|t| log.topics.contains(t)) {
                    return None;
                }
                Some(log)
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn configured_gas_estimate_failure_is_reported() {
        let backend = MockBackend::new();
        let input: Bytes = vec![0xaa].into();
        backend.fail_gas_estimate_for(input.clone());

        let tx = TxEnvelope {
            input: input.clone(),
            ..Default::default()
        };
        let err = backend.estimate_gas(&tx).await.unwrap_err();
        assert!(matches!(err, GatewayError::GasEstimateFailed(_)));

        let other_tx = TxEnvelope {
            input: vec![0xbb].into(),
            ..Default::default()
        };
        assert_eq!(backend.estimate_gas(&other_tx).await.unwrap(), 21_000);
    }

    #[tokio::test]
    async fn configured_receipt_failure_reports_status_zero_with_output() {
        let backend = MockBackend::new();
        let input: Bytes = vec![0x01].into();
        let output: Bytes = vec![0x65, 0x72, 0x72, 0x6f, 0x72].into();
        backend.fail_receipt_for(input.clone(), output.clone());

        let tx = TxEnvelope {
            input,
            ..Default::default()
        };
        let hash = backend.send_transaction(tx).await.unwrap();
        let receipt = backend.get_receipt(hash).await.unwrap();
        assert!(!receipt.status);
        assert_eq!(receipt.output, output);
    }

    #[tokio::test]
    async fn successful_deploy_reports_canonical_address() {
        let backend = MockBackend::new();
        let tx = TxEnvelope {
            to: None,
            ..Default::default()
        };
        let hash = backend.send_transaction(tx).await.unwrap();
        let receipt = backend.get_receipt(hash).await.unwrap();
        assert!(receipt.status);
        assert_eq!(receipt.contract_address, Some(CANONICAL_DEPLOY_ADDRESS));
    }

    #[tokio::test]
    async fn subscribed_logs_are_filtered_by_address_and_topics() {
        let backend = MockBackend::new();
        let address = Address::repeat_byte(0xab);
        let topic = B256::repeat_byte(0x01);
        let mut stream = backend
            .subscribe_logs(vec![address], vec![topic])
            .await
            .unwrap();

        backend.emit_log(RawLog {
            address: Address::repeat_byte(0xff),
            topics: vec![topic],
            data: Bytes::new(),
            block_number: 1,
            log_index: 0,
        });
        backend.emit_log(RawLog {
            address,
            topics: vec![topic],
            data: Bytes::new(),
            block_number: 1,
            log_index: 1,
        });

        let received = stream.next().await.unwrap();
        assert_eq!(received.address, address);
    }
}
