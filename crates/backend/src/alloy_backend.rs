use alloy::{
    providers::Provider,
    rpc::types::{Filter, TransactionRequest},
};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use dg_errors::GatewayError;
use futures::{stream::BoxStream, StreamExt};

use crate::{Backend, RawLog, TxEnvelope, TxReceipt};

fn rpc_failure(context: &str, error: impl std::fmt::Display) -> GatewayError {
    GatewayError::UnexpectedRpcFailure(format!("{context}: {error}"))
}

/// [`Backend`] implementation over a live `alloy` provider. Grounded on
/// `native-bridge::sidecar::{submitter::Submitter, watcher::ChainWatcher}`,
/// which build `TransactionRequest`s by hand and drive
/// `provider.subscribe_logs(&filter)` the same way.
pub struct AlloyBackend<P> {
    provider: P,
}

impl<P> AlloyBackend<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

fn to_transaction_request(tx: &TxEnvelope) -> TransactionRequest {
    let mut request = TransactionRequest::default()
        .from(tx.from)
        .nonce(tx.nonce)
        .input(tx.input.clone().into());
    if let Some(to) = tx.to {
        request = request.to(to);
    }
    if let Some(gas) = tx.gas {
        request = request.gas_limit(gas);
    }
    request
}

#[async_trait]
impl<P> Backend for AlloyBackend<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn get_transaction_count(&self, address: Address) -> Result<u64, GatewayError> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(|e| rpc_failure("get_transaction_count", e))
    }

    async fn get_balance(&self, address: Address) -> Result<U256, GatewayError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| rpc_failure("get_balance", e))
    }

    async fn estimate_gas(&self, tx: &TxEnvelope) -> Result<u64, GatewayError> {
        self.provider
            .estimate_gas(to_transaction_request(tx))
            .await
            .map_err(|e| GatewayError::GasEstimateFailed(e.to_string()))
    }

    async fn send_transaction(&self, tx: TxEnvelope) -> Result<B256, GatewayError> {
        let pending = self
            .provider
            .send_transaction(to_transaction_request(&tx))
            .await
            .map_err(|e| GatewayError::TransactionFailed(e.to_string()))?;
        Ok(*pending.tx_hash())
    }

    async fn get_receipt(&self, tx_hash: B256) -> Result<TxReceipt, GatewayError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| GatewayError::ReceiptFetchFailed(e.to_string()))?
            .ok_or_else(|| GatewayError::ReceiptFetchFailed("receipt not yet available".into()))?;

        Ok(TxReceipt {
            transaction_hash: tx_hash,
            status: receipt.status(),
            contract_address: receipt.contract_address(),
            output: Default::default(),
        })
    }

    async fn subscribe_logs(
        &self,
        addresses: Vec<Address>,
        topics: Vec<B256>,
    ) -> Result<BoxStream<'static, RawLog>, GatewayError> {
        let mut filter = Filter::new();
        if !addresses.is_empty() {
            filter = filter.address(addresses);
        }
        for (index, topic) in topics.into_iter().enumerate().take(4) {
            filter = match index {
                0 => filter.event_signature(topic),
                1 => filter.topic1(topic),
                2 => filter.topic2(topic),
                _ => filter.topic3(topic),
            };
        }

        let subscription = self
            .provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| rpc_failure("subscribe_logs", e))?;

        let stream = subscription.into_stream().filter_map(|log| async move {
            let block_number = log.block_number?;
            let log_index = log.log_index?;
            Some(RawLog {
                address: log.address(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                block_number,
                log_index,
            })
        });

        Ok(Box::pin(stream))
    }
}
