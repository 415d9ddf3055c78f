//! Transaction executor (spec.md §4.4, component C4).
//!
//! Owns a pool of signers, one [`dg_supervisor::Worker`] per signer address.
//! Each signer's per-request state machine (acquire nonce, estimate gas
//! under retry, sign and submit, interpret the receipt) runs entirely on
//! that signer's own worker task, so the supervisor's per-key serialization
//! (C1) is what gives the nonce bookkeeping its sequencing guarantee —
//! no extra lock is needed here. Grounded on `tempo-faucet` and
//! `native-bridge::sidecar::submitter::Submitter`, which drive the same
//! acquire-nonce/estimate/submit/await-receipt sequence by hand against a
//! wallet-bound `alloy` provider.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, U256};
use async_trait::async_trait;
use dg_backend::{Backend, TxEnvelope};
use dg_errors::GatewayError;
use dg_retry::{retry, Attempt, RetryConfig, RetryError};
use dg_supervisor::{Loopback, Supervisor, SupervisorError, Worker};
use tokio_util::sync::CancellationToken;

/// Called at most once per low-balance crossing and re-armed once the
/// signer's balance recovers above the threshold (spec.md §4.4 "wallet
/// low balance hook").
pub type LowBalanceHook = Arc<dyn Fn(Address, U256) + Send + Sync>;

/// Configuration for one signer in the pool.
///
/// `backend` is expected to already be bound to this signer's wallet (an
/// `AlloyBackend` built from a `ProviderBuilder::new().wallet(..)` provider,
/// matching `Submitter::with_signer`): signing itself is the provider's
/// concern, not the executor's.
pub struct SignerConfig {
    pub address: Address,
    pub backend: Arc<dyn Backend>,
    pub retry_config: RetryConfig,
    pub low_balance_threshold: U256,
    pub low_balance_hook: LowBalanceHook,
}

#[derive(Debug, Clone)]
pub enum SignerRequest {
    Deploy {
        data: Bytes,
        cancel: CancellationToken,
    },
    Execute {
        to: Address,
        data: Bytes,
        cancel: CancellationToken,
    },
}

#[derive(Debug, Clone)]
pub enum TxOutcome {
    DeploySucceeded { address: Address },
    ExecuteSucceeded { address: Address, output: Bytes },
}

fn is_non_recoverable_gas_error(error: &GatewayError) -> bool {
    match error {
        GatewayError::GasEstimateFailed(msg) => {
            msg.contains("Requested gas greater than block gas limit")
                || msg.contains("Invalid transaction nonce")
        }
        _ => false,
    }
}

fn retry_err_to_gateway_error(error: RetryError<GatewayError>) -> GatewayError {
    match error {
        RetryError::NonRecoverable(e) => e,
        RetryError::Cancelled => GatewayError::Cancelled,
        RetryError::MaxAttemptsReached(causes) => GatewayError::RetriesExhausted {
            attempts: causes.len() as u32,
            last_cause: causes.last().map(ToString::to_string).unwrap_or_default(),
        },
    }
}

struct SignerWorker {
    address: Address,
    backend: Arc<dyn Backend>,
    retry_config: RetryConfig,
    low_balance_threshold: U256,
    low_balance_hook: LowBalanceHook,
    next_nonce: Option<u64>,
    low_balance_armed: bool,
}

impl SignerWorker {
    async fn check_low_balance(&mut self) {
        let Ok(balance) = self.backend.get_balance(self.address).await else {
            return;
        };
        if balance < self.low_balance_threshold {
            if !self.low_balance_armed {
                self.low_balance_armed = true;
                (self.low_balance_hook)(self.address, balance);
            }
        } else {
            self.low_balance_armed = false;
        }
    }

    /// Acquire nonce, estimate gas, sign and submit, interpret the receipt
    /// (spec.md §4.4, steps 1-4). On any failure the cached nonce is
    /// dropped so the next call refetches it from the backend instead of
    /// reusing a value that may no longer be next-in-line.
    async fn submit(
        &mut self,
        to: Option<Address>,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<TxOutcome, GatewayError> {
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let nonce = match self.next_nonce {
            Some(nonce) => nonce,
            None => self.backend.get_transaction_count(self.address).await?,
        };
        self.next_nonce = Some(nonce + 1);

        let mut tx = TxEnvelope {
            from: self.address,
            to,
            input: data,
            nonce,
            gas: None,
        };

        let gas = retry(
            || async {
                match self.backend.estimate_gas(&tx).await {
                    Ok(gas) => Ok(gas),
                    Err(e) if is_non_recoverable_gas_error(&e) => Err(Attempt::NonRecoverable(e)),
                    Err(e) => Err(Attempt::Recoverable(e)),
                }
            },
            &self.retry_config,
            cancel,
        )
        .await
        .map_err(retry_err_to_gateway_error)?;
        tx.gas = Some(gas);

        let tx_hash = retry(
            || async { self.backend.send_transaction(tx.clone()).await.map_err(Attempt::Recoverable) },
            &self.retry_config,
            cancel,
        )
        .await
        .map_err(retry_err_to_gateway_error)?;

        let receipt = retry(
            || async { self.backend.get_receipt(tx_hash).await.map_err(Attempt::Recoverable) },
            &self.retry_config,
            cancel,
        )
        .await
        .map_err(retry_err_to_gateway_error)?;

        if !receipt.status {
            return Err(GatewayError::TransactionFailed(format!(
                "status 0 (output: 0x{})",
                hex::encode(&receipt.output)
            )));
        }

        match to {
            None => Ok(TxOutcome::DeploySucceeded {
                address: receipt.contract_address.unwrap_or(Address::ZERO),
            }),
            Some(address) => Ok(TxOutcome::ExecuteSucceeded {
                address,
                output: receipt.output,
            }),
        }
    }
}

#[async_trait]
impl Worker for SignerWorker {
    type UserValue = SignerConfig;
    type Request = SignerRequest;
    type Response = TxOutcome;
    type Error = GatewayError;

    fn on_create(
        _key: &str,
        config: Self::UserValue,
        _loopback: Loopback<Self>,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            address: config.address,
            backend: config.backend,
            retry_config: config.retry_config,
            low_balance_threshold: config.low_balance_threshold,
            low_balance_hook: config.low_balance_hook,
            next_nonce: None,
            low_balance_armed: false,
        })
    }

    async fn handle(&mut self, request: Self::Request) -> Result<Self::Response, Self::Error> {
        self.check_low_balance().await;
        let (to, data, cancel) = match request {
            SignerRequest::Deploy { data, cancel } => (None, data, cancel),
            SignerRequest::Execute { to, data, cancel } => (Some(to), data, cancel),
        };
        match self.submit(to, data, &cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                self.next_nonce = None;
                Err(error)
            }
        }
    }
}

fn signer_key(address: Address) -> String {
    format!("{address:#x}")
}

/// Pool of signers fronting [`dg_backend::Backend`]. Each signer is a
/// keyed worker under one [`Supervisor`], so per-signer nonce sequencing
/// falls out of the supervisor's own per-key serialization.
pub struct TxExecutor {
    supervisor: Supervisor<SignerWorker>,
}

impl Default for TxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TxExecutor {
    pub fn new() -> Self {
        Self {
            supervisor: Supervisor::new(),
        }
    }

    pub async fn start(&self) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.start().await
    }

    pub async fn stop(&self) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.stop().await
    }

    pub async fn add_signer(&self, config: SignerConfig) -> Result<(), SupervisorError<GatewayError>> {
        let key = signer_key(config.address);
        self.supervisor.create(key, config).await
    }

    pub async fn remove_signer(&self, address: Address) -> Result<(), SupervisorError<GatewayError>> {
        self.supervisor.destroy(signer_key(address)).await
    }

    /// Deploys `data` using whichever signer the pool's any-worker `execute`
    /// queue (C1) hands it to first. `cancel` aborts the in-flight retry
    /// loop (gas estimate, submit, or receipt wait) the instant it fires.
    pub async fn deploy(
        &self,
        data: Bytes,
        cancel: CancellationToken,
    ) -> Result<TxOutcome, SupervisorError<GatewayError>> {
        self.supervisor.execute(SignerRequest::Deploy { data, cancel }).await
    }

    pub async fn execute(
        &self,
        to: Address,
        data: Bytes,
        cancel: CancellationToken,
    ) -> Result<TxOutcome, SupervisorError<GatewayError>> {
        self.supervisor
            .execute(SignerRequest::Execute { to, data, cancel })
            .await
    }
}
