//! `dg-server`: the developer-facing gateway binary (spec.md §6).
//!
//! Wires the seven components together: a signer pool behind [`TxExecutor`]
//! (C4, itself built on the C1 supervisor), a mailbox (C3), a subscription
//! manager (C5) over a read-only websocket backend, a [`RequestManager`]
//! (C6) tying sessions to all of the above, and an [`AuthMiddleware`] (C7)
//! in front of the HTTP surface. Grounded on
//! `bin/tempo-consensus-indexer/src/main.rs`'s CLI-parse /
//! tracing-init / spawn-servers / signal-select shape.

mod error;
mod extract;
mod handlers;
mod middleware;
mod state;

use std::{collections::HashMap, sync::Arc};

use alloy::{
    network::EthereumWallet,
    providers::ProviderBuilder,
    signers::local::PrivateKeySigner,
};
use alloy_primitives::{Address, U256};
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use dg_auth::{AuthMiddleware, InsecureAuthProvider, MultiAuth, OidcAuthProvider};
use dg_backend::{AlloyBackend, Backend};
use dg_config::{AuthKind, BackendKind, Cli, GatewayConfig, MailboxKind};
use dg_executor::{SignerConfig, TxExecutor};
use dg_gateway::RequestManager;
use dg_mailbox::{InMemoryMailbox, Mailbox};
use dg_retry::RetryConfig;
use dg_subscriptions::SubscriptionManager;
use tower_http::catch_panic::CatchPanicLayer;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dg_server=debug,dg_gateway=debug"));
    tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .init();
}

async fn build_mailbox(config: &GatewayConfig) -> eyre::Result<Arc<dyn Mailbox>> {
    match config.mailbox {
        MailboxKind::Mem => Ok(match config.mailbox_queue_limit {
            Some(limit) => Arc::new(InMemoryMailbox::with_queue_limit(limit)),
            None => Arc::new(InMemoryMailbox::new()),
        }),
        MailboxKind::RedisSingle | MailboxKind::RedisCluster => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| eyre::eyre!("redis mailbox selected but no redis-url configured"))?;
            let mailbox = dg_mailbox::RedisMailbox::connect_with_queue_limit(
                url,
                config.mailbox_queue_limit.unwrap_or(0),
            )
            .await?;
            Ok(Arc::new(mailbox))
        }
    }
}

/// Builds one [`AlloyBackend`] per signer, each wallet-bound so the
/// executor's submitted transactions are signed by that signer's own key
/// (spec.md §4.4). Returns the backends keyed by address alongside the raw
/// signers (kept around for `getPublicKey`).
fn build_signer_wallets(
    config: &GatewayConfig,
) -> eyre::Result<Vec<(PrivateKeySigner, Arc<dyn Backend>)>> {
    let mut out = Vec::with_capacity(config.signer_keys.len());
    for key in &config.signer_keys {
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|e| eyre::eyre!("invalid signer private key: {e}"))?;
        let wallet = EthereumWallet::from(signer.clone());
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(config.rpc_url.parse()?);
        let backend: Arc<dyn Backend> = Arc::new(AlloyBackend::new(provider));
        out.push((signer, backend));
    }
    Ok(out)
}

/// Backend used only for reading chain state via `subscribe_logs` (C5): a
/// plain, unsigned websocket provider, since alloy pub/sub needs a
/// websocket transport the signer pool's HTTP providers don't offer.
async fn build_subscription_backend(config: &GatewayConfig) -> eyre::Result<Arc<dyn Backend>> {
    match config.backend {
        BackendKind::Ethereum => {
            let ws_url = config.ws_rpc_url.as_deref().unwrap_or(&config.rpc_url);
            let provider = ProviderBuilder::new().connect(ws_url).await?;
            Ok(Arc::new(AlloyBackend::new(provider)))
        }
    }
}

fn build_auth(config: &GatewayConfig) -> eyre::Result<AuthMiddleware> {
    let mut multi = MultiAuth::new();
    for kind in &config.auth {
        match kind {
            AuthKind::Insecure => multi.add(Arc::new(InsecureAuthProvider::new())),
            AuthKind::Oauth => {
                let jwks_url = config
                    .oidc_jwks_url
                    .as_deref()
                    .ok_or_else(|| eyre::eyre!("oauth auth selected but no oidc-jwks-url configured"))?;
                multi.add(Arc::new(OidcAuthProvider::new(jwks_url)));
            }
        }
    }
    Ok(AuthMiddleware::new(Arc::new(multi)))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v0/api/service/deploy", post(handlers::deploy))
        .route("/v0/api/service/execute", post(handlers::execute))
        .route("/v0/api/service/poll", post(handlers::poll))
        .route("/v0/api/service/getPublicKey", get(handlers::get_public_key))
        .route("/v0/api/event/subscribe", post(handlers::subscribe))
        .route("/v0/api/event/unsubscribe", post(handlers::unsubscribe))
        .route("/v0/api/event/poll", post(handlers::poll_subscription))
        .route("/v0/api/health", get(handlers::health))
        .route("/v0/api/version", get(handlers::version))
        .layer(axum::middleware::from_fn(middleware::echo_trace_id))
        .layer(CatchPanicLayer::custom(middleware::panic_response))
        .with_state(state)
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli)?;
    tracing::info!(
        listen_addr = %config.listen_addr,
        rpc_url = %config.rpc_url,
        mailbox = ?config.mailbox,
        signer_count = config.signer_keys.len(),
        "starting developer gateway"
    );

    let low_balance_threshold: U256 = config
        .low_balance_threshold
        .parse()
        .map_err(|e| eyre::eyre!("invalid low-balance-threshold: {e}"))?;

    let executor = Arc::new(TxExecutor::new());
    executor.start().await?;

    let mut signer_wallets: HashMap<Address, PrivateKeySigner> = HashMap::new();
    for (signer, backend) in build_signer_wallets(&config)? {
        let address = signer.address();
        executor
            .add_signer(SignerConfig {
                address,
                backend,
                retry_config: RetryConfig::default(),
                low_balance_threshold,
                low_balance_hook: Arc::new(move |address, balance| {
                    tracing::warn!(%address, %balance, "signer.low_balance");
                }),
            })
            .await?;
        signer_wallets.insert(address, signer);
    }

    let mailbox = build_mailbox(&config).await?;
    let subscriptions = Arc::new(SubscriptionManager::new());
    subscriptions.start().await?;
    let subscription_backend = build_subscription_backend(&config).await?;

    let request_manager = Arc::new(RequestManager::new(
        mailbox,
        executor.clone(),
        subscriptions.clone(),
        subscription_backend,
        config.session_ttl,
    ));
    request_manager.start().await?;

    let auth = Arc::new(build_auth(&config)?);

    let state = AppState {
        request_manager: request_manager.clone(),
        subscriptions: subscriptions.clone(),
        auth,
        signer_wallets: Arc::new(signer_wallets),
        max_body_bytes: config.max_body_bytes,
        request_timeout: config.request_timeout,
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(listen_addr = %config.listen_addr, "gateway listening");
    let server = axum::serve(listener, router(state));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        result = server => result?,
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }

    request_manager.stop().await?;
    subscriptions.stop().await?;
    executor.stop().await?;

    Ok(())
}
