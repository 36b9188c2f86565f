use std::sync::Arc;

use anyhow::Context;
use ledgersync_core::{
    credentials::{CredentialCipher, CredentialVault, FileCredentialStore},
    sync::InMemorySyncRunRepository,
    transactions::InMemoryLedgerStore,
};
use ledgersync_exchanges::{CoinGeckoOracle, DefaultAdapterFactory, PriceSource};
use ledgersync_sync::{OrchestratorConfig, ProgressPublisher, SyncOrchestrator, SyncService};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{config::Config, events::EventBus};

pub struct AppState {
    pub vault: Arc<CredentialVault>,
    pub sync_service: SyncService,
    pub event_bus: EventBus,
}

pub fn init_tracing() {
    let log_format = std::env::var("LS_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let cipher = CredentialCipher::from_encoded_key(&config.secret_key)
        .context("LS_SECRET_KEY is not a valid vault key")?;
    tracing::info!(
        "Credential store in use: {}",
        config.credentials_file.display()
    );
    let store = Arc::new(FileCredentialStore::new(config.credentials_file.clone()));
    let vault = Arc::new(CredentialVault::new(cipher, store));

    // Orchestrator -> broadcast publisher -> SSE bus.
    let event_bus = EventBus::new(config.event_capacity);
    let publisher = ProgressPublisher::new(config.event_capacity);
    publisher.spawn_forwarder(Arc::new(event_bus.clone()));

    let oracle: Arc<dyn PriceSource> =
        Arc::new(CoinGeckoOracle::new(config.coingecko_api_key.clone()));
    let orchestrator = SyncOrchestrator::new(
        vault.clone(),
        Arc::new(DefaultAdapterFactory::new(config.exchange_overrides.clone())),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(publisher),
    )
    .with_config(OrchestratorConfig {
        request_timeout: config.exchange_timeout,
        ..OrchestratorConfig::default()
    })
    .with_price_fallbacks(vec![oracle]);

    Ok(Arc::new(AppState {
        vault,
        sync_service: SyncService::new(Arc::new(orchestrator)),
        event_bus,
    }))
}
