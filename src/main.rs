// =============================================================================
// Borealis Trade Sentinel — Main Entry Point
// =============================================================================
//
// Wires the trade lifecycle core together: durable store, recovery, the two
// live exchange streams, the clock watch, and the observer API. Commands are
// invoked on the trade service by the (external) request layer; this binary
// only hosts the core and its observer surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod binance;
mod clock_watch;
mod errors;
mod notice;
mod runtime_config;
mod trade;
mod types;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::binance::client::BinanceClient;
use crate::binance::exchange_info::ExchangeInfoService;
use crate::binance::trade_stream::TradeStreamManager;
use crate::binance::user_stream::{UserDataStream, UserStreamEvent};
use crate::notice::ClientNoticeService;
use crate::runtime_config::RuntimeConfig;
use crate::trade::service::TradeService;
use crate::trade::store::TradeStore;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Borealis Trade Sentinel starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    if let Ok(dir) = std::env::var("BOREALIS_DATA_DIR") {
        config.data_dir = dir;
    }
    if let Ok(addr) = std::env::var("BOREALIS_BIND_ADDR") {
        config.bind_addr = addr;
    }

    std::fs::create_dir_all(&config.data_dir)?;
    info!(data_dir = %config.data_dir, bind_addr = %config.bind_addr, "configuration ready");

    // ── 2. Durable store ─────────────────────────────────────────────────
    let pool = trade::store::open(&config.database_url()).await.map_err(|e| {
        error!(error = %e, "failed to open trade database");
        anyhow::anyhow!("database open failed: {e}")
    })?;
    let store = TradeStore::new(pool);

    // ── 3. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set - signed requests will fail");
    }
    let client = Arc::new(BinanceClient::new(
        api_key,
        api_secret,
        config.rest_base_url.clone(),
    ));

    // ── 4. Exchange info cache ───────────────────────────────────────────
    let exchange_info = Arc::new(ExchangeInfoService::new(client.clone()));
    if let Err(e) = exchange_info.update().await {
        error!(error = %e, "initial exchange info update failed");
    }
    tokio::spawn(
        exchange_info
            .clone()
            .run_refresh_loop(config.exchange_info_refresh_secs),
    );

    // ── 5. Notices & price streams ───────────────────────────────────────
    let notices = Arc::new(ClientNoticeService::new(64));
    let streams = Arc::new(TradeStreamManager::new(config.ws_base_url.clone()));

    // ── 6. Trade service & recovery ──────────────────────────────────────
    let service = TradeService::new(
        client.clone(),
        store,
        exchange_info,
        notices.clone(),
        streams,
    );

    match service.restore().await {
        Ok(count) => info!(trades = count, "trades restored from store"),
        Err(e) => {
            error!(error = %e, "trade recovery failed");
            return Err(anyhow::anyhow!("recovery failed: {e}"));
        }
    }

    // ── 7. User data stream ──────────────────────────────────────────────
    let user_stream = Arc::new(UserDataStream::new(
        client.clone(),
        config.ws_base_url.clone(),
        config.listen_key_keepalive_secs,
        std::time::Duration::from_millis(config.reconnect_base_delay_ms),
        std::time::Duration::from_millis(config.reconnect_max_delay_ms),
    ));

    let mut user_events = user_stream.subscribe();
    tokio::spawn(user_stream.clone().run());

    let event_service = service.clone();
    tokio::spawn(async move {
        loop {
            match user_events.recv().await {
                Ok(UserStreamEvent::ExecutionReport(report)) => {
                    if let Err(e) = event_service.on_execution_report(&report).await {
                        error!(
                            order_id = report.order_id,
                            error = %e,
                            "failed to apply execution report"
                        );
                    }
                }
                Ok(UserStreamEvent::BalanceUpdate(balances)) => {
                    info!(assets = balances.len(), "balance update received");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Execution reports feed the durable store; losing them
                    // here means exchange-side reconciliation is required.
                    error!(missed, "user stream consumer lagged - events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── 8. Clock watch ───────────────────────────────────────────────────
    tokio::spawn(clock_watch::run_clock_watch(
        client.clone(),
        notices.clone(),
        config.clock_check_secs,
        config.max_clock_skew_ms,
    ));

    // ── 9. Observer API ──────────────────────────────────────────────────
    let api_state = api::ApiState {
        service: service.clone(),
        notices: notices.clone(),
        user_stream: user_stream.clone(),
    };
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let app = api::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind observer API");
        info!(addr = %bind_addr, "observer API listening");
        axum::serve(listener, app)
            .await
            .expect("observer API failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received - stopping gracefully");

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Borealis Trade Sentinel shut down complete.");
    Ok(())
}
