// =============================================================================
// Live Candles: Main Entry Point
// =============================================================================
//
// Streams ticks for the configured instruments, builds candles and logs
// closes and pattern alerts until Ctrl+C.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use live_candles::broker::{BackfillFetcher, BrokerRestClient, DataSource};
use live_candles::clock::SystemClock;
use live_candles::feed::{ConnectionEvent, DriverExit, PollingTransport, SubscriptionManager, WsTransport};
use live_candles::{CandleHandlers, CandlePipeline, PipelineConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Pause before re-running a driver that exhausted its reconnect attempts.
const RESTART_AFTER_EXHAUSTION: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Live Candles — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("LIVE_CANDLES_CONFIG").unwrap_or_else(|_| "live_candles.json".to_string());
    let mut config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        PipelineConfig::default()
    });

    if let Ok(list) = std::env::var("LIVE_CANDLES_INSTRUMENTS") {
        config.override_instruments(&list);
    }
    if config.instruments.is_empty() {
        anyhow::bail!("no instruments configured");
    }

    info!(
        instruments = ?config.instruments,
        interval = %config.interval,
        max_history = config.max_history_length,
        "Configured candle series"
    );

    // ── 2. Broker client ─────────────────────────────────────────────────
    let access_token = std::env::var("BROKER_ACCESS_TOKEN").unwrap_or_default();
    if access_token.is_empty() {
        warn!("BROKER_ACCESS_TOKEN is not set — history and quote requests will be rejected");
    }
    let broker: Arc<dyn DataSource> =
        Arc::new(BrokerRestClient::new(&access_token, &config.broker_base_url)?);

    // ── 3. Tick feed ─────────────────────────────────────────────────────
    let (feed, mut driver) = if config.uses_polling() {
        info!(poll_ms = config.poll_interval_ms, "Using REST polling feed");
        SubscriptionManager::new(
            PollingTransport::new(broker.clone(), Duration::from_millis(config.poll_interval_ms)),
            config.reconnect.clone(),
        )
    } else {
        info!(url = %config.feed_url, "Using WebSocket feed");
        SubscriptionManager::new(WsTransport::new(config.feed_url.clone()), config.reconnect.clone())
    };

    feed.on_connection_event(|event| match event {
        ConnectionEvent::Connected => info!("Tick feed connected"),
        ConnectionEvent::Disconnected { reason } => warn!(%reason, "Tick feed disconnected"),
        ConnectionEvent::ReconnectScheduled { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Tick feed reconnect scheduled")
        }
        ConnectionEvent::Exhausted { attempts } => {
            error!(attempts, "Tick feed reconnect attempts exhausted")
        }
    });

    // ── 4. Pipeline & subscriptions ──────────────────────────────────────
    let backfill = Arc::new(BackfillFetcher::new(broker, Arc::new(SystemClock), config.backfill));
    let pipeline = CandlePipeline::new(feed, backfill, config.max_history_length);
    pipeline.on_backfill_error(|e| warn!(error = %e, "Backfill unavailable"));

    let mut subscriptions = Vec::with_capacity(config.instruments.len());
    for instrument in &config.instruments {
        let handlers = CandleHandlers::new()
            .on_update(|update| {
                if let Some(closed) = update.closed {
                    info!(
                        instrument = %update.instrument_key,
                        interval = %update.interval,
                        open = closed.open,
                        high = closed.high,
                        low = closed.low,
                        close = closed.close,
                        volume = closed.volume,
                        "Candle closed"
                    );
                }
            })
            .on_pattern(|event| {
                info!(
                    instrument = %event.instrument_key,
                    pattern = %event.name,
                    candle = event.at_candle_timestamp,
                    "Pattern alert"
                );
            });
        subscriptions.push(pipeline.subscribe_candles(instrument, config.interval, handlers));
    }

    // ── 5. Run the feed driver ───────────────────────────────────────────
    let mut feed_task = tokio::spawn(async move {
        loop {
            match driver.run().await {
                DriverExit::Shutdown => break,
                DriverExit::Exhausted { attempts } => {
                    warn!(
                        attempts,
                        restart_in_secs = RESTART_AFTER_EXHAUSTION.as_secs(),
                        "Feed driver stopped; restarting later"
                    );
                    tokio::time::sleep(RESTART_AFTER_EXHAUSTION).await;
                }
            }
        }
    });

    info!("Live Candles is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received — unsubscribing");
    drop(subscriptions);
    drop(pipeline);
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut feed_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Feed task ended abnormally"),
        Err(_) => {
            warn!("Feed task did not stop in time — aborting");
            feed_task.abort();
        }
    }
    info!("Live Candles stopped.");
    Ok(())
}
