// =============================================================================
// Borealis Market Nexus — Main Entry Point
// =============================================================================
//
// Wires the pipeline together: configuration, the internal bus, the
// supervised connector/engine/poller workers, and the broadcast HTTP
// surface, then waits for Ctrl+C and drains.
//
// Exit codes: 0 normal shutdown, 1 initialization failure, 2 fatal
// supervisor failure.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod book_ticker;
mod broadcaster;
mod bus;
mod candles;
mod config;
mod confirmer;
mod connectors;
mod errors;
mod flow;
mod gap_watcher;
mod normalizer;
mod orderbook;
mod pollers;
mod snapshot_publisher;
mod supervisor;
mod symbols;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::{AppState, PipelineMetrics};
use crate::book_ticker::BookTickerAggregator;
use crate::broadcaster::Broadcaster;
use crate::bus::Bus;
use crate::candles::CandleEngine;
use crate::config::FeedConfig;
use crate::confirmer::{PublishConfirmer, PublishSink};
use crate::connectors::{ConnectorContext, SnapshotFetcher};
use crate::errors::FeedError;
use crate::flow::FlowEngine;
use crate::gap_watcher::DepthGapWatcher;
use crate::orderbook::OrderBookEngine;
use crate::pollers::funding::FundingPoller;
use crate::pollers::insurance::InsurancePoller;
use crate::pollers::liquidation::LiquidationPoller;
use crate::pollers::mark_price::MarkPricePoller;
use crate::pollers::open_interest::OpenInterestPoller;
use crate::snapshot_publisher::SnapshotPublisher;
use crate::supervisor::{BackoffPolicy, Supervisor};

/// Grace period for worker drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Borealis Market Nexus — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = FeedConfig::path_from_env();
    let config = if std::path::Path::new(&config_path).exists() {
        match FeedConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                // A present-but-broken config is a deployment mistake;
                // running on silent defaults would mask it.
                error!(path = %config_path, error = %e, "invalid feed config");
                std::process::exit(1);
            }
        }
    } else {
        warn!(path = %config_path, "config file not found -- using defaults");
        FeedConfig::default()
    };

    if let Err(e) = config.validate() {
        error!(error = %e, "feed config failed validation");
        std::process::exit(1);
    }

    let pairs = config.feed_pairs();
    info!(
        exchanges = config.enabled_exchanges().count(),
        feeds = pairs.len(),
        broadcast_port = config.broadcast_port,
        "feed configuration resolved"
    );

    // ── 2. Shared infrastructure ─────────────────────────────────────────
    let bus = Arc::new(Bus::new(config.subscriber_queue_capacity));
    let metrics = Arc::new(PipelineMetrics::default());
    let supervisor = Arc::new(Supervisor::new());
    let broadcaster = Arc::new(Broadcaster::new(metrics.clone(), &config));
    let confirmer = Arc::new(PublishConfirmer::new(bus.clone() as Arc<dyn PublishSink>));
    let shared_config = Arc::new(config.clone());

    // ── 3. Connector workers, one per (exchange, symbol) ─────────────────
    for exchange_config in config.enabled_exchanges() {
        for symbol in &exchange_config.symbols {
            let name = format!("{}:{}:ws", exchange_config.name, symbol);
            let exchange = exchange_config.name.clone();
            let symbol = symbol.clone();
            let endpoint = exchange_config.ws_endpoint.clone();
            let bus = bus.clone();
            let metrics = metrics.clone();

            supervisor.register(name, BackoffPolicy::default(), move |worker| {
                let ctx = ConnectorContext {
                    bus: bus.clone(),
                    metrics: metrics.clone(),
                    worker,
                };
                let exchange = exchange.clone();
                let symbol = symbol.clone();
                let endpoint = endpoint.clone();
                Box::pin(async move {
                    match exchange.as_str() {
                        "binance" => connectors::binance::run(symbol, endpoint, ctx).await,
                        "bybit" => connectors::bybit::run(symbol, endpoint, ctx).await,
                        "okx" => connectors::okx::run(symbol, endpoint, ctx).await,
                        "hyperliquid" => {
                            connectors::hyperliquid::run(symbol, endpoint, ctx).await
                        }
                        other => {
                            Err(FeedError::Config(format!("unknown exchange {other}")).into())
                        }
                    }
                })
            });
        }
    }

    // ── 4. Engine workers ────────────────────────────────────────────────
    {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("orderbook-engine", BackoffPolicy::default(), move |worker| {
            let engine = OrderBookEngine::new(bus.clone(), metrics.clone(), &cfg);
            Box::pin(engine.run(worker))
        });
    }
    {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("gap-watcher", BackoffPolicy::default(), move |worker| {
            let watcher = DepthGapWatcher::new(bus.clone(), metrics.clone(), &cfg);
            Box::pin(watcher.run(worker))
        });
    }
    {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("candle-engine", BackoffPolicy::default(), move |worker| {
            let engine = Arc::new(CandleEngine::new(bus.clone(), metrics.clone(), &cfg));
            Box::pin(engine.run(worker))
        });
    }
    {
        let bus = bus.clone();
        let cfg = shared_config.clone();
        supervisor.register("book-ticker", BackoffPolicy::default(), move |worker| {
            let aggregator = Arc::new(BookTickerAggregator::new(bus.clone(), &cfg));
            Box::pin(aggregator.run(worker))
        });
    }
    {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("flow-engine", BackoffPolicy::default(), move |worker| {
            let engine = Arc::new(FlowEngine::new(bus.clone(), metrics.clone(), &cfg));
            Box::pin(engine.run(worker))
        });
    }
    {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("snapshot-fetcher", BackoffPolicy::default(), move |worker| {
            let fetcher = SnapshotFetcher::new(bus.clone(), metrics.clone(), &cfg);
            Box::pin(fetcher.run(worker))
        });
    }
    {
        let bus = bus.clone();
        let confirmer = confirmer.clone();
        let cfg = shared_config.clone();
        supervisor.register(
            "snapshot-publisher",
            BackoffPolicy::default(),
            move |worker| {
                let publisher =
                    Arc::new(SnapshotPublisher::new(bus.clone(), confirmer.clone(), &cfg));
                Box::pin(publisher.run(worker))
            },
        );
    }
    {
        let confirmer = confirmer.clone();
        supervisor.register("publish-confirmer", BackoffPolicy::default(), move |worker| {
            Box::pin(confirmer.clone().run(worker))
        });
    }
    {
        let bus = bus.clone();
        let broadcaster = broadcaster.clone();
        supervisor.register("broadcaster", BackoffPolicy::default(), move |worker| {
            Box::pin(broadcaster.clone().run(bus.clone(), worker))
        });
    }

    // ── 5. Poller workers ────────────────────────────────────────────────
    if config.pollers.funding_enabled {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("poller:funding", BackoffPolicy::default(), move |worker| {
            let poller = Arc::new(FundingPoller::new(bus.clone(), metrics.clone(), &cfg));
            Box::pin(poller.run(worker))
        });
    }
    if config.pollers.mark_price_enabled {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("poller:mark_price", BackoffPolicy::default(), move |worker| {
            let poller = Arc::new(MarkPricePoller::new(bus.clone(), metrics.clone(), &cfg));
            Box::pin(poller.run(worker))
        });
    }
    if config.pollers.open_interest_enabled {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register(
            "poller:open_interest",
            BackoffPolicy::default(),
            move |worker| {
                let poller =
                    Arc::new(OpenInterestPoller::new(bus.clone(), metrics.clone(), &cfg));
                Box::pin(poller.run(worker))
            },
        );
    }
    if config.pollers.liquidation_enabled {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register(
            "poller:liquidation",
            BackoffPolicy::default(),
            move |worker| {
                let poller =
                    Arc::new(LiquidationPoller::new(bus.clone(), metrics.clone(), &cfg));
                Box::pin(poller.run(worker))
            },
        );
    }
    if config.pollers.insurance_enabled {
        let bus = bus.clone();
        let metrics = metrics.clone();
        let cfg = shared_config.clone();
        supervisor.register("poller:insurance", BackoffPolicy::default(), move |worker| {
            let poller = Arc::new(InsurancePoller::new(bus.clone(), metrics.clone(), &cfg));
            Box::pin(poller.run(worker))
        });
    }

    // ── 6. Broadcast HTTP surface ────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        bus.clone(),
        metrics.clone(),
        supervisor.clone(),
        broadcaster.clone(),
    ));

    let bind_addr = format!("0.0.0.0:{}", config.broadcast_port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind broadcast port");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "broadcast endpoint listening");

    let app = broadcaster::router(state);
    let mut server_shutdown = supervisor.shutdown_signal();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "broadcast server failed");
        }
    });

    // ── 7. Launch & wait ─────────────────────────────────────────────────
    supervisor.spawn_all();
    info!("all subsystems running -- press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received -- stopping gracefully");
            supervisor.stop(SHUTDOWN_GRACE).await;
            info!("Borealis Market Nexus shut down complete");
        }
        _ = supervisor.wait_fatal() => {
            error!("fatal supervisor failure -- exiting");
            std::process::exit(2);
        }
    }
}
