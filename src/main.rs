use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use microgrid_dispatch::broadcaster::SnapshotBroadcaster;
use microgrid_dispatch::config::{self, Config};
use microgrid_dispatch::confidence::ConfidenceWeights;
use microgrid_dispatch::endpoint::EndpointLink;
use microgrid_dispatch::forecaster::ForecasterConfig;
use microgrid_dispatch::metrics;
use microgrid_dispatch::observer;
use microgrid_dispatch::oracle::OracleClient;
use microgrid_dispatch::tick::{TickLoop, TickLoopConfig};

/// Grace period for draining background tasks on shutdown, per the
/// cancellation policy: stop the timer, issue a best-effort zero-demand
/// dispatch, then give outstanding work a bounded window to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Reference current (amps) used to normalize a source's allocated amps
/// into the `[0,1]` PWM level carried in the dispatch frame.
const DEFAULT_NOMINAL_CURRENT: f32 = 10.0;

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    init_tracing();

    info!("microgrid dispatch controller starting");

    let cfg = Config::from_env().context("failed to load configuration")?;

    if let Some(core) = cfg.pin_core {
        #[cfg(target_os = "linux")]
        if let Some(core_ids) = core_affinity::get_core_ids() {
            if let Some(id) = core_ids.get(core) {
                core_affinity::set_for_current(*id);
                info!("tick loop pinned to core {core}");
            }
        }
    }

    let metrics_handle = metrics::install().context("failed to install metrics recorder")?;

    let endpoint = Arc::new(EndpointLink::spawn(cfg.endpoint_addr.clone()));
    let oracle = Arc::new(OracleClient::new(cfg.oracle_url.clone(), cfg.oracle_timeout));
    let broadcaster = Arc::new(SnapshotBroadcaster::new());

    let observer_addr = cfg.observer_addr;
    let observer_broadcaster = broadcaster.clone();
    tokio::spawn(async move {
        if let Err(e) = observer::serve(observer_addr, observer_broadcaster, metrics_handle).await {
            tracing::error!("observer server exited: {e}");
        }
    });

    let tick_cfg = TickLoopConfig {
        tick_interval: cfg.tick_interval,
        history_capacity: cfg.history_capacity,
        node_stale_after: cfg.node_stale_after,
        forecast_horizon: cfg.forecast_horizon,
        forecaster: ForecasterConfig {
            min_samples: cfg.min_samples,
            fourier_k: cfg.fourier_k,
            fourier_period: cfg.fourier_period,
            variance_window: cfg.variance_window,
        },
        solve_budget: cfg.solve_budget,
        confidence_weights: ConfidenceWeights::default(),
        confidence_threshold: cfg.confidence_threshold,
        sources: cfg.sources.clone(),
        default_nominal_current: DEFAULT_NOMINAL_CURRENT,
    };

    let tick_loop = TickLoop::new(tick_cfg, endpoint.clone(), oracle.clone(), broadcaster.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tick_handle = tokio::spawn(tick_loop.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining background tasks");
    let _ = shutdown_tx.send(true);

    tokio::select! {
        _ = tick_handle => {}
        _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
            tracing::warn!("tick loop did not shut down within grace period");
        }
    }

    info!("microgrid dispatch controller stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "microgrid_dispatch=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
