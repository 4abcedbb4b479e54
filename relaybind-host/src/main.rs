// relaybind host: drives the dispatch pump against the loopback queue with a simulated
// native service, for exercising the binding end to end.

mod config;
mod simulate;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use relaybind_core::protocol::LobbyCreated;
use relaybind_core::{LoopbackNative, PipeSession, PumpStats};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::simulate::NativeService;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("relaybind-host {}", VERSION);
            return Ok(());
        }
    }

    let (cfg, config_problem) = config::load();
    init_tracing(&cfg.log_level);
    if let Some(err) = config_problem {
        warn!("config file ignored, using defaults: {err:#}");
    }
    info!(version = VERSION, ?cfg, "starting");

    let native = Arc::new(LoopbackNative::new());
    let pipe = native.create_pipe();
    let session = Arc::new(PipeSession::new(native.clone(), pipe));
    subscribe_logging(&session);
    let service = Arc::new(NativeService::new(native.clone(), pipe, cfg.failure_every));

    let rt = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    rt.block_on(async {
        let (stop_tx, stop_rx) = watch::channel(false);

        let pump = tokio::spawn(run_pump(
            session.clone(),
            Duration::from_millis(cfg.pump_interval_ms),
            stop_rx.clone(),
        ));
        let sim = tokio::spawn(simulate::run(
            service.clone(),
            Duration::from_millis(cfg.sim_interval_ms),
            stop_rx.clone(),
        ));
        let demo = tokio::spawn(run_demo(session.clone(), service.clone(), cfg.demo_requests));

        if cfg.run_seconds > 0 {
            tokio::select! {
                r = shutdown_signal() => r?,
                _ = tokio::time::sleep(Duration::from_secs(cfg.run_seconds)) => {
                    info!(secs = cfg.run_seconds, "run time elapsed");
                }
            }
        } else {
            shutdown_signal().await?;
        }

        info!("shutting down");
        let _ = stop_tx.send(true);
        demo.abort();
        let totals = pump.await.context("pump task")?;
        sim.await.context("native service task")?;
        info!(
            records = totals.records,
            completions = totals.completions,
            stale = totals.stale_completions,
            delivered = totals.delivered,
            unhandled = totals.unhandled,
            unknown = totals.unknown,
            "pump totals"
        );
        anyhow::Ok(())
    })?;

    let counters = native.counters(pipe);
    info!(
        pending = session.pending_calls(),
        frames = counters.frames,
        pops = counters.pops,
        releases = counters.releases,
        "stopped"
    );
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

fn subscribe_logging(session: &PipeSession) {
    session.utils().relay_network_status.subscribe(|s| {
        info!(avail = ?s.availability(), msg = s.debug_msg(), "relay network status");
    });
    session.sockets().authentication_status.subscribe(|s| {
        info!(avail = ?s.availability(), msg = s.debug_msg(), "authentication status");
    });
    session.messages().session_request.subscribe(|r| {
        info!(peer = ?r.identity_remote.steam_id(), "session request");
    });
}

/// Pump the session every `interval` until `stop` flips. Returns accumulated stats.
async fn run_pump(
    session: Arc<PipeSession>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> PumpStats {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut totals = PumpStats::default();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = session.run_callbacks();
                if stats.records > 0 {
                    debug!(?stats, "pump");
                }
                totals.accumulate(&stats);
            }
            _ = stop.changed() => break,
        }
    }
    // Drain whatever the service queued before it stopped.
    totals.accumulate(&session.run_callbacks());
    totals
}

/// Issue `count` lobby requests and await each through a oneshot fed by its continuation.
async fn run_demo(session: Arc<PipeSession>, service: Arc<NativeService>, count: u32) {
    for i in 0..count {
        let Some(task) = session.issue::<LobbyCreated, _>(|| service.create_lobby()) else {
            warn!(request = i, "lobby request did not start");
            continue;
        };
        let handle = task.handle();
        let (tx, rx) = oneshot::channel();
        task.attach_continuation(move |result| {
            let _ = tx.send(result);
        });
        match rx.await {
            Ok(Some(lobby)) => info!(%handle, lobby = lobby.lobby_id, "lobby created"),
            Ok(None) => warn!(%handle, "lobby request failed"),
            Err(_) => warn!(%handle, "continuation dropped without result"),
        }
    }
    info!(requests = count, "demo finished");
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}
