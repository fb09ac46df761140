//! Tessera target daemon
//!
//! Wires the mountpath registry and the transaction coordinator together,
//! drives the periodic capacity/sweeper ticks, and serves the control-plane
//! HTTP endpoint.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_common::Config;
use tessera_fs::Volume;
use tessera_txn::{BmdOwner, Coordinator, NoopXactions, SmapOwner, Xactions};

mod http;

#[derive(Debug, Parser)]
#[command(name = "tessera-target", about = "Tessera data-bearing target")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Daemon id of this target; generated when omitted
    #[arg(long)]
    daemon_id: Option<String>,

    /// Listen address override
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.net.listen = listen;
    }
    let config = Arc::new(config);

    let daemon_id = args
        .daemon_id
        .unwrap_or_else(|| format!("t{}", uuid::Uuid::new_v4().simple()));

    let vol = Arc::new(Volume::new(&daemon_id));
    let changed = vol
        .init(&config)
        .context("mountpath initialization failed")?;
    info!(
        %daemon_id,
        mountpaths = vol.num_available(),
        vmd_rewritten = changed,
        "volume initialized"
    );

    let bmd = Arc::new(BmdOwner::new());
    let smap = Arc::new(SmapOwner::new());
    let xactions: Arc<dyn Xactions> = Arc::new(NoopXactions);
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        Arc::clone(&vol),
        bmd,
        smap,
        xactions,
    ));

    spawn_tickers(Arc::clone(&coordinator), Arc::clone(&vol), Arc::clone(&config));

    let state = http::AppState {
        coordinator,
        config: Arc::clone(&config),
    };
    let listener = tokio::net::TcpListener::bind(config.net.listen)
        .await
        .with_context(|| format!("binding {}", config.net.listen))?;
    info!(addr = %config.net.listen, "target listening");
    axum::serve(listener, http::router(state))
        .await
        .context("http server failed")?;
    Ok(())
}

fn spawn_tickers(coordinator: Arc<Coordinator>, vol: Arc<Volume>, config: Arc<Config>) {
    // stats tick: capacity refresh on the adaptive schedule
    {
        let vol = Arc::clone(&vol);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.periodic.stats_time());
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let vol = Arc::clone(&vol);
                let config = Arc::clone(&config);
                let res = tokio::task::spawn_blocking(move || {
                    vol.cap_periodic(&config, None).map(|(cs, updated)| {
                        if updated {
                            if let Some(err) = cs.err() {
                                warn!(%err, "capacity watermark crossed");
                            }
                        }
                    })
                })
                .await;
                if let Ok(Err(e)) = res {
                    warn!(%e, "capacity refresh failed");
                }
            }
        });
    }

    // transaction sweeper: expire records abandoned by their proxy
    {
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config.txn.sweep_interval());
            loop {
                tick.tick().await;
                let n = coordinator.transactions().housekeep();
                if n > 0 {
                    warn!(expired = n, "swept abandoned transactions");
                }
            }
        });
    }

    // trash sweeper: remove trashed bucket directories
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.periodic.trash_sweep());
        loop {
            tick.tick().await;
            let vol = Arc::clone(&vol);
            let _ = tokio::task::spawn_blocking(move || vol.sweep_trash()).await;
        }
    });
}
