//! Service entry point: configuration, task wiring, HTTP server, and the
//! ordered shutdown drain.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tickstream_backend::api::{self, AppState};
use tickstream_backend::background::BackgroundTracker;
use tickstream_backend::config::Config;
use tickstream_backend::middleware::limits::{RateLimitConfig, RateLimitLayer};
use tickstream_backend::middleware::ConnectionLimits;
use tickstream_backend::storage::{BufferQuery, PartitionIndex, StorageFormat, TickStore};
use tickstream_backend::stream::Multiplexer;
use tickstream_backend::supervisor::tasks::FnWorker;
use tickstream_backend::supervisor::SessionSupervisor;
use tickstream_backend::upstream::tws::TwsGateway;
use tickstream_backend::upstream::Gateway;

#[derive(Debug, Parser)]
#[command(name = "tickstream", about = "TWS tick streaming and recording service")]
struct Args {
    /// HTTP listen port; overrides HTTP_PORT.
    #[arg(long)]
    http_port: Option<u16>,
    /// Storage root; overrides STORAGE_PATH.
    #[arg(long)]
    storage_path: Option<std::path::PathBuf>,
    /// Gateway host; overrides TWS_HOST.
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(path) = args.storage_path {
        config.storage_path = path;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    let config = Arc::new(config);

    let mut formats = Vec::new();
    if config.enable_json {
        formats.push(StorageFormat::JsonLines);
    }
    if config.enable_binary {
        formats.push(StorageFormat::Binary);
    }

    // Rebuild the partition index from the on-disk tree before anything
    // starts writing.
    let index = Arc::new(PartitionIndex::new());
    index
        .rebuild_from_disk(&config.storage_path, &formats)
        .context("failed to scan storage tree")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (store, _store_task) = TickStore::spawn(
        config.storage_path.clone(),
        formats.clone(),
        index.clone(),
        config.storage_queue_capacity,
        shutdown_rx.clone(),
    );

    let (gateway_events_tx, gateway_events_rx) = mpsc::channel(4096);
    let gateway: Arc<dyn Gateway> = Arc::new(TwsGateway::new(
        gateway_events_tx,
        config.connection_timeout,
    ));

    let mux = Multiplexer::new(
        gateway.clone(),
        store.clone(),
        config.tail_ring_capacity,
        config.max_streams,
    );
    let query = Arc::new(BufferQuery::new(index.clone(), formats));
    query.set_tail_source(mux.clone());

    let tracker = BackgroundTracker::new(mux.clone(), &config.tracked_contracts);
    let supervisor = SessionSupervisor::new(
        gateway.clone(),
        mux.clone(),
        tracker.clone(),
        config.clone(),
    );
    supervisor.start(gateway_events_rx, shutdown_rx.clone());

    // Periodic sweep of idle rate-limit windows.
    let limiter = RateLimitLayer::new(RateLimitConfig::default());
    let sweep_limiter = limiter.clone();
    tickstream_backend::supervisor::tasks::spawn_supervised(
        "rate-limit-sweeper",
        shutdown_rx.clone(),
        FnWorker::new(move |mut shutdown: watch::Receiver<bool>| {
            let limiter = sweep_limiter.clone();
            async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => limiter.cleanup(),
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }),
    );

    let state = AppState {
        config: config.clone(),
        mux: mux.clone(),
        store: store.clone(),
        index,
        query,
        supervisor: supervisor.clone(),
        tracker,
        ws_limits: ConnectionLimits::new(config.max_connections_per_ip),
    };
    let router = api::router(state, limiter);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;
    info!(%addr, "listening");

    let drain_mux = mux.clone();
    let drain_shutdown = shutdown_tx.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received, draining subscribers");
        let _ = drain_shutdown.send(true);
        drain_mux.complete_all_subscribers();
    };

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal);

    let mut grace_rx = shutdown_rx.clone();
    let grace = config.shutdown_grace;
    tokio::select! {
        result = server => result.context("http server failed")?,
        _ = async move {
            loop {
                if *grace_rx.borrow() {
                    break;
                }
                if grace_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            tokio::time::sleep(grace).await;
        } => {
            warn!("grace period elapsed before all connections closed");
        }
    }

    // Subscribers are drained; flush and close storage, then the session.
    store.shutdown().await;
    supervisor.shutdown_session().await;
    let _ = shutdown_tx.send(true);
    info!("shutdown complete");
    Ok(())
}
