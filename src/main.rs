//! Courtside Link binary entrypoint wiring the sync node, its stores, the LAN transport and
//! the local HTTP bridge.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courtside_link::{
    config::AppConfig,
    dao::{
        game_store::{GameStore, file::JsonFileGameStore},
        trust_store::JsonTrustStore,
    },
    routes,
    services::{
        node::{self, NodeParts, NodeSettings},
        transport::NetworkLink,
    },
    state::{AppState, SharedState, identity::DeviceIdentity},
    time_source::{SystemClock, WallClock},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let identity = config.load_identity().context("loading device identity")?;
    info!(device = %identity, role = %config.local_role, "starting courtside link");

    let clock: Arc<dyn WallClock> = Arc::new(SystemClock);
    let game_store: Arc<dyn GameStore> = Arc::new(JsonFileGameStore::new(config.games_dir()));
    let trust_store = Arc::new(JsonTrustStore::new(&config.data_dir));
    let link = open_link(&config, identity.clone()).await?;

    let (node, node_task) = node::spawn(NodeParts {
        identity,
        role: config.local_role,
        settings: NodeSettings::from(&config),
        clock: clock.clone(),
        trust_store,
        game_store: game_store.clone(),
        link,
    });
    node.enable().await.context("enabling connectivity")?;

    let app_state = AppState::new(node, game_store, clock);
    let app = build_router(app_state.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.http_port));
    info!(%addr, "starting HTTP bridge");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    if let Err(err) = app_state.node().disable().await {
        warn!(error = %err, "failed to disable connectivity on shutdown");
    }
    // the node exits once its last handle is gone
    drop(app_state);
    node_task.await.context("joining sync node")?;

    Ok(())
}

#[cfg(feature = "lan")]
async fn open_link(config: &AppConfig, identity: DeviceIdentity) -> anyhow::Result<NetworkLink> {
    courtside_link::net::lan::LanNetwork::start(identity, config.lan)
        .await
        .context("starting LAN transport")
}

#[cfg(not(feature = "lan"))]
async fn open_link(_config: &AppConfig, identity: DeviceIdentity) -> anyhow::Result<NetworkLink> {
    warn!("built without LAN transport; no peer will ever be discovered");
    let network = courtside_link::net::memory::LocalNetwork::new();
    Ok(network.join(identity))
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
