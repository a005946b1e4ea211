use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cli::ServeArgs,
    connection::{self, PumpConfig},
    coordinator::{CoordinatorHandle, Hub},
    store::{CellStore, MemoryStore, SqliteStore, StoreError, TableConfig},
};

/// Commands waiting for a coordinator before inbound pumps start to block.
const EVENT_CAPACITY: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub pump: PumpConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn CellStore>, pump: PumpConfig) -> Self {
        Self {
            hub: Hub::new(store, EVENT_CAPACITY),
            pump,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(new_table))
        .route("/open/:id", get(open_table))
        .route("/connect-ws/:id", get(connect))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(error = %self.0, "request failed");
        let status = match self.0 {
            StoreError::MissingTable(_) => StatusCode::NOT_FOUND,
            StoreError::Address { .. } => StatusCode::BAD_REQUEST,
            StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": status.canonical_reason() }))).into_response()
    }
}

async fn new_table() -> Redirect {
    Redirect::temporary(&format!("/open/{}", Uuid::new_v4()))
}

async fn open_table(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TableConfig>, ApiError> {
    Ok(Json(state.hub.open_table(&id).await?))
}

async fn connect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    match state.hub.table_config(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return ApiError(StoreError::MissingTable(id)).into_response(),
        Err(err) => return ApiError(err).into_response(),
    }

    let Some(upgrade) = upgrade else {
        return (StatusCode::UPGRADE_REQUIRED, "expected a websocket upgrade").into_response();
    };

    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let coordinator = state.hub.coordinator(&id).await;
    let AppState { hub, pump } = state;

    upgrade
        .max_message_size(pump.max_message_size)
        .on_failed_upgrade(move |err| warn!(?peer, error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| hub.track(pump_socket(socket, coordinator, peer, pump)))
}

async fn pump_socket(
    socket: WebSocket,
    coordinator: CoordinatorHandle,
    peer: Option<SocketAddr>,
    pump: PumpConfig,
) {
    let (sink, stream) = socket.split();
    connection::serve(stream, sink, coordinator, peer, pump).await;
}

/// Serves `state` on `listener` until `shutdown` resolves, then closes every
/// connection and waits up to `grace` for coordinators and pumps to stop.
pub async fn run_until<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
    grace: Duration,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let hub = state.hub.clone();
    let app = router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("shutting down; closing connections");
        hub.shutdown(grace).await;
    })
    .await
    .context("http server failed")
}

pub fn open_store(args: &ServeArgs) -> Result<Arc<dyn CellStore>> {
    if args.in_memory() {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::open(&args.database)
        .with_context(|| format!("failed to open {}", args.database.display()))?;
    Ok(Arc::new(store))
}

pub async fn serve(args: ServeArgs) -> Result<()> {
    let store = open_store(&args)?;
    let pump = PumpConfig {
        outbound_capacity: args.outbound_capacity,
        ..PumpConfig::default()
    };

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("listening on {}", listener.local_addr()?);

    run_until(
        listener,
        AppState::new(store, pump),
        shutdown_signal(),
        Duration::from_secs(args.shutdown_grace_secs),
    )
    .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = ?err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
