mod retention;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use socket2::{Domain, Protocol, Socket, Type};
use tower_http::trace::TraceLayer;
use tracing::info;

use ircultra_gateway::connection;
use ircultra_gateway::dispatcher::Dispatcher;
use ircultra_gateway::hub::Hub;
use ircultra_gateway::origin::{self, OriginPolicy};
use ircultra_gateway::wire;
use ircultra_store::Store;

const MOTD: &str = "Welcome to irc-ultra. /help lists commands.";

#[derive(Clone)]
struct ServerState {
    dispatcher: Arc<Dispatcher>,
    origins: Arc<OriginPolicy>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ircultra=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("IRC_SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("IRC_SERVER_PORT")
        .or_else(|_| std::env::var("PORT"))
        .unwrap_or_else(|_| "7001".into())
        .parse()?;
    let state_path = std::env::var("IRC_STATE_PATH")
        .unwrap_or_else(|_| "data/irc-ultra-state.json".into());
    let allowed_origins = std::env::var("IRC_ALLOWED_ORIGINS").unwrap_or_default();
    let retention_days: i64 = std::env::var("RETENTION_DAYS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    // State store + write-behind flusher
    let store = Store::open(&state_path)?;
    let flusher = store.spawn_flusher();

    // Gateway wiring
    let hub = Hub::new();
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), hub, MOTD));

    // Retention sweeper: once at start, then every 6 hours
    tokio::spawn(retention::run_retention_loop(store.clone(), retention_days));

    let state = ServerState {
        dispatcher,
        origins: Arc::new(OriginPolicy::from_list(&allowed_origins)),
    };

    let app = Router::new()
        .route("/gateway", get(gateway_upgrade))
        .route("/webirc", get(webirc_upgrade))
        .route("/healthz", get(healthz))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("irc-ultra gateway listening on {}", addr);
    info!("State file: {}, retention: {} days", state_path, retention_days);

    // Listener via socket2 so accepted connections inherit TCP_NODELAY,
    // keeping small WebSocket frames off Nagle's algorithm.
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(socket.into())?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain pending state before exiting.
    flusher.abort();
    store.shutdown_flush();
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

async fn gateway_upgrade(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ip) = accept_upgrade(&state, &headers, addr) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    ws.on_upgrade(move |socket| connection::handle_connection(socket, state.dispatcher, ip))
        .into_response()
}

async fn webirc_upgrade(
    State(state): State<ServerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ip) = accept_upgrade(&state, &headers, addr) else {
        return StatusCode::FORBIDDEN.into_response();
    };
    ws.on_upgrade(move |socket| wire::handle_connection(socket, state.dispatcher, ip))
        .into_response()
}

/// Origin policy check plus client IP derivation. `None` means refuse.
fn accept_upgrade(
    state: &ServerState,
    headers: &HeaderMap,
    addr: SocketAddr,
) -> Option<String> {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !state.origins.allows(origin) {
        info!("Refusing upgrade from disallowed origin {:?}", origin);
        return None;
    }
    Some(origin::client_ip(headers, addr))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
