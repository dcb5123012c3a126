use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use multiplexer::{spawn_multiplexer, HttpFileFetcher, JsonCodec, MultiplexerHandle};
use serde::Deserialize;
use shared::{
    domain::MessageId,
    error::{ApiError, ErrorCode},
    protocol::{ClientEvent, ClientRequest},
};
use storage::Storage;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_database_url};

#[derive(Parser, Debug)]
struct Args {
    /// Address the local websocket endpoint listens on.
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
}

#[derive(Clone)]
struct AppState {
    mux: MultiplexerHandle,
    storage: Storage,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    last_known_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut settings = load_settings();
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(database_url) = args.database_url {
        settings.database_url = database_url;
    }

    let database_url = normalize_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let fetcher = HttpFileFetcher::new(settings.file_fetch_timeout())?;
    let (mux, mux_task) = spawn_multiplexer(
        settings.mux_options(),
        Arc::new(JsonCodec),
        Arc::new(fetcher),
        Arc::new(storage.clone()),
    );

    let app = build_router(Arc::new(AppState {
        mux: mux.clone(),
        storage,
    }));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "daemon listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(error) = mux.shutdown() {
        warn!(%error, "multiplexer already stopped");
    }
    mux_task.await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let last_known_id = q.last_known_id.map(MessageId::new);
    ws.on_upgrade(move |socket| ws_connection(state, socket, last_known_id))
}

/// Bridges one local websocket to a multiplexer session until either side
/// goes away.
async fn ws_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    last_known_id: Option<MessageId>,
) {
    let mut session = match state.mux.attach(last_known_id).await {
        Ok(session) => session,
        Err(error) => {
            warn!(%error, "failed to attach websocket client");
            return;
        }
    };
    let client = session.id;
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = session.events.recv() => {
                let Some(event) = event else { break };
                if !send_event(&mut sender, &event).await {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(ClientRequest::Detach) => break,
                    Ok(request) => {
                        if state.mux.request(client, request).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        debug!(client_id = %client, %error, "malformed client request");
                        let event = ClientEvent::Error(ApiError::new(
                            ErrorCode::Decode,
                            format!("malformed request: {error}"),
                        ));
                        if !send_event(&mut sender, &event).await {
                            break;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    if let Err(error) = state.mux.detach(client) {
        debug!(client_id = %client, %error, "detach after multiplexer stopped");
    }
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &ClientEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(v) => v,
        Err(_) => return true,
    };
    sender.send(Message::Text(text)).await.is_ok()
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
