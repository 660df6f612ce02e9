//! Dev server: the `/crx-hmr` WebSocket channel plus hot module files.

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use super::lock_broker;
use crate::error::CrxResult;
use crate::hmr::{ClientMessage, ConnectionId, HmrBroker, ServerMessage};
use crate::manifest::HMR_DIR;

/// Route of the dev channel.
pub const HMR_PATH: &str = "/crx-hmr";

/// Route prefix serving hot-applied modules to extension pages.
pub const MODULE_PATH: &str = "/@module";

#[derive(Clone)]
struct ServerState {
    broker: Arc<Mutex<HmrBroker>>,
}

pub fn router(broker: Arc<Mutex<HmrBroker>>, out_dir: &Path) -> Router {
    Router::new()
        .route(HMR_PATH, get(hmr_socket))
        .nest_service(MODULE_PATH, ServeDir::new(out_dir.join(HMR_DIR)))
        .route("/health", get(|| async { "OK" }))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ServerState { broker })
}

/// Serve `router` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> CrxResult<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn hmr_socket(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let Some((context, url)) = read_hello(&mut socket).await else {
        return;
    };

    let (tx, mut rx) = unbounded_channel();
    let id = lock_broker(&state.broker).connect(&context, url, tx);

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(message) = outgoing else { break };
                let prune = matches!(message, ServerMessage::Prune { .. });
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text)).await.is_err() || prune {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&state, id, &text),
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Some(id) = id {
        lock_broker(&state.broker).disconnect(id);
    }
}

/// Wait for the `hello` frame that opens every channel.
async fn read_hello(socket: &mut WebSocket) -> Option<(String, Option<String>)> {
    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Hello { context_id, url }) => return Some((context_id, url)),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("Dropping channel with bad handshake: {}", e);
                    return None;
                }
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

fn handle_client_message(state: &ServerState, id: Option<ConnectionId>, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Applied) => {
            if let Some(id) = id {
                lock_broker(&state.broker).applied(id);
            }
        }
        Ok(ClientMessage::Ping) | Ok(ClientMessage::Hello { .. }) => {}
        Err(e) => tracing::debug!("Ignoring malformed client frame: {}", e),
    }
}
