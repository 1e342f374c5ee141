//! Wiring for the relay server: a dispatcher, a raw-TCP listener, an
//! axum WebSocket listener, and the diagnostics-only echo port and
//! `/sessions` endpoint from SPEC_FULL §B.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod player;
pub mod queue;
pub mod session;
pub mod sync;
pub mod transport;

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::config::Args;
use crate::dispatcher::{Dispatcher, SessionSummary};
use crate::transport::Connection;

#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
    args: Args,
    epoch: Instant,
}

/// Starts every listener described by `args` and runs until one of them
/// fails to bind. Each accepted connection is handled on its own task, so
/// this function itself never returns under normal operation.
pub async fn run(args: Args) -> io::Result<()> {
    let epoch = Instant::now();
    let dispatcher = dispatcher::spawn(epoch);

    let tcp_listener = TcpListener::bind(("0.0.0.0", args.tcp_port)).await?;
    tracing::info!(port = args.tcp_port, "listening for raw TCP relay connections");

    let echo_listener = TcpListener::bind(("0.0.0.0", args.echo_port)).await?;
    tracing::info!(port = args.echo_port, "listening for auxiliary echo connections");

    let ws_listener = TcpListener::bind(("0.0.0.0", args.ws_port)).await?;
    tracing::info!(port = args.ws_port, "listening for WebSocket relay connections");

    let state = AppState {
        dispatcher: dispatcher.clone(),
        args: args.clone(),
        epoch,
    };
    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/sessions", get(sessions_handler))
        .with_state(state);

    tokio::spawn(echo_loop(echo_listener));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(ws_listener, app).await {
            tracing::error!(?err, "WebSocket listener exited");
        }
    });

    tcp_accept_loop(tcp_listener, dispatcher, args, epoch).await
}

async fn tcp_accept_loop(
    listener: TcpListener,
    dispatcher: Dispatcher,
    args: Args,
    epoch: Instant,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "accepted TCP connection");
        let dispatcher = dispatcher.clone();
        let args = args.clone();
        tokio::spawn(async move {
            let (reader, writer) = Connection::Tcp(stream).into_split();
            connection::handle(reader, writer, dispatcher, args, epoch).await;
        });
    }
}

/// Diagnostic-only line-echo listener (SPEC_FULL §B), entirely outside the
/// relay protocol: whatever a client sends back verbatim, one line at a
/// time. Exists so operators have a trivial way to confirm the process is
/// alive on the network without speaking the relay's JSON vocabulary.
async fn echo_loop(listener: TcpListener) {
    loop {
        let Ok((mut stream, peer)) = listener.accept().await else {
            continue;
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let n = match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        });
        tracing::trace!(%peer, "echo connection closed");
    }
}

/// Spec §6: upgrade requests must offer the `binary` subprotocol; a request
/// that doesn't is rejected with HTTP 400 before the socket ever upgrades.
fn offers_binary_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').map(str::trim).any(|p| p == "binary"))
}

async fn websocket_handler(
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    if !offers_binary_subprotocol(&headers) {
        tracing::warn!("WebSocket upgrade rejected: missing `binary` subprotocol offer");
        return (
            StatusCode::BAD_REQUEST,
            "Sec-WebSocket-Protocol: binary is required",
        )
            .into_response();
    }

    ws.protocols(["binary"])
        .on_upgrade(move |socket| async move {
            let (reader, writer) = Connection::Ws(socket).into_split();
            connection::handle(reader, writer, state.dispatcher, state.args, state.epoch).await;
        })
        .into_response()
}

/// Lists every live session's game type, for operators (SPEC_FULL §B,
/// modeled on the teacher's `enlist_handler`). Not part of the wire
/// protocol and not covered by the spec's invariants.
async fn sessions_handler(State(state): State<AppState>) -> axum::Json<Vec<SessionSummary>> {
    axum::Json(state.dispatcher.snapshot().await)
}
