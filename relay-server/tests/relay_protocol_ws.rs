//! Same admission flow as `relay_protocol.rs`, but over the WebSocket
//! transport, confirming the two transports are interchangeable from a
//! client's point of view (spec §4.1).

mod support;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

#[tokio::test]
async fn solo_player_founds_a_session_over_websocket() {
    support::start(19221, 19222, 19220).await;

    let mut request = format!("ws://127.0.0.1:{}/ws", 19222)
        .into_client_request()
        .expect("valid request");
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "binary".parse().unwrap());

    let (mut ws, _response) = connect_async(request)
        .await
        .expect("websocket upgrade succeeds");

    let welcome = recv(&mut ws).await;
    assert_eq!(welcome["msg"], "Welcome!");

    ws.send(Message::Text(
        json!({"gameType": "demo-ws", "maxPlayers": 2, "stepTime": 0}).to_string().into(),
    ))
    .await
    .expect("send handshake");

    let admission = recv(&mut ws).await;
    assert_eq!(admission["join"], true);
    assert_eq!(admission["newGame"], true);
    assert_eq!(admission["playerId"], 0);
}

#[tokio::test]
async fn upgrade_without_the_binary_subprotocol_is_rejected_with_400() {
    support::start(19231, 19232, 19230).await;

    // No Sec-WebSocket-Protocol header at all: the plain `into_client_request`
    // omits it, matching spec §6's "failures respond with HTTP 400".
    let request = format!("ws://127.0.0.1:{}/ws", 19232)
        .into_client_request()
        .expect("valid request");

    let err = connect_async(request)
        .await
        .expect_err("upgrade must be rejected without the `binary` subprotocol offer");

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("expected an HTTP error response, got {other:?}"),
    }
}

async fn recv(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("message arrives before the timeout")
            .expect("stream is not closed")
            .expect("no transport error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON"),
            Message::Binary(bytes) => {
                return serde_json::from_slice(&bytes).expect("valid JSON");
            }
            _ => continue, // ping/pong etc
        }
    }
}
