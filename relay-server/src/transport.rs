//! Transport Adapter (spec §4.1): turns an accepted TCP or WebSocket
//! connection into a uniform bidirectional stream of [`Frame`]s.
//!
//! Framing: TCP is LF-delimited UTF-8 JSON, one object per line; WebSocket
//! is one JSON object per text/binary frame. A malformed frame is dropped
//! and logged; the connection stays open (spec §7). A write failure closes
//! it.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::Frame;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// One accepted connection, before it has been split into independent
/// reader/writer halves for the per-player tasks.
pub enum Connection {
    Tcp(tokio::net::TcpStream),
    Ws(WebSocket),
}

pub enum ConnReadHalf {
    Tcp(tokio::io::Lines<BufReader<OwnedReadHalf>>),
    Ws(SplitStream<WebSocket>),
}

pub enum ConnWriteHalf {
    Tcp(OwnedWriteHalf),
    Ws(SplitSink<WebSocket, Message>),
}

impl Connection {
    pub fn into_split(self) -> (ConnReadHalf, ConnWriteHalf) {
        match self {
            Connection::Tcp(stream) => {
                let (read_half, write_half) = stream.into_split();
                (
                    ConnReadHalf::Tcp(BufReader::new(read_half).lines()),
                    ConnWriteHalf::Tcp(write_half),
                )
            }
            Connection::Ws(socket) => {
                let (sink, stream) = socket.split();
                (ConnReadHalf::Ws(stream), ConnWriteHalf::Ws(sink))
            }
        }
    }
}

impl ConnReadHalf {
    /// Reads the next decoded frame, silently skipping malformed lines or
    /// frames (logged at warn) until a valid one arrives or the stream
    /// ends.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            let raw = match self {
                ConnReadHalf::Tcp(lines) => match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return None,
                    Err(err) => {
                        tracing::warn!(?err, "TCP read error, closing connection");
                        return None;
                    }
                },
                ConnReadHalf::Ws(stream) => match stream.next().await {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::warn!(?err, "non-UTF8 binary frame dropped");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => continue, // ping/pong, handled by axum
                    Some(Err(err)) => {
                        tracing::warn!(?err, "WebSocket read error, closing connection");
                        return None;
                    }
                },
            };

            if raw.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => match Frame::from_value(value) {
                    Some(frame) => return Some(frame),
                    None => {
                        tracing::warn!(line = %raw, "frame was valid JSON but not an object, dropped");
                    }
                },
                Err(err) => {
                    tracing::warn!(?err, line = %raw, "malformed JSON frame dropped");
                }
            }
        }
    }
}

impl ConnWriteHalf {
    /// Writes one frame. Returns `false` on a write failure (spec §7: the
    /// caller should treat this as a departure).
    pub async fn write_frame(&mut self, frame: &Frame) -> bool {
        let line = frame.to_json_line();
        match self {
            ConnWriteHalf::Tcp(write_half) => {
                let mut bytes = line.into_bytes();
                bytes.push(b'\n');
                write_half.write_all(&bytes).await.is_ok()
            }
            ConnWriteHalf::Ws(sink) => sink.send(Message::Text(line.into())).await.is_ok(),
        }
    }

    pub async fn close(&mut self) {
        match self {
            ConnWriteHalf::Tcp(write_half) => {
                let _ = write_half.shutdown().await;
            }
            ConnWriteHalf::Ws(sink) => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
            }
        }
    }
}
