//! Per-connection lifecycle: handshake, dispatch, then the reader/writer/
//! watchdog task-triple that carries one player for as long as its
//! transport lives.
//!
//! Directly modeled on the teacher's `handle_server_logic`/
//! `handle_client_logic` split in `processing_module.rs`: three tasks race
//! in a `select!`, whichever finishes first (a closed socket, a write
//! failure, an idle timeout) tears down the other two.

use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::Frame;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Args;
use crate::dispatcher::Dispatcher;
use crate::player::Liveness;
use crate::queue::BoundedQueue;
use crate::transport::{ConnReadHalf, ConnWriteHalf};

/// Drives one accepted connection end to end. Never returns an error: every
/// failure mode is a connection closing, which is normal operation here.
pub async fn handle(
    mut reader: ConnReadHalf,
    mut writer: ConnWriteHalf,
    dispatcher: Dispatcher,
    args: Args,
    epoch: Instant,
) {
    let player_id = Uuid::new_v4().to_string();

    let mut player = match crate::handshake::perform(player_id.clone(), &mut reader, &mut writer, epoch).await {
        Some(player) => player,
        None => {
            tracing::debug!(%player_id, "connection closed before handshake completed");
            writer.close().await;
            return;
        }
    };

    let mut local_inbound_rx = player
        .local_inbound_rx
        .take()
        .expect("Player::new always sets local_inbound_rx");
    let inbound = player.inbound.clone();
    let outbound = player.outbound.clone();
    let liveness = player.liveness.clone();

    let Some(admitted) = dispatcher.admit(player).await else {
        tracing::warn!(%player_id, "session admission failed");
        inbound.close();
        writer.close().await;
        return;
    };

    let slot = admitted.outcome.slot;
    let welcome = Frame::admission(admitted.outcome.new_game, slot, admitted.outcome.seed);
    if !writer.write_frame(&welcome).await {
        inbound.close();
        admitted.handle.remove_player(slot).await;
        return;
    }

    tracing::info!(%player_id, slot, new_game = admitted.outcome.new_game, "player admitted to session");

    let idle_timeout = Duration::from_millis(args.idle_timeout_ms);
    let watchdog_interval = Duration::from_millis(args.watchdog_interval_ms);

    tokio::select! {
        _ = read_loop(&mut reader, &inbound, &liveness) => {}
        _ = write_loop(&mut writer, outbound, &mut local_inbound_rx) => {}
        _ = watchdog_loop(&liveness, idle_timeout, watchdog_interval) => {}
    }

    // Whichever branch above won, the player's transport has ended: flip
    // the terminal flag and close `inbound` so the session's
    // `ingress_forward` task (spec §5 Cancellation) stops awaiting it
    // forever instead of leaking.
    liveness.mark_disconnected();
    inbound.close();
    writer.close().await;
    admitted.handle.remove_player(slot).await;
    tracing::info!(%player_id, slot, "player departed");
}

/// Pulls frames off the socket and into the session's inbound queue until
/// the connection closes. `alive` frames still count as activity even
/// though the session pipeline drops them before broadcast.
async fn read_loop(reader: &mut ConnReadHalf, inbound: &Arc<BoundedQueue<Frame>>, liveness: &Liveness) {
    while let Some(frame) = reader.read_frame().await {
        liveness.touch();
        inbound.push(frame);
    }
}

/// Drains both the session's outbound queue and server-injected local
/// events (peer-departure notices) onto the socket.
async fn write_loop(
    writer: &mut ConnWriteHalf,
    outbound: Arc<BoundedQueue<Frame>>,
    local_inbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(frame) => {
                        if !writer.write_frame(&frame).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
            frame = local_inbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if !writer.write_frame(&frame).await {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Force-closes a connection that has gone quiet for longer than
/// `idle_timeout` (spec §7).
async fn watchdog_loop(liveness: &Liveness, idle_timeout: Duration, check_interval: Duration) {
    let mut interval = tokio::time::interval(check_interval);
    loop {
        interval.tick().await;
        if liveness.is_disconnected() {
            return;
        }
        if liveness.idle_for(Instant::now()) >= idle_timeout {
            tracing::info!("connection idle, closing");
            liveness.mark_disconnected();
            return;
        }
    }
}
