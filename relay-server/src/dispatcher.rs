//! Dispatcher (spec §4.4): routes each handshake-complete player into a
//! session matching its `gameType`, creating a new one when no existing
//! session both matches and has room.
//!
//! Generalizes the teacher's `AppState` room map (`lobby.rs`): there, one
//! `Mutex<HashMap<...>>` guarded rooms directly and every handler locked it.
//! Here the map itself has a single owner task and callers go through a
//! command channel instead — the same "one owner, no lock" shape the rest
//! of this crate uses, just applied at the admission layer too.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::player::Player;
use crate::session::{self, AdmitOutcome, SessionHandle};

const DISPATCH_QUEUE_CAPACITY: usize = 256;
const REAP_INTERVAL: Duration = Duration::from_secs(5);

pub struct AdmitResult {
    pub handle: SessionHandle,
    pub outcome: AdmitOutcome,
}

/// A snapshot row for the `/sessions` introspection endpoint (SPEC_FULL §B).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub game_type: String,
    pub session_index: usize,
}

enum DispatcherCommand {
    Admit {
        player: Player,
        reply: oneshot::Sender<Option<AdmitResult>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    cmd_tx: mpsc::Sender<DispatcherCommand>,
}

impl Dispatcher {
    /// Finds or creates a session for `player` and admits it, returning the
    /// session handle the connection task will route traffic through.
    pub async fn admit(&self, player: Player) -> Option<AdmitResult> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(DispatcherCommand::Admit { player, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(DispatcherCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Spawns the dispatcher task and the dead-session reaper alongside it.
pub fn spawn(epoch: Instant) -> Dispatcher {
    let (cmd_tx, cmd_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
    tokio::spawn(dispatcher_loop(cmd_rx, epoch));
    Dispatcher { cmd_tx }
}

async fn dispatcher_loop(mut cmd_rx: mpsc::Receiver<DispatcherCommand>, epoch: Instant) {
    let mut sessions: HashMap<String, Vec<SessionHandle>> = HashMap::new();
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = reap.tick() => {
                reap_empty_sessions(&mut sessions).await;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    None => break,
                    Some(DispatcherCommand::Admit { player, reply }) => {
                        let result = admit(&mut sessions, player, epoch).await;
                        let _ = reply.send(result);
                    }
                    Some(DispatcherCommand::Snapshot { reply }) => {
                        let rows = sessions
                            .iter()
                            .flat_map(|(game_type, handles)| {
                                handles.iter().enumerate().map(move |(i, _)| SessionSummary {
                                    game_type: game_type.clone(),
                                    session_index: i,
                                })
                            })
                            .collect();
                        let _ = reply.send(rows);
                    }
                }
            }
        }
    }
}

/// Drops and terminates any session left with zero players (SPEC_FULL §B:
/// modeled on the teacher's `cleanup_dead_rooms`, run far more often here
/// since emptiness is cheap to detect and sessions hold real tasks/memory).
async fn reap_empty_sessions(sessions: &mut HashMap<String, Vec<SessionHandle>>) {
    for (game_type, bucket) in sessions.iter_mut() {
        let mut kept = Vec::with_capacity(bucket.len());
        for handle in bucket.drain(..) {
            if handle.is_empty().await {
                handle.terminate().await;
                tracing::debug!(%game_type, "reaped empty session");
            } else {
                kept.push(handle);
            }
        }
        *bucket = kept;
    }
    sessions.retain(|_, bucket| !bucket.is_empty());
}

async fn admit(
    sessions: &mut HashMap<String, Vec<SessionHandle>>,
    player: Player,
    epoch: Instant,
) -> Option<AdmitResult> {
    let game_type = player.game_info.game_type.clone();
    let incoming_max_players = player.game_info.max_players;
    let step_time = player.game_info.step_time;

    let bucket = sessions.entry(game_type.clone()).or_default();

    // Literal spec wording (§4.4): capacity is checked against the
    // ARRIVING player's own stated max-players, not the session's stored
    // value. In practice the two always agree since every session's
    // capacity is set by its founding player, but we follow the letter.
    let mut candidate = None;
    for handle in bucket.iter() {
        if handle.can_admit(incoming_max_players).await {
            candidate = Some(handle.clone());
            break;
        }
    }

    if let Some(handle) = candidate {
        // A lost race (the chosen donor went idle between the probe above
        // and the admit below) surfaces as None here; we don't retry other
        // sessions for this rare window, the client just sees the join
        // fail and may reconnect.
        return handle
            .admit(player)
            .await
            .map(|outcome| AdmitResult { handle, outcome });
    }

    let handle = session::spawn(game_type, step_time, epoch);
    let outcome = handle.admit(player).await?;
    bucket.push(handle.clone());
    Some(AdmitResult { handle, outcome })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::GameInfo;
    use std::time::Instant;

    fn player(id: &str, game_type: &str, max_players: u32, step_time: u64, epoch: Instant) -> Player {
        Player::new(
            id.to_string(),
            GameInfo {
                game_type: game_type.to_string(),
                max_players,
                step_time,
            },
            epoch,
        )
    }

    #[tokio::test]
    async fn founder_starts_a_new_session_and_second_player_joins_it() {
        let epoch = Instant::now();
        let dispatcher = spawn(epoch);

        let founder = dispatcher
            .admit(player("p1", "chess", 2, 0, epoch))
            .await
            .expect("founder is always admitted");
        assert!(founder.outcome.new_game);
        assert_eq!(founder.outcome.slot, 0);

        let joiner = dispatcher
            .admit(player("p2", "chess", 2, 0, epoch))
            .await
            .expect("second player joins the existing session");
        assert!(!joiner.outcome.new_game);
        assert_eq!(joiner.outcome.slot, 1);

        // Only one session was created; the joiner landed in the founder's.
        let snapshot = dispatcher.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].game_type, "chess");
    }

    #[tokio::test]
    async fn different_game_types_never_share_a_session() {
        let epoch = Instant::now();
        let dispatcher = spawn(epoch);

        let chess = dispatcher.admit(player("p1", "chess", 4, 0, epoch)).await.unwrap();
        let go = dispatcher.admit(player("p2", "go", 4, 0, epoch)).await.unwrap();

        assert!(chess.outcome.new_game);
        assert!(go.outcome.new_game);

        let snapshot = dispatcher.snapshot().await;
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn a_full_session_spills_over_into_a_new_one() {
        let epoch = Instant::now();
        let dispatcher = spawn(epoch);

        let first = dispatcher.admit(player("p1", "go", 1, 0, epoch)).await.unwrap();
        assert!(first.outcome.new_game);

        // max-players is 1: the session is already full, so the second
        // player must found a session of its own rather than join it.
        let second = dispatcher.admit(player("p2", "go", 1, 0, epoch)).await.unwrap();
        assert!(second.outcome.new_game);
        assert_eq!(second.outcome.slot, 0);
    }
}
