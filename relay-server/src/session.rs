//! Game Session (spec §4.5, §4.7): the per-session event pipeline — ingress
//! fan-in, ticker-driven lock stream, topic-filtered fan-out — plus the
//! session-lifetime state machine.
//!
//! The session's mutable state (`roster`, `synced_players`,
//! `next_player_id`, `step`) is owned by exactly one task, which serializes
//! all mutation through a command channel (spec §5's recommended "single
//! task owner" shape — the same idea as the teacher's `AppState`, just
//! without the `Mutex` since there is only ever one reader/writer here).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{Frame, Topic};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use crate::player::{Player, PlayerHandle};
use crate::queue::BoundedQueue;
use crate::sync::spawn_sync_mediator;

/// Window within which a potential donor's `last-seen` must fall for
/// `pick_syncer` to consider it active (spec §4.6).
pub const DONOR_ACTIVE_WINDOW: Duration = Duration::from_millis(2_000);
const IN_MULT_CAPACITY: usize = 1024;
const OUT_BATCH_CAPACITY: usize = 256;
const SUB_COMMAND_CAPACITY: usize = 64;

/// An ingress message tagged with the slot of the player that sent it.
#[derive(Debug, Clone)]
pub struct Tagged {
    pub slot: u32,
    pub frame: Frame,
}

pub struct AdmitOutcome {
    pub slot: u32,
    pub seed: i64,
    pub new_game: bool,
}

enum SessionCommand {
    CanAdmit {
        incoming_max_players: u32,
        reply: oneshot::Sender<bool>,
    },
    Admit {
        player: Player,
        reply: oneshot::Sender<Option<AdmitOutcome>>,
    },
    Remove {
        slot: u32,
    },
    MarkSynced {
        slot: u32,
    },
    IsEmpty {
        reply: oneshot::Sender<bool>,
    },
    Terminate,
}

enum SubCommand {
    Subscribe {
        slot: u32,
        queue: Arc<BoundedQueue<Frame>>,
        topics: Vec<Topic>,
    },
    RemoveAll {
        slot: u32,
    },
}

/// What the dispatcher holds to talk to a live session without touching its
/// internals.
#[derive(Clone)]
pub struct SessionHandle {
    pub game_type: String,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn can_admit(&self, incoming_max_players: u32) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::CanAdmit {
                incoming_max_players,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn admit(&self, player: Player) -> Option<AdmitOutcome> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Admit { player, reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok().flatten()
    }

    pub async fn remove_player(&self, slot: u32) {
        let _ = self.cmd_tx.send(SessionCommand::Remove { slot }).await;
    }

    pub async fn is_empty(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::IsEmpty { reply })
            .await
            .is_err()
        {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    pub async fn terminate(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Terminate).await;
    }
}

struct SyncedEntry {
    handle: PlayerHandle,
}

struct SessionState {
    game_type: String,
    roster: HashMap<u32, PlayerHandle>,
    synced_players: Vec<SyncedEntry>,
    next_player_id: u32,
    step: Arc<AtomicU64>,
    seed: i64,
    step_time: u64,
    in_tx: broadcast::Sender<Tagged>,
    sub_tx: mpsc::Sender<SubCommand>,
    join_tx: mpsc::UnboundedSender<u32>,
    done_tx: watch::Sender<bool>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    epoch: Instant,
}

/// Spawns every task that makes up one game session and returns a handle
/// the dispatcher can admit/remove players through.
pub fn spawn(game_type: String, step_time: u64, epoch: Instant) -> SessionHandle {
    let (in_tx, _) = broadcast::channel::<Tagged>(IN_MULT_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel::<Vec<Frame>>(OUT_BATCH_CAPACITY);
    let (sub_tx, sub_rx) = mpsc::channel::<SubCommand>(SUB_COMMAND_CAPACITY);
    let (join_tx, join_rx) = mpsc::unbounded_channel::<u32>();
    let (done_tx, done_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel::<SessionCommand>(SUB_COMMAND_CAPACITY);
    let step = Arc::new(AtomicU64::new(0));
    let seed: i64 = rand::thread_rng().gen();

    tokio::spawn(fan_out_loop(out_rx, sub_rx, done_rx.clone()));

    if step_time > 0 {
        tokio::spawn(ticker_loop(
            step_time,
            step.clone(),
            join_rx,
            out_tx.clone(),
            done_rx.clone(),
        ));
        tokio::spawn(pipeline_loop_stepped(
            in_tx.subscribe(),
            out_tx.clone(),
            step.clone(),
            done_rx.clone(),
        ));
    } else {
        tokio::spawn(pipeline_loop_stepless(
            in_tx.subscribe(),
            join_rx,
            out_tx.clone(),
            done_rx.clone(),
        ));
    }

    let state = SessionState {
        game_type: game_type.clone(),
        roster: HashMap::new(),
        synced_players: Vec::new(),
        next_player_id: 0,
        step,
        seed,
        step_time,
        in_tx,
        sub_tx,
        join_tx,
        done_tx,
        cmd_tx: cmd_tx.clone(),
        epoch,
    };

    tokio::spawn(session_command_loop(cmd_rx, state));

    SessionHandle { game_type, cmd_tx }
}

async fn session_command_loop(mut cmd_rx: mpsc::Receiver<SessionCommand>, mut state: SessionState) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SessionCommand::CanAdmit {
                incoming_max_players,
                reply,
            } => {
                let ok = donor_available(&state, incoming_max_players);
                let _ = reply.send(ok);
            }
            SessionCommand::Admit { player, reply } => {
                let outcome = admit_player(&mut state, player).await;
                let _ = reply.send(outcome);
            }
            SessionCommand::Remove { slot } => {
                remove_player(&mut state, slot).await;
            }
            SessionCommand::MarkSynced { slot } => {
                mark_synced(&mut state, slot).await;
            }
            SessionCommand::IsEmpty { reply } => {
                let _ = reply.send(state.roster.is_empty());
            }
            SessionCommand::Terminate => {
                let _ = state.done_tx.send(true);
                tracing::info!("session terminated");
                break;
            }
        }
    }
}

fn donor_available(state: &SessionState, incoming_max_players: u32) -> bool {
    (state.roster.len() as u32) < incoming_max_players
        && (state.roster.is_empty() || pick_syncer(&state.synced_players).is_some())
}

/// Uniformly random active donor, or `None` if nobody qualifies (spec §4.6).
fn pick_syncer(synced_players: &[SyncedEntry]) -> Option<PlayerHandle> {
    let active: Vec<&PlayerHandle> = synced_players
        .iter()
        .map(|e| &e.handle)
        .filter(|h| h.is_active(DONOR_ACTIVE_WINDOW))
        .collect();
    if active.is_empty() {
        return None;
    }
    let index = rand::thread_rng().gen_range(0..active.len());
    Some(active[index].clone())
}

async fn admit_player(state: &mut SessionState, player: Player) -> Option<AdmitOutcome> {
    let new_game = state.roster.is_empty();
    let donor = if new_game {
        None
    } else {
        match pick_syncer(&state.synced_players) {
            Some(d) => Some(d),
            None => return None, // donor vanished between can_admit and admit
        }
    };

    let slot = state.next_player_id;
    state.next_player_id += 1;

    let handle = PlayerHandle {
        slot,
        outbound: player.outbound.clone(),
        local_inbound: player.local_inbound_tx.clone(),
        last_seen: player.liveness.last_seen_handle(),
        epoch: state.epoch,
    };
    state.roster.insert(slot, handle.clone());

    tokio::spawn(ingress_forward(
        player.inbound.clone(),
        slot,
        state.in_tx.clone(),
        state.done_tx.subscribe(),
    ));

    let _ = state
        .sub_tx
        .send(SubCommand::Subscribe {
            slot,
            queue: player.outbound.clone(),
            topics: vec![Topic::Lock, Topic::Other],
        })
        .await;

    if new_game {
        let _ = state
            .sub_tx
            .send(SubCommand::Subscribe {
                slot,
                queue: player.outbound.clone(),
                topics: vec![Topic::Join],
            })
            .await;
        state.synced_players.push(SyncedEntry { handle });
        tracing::info!(slot, game_type = %state.game_type, "new session founded");
    } else {
        let donor = donor.expect("checked above");
        tokio::spawn(spawn_sync_mediator(
            slot,
            donor.slot,
            state.in_tx.clone(),
            state.join_tx.clone(),
            player.outbound.clone(),
            state.sync_notifier(),
            state.done_tx.subscribe(),
        ));
    }

    Some(AdmitOutcome {
        slot,
        seed: state.seed,
        new_game,
    })
}

/// A narrowed handle the sync mediator uses to report completion, without
/// exposing the rest of the (private) [`SessionCommand`] surface to it.
#[derive(Clone)]
pub struct SyncNotifier(mpsc::Sender<SessionCommand>);

impl SyncNotifier {
    pub async fn mark_synced(&self, slot: u32) {
        let _ = self.0.send(SessionCommand::MarkSynced { slot }).await;
    }
}

impl SessionState {
    fn sync_notifier(&self) -> SyncNotifier {
        SyncNotifier(self.cmd_tx.clone())
    }
}

async fn remove_player(state: &mut SessionState, slot: u32) {
    if state.roster.remove(&slot).is_none() {
        return; // duplicate departure: idempotent no-op (spec §8)
    }
    state.synced_players.retain(|e| e.handle.slot != slot);
    let _ = state.sub_tx.send(SubCommand::RemoveAll { slot }).await;

    let notice = Frame::disconnected(slot);
    for handle in state.roster.values() {
        handle.local_inbound.send(notice.clone()).ok();
    }
    tracing::debug!(slot, remaining = state.roster.len(), "player departed");
}

async fn mark_synced(state: &mut SessionState, slot: u32) {
    let Some(handle) = state.roster.get(&slot).cloned() else {
        return; // player already departed mid-sync
    };
    let _ = state
        .sub_tx
        .send(SubCommand::Subscribe {
            slot,
            queue: handle.outbound.clone(),
            topics: vec![Topic::Join],
        })
        .await;
    state.synced_players.push(SyncedEntry { handle });
}

/// Forwards one player's decoded frames into the session's ingress mult
/// until either its `inbound` queue closes (the connection departed — spec
/// §5 Cancellation: "closing a player's transport propagates to inbound
/// closure") or the session itself terminates (spec §4.7 Draining ->
/// Terminated).
async fn ingress_forward(
    inbound: Arc<BoundedQueue<Frame>>,
    slot: u32,
    in_tx: broadcast::Sender<Tagged>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => { if *done_rx.borrow() { return; } }
            frame = inbound.recv() => {
                match frame {
                    Some(frame) => { let _ = in_tx.send(Tagged { slot, frame }); }
                    None => return,
                }
            }
        }
    }
}

/// Stepless pipeline (spec §4.5 rule 1): drop heartbeats, flush join
/// announcements as they arrive, no step/lock metadata anywhere.
async fn pipeline_loop_stepless(
    mut tap_a: broadcast::Receiver<Tagged>,
    mut join_rx: mpsc::UnboundedReceiver<u32>,
    out_tx: mpsc::Sender<Vec<Frame>>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => { if *done_rx.borrow() { break; } }
            Some(syncer_slot) = join_rx.recv() => {
                let _ = out_tx.send(vec![Frame::join_announce(syncer_slot)]).await;
            }
            res = tap_a.recv() => {
                match res {
                    Ok(tagged) => {
                        if tagged.frame.is_alive() || tagged.frame.is_sync() {
                            continue;
                        }
                        let mut frame = tagged.frame;
                        frame.stamp_player_id(tagged.slot);
                        let _ = out_tx.send(vec![frame]).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Stepped pipeline (spec §4.5 rule 2): app events are annotated with the
/// current step and forwarded; lock/join are exclusively the ticker's job.
async fn pipeline_loop_stepped(
    mut tap_a: broadcast::Receiver<Tagged>,
    out_tx: mpsc::Sender<Vec<Frame>>,
    step: Arc<AtomicU64>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => { if *done_rx.borrow() { break; } }
            res = tap_a.recv() => {
                match res {
                    Ok(tagged) => {
                        if tagged.frame.is_alive() || tagged.frame.is_sync() {
                            continue;
                        }
                        let mut frame = tagged.frame;
                        frame.stamp_player_id(tagged.slot);
                        frame.stamp_step(step.load(Ordering::Acquire));
                        let _ = out_tx.send(vec![frame]).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// Ticks aligned to `step_time` wall-clock boundaries. Guarantees
/// lock-before-join ordering: a pending join announcement is always
/// batched alongside the lock that closes the step it was queued in.
async fn ticker_loop(
    step_time_ms: u64,
    step: Arc<AtomicU64>,
    mut join_rx: mpsc::UnboundedReceiver<u32>,
    out_tx: mpsc::Sender<Vec<Frame>>,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(step_time_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => { if *done_rx.borrow() { break; } }
            _ = interval.tick() => {
                let lock_step = step.fetch_add(1, Ordering::AcqRel);
                let mut batch = vec![Frame::lock(lock_step)];
                if let Ok(syncer_slot) = join_rx.try_recv() {
                    let mut join_frame = Frame::join_announce(syncer_slot);
                    join_frame.stamp_step(lock_step);
                    batch.push(join_frame);
                }
                let _ = out_tx.send(batch).await;
            }
        }
    }
}

/// Single owner of the topic->subscriber map; routes each emitted batch to
/// the outbound queue of every subscriber for that message's topic.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Overflow;
    use std::sync::atomic::AtomicI64;

    fn handle_with_last_seen(slot: u32, epoch: Instant, last_seen_ms: i64) -> PlayerHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        PlayerHandle {
            slot,
            outbound: Arc::new(BoundedQueue::new(4, Overflow::DropNewest)),
            local_inbound: tx,
            last_seen: Arc::new(AtomicI64::new(last_seen_ms)),
            epoch,
        }
    }

    #[test]
    fn pick_syncer_ignores_donors_outside_the_active_window() {
        let epoch = Instant::now();
        let now = (Instant::now() - epoch).as_millis() as i64;
        let stale = handle_with_last_seen(0, epoch, now - DONOR_ACTIVE_WINDOW.as_millis() as i64 - 500);
        let entries = vec![SyncedEntry { handle: stale }];
        assert!(pick_syncer(&entries).is_none());
    }

    #[test]
    fn pick_syncer_returns_an_active_donor() {
        let epoch = Instant::now();
        let now = (Instant::now() - epoch).as_millis() as i64;
        let fresh = handle_with_last_seen(7, epoch, now);
        let entries = vec![SyncedEntry { handle: fresh }];
        let picked = pick_syncer(&entries).unwrap();
        assert_eq!(picked.slot, 7);
    }

    #[test]
    fn donor_available_false_when_no_synced_player_is_active() {
        let epoch = Instant::now();
        let now = (Instant::now() - epoch).as_millis() as i64;
        let stale = handle_with_last_seen(0, epoch, now - 10_000);
        let mut roster = HashMap::new();
        roster.insert(0u32, handle_with_last_seen(0, epoch, now));
        let state = SessionState {
            game_type: "chess".to_string(),
            roster,
            synced_players: vec![SyncedEntry { handle: stale }],
            next_player_id: 1,
            step: Arc::new(AtomicU64::new(0)),
            seed: 0,
            step_time: 0,
            in_tx: broadcast::channel(8).0,
            sub_tx: mpsc::channel(1).0,
            join_tx: mpsc::unbounded_channel().0,
            done_tx: watch::channel(false).0,
            cmd_tx: mpsc::channel(1).0,
            epoch,
        };
        assert!(!donor_available(&state, 4));
    }

    #[tokio::test]
    async fn joiner_receives_the_founders_sync_reply() {
        let epoch = Instant::now();
        let handle = spawn("chess".to_string(), 0, epoch);

        let founder = Player::new(
            "founder".to_string(),
            protocol::GameInfo {
                game_type: "chess".to_string(),
                max_players: 2,
                step_time: 0,
            },
            epoch,
        );
        let founder_inbound = founder.inbound.clone();
        let founder_outcome = handle.admit(founder).await.expect("founder always admitted");
        assert!(founder_outcome.new_game);

        let joiner = Player::new(
            "joiner".to_string(),
            protocol::GameInfo {
                game_type: "chess".to_string(),
                max_players: 2,
                step_time: 0,
            },
            epoch,
        );
        let joiner_outbound = joiner.outbound.clone();
        let joiner_outcome = handle.admit(joiner).await.expect("joiner admitted via the founder as donor");
        assert!(!joiner_outcome.new_game);

        // The founder is the only possible donor and is asked to act as
        // syncer; once it (acting as the donor client) emits its `sync`
        // reply, the mediator must hand it straight to the joiner.
        let donor_sync_reply = Frame::from_value(serde_json::json!({"msg": "sync", "state": "board"})).unwrap();
        founder_inbound.push(donor_sync_reply);

        let relayed = tokio::time::timeout(Duration::from_secs(3), joiner_outbound.recv())
            .await
            .expect("mediator relays the sync reply before the timeout")
            .expect("queue stays open");
        assert!(relayed.is_sync());
    }
}

async fn fan_out_loop(
    mut out_rx: mpsc::Receiver<Vec<Frame>>,
    mut sub_rx: mpsc::Receiver<SubCommand>,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut subs: HashMap<Topic, Vec<(u32, Arc<BoundedQueue<Frame>>)>> = HashMap::new();
    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => { if *done_rx.borrow() { break; } }
            Some(cmd) = sub_rx.recv() => {
                match cmd {
                    SubCommand::Subscribe { slot, queue, topics } => {
                        for topic in topics {
                            subs.entry(topic).or_default().push((slot, queue.clone()));
                        }
                    }
                    SubCommand::RemoveAll { slot } => {
                        for list in subs.values_mut() {
                            list.retain(|(s, _)| *s != slot);
                        }
                    }
                }
            }
            Some(batch) = out_rx.recv() => {
                for frame in batch {
                    let topic = frame.topic();
                    if let Some(list) = subs.get(&topic) {
                        for (_, queue) in list {
                            queue.push(frame.clone());
                        }
                    }
                }
            }
        }
    }
}
