//! The Player data model (spec §3, §4.2): four queues plus a liveness
//! register, wrapping a single accepted connection.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use protocol::{Frame, GameInfo};
use tokio::sync::mpsc;

use crate::queue::{BoundedQueue, Overflow};

const INBOUND_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 256;

/// A player, from the moment its handshake completes to the moment its
/// transport closes. Cross-task access goes through the `Arc`-shared
/// queues and [`Liveness`] below, never a shared mutable reference to
/// `Player` itself — ownership of the socket stays with the connection
/// task.
pub struct Player {
    /// Server-assigned UUID (spec §3 `id`), distinct from the session-local
    /// `playerId` slot assigned later by the session on admission.
    pub id: String,
    pub game_info: GameInfo,
    /// Client -> session. Capacity 64, drop-oldest: recency over completeness.
    pub inbound: Arc<BoundedQueue<Frame>>,
    /// Session -> client. Capacity 256, drop-newest: a slow client cannot
    /// stall the broadcast.
    pub outbound: Arc<BoundedQueue<Frame>>,
    /// Server-injected events that bypass the session pipeline entirely
    /// (currently just peer-departure notices).
    pub local_inbound_tx: mpsc::UnboundedSender<Frame>,
    pub local_inbound_rx: Option<mpsc::UnboundedReceiver<Frame>>,
    pub liveness: Liveness,
}

impl Player {
    pub fn new(id: String, game_info: GameInfo, epoch: Instant) -> Self {
        let (local_inbound_tx, local_inbound_rx) = mpsc::unbounded_channel();
        Player {
            id,
            game_info,
            inbound: Arc::new(BoundedQueue::new(INBOUND_CAPACITY, Overflow::DropOldest)),
            outbound: Arc::new(BoundedQueue::new(OUTBOUND_CAPACITY, Overflow::DropNewest)),
            local_inbound_tx,
            local_inbound_rx: Some(local_inbound_rx),
            liveness: Liveness::new(epoch),
        }
    }
}

/// The connection task's liveness bookkeeping for one player: `last-seen`
/// (spec §3) plus the terminal `disconnected?` flag, shared by clone between
/// the read loop (which touches it), the idle watchdog (which reads and, on
/// timeout, sets it), and [`crate::session::PlayerHandle`] (which reads
/// `last-seen` to judge donor activity, spec §4.6).
#[derive(Clone)]
pub struct Liveness {
    last_seen: Arc<AtomicI64>,
    disconnected: Arc<AtomicBool>,
    epoch: Instant,
}

impl Liveness {
    fn new(epoch: Instant) -> Self {
        Liveness {
            last_seen: Arc::new(AtomicI64::new(now_millis(epoch))),
            disconnected: Arc::new(AtomicBool::new(false)),
            epoch,
        }
    }

    pub fn last_seen_handle(&self) -> Arc<AtomicI64> {
        self.last_seen.clone()
    }

    /// Records inbound activity; called on every frame the read loop decodes.
    pub fn touch(&self) {
        self.last_seen.store(now_millis(self.epoch), Ordering::Release);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.last_seen.load(Ordering::Acquire);
        let elapsed = now_millis_at(self.epoch, now) - last;
        Duration::from_millis(elapsed.max(0) as u64)
    }

    /// Flips the terminal `disconnected?` flag. Returns `true` the first
    /// time it is called for a given player, `false` on any later call
    /// (idempotent, since departure is only ever processed once).
    pub fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

fn now_millis(epoch: Instant) -> i64 {
    now_millis_at(epoch, Instant::now())
}

fn now_millis_at(epoch: Instant, now: Instant) -> i64 {
    now.saturating_duration_since(epoch).as_millis() as i64
}


/// A handle other tasks (the session, the dispatcher's donor picker) use to
/// reach a live player without holding the connection or the `Player` itself.
#[derive(Clone)]
pub struct PlayerHandle {
    pub slot: u32,
    pub outbound: Arc<BoundedQueue<Frame>>,
    pub local_inbound: mpsc::UnboundedSender<Frame>,
    pub last_seen: Arc<AtomicI64>,
    pub epoch: Instant,
}

impl PlayerHandle {
    /// "Active" per spec §4.6: `last-seen` within the active window.
    pub fn is_active(&self, window: Duration) -> bool {
        let now = now_millis(self.epoch);
        let last = self.last_seen.load(Ordering::Acquire);
        (now - last).max(0) as u64 <= window.as_millis() as u64
    }
}
