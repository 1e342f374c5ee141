//! Sync Mediator (spec §4.6): ferries one newcomer's late-join handshake
//! with its chosen donor, independently of the main broadcast pipeline.
//!
//! One mediator task is spawned per non-founding admission. It asks the
//! ticker/pipeline to announce the donor as syncer, waits for that donor's
//! authoritative `sync` reply on its own tap of the ingress mult, and
//! forwards that reply straight into the newcomer's outbound queue — `sync`
//! frames never travel through the topic fan-out (spec §4.5: `:sync` is
//! never populated; routing it there would have gone nowhere anyway since
//! the newcomer hasn't subscribed yet). If the donor goes quiet, the
//! announcement is simply repeated (spec's "Open Question" on whether this
//! is retried is resolved here as: yes, every 2 seconds, forever, until the
//! session or either player ends).

use std::sync::Arc;
use std::time::Duration;

use protocol::Frame;
use tokio::sync::{broadcast, mpsc, watch};

use crate::queue::BoundedQueue;
use crate::session::{SyncNotifier, Tagged};

const RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub async fn spawn_sync_mediator(
    newcomer_slot: u32,
    donor_slot: u32,
    in_tx: broadcast::Sender<Tagged>,
    join_tx: mpsc::UnboundedSender<u32>,
    newcomer_outbound: Arc<BoundedQueue<Frame>>,
    notifier: SyncNotifier,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut tap_b = in_tx.subscribe();
    let mut retry = tokio::time::interval(RETRY_INTERVAL);
    retry.tick().await; // consume the immediate first tick, fired manually below

    let _ = join_tx.send(donor_slot);

    loop {
        tokio::select! {
            biased;
            _ = done_rx.changed() => {
                if *done_rx.borrow() {
                    return;
                }
            }
            _ = retry.tick() => {
                tracing::trace!(newcomer_slot, donor_slot, "re-announcing syncer, no reply yet");
                let _ = join_tx.send(donor_slot);
            }
            res = tap_b.recv() => {
                match res {
                    Ok(tagged) if tagged.slot == donor_slot && tagged.frame.is_sync() => {
                        newcomer_outbound.push(tagged.frame);
                        notifier.mark_synced(newcomer_slot).await;
                        tracing::debug!(newcomer_slot, donor_slot, "sync handoff complete");
                        return;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}
