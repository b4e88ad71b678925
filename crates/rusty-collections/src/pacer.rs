// File: rusty-collections/src/pacer.rs
// Purpose: Per-key accumulation of paced updates

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::delta::Delta;
use crate::error::CollectionError;

/// Outcome of sending one paced round: when the RPC was issued.
pub(crate) type RoundResult = Result<DateTime<Utc>, CollectionError>;

/// Pending outgoing delta for one key, shared by every caller in its window.
pub(crate) struct PendingRound {
    key: String,
    seq: u64,
    delta: Delta,
    waiters: Vec<oneshot::Sender<RoundResult>>,
    timer: Option<JoinHandle<()>>,
    /// Completion of the previous round for the same key.
    after: Option<oneshot::Receiver<()>>,
    /// Dropped once this round's RPC has finished.
    done: oneshot::Sender<()>,
}

impl PendingRound {
    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn delta(&self) -> &Delta {
        &self.delta
    }

    /// Wait until the previous round for this key has been sent.
    pub(crate) async fn wait_turn(&mut self) {
        if let Some(previous) = self.after.as_mut() {
            // A dropped sender means that round finished or was abandoned.
            let _ = previous.await;
            self.after = None;
        }
    }

    /// Report the round's outcome to every caller that joined it and let
    /// the next round for the key go.
    pub(crate) fn settle(self, result: &RoundResult) -> (String, u64) {
        for waiter in self.waiters {
            let _ = waiter.send(result.clone());
        }
        drop(self.done);
        (self.key, self.seq)
    }
}

pub(crate) struct Enqueued {
    pub receiver: oneshot::Receiver<RoundResult>,
    /// First call of a new window; the caller must arm a timer.
    pub opens_window: bool,
    /// Earlier round for the same key that could not absorb this call; it
    /// must be sent now. The new round's RPC waits for it.
    pub displaced: Option<PendingRound>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, PendingRound>,
    /// Completion signal of the newest round per key, taken by the next one.
    tails: HashMap<String, (u64, oneshot::Receiver<()>)>,
    next_seq: u64,
}

/// Fixed-window debounce: the window opens on the first call for a key and
/// everything arriving before it closes goes out as one delta.
///
/// Rounds for one key are sent in the order they were opened.
#[derive(Default)]
pub(crate) struct Pacer {
    state: Mutex<State>,
}

impl Pacer {
    pub(crate) fn enqueue(&self, key: String, delta: Delta) -> Enqueued {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();

        let delta = match state.pending.get_mut(&key) {
            Some(round) => match round.delta.absorb(delta) {
                Ok(()) => {
                    round.waiters.push(tx);
                    return Enqueued {
                        receiver: rx,
                        opens_window: false,
                        displaced: None,
                    };
                }
                Err(delta) => delta,
            },
            None => delta,
        };

        let displaced = state.pending.remove(&key).map(|mut round| {
            if let Some(timer) = round.timer.take() {
                timer.abort();
            }
            round
        });

        let seq = state.next_seq;
        state.next_seq += 1;
        let (done, finished) = oneshot::channel();
        let after = state
            .tails
            .insert(key.clone(), (seq, finished))
            .map(|(_, previous)| previous);
        state.pending.insert(
            key.clone(),
            PendingRound {
                key,
                seq,
                delta,
                waiters: vec![tx],
                timer: None,
                after,
                done,
            },
        );

        Enqueued {
            receiver: rx,
            opens_window: true,
            displaced,
        }
    }

    /// Forget the completion signal of a sent round unless a newer round
    /// for the key already holds it.
    pub(crate) fn release(&self, key: &str, seq: u64) {
        let mut state = self.state.lock();
        if state.tails.get(key).is_some_and(|(tail, _)| *tail == seq) {
            state.tails.remove(key);
        }
    }

    /// Attach the window timer; a round already flushed just drops the handle.
    pub(crate) fn arm(&self, key: &str, timer: JoinHandle<()>) {
        if let Some(round) = self.state.lock().pending.get_mut(key) {
            round.timer = Some(timer);
        }
    }

    /// Remove the round for `key` when its window closes.
    pub(crate) fn take(&self, key: &str) -> Option<PendingRound> {
        self.state.lock().pending.remove(key)
    }

    /// Remove every pending round and cancel their timers.
    pub(crate) fn take_all(&self) -> Vec<(String, PendingRound)> {
        let drained: Vec<_> = self.state.lock().pending.drain().collect();
        drained
            .into_iter()
            .map(|(key, mut round)| {
                if let Some(timer) = round.timer.take() {
                    timer.abort();
                }
                (key, round)
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
