//! Keyed one-slot synchronous handoffs.
//!
//! A [Rendezvous] map matches producers ([Rendezvous::offer]) with consumers
//! ([Rendezvous::take]) on a string key. The handoff is synchronous: an
//! offer only resolves once a taker has claimed the value, and a taker
//! parks until an offer arrives. There is no buffering; a value lives in
//! the map only while its producer is still waiting on it.
//!
//! Cancellation is dropping the future. Every parked side registers a drop
//! guard that removes its queue entry, so an abandoned offer is never
//! handed to a taker and an abandoned taker never consumes an offer. A
//! taker confirms each claim with the producer before returning the value;
//! a failed confirmation means the producer gave up in the meantime, and
//! the taker moves on to the next offer.
//!
//! Slot entries are created lazily by whichever side arrives first and
//! removed by whichever side observes both queues empty.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;

/// Outcome of a completed [Rendezvous::offer].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offered {
    /// A taker claimed the value.
    Claimed,
    /// A taker accepted the handoff but disappeared before claiming it.
    /// The value is gone and was processed by no one.
    Lost,
}

/// A value in flight, paired with the channel the taker uses to confirm
/// the claim back to the producer.
struct Pending<T> {
    value: T,
    claimed: oneshot::Sender<()>,
}

struct Slot<T> {
    offers: VecDeque<(u64, Pending<T>)>,
    takers: VecDeque<(u64, oneshot::Sender<Pending<T>>)>,
}

impl<T> Slot<T> {
    fn is_idle(&self) -> bool {
        self.offers.is_empty() && self.takers.is_empty()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            offers: VecDeque::new(),
            takers: VecDeque::new(),
        }
    }
}

struct State<T> {
    slots: HashMap<String, Slot<T>>,
    next_token: u64,
}

pub struct Rendezvous<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Rendezvous<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                next_token: 0,
            })),
        }
    }
}

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands `value` to a taker of `key`, parking until one claims it.
    ///
    /// Dropping the returned future (deadline, peer disconnect) withdraws
    /// the value; a taker arriving afterwards will not see it.
    pub async fn offer(&self, key: &str, value: T) -> Offered {
        let (claimed_tx, claimed_rx) = oneshot::channel();
        let mut pending = Pending {
            value,
            claimed: claimed_tx,
        };
        let token;
        {
            let mut state = self.state.lock().unwrap();
            state.next_token += 1;
            token = state.next_token;
            let slot = state.slots.entry(key.to_string()).or_default();
            loop {
                match slot.takers.pop_front() {
                    // Hand off directly to a parked taker; a taker whose
                    // future is already gone bounces the value back.
                    Some((_, taker)) => match taker.send(pending) {
                        Ok(()) => break,
                        Err(bounced) => pending = bounced,
                    },
                    None => {
                        slot.offers.push_back((token, pending));
                        break;
                    }
                }
            }
            if state.slots.get(key).is_some_and(|slot| slot.is_idle()) {
                state.slots.remove(key);
            }
        }
        let mut guard = QueueGuard {
            state: self.state.clone(),
            key: key.to_string(),
            token,
            side: Side::Offer,
            armed: true,
        };
        let outcome = match claimed_rx.await {
            Ok(()) => Offered::Claimed,
            Err(_) => Offered::Lost,
        };
        guard.armed = false;
        outcome
    }

    /// Claims the next offer for `key`, parking until one arrives.
    ///
    /// Offers whose producer has already given up are skipped, so a taker
    /// never returns with a value nobody is waiting on. Dropping the
    /// returned future deregisters the taker.
    pub async fn take(&self, key: &str) -> T {
        loop {
            let (taker_tx, taker_rx) = oneshot::channel();
            let token;
            {
                let mut state = self.state.lock().unwrap();
                state.next_token += 1;
                token = state.next_token;
                let mut claimed_value = None;
                let slot = state.slots.entry(key.to_string()).or_default();
                while let Some((_, pending)) = slot.offers.pop_front() {
                    let Pending { value, claimed } = pending;
                    if claimed.send(()).is_ok() {
                        claimed_value = Some(value);
                        break;
                    }
                    // Producer bailed before we got here; the value dies.
                }
                if claimed_value.is_none() {
                    slot.takers.push_back((token, taker_tx));
                }
                if let Some(value) = claimed_value {
                    if state.slots.get(key).is_some_and(|slot| slot.is_idle()) {
                        state.slots.remove(key);
                    }
                    return value;
                }
            }
            let mut guard = QueueGuard {
                state: self.state.clone(),
                key: key.to_string(),
                token,
                side: Side::Taker,
                armed: true,
            };
            match taker_rx.await {
                Ok(Pending { value, claimed }) => {
                    guard.armed = false;
                    if claimed.send(()).is_ok() {
                        return value;
                    }
                    // The producer withdrew in the instant between handing
                    // off and our claim. Fetch another.
                }
                Err(_) => {
                    guard.armed = false;
                }
            }
        }
    }
}

enum Side {
    Offer,
    Taker,
}

/// Deregisters a parked queue entry when its waiting future is dropped.
struct QueueGuard<T> {
    state: Arc<Mutex<State<T>>>,
    key: String,
    token: u64,
    side: Side,
    armed: bool,
}

impl<T> Drop for QueueGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.slots.get_mut(&self.key) {
            match self.side {
                Side::Offer => slot.offers.retain(|(t, _)| *t != self.token),
                Side::Taker => slot.takers.retain(|(t, _)| *t != self.token),
            }
            if slot.is_idle() {
                state.slots.remove(&self.key);
            }
        }
    }
}
