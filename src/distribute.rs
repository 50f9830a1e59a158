//! Latest-frame-wins fan-out from the stream reader to its consumers.
//!
//! Every subscriber owns a single-slot mailbox. Publishing replaces whatever
//! frame is still pending in a slot, so a slow consumer sees gaps but never a
//! backlog, and the producer never waits on a consumer.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::frame::Frame;

#[derive(Default)]
struct SlotState {
    pending: Option<Frame>,
    closed: bool,
    delivered: u64,
    dropped: u64,
}

#[derive(Default)]
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of the fan-out.
///
/// Slots are held weakly; a dropped receiver's slot is pruned on the next
/// publish.
#[derive(Default)]
pub struct FrameDistributor {
    slots: Mutex<Vec<(String, Weak<Slot>)>>,
}

impl FrameDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer. Frames published before this call are not seen.
    pub fn subscribe(&self, name: &str) -> FrameReceiver {
        let slot = Arc::new(Slot::default());
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), Arc::downgrade(&slot)));
        FrameReceiver {
            name: name.to_string(),
            slot,
        }
    }

    /// Deliver `frame` to every subscriber without blocking.
    pub fn publish(&self, frame: Frame) {
        let slots = self.live_slots();
        for (name, slot) in slots.iter() {
            let Some(slot) = slot.upgrade() else {
                continue;
            };
            let mut state = slot.lock();
            if state.closed {
                continue;
            }
            if let Some(stale) = state.pending.replace(frame.clone()) {
                state.dropped += 1;
                log::trace!("{}: dropped stale frame {}", name, stale.seq);
            }
            slot.ready.notify_one();
        }
    }

    /// Close every mailbox and wake blocked receivers.
    pub fn close(&self) {
        let slots = self.live_slots();
        for slot in slots.iter().filter_map(|(_, slot)| slot.upgrade()) {
            slot.lock().closed = true;
            slot.ready.notify_all();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.live_slots().len()
    }

    /// Dropped-frame counter per subscriber, in subscription order.
    pub fn drop_counts(&self) -> Vec<(String, u64)> {
        self.live_slots()
            .iter()
            .filter_map(|(name, slot)| Some((name.clone(), slot.upgrade()?.lock().dropped)))
            .collect()
    }

    fn live_slots(&self) -> MutexGuard<'_, Vec<(String, Weak<Slot>)>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.retain(|(name, slot)| {
            let live = slot.strong_count() > 0;
            if !live {
                log::debug!("{}: receiver dropped, removing subscription", name);
            }
            live
        });
        slots
    }
}

/// Consumer side of one mailbox.
pub struct FrameReceiver {
    name: String,
    slot: Arc<Slot>,
}

impl FrameReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `None` on timeout, or immediately once the distributor is closed
    /// and the slot is empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.lock();
        loop {
            if let Some(frame) = state.pending.take() {
                state.delivered += 1;
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .slot
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    pub fn try_recv(&self) -> Option<Frame> {
        let mut state = self.slot.lock();
        let frame = state.pending.take();
        if frame.is_some() {
            state.delivered += 1;
        }
        frame
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    /// Frames overwritten before this consumer picked them up.
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }

    pub fn delivered(&self) -> u64 {
        self.slot.lock().delivered
    }
}
