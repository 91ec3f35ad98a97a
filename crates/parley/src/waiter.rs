// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Waiter table: parked callers awaiting a counterpart message.
//!
//! Keyed by `(session_id, agent_id)` — the agent the awaited message is
//! addressed to. Blocking sends register before persisting their outbound
//! message, which closes the wake-before-register race. Handles remove
//! their own entry on every exit (delivery, timeout, cancellation); an entry
//! left in the table is a leak.
//!
//! Registration replaces any prior waiter for the same key. The replaced
//! handle observes [`WaitOutcome::Replaced`] and is expected to re-check the
//! message queue once before giving up. Entries are generation-counted so a
//! stale handle can never evict its replacement.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A counterpart message handed directly to a parked caller. The receiver
/// still owns marking it read.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub message_id: Uuid,
    pub content: Value,
}

type WaiterKey = (Uuid, Uuid);

struct Slot {
    generation: u64,
    tx: oneshot::Sender<Option<Delivery>>,
}

#[derive(Default)]
struct State {
    next_generation: u64,
    slots: HashMap<WaiterKey, Slot>,
}

pub(crate) struct WaiterTable {
    state: Arc<Mutex<State>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Park a waiter for messages addressed to `agent_id` on this session.
    /// Replaces (and thereby wakes with `Replaced`) any existing waiter.
    pub fn register(&self, session_id: Uuid, agent_id: Uuid) -> WaiterHandle {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.slots.insert((session_id, agent_id), Slot { generation, tx });
        WaiterHandle {
            session_id,
            agent_id,
            generation,
            rx,
            table: Arc::downgrade(&self.state),
        }
    }

    /// Wake the waiter for this key, optionally handing it the persisted
    /// message. Returns false when nobody was parked.
    pub fn try_wake(&self, session_id: Uuid, agent_id: Uuid, delivery: Option<Delivery>) -> bool {
        let slot = self.state.lock().slots.remove(&(session_id, agent_id));
        match slot {
            Some(slot) => slot.tx.send(delivery).is_ok(),
            None => false,
        }
    }

    /// True when a waiter is parked for this key. Used by tests and the
    /// leak-free shutdown check.
    pub fn contains(&self, session_id: Uuid, agent_id: Uuid) -> bool {
        self.state.lock().slots.contains_key(&(session_id, agent_id))
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    /// Wake every parked waiter empty-handed. Part of shutdown: blocked
    /// callers unblock, re-check their queues, and return.
    pub fn drain(&self) {
        let slots = std::mem::take(&mut self.state.lock().slots);
        for (_, slot) in slots {
            let _ = slot.tx.send(None);
        }
    }
}

/// How a parked wait concluded.
#[derive(Debug)]
pub(crate) enum WaitOutcome {
    /// The signal fired; the payload is the optional fast-path delivery.
    Woken(Option<Delivery>),
    /// A newer waiter took this key; re-check the queue once and return.
    Replaced,
    TimedOut,
}

pub(crate) struct WaiterHandle {
    session_id: Uuid,
    agent_id: Uuid,
    generation: u64,
    rx: oneshot::Receiver<Option<Delivery>>,
    table: Weak<Mutex<State>>,
}

impl WaiterHandle {
    /// Await the wake signal, bounded by `timeout` when given. Consumes the
    /// handle; the table entry is removed on every path.
    pub async fn wait(mut self, timeout: Option<Duration>) -> WaitOutcome {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Err(_) => WaitOutcome::TimedOut,
                Ok(Ok(delivery)) => WaitOutcome::Woken(delivery),
                Ok(Err(_)) => WaitOutcome::Replaced,
            },
            None => match (&mut self.rx).await {
                Ok(delivery) => WaitOutcome::Woken(delivery),
                Err(_) => WaitOutcome::Replaced,
            },
        }
        // Drop runs here and clears the slot if this handle still owns it.
    }

    #[cfg(test)]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for WaiterHandle {
    fn drop(&mut self) {
        let Some(state) = self.table.upgrade() else {
            return;
        };
        let mut state = state.lock();
        let key = (self.session_id, self.agent_id);
        // Only remove the entry if it is still ours; a replacement waiter
        // must not be evicted by a stale handle.
        if state
            .slots
            .get(&key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            state.slots.remove(&key);
        }
    }
}

#[cfg(test)]
#[path = "waiter_tests.rs"]
mod tests;
