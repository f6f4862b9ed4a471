// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ordered unique-id ack queues between ingress, egress and storage.
//!
//! Every bundle pushed toward a reliable consumer leaves its unique id at
//! the tail of a queue; the consumer's ack must match the head exactly
//! (strict FIFO).  Waiters block on queue depth with a 250 ms tick so a
//! stalled consumer is noticed without busy-spinning.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tokio::{
    sync::Notify,
    time::{Duration, Instant, timeout},
};

use crate::models::eid::Eid;

/// Wait tick between queue-depth re-checks.
pub const DRAIN_WAIT_TICK: Duration = Duration::from_millis(250);

/// One FIFO of outstanding unique ids plus its drain notification.
#[derive(Debug, Default)]
pub struct AckQueue {
    ids: Mutex<VecDeque<u64>>,
    drained: Notify,
}

impl AckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().expect("ack queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a freshly issued unique id at the tail.
    pub fn push(&self, unique_id: u64) {
        self.ids
            .lock()
            .expect("ack queue poisoned")
            .push_back(unique_id);
    }

    /// Pops the head iff it equals `unique_id`.  A mismatch leaves the queue
    /// untouched and returns false; the caller treats that as a per-link
    /// protocol violation.
    pub fn compare_and_pop(&self, unique_id: u64) -> bool {
        let mut ids = self.ids.lock().expect("ack queue poisoned");
        match ids.front() {
            Some(&head) if head == unique_id => {
                ids.pop_front();
                true
            },
            _ => false,
        }
    }

    /// Pops the head unconditionally (queue seeding / reconciliation).
    pub fn pop_front_any(&self) -> Option<u64> {
        self.ids.lock().expect("ack queue poisoned").pop_front()
    }

    /// Removes the tail iff it equals `unique_id`: undo for a push whose
    /// matching send never left this node.
    pub fn pop_back_if(&self, unique_id: u64) -> bool {
        let mut ids = self.ids.lock().expect("ack queue poisoned");
        match ids.back() {
            Some(&tail) if tail == unique_id => {
                ids.pop_back();
                true
            },
            _ => false,
        }
    }

    /// Wakes every waiter after a successful pop.
    pub fn notify_all(&self) {
        self.drained.notify_waiters();
    }

    /// Empties the queue (link teardown after a fatal mismatch).
    pub fn clear(&self) {
        self.ids.lock().expect("ack queue poisoned").clear();
        self.drained.notify_waiters();
    }

    /// Waits until the queue depth drops to `max_depth` or `max_wait`
    /// elapses.  Returns true when the depth condition was met.  A zero
    /// `max_wait` never blocks.
    pub async fn wait_until_below(&self, max_depth: usize, max_wait: Duration) -> bool {
        if self.len() <= max_depth {
            return true;
        }
        if max_wait.is_zero() {
            return false;
        }
        let deadline = Instant::now() + max_wait;
        loop {
            if self.len() <= max_depth {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            // bounded tick: a missed notify costs at most one tick
            let _ = timeout(DRAIN_WAIT_TICK, self.drained.notified()).await;
        }
    }
}

/// Per-destination ack queues behind one map lock.  Queue operations use the
/// queue's own synchronization; the map lock is held only for lookup.
#[derive(Debug, Default)]
pub struct AckQueueMap {
    queues: Mutex<HashMap<Eid, Arc<AckQueue>>>,
}

impl AckQueueMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches (creating on first use) the queue for `dest`.
    pub fn queue_for(&self, dest: Eid) -> Arc<AckQueue> {
        let mut queues = self.queues.lock().expect("ack queue map poisoned");
        Arc::clone(queues.entry(dest).or_default())
    }

    /// Looks up without creating.
    pub fn get(&self, dest: Eid) -> Option<Arc<AckQueue>> {
        self.queues
            .lock()
            .expect("ack queue map poisoned")
            .get(&dest)
            .cloned()
    }
}
