// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Keyed deadline registry sharing one underlying timer.
//!
//! An LTP engine keeps hundreds of checkpoint and report timers alive at
//! once; arming an OS timer per serial number would be wasteful.  Instead
//! every deadline lives in one ordered set and the engine sleeps until the
//! earliest.  Insert and cancel are O(log n); cancellation atomically
//! returns the entry's user data (retry counters and retransmission
//! context).

use std::collections::{BTreeSet, HashMap};

use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct Entry<V> {
    deadline: Instant,
    user_data: V,
}

#[derive(Debug)]
pub struct TimerManager<K, V> {
    deadlines: BTreeSet<(Instant, K)>,
    entries: HashMap<K, Entry<V>>,
}

impl<K, V> Default for TimerManager<K, V>
where K: Ord + std::hash::Hash + Clone
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TimerManager<K, V>
where K: Ord + std::hash::Hash + Clone
{
    pub fn new() -> Self {
        Self {
            deadlines: BTreeSet::new(),
            entries: HashMap::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Arms a timer.  Returns false (and leaves the existing timer alone)
    /// when the key is already armed.
    pub fn start(&mut self, key: K, deadline: Instant, user_data: V) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.deadlines.insert((deadline, key.clone()));
        self.entries.insert(
            key,
            Entry {
                deadline,
                user_data,
            },
        );
        true
    }

    /// Disarms `key`, returning its user data when it was armed.
    pub fn cancel(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.deadlines.remove(&(entry.deadline, key.clone()));
        Some(entry.user_data)
    }

    /// Earliest armed deadline, the engine's next wake-up point.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Pops the earliest entry whose deadline has passed.  One expiration per
    /// call so the caller re-arms the shared timer between callbacks.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(K, V)> {
        let (deadline, key) = self.deadlines.first()?.clone();
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&(deadline, key.clone()));
        let entry = self.entries.remove(&key)?;
        Some((key, entry.user_data))
    }

    /// Shifts every armed deadline when the one-way light time estimate
    /// changes mid-session: each pending deadline moves by
    /// `2 × (new − old)`.
    pub fn adjust_all(&mut self, old_one_way: Duration, new_one_way: Duration) {
        if old_one_way == new_one_way {
            return;
        }
        let rebuilt: Vec<(K, Instant, V)> = {
            let mut keys = Vec::with_capacity(self.entries.len());
            for (key, entry) in self.entries.drain() {
                let deadline = if new_one_way >= old_one_way {
                    entry.deadline + (new_one_way - old_one_way) * 2
                } else {
                    entry.deadline - (old_one_way - new_one_way) * 2
                };
                keys.push((key, deadline, entry.user_data));
            }
            keys
        };
        self.deadlines.clear();
        for (key, deadline, user_data) in rebuilt {
            self.deadlines.insert((deadline, key.clone()));
            self.entries.insert(
                key,
                Entry {
                    deadline,
                    user_data,
                },
            );
        }
    }
}
