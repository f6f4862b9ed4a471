// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Memory-mapped segmented bundle store.
//!
//! The backing file is an array of fixed-size segments; a bundle occupies a
//! singly-linked chain of them (each segment header names its successor).
//! Free segments live on a free list.  The index maps
//! `destination → priority → expiration second → FIFO of head segments`, so
//! retrieval walks: highest priority, earliest expiration, oldest arrival.
//!
//! Neither the index nor the free list is persisted; recovery across a
//! restart is not promised.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fs::OpenOptions,
    path::Path,
};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::eid::Eid;

pub type SegmentId = u32;

/// Bytes per segment including the 8-byte chain header.
pub const SEGMENT_SIZE: usize = 4096;
const SEGMENT_HEADER: usize = 8;
const SEGMENT_PAYLOAD: usize = SEGMENT_SIZE - SEGMENT_HEADER;
const NO_SUCCESSOR: u32 = u32::MAX;

pub const NUM_PRIORITIES: usize = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store is out of free segments (need {needed}, have {available})")]
    DepletedStorage { needed: usize, available: usize },

    #[error("cannot open backing file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct StoredBundle {
    dest: Eid,
    priority: u8,
    expiration_second: u64,
    total_len: usize,
    custody_id: Option<u64>,
}

/// A retrieved bundle plus the index coordinates it was filed under.
#[derive(Debug)]
pub struct RetrievedBundle {
    pub dest_index: usize,
    pub dest: Eid,
    pub priority: u8,
    pub expiration_second: u64,
    pub head_segment: SegmentId,
    pub data: Vec<u8>,
}

type ExpirationMap = BTreeMap<u64, VecDeque<SegmentId>>;

pub struct BundleStorageManager {
    mmap: MmapMut,
    segment_count: u32,
    free_list: VecDeque<SegmentId>,
    dest_map: HashMap<Eid, [ExpirationMap; NUM_PRIORITIES]>,
    bundles: HashMap<SegmentId, StoredBundle>,
    stored_heads: HashSet<SegmentId>,
}

impl BundleStorageManager {
    /// Creates (or truncates) the backing file sized for `segment_count`
    /// segments and maps it.
    pub fn open<P: AsRef<Path>>(path: P, segment_count: u32) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(u64::from(segment_count) * SEGMENT_SIZE as u64)?;
        // the file was just sized and stays owned by this manager
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        info!(
            path = %path.as_ref().display(),
            segment_count,
            "bundle store mapped"
        );
        Ok(Self {
            mmap,
            segment_count,
            free_list: (0..segment_count).collect(),
            dest_map: HashMap::new(),
            bundles: HashMap::new(),
            stored_heads: HashSet::new(),
        })
    }

    #[inline]
    pub fn free_segments(&self) -> usize {
        self.free_list.len()
    }

    #[inline]
    pub fn stored_bundle_count(&self) -> usize {
        self.bundles.len()
    }

    /// True when `data` would fit right now.
    pub fn has_capacity_for(&self, data_len: usize) -> bool {
        segments_needed(data_len) <= self.free_list.len()
    }

    /// Commits one bundle, returning its head segment id.
    pub fn store(
        &mut self,
        dest: Eid,
        priority: u8,
        expiration_second: u64,
        data: &[u8],
        custody_id: Option<u64>,
    ) -> Result<SegmentId, StorageError> {
        let needed = segments_needed(data.len());
        if needed > self.free_list.len() {
            return Err(StorageError::DepletedStorage {
                needed,
                available: self.free_list.len(),
            });
        }

        let chain: Vec<SegmentId> = self.free_list.drain(..needed).collect();
        for (i, &seg) in chain.iter().enumerate() {
            let successor = chain.get(i + 1).copied().unwrap_or(NO_SUCCESSOR);
            let begin = i * SEGMENT_PAYLOAD;
            let end = ((i + 1) * SEGMENT_PAYLOAD).min(data.len());
            self.write_segment(seg, successor, &data[begin..end]);
        }

        let head = chain[0];
        let priority = priority.min((NUM_PRIORITIES - 1) as u8);
        self.dest_map
            .entry(dest)
            .or_default()[priority as usize]
            .entry(expiration_second)
            .or_default()
            .push_back(head);
        self.bundles.insert(
            head,
            StoredBundle {
                dest,
                priority,
                expiration_second,
                total_len: data.len(),
                custody_id,
            },
        );
        self.stored_heads.insert(head);
        debug!(%dest, priority, expiration_second, head, "bundle stored");
        Ok(head)
    }

    /// Redelivery-safe variant: storing again under a head segment id that
    /// is already occupied is a no-op.
    pub fn store_if_absent(
        &mut self,
        dest: Eid,
        priority: u8,
        expiration_second: u64,
        head_segment: SegmentId,
        data: &[u8],
    ) -> Result<SegmentId, StorageError> {
        if self.stored_heads.contains(&head_segment) {
            debug!(head_segment, "duplicate store ignored");
            return Ok(head_segment);
        }
        self.store(dest, priority, expiration_second, data, None)
    }

    /// Retrieves (and removes) the next bundle for any of
    /// `available_dests`: highest priority first, then earliest expiration,
    /// then FIFO arrival order.
    pub fn get(&mut self, available_dests: &[Eid]) -> Option<RetrievedBundle> {
        for priority in (0..NUM_PRIORITIES).rev() {
            for (dest_index, dest) in available_dests.iter().enumerate() {
                let Some(priorities) = self.dest_map.get_mut(dest) else {
                    continue;
                };
                let expirations = &mut priorities[priority];
                let Some((&expiration, fifo)) = expirations.iter_mut().next() else {
                    continue;
                };
                let Some(head) = fifo.pop_front() else {
                    continue;
                };
                if fifo.is_empty() {
                    expirations.remove(&expiration);
                }
                let Some(meta) = self.bundles.remove(&head) else {
                    continue;
                };
                self.stored_heads.remove(&head);
                let data = self.read_chain(head, meta.total_len);
                return Some(RetrievedBundle {
                    dest_index,
                    dest: *dest,
                    priority: priority as u8,
                    expiration_second: expiration,
                    head_segment: head,
                    data,
                });
            }
        }
        None
    }

    /// Releases every bundle whose stored custody id matches one of `ids`
    /// (consumption of a custody signal / ACS).  Returns the release count.
    pub fn release_by_custody_ids(&mut self, ids: &[u64]) -> usize {
        let heads: Vec<SegmentId> = self
            .bundles
            .iter()
            .filter(|(_, b)| b.custody_id.map(|id| ids.contains(&id)).unwrap_or(false))
            .map(|(&head, _)| head)
            .collect();
        for head in &heads {
            self.remove(*head);
        }
        heads.len()
    }

    /// Drops every bundle whose expiration second has passed.  Returns the
    /// number dropped.
    pub fn drop_expired(&mut self, now_second: u64) -> usize {
        let heads: Vec<SegmentId> = self
            .bundles
            .iter()
            .filter(|(_, b)| b.expiration_second <= now_second)
            .map(|(&head, _)| head)
            .collect();
        for head in &heads {
            self.remove(*head);
        }
        heads.len()
    }

    fn remove(&mut self, head: SegmentId) {
        let Some(meta) = self.bundles.remove(&head) else {
            return;
        };
        self.stored_heads.remove(&head);
        if let Some(priorities) = self.dest_map.get_mut(&meta.dest) {
            let expirations = &mut priorities[meta.priority as usize];
            if let Some(fifo) = expirations.get_mut(&meta.expiration_second) {
                fifo.retain(|&s| s != head);
                if fifo.is_empty() {
                    expirations.remove(&meta.expiration_second);
                }
            }
        }
        self.free_chain(head);
    }

    fn write_segment(&mut self, seg: SegmentId, successor: u32, payload: &[u8]) {
        let base = seg as usize * SEGMENT_SIZE;
        self.mmap[base..base + 4].copy_from_slice(&successor.to_le_bytes());
        self.mmap[base + 4..base + 8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.mmap[base + SEGMENT_HEADER..base + SEGMENT_HEADER + payload.len()]
            .copy_from_slice(payload);
    }

    fn read_chain(&mut self, head: SegmentId, total_len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(total_len);
        let mut seg = head;
        loop {
            let base = seg as usize * SEGMENT_SIZE;
            let successor =
                u32::from_le_bytes(self.mmap[base..base + 4].try_into().expect("4 bytes"));
            let used = u32::from_le_bytes(
                self.mmap[base + 4..base + 8].try_into().expect("4 bytes"),
            ) as usize;
            data.extend_from_slice(
                &self.mmap[base + SEGMENT_HEADER..base + SEGMENT_HEADER + used],
            );
            self.free_list.push_back(seg);
            if successor == NO_SUCCESSOR {
                break;
            }
            seg = successor;
        }
        data
    }

    fn free_chain(&mut self, head: SegmentId) {
        let mut seg = head;
        loop {
            let base = seg as usize * SEGMENT_SIZE;
            let successor =
                u32::from_le_bytes(self.mmap[base..base + 4].try_into().expect("4 bytes"));
            self.free_list.push_back(seg);
            if successor == NO_SUCCESSOR {
                break;
            }
            seg = successor;
        }
    }
}

impl std::fmt::Debug for BundleStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleStorageManager")
            .field("segment_count", &self.segment_count)
            .field("free_segments", &self.free_list.len())
            .field("stored_bundles", &self.bundles.len())
            .finish()
    }
}

#[inline]
fn segments_needed(data_len: usize) -> usize {
    data_len.div_ceil(SEGMENT_PAYLOAD).max(1)
}
