// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::download::chunk::UnfinishedDownloadChunk;

/// Priority queue of planned download chunks waiting for memory and
/// distribution. Higher priority first; within a priority, chunks that
/// start earlier in the file come first; insertion order breaks the rest
/// of the ties so pops are deterministic.
#[derive(Default)]
pub struct DownloadHeap {
    heap: Mutex<BinaryHeap<DownloadHeapEntry>>,
    next_seq: AtomicU64,
}

struct DownloadHeapEntry {
    priority: u64,
    chunk_index: u64,
    seq: u64,
    chunk: Arc<UnfinishedDownloadChunk>,
}

impl PartialEq for DownloadHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DownloadHeapEntry {}

impl PartialOrd for DownloadHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DownloadHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops its greatest element, so "greater" means
        // "served first".
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.chunk_index.cmp(&self.chunk_index))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl DownloadHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, chunk: Arc<UnfinishedDownloadChunk>) {
        let entry = DownloadHeapEntry {
            priority: chunk.priority,
            chunk_index: chunk.chunk_index,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            chunk,
        };
        self.heap.lock().unwrap().push(entry);
    }

    pub fn pop(&self) -> Option<Arc<UnfinishedDownloadChunk>> {
        self.heap.lock().unwrap().pop().map(|entry| entry.chunk)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
