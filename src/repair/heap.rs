// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};

use crate::repair::chunk::{UnfinishedUploadChunk, UploadChunkId};

/// Priority-sorted chunks awaiting repair. Stuck chunks come first; within
/// a class, the chunk with the lowest completion fraction pops first, with
/// the chunk id as a stable tie-break.
///
/// A chunk id lives in `heap_chunks` from push to pop and in
/// `repairing_chunks` from pop until its repair finalizes; the two sets
/// are disjoint at every observable point, and a push for an id in either
/// set is rejected.
#[derive(Default)]
pub struct UploadHeap {
    inner: Mutex<UploadHeapInner>,
}

#[derive(Default)]
struct UploadHeapInner {
    heap: BinaryHeap<UploadHeapEntry>,
    heap_chunks: HashSet<UploadChunkId>,
    repairing_chunks: HashSet<UploadChunkId>,
}

struct UploadHeapEntry {
    stuck: bool,
    // Completion fraction at push time; the ordering key must not move
    // underneath the heap.
    completion: f64,
    id: UploadChunkId,
    chunk: Arc<UnfinishedUploadChunk>,
}

impl PartialEq for UploadHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for UploadHeapEntry {}

impl PartialOrd for UploadHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UploadHeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops its greatest element, so "greater" pops first.
        self.stuck
            .cmp(&other.stuck)
            .then_with(|| other.completion.total_cmp(&self.completion))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl UploadHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a chunk unless it is already queued or being repaired.
    /// Returns whether the chunk was accepted.
    pub fn push(&self, chunk: Arc<UnfinishedUploadChunk>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let id = chunk.id;
        if inner.heap_chunks.contains(&id) || inner.repairing_chunks.contains(&id) {
            return false;
        }
        inner.heap_chunks.insert(id);
        let entry = UploadHeapEntry {
            stuck: chunk.stuck,
            completion: chunk.pieces_completed() as f64 / chunk.pieces_needed() as f64,
            id,
            chunk,
        };
        inner.heap.push(entry);
        true
    }

    /// Pops the best chunk, transferring custody of its id into the
    /// repairing set.
    pub fn pop(&self) -> Option<Arc<UnfinishedUploadChunk>> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.heap.pop()?;
        inner.heap_chunks.remove(&entry.id);
        inner.repairing_chunks.insert(entry.id);
        Some(entry.chunk)
    }

    /// Releases a popped chunk's id once its repair has finalized, so a
    /// later pass may queue the chunk again.
    pub fn mark_repair_complete(&self, id: UploadChunkId) {
        self.inner.lock().unwrap().repairing_chunks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn sets_are_disjoint(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.heap_chunks.is_disjoint(&inner.repairing_chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::erasure::ErasureCoder;
    use crate::filesystem::{FilePath, FileSet};
    use crate::repair::chunk::UploadChunkParams;
    use std::collections::HashSet;
    use tokio::sync::mpsc;

    struct Fixture {
        heap: Arc<UploadHeap>,
        filesystem: Arc<FileSet>,
        repair_needed_tx: mpsc::Sender<()>,
    }

    impl Fixture {
        fn new() -> Self {
            let (repair_needed_tx, _rx) = mpsc::channel(1);
            Self {
                heap: Arc::new(UploadHeap::new()),
                filesystem: Arc::new(FileSet::new()),
                repair_needed_tx,
            }
        }

        // A chunk with `completed` of 4 pieces already in place.
        fn chunk(
            &self,
            path: &str,
            index: u64,
            stuck: bool,
            completed: usize,
        ) -> Arc<UnfinishedUploadChunk> {
            let erasure = Arc::new(ErasureCoder::new(2, 4).unwrap());
            let file = self
                .filesystem
                .create_file(
                    FilePath::new(path),
                    None,
                    1024,
                    64,
                    erasure.clone(),
                    MasterKey::generate(),
                )
                .unwrap();
            let mut piece_usage = vec![false; 4];
            for slot in piece_usage.iter_mut().take(completed) {
                *slot = true;
            }
            UnfinishedUploadChunk::new(
                UploadChunkParams {
                    id: UploadChunkId {
                        file_uid: file.uid(),
                        index,
                    },
                    file: file.clone(),
                    index,
                    offset: index * file.chunk_size(),
                    length: file.chunk_size(),
                    piece_size: file.piece_size(),
                    stuck,
                    erasure,
                    master_key: file.master_key(),
                    piece_usage,
                    pieces_completed: completed,
                    unused_hosts: HashSet::new(),
                    heap: self.heap.clone(),
                    filesystem: self.filesystem.clone(),
                    repair_needed_tx: self.repair_needed_tx.clone(),
                },
                false,
            )
        }
    }

    #[test]
    fn test_pop_order_stuck_then_least_complete() {
        let fx = Fixture::new();
        // Scrambled push order; expected pops: stuck chunks first, then
        // lower completion fraction within each class.
        let unstuck_half = fx.chunk("a", 0, false, 2);
        let stuck_half = fx.chunk("b", 0, true, 2);
        let unstuck_quarter = fx.chunk("c", 0, false, 1);
        let stuck_quarter = fx.chunk("d", 0, true, 1);

        assert!(fx.heap.push(unstuck_half.clone()));
        assert!(fx.heap.push(stuck_half.clone()));
        assert!(fx.heap.push(unstuck_quarter.clone()));
        assert!(fx.heap.push(stuck_quarter.clone()));

        let order: Vec<UploadChunkId> = std::iter::from_fn(|| fx.heap.pop())
            .map(|c| c.id)
            .collect();
        assert_eq!(
            order,
            vec![
                stuck_quarter.id,
                stuck_half.id,
                unstuck_quarter.id,
                unstuck_half.id
            ]
        );
    }

    #[test]
    fn test_equal_chunks_pop_by_id() {
        let fx = Fixture::new();
        let b = fx.chunk("b", 0, false, 1);
        let a = fx.chunk("a", 1, false, 1);
        fx.heap.push(b.clone());
        fx.heap.push(a.clone());
        // Identical class and completion: the lower id pops first.
        let (first, second) = (a.id.min(b.id), a.id.max(b.id));
        assert_eq!(fx.heap.pop().unwrap().id, first);
        assert_eq!(fx.heap.pop().unwrap().id, second);
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let fx = Fixture::new();
        let chunk = fx.chunk("a", 0, false, 1);
        assert!(fx.heap.push(chunk.clone()));
        assert!(!fx.heap.push(chunk.clone()));
        assert_eq!(fx.heap.len(), 1);
    }

    #[test]
    fn test_push_while_repairing_rejected() {
        let fx = Fixture::new();
        let chunk = fx.chunk("a", 0, false, 1);
        fx.heap.push(chunk.clone());

        let popped = fx.heap.pop().unwrap();
        assert!(fx.heap.sets_are_disjoint());
        // In custody of the repair pipeline; a rebuild must not re-queue it.
        assert!(!fx.heap.push(popped.clone()));

        fx.heap.mark_repair_complete(popped.id);
        assert!(fx.heap.push(popped));
        assert!(fx.heap.sets_are_disjoint());
    }

    #[test]
    fn test_pop_empty() {
        let fx = Fixture::new();
        assert!(fx.heap.pop().is_none());
        assert!(fx.heap.is_empty());
    }
}
