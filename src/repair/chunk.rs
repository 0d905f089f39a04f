// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashSet, VecDeque};
use std::io::SeekFrom;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;

use tracing::{event, Level};

use crate::crypto::MasterKey;
use crate::erasure::ErasureCoder;
use crate::errors::RepairError;
use crate::filesystem::{ChunkSource, FileEntry, FileSet, FileUid};
use crate::hostdb::HostPublicKey;
use crate::memory_manager::MemoryGrant;
use crate::repair::heap::UploadHeap;
use crate::worker::Worker;

/// Identity of a chunk within the upload heap's bookkeeping sets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct UploadChunkId {
    pub file_uid: FileUid,
    pub index: u64,
}

struct UploadChunkState {
    pieces_registered: usize,
    pieces_completed: usize,
    piece_usage: Vec<bool>,
    unused_hosts: HashSet<HostPublicKey>,
    workers_remaining: usize,
    workers_standby: VecDeque<Arc<Worker>>,
    memory: Option<MemoryGrant>,
    finalized: bool,
    source_failed: bool,
}

#[derive(Default)]
struct CleanupActions {
    requeue: Vec<Arc<Worker>>,
    finalize: bool,
    release: Option<MemoryGrant>,
}

pub(crate) struct UploadChunkParams {
    pub id: UploadChunkId,
    pub file: Arc<FileEntry>,
    pub index: u64,
    pub offset: u64,
    pub length: u64,
    pub piece_size: u64,
    pub stuck: bool,
    pub erasure: Arc<ErasureCoder>,
    pub master_key: MasterKey,
    pub piece_usage: Vec<bool>,
    pub pieces_completed: usize,
    pub unused_hosts: HashSet<HostPublicKey>,
    pub heap: Arc<UploadHeap>,
    pub filesystem: Arc<FileSet>,
    pub repair_needed_tx: mpsc::Sender<()>,
}

/// The in-memory scheduling record for a chunk under repair. Created by
/// the repair loop from file metadata, distributed to every worker, and
/// finalized when the last worker has either placed a piece or stepped
/// aside.
pub struct UnfinishedUploadChunk {
    pub id: UploadChunkId,
    pub file: Arc<FileEntry>,
    pub index: u64,
    pub offset: u64,
    pub length: u64,
    pub piece_size: u64,
    pub stuck: bool,
    pub erasure: Arc<ErasureCoder>,
    pub master_key: MasterKey,
    /// Set when the stuck loop gives an abandoned chunk one more chance.
    pub stuck_repair: bool,

    heap: Arc<UploadHeap>,
    filesystem: Arc<FileSet>,
    repair_needed_tx: mpsc::Sender<()>,

    // Encoded pieces are produced once per chunk, by whichever worker
    // needs them first, and shared by the rest.
    encode_lock: tokio::sync::Mutex<()>,
    encoded: Mutex<Option<Arc<Vec<Vec<u8>>>>>,

    state: Mutex<UploadChunkState>,
}

impl UnfinishedUploadChunk {
    pub(crate) fn new(params: UploadChunkParams, stuck_repair: bool) -> Arc<Self> {
        let pieces_completed = params.pieces_completed;
        let piece_usage = params.piece_usage;
        Arc::new(Self {
            id: params.id,
            file: params.file,
            index: params.index,
            offset: params.offset,
            length: params.length,
            piece_size: params.piece_size,
            stuck: params.stuck,
            erasure: params.erasure,
            master_key: params.master_key,
            stuck_repair,
            heap: params.heap,
            filesystem: params.filesystem,
            repair_needed_tx: params.repair_needed_tx,
            encode_lock: tokio::sync::Mutex::new(()),
            encoded: Mutex::new(None),
            state: Mutex::new(UploadChunkState {
                pieces_registered: 0,
                pieces_completed,
                piece_usage,
                unused_hosts: params.unused_hosts,
                workers_remaining: 0,
                workers_standby: VecDeque::new(),
                memory: None,
                finalized: false,
                source_failed: false,
            }),
        })
    }

    pub fn pieces_needed(&self) -> usize {
        self.erasure.num_pieces()
    }

    pub fn min_pieces(&self) -> usize {
        self.erasure.min_pieces()
    }

    pub fn pieces_completed(&self) -> usize {
        self.state.lock().unwrap().pieces_completed
    }

    /// Memory to reserve for a repair: the logical chunk plus the full
    /// encoded piece set.
    pub fn memory_needed(&self) -> u64 {
        self.piece_size * (self.pieces_needed() + self.min_pieces()) as u64
    }

    pub(crate) fn set_memory(&self, grant: MemoryGrant) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.memory.is_none(), "memory granted twice for one chunk");
        state.memory = Some(grant);
    }

    pub(crate) fn add_workers(&self, count: usize) {
        self.state.lock().unwrap().workers_remaining += count;
    }

    /// The worker-side decision: drop, claim an unused-host slot plus the
    /// lowest unclaimed piece index, or go on standby until a claim
    /// fails.
    pub(crate) fn claim(self: &Arc<Self>, worker: &Arc<Worker>) -> Option<u64> {
        let host = worker.host_public_key();
        let mut dropped = false;
        let claimed = {
            let mut state = self.state.lock().unwrap();
            let complete = state.pieces_completed >= self.pieces_needed();
            if complete
                || state.finalized
                || state.source_failed
                || worker.on_upload_cooldown()
                || !state.unused_hosts.contains(&host)
            {
                dropped = true;
                None
            } else if let Some(free) = state.piece_usage.iter().position(|used| !used) {
                state.piece_usage[free] = true;
                state.pieces_registered += 1;
                state.unused_hosts.remove(&host);
                Some(free as u64)
            } else {
                // All piece slots claimed or done, but this host could
                // still take over if a claim fails.
                if !state
                    .workers_standby
                    .iter()
                    .any(|w| w.host_public_key() == host)
                {
                    state.workers_standby.push_back(worker.clone());
                }
                None
            }
        };
        if dropped {
            self.remove_worker();
        }
        claimed
    }

    /// Converts a claim into a durable piece after the host accepted it.
    pub(crate) fn complete_piece(&self, piece_index: u64) {
        let mut state = self.state.lock().unwrap();
        state.pieces_registered -= 1;
        state.pieces_completed += 1;
        debug_assert!(state.piece_usage[piece_index as usize]);
        self.audit(&state);
    }

    /// Reopens a piece slot after a failed upload. The host is not
    /// returned to the candidate set.
    pub(crate) fn unregister_worker(&self, piece_index: u64) {
        let mut state = self.state.lock().unwrap();
        state.pieces_registered -= 1;
        state.piece_usage[piece_index as usize] = false;
        self.audit(&state);
    }

    /// Marks the chunk's source data unreadable; remaining workers drop
    /// it and the chunk finalizes as stuck.
    pub(crate) fn fail_source(&self) {
        self.state.lock().unwrap().source_failed = true;
    }

    pub(crate) fn remove_worker(self: &Arc<Self>) {
        let actions = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.workers_remaining > 0, "workers_remaining underflow");
            state.workers_remaining = state.workers_remaining.saturating_sub(1);
            self.cleanup(&mut state)
        };
        self.run_actions(actions);
    }

    pub(crate) fn managed_cleanup(self: &Arc<Self>) {
        let actions = {
            let mut state = self.state.lock().unwrap();
            self.cleanup(&mut state)
        };
        self.run_actions(actions);
    }

    fn cleanup(&self, state: &mut MutexGuard<'_, UploadChunkState>) -> CleanupActions {
        let mut actions = CleanupActions::default();
        let complete = state.pieces_completed >= self.pieces_needed();

        if complete || state.source_failed {
            actions.requeue.extend(state.workers_standby.drain(..));
        } else if state.piece_usage.iter().any(|used| !used) {
            // A slot reopened; resurrect one standby worker to try it.
            if let Some(worker) = state.workers_standby.pop_front() {
                actions.requeue.push(worker);
            }
        }

        if state.workers_remaining == 0 && !state.finalized {
            state.finalized = true;
            actions.release = state.memory.take();
            actions.finalize = true;
        }
        actions
    }

    fn run_actions(self: &Arc<Self>, actions: CleanupActions) {
        for worker in actions.requeue {
            worker.queue_upload(self.clone());
        }
        if actions.finalize {
            self.finalize();
        }
        drop(actions.release);
    }

    // Every distributed worker has finalized: settle the chunk's stuck
    // bit, free the encoded pieces, give the id back to the heap, and
    // queue the parent directory for a health refresh.
    fn finalize(self: &Arc<Self>) {
        *self.encoded.lock().unwrap() = None;

        let completed = self.pieces_completed();
        let repaired = completed >= self.pieces_needed();
        if let Err(e) = self.file.mark_stuck(self.index, !repaired) {
            event!(
                Level::WARN,
                path = %self.file.path(),
                chunk = self.index,
                error = %e,
                "Unable to update the chunk's stuck flag."
            );
        }
        if repaired && self.stuck_repair {
            event!(
                Level::INFO,
                path = %self.file.path(),
                chunk = self.index,
                "Stuck chunk successfully repaired."
            );
        }
        if !repaired {
            event!(
                Level::DEBUG,
                path = %self.file.path(),
                chunk = self.index,
                completed,
                needed = self.pieces_needed(),
                "Chunk repair ended short of full redundancy; marked stuck."
            );
        }

        self.heap.mark_repair_complete(self.id);
        self.filesystem
            .queue_health_update(self.file.path().parent());
        let _ = self.repair_needed_tx.try_send(());
    }

    /// The chunk's encoded piece set, produced on first use. Encoding
    /// runs off the chunk lock; concurrent callers share one encode.
    pub(crate) async fn encoded_pieces(&self) -> Result<Arc<Vec<Vec<u8>>>, RepairError> {
        if let Some(encoded) = self.encoded.lock().unwrap().clone() {
            return Ok(encoded);
        }
        let _guard = self.encode_lock.lock().await;
        if let Some(encoded) = self.encoded.lock().unwrap().clone() {
            return Ok(encoded);
        }

        let data = self.read_source().await?;
        let erasure = self.erasure.clone();
        let piece_size = self.piece_size;
        let pieces = tokio::task::spawn_blocking(move || erasure.encode(&data, piece_size))
            .await
            .map_err(|e| RepairError::Source(e.to_string()))??;

        let encoded = Arc::new(pieces);
        *self.encoded.lock().unwrap() = Some(encoded.clone());
        Ok(encoded)
    }

    // Reads this chunk's range of the repair source. A short read at the
    // end is expected; encoding zero-pads.
    async fn read_source(&self) -> Result<Vec<u8>, RepairError> {
        let source = self
            .file
            .repair_source()
            .ok_or_else(|| RepairError::Source("no repair source on file".to_string()))?;

        match source {
            ChunkSource::Memory(bytes) => {
                let start = (self.offset as usize).min(bytes.len());
                let end = ((self.offset + self.length) as usize).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            ChunkSource::Local(path) => {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|e| RepairError::Source(e.to_string()))?;
                file.seek(SeekFrom::Start(self.offset))
                    .await
                    .map_err(|e| RepairError::Source(e.to_string()))?;

                let mut data = vec![0u8; self.length as usize];
                let mut read = 0usize;
                while read < data.len() {
                    let n = file
                        .read(&mut data[read..])
                        .await
                        .map_err(|e| RepairError::Source(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                data.truncate(read);
                Ok(data)
            }
        }
    }

    fn audit(&self, state: &UploadChunkState) {
        let claimed = state.piece_usage.iter().filter(|u| **u).count();
        if claimed != state.pieces_registered + state.pieces_completed {
            event!(
                Level::ERROR,
                chunk = self.index,
                claimed,
                registered = state.pieces_registered,
                completed = state.pieces_completed,
                "Piece bookkeeping out of balance."
            );
            debug_assert!(false, "piece bookkeeping out of balance");
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (usize, usize, usize, bool) {
        let state = self.state.lock().unwrap();
        (
            state.pieces_registered,
            state.pieces_completed,
            state.workers_remaining,
            state.finalized,
        )
    }
}
