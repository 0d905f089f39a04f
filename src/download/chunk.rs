// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{event, Level};

use crate::crypto::{MasterKey, SectorRoot};
use crate::download::destination::DownloadDestination;
use crate::download::Download;
use crate::erasure::ErasureCoder;
use crate::errors::DownloadError;
use crate::hostdb::HostPublicKey;
use crate::memory_manager::MemoryGrant;
use crate::worker::Worker;

/// Which piece a given host holds for a chunk, and the sector root to
/// request from it.
#[derive(Clone, Copy, Debug)]
pub struct DownloadPieceInfo {
    pub index: u64,
    pub root: SectorRoot,
}

pub(crate) struct DownloadChunkParams {
    pub chunk_index: u64,
    pub chunk_map: HashMap<HostPublicKey, DownloadPieceInfo>,
    pub piece_size: u64,
    pub fetch_offset: u64,
    pub fetch_length: u64,
    pub write_offset: u64,
    pub latency_target: Duration,
    pub overdrive: usize,
    pub priority: u64,
    pub needs_memory: bool,
    pub erasure: Arc<ErasureCoder>,
    pub master_key: MasterKey,
    pub destination: Arc<dyn DownloadDestination>,
}

struct DownloadChunkState {
    pieces_registered: usize,
    pieces_completed: usize,
    piece_usage: Vec<bool>,
    completed_pieces: Vec<bool>,
    physical_chunk_data: Vec<Option<Vec<u8>>>,
    workers_remaining: usize,
    workers_standby: VecDeque<Arc<Worker>>,
    recovery_launched: bool,
    recovery_complete: bool,
    failed: bool,
    memory: Option<MemoryGrant>,
}

/// Follow-up work computed under the chunk lock but executed after it is
/// released: worker queues and the download object have their own locks.
#[derive(Default)]
struct CleanupActions {
    requeue: Vec<Arc<Worker>>,
    fail_download: Option<DownloadError>,
    release: Option<MemoryGrant>,
}

/// The in-memory scheduling record for one chunk of a download. All
/// mutable state sits behind a single lock held only for bookkeeping,
/// never across an RPC, a decode, or a destination write.
pub struct UnfinishedDownloadChunk {
    pub download: Arc<Download>,
    pub chunk_index: u64,
    pub chunk_map: HashMap<HostPublicKey, DownloadPieceInfo>,
    pub piece_size: u64,
    pub fetch_offset: u64,
    pub fetch_length: u64,
    pub write_offset: u64,
    pub latency_target: Duration,
    pub overdrive: usize,
    pub priority: u64,
    pub needs_memory: bool,
    pub erasure: Arc<ErasureCoder>,
    pub master_key: MasterKey,
    pub destination: Arc<dyn DownloadDestination>,
    state: Mutex<DownloadChunkState>,
}

impl UnfinishedDownloadChunk {
    pub(crate) fn new(download: Arc<Download>, params: DownloadChunkParams) -> Arc<Self> {
        let num_pieces = params.erasure.num_pieces();
        Arc::new(Self {
            download,
            chunk_index: params.chunk_index,
            chunk_map: params.chunk_map,
            piece_size: params.piece_size,
            fetch_offset: params.fetch_offset,
            fetch_length: params.fetch_length,
            write_offset: params.write_offset,
            latency_target: params.latency_target,
            overdrive: params.overdrive,
            priority: params.priority,
            needs_memory: params.needs_memory,
            erasure: params.erasure,
            master_key: params.master_key,
            destination: params.destination,
            state: Mutex::new(DownloadChunkState {
                pieces_registered: 0,
                pieces_completed: 0,
                piece_usage: vec![false; num_pieces],
                completed_pieces: vec![false; num_pieces],
                physical_chunk_data: vec![None; num_pieces],
                workers_remaining: 0,
                workers_standby: VecDeque::new(),
                recovery_launched: false,
                recovery_complete: false,
                failed: false,
                memory: None,
            }),
        })
    }

    /// Byte window of each sector that must be fetched to recover the
    /// requested range.
    pub fn sector_window(&self) -> (u64, u64) {
        self.erasure
            .sector_offset_and_length(self.fetch_offset, self.fetch_length, self.piece_size)
    }

    /// Memory to reserve: one sector window per active fetch slot.
    pub fn memory_needed(&self) -> u64 {
        let (_, window) = self.sector_window();
        window * (self.erasure.min_pieces() + self.overdrive) as u64
    }

    pub(crate) fn set_memory(&self, grant: MemoryGrant) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.memory.is_none(), "memory granted twice for one chunk");
        state.memory = Some(grant);
    }

    /// Accounts for the workers this chunk is about to be distributed to.
    /// Must happen before the first `queue_download` so a fast worker's
    /// removal cannot zero the counter early.
    pub(crate) fn add_workers(&self, count: usize) {
        self.state.lock().unwrap().workers_remaining += count;
    }

    /// The worker-side decision for this chunk: drop, register a piece, or
    /// go on standby. Returns the claimed piece index when the worker
    /// should fetch. Dropping decrements `workers_remaining`; standby does
    /// not.
    pub(crate) fn process(self: &Arc<Self>, worker: &Arc<Worker>) -> Option<u64> {
        let piece_info = self.chunk_map.get(&worker.host_public_key()).copied();
        let mut dropped = false;
        let claimed = {
            let mut state = self.state.lock().unwrap();
            let min_pieces = self.erasure.min_pieces();
            let chunk_complete = state.recovery_launched
                || state.pieces_completed >= min_pieces
                || self.download.is_complete();
            let chunk_failed =
                state.failed || state.workers_remaining + state.pieces_completed < min_pieces;

            match piece_info {
                Some(piece) if !chunk_complete
                    && !chunk_failed
                    && !state.completed_pieces[piece.index as usize]
                    && !worker.on_download_cooldown() =>
                {
                    let pieces_in_progress = state.pieces_registered + state.pieces_completed;
                    let desired = min_pieces + self.overdrive;
                    let piece_taken = state.piece_usage[piece.index as usize];
                    if pieces_in_progress < desired && !piece_taken {
                        state.pieces_registered += 1;
                        state.piece_usage[piece.index as usize] = true;
                        Some(piece.index)
                    } else {
                        // Not needed right now; wait in line in case an
                        // active worker fails.
                        let host = worker.host_public_key();
                        if !state
                            .workers_standby
                            .iter()
                            .any(|w| w.host_public_key() == host)
                        {
                            state.workers_standby.push_back(worker.clone());
                        }
                        None
                    }
                }
                _ => {
                    dropped = true;
                    None
                }
            }
        };
        if dropped {
            self.remove_worker();
        }
        claimed
    }

    /// Undoes a registration after a failed fetch. The standby FIFO is
    /// tapped by the cleanup that follows the caller's `remove_worker`.
    pub(crate) fn unregister_worker(&self, piece_index: u64) {
        let mut state = self.state.lock().unwrap();
        state.pieces_registered -= 1;
        state.piece_usage[piece_index as usize] = false;
        self.audit(&state);
    }

    /// Deposits a fetched and decrypted piece. Returns true exactly once,
    /// when the K-th piece lands: the caller then spawns the recovery
    /// task.
    pub(crate) fn deposit_piece(&self, piece_index: u64, data: Vec<u8>) -> bool {
        let mut state = self.state.lock().unwrap();
        let idx = piece_index as usize;
        if state.completed_pieces[idx] {
            event!(
                Level::ERROR,
                chunk = self.chunk_index,
                piece = piece_index,
                "Piece deposited twice."
            );
            debug_assert!(false, "piece deposited twice");
            return false;
        }
        let min_pieces = self.erasure.min_pieces();

        if state.pieces_completed < min_pieces {
            state.physical_chunk_data[idx] = Some(data);
            self.download
                .add_data_received(self.fetch_length / min_pieces as u64);
        }
        state.completed_pieces[idx] = true;
        state.pieces_completed += 1;
        state.pieces_registered -= 1;
        self.audit(&state);

        if state.pieces_completed == min_pieces
            && !state.recovery_launched
            && !state.failed
            && !self.download.is_complete()
        {
            // Integer division above may not add up to the full fetch
            // length; settle the remainder when recovery becomes possible.
            let counted = min_pieces as u64 * (self.fetch_length / min_pieces as u64);
            self.download.add_data_received(self.fetch_length - counted);
            state.recovery_launched = true;
            return true;
        }
        false
    }

    /// Decrements `workers_remaining` for a worker that has finalized its
    /// involvement, then runs the shared cleanup.
    pub(crate) fn remove_worker(self: &Arc<Self>) {
        let actions = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.workers_remaining > 0, "workers_remaining underflow");
            state.workers_remaining = state.workers_remaining.saturating_sub(1);
            self.cleanup(&mut state)
        };
        self.run_actions(actions);
    }

    /// Runs cleanup without a worker removal, e.g. after a failed fetch
    /// reopened a piece slot or after recovery finished.
    pub(crate) fn managed_cleanup(self: &Arc<Self>) {
        let actions = {
            let mut state = self.state.lock().unwrap();
            self.cleanup(&mut state)
        };
        self.run_actions(actions);
    }

    // The catchall bookkeeping shared by every worker exit and by the
    // recovery task: detects newly-failed chunks, resurrects standby
    // workers, and releases memory exactly once at the end.
    fn cleanup(&self, state: &mut MutexGuard<'_, DownloadChunkState>) -> CleanupActions {
        let mut actions = CleanupActions::default();
        let min_pieces = self.erasure.min_pieces();

        if !state.failed
            && !state.recovery_launched
            && state.workers_remaining + state.pieces_completed < min_pieces
        {
            state.failed = true;
            for buffer in state.physical_chunk_data.iter_mut() {
                *buffer = None;
            }
            actions.fail_download = Some(DownloadError::ChunkUnrecoverable(self.chunk_index));
        }

        let finished = state.recovery_launched || state.failed || self.download.is_complete();
        if finished {
            // Hand the chunk back to every standby worker; each will drop
            // it and decrement workers_remaining.
            actions.requeue.extend(state.workers_standby.drain(..));
        } else {
            let in_progress = state.pieces_registered + state.pieces_completed;
            if in_progress < min_pieces + self.overdrive {
                if let Some(worker) = state.workers_standby.pop_front() {
                    actions.requeue.push(worker);
                }
            }
        }

        if state.workers_remaining == 0
            && (state.recovery_complete || state.failed || self.download.is_complete())
        {
            actions.release = state.memory.take();
            for buffer in state.physical_chunk_data.iter_mut() {
                *buffer = None;
            }
        }
        actions
    }

    fn run_actions(self: &Arc<Self>, actions: CleanupActions) {
        if let Some(err) = actions.fail_download {
            event!(
                Level::WARN,
                chunk = self.chunk_index,
                "Chunk can no longer be recovered."
            );
            self.download.fail(err);
        }
        for worker in actions.requeue {
            worker.queue_download(self.clone());
        }
        drop(actions.release);
    }

    /// The single recovery task for this chunk: decode off the worker
    /// threads, write the requested range into the destination, then
    /// finalize.
    pub(crate) async fn recover_and_write(self: Arc<Self>) {
        let pieces = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.physical_chunk_data)
        };

        let (sector_offset, sector_length) = self.sector_window();
        let min_pieces = self.erasure.min_pieces();
        let recovered_len = (min_pieces as u64 * sector_length) as usize;
        let erasure = self.erasure.clone();
        let decoded = tokio::task::spawn_blocking(move || erasure.recover(pieces, recovered_len))
            .await
            .unwrap_or(Err(crate::errors::ErasureError::ShardMismatch));

        let result = match decoded {
            Ok(data) => {
                // The recovered region starts at the chunk offset the
                // sector window maps to.
                let region_start = sector_offset * min_pieces as u64;
                let begin = (self.fetch_offset - region_start) as usize;
                let end = begin + self.fetch_length as usize;
                self.destination
                    .write_at(self.write_offset, &data[begin..end])
                    .await
                    .map_err(|e| DownloadError::Destination(e.to_string()))
            }
            Err(e) => Err(DownloadError::from(e)),
        };

        match result {
            Ok(()) => {
                event!(
                    Level::DEBUG,
                    chunk = self.chunk_index,
                    "Chunk recovered and written."
                );
                self.download.chunk_finished();
            }
            Err(e) => {
                self.state.lock().unwrap().failed = true;
                self.download.fail(e);
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.recovery_complete = true;
        }
        self.managed_cleanup();
    }

    // Registered and completed counts must always equal the claimed piece
    // slots; a mismatch means a registration leaked.
    fn audit(&self, state: &DownloadChunkState) {
        let claimed = state.piece_usage.iter().filter(|u| **u).count();
        if claimed != state.pieces_registered + state.pieces_completed {
            event!(
                Level::ERROR,
                chunk = self.chunk_index,
                claimed,
                registered = state.pieces_registered,
                completed = state.pieces_completed,
                "Piece bookkeeping out of balance."
            );
            debug_assert!(false, "piece bookkeeping out of balance");
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (usize, usize, usize, bool, bool) {
        let state = self.state.lock().unwrap();
        (
            state.pieces_registered,
            state.pieces_completed,
            state.workers_remaining,
            state.recovery_launched,
            state.memory.is_some(),
        )
    }

    #[cfg(test)]
    pub(crate) fn standby_len(&self) -> usize {
        self.state.lock().unwrap().workers_standby.len()
    }
}
