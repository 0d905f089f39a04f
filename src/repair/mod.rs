// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

// The repair pipeline: a background loop walks the directory tree by
// worst aggregated health, builds an unfinished-upload record for every
// chunk short of full redundancy, and pushes them into the upload heap.
// The inner scheduler pops the best chunk, reserves low-priority memory,
// and hands the chunk to every worker. A sibling loop retries previously
// abandoned (stuck) chunks on its own timer, one random pick at a time.

pub mod chunk;
pub mod heap;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use rand::prelude::IndexedRandom;

use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;

use tracing::{event, Level};

use crate::errors::MemoryError;
use crate::filesystem::FileEntry;
use crate::hostdb::HostPublicKey;
use crate::memory_manager::MemoryPriority;
use crate::renter::{HostSets, Renter};
use crate::repair::chunk::{UnfinishedUploadChunk, UploadChunkId, UploadChunkParams};

// A file already at least this healthy when one of its chunks is popped
// gets its recent-repair time stamped, so the directory walker stops
// re-selecting it while the finishing touches land.
const HEALTHY_ENOUGH: f64 = 0.8;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RepairTarget {
    StuckChunks,
    UnstuckChunks,
}

/// Builds the unfinished-upload records for one file: every chunk of the
/// requested class whose piece set is short of full redundancy. A file
/// with fewer usable hosts than its minimum piece count cannot be helped;
/// all of its chunks are marked stuck instead.
pub(crate) fn build_unfinished_chunks(
    renter: &Arc<Renter>,
    file: &Arc<FileEntry>,
    hosts: &HostSets,
    target: RepairTarget,
    stuck_repair: bool,
) -> Vec<Arc<UnfinishedUploadChunk>> {
    if hosts.renew.len() < file.min_pieces() {
        event!(
            Level::DEBUG,
            path = %file.path(),
            usable = hosts.renew.len(),
            needed = file.min_pieces(),
            "Not enough usable hosts to repair file; marking all chunks stuck."
        );
        file.mark_all_chunks_stuck();
        return Vec::new();
    }

    let num_pieces = file.num_pieces();
    let mut built = Vec::new();
    for index in 0..file.num_chunks() {
        let chunk_stuck = match file.stuck(index) {
            Ok(stuck) => stuck,
            Err(_) => continue,
        };
        if (target == RepairTarget::StuckChunks) != chunk_stuck {
            continue;
        }
        let pieces = match file.pieces(index) {
            Ok(pieces) => pieces,
            Err(_) => continue,
        };

        // Walk the metadata and mark which hosts already hold a piece.
        // Removing a host from the candidate set without marking usage
        // covers hosts that hold a redundant copy of a taken index.
        let mut unused_hosts: HashSet<HostPublicKey> = hosts.renew.clone();
        let mut piece_usage = vec![false; num_pieces];
        let mut pieces_completed = 0usize;
        for (piece_index, piece_set) in pieces.iter().enumerate() {
            for piece in piece_set {
                let good_for_renew = renter
                    .contractor
                    .contract_utility(&piece.host)
                    .map(|utility| utility.good_for_renew)
                    .unwrap_or(false);
                if !good_for_renew {
                    continue;
                }
                if unused_hosts.remove(&piece.host) && !piece_usage[piece_index] {
                    piece_usage[piece_index] = true;
                    pieces_completed += 1;
                }
            }
        }
        if pieces_completed >= num_pieces {
            // Fully redundant again, e.g. soured contracts recovered. A
            // stuck chunk in this state only needs its flag cleared.
            if chunk_stuck {
                let _ = file.mark_stuck(index, false);
            }
            continue;
        }

        built.push(UnfinishedUploadChunk::new(
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
                stuck: chunk_stuck,
                erasure: file.erasure(),
                master_key: file.master_key(),
                piece_usage,
                pieces_completed,
                unused_hosts,
                heap: renter.upload_heap.clone(),
                filesystem: renter.filesystem.clone(),
                repair_needed_tx: renter.repair_needed_tx.clone(),
            },
            stuck_repair,
        ));
    }
    built
}

/// The background repair task. Sleeps until the renter is online and some
/// directory's health falls below the repair threshold, then builds and
/// works through the upload heap.
pub(crate) async fn repair_loop(
    renter: Arc<Renter>,
    mut new_uploads_rx: mpsc::Receiver<()>,
    mut repair_needed_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        if renter.is_stopped() {
            return;
        }
        if !renter.block_until_online(&mut shutdown_rx).await {
            return;
        }

        let hosts = renter.refresh_worker_pool();
        renter.filesystem.apply_health_updates(&hosts.renew);

        let worst = renter.filesystem.worst_health_directory(&hosts.renew);
        let needs_repair = worst
            .as_ref()
            .is_some_and(|(_, health)| *health < renter.settings.remote_repair_threshold);
        if !needs_repair {
            // Block until new work is required.
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                _ = new_uploads_rx.recv() => {}
                _ = repair_needed_rx.recv() => {}
            }
            continue;
        }
        let (dir, dir_health) = worst.expect("needs_repair implies a directory");

        for file in renter.filesystem.files_in_dir(&dir) {
            // Skip files repaired a moment ago; the directory walk will
            // find them again once their health information catches up.
            let recently = file
                .recent_repair_time()
                .is_some_and(|t| t.elapsed() < renter.settings.file_repair_interval());
            if recently {
                continue;
            }
            for uuc in
                build_unfinished_chunks(&renter, &file, &hosts, RepairTarget::UnstuckChunks, false)
            {
                renter.upload_heap.push(uuc);
            }
        }

        if renter.upload_heap.is_empty() {
            event!(
                Level::DEBUG,
                dir = %dir,
                health = dir_health,
                "No chunks queued for repair despite degraded health."
            );
            // Nothing buildable right now (chunks stuck, files recently
            // repaired). Wait for a signal rather than spinning.
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                _ = new_uploads_rx.recv() => {}
                _ = repair_needed_rx.recv() => {}
                _ = sleep(renter.settings.rebuild_chunk_heap_interval()) => {}
            }
            continue;
        }
        event!(
            Level::DEBUG,
            dir = %dir,
            health = dir_health,
            chunks = renter.upload_heap.len(),
            "Repairing chunks from directory."
        );

        repair_loop_inner(&renter, &mut shutdown_rx).await;
    }
}

// Works through the upload heap until it drains, the rebuild interval
// elapses, or enough chunks have been dispatched that the directory walk
// should refresh the set.
async fn repair_loop_inner(renter: &Arc<Renter>, shutdown_rx: &mut broadcast::Receiver<()>) {
    let mut consecutive_repairs = 0usize;
    let rebuild_deadline = Instant::now() + renter.settings.rebuild_chunk_heap_interval();

    while consecutive_repairs < renter.settings.max_consecutive_chunk_repairs
        && Instant::now() < rebuild_deadline
        && !renter.is_stopped()
    {
        let Some(uuc) = renter.upload_heap.pop() else {
            return;
        };

        if uuc.file.cached_health() >= HEALTHY_ENOUGH {
            uuc.file.update_recent_repair_time();
        }

        // Without at least K workers the chunk cannot reach minimum
        // redundancy; leave it for the stuck loop to retry later.
        let workers = renter.workers();
        if workers.len() < uuc.min_pieces() {
            if let Err(e) = uuc.file.mark_stuck(uuc.index, true) {
                event!(Level::WARN, error = %e, "Unable to mark chunk as stuck.");
            }
            renter.upload_heap.mark_repair_complete(uuc.id);
            renter
                .filesystem
                .queue_health_update(uuc.file.path().parent());
            continue;
        }

        // Block on memory; repair runs at low priority so interactive
        // downloads overtake it.
        let request = renter
            .memory
            .request(uuc.memory_needed(), MemoryPriority::Low);
        let grant = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                renter.upload_heap.mark_repair_complete(uuc.id);
                return;
            }
            grant = request => grant,
        };
        match grant {
            Ok(grant) => uuc.set_memory(grant),
            Err(MemoryError::RequestTooLarge { requested, total }) => {
                event!(
                    Level::ERROR,
                    requested,
                    total,
                    "Chunk repair needs more memory than the pool holds."
                );
                let _ = uuc.file.mark_stuck(uuc.index, true);
                renter.upload_heap.mark_repair_complete(uuc.id);
                continue;
            }
            Err(MemoryError::ManagerShutdown) => {
                renter.upload_heap.mark_repair_complete(uuc.id);
                return;
            }
        }

        uuc.add_workers(workers.len());
        for worker in &workers {
            worker.queue_upload(uuc.clone());
        }
        consecutive_repairs += 1;
    }

    // Yield back to the directory walker. Stuck chunks drained here were
    // queued deliberately; put them back rather than discarding them.
    let mut stuck_chunks = Vec::new();
    while let Some(uuc) = renter.upload_heap.pop() {
        renter.upload_heap.mark_repair_complete(uuc.id);
        if uuc.stuck {
            stuck_chunks.push(uuc);
        }
    }
    for uuc in stuck_chunks {
        renter.upload_heap.push(uuc);
    }
}

/// The stuck-chunk retry task. Each tick (or `stuck_chunk_found` signal)
/// it picks one stuck chunk at random from a random file and queues it
/// with a fresh worker set, flagged so a success is reported.
pub(crate) async fn stuck_loop(
    renter: Arc<Renter>,
    mut stuck_found_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = sleep(renter.settings.stuck_loop_interval()) => {}
            _ = stuck_found_rx.recv() => {}
        }
        if renter.is_stopped() {
            return;
        }
        if !renter.is_online() {
            continue;
        }

        let hosts = renter.refresh_worker_pool();
        let stuck_files: Vec<_> = renter
            .filesystem
            .all_files()
            .into_iter()
            .filter(|f| f.num_stuck_chunks() > 0)
            .collect();
        let Some(file) = stuck_files.choose(&mut rand::rng()).cloned() else {
            continue;
        };

        let candidates =
            build_unfinished_chunks(&renter, &file, &hosts, RepairTarget::StuckChunks, true);
        let Some(uuc) = candidates.choose(&mut rand::rng()).cloned() else {
            continue;
        };
        event!(
            Level::DEBUG,
            path = %file.path(),
            chunk = uuc.index,
            "Giving a stuck chunk another repair attempt."
        );
        if renter.upload_heap.push(uuc) {
            let _ = renter.repair_needed_tx.try_send(());
        }
    }
}
