// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

// The download pipeline: a requested byte range is split into its chunks,
// each chunk becomes an unfinished-download record in the download heap,
// and a scheduler distributes popped chunks to every worker. Workers
// decide for themselves whether they are useful for a chunk, register for
// a piece or go on standby, and the worker that deposits the K-th piece
// spawns the single recovery task that decodes and writes the result.

pub mod chunk;
pub mod destination;
pub mod heap;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};

use tracing::{event, Level};

use crate::download::chunk::{DownloadPieceInfo, UnfinishedDownloadChunk};
use crate::download::destination::DownloadDestination;
use crate::errors::DownloadError;
use crate::filesystem::{FileEntry, FilePath};
use crate::memory_manager::MemoryPriority;
use crate::renter::Renter;

type CompleteFn = Box<dyn FnOnce(Option<DownloadError>) + Send + 'static>;

struct DownloadState {
    complete: bool,
    err: Option<DownloadError>,
    callbacks: Vec<CompleteFn>,
    chunks_remaining: u64,
    end_time: Option<Instant>,
}

/// A queued file download. Shared by the planner, every worker touching
/// one of its chunks, and the per-chunk recovery tasks.
pub struct Download {
    // Incremented as recoverable data completes; stops at the requested
    // length. Includes only payload progress.
    data_received: AtomicU64,
    // Incremented as any data arrives, overdrive included.
    total_data_transferred: AtomicU64,

    path: FilePath,
    offset: u64,
    length: u64,
    start_time: Instant,

    state: Mutex<DownloadState>,
    complete_tx: watch::Sender<bool>,
    complete_rx: watch::Receiver<bool>,
}

impl Download {
    fn new(path: FilePath, offset: u64, length: u64, chunks_remaining: u64) -> Arc<Self> {
        let (complete_tx, complete_rx) = watch::channel(false);
        Arc::new(Self {
            data_received: AtomicU64::new(0),
            total_data_transferred: AtomicU64::new(0),
            path,
            offset,
            length,
            start_time: Instant::now(),
            state: Mutex::new(DownloadState {
                complete: false,
                err: None,
                callbacks: Vec::new(),
                chunks_remaining,
                end_time: None,
            }),
            complete_tx,
            complete_rx,
        })
    }

    pub fn path(&self) -> &FilePath {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.state.lock().unwrap().end_time
    }

    pub fn data_received(&self) -> u64 {
        self.data_received.load(Ordering::Relaxed)
    }

    pub fn total_data_transferred(&self) -> u64 {
        self.total_data_transferred.load(Ordering::Relaxed)
    }

    pub(crate) fn add_data_received(&self, bytes: u64) {
        self.data_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_total_transferred(&self, bytes: u64) {
        self.total_data_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().complete
    }

    pub fn err(&self) -> Option<DownloadError> {
        self.state.lock().unwrap().err.clone()
    }

    /// Cancels the download by failing it. In-flight workers observe the
    /// completed download on their next lock acquisition and drop their
    /// chunks. Cancelling a finished download is a no-op.
    pub fn cancel(&self) {
        if self.is_complete() {
            return;
        }
        self.fail(DownloadError::Cancelled);
    }

    /// Marks the download complete with an error. The first recorded
    /// error wins; failing an already-succeeded download is a programming
    /// error worth reporting.
    pub fn fail(&self, err: DownloadError) {
        self.finish(Some(err));
    }

    /// Registers a callback to run when the download completes, in
    /// registration order, before the completion latch observers wake. If
    /// the download is already complete the callback runs immediately.
    pub fn on_complete(&self, f: CompleteFn) {
        let mut state = self.state.lock().unwrap();
        if state.complete {
            let err = state.err.clone();
            drop(state);
            f(err);
        } else {
            state.callbacks.push(f);
        }
    }

    /// Waits for the completion latch, then reports the download outcome.
    pub async fn join(&self) -> Result<(), DownloadError> {
        let mut rx = self.complete_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Called by a chunk's recovery task after its data is written out.
    /// The last chunk completes the download.
    pub(crate) fn chunk_finished(&self) {
        let finished = {
            let mut state = self.state.lock().unwrap();
            state.chunks_remaining = state.chunks_remaining.saturating_sub(1);
            state.chunks_remaining == 0 && !state.complete
        };
        if finished {
            self.finish(None);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_download() -> Arc<Self> {
        Download::new(FilePath::new("test/file"), 0, 1024, 1)
    }

    fn finish(&self, err: Option<DownloadError>) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if state.complete {
                // A cancel that lost the race to completion is a no-op;
                // any other late failure is a programming error.
                let late_error = err
                    .as_ref()
                    .is_some_and(|e| !matches!(e, DownloadError::Cancelled));
                if late_error && state.err.is_none() {
                    event!(
                        Level::ERROR,
                        path = %self.path,
                        "Download already completed without error, then failed."
                    );
                    debug_assert!(false, "failing an already-succeeded download");
                }
                return;
            }
            state.complete = true;
            state.err = err.clone();
            state.end_time = Some(Instant::now());
            std::mem::take(&mut state.callbacks)
        };
        // Callbacks run in registration order before the latch observers
        // wake, so waiting on `join` implies the callbacks are done.
        for callback in callbacks {
            callback(err.clone());
        }
        let _ = self.complete_tx.send(true);
    }
}

/// Everything the planner needs to split a byte range into chunks.
pub(crate) struct DownloadPlan {
    pub file: Arc<FileEntry>,
    pub offset: u64,
    pub length: u64,
    pub destination: Arc<dyn DownloadDestination>,
    pub priority: u64,
    pub overdrive: usize,
    pub latency_target: Duration,
    pub latency_stagger: Duration,
    pub needs_memory: bool,
}

/// Splits the requested range into per-chunk download records. A range
/// that ends exactly on a chunk boundary does not touch the next chunk.
/// Returns the download handle plus the chunks to push into the heap.
pub(crate) fn plan_download(
    plan: DownloadPlan,
) -> Result<(Arc<Download>, Vec<Arc<UnfinishedDownloadChunk>>), DownloadError> {
    let file = &plan.file;
    if plan.offset == file.size() && file.size() != 0 {
        return Err(DownloadError::OffsetEqualsFilesize);
    }
    if plan.offset + plan.length > file.size() {
        return Err(DownloadError::PastFileBoundary);
    }

    let download = Download::new(file.path().clone(), plan.offset, plan.length, 0);
    if plan.length == 0 {
        download.finish(None);
        return Ok((download, Vec::new()));
    }

    let (min_chunk, min_chunk_offset) = file.chunk_index_by_offset(plan.offset);
    let (mut max_chunk, max_chunk_offset) = file.chunk_index_by_offset(plan.offset + plan.length);
    if max_chunk > 0 && max_chunk_offset == 0 {
        max_chunk -= 1;
    }
    if min_chunk >= file.num_chunks() || max_chunk >= file.num_chunks() {
        return Err(DownloadError::PastFileBoundary);
    }

    download.state.lock().unwrap().chunks_remaining = max_chunk - min_chunk + 1;

    let mut chunks = Vec::with_capacity((max_chunk - min_chunk + 1) as usize);
    let mut write_offset = 0u64;
    for chunk_index in min_chunk..=max_chunk {
        // Host -> piece mapping from file metadata. The same host holding
        // two pieces of one chunk is a metadata defect; keep the first.
        let mut chunk_map = HashMap::new();
        for (piece_index, piece_set) in file.pieces(chunk_index)?.into_iter().enumerate() {
            for piece in piece_set {
                if chunk_map.contains_key(&piece.host) {
                    event!(
                        Level::ERROR,
                        path = %file.path(),
                        chunk = chunk_index,
                        host = %piece.host,
                        "Host has multiple pieces of the same chunk."
                    );
                    continue;
                }
                chunk_map.insert(
                    piece.host,
                    DownloadPieceInfo {
                        index: piece_index as u64,
                        root: piece.root,
                    },
                );
            }
        }

        let fetch_offset = if chunk_index == min_chunk {
            min_chunk_offset
        } else {
            0
        };
        let fetch_length = if chunk_index == max_chunk && max_chunk_offset != 0 {
            max_chunk_offset - fetch_offset
        } else {
            file.chunk_size() - fetch_offset
        };

        // Later chunks tolerate slower workers: each chunk's latency
        // target grows by a small stagger so slow hosts pick up the tail.
        let ordinal = chunk_index - min_chunk;
        let latency_target = plan.latency_target + plan.latency_stagger * ordinal as u32;

        chunks.push(UnfinishedDownloadChunk::new(
            download.clone(),
            chunk::DownloadChunkParams {
                chunk_index,
                chunk_map,
                piece_size: file.piece_size(),
                fetch_offset,
                fetch_length,
                write_offset,
                latency_target,
                overdrive: plan.overdrive,
                priority: plan.priority,
                needs_memory: plan.needs_memory,
                erasure: file.erasure(),
                master_key: file.master_key(),
                destination: plan.destination.clone(),
            },
        ));
        write_offset += fetch_length;
    }

    Ok((download, chunks))
}

/// Background task: pops planned chunks off the download heap, reserves
/// memory for those that need it, and hands each chunk to every worker.
pub(crate) async fn download_loop(
    renter: Arc<Renter>,
    mut new_downloads_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        while let Some(udc) = renter.download_heap.pop() {
            if udc.download.is_complete() {
                // Cancelled or failed while still queued.
                continue;
            }

            if udc.needs_memory {
                let request = renter.memory.request(udc.memory_needed(), MemoryPriority::High);
                let grant = tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => return,
                    grant = request => grant,
                };
                match grant {
                    Ok(grant) => udc.set_memory(grant),
                    Err(e) => {
                        event!(Level::ERROR, error = %e, "Memory request for download failed.");
                        udc.download.fail(DownloadError::Shutdown);
                        continue;
                    }
                }
            }

            renter.refresh_worker_pool();
            let workers = renter.workers();
            if workers.is_empty() {
                udc.download
                    .fail(DownloadError::ChunkUnrecoverable(udc.chunk_index));
                continue;
            }
            udc.add_workers(workers.len());
            for worker in workers {
                worker.queue_download(udc.clone());
            }
        }

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            received = new_downloads_rx.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::download::destination::DestinationBuffer;
    use crate::erasure::ErasureCoder;
    use crate::filesystem::FileSet;
    use std::sync::atomic::AtomicUsize;

    fn plan_for(file: Arc<FileEntry>, offset: u64, length: u64) -> DownloadPlan {
        DownloadPlan {
            file,
            offset,
            length,
            destination: Arc::new(DestinationBuffer::new()),
            priority: 5,
            overdrive: 0,
            latency_target: Duration::from_millis(100),
            latency_stagger: Duration::from_millis(25),
            needs_memory: true,
        }
    }

    // chunk_size = 2 * 64 = 128 bytes, 4 chunks.
    fn test_file(size: u64) -> Arc<FileEntry> {
        let set = FileSet::new();
        set.create_file(
            FilePath::new("dir/file"),
            None,
            size,
            64,
            Arc::new(ErasureCoder::new(2, 4).unwrap()),
            MasterKey::generate(),
        )
        .unwrap()
    }

    #[test]
    fn test_plan_splits_range_into_chunks() {
        let file = test_file(512);
        let (download, chunks) = plan_download(plan_for(file, 100, 200)).unwrap();
        // Bytes [100, 300) span chunks 0..2.
        assert_eq!(chunks.len(), 3);
        assert_eq!(download.length(), 200);

        assert_eq!(chunks[0].fetch_offset, 100);
        assert_eq!(chunks[0].fetch_length, 28);
        assert_eq!(chunks[0].write_offset, 0);

        assert_eq!(chunks[1].fetch_offset, 0);
        assert_eq!(chunks[1].fetch_length, 128);
        assert_eq!(chunks[1].write_offset, 28);

        assert_eq!(chunks[2].fetch_offset, 0);
        assert_eq!(chunks[2].fetch_length, 44);
        assert_eq!(chunks[2].write_offset, 156);
    }

    #[test]
    fn test_plan_boundary_does_not_touch_next_chunk() {
        let file = test_file(512);
        // Ends exactly on the chunk 0 / chunk 1 boundary.
        let (_, chunks) = plan_download(plan_for(file, 0, 128)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].fetch_length, 128);
    }

    #[test]
    fn test_plan_latency_stagger() {
        let file = test_file(512);
        let (_, chunks) = plan_download(plan_for(file, 0, 384)).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].latency_target, Duration::from_millis(100));
        assert_eq!(chunks[1].latency_target, Duration::from_millis(125));
        assert_eq!(chunks[2].latency_target, Duration::from_millis(150));
    }

    #[test]
    fn test_plan_zero_length_completes_immediately() {
        let file = test_file(0);
        let (download, chunks) = plan_download(plan_for(file, 0, 0)).unwrap();
        assert!(chunks.is_empty());
        assert!(download.is_complete());
        assert!(download.err().is_none());
    }

    #[test]
    fn test_plan_rejects_bad_ranges() {
        let file = test_file(512);
        assert!(matches!(
            plan_download(plan_for(file.clone(), 512, 0)),
            Err(DownloadError::OffsetEqualsFilesize)
        ));
        assert!(matches!(
            plan_download(plan_for(file, 500, 100)),
            Err(DownloadError::PastFileBoundary)
        ));
    }

    #[tokio::test]
    async fn test_download_completes_after_last_chunk() {
        let download = Download::new(FilePath::new("a/b"), 0, 256, 2);
        assert!(!download.is_complete());
        download.chunk_finished();
        assert!(!download.is_complete());
        download.chunk_finished();
        assert!(download.is_complete());
        assert!(download.err().is_none());
        assert!(download.join().await.is_ok());
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let download = Download::new(FilePath::new("a/b"), 0, 256, 2);
        download.fail(DownloadError::ChunkUnrecoverable(0));
        download.fail(DownloadError::Cancelled);
        assert!(matches!(
            download.err(),
            Some(DownloadError::ChunkUnrecoverable(0))
        ));
        assert!(matches!(
            download.join().await,
            Err(DownloadError::ChunkUnrecoverable(0))
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_noop_after_success() {
        let download = Download::new(FilePath::new("a/b"), 0, 256, 1);
        download.chunk_finished();
        assert!(download.is_complete());

        // Cancelling a finished download changes nothing.
        download.cancel();
        download.cancel();
        assert!(download.err().is_none());
    }

    #[tokio::test]
    async fn test_callbacks_run_in_registration_order_before_join_wakes() {
        let download = Download::new(FilePath::new("a/b"), 0, 256, 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let order = order.clone();
            let counter = counter.clone();
            download.on_complete(Box::new(move |err| {
                assert!(err.is_none());
                order.lock().unwrap().push(i);
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }

        download.chunk_finished();
        download.join().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        // Registering after completion runs immediately, exactly once.
        let counter_clone = counter.clone();
        download.on_complete(Box::new(move |_| {
            counter_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
