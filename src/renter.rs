// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use tracing::{event, Level};

use crate::config::Settings;
use crate::crypto::MasterKey;
use crate::download::destination::DownloadDestination;
use crate::download::heap::DownloadHeap;
use crate::download::{plan_download, Download, DownloadPlan};
use crate::erasure::ErasureCoder;
use crate::errors::{DownloadError, FilesystemError, UploadError};
use crate::filesystem::{ChunkSource, FileEntry, FilePath, FileSet};
use crate::hostdb::{HostContractor, HostPublicKey};
use crate::memory_manager::{MemoryManager, MemoryManagerClient};
use crate::repair::heap::UploadHeap;
use crate::worker::Worker;

/// Parameters for registering a new file. The actual piece placement is
/// driven by the repair loop, which treats a freshly registered file as a
/// fully unhealthy one.
pub struct UploadParams {
    pub path: FilePath,
    pub source: PathBuf,
    pub min_pieces: usize,
    pub num_pieces: usize,
    pub piece_size: u64,
}

/// Parameters for a download. A `length` of zero means "the rest of the
/// file from `offset`".
pub struct DownloadParams {
    pub path: FilePath,
    pub offset: u64,
    pub length: u64,
    pub destination: Arc<dyn DownloadDestination>,
    pub priority: Option<u64>,
    pub overdrive: Option<usize>,
    pub latency_target: Option<Duration>,
}

/// The host sets a repair pass works against: contracts still worth
/// renewing count toward redundancy; the same set seeds each chunk's
/// candidate hosts.
pub(crate) struct HostSets {
    pub renew: HashSet<HostPublicKey>,
}

/// The renter core: wires the memory manager, the repair/stuck/download
/// loops, and the per-host worker pool together, and exposes the
/// upload/download surface the API layer calls.
pub struct Renter {
    pub settings: Arc<Settings>,
    pub(crate) memory: MemoryManagerClient,
    pub(crate) contractor: Arc<dyn HostContractor>,
    pub filesystem: Arc<FileSet>,
    pub(crate) upload_heap: Arc<UploadHeap>,
    pub(crate) download_heap: Arc<DownloadHeap>,

    workers: Mutex<HashMap<HostPublicKey, Arc<Worker>>>,

    online_tx: watch::Sender<bool>,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,

    pub(crate) new_uploads_tx: mpsc::Sender<()>,
    pub(crate) repair_needed_tx: mpsc::Sender<()>,
    pub(crate) stuck_found_tx: mpsc::Sender<()>,
    pub(crate) new_downloads_tx: mpsc::Sender<()>,
}

impl Renter {
    /// Builds the renter and spawns its background tasks: the memory
    /// manager, the repair loop, the stuck-chunk loop and the download
    /// scheduler. The renter starts online.
    pub fn new(settings: Settings, contractor: Arc<dyn HostContractor>) -> Arc<Self> {
        let settings = Arc::new(settings);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (online_tx, _) = watch::channel(true);

        // Edge-trigger signals: non-blocking sends, drop-on-full.
        let (new_uploads_tx, new_uploads_rx) = mpsc::channel(1);
        let (repair_needed_tx, repair_needed_rx) = mpsc::channel(1);
        let (stuck_found_tx, stuck_found_rx) = mpsc::channel(1);
        let (new_downloads_tx, new_downloads_rx) = mpsc::channel(1);

        let (memory_actor, memory) =
            MemoryManager::new(settings.memory_pool_bytes, shutdown_tx.clone());
        tokio::spawn(memory_actor.run());

        let renter = Arc::new(Self {
            settings,
            memory,
            contractor,
            filesystem: Arc::new(FileSet::new()),
            upload_heap: Arc::new(UploadHeap::new()),
            download_heap: Arc::new(DownloadHeap::new()),
            workers: Mutex::new(HashMap::new()),
            online_tx,
            stopped: AtomicBool::new(false),
            shutdown_tx,
            new_uploads_tx,
            repair_needed_tx,
            stuck_found_tx,
            new_downloads_tx,
        });

        tokio::spawn(crate::repair::repair_loop(
            renter.clone(),
            new_uploads_rx,
            repair_needed_rx,
            renter.shutdown_tx.subscribe(),
        ));
        tokio::spawn(crate::repair::stuck_loop(
            renter.clone(),
            stuck_found_rx,
            renter.shutdown_tx.subscribe(),
        ));
        tokio::spawn(crate::download::download_loop(
            renter.clone(),
            new_downloads_rx,
            renter.shutdown_tx.subscribe(),
        ));

        renter
    }

    /// Signals every loop and worker to stop and drains the worker
    /// queues. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let workers: Vec<_> = self.workers.lock().unwrap().values().cloned().collect();
        for worker in workers {
            worker.kill();
        }
        event!(Level::INFO, "Renter shut down.");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Marks the renter online or offline. The repair loop blocks while
    /// offline; in-flight work is unaffected.
    pub fn set_online(&self, online: bool) {
        let _ = self.online_tx.send(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.subscribe().borrow()
    }

    pub(crate) async fn block_until_online(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let mut online_rx = self.online_tx.subscribe();
        loop {
            if *online_rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return false,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// The current worker pool, one worker per live contract.
    pub(crate) fn workers(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<_> = self.workers.lock().unwrap().values().cloned().collect();
        workers.sort_by_key(|w| w.host_public_key());
        workers
    }

    pub fn num_workers(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Reconciles the worker pool with the contract directory: spawns
    /// workers for new contracts, kills workers whose contract is gone,
    /// and flips the upload gate on workers whose contract soured for
    /// uploads. Returns the host sets the repair pass should use.
    pub(crate) fn refresh_worker_pool(self: &Arc<Self>) -> HostSets {
        let contracts = self.contractor.contracts();
        let mut renew = HashSet::new();
        let mut live = HashSet::new();

        let mut pool = self.workers.lock().unwrap();
        for contract in contracts {
            let host = contract.host_public_key;
            live.insert(host);
            if contract.utility.good_for_renew {
                renew.insert(host);
            }

            let worker = pool.entry(host).or_insert_with(|| {
                event!(Level::DEBUG, host = %host, "Spawning worker for new contract.");
                let worker =
                    Worker::new(host, self.contractor.clone(), self.settings.clone());
                tokio::spawn(worker.clone().run(self.shutdown_tx.subscribe()));
                worker
            });
            worker.set_upload_allowed(contract.utility.good_for_upload);
        }

        let dead: Vec<_> = pool
            .keys()
            .filter(|host| !live.contains(*host))
            .copied()
            .collect();
        for host in dead {
            if let Some(worker) = pool.remove(&host) {
                event!(Level::DEBUG, host = %host, "Killing worker; contract gone.");
                worker.kill();
            }
        }

        HostSets { renew }
    }

    /// Registers a file for upload. Placement happens asynchronously via
    /// the repair loop, which sees the new file as fully unhealthy.
    pub async fn upload(&self, params: UploadParams) -> Result<Arc<FileEntry>, UploadError> {
        let metadata = tokio::fs::metadata(&params.source)
            .await
            .map_err(|e| UploadError::Source(e.to_string()))?;
        let erasure = ErasureCoder::new(params.min_pieces, params.num_pieces)
            .map_err(|_| UploadError::BadParameters(params.min_pieces, params.num_pieces))?;

        let entry = self.filesystem.create_file(
            params.path,
            Some(ChunkSource::Local(params.source)),
            metadata.len(),
            params.piece_size,
            Arc::new(erasure),
            MasterKey::generate(),
        )?;
        let _ = self.new_uploads_tx.try_send(());
        Ok(entry)
    }

    /// Plans and queues a download, returning its handle. Planner errors
    /// (unknown path, bad range) surface synchronously.
    fn managed_download(&self, params: DownloadParams) -> Result<Arc<Download>, DownloadError> {
        let file = self.filesystem.open(&params.path)?;
        let mut length = params.length;
        if length == 0 {
            if params.offset > file.size() {
                return Err(DownloadError::PastFileBoundary);
            }
            length = file.size() - params.offset;
        }

        let (download, chunks) = plan_download(DownloadPlan {
            file,
            offset: params.offset,
            length,
            destination: params.destination,
            priority: params.priority.unwrap_or(self.settings.default_priority),
            overdrive: params.overdrive.unwrap_or(self.settings.default_overdrive),
            latency_target: params
                .latency_target
                .unwrap_or_else(|| self.settings.default_latency_target()),
            latency_stagger: Duration::from_millis(self.settings.latency_stagger_ms),
            needs_memory: true,
        })?;

        for chunk in chunks {
            self.download_heap.push(chunk);
        }
        let _ = self.new_downloads_tx.try_send(());
        Ok(download)
    }

    /// Downloads a byte range and blocks until it completes or fails.
    pub async fn download(&self, params: DownloadParams) -> Result<(), DownloadError> {
        let download = self.managed_download(params)?;
        download.join().await
    }

    /// Starts a download without waiting for it. The optional callback
    /// runs on completion, before waiters on the handle wake; the handle
    /// cancels the download when asked.
    pub fn download_async(
        &self,
        params: DownloadParams,
        on_complete: Option<Box<dyn FnOnce(Option<DownloadError>) + Send + 'static>>,
    ) -> Result<Arc<Download>, DownloadError> {
        let download = self.managed_download(params)?;
        if let Some(callback) = on_complete {
            download.on_complete(callback);
        }
        Ok(download)
    }

    /// Sets or clears the stuck flag on every chunk of a file. Clearing
    /// makes the file eligible for the regular repair walk again; setting
    /// hands it to the stuck loop.
    pub fn set_file_stuck(&self, path: &FilePath, stuck: bool) -> Result<(), FilesystemError> {
        let file = self.filesystem.open(path)?;
        if stuck {
            file.mark_all_chunks_stuck();
            let _ = self.stuck_found_tx.try_send(());
        } else {
            for index in 0..file.num_chunks() {
                file.mark_stuck(index, false)?;
            }
            let _ = self.repair_needed_tx.try_send(());
        }
        Ok(())
    }

    /// Repoints the local repair source of a file, for when the original
    /// upload path moved or a fresh copy becomes available.
    pub fn set_file_repair_path(
        &self,
        path: &FilePath,
        source: Option<PathBuf>,
    ) -> Result<(), FilesystemError> {
        let file = self.filesystem.open(path)?;
        file.set_repair_source(source.map(ChunkSource::Local));
        let _ = self.repair_needed_tx.try_send(());
        Ok(())
    }
}
