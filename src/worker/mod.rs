// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

// One worker per host the renter holds a contract with. A worker owns an
// upload queue and a download queue, runs one task at a time, and backs
// off per work class after consecutive failures. Chunks are distributed
// to every worker; the worker decides per chunk whether it is useful.

mod download;
mod upload;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::Notify;

use tracing::{event, Level};

use crate::config::Settings;
use crate::download::chunk::UnfinishedDownloadChunk;
use crate::hostdb::{HostContractor, HostPublicKey};
use crate::repair::chunk::UnfinishedUploadChunk;

struct WorkerQueues {
    downloads: VecDeque<Arc<UnfinishedDownloadChunk>>,
    uploads: VecDeque<Arc<UnfinishedUploadChunk>>,
    upload_terminated: bool,
    killed: bool,
}

#[derive(Default)]
struct Cooldown {
    consecutive_failures: u32,
    recent_failure: Option<Instant>,
}

impl Cooldown {
    // cooldown = base * 2^min(consecutive_failures, cap)
    fn until(&self, base: Duration, cap: u32) -> Option<Instant> {
        let recent = self.recent_failure?;
        if self.consecutive_failures == 0 {
            return None;
        }
        let exponent = self.consecutive_failures.min(cap);
        Some(recent + base * 2u32.saturating_pow(exponent))
    }
}

#[derive(Default)]
struct Cooldowns {
    download: Cooldown,
    upload: Cooldown,
}

enum NextTask {
    Exit,
    Download(Arc<UnfinishedDownloadChunk>),
    Upload(Arc<UnfinishedUploadChunk>),
    Idle(Option<Instant>),
}

pub struct Worker {
    host_public_key: HostPublicKey,
    pub(crate) contractor: Arc<dyn HostContractor>,
    settings: Arc<Settings>,
    queues: Mutex<WorkerQueues>,
    cooldowns: Mutex<Cooldowns>,
    wake: Notify,
}

impl Worker {
    pub fn new(
        host_public_key: HostPublicKey,
        contractor: Arc<dyn HostContractor>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host_public_key,
            contractor,
            settings,
            queues: Mutex::new(WorkerQueues {
                downloads: VecDeque::new(),
                uploads: VecDeque::new(),
                upload_terminated: false,
                killed: false,
            }),
            cooldowns: Mutex::new(Cooldowns::default()),
            wake: Notify::new(),
        })
    }

    pub fn host_public_key(&self) -> HostPublicKey {
        self.host_public_key
    }

    pub fn is_killed(&self) -> bool {
        self.queues.lock().unwrap().killed
    }

    /// Adds a download chunk to the queue. If the worker has been killed
    /// the chunk is dropped immediately, which decrements its
    /// `workers_remaining`.
    pub fn queue_download(self: &Arc<Self>, udc: Arc<UnfinishedDownloadChunk>) {
        let killed = {
            let mut queues = self.queues.lock().unwrap();
            if !queues.killed {
                queues.downloads.push_back(udc.clone());
            }
            queues.killed
        };
        if killed {
            udc.remove_worker();
        } else {
            self.wake.notify_one();
        }
    }

    /// Adds an upload chunk to the queue. A killed worker, or one whose
    /// contract went bad for upload, drops the chunk immediately.
    pub fn queue_upload(self: &Arc<Self>, uuc: Arc<UnfinishedUploadChunk>) {
        let rejected = {
            let mut queues = self.queues.lock().unwrap();
            let rejected = queues.killed || queues.upload_terminated;
            if !rejected {
                queues.uploads.push_back(uuc.clone());
            }
            rejected
        };
        if rejected {
            uuc.remove_worker();
        } else {
            self.wake.notify_one();
        }
    }

    /// Stops accepting uploads and drains the upload queue; downloads are
    /// unaffected. Used when the host's contract goes bad for upload.
    pub fn set_upload_allowed(self: &Arc<Self>, allowed: bool) {
        let drained = {
            let mut queues = self.queues.lock().unwrap();
            queues.upload_terminated = !allowed;
            if allowed {
                Vec::new()
            } else {
                queues.uploads.drain(..).collect::<Vec<_>>()
            }
        };
        for uuc in drained {
            uuc.remove_worker();
        }
    }

    /// Idempotent. Drains both queues, dropping every chunk, and wakes
    /// the work loop so it exits.
    pub fn kill(self: &Arc<Self>) {
        let (downloads, uploads) = {
            let mut queues = self.queues.lock().unwrap();
            if queues.killed {
                return;
            }
            queues.killed = true;
            (
                queues.downloads.drain(..).collect::<Vec<_>>(),
                queues.uploads.drain(..).collect::<Vec<_>>(),
            )
        };
        self.wake.notify_one();
        for udc in downloads {
            udc.remove_worker();
        }
        for uuc in uploads {
            uuc.remove_worker();
        }
        event!(Level::DEBUG, host = %self.host_public_key, "Worker killed.");
    }

    pub(crate) fn on_download_cooldown(&self) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap();
        cooldowns
            .download
            .until(
                self.settings.download_cooldown_base(),
                self.settings.max_cooldown_penalty,
            )
            .is_some_and(|until| Instant::now() < until)
    }

    pub(crate) fn on_upload_cooldown(&self) -> bool {
        let cooldowns = self.cooldowns.lock().unwrap();
        cooldowns
            .upload
            .until(
                self.settings.upload_cooldown_base(),
                self.settings.max_cooldown_penalty,
            )
            .is_some_and(|until| Instant::now() < until)
    }

    pub(crate) fn download_failed(&self) {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        cooldowns.download.consecutive_failures += 1;
        cooldowns.download.recent_failure = Some(Instant::now());
    }

    pub(crate) fn download_succeeded(&self) {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        cooldowns.download = Cooldown::default();
    }

    pub(crate) fn upload_failed(&self) {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        cooldowns.upload.consecutive_failures += 1;
        cooldowns.upload.recent_failure = Some(Instant::now());
    }

    pub(crate) fn upload_succeeded(&self) {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        cooldowns.upload = Cooldown::default();
    }

    // Loop priority: killed -> exit; queued download off cooldown; queued
    // upload off cooldown; else sleep until woken by an enqueue, a
    // cooldown expiring, or shutdown.
    fn next_task(&self) -> NextTask {
        let now = Instant::now();
        let (download_until, upload_until) = {
            let cooldowns = self.cooldowns.lock().unwrap();
            (
                cooldowns.download.until(
                    self.settings.download_cooldown_base(),
                    self.settings.max_cooldown_penalty,
                ),
                cooldowns.upload.until(
                    self.settings.upload_cooldown_base(),
                    self.settings.max_cooldown_penalty,
                ),
            )
        };
        let download_ready = download_until.is_none_or(|until| now >= until);
        let upload_ready = upload_until.is_none_or(|until| now >= until);

        let mut queues = self.queues.lock().unwrap();
        if queues.killed {
            return NextTask::Exit;
        }
        if download_ready {
            if let Some(udc) = queues.downloads.pop_front() {
                return NextTask::Download(udc);
            }
        }
        if upload_ready {
            if let Some(uuc) = queues.uploads.pop_front() {
                return NextTask::Upload(uuc);
            }
        }

        // Sleep until the earliest cooldown that is actually holding back
        // queued work.
        let mut wake_at: Option<Instant> = None;
        if !queues.downloads.is_empty() {
            wake_at = download_until;
        }
        if !queues.uploads.is_empty() {
            wake_at = match (wake_at, upload_until) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (None, b) => b,
                (a, None) => a,
            };
        }
        NextTask::Idle(wake_at)
    }

    /// The worker's driver task. One upload or download runs at a time.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            match self.next_task() {
                NextTask::Exit => break,
                NextTask::Download(udc) => download::process_download(&self, udc).await,
                NextTask::Upload(uuc) => upload::process_upload(&self, uuc).await,
                NextTask::Idle(wake_at) => {
                    let cooldown_expiry = async {
                        match wake_at {
                            Some(at) => {
                                tokio::time::sleep(at.saturating_duration_since(Instant::now()))
                                    .await
                            }
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        _ = self.wake.notified() => {}
                        _ = cooldown_expiry => {}
                    }
                }
            }
        }
        // Leave nothing registered behind, whether this was a kill or a
        // shutdown.
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::download::chunk::{DownloadChunkParams, UnfinishedDownloadChunk};
    use crate::download::destination::DestinationBuffer;
    use crate::erasure::ErasureCoder;
    use crate::test_util::StubContractor;
    use std::collections::HashMap;

    fn test_worker(settings: Settings) -> Arc<Worker> {
        let contractor = StubContractor::new();
        let host = contractor.add_host(1);
        Worker::new(host, contractor, Arc::new(settings))
    }

    fn test_udc() -> Arc<UnfinishedDownloadChunk> {
        let download = crate::download::Download::test_download();
        UnfinishedDownloadChunk::new(
            download,
            DownloadChunkParams {
                chunk_index: 0,
                chunk_map: HashMap::new(),
                piece_size: 64,
                fetch_offset: 0,
                fetch_length: 128,
                write_offset: 0,
                latency_target: Duration::from_millis(25),
                overdrive: 0,
                priority: 5,
                needs_memory: false,
                erasure: Arc::new(ErasureCoder::new(2, 4).unwrap()),
                master_key: MasterKey::generate(),
                destination: Arc::new(DestinationBuffer::new()),
            },
        )
    }

    #[test]
    fn test_cooldown_doubles_per_failure() {
        let base = Duration::from_millis(100);
        let mut cooldown = Cooldown::default();
        assert!(cooldown.until(base, 10).is_none());

        let start = Instant::now();
        cooldown.recent_failure = Some(start);
        cooldown.consecutive_failures = 1;
        assert_eq!(cooldown.until(base, 10), Some(start + base * 2));

        cooldown.consecutive_failures = 3;
        assert_eq!(cooldown.until(base, 10), Some(start + base * 8));

        // The exponent is capped.
        cooldown.consecutive_failures = 40;
        assert_eq!(cooldown.until(base, 5), Some(start + base * 32));
    }

    #[tokio::test]
    async fn test_failure_sets_cooldown_and_success_clears_it() {
        let settings = Settings {
            download_cooldown_base_ms: 60_000,
            ..Settings::default()
        };
        let worker = test_worker(settings);
        assert!(!worker.on_download_cooldown());

        worker.download_failed();
        assert!(worker.on_download_cooldown());
        // The other class is unaffected.
        assert!(!worker.on_upload_cooldown());

        worker.download_succeeded();
        assert!(!worker.on_download_cooldown());
    }

    #[tokio::test]
    async fn test_kill_drains_queues() {
        let worker = test_worker(Settings::default());
        let udc = test_udc();
        udc.add_workers(1);
        worker.queue_download(udc.clone());
        assert_eq!(udc.snapshot().2, 1, "workers_remaining");

        worker.kill();
        // The queued chunk was dropped and released its worker slot.
        assert_eq!(udc.snapshot().2, 0, "workers_remaining after kill");
        assert!(worker.is_killed());

        // Idempotent.
        worker.kill();
    }

    #[tokio::test]
    async fn test_queue_after_kill_drops_immediately() {
        let worker = test_worker(Settings::default());
        worker.kill();

        let udc = test_udc();
        udc.add_workers(1);
        worker.queue_download(udc.clone());
        assert_eq!(udc.snapshot().2, 0);
    }

    #[tokio::test]
    async fn test_upload_gate_drains_only_uploads() {
        let worker = test_worker(Settings::default());
        let udc = test_udc();
        udc.add_workers(1);
        worker.queue_download(udc.clone());

        worker.set_upload_allowed(false);
        // Download work survives the upload gate closing.
        assert_eq!(udc.snapshot().2, 1);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let worker = test_worker(Settings::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        let _ = shutdown_tx.send(());
        let result = tokio::time::timeout(Duration::from_millis(200), handle).await;
        assert!(result.is_ok(), "worker did not exit on shutdown");
        assert!(worker.is_killed());
    }
}
