// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::VecDeque;

use tokio::sync::broadcast;
use tokio::sync::{mpsc, oneshot};

use tracing::{event, Level};

use crate::errors::MemoryError;

// Grant this many queued requests per wakeup, then re-queue the work so a
// long waiter queue cannot starve release processing.
const GRANT_BATCH_SIZE: usize = 64;

/// Downloads and other interactive work wait in the high-priority queue;
/// repair uploads wait in the low-priority queue.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MemoryPriority {
    High,
    Low,
}

/// A byte-credit reservation. Dropping the grant returns the credit and
/// wakes the next fitting waiter.
#[derive(Debug)]
pub struct MemoryGrant {
    bytes: u64,
    control_tx: mpsc::Sender<ControlCommand>,
}

impl MemoryGrant {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryGrant {
    fn drop(&mut self) {
        let _ = self.control_tx.try_send(ControlCommand::Release {
            bytes: self.bytes,
        });
    }
}

#[derive(Debug)]
struct AcquireCommand {
    bytes: u64,
    respond_to: oneshot::Sender<MemoryGrant>,
}

#[derive(Debug)]
enum ControlCommand {
    Release { bytes: u64 },
    ProcessQueues,
}

#[derive(Clone, Debug)]
pub struct MemoryManagerClient {
    total: u64,
    high_tx: mpsc::Sender<AcquireCommand>,
    low_tx: mpsc::Sender<AcquireCommand>,
    control_tx: mpsc::Sender<ControlCommand>,
}

impl MemoryManagerClient {
    /// Total size of the memory pool in bytes.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Reserves `bytes` of credit, suspending until enough is available.
    /// High-priority waiters are woken first. Requests larger than the
    /// pool are rejected outright. Cancelling the returned future removes
    /// the waiter without leaking credit.
    pub async fn request(
        &self,
        bytes: u64,
        priority: MemoryPriority,
    ) -> Result<MemoryGrant, MemoryError> {
        if bytes > self.total {
            return Err(MemoryError::RequestTooLarge {
                requested: bytes,
                total: self.total,
            });
        }

        let (respond_to, rx) = oneshot::channel();
        let tx = match priority {
            MemoryPriority::High => &self.high_tx,
            MemoryPriority::Low => &self.low_tx,
        };
        tx.send(AcquireCommand { bytes, respond_to })
            .await
            .map_err(|_| MemoryError::ManagerShutdown)?;

        rx.await.map_err(|_| MemoryError::ManagerShutdown)
    }
}

pub struct MemoryManager {
    available: u64,
    total: u64,
    high_rx: mpsc::Receiver<AcquireCommand>,
    low_rx: mpsc::Receiver<AcquireCommand>,
    control_rx: mpsc::Receiver<ControlCommand>,
    control_tx: mpsc::Sender<ControlCommand>,
    high_queue: VecDeque<AcquireCommand>,
    low_queue: VecDeque<AcquireCommand>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MemoryManager {
    pub fn new(total: u64, shutdown_tx: broadcast::Sender<()>) -> (Self, MemoryManagerClient) {
        let (high_tx, high_rx) = mpsc::channel(256);
        let (low_tx, low_rx) = mpsc::channel(256);
        let (control_tx, control_rx) = mpsc::channel(1024);

        let client = MemoryManagerClient {
            total,
            high_tx,
            low_tx,
            control_tx: control_tx.clone(),
        };
        let actor = Self {
            available: total,
            total,
            high_rx,
            low_rx,
            control_rx,
            control_tx,
            high_queue: VecDeque::new(),
            low_queue: VecDeque::new(),
            shutdown_tx,
        };
        (actor, client)
    }

    pub async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                Some(cmd) = self.high_rx.recv() => {
                    self.high_queue.push_back(cmd);
                    self.process_queues();
                }
                Some(cmd) = self.low_rx.recv() => {
                    self.low_queue.push_back(cmd);
                    self.process_queues();
                }
                Some(cmd) = self.control_rx.recv() => {
                    match cmd {
                        ControlCommand::Release { bytes } => self.handle_release(bytes),
                        ControlCommand::ProcessQueues => self.process_queues(),
                    }
                }
                else => break,
            }
        }
    }

    fn handle_release(&mut self, bytes: u64) {
        self.available = self.available.saturating_add(bytes);
        if self.available > self.total {
            event!(
                Level::ERROR,
                available = self.available,
                total = self.total,
                "Memory release exceeded the pool total."
            );
            debug_assert!(false, "memory release exceeded the pool total");
            self.available = self.total;
        }
        self.process_queues();
    }

    // Grants to the head of the highest-priority queue whose request fits,
    // skipping waiters that have been cancelled.
    fn process_queues(&mut self) {
        for _ in 0..GRANT_BATCH_SIZE {
            let queue = if self
                .high_queue
                .front()
                .is_some_and(|cmd| cmd.bytes <= self.available)
            {
                &mut self.high_queue
            } else if self.high_queue.front().is_some_and(|cmd| cmd.respond_to.is_closed()) {
                // Cancelled waiter at the head; remove it so it cannot
                // block the queue behind it.
                self.high_queue.pop_front();
                continue;
            } else if self
                .low_queue
                .front()
                .is_some_and(|cmd| cmd.bytes <= self.available)
            {
                &mut self.low_queue
            } else if self.low_queue.front().is_some_and(|cmd| cmd.respond_to.is_closed()) {
                self.low_queue.pop_front();
                continue;
            } else {
                return;
            };

            let cmd = queue.pop_front().expect("queue head checked above");
            if cmd.respond_to.is_closed() {
                continue;
            }
            let grant = MemoryGrant {
                bytes: cmd.bytes,
                control_tx: self.control_tx.clone(),
            };
            self.available -= cmd.bytes;
            if let Err(grant) = cmd.respond_to.send(grant) {
                // The waiter vanished between the check and the send; the
                // returned grant's drop has queued the release already.
                drop(grant);
            }
        }
        if !self.high_queue.is_empty() || !self.low_queue.is_empty() {
            let _ = self.control_tx.try_send(ControlCommand::ProcessQueues);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn setup_manager(total: u64) -> (MemoryManagerClient, tokio::task::JoinHandle<()>) {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (actor, client) = MemoryManager::new(total, shutdown_tx);
        let handle = tokio::spawn(actor.run());
        (client, handle)
    }

    #[tokio::test]
    async fn test_request_release_cycle() {
        let (client, _handle) = setup_manager(100);

        let grant = client.request(100, MemoryPriority::Low).await.unwrap();
        assert_eq!(grant.bytes(), 100);
        drop(grant);

        let grant2 = client.request(100, MemoryPriority::High).await;
        assert!(grant2.is_ok());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let (client, _handle) = setup_manager(100);
        let result = client.request(101, MemoryPriority::High).await;
        assert_eq!(
            result.err(),
            Some(MemoryError::RequestTooLarge {
                requested: 101,
                total: 100
            })
        );
    }

    #[tokio::test]
    async fn test_request_blocks_until_release() {
        let (client, _handle) = setup_manager(100);
        let grant = client.request(80, MemoryPriority::Low).await.unwrap();

        let client_clone = client.clone();
        let waiter =
            tokio::spawn(async move { client_clone.request(50, MemoryPriority::Low).await });

        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "request did not block");

        drop(grant);
        let result = timeout(Duration::from_millis(100), waiter).await;
        assert!(result.is_ok(), "waiter did not wake after release");
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_high_priority_wakes_first() {
        let (client, _handle) = setup_manager(100);
        let grant = client.request(100, MemoryPriority::Low).await.unwrap();

        // Queue a low-priority waiter first, then a high-priority one.
        let low_client = client.clone();
        let low_waiter =
            tokio::spawn(async move { low_client.request(100, MemoryPriority::Low).await });
        sleep(Duration::from_millis(20)).await;

        let high_client = client.clone();
        let high_waiter =
            tokio::spawn(async move { high_client.request(100, MemoryPriority::High).await });
        sleep(Duration::from_millis(20)).await;

        drop(grant);

        // The high-priority waiter wins despite arriving later.
        let high_grant = timeout(Duration::from_millis(100), high_waiter)
            .await
            .expect("high-priority waiter timed out")
            .unwrap()
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(!low_waiter.is_finished(), "low-priority waiter jumped the queue");

        drop(high_grant);
        let low_result = timeout(Duration::from_millis(100), low_waiter).await;
        assert!(low_result.is_ok(), "low-priority waiter never woke");
    }

    #[tokio::test]
    async fn test_small_low_request_fits_around_blocked_high() {
        let (client, _handle) = setup_manager(100);
        let _grant = client.request(60, MemoryPriority::Low).await.unwrap();

        // High-priority head needs 80 and cannot fit; a low-priority
        // request for the remaining 40 is woken instead.
        let high_client = client.clone();
        let high_waiter =
            tokio::spawn(async move { high_client.request(80, MemoryPriority::High).await });
        sleep(Duration::from_millis(20)).await;
        assert!(!high_waiter.is_finished());

        let low_grant = timeout(
            Duration::from_millis(100),
            client.request(40, MemoryPriority::Low),
        )
        .await;
        assert!(low_grant.is_ok(), "fitting low-priority request was starved");
        high_waiter.abort();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leak_credit() {
        let (client, _handle) = setup_manager(100);
        let grant = client.request(100, MemoryPriority::High).await.unwrap();

        let waiter_client = client.clone();
        let waiter =
            tokio::spawn(async move { waiter_client.request(100, MemoryPriority::High).await });
        sleep(Duration::from_millis(20)).await;

        waiter.abort();
        sleep(Duration::from_millis(20)).await;

        drop(grant);
        let result = timeout(
            Duration::from_millis(100),
            client.request(100, MemoryPriority::Low),
        )
        .await;
        assert!(result.is_ok(), "credit leaked to the aborted waiter");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_many_waiters_drain_in_order() {
        let (client, _handle) = setup_manager(10);
        let grant = client.request(10, MemoryPriority::Low).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..5 {
            let c = client.clone();
            waiters.push(tokio::spawn(async move {
                let g = c.request(2, MemoryPriority::High).await.unwrap();
                sleep(Duration::from_millis(10)).await;
                drop(g);
            }));
        }
        sleep(Duration::from_millis(20)).await;
        drop(grant);

        for (i, waiter) in waiters.into_iter().enumerate() {
            let res = timeout(Duration::from_millis(500), waiter).await;
            assert!(res.is_ok(), "waiter {} starved", i);
        }
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (actor, client) = MemoryManager::new(100, shutdown_tx.clone());
        let handle = tokio::spawn(actor.run());

        let _ = shutdown_tx.send(());
        let _ = handle.await;

        let result = client.request(10, MemoryPriority::High).await;
        assert_eq!(result.err(), Some(MemoryError::ManagerShutdown));
    }
}
