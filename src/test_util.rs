// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

// In-memory host infrastructure for the end-to-end tests: a contractor
// whose hosts store sectors in a map, with per-host latency and failure
// injection, plus the knobs the scenarios need (utility flips, contract
// removal).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tokio::time::sleep;

use crate::crypto::SectorRoot;
use crate::errors::HostError;
use crate::hostdb::{
    Contract, ContractUtility, HostContractor, HostDownloader, HostEditor, HostPublicKey,
};

#[derive(Default)]
pub(crate) struct StubHost {
    sectors: Mutex<HashMap<SectorRoot, Vec<u8>>>,
    latency: Mutex<Duration>,
    fail_rpcs: AtomicBool,
}

impl StubHost {
    fn latency(&self) -> Duration {
        *self.latency.lock().unwrap()
    }

    pub(crate) fn num_sectors(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }
}

struct StubEntry {
    host: Arc<StubHost>,
    utility: ContractUtility,
}

/// Contract directory + host fleet for tests.
#[derive(Default)]
pub(crate) struct StubContractor {
    hosts: Mutex<HashMap<HostPublicKey, StubEntry>>,
}

impl StubContractor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a host with a fully usable contract.
    pub(crate) fn add_host(&self, byte: u8) -> HostPublicKey {
        let key = HostPublicKey::from_bytes([byte; 32]);
        self.hosts.lock().unwrap().insert(
            key,
            StubEntry {
                host: Arc::new(StubHost::default()),
                utility: ContractUtility {
                    good_for_upload: true,
                    good_for_renew: true,
                },
            },
        );
        key
    }

    /// Removes the contract entirely; the worker pool drops this host on
    /// its next refresh.
    pub(crate) fn remove_host(&self, host: &HostPublicKey) {
        self.hosts.lock().unwrap().remove(host);
    }

    /// Sours the contract without removing it: the host no longer counts
    /// for redundancy or accepts new pieces, but still answers RPCs.
    pub(crate) fn set_utility(&self, host: &HostPublicKey, utility: ContractUtility) {
        if let Some(entry) = self.hosts.lock().unwrap().get_mut(host) {
            entry.utility = utility;
        }
    }

    pub(crate) fn set_latency(&self, host: &HostPublicKey, latency: Duration) {
        if let Some(entry) = self.hosts.lock().unwrap().get(host) {
            *entry.host.latency.lock().unwrap() = latency;
        }
    }

    /// Makes every RPC against the host fail while keeping its contract.
    pub(crate) fn set_failing(&self, host: &HostPublicKey, failing: bool) {
        if let Some(entry) = self.hosts.lock().unwrap().get(host) {
            entry.host.fail_rpcs.store(failing, Ordering::SeqCst);
        }
    }

    pub(crate) fn stub_host(&self, host: &HostPublicKey) -> Option<Arc<StubHost>> {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|entry| entry.host.clone())
    }

    fn session_host(&self, host: &HostPublicKey) -> Result<Arc<StubHost>, HostError> {
        self.stub_host(host)
            .ok_or_else(|| HostError::NoContract(host.to_string()))
    }
}

impl HostContractor for StubContractor {
    fn contracts(&self) -> Vec<Contract> {
        let mut contracts: Vec<Contract> = self
            .hosts
            .lock()
            .unwrap()
            .iter()
            .map(|(key, entry)| Contract {
                host_public_key: *key,
                utility: entry.utility,
            })
            .collect();
        contracts.sort_by_key(|c| c.host_public_key);
        contracts
    }

    fn contract_utility(&self, host: &HostPublicKey) -> Option<ContractUtility> {
        self.hosts.lock().unwrap().get(host).map(|e| e.utility)
    }

    fn downloader(&self, host: &HostPublicKey) -> Result<Box<dyn HostDownloader>, HostError> {
        Ok(Box::new(StubSession {
            host: self.session_host(host)?,
        }))
    }

    fn editor(&self, host: &HostPublicKey) -> Result<Box<dyn HostEditor>, HostError> {
        Ok(Box::new(StubSession {
            host: self.session_host(host)?,
        }))
    }
}

struct StubSession {
    host: Arc<StubHost>,
}

#[async_trait]
impl HostDownloader for StubSession {
    async fn download(
        &mut self,
        root: SectorRoot,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, HostError> {
        sleep(self.host.latency()).await;
        if self.host.fail_rpcs.load(Ordering::SeqCst) {
            return Err(HostError::Rpc("injected failure".to_string()));
        }
        let sectors = self.host.sectors.lock().unwrap();
        let sector = sectors
            .get(&root)
            .ok_or_else(|| HostError::UnknownSector(root.to_string()))?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > sector.len() {
            return Err(HostError::BadLength {
                got: sector.len(),
                want: end,
            });
        }
        Ok(sector[start..end].to_vec())
    }
}

#[async_trait]
impl HostEditor for StubSession {
    async fn upload(&mut self, data: Vec<u8>) -> Result<SectorRoot, HostError> {
        sleep(self.host.latency()).await;
        if self.host.fail_rpcs.load(Ordering::SeqCst) {
            return Err(HostError::Rpc("injected failure".to_string()));
        }
        let root = SectorRoot::for_sector(&data);
        self.host.sectors.lock().unwrap().insert(root, data);
        Ok(root)
    }
}

/// Waits until `condition` holds, asserting it does within `timeout`.
pub(crate) async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
