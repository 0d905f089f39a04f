// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use async_trait::async_trait;

use data_encoding::HEXLOWER;

use std::fmt;

use crate::crypto::SectorRoot;
use crate::errors::HostError;

/// Worker identity equals the host's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPublicKey(pub [u8; 32]);

impl HostPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for HostPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostPublicKey({})", HEXLOWER.encode(&self.0[..6]))
    }
}

impl fmt::Display for HostPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0[..6]))
    }
}

/// Whether a contract is currently worth using for each work class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContractUtility {
    pub good_for_upload: bool,
    pub good_for_renew: bool,
}

#[derive(Clone, Debug)]
pub struct Contract {
    pub host_public_key: HostPublicKey,
    pub utility: ContractUtility,
}

/// Single-RPC download session with one host. Failure is reported via the
/// return value; sessions are not reused across RPCs.
#[async_trait]
pub trait HostDownloader: Send {
    async fn download(
        &mut self,
        root: SectorRoot,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, HostError>;
}

/// Single-RPC upload session with one host.
#[async_trait]
pub trait HostEditor: Send {
    async fn upload(&mut self, data: Vec<u8>) -> Result<SectorRoot, HostError>;
}

/// The contract directory and per-host session factory the renter core
/// consumes. Contract formation, renewal and pricing live behind this
/// boundary.
pub trait HostContractor: Send + Sync {
    /// All contracts the renter currently holds, one per host.
    fn contracts(&self) -> Vec<Contract>;

    fn contract_utility(&self, host: &HostPublicKey) -> Option<ContractUtility>;

    fn downloader(&self, host: &HostPublicKey) -> Result<Box<dyn HostDownloader>, HostError>;

    fn editor(&self, host: &HostPublicKey) -> Result<Box<dyn HostEditor>, HostError>;
}
