// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("requested {requested} bytes but the memory pool only holds {total}")]
    RequestTooLarge { requested: u64, total: u64 },
    #[error("the memory manager has been shut down")]
    ManagerShutdown,
}

/// Failure of a single host RPC. Always local to one (worker, chunk) pair;
/// never fails a chunk by itself.
#[derive(Error, Debug, Clone)]
pub enum HostError {
    #[error("no active contract with host {0}")]
    NoContract(String),
    #[error("host refused the session: {0}")]
    SessionRefused(String),
    #[error("host rpc failed: {0}")]
    Rpc(String),
    #[error("host returned {got} bytes, expected {want}")]
    BadLength { got: usize, want: usize },
    #[error("host does not hold sector {0}")]
    UnknownSector(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErasureError {
    #[error("invalid erasure parameters: {0} data of {1} total pieces")]
    BadParameters(usize, usize),
    #[error("not enough pieces to recover: have {have}, need {need}")]
    NotEnoughPieces { have: usize, need: usize },
    #[error("erasure pieces have mismatched lengths")]
    ShardMismatch,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilesystemError {
    #[error("no file known at path {0}")]
    UnknownFile(String),
    #[error("a file already exists at path {0}")]
    FileExists(String),
    #[error("chunk index {0} is out of bounds")]
    BadChunkIndex(u64),
    #[error("piece index {0} is out of bounds")]
    BadPieceIndex(u64),
}

#[derive(Error, Debug, Clone)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error("offset equals filesize")]
    OffsetEqualsFilesize,
    #[error("download is requesting data past the boundary of the file")]
    PastFileBoundary,
    #[error("workers are not able to recover chunk {0}")]
    ChunkUnrecoverable(u64),
    #[error(transparent)]
    Erasure(#[from] ErasureError),
    #[error("failed to write to the download destination: {0}")]
    Destination(String),
    #[error("download interrupted by shutdown")]
    Shutdown,
}

#[derive(Error, Debug, Clone)]
pub enum RepairError {
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error("failed to read chunk source data: {0}")]
    Source(String),
    #[error(transparent)]
    Erasure(#[from] ErasureError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error("source file is not readable: {0}")]
    Source(String),
    #[error("invalid erasure parameters: {0} data of {1} total pieces")]
    BadParameters(usize, usize),
}
