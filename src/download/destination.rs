// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use async_trait::async_trait;

use std::io::SeekFrom;
use std::sync::Mutex;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Where recovered chunk data lands. Each chunk's recovery task writes its
/// own disjoint range, so implementations only need to serialize the seek
/// and write of a single call.
#[async_trait]
pub trait DownloadDestination: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), std::io::Error>;
}

/// In-memory destination, grown on demand.
#[derive(Default)]
pub struct DestinationBuffer {
    buffer: Mutex<Vec<u8>>,
}

impl DestinationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DownloadDestination for DestinationBuffer {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), std::io::Error> {
        let mut buffer = self.buffer.lock().unwrap();
        let end = offset as usize + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[offset as usize..end].copy_from_slice(data);
        Ok(())
    }
}

/// File destination. The file handle is shared by every chunk's recovery
/// task, so seek+write happens under one async lock.
pub struct DestinationFile {
    file: tokio::sync::Mutex<File>,
}

impl DestinationFile {
    pub fn new(file: File) -> Self {
        Self {
            file: tokio::sync::Mutex::new(file),
        }
    }
}

#[async_trait]
impl DownloadDestination for DestinationFile {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), std::io::Error> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}
