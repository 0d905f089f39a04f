// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use tracing::{event, Level};

use crate::download::chunk::UnfinishedDownloadChunk;
use crate::errors::HostError;
use crate::worker::Worker;

/// Performs one unit of download work. The chunk decides whether this
/// worker registers a piece, waits on standby, or drops out; a registered
/// piece is fetched, decrypted and deposited, and the worker that lands
/// the K-th piece spawns the chunk's single recovery task.
pub(crate) async fn process_download(worker: &Arc<Worker>, udc: Arc<UnfinishedDownloadChunk>) {
    let Some(piece_index) = udc.process(worker) else {
        // Dropped or on standby; nothing registered either way.
        return;
    };

    match fetch_piece(worker, &udc, piece_index).await {
        Ok(data) => {
            worker.download_succeeded();
            if udc.deposit_piece(piece_index, data) {
                tokio::spawn(udc.clone().recover_and_write());
            }
        }
        Err(e) => {
            event!(
                Level::DEBUG,
                host = %worker.host_public_key(),
                chunk = udc.chunk_index,
                piece = piece_index,
                error = %e,
                "Worker failed to fetch piece."
            );
            worker.download_failed();
            udc.unregister_worker(piece_index);
        }
    }
    udc.remove_worker();
}

// Fetches this worker's sector window from its host and decrypts it in
// place. The chunk lock is never held here.
async fn fetch_piece(
    worker: &Arc<Worker>,
    udc: &Arc<UnfinishedDownloadChunk>,
    piece_index: u64,
) -> Result<Vec<u8>, HostError> {
    let host = worker.host_public_key();
    let root = udc
        .chunk_map
        .get(&host)
        .map(|piece| piece.root)
        .ok_or_else(|| HostError::UnknownSector(host.to_string()))?;

    let mut session = worker.contractor.downloader(&host)?;
    let (offset, length) = udc.sector_window();
    let mut data = session.download(root, offset, length).await?;
    if data.len() != length as usize {
        return Err(HostError::BadLength {
            got: data.len(),
            want: length as usize,
        });
    }
    udc.download.add_total_transferred(length);

    let key = udc.master_key.derive(udc.chunk_index, piece_index);
    key.decrypt_range(&mut data, offset);
    Ok(data)
}
