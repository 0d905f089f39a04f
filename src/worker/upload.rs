// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use tracing::{event, Level};

use crate::crypto::SectorRoot;
use crate::errors::HostError;
use crate::repair::chunk::UnfinishedUploadChunk;
use crate::worker::Worker;

/// Performs one unit of repair work. The chunk hands out an unused-host
/// slot and a piece index; this worker encodes (first caller only),
/// encrypts and uploads its piece, then records the placement in the
/// file's metadata.
pub(crate) async fn process_upload(worker: &Arc<Worker>, uuc: Arc<UnfinishedUploadChunk>) {
    let Some(piece_index) = uuc.claim(worker) else {
        return;
    };

    let pieces = match uuc.encoded_pieces().await {
        Ok(pieces) => pieces,
        Err(e) => {
            // Source data is unreadable; no host can help this chunk.
            event!(
                Level::ERROR,
                path = %uuc.file.path(),
                chunk = uuc.index,
                error = %e,
                "Unable to produce encoded pieces for repair."
            );
            uuc.fail_source();
            uuc.unregister_worker(piece_index);
            uuc.remove_worker();
            return;
        }
    };

    match upload_piece(worker, &uuc, piece_index, &pieces[piece_index as usize]).await {
        Ok(root) => {
            worker.upload_succeeded();
            if let Err(e) =
                uuc.file
                    .add_piece(uuc.index, piece_index, worker.host_public_key(), root)
            {
                event!(
                    Level::ERROR,
                    path = %uuc.file.path(),
                    chunk = uuc.index,
                    piece = piece_index,
                    error = %e,
                    "Uploaded piece could not be recorded in file metadata."
                );
            }
            uuc.complete_piece(piece_index);
        }
        Err(e) => {
            event!(
                Level::DEBUG,
                host = %worker.host_public_key(),
                chunk = uuc.index,
                piece = piece_index,
                error = %e,
                "Worker failed to upload piece."
            );
            worker.upload_failed();
            uuc.unregister_worker(piece_index);
        }
    }
    uuc.remove_worker();
}

// Encrypts the piece for its (chunk, piece) position and sends it to this
// worker's host. The chunk lock is never held here.
async fn upload_piece(
    worker: &Arc<Worker>,
    uuc: &Arc<UnfinishedUploadChunk>,
    piece_index: u64,
    piece: &[u8],
) -> Result<SectorRoot, HostError> {
    let mut data = piece.to_vec();
    let key = uuc.master_key.derive(uuc.index, piece_index);
    key.encrypt_piece(&mut data);

    let mut session = worker.contractor.editor(&worker.host_public_key())?;
    session.upload(data).await
}
