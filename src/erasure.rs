// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::errors::ErasureError;

/// Per-piece segment unit. Reed-Solomon over GF(2^8) operates on each byte
/// offset independently, so any segment-aligned sub-range of every piece
/// can be recovered without the rest of the sector. 64 bytes matches the
/// ChaCha20 keystream block, keeping partial fetches decryptable.
pub const SEGMENT_SIZE: u64 = 64;

/// Systematic K-of-N erasure code: the first K pieces are the chunk data,
/// the remaining N-K are parity. Any K pieces recover the chunk.
pub struct ErasureCoder {
    rs: ReedSolomon,
    min_pieces: usize,
    num_pieces: usize,
}

impl ErasureCoder {
    pub fn new(min_pieces: usize, num_pieces: usize) -> Result<Self, ErasureError> {
        if min_pieces == 0 || num_pieces <= min_pieces {
            return Err(ErasureError::BadParameters(min_pieces, num_pieces));
        }
        let rs = ReedSolomon::new(min_pieces, num_pieces - min_pieces)
            .map_err(|_| ErasureError::BadParameters(min_pieces, num_pieces))?;
        Ok(Self {
            rs,
            min_pieces,
            num_pieces,
        })
    }

    pub fn min_pieces(&self) -> usize {
        self.min_pieces
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn supports_partial_encoding(&self) -> bool {
        true
    }

    /// Splits `data` into K zero-padded data pieces of `piece_size` bytes
    /// and appends N-K parity pieces.
    pub fn encode(&self, data: &[u8], piece_size: u64) -> Result<Vec<Vec<u8>>, ErasureError> {
        let piece_size = piece_size as usize;
        let mut pieces = Vec::with_capacity(self.num_pieces);
        for i in 0..self.min_pieces {
            let start = (i * piece_size).min(data.len());
            let end = ((i + 1) * piece_size).min(data.len());
            let mut piece = vec![0u8; piece_size];
            piece[..end - start].copy_from_slice(&data[start..end]);
            pieces.push(piece);
        }
        for _ in self.min_pieces..self.num_pieces {
            pieces.push(vec![0u8; piece_size]);
        }
        self.rs
            .encode(&mut pieces)
            .map_err(|_| ErasureError::ShardMismatch)?;
        Ok(pieces)
    }

    /// Recovers `recovered_len` bytes of chunk data from any K pieces. The
    /// piece slices may cover only a segment-aligned window of the sector;
    /// they just have to all cover the same window.
    pub fn recover(
        &self,
        pieces: Vec<Option<Vec<u8>>>,
        recovered_len: usize,
    ) -> Result<Vec<u8>, ErasureError> {
        let have = pieces.iter().filter(|p| p.is_some()).count();
        if have < self.min_pieces {
            return Err(ErasureError::NotEnoughPieces {
                have,
                need: self.min_pieces,
            });
        }
        let window = pieces
            .iter()
            .flatten()
            .map(Vec::len)
            .max()
            .unwrap_or_default();
        if pieces.iter().flatten().any(|p| p.len() != window) {
            return Err(ErasureError::ShardMismatch);
        }

        let mut shards = pieces;
        shards.resize(self.num_pieces, None);
        self.rs
            .reconstruct(&mut shards)
            .map_err(|_| ErasureError::ShardMismatch)?;

        let mut data = Vec::with_capacity(self.min_pieces * window);
        for shard in shards.into_iter().take(self.min_pieces) {
            data.extend_from_slice(&shard.ok_or(ErasureError::ShardMismatch)?);
        }
        data.truncate(recovered_len);
        Ok(data)
    }

    /// First segment and segment count each piece must cover so the
    /// recovered data contains `[fetch_offset, fetch_offset+fetch_length)`
    /// of the chunk.
    pub fn segments_for_recovery(
        &self,
        fetch_offset: u64,
        fetch_length: u64,
        piece_size: u64,
    ) -> (u64, u64) {
        if !self.supports_partial_encoding() {
            return (0, piece_size.div_ceil(SEGMENT_SIZE));
        }
        let recovered_segment_size = self.min_pieces as u64 * SEGMENT_SIZE;
        let start_segment = fetch_offset / recovered_segment_size;
        let mut end_segment = (fetch_offset + fetch_length) / recovered_segment_size;
        if (fetch_offset + fetch_length) % recovered_segment_size != 0 {
            end_segment += 1;
        }
        (start_segment, end_segment - start_segment)
    }

    /// Byte window of each sector to fetch for a successful recovery of
    /// the requested chunk range.
    pub fn sector_offset_and_length(
        &self,
        fetch_offset: u64,
        fetch_length: u64,
        piece_size: u64,
    ) -> (u64, u64) {
        let (segment_index, num_segments) =
            self.segments_for_recovery(fetch_offset, fetch_length, piece_size);
        (segment_index * SEGMENT_SIZE, num_segments * SEGMENT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(ErasureCoder::new(0, 4).is_err());
        assert!(ErasureCoder::new(4, 4).is_err());
        assert!(ErasureCoder::new(5, 3).is_err());
        assert!(ErasureCoder::new(2, 4).is_ok());
    }

    #[test]
    fn test_encode_is_systematic() {
        let ec = ErasureCoder::new(2, 4).unwrap();
        let data = chunk_data(256);
        let pieces = ec.encode(&data, 128).unwrap();
        assert_eq!(pieces.len(), 4);
        assert_eq!(&pieces[0][..], &data[..128]);
        assert_eq!(&pieces[1][..], &data[128..]);
    }

    #[test]
    fn test_recover_from_any_k_pieces() {
        let ec = ErasureCoder::new(2, 4).unwrap();
        let data = chunk_data(250); // short final piece, zero padded
        let pieces = ec.encode(&data, 128).unwrap();

        // Drop the two data pieces, keep only parity.
        let available = vec![
            None,
            None,
            Some(pieces[2].clone()),
            Some(pieces[3].clone()),
        ];
        let recovered = ec.recover(available, 250).unwrap();
        assert_eq!(recovered, data);
    }

    #[test]
    fn test_recover_needs_k_pieces() {
        let ec = ErasureCoder::new(2, 4).unwrap();
        let pieces = ec.encode(&chunk_data(256), 128).unwrap();
        let result = ec.recover(vec![Some(pieces[0].clone()), None, None, None], 256);
        assert!(matches!(
            result,
            Err(ErasureError::NotEnoughPieces { have: 1, need: 2 })
        ));
    }

    #[test]
    fn test_partial_window_recovery() {
        let ec = ErasureCoder::new(2, 4).unwrap();
        let piece_size = 4 * SEGMENT_SIZE; // 256 bytes per piece
        let data = chunk_data(2 * piece_size as usize);
        let pieces = ec.encode(&data, piece_size).unwrap();

        // Recover chunk bytes [130, 300): segments 1..3 of each piece.
        let (seg_start, seg_count) = ec.segments_for_recovery(130, 170, piece_size);
        assert_eq!((seg_start, seg_count), (1, 2));
        let (off, len) = ec.sector_offset_and_length(130, 170, piece_size);
        assert_eq!((off, len), (64, 128));

        let window = |i: usize| pieces[i][off as usize..(off + len) as usize].to_vec();
        let available = vec![None, Some(window(1)), Some(window(2)), None];
        let recovered = ec.recover(available, (ec.min_pieces() as u64 * len) as usize).unwrap();

        // The recovered region starts at chunk offset seg_start * K * SEGMENT_SIZE.
        let region_start = (seg_start * ec.min_pieces() as u64 * SEGMENT_SIZE) as usize;
        assert_eq!(&recovered[130 - region_start..300 - region_start], &data[130..300]);
    }

    #[test]
    fn test_segment_math_for_full_chunk() {
        let ec = ErasureCoder::new(10, 12).unwrap();
        let piece_size = 640;
        let chunk_size = 10 * piece_size;
        let (off, len) = ec.sector_offset_and_length(0, chunk_size, piece_size);
        assert_eq!(off, 0);
        assert_eq!(len, piece_size);
    }

    #[test]
    fn test_mismatched_windows_rejected() {
        let ec = ErasureCoder::new(2, 3).unwrap();
        let available = vec![Some(vec![0u8; 64]), Some(vec![0u8; 128]), None];
        assert!(matches!(
            ec.recover(available, 128),
            Err(ErasureError::ShardMismatch)
        ));
    }
}
