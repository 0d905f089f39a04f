// SPDX-FileCopyrightText: 2026 The cirrus Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{event, Level};

use crate::crypto::{MasterKey, SectorRoot};
use crate::erasure::ErasureCoder;
use crate::errors::FilesystemError;
use crate::hostdb::HostPublicKey;

/// Slash-separated logical path of a file or directory within the renter's
/// namespace. Not an OS path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilePath(String);

impl FilePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into().trim_matches('/').to_string())
    }

    pub fn parent(&self) -> FilePath {
        match self.0.rfind('/') {
            Some(idx) => FilePath(self.0[..idx].to_string()),
            None => FilePath(String::new()),
        }
    }

    /// Whether `self` (a directory) contains `file`, at any depth.
    pub fn contains(&self, file: &FilePath) -> bool {
        self.0.is_empty() || file.0.starts_with(&format!("{}/", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FilePath({:?})", self.0)
    }
}

impl fmt::Display for FilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FileUid(pub u64);

/// Where a chunk's logical data can be read back from for repair: the
/// original file on local disk, or a buffer handed over by the caller.
#[derive(Clone, Debug)]
pub enum ChunkSource {
    Local(PathBuf),
    Memory(Arc<Vec<u8>>),
}

/// One placed piece: which host holds it and the sector root to request.
#[derive(Clone, Copy, Debug)]
pub struct PieceOnHost {
    pub host: HostPublicKey,
    pub root: SectorRoot,
}

#[derive(Clone, Debug)]
struct ChunkMeta {
    /// pieces[piece_index] is the set of hosts holding that piece. More
    /// than one entry per index can exist after hosts churn; at most one
    /// piece per host per chunk.
    pieces: Vec<Vec<PieceOnHost>>,
    stuck: bool,
}

struct FileEntryInner {
    chunks: Vec<ChunkMeta>,
    repair_source: Option<ChunkSource>,
    recent_repair_time: Option<Instant>,
    cached_health: f64,
}

/// In-memory metadata for one erasure-coded file. The durable format and
/// its write-ahead log live behind this boundary; all mutation funnels
/// through the entry lock, giving each file a single writer.
pub struct FileEntry {
    uid: FileUid,
    path: FilePath,
    size: u64,
    piece_size: u64,
    master_key: MasterKey,
    erasure: Arc<ErasureCoder>,
    inner: Mutex<FileEntryInner>,
}

impl FileEntry {
    pub fn uid(&self) -> FileUid {
        self.uid
    }

    pub fn path(&self) -> &FilePath {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn piece_size(&self) -> u64 {
        self.piece_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.piece_size * self.min_pieces() as u64
    }

    pub fn min_pieces(&self) -> usize {
        self.erasure.min_pieces()
    }

    pub fn num_pieces(&self) -> usize {
        self.erasure.num_pieces()
    }

    pub fn erasure(&self) -> Arc<ErasureCoder> {
        self.erasure.clone()
    }

    pub fn master_key(&self) -> MasterKey {
        self.master_key
    }

    pub fn num_chunks(&self) -> u64 {
        self.size.div_ceil(self.chunk_size())
    }

    /// Chunk index holding `offset`, plus the offset within that chunk.
    pub fn chunk_index_by_offset(&self, offset: u64) -> (u64, u64) {
        (offset / self.chunk_size(), offset % self.chunk_size())
    }

    pub fn pieces(&self, chunk_index: u64) -> Result<Vec<Vec<PieceOnHost>>, FilesystemError> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .get(chunk_index as usize)
            .map(|c| c.pieces.clone())
            .ok_or(FilesystemError::BadChunkIndex(chunk_index))
    }

    /// Records a newly uploaded piece. A host holds at most one piece per
    /// chunk; re-adding for the same host replaces its previous entry.
    pub fn add_piece(
        &self,
        chunk_index: u64,
        piece_index: u64,
        host: HostPublicKey,
        root: SectorRoot,
    ) -> Result<(), FilesystemError> {
        let mut inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get_mut(chunk_index as usize)
            .ok_or(FilesystemError::BadChunkIndex(chunk_index))?;
        if piece_index as usize >= chunk.pieces.len() {
            return Err(FilesystemError::BadPieceIndex(piece_index));
        }
        for set in chunk.pieces.iter_mut() {
            set.retain(|p| p.host != host);
        }
        chunk.pieces[piece_index as usize].push(PieceOnHost { host, root });
        Ok(())
    }

    pub fn stuck(&self, chunk_index: u64) -> Result<bool, FilesystemError> {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .get(chunk_index as usize)
            .map(|c| c.stuck)
            .ok_or(FilesystemError::BadChunkIndex(chunk_index))
    }

    pub fn mark_stuck(&self, chunk_index: u64, stuck: bool) -> Result<(), FilesystemError> {
        let mut inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get_mut(chunk_index as usize)
            .ok_or(FilesystemError::BadChunkIndex(chunk_index))?;
        chunk.stuck = stuck;
        Ok(())
    }

    pub fn mark_all_chunks_stuck(&self) {
        let mut inner = self.inner.lock().unwrap();
        for chunk in inner.chunks.iter_mut() {
            chunk.stuck = true;
        }
    }

    pub fn num_stuck_chunks(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.chunks.iter().filter(|c| c.stuck).count() as u64
    }

    pub fn repair_source(&self) -> Option<ChunkSource> {
        self.inner.lock().unwrap().repair_source.clone()
    }

    pub fn set_repair_source(&self, source: Option<ChunkSource>) {
        self.inner.lock().unwrap().repair_source = source;
    }

    pub fn recent_repair_time(&self) -> Option<Instant> {
        self.inner.lock().unwrap().recent_repair_time
    }

    pub fn update_recent_repair_time(&self) {
        self.inner.lock().unwrap().recent_repair_time = Some(Instant::now());
    }

    pub fn cached_health(&self) -> f64 {
        self.inner.lock().unwrap().cached_health
    }

    /// Health of one chunk against the currently usable hosts:
    /// `(pieces_present - K) / (N - K)`, clipped at 0. Counts at most one
    /// piece per host and one host per piece index.
    pub fn chunk_health(
        &self,
        chunk_index: u64,
        usable_hosts: &HashSet<HostPublicKey>,
    ) -> Result<f64, FilesystemError> {
        let inner = self.inner.lock().unwrap();
        let chunk = inner
            .chunks
            .get(chunk_index as usize)
            .ok_or(FilesystemError::BadChunkIndex(chunk_index))?;
        Ok(Self::chunk_health_locked(chunk, usable_hosts, &self.erasure))
    }

    fn chunk_health_locked(
        chunk: &ChunkMeta,
        usable_hosts: &HashSet<HostPublicKey>,
        erasure: &ErasureCoder,
    ) -> f64 {
        let mut seen_hosts = HashSet::new();
        let mut pieces_present = 0usize;
        for set in chunk.pieces.iter() {
            if let Some(piece) = set
                .iter()
                .find(|p| usable_hosts.contains(&p.host) && !seen_hosts.contains(&p.host))
            {
                seen_hosts.insert(piece.host);
                pieces_present += 1;
            }
        }
        let k = erasure.min_pieces() as f64;
        let n = erasure.num_pieces() as f64;
        (((pieces_present as f64) - k) / (n - k)).max(0.0)
    }

    /// Recomputes the file's health (its worst chunk) and caches it. A
    /// file with no chunks is fully healthy.
    pub fn update_cached_health(&self, usable_hosts: &HashSet<HostPublicKey>) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        let health = inner
            .chunks
            .iter()
            .map(|c| Self::chunk_health_locked(c, usable_hosts, &self.erasure))
            .fold(f64::INFINITY, f64::min);
        let health = if health.is_finite() { health } else { 1.0 };
        inner.cached_health = health;
        health
    }
}

/// The set of files the renter tracks, plus the directory-health view the
/// repair loop walks and the health-recompute queue chunk finalization
/// feeds.
pub struct FileSet {
    files: Mutex<HashMap<FilePath, Arc<FileEntry>>>,
    next_uid: AtomicU64,
    health_updates: Mutex<VecDeque<FilePath>>,
}

impl Default for FileSet {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSet {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            next_uid: AtomicU64::new(1),
            health_updates: Mutex::new(VecDeque::new()),
        }
    }

    pub fn create_file(
        &self,
        path: FilePath,
        repair_source: Option<ChunkSource>,
        size: u64,
        piece_size: u64,
        erasure: Arc<ErasureCoder>,
        master_key: MasterKey,
    ) -> Result<Arc<FileEntry>, FilesystemError> {
        let mut files = self.files.lock().unwrap();
        if files.contains_key(&path) {
            return Err(FilesystemError::FileExists(path.to_string()));
        }

        let chunk_size = piece_size * erasure.min_pieces() as u64;
        let num_chunks = size.div_ceil(chunk_size);
        let chunks = (0..num_chunks)
            .map(|_| ChunkMeta {
                pieces: vec![Vec::new(); erasure.num_pieces()],
                stuck: false,
            })
            .collect();

        let entry = Arc::new(FileEntry {
            uid: FileUid(self.next_uid.fetch_add(1, Ordering::Relaxed)),
            path: path.clone(),
            size,
            piece_size,
            master_key,
            erasure,
            inner: Mutex::new(FileEntryInner {
                chunks,
                repair_source,
                recent_repair_time: None,
                cached_health: 0.0,
            }),
        });
        files.insert(path, entry.clone());
        Ok(entry)
    }

    pub fn open(&self, path: &FilePath) -> Result<Arc<FileEntry>, FilesystemError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| FilesystemError::UnknownFile(path.to_string()))
    }

    pub fn all_files(&self) -> Vec<Arc<FileEntry>> {
        let mut files: Vec<_> = self.files.lock().unwrap().values().cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    pub fn files_in_dir(&self, dir: &FilePath) -> Vec<Arc<FileEntry>> {
        self.all_files()
            .into_iter()
            .filter(|f| dir.contains(&f.path))
            .collect()
    }

    /// Chunk finalization pushes the parent directory here so its health
    /// is refreshed before the next repair pass.
    pub fn queue_health_update(&self, dir: FilePath) {
        self.health_updates.lock().unwrap().push_back(dir);
    }

    /// Applies queued health updates, refreshing the cached health of
    /// every file under a queued directory.
    pub fn apply_health_updates(&self, usable_hosts: &HashSet<HostPublicKey>) {
        let dirs: Vec<FilePath> = self.health_updates.lock().unwrap().drain(..).collect();
        for dir in dirs {
            for file in self.files_in_dir(&dir) {
                file.update_cached_health(usable_hosts);
            }
        }
    }

    /// Walks the health tree and returns the directory whose aggregated
    /// health (worst file beneath it) is lowest, refreshing every file's
    /// cached health on the way. Ties resolve to the shallowest,
    /// lexicographically-smallest directory.
    pub fn worst_health_directory(
        &self,
        usable_hosts: &HashSet<HostPublicKey>,
    ) -> Option<(FilePath, f64)> {
        let files = self.all_files();
        if files.is_empty() {
            return None;
        }

        let mut dir_health: HashMap<FilePath, f64> = HashMap::new();
        for file in &files {
            let health = file.update_cached_health(usable_hosts);
            let mut dir = file.path.parent();
            loop {
                let slot = dir_health.entry(dir.clone()).or_insert(f64::INFINITY);
                *slot = slot.min(health);
                if dir.as_str().is_empty() {
                    break;
                }
                dir = dir.parent();
            }
        }

        let mut dirs: Vec<(FilePath, f64)> = dir_health.into_iter().collect();
        dirs.sort_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.0.as_str().len().cmp(&b.0.as_str().len()))
                .then_with(|| a.0.cmp(&b.0))
        });
        let (dir, health) = dirs.into_iter().next()?;
        event!(
            Level::TRACE,
            dir = %dir,
            health,
            "Worst-health directory computed."
        );
        Some((dir, health))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(byte: u8) -> HostPublicKey {
        HostPublicKey::from_bytes([byte; 32])
    }

    fn root(byte: u8) -> SectorRoot {
        SectorRoot::for_sector(&[byte])
    }

    fn new_file(set: &FileSet, path: &str, size: u64, k: usize, n: usize) -> Arc<FileEntry> {
        set.create_file(
            FilePath::new(path),
            None,
            size,
            64,
            Arc::new(ErasureCoder::new(k, n).unwrap()),
            MasterKey::generate(),
        )
        .unwrap()
    }

    #[test]
    fn test_path_parent_and_contains() {
        let file = FilePath::new("/backups/photos/img.dat");
        assert_eq!(file.parent(), FilePath::new("backups/photos"));
        assert!(FilePath::new("backups").contains(&file));
        assert!(FilePath::new("").contains(&file));
        assert!(!FilePath::new("backups/videos").contains(&file));
        assert_eq!(FilePath::new("img.dat").parent(), FilePath::new(""));
    }

    #[test]
    fn test_chunk_geometry() {
        let set = FileSet::new();
        // chunk_size = 2 * 64 = 128; 3 chunks for 300 bytes.
        let file = new_file(&set, "a/file", 300, 2, 4);
        assert_eq!(file.chunk_size(), 128);
        assert_eq!(file.num_chunks(), 3);
        assert_eq!(file.chunk_index_by_offset(0), (0, 0));
        assert_eq!(file.chunk_index_by_offset(128), (1, 0));
        assert_eq!(file.chunk_index_by_offset(200), (1, 72));
    }

    #[test]
    fn test_add_piece_replaces_same_host() {
        let set = FileSet::new();
        let file = new_file(&set, "a/file", 100, 2, 4);

        file.add_piece(0, 0, host(1), root(1)).unwrap();
        file.add_piece(0, 1, host(2), root(2)).unwrap();
        // Host 1 re-uploads into a different piece slot.
        file.add_piece(0, 3, host(1), root(3)).unwrap();

        let pieces = file.pieces(0).unwrap();
        assert!(pieces[0].is_empty());
        assert_eq!(pieces[1].len(), 1);
        assert_eq!(pieces[3].len(), 1);
        assert_eq!(pieces[3][0].host, host(1));
    }

    #[test]
    fn test_add_piece_bounds() {
        let set = FileSet::new();
        let file = new_file(&set, "a/file", 100, 2, 4);
        assert!(matches!(
            file.add_piece(9, 0, host(1), root(1)),
            Err(FilesystemError::BadChunkIndex(9))
        ));
        assert!(matches!(
            file.add_piece(0, 4, host(1), root(1)),
            Err(FilesystemError::BadPieceIndex(4))
        ));
    }

    #[test]
    fn test_chunk_health_math() {
        let set = FileSet::new();
        // K=2, N=4: health = (present - 2) / 2.
        let file = new_file(&set, "a/file", 100, 2, 4);
        let usable: HashSet<_> = (1..=4).map(host).collect();

        assert_eq!(file.chunk_health(0, &usable).unwrap(), 0.0);

        file.add_piece(0, 0, host(1), root(1)).unwrap();
        file.add_piece(0, 1, host(2), root(2)).unwrap();
        file.add_piece(0, 2, host(3), root(3)).unwrap();
        assert_eq!(file.chunk_health(0, &usable).unwrap(), 0.5);

        file.add_piece(0, 3, host(4), root(4)).unwrap();
        assert_eq!(file.chunk_health(0, &usable).unwrap(), 1.0);

        // A host leaving the usable set lowers health.
        let fewer: HashSet<_> = (1..=3).map(host).collect();
        assert_eq!(file.chunk_health(0, &fewer).unwrap(), 0.5);
    }

    #[test]
    fn test_health_ignores_duplicate_hosts_and_pieces() {
        let set = FileSet::new();
        let file = new_file(&set, "a/file", 100, 2, 4);
        let usable: HashSet<_> = (1..=4).map(host).collect();

        // Two hosts on the same piece index count once toward redundancy.
        file.add_piece(0, 0, host(1), root(1)).unwrap();
        file.add_piece(0, 0, host(2), root(2)).unwrap();
        assert_eq!(file.chunk_health(0, &usable).unwrap(), 0.0);
    }

    #[test]
    fn test_worst_health_directory() {
        let set = FileSet::new();
        let usable: HashSet<_> = (1..=4).map(host).collect();

        let healthy = new_file(&set, "good/file", 100, 2, 4);
        for (i, h) in (1..=4).map(host).enumerate() {
            healthy.add_piece(0, i as u64, h, root(i as u8)).unwrap();
        }
        let degraded = new_file(&set, "bad/file", 100, 2, 4);
        degraded.add_piece(0, 0, host(1), root(1)).unwrap();
        degraded.add_piece(0, 1, host(2), root(2)).unwrap();

        let (dir, health) = set.worst_health_directory(&usable).unwrap();
        assert_eq!(health, 0.0);
        // Root and "bad" tie at 0.0; the shallower root directory wins.
        assert_eq!(dir, FilePath::new(""));
        assert_eq!(degraded.cached_health(), 0.0);
        assert_eq!(healthy.cached_health(), 1.0);
    }

    #[test]
    fn test_stuck_bookkeeping() {
        let set = FileSet::new();
        let file = new_file(&set, "a/file", 300, 2, 4);
        assert_eq!(file.num_stuck_chunks(), 0);

        file.mark_stuck(1, true).unwrap();
        assert!(file.stuck(1).unwrap());
        assert_eq!(file.num_stuck_chunks(), 1);

        file.mark_all_chunks_stuck();
        assert_eq!(file.num_stuck_chunks(), 3);

        file.mark_stuck(1, false).unwrap();
        assert_eq!(file.num_stuck_chunks(), 2);
    }

    #[test]
    fn test_create_open_and_duplicates() {
        let set = FileSet::new();
        new_file(&set, "a/file", 100, 2, 4);
        assert!(set.open(&FilePath::new("a/file")).is_ok());
        assert!(matches!(
            set.open(&FilePath::new("a/missing")),
            Err(FilesystemError::UnknownFile(_))
        ));
        assert!(matches!(
            set.create_file(
                FilePath::new("a/file"),
                None,
                1,
                64,
                Arc::new(ErasureCoder::new(2, 4).unwrap()),
                MasterKey::generate(),
            ),
            Err(FilesystemError::FileExists(_))
        ));
    }
}
