//! Shared download state
//!
//! One `DownloadState` value is shared by every peer session. It holds the
//! piece registry, the peer registry, the download counters, and the
//! pre-allocated output file, and it performs SHA-1 verification and the
//! positional write when a piece completes.
//!
//! Locking is two-tier: a coarse read-mostly lock over each registry map,
//! and a per-record mutex for mutation. Map locks are taken briefly to look
//! up or insert an `Arc` to the record and are released before the record
//! lock is acquired; no two record locks are ever held at once.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::IndexedRandom;
use sha1::{Digest, Sha1};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{ClientError, Result};
use crate::metainfo::{Metainfo, Sha1Hash};
use crate::wire::BLOCK_SIZE;

/// Per-piece download record, created lazily on first assignment
#[derive(Debug)]
pub struct PieceRecord {
    pub index: u32,
    /// Actual bytes in this piece; shorter than the nominal piece length
    /// for the final piece
    pub total_length: u64,
    pub block_size: u32,
    pub total_blocks: u32,
    pub buffer: Vec<u8>,
    pub requested_blocks: HashSet<u32>,
    pub received_blocks: HashSet<u32>,
    pub is_requested: bool,
    pub is_complete: bool,
    pub is_verified: bool,
    pub is_saved: bool,
}

impl PieceRecord {
    fn new(index: u32, total_length: u64) -> Self {
        let total_blocks = total_length.div_ceil(BLOCK_SIZE as u64) as u32;
        Self {
            index,
            total_length,
            block_size: BLOCK_SIZE,
            total_blocks,
            buffer: vec![0; total_length as usize],
            requested_blocks: HashSet::new(),
            received_blocks: HashSet::new(),
            is_requested: true,
            is_complete: false,
            is_verified: false,
            is_saved: false,
        }
    }
}

/// Per-peer record, keyed by IP
#[derive(Debug)]
pub struct PeerRecord {
    pub ip: String,
    pub port: u16,
    pub choked: bool,
    pub pieces: HashSet<u32>,
}

/// Aggregate progress for the periodic reporter
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub pieces_saved: u64,
    pub total_pieces: u32,
    pub pieces_in_flight: usize,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub peers: usize,
    pub unchoked_peers: usize,
}

/// Shared state for one download
pub struct DownloadState {
    piece_length: u64,
    total_length: u64,
    num_pieces: u32,
    piece_hashes: Vec<Sha1Hash>,

    pieces: RwLock<HashMap<u32, Arc<Mutex<PieceRecord>>>>,
    peers: RwLock<HashMap<String, Arc<Mutex<PeerRecord>>>>,

    downloaded_bytes: AtomicU64,
    saved_pieces: AtomicU64,

    output: tokio::sync::Mutex<tokio::fs::File>,
    output_path: PathBuf,

    /// Signalled once every piece is saved
    pub completed: Notify,
}

impl DownloadState {
    /// Create the output file pre-sized to the torrent's total length and
    /// initialize empty registries.
    pub async fn create(metainfo: &Metainfo, dir: &Path) -> Result<Self> {
        let output_path = dir.join(&metainfo.name);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&output_path)
            .await
            .map_err(|e| {
                ClientError::disk(&output_path, format!("failed to create output file: {}", e))
            })?;

        file.set_len(metainfo.total_length).await.map_err(|e| {
            ClientError::disk(&output_path, format!("failed to pre-allocate: {}", e))
        })?;

        tracing::info!(
            path = %output_path.display(),
            bytes = metainfo.total_length,
            "initialized output file"
        );

        Ok(Self {
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
            num_pieces: metainfo.num_pieces(),
            piece_hashes: metainfo.pieces.clone(),
            pieces: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            downloaded_bytes: AtomicU64::new(0),
            saved_pieces: AtomicU64::new(0),
            output: tokio::sync::Mutex::new(file),
            output_path,
            completed: Notify::new(),
        })
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes.load(Ordering::Relaxed)
    }

    /// All pieces verified and on disk.
    pub fn is_complete(&self) -> bool {
        self.saved_pieces.load(Ordering::Relaxed) == self.num_pieces as u64
    }

    // ------------------------------------------------------------------
    // Peer registry
    // ------------------------------------------------------------------

    /// Replace the peer's advertised piece set, creating the record if
    /// absent. New peers start choked.
    pub fn upsert_peer_pieces(&self, ip: &str, port: u16, pieces: Vec<u32>) {
        let record = self.get_or_insert_peer(ip, port);
        let mut peer = record.lock();
        peer.pieces = pieces.into_iter().collect();
    }

    /// Union a single piece into the peer's advertised set. Indices past
    /// the end of the torrent are dropped.
    pub fn add_have(&self, ip: &str, port: u16, piece: u32) {
        if piece >= self.num_pieces {
            tracing::debug!(ip, piece, "have for out-of-range piece");
            return;
        }
        let record = self.get_or_insert_peer(ip, port);
        record.lock().pieces.insert(piece);
    }

    /// Flip the peer's choke flag; no-op for unknown peers.
    pub fn set_choked(&self, ip: &str, choked: bool) {
        let record = self.peers.read().get(ip).cloned();
        if let Some(record) = record {
            record.lock().choked = choked;
        }
    }

    /// Drop the peer record. Idempotent.
    pub fn remove_peer(&self, ip: &str) {
        self.peers.write().remove(ip);
    }

    pub fn peer_known(&self, ip: &str) -> bool {
        self.peers.read().contains_key(ip)
    }

    fn get_or_insert_peer(&self, ip: &str, port: u16) -> Arc<Mutex<PeerRecord>> {
        if let Some(record) = self.peers.read().get(ip) {
            return record.clone();
        }
        self.peers
            .write()
            .entry(ip.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PeerRecord {
                    ip: ip.to_string(),
                    port,
                    choked: true,
                    pieces: HashSet::new(),
                }))
            })
            .clone()
    }

    // ------------------------------------------------------------------
    // Piece selection
    // ------------------------------------------------------------------

    /// Pick, uniformly at random, a piece this peer advertises that is
    /// neither complete nor currently in flight. Random selection keeps
    /// concurrent sessions from converging on the same pieces.
    pub fn select_next_piece(&self, ip: &str) -> Option<u32> {
        let record = self.peers.read().get(ip).cloned()?;
        let advertised: Vec<u32> = record.lock().pieces.iter().copied().collect();

        let candidates: Vec<u32> = advertised
            .into_iter()
            .filter(|&index| !self.is_piece_complete(index) && !self.is_piece_in_flight(index))
            .collect();

        candidates.choose(&mut rand::rng()).copied()
    }

    /// Complete here means all blocks in AND hash-verified; a piece between
    /// full receipt and verification still reads as complete=false to
    /// selectors.
    pub fn is_piece_complete(&self, index: u32) -> bool {
        match self.piece(index) {
            Some(record) => {
                let piece = record.lock();
                piece.is_complete && piece.is_verified
            }
            None => false,
        }
    }

    fn is_piece_in_flight(&self, index: u32) -> bool {
        match self.piece(index) {
            Some(record) => {
                let piece = record.lock();
                piece.is_requested && !piece.is_complete
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Piece registry
    // ------------------------------------------------------------------

    /// Lazily create the piece record. The last piece's length is the file
    /// remainder, not the nominal piece length.
    pub fn get_or_create_piece(&self, index: u32) -> Arc<Mutex<PieceRecord>> {
        if let Some(record) = self.pieces.read().get(&index) {
            return record.clone();
        }

        let start = index as u64 * self.piece_length;
        let total_length = (start + self.piece_length)
            .min(self.total_length)
            .saturating_sub(start);

        self.pieces
            .write()
            .entry(index)
            .or_insert_with(|| Arc::new(Mutex::new(PieceRecord::new(index, total_length))))
            .clone()
    }

    pub fn piece(&self, index: u32) -> Option<Arc<Mutex<PieceRecord>>> {
        self.pieces.read().get(&index).cloned()
    }

    /// Claim the piece for an outgoing request pipeline.
    pub fn mark_piece_requested(&self, index: u32) {
        if let Some(record) = self.piece(index) {
            record.lock().is_requested = true;
        }
    }

    pub fn mark_block_requested(&self, index: u32, block: u32) {
        if let Some(record) = self.piece(index) {
            record.lock().requested_blocks.insert(block);
        }
    }

    pub fn is_block_requested(&self, index: u32, block: u32) -> bool {
        match self.piece(index) {
            Some(record) => record.lock().requested_blocks.contains(&block),
            None => false,
        }
    }

    /// Record a received block; flips `is_complete` once every block is in.
    pub fn mark_block_received(&self, index: u32, block: u32) {
        if let Some(record) = self.piece(index) {
            let mut piece = record.lock();
            piece.received_blocks.insert(block);
            if piece.received_blocks.len() as u32 == piece.total_blocks {
                piece.is_complete = true;
            }
        }
    }

    pub fn is_block_received(&self, index: u32, block: u32) -> bool {
        match self.piece(index) {
            Some(record) => record.lock().received_blocks.contains(&block),
            None => false,
        }
    }

    pub fn is_piece_fully_received(&self, index: u32) -> bool {
        match self.piece(index) {
            Some(record) => {
                let piece = record.lock();
                piece.received_blocks.len() as u32 == piece.total_blocks
            }
            None => false,
        }
    }

    /// Copy block bytes into the piece buffer. The offset and length must
    /// land inside the piece.
    pub fn write_block(&self, index: u32, begin: u32, data: &[u8]) -> Result<()> {
        let record = self.piece(index).ok_or_else(|| {
            ClientError::transport(
                crate::error::TransportErrorKind::Protocol,
                format!("block for unknown piece {}", index),
            )
        })?;

        let mut piece = record.lock();
        let end = begin as u64 + data.len() as u64;
        if end > piece.total_length {
            return Err(ClientError::transport(
                crate::error::TransportErrorKind::Protocol,
                format!(
                    "block out of bounds: piece {} offset {} len {} (piece length {})",
                    index,
                    begin,
                    data.len(),
                    piece.total_length
                ),
            ));
        }

        piece.buffer[begin as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Clear both block sets and the completion flags after a hash
    /// mismatch, making the piece eligible for re-selection.
    pub fn reset_piece_for_retry(&self, index: u32) {
        if let Some(record) = self.piece(index) {
            let mut piece = record.lock();
            piece.is_requested = false;
            piece.is_complete = false;
            piece.is_verified = false;
            piece.requested_blocks.clear();
            piece.received_blocks.clear();
        }
    }

    // ------------------------------------------------------------------
    // Verification and disk
    // ------------------------------------------------------------------

    /// Hash-check a fully received piece and write it at its file offset.
    ///
    /// On mismatch the piece is reset for retry and `Integrity` is
    /// returned (non-fatal). On success the saved/verified flags flip
    /// exactly once and the byte counter advances.
    pub async fn verify_and_save(&self, index: u32) -> Result<()> {
        let record = self.piece(index).ok_or_else(|| {
            ClientError::transport(
                crate::error::TransportErrorKind::Protocol,
                format!("verify of unknown piece {}", index),
            )
        })?;

        let (buffer, total_length) = {
            let piece = record.lock();
            if piece.is_saved {
                return Ok(());
            }
            if piece.received_blocks.len() as u32 != piece.total_blocks {
                return Err(ClientError::transport(
                    crate::error::TransportErrorKind::Protocol,
                    format!("verify of incomplete piece {}", index),
                ));
            }
            (piece.buffer.clone(), piece.total_length)
        };

        let expected = self.piece_hashes.get(index as usize).ok_or_else(|| {
            ClientError::config(format!("no reference hash for piece {}", index))
        })?;

        let mut hasher = Sha1::new();
        hasher.update(&buffer);
        let actual: Sha1Hash = hasher.finalize().into();

        if actual != *expected {
            self.reset_piece_for_retry(index);
            return Err(ClientError::integrity(index));
        }

        let offset = index as u64 * self.piece_length;
        {
            let mut file = self.output.lock().await;
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
                ClientError::disk(&self.output_path, format!("seek failed: {}", e))
            })?;
            file.write_all(&buffer).await.map_err(|e| {
                ClientError::disk(&self.output_path, format!("write failed: {}", e))
            })?;
        }

        let mut piece = record.lock();
        if !piece.is_saved {
            piece.is_verified = true;
            piece.is_saved = true;
            drop(piece);

            self.downloaded_bytes.fetch_add(total_length, Ordering::Relaxed);
            let saved = self.saved_pieces.fetch_add(1, Ordering::Relaxed) + 1;
            if saved == self.num_pieces as u64 {
                self.completed.notify_waiters();
            }
        }

        Ok(())
    }

    /// Flush and sync the output file. Called once at the end of the run.
    pub async fn finalize(&self) -> Result<()> {
        let mut file = self.output.lock().await;
        file.flush().await.map_err(|e| {
            ClientError::disk(&self.output_path, format!("flush failed: {}", e))
        })?;
        file.sync_all().await.map_err(|e| {
            ClientError::disk(&self.output_path, format!("sync failed: {}", e))
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub fn progress(&self) -> ProgressSnapshot {
        let (peers, unchoked_peers) = {
            let peers = self.peers.read();
            let records: Vec<_> = peers.values().cloned().collect();
            drop(peers);

            let unchoked = records
                .iter()
                .filter(|record| !record.lock().choked)
                .count();
            (records.len(), unchoked)
        };

        let pieces_in_flight = {
            let pieces = self.pieces.read();
            let records: Vec<_> = pieces.values().cloned().collect();
            drop(pieces);

            records
                .iter()
                .filter(|record| {
                    let piece = record.lock();
                    piece.is_requested && !piece.is_complete
                })
                .count()
        };

        ProgressSnapshot {
            pieces_saved: self.saved_pieces.load(Ordering::Relaxed),
            total_pieces: self.num_pieces,
            pieces_in_flight,
            downloaded_bytes: self.downloaded_bytes.load(Ordering::Relaxed),
            total_bytes: self.total_length,
            peers,
            unchoked_peers,
        }
    }
}
