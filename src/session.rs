//! Peer session state machine
//!
//! One session per peer: dial, 68-byte handshake, declare interest, then a
//! read loop that reacts to choke/unchoke, tracks the peer's advertised
//! pieces, and drives a pipelined block-request window over the piece the
//! session currently owns.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result, TransportErrorKind};
use crate::metainfo::Sha1Hash;
use crate::state::DownloadState;
use crate::wire::{
    bitfield_pieces, Handshake, PeerMessage, BLOCK_SIZE, HANDSHAKE_LEN, MAX_FRAME_LEN,
};

/// Initial request window on a freshly assigned piece
const PIPELINE_DEPTH: u32 = 5;

/// Whole dial + handshake phase deadline
const SETUP_TIMEOUT: Duration = Duration::from_secs(12);

/// TCP connect deadline inside the setup phase
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake send/receive deadline inside the setup phase
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inactivity deadline per frame read once the session is running
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Byte offset and length of one block inside its piece. The final block
/// covers only the piece remainder.
pub fn block_bounds(piece_length: u64, block_index: u32) -> (u32, u32) {
    let offset = block_index as u64 * BLOCK_SIZE as u64;
    let length = piece_length.saturating_sub(offset).min(BLOCK_SIZE as u64);
    (offset as u32, length as u32)
}

/// A single peer conversation
pub struct PeerSession {
    addr: SocketAddrV4,
    ip: String,
    info_hash: Sha1Hash,
    peer_id: [u8; 20],
    state: Arc<DownloadState>,
    /// Piece this session's pipeline is parked on, if any
    current_piece: Option<u32>,
    read_buffer: BytesMut,
}

impl PeerSession {
    pub fn new(
        addr: SocketAddrV4,
        info_hash: Sha1Hash,
        peer_id: [u8; 20],
        state: Arc<DownloadState>,
    ) -> Self {
        Self {
            addr,
            ip: addr.ip().to_string(),
            info_hash,
            peer_id,
            state,
            current_piece: None,
            read_buffer: BytesMut::with_capacity(MAX_FRAME_LEN),
        }
    }

    /// Drive the session to completion. Returns the raw session error; the
    /// orchestrator decides what is fatal. The peer record is removed on
    /// every exit path.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let result = self.run_inner(&cancel).await;
        self.state.remove_peer(&self.ip);
        result
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut stream = timeout(SETUP_TIMEOUT, self.connect_and_handshake())
            .await
            .map_err(|_| {
                ClientError::transport(
                    TransportErrorKind::Timeout,
                    format!("setup deadline expired for {}", self.addr),
                )
            })??;

        tracing::debug!(peer = %self.addr, "handshake complete");

        stream
            .write_all(&PeerMessage::Interested.encode())
            .await
            .map_err(|e| {
                ClientError::transport(
                    TransportErrorKind::Io,
                    format!("failed to send interested: {}", e),
                )
            })?;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(peer = %self.addr, "session cancelled");
                    return Ok(());
                }
                read = timeout(READ_TIMEOUT, self.read_frame(&mut stream)) => match read {
                    Err(_) => {
                        return Err(ClientError::transport(
                            TransportErrorKind::Timeout,
                            format!("peer {} idle past read deadline", self.addr),
                        ))
                    }
                    Ok(frame) => frame?,
                },
            };

            self.handle_message(message, &mut stream).await?;
        }
    }

    async fn connect_and_handshake(&self) -> Result<TcpStream> {
        let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                ClientError::transport(
                    TransportErrorKind::Dial,
                    format!("dial timeout for {}", self.addr),
                )
            })?
            .map_err(|e| {
                ClientError::transport(
                    TransportErrorKind::Dial,
                    format!("dial failed for {}: {}", self.addr, e),
                )
            })?;

        let handshake = Handshake::new(self.info_hash, self.peer_id);
        timeout(HANDSHAKE_TIMEOUT, stream.write_all(&handshake.encode()))
            .await
            .map_err(|_| ClientError::handshake("handshake send timeout"))?
            .map_err(|e| ClientError::handshake(format!("handshake send failed: {}", e)))?;

        let mut response = [0u8; HANDSHAKE_LEN];
        timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut response))
            .await
            .map_err(|_| ClientError::handshake("handshake receive timeout"))?
            .map_err(|e| ClientError::handshake(format!("handshake receive failed: {}", e)))?;

        let theirs = Handshake::parse(&response)?;
        if theirs.info_hash != self.info_hash {
            return Err(ClientError::handshake(format!(
                "info hash mismatch from {}",
                self.addr
            )));
        }

        Ok(stream)
    }

    /// Read one length-prefixed frame.
    async fn read_frame(&mut self, stream: &mut TcpStream) -> Result<PeerMessage> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(map_read_err)?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(ClientError::transport(
                TransportErrorKind::Protocol,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        self.read_buffer.resize(len, 0);
        stream
            .read_exact(&mut self.read_buffer)
            .await
            .map_err(map_read_err)?;

        PeerMessage::decode(&self.read_buffer)
    }

    async fn handle_message(
        &mut self,
        message: PeerMessage,
        stream: &mut TcpStream,
    ) -> Result<()> {
        match message {
            PeerMessage::KeepAlive => {}

            PeerMessage::Choke => {
                // Outstanding requests stay outstanding; late arrivals are
                // still accepted. Selection resumes on unchoke.
                self.state.set_choked(&self.ip, true);
            }

            PeerMessage::Unchoke => {
                self.state.set_choked(&self.ip, false);
                match self.current_piece {
                    None => self.begin_next_piece(stream).await?,
                    // Top up the window on the piece we already own
                    Some(piece) => self.request_blocks(stream, piece, PIPELINE_DEPTH).await?,
                }
            }

            PeerMessage::Have { piece_index } => {
                self.state.add_have(&self.ip, self.addr.port(), piece_index);
            }

            PeerMessage::Bitfield { bitfield } => {
                let expected = crate::wire::bitfield_len(self.state.num_pieces());
                if bitfield.len() != expected {
                    tracing::warn!(
                        peer = %self.addr,
                        got = bitfield.len(),
                        expected,
                        "bitfield length off, clamping"
                    );
                }
                // A late bitfield replaces the advertised set
                let pieces = bitfield_pieces(&bitfield, self.state.num_pieces());
                self.state
                    .upsert_peer_pieces(&self.ip, self.addr.port(), pieces);
            }

            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                self.handle_block(index, begin, &block, stream).await?;
            }

            // We do not serve uploads; inbound requests and cancels are noise
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => {}
            PeerMessage::Interested | PeerMessage::NotInterested => {}

            PeerMessage::Ignored { id } => {
                tracing::trace!(peer = %self.addr, id, "ignoring unknown message");
            }
        }

        Ok(())
    }

    async fn handle_block(
        &mut self,
        index: u32,
        begin: u32,
        block: &[u8],
        stream: &mut TcpStream,
    ) -> Result<()> {
        if self.state.piece(index).is_none() {
            tracing::debug!(peer = %self.addr, piece = index, "block for unknown piece");
            return Ok(());
        }

        let block_index = begin / BLOCK_SIZE;

        // Redundant copy of a block we already hold: drop silently
        if self.state.is_block_received(index, block_index) {
            return Ok(());
        }

        self.state.write_block(index, begin, block)?;
        self.state.mark_block_received(index, block_index);

        if self.state.is_piece_fully_received(index) {
            match self.state.verify_and_save(index).await {
                Ok(()) => {
                    tracing::info!(piece = index, peer = %self.addr, "piece verified and saved");
                    if self.current_piece == Some(index) {
                        self.current_piece = None;
                    }
                    self.begin_next_piece(stream).await?;
                }
                Err(ClientError::Integrity { piece }) => {
                    // Already reset for retry; any session may pick it up
                    tracing::warn!(piece, peer = %self.addr, "hash mismatch, piece reset");
                    if self.current_piece == Some(piece) {
                        self.current_piece = None;
                    }
                    self.begin_next_piece(stream).await?;
                }
                Err(e) => return Err(e),
            }
        } else {
            // Keep the window full: one new request per block received
            self.request_blocks(stream, index, 1).await?;
        }

        Ok(())
    }

    /// Ask the shared state for a piece and open a request pipeline on it.
    async fn begin_next_piece(&mut self, stream: &mut TcpStream) -> Result<()> {
        let Some(index) = self.state.select_next_piece(&self.ip) else {
            tracing::debug!(peer = %self.addr, "no piece available, idling");
            return Ok(());
        };

        self.state.get_or_create_piece(index);
        self.state.mark_piece_requested(index);
        self.current_piece = Some(index);

        tracing::debug!(piece = index, peer = %self.addr, "starting piece");
        self.request_blocks(stream, index, PIPELINE_DEPTH).await
    }

    /// Send up to `count` requests for blocks of `index` that have not been
    /// requested yet, in ascending block order.
    async fn request_blocks(
        &mut self,
        stream: &mut TcpStream,
        index: u32,
        count: u32,
    ) -> Result<()> {
        let Some(record) = self.state.piece(index) else {
            return Ok(());
        };
        let (total_blocks, total_length) = {
            let piece = record.lock();
            (piece.total_blocks, piece.total_length)
        };

        let mut sent = 0;
        for block_index in 0..total_blocks {
            if sent == count {
                break;
            }
            if self.state.is_block_requested(index, block_index) {
                continue;
            }

            let (begin, length) = block_bounds(total_length, block_index);
            let request = PeerMessage::Request {
                index,
                begin,
                length,
            };
            stream.write_all(&request.encode()).await.map_err(|e| {
                ClientError::transport(
                    TransportErrorKind::Io,
                    format!("failed to send request: {}", e),
                )
            })?;

            self.state.mark_block_requested(index, block_index);
            sent += 1;
        }

        Ok(())
    }
}

fn map_read_err(e: std::io::Error) -> ClientError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ClientError::transport(TransportErrorKind::Eof, "peer closed the connection")
    } else {
        ClientError::transport(TransportErrorKind::Io, format!("read failed: {}", e))
    }
}
