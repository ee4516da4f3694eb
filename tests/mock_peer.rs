//! Mock BitTorrent peer for testing
//!
//! A TCP seeder speaking just enough of the peer wire protocol to exercise
//! the download path: handshake, bitfield, unchoke, and block serving.
//! Knobs cover the failure paths too — forged handshakes, withheld
//! unchokes, and one-shot block corruption for hash-retry tests.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bitvec::prelude::*;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Mock peer configuration
#[derive(Clone)]
pub struct MockPeerConfig {
    /// Info hash to accept connections for
    pub info_hash: [u8; 20],
    /// Our peer ID
    pub peer_id: [u8; 20],
    /// Pieces we advertise
    pub pieces: BitVec<u8, Msb0>,
    /// Piece data to serve
    pub piece_data: HashMap<u32, Vec<u8>>,
    /// Unchoke right after the bitfield
    pub auto_unchoke: bool,
    /// Respond to the handshake with a flipped info hash byte
    pub forge_info_hash: bool,
    /// Pieces whose first served copy gets one bit flipped; subsequent
    /// serves are clean
    pub corrupt_first: HashSet<u32>,
}

impl MockPeerConfig {
    pub fn new(info_hash: [u8; 20], num_pieces: usize) -> Self {
        let mut peer_id = [0u8; 20];
        for byte in &mut peer_id {
            *byte = rand::random();
        }

        Self {
            info_hash,
            peer_id,
            pieces: bitvec![u8, Msb0; 0; num_pieces],
            piece_data: HashMap::new(),
            auto_unchoke: true,
            forge_info_hash: false,
            corrupt_first: HashSet::new(),
        }
    }

    /// Add piece data and advertise the piece
    pub fn with_piece(mut self, index: u32, data: Vec<u8>) -> Self {
        self.piece_data.insert(index, data);
        self.pieces.set(index as usize, true);
        self
    }

    /// Respond to handshakes with a wrong info hash
    pub fn with_forged_info_hash(mut self) -> Self {
        self.forge_info_hash = true;
        self
    }

    /// Corrupt the first served copy of each listed piece
    pub fn with_corrupt_first(mut self, pieces: impl IntoIterator<Item = u32>) -> Self {
        self.corrupt_first = pieces.into_iter().collect();
        self
    }
}

/// A mock seeder listening on localhost
pub struct MockPeer {
    config: MockPeerConfig,
    listener: TcpListener,
    /// (piece, block offset) pairs already served corrupted
    corrupted_served: Arc<Mutex<HashSet<(u32, u32)>>>,
}

impl MockPeer {
    pub async fn new(config: MockPeerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        Ok(Self {
            config,
            listener,
            corrupted_served: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accept connections until the task is dropped
    pub fn start_accepting(self: Arc<Self>) {
        let peer = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                match peer.listener.accept().await {
                    Ok((stream, _)) => {
                        let peer = Arc::clone(&peer);
                        tokio::spawn(async move {
                            let _ = peer.handle_connection(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        self.do_handshake(&mut stream).await?;
        self.send_bitfield(&mut stream).await?;

        if self.config.auto_unchoke {
            // unchoke: <len=1><id=1>
            stream.write_all(&[0, 0, 0, 1, 1]).await?;
        }

        loop {
            let (id, payload) = self.read_message(&mut stream).await?;
            match id {
                // interested
                Some(2) => {
                    if !self.config.auto_unchoke {
                        stream.write_all(&[0, 0, 0, 1, 1]).await?;
                    }
                }
                // request
                Some(6) if payload.len() >= 12 => {
                    let index =
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    let begin =
                        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    let length =
                        u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
                    self.serve_block(&mut stream, index, begin, length).await?;
                }
                _ => {}
            }
        }
    }

    async fn do_handshake(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut handshake = [0u8; 68];
        stream.read_exact(&mut handshake).await?;

        if handshake[0] != 19 || &handshake[1..20] != PROTOCOL_STRING {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad protocol string",
            ));
        }
        if handshake[28..48] != self.config.info_hash[..] {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "info hash mismatch",
            ));
        }

        let mut info_hash = self.config.info_hash;
        if self.config.forge_info_hash {
            info_hash[0] ^= 0x01;
        }

        let mut response = Vec::with_capacity(68);
        response.push(19);
        response.extend_from_slice(PROTOCOL_STRING);
        response.extend_from_slice(&[0u8; 8]);
        response.extend_from_slice(&info_hash);
        response.extend_from_slice(&self.config.peer_id);
        stream.write_all(&response).await
    }

    async fn send_bitfield(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let bitfield = self.config.pieces.as_raw_slice();
        let len = 1 + bitfield.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(5);
        msg.extend_from_slice(bitfield);
        stream.write_all(&msg).await
    }

    async fn serve_block(
        &self,
        stream: &mut TcpStream,
        index: u32,
        begin: u32,
        length: u32,
    ) -> std::io::Result<()> {
        let Some(piece_data) = self.config.piece_data.get(&index) else {
            return Ok(());
        };
        let end = begin as usize + length as usize;
        if end > piece_data.len() {
            return Ok(());
        }

        let mut block = piece_data[begin as usize..end].to_vec();

        if self.config.corrupt_first.contains(&index)
            && self.corrupted_served.lock().insert((index, begin))
        {
            block[0] ^= 0x01;
        }

        let len = 9 + block.len() as u32;
        let mut msg = Vec::with_capacity(4 + len as usize);
        msg.extend_from_slice(&len.to_be_bytes());
        msg.push(7);
        msg.extend_from_slice(&index.to_be_bytes());
        msg.extend_from_slice(&begin.to_be_bytes());
        msg.extend_from_slice(&block);
        stream.write_all(&msg).await
    }

    /// Read one frame, returning (message id, payload). `None` id is a
    /// keep-alive.
    async fn read_message(
        &self,
        stream: &mut TcpStream,
    ) -> std::io::Result<(Option<u8>, Vec<u8>)> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Ok((None, Vec::new()));
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;

        let id = body[0];
        let payload = body[1..].to_vec();
        Ok((Some(id), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_peer_binds() {
        let config = MockPeerConfig::new([3u8; 20], 4).with_piece(0, vec![1, 2, 3]);
        let peer = MockPeer::new(config).await.unwrap();
        assert!(peer.addr().port() > 0);
        assert!(peer.config.pieces[0]);
        assert!(!peer.config.pieces[1]);
    }
}
