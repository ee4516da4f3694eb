//! Test helpers
//!
//! A single-file torrent builder and a minimal UDP tracker, enough to run
//! the whole client end-to-end against mock peers on localhost.

use std::net::SocketAddr;

use sha1::{Digest, Sha1};
use tokio::net::UdpSocket;

/// Builder for single-file test torrents
pub struct TestTorrentBuilder {
    name: String,
    announce: String,
    piece_length: u64,
    content: Vec<u8>,
}

impl TestTorrentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            announce: "udp://tracker.invalid:6969/announce".to_string(),
            piece_length: 16384,
            content: Vec::new(),
        }
    }

    pub fn announce(mut self, url: impl Into<String>) -> Self {
        self.announce = url.into();
        self
    }

    pub fn piece_length(mut self, length: u64) -> Self {
        self.piece_length = length;
        self
    }

    /// Deterministic pseudo-content of the given size
    pub fn content_size(mut self, size: usize) -> Self {
        self.content = (0..size).map(|i| (i % 251) as u8).collect();
        self
    }

    pub fn content(mut self, content: Vec<u8>) -> Self {
        self.content = content;
        self
    }

    /// Bytes of piece `index`
    pub fn piece_data(&self, index: usize) -> Vec<u8> {
        let start = index * self.piece_length as usize;
        let end = (start + self.piece_length as usize).min(self.content.len());
        self.content[start..end].to_vec()
    }

    pub fn num_pieces(&self) -> usize {
        self.content.len().div_ceil(self.piece_length as usize)
    }

    pub fn full_content(&self) -> &[u8] {
        &self.content
    }

    /// Produce the bencoded torrent. Keys are emitted in sorted order as
    /// BEP 3 requires: announce < info; length < name < piece length < pieces.
    pub fn build(&self) -> Vec<u8> {
        let mut piece_hashes = Vec::new();
        for i in 0..self.num_pieces() {
            let mut hasher = Sha1::new();
            hasher.update(self.piece_data(i));
            let hash: [u8; 20] = hasher.finalize().into();
            piece_hashes.extend_from_slice(&hash);
        }

        let mut data = Vec::new();
        data.extend_from_slice(b"d");
        data.extend_from_slice(
            format!("8:announce{}:{}", self.announce.len(), self.announce).as_bytes(),
        );
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(format!("6:lengthi{}e", self.content.len()).as_bytes());
        data.extend_from_slice(format!("4:name{}:{}", self.name.len(), self.name).as_bytes());
        data.extend_from_slice(format!("12:piece lengthi{}e", self.piece_length).as_bytes());
        data.extend_from_slice(format!("6:pieces{}:", piece_hashes.len()).as_bytes());
        data.extend_from_slice(&piece_hashes);
        data.extend_from_slice(b"ee");
        data
    }
}

/// A localhost UDP tracker that answers one connect + announce exchange
/// per client and hands out a fixed peer list.
pub struct MockTracker {
    socket: UdpSocket,
    peers: Vec<SocketAddr>,
}

impl MockTracker {
    pub async fn new(peers: Vec<SocketAddr>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(Self { socket, peers })
    }

    pub fn announce_url(&self) -> String {
        let addr = self.socket.local_addr().unwrap();
        format!("udp://127.0.0.1:{}/announce", addr.port())
    }

    /// Serve clients until the task is dropped.
    pub fn start(self) {
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let Ok((n, from)) = self.socket.recv_from(&mut buf).await else {
                    break;
                };

                if n == 16 {
                    // connect: echo the transaction, grant connection id 7
                    let mut reply = Vec::new();
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&buf[12..16]);
                    reply.extend_from_slice(&7u64.to_be_bytes());
                    let _ = self.socket.send_to(&reply, from).await;
                } else if n == 98 {
                    // announce: echo the transaction, list the mock peers
                    let mut reply = Vec::new();
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&buf[12..16]);
                    reply.extend_from_slice(&900u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&(self.peers.len() as u32).to_be_bytes());
                    for peer in &self.peers {
                        if let SocketAddr::V4(v4) = peer {
                            reply.extend_from_slice(&v4.ip().octets());
                            reply.extend_from_slice(&v4.port().to_be_bytes());
                        }
                    }
                    let _ = self.socket.send_to(&reply, from).await;
                }
            }
        });
    }
}

/// Poll `condition` until it holds or `timeout_ms` elapses.
pub async fn wait_for<F>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_piece_layout() {
        let builder = TestTorrentBuilder::new("layout.bin")
            .piece_length(10)
            .content(vec![9u8; 25]);

        assert_eq!(builder.num_pieces(), 3);
        assert_eq!(builder.piece_data(0).len(), 10);
        assert_eq!(builder.piece_data(2).len(), 5);

        let torrent = builder.build();
        assert!(torrent.starts_with(b"d"));
        assert!(torrent.ends_with(b"e"));
    }
}
