//! UDP tracker client (BEP 15)
//!
//! Implements the two-step connect/announce exchange against a UDP tracker
//! and returns the compact peer list. The wire layout is fixed-offset
//! big-endian, so requests and responses are built and parsed with plain
//! byte slicing; the pure codec functions are separate from the socket
//! driver so they can be tested without a network.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use url::Url;

use crate::error::{ClientError, Result, TrackerErrorKind};
use crate::metainfo::Sha1Hash;

/// Magic constant opening every connect request
pub const PROTOCOL_MAGIC: u64 = 0x41727101980;

pub const ACTION_CONNECT: u32 = 0;
pub const ACTION_ANNOUNCE: u32 = 1;
pub const ACTION_ERROR: u32 = 3;

/// Announce event: download started
pub const EVENT_STARTED: u32 = 2;

/// Receive deadline for the connect exchange
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive deadline for the announce exchange
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Connect attempts; retries back off 1 s, 2 s, 4 s
const CONNECT_ATTEMPTS: u32 = 3;

/// Large enough for the 20-byte header plus several hundred peer entries
const RECV_BUF_LEN: usize = 4096;

/// Result of a successful announce
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds the tracker wants between announces
    pub interval: u32,
    /// Incomplete peers known to the tracker
    pub leechers: u32,
    /// Complete peers known to the tracker
    pub seeders: u32,
    /// Candidate peer endpoints
    pub peers: Vec<SocketAddrV4>,
}

/// Build a 16-byte connect request.
pub fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf
}

/// Parse a connect response, returning the connection ID.
pub fn parse_connect_response(buf: &[u8], expected_tx: u32) -> Result<u64> {
    if buf.len() < 8 {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            "connect response too short",
        ));
    }

    let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let tx = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if action == ACTION_ERROR {
        return Err(tracker_rejection(&buf[8..]));
    }
    if action != ACTION_CONNECT {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            format!("unexpected connect action {}", action),
        ));
    }
    if tx != expected_tx {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            format!("connect transaction mismatch: sent {}, got {}", expected_tx, tx),
        ));
    }
    if buf.len() < 16 {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            "connect response too short",
        ));
    }

    Ok(u64::from_be_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]))
}

/// Parameters for one announce request
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    /// Remaining bytes, NOT the piece length
    pub left: u64,
    pub uploaded: u64,
    pub key: u32,
    pub port: u16,
}

/// Build the fixed 98-byte announce request.
pub fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    req: &AnnounceRequest,
) -> [u8; 98] {
    let mut buf = [0u8; 98];
    buf[0..8].copy_from_slice(&connection_id.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf[16..36].copy_from_slice(&req.info_hash);
    buf[36..56].copy_from_slice(&req.peer_id);
    buf[56..64].copy_from_slice(&req.downloaded.to_be_bytes());
    buf[64..72].copy_from_slice(&req.left.to_be_bytes());
    buf[72..80].copy_from_slice(&req.uploaded.to_be_bytes());
    buf[80..84].copy_from_slice(&EVENT_STARTED.to_be_bytes());
    // bytes 84..88: IP = 0, the tracker infers it from the datagram source
    buf[88..92].copy_from_slice(&req.key.to_be_bytes());
    buf[92..96].copy_from_slice(&(-1i32).to_be_bytes());
    buf[96..98].copy_from_slice(&req.port.to_be_bytes());
    buf
}

/// Parse an announce response. Whole 6-byte peer entries only; a trailing
/// partial entry is ignored.
pub fn parse_announce_response(buf: &[u8], expected_tx: u32) -> Result<AnnounceResponse> {
    if buf.len() < 8 {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            "announce response too short",
        ));
    }

    let action = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let tx = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if action == ACTION_ERROR {
        return Err(tracker_rejection(&buf[8..]));
    }
    if action != ACTION_ANNOUNCE {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            format!("unexpected announce action {}", action),
        ));
    }
    if tx != expected_tx {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            format!("announce transaction mismatch: sent {}, got {}", expected_tx, tx),
        ));
    }
    if buf.len() < 20 {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            "announce response too short",
        ));
    }

    let interval = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let leechers = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    let seeders = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);

    let peers = buf[20..]
        .chunks_exact(6)
        .map(|entry| {
            let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
            let port = u16::from_be_bytes([entry[4], entry[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect();

    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}

fn tracker_rejection(message: &[u8]) -> ClientError {
    let text = if message.is_empty() {
        "(no message)".to_string()
    } else {
        String::from_utf8_lossy(message).to_string()
    };
    ClientError::tracker(TrackerErrorKind::Rejected, format!("tracker error: {}", text))
}

/// UDP tracker client
pub struct TrackerClient {
    connect_timeout: Duration,
    announce_timeout: Duration,
    connect_attempts: u32,
}

impl TrackerClient {
    pub fn new() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            announce_timeout: ANNOUNCE_TIMEOUT,
            connect_attempts: CONNECT_ATTEMPTS,
        }
    }

    /// Override the deadlines, mainly for tests.
    pub fn with_timeouts(connect: Duration, announce: Duration, attempts: u32) -> Self {
        Self {
            connect_timeout: connect,
            announce_timeout: announce,
            connect_attempts: attempts,
        }
    }

    /// Run the full connect + announce exchange against `announce_url`
    /// (a `udp://host:port/...` URL) and return the peer list.
    pub async fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let host_port = udp_tracker_host(announce_url)?;

        let addr = tokio::net::lookup_host(&host_port)
            .await
            .map_err(|e| {
                ClientError::tracker(
                    TrackerErrorKind::Dns,
                    format!("failed to resolve {}: {}", host_port, e),
                )
            })?
            .next()
            .ok_or_else(|| {
                ClientError::tracker(
                    TrackerErrorKind::Dns,
                    format!("no addresses for {}", host_port),
                )
            })?;

        let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
            ClientError::tracker(TrackerErrorKind::Io, format!("failed to bind UDP socket: {}", e))
        })?;
        socket.connect(addr).await.map_err(|e| {
            ClientError::tracker(
                TrackerErrorKind::Io,
                format!("failed to connect to {}: {}", addr, e),
            )
        })?;

        let connection_id = self.connect(&socket).await?;
        let response = self.send_announce(&socket, connection_id, request).await?;

        tracing::info!(
            interval = response.interval,
            seeders = response.seeders,
            leechers = response.leechers,
            peers = response.peers.len(),
            "announce ok"
        );

        Ok(response)
    }

    /// Connect exchange with exponential backoff between attempts.
    async fn connect(&self, socket: &UdpSocket) -> Result<u64> {
        let mut recv_buf = [0u8; RECV_BUF_LEN];
        let mut last_err = None;

        for attempt in 0..self.connect_attempts {
            if attempt > 0 {
                let backoff = Duration::from_secs(1 << (attempt - 1));
                tracing::debug!(attempt, ?backoff, "retrying tracker connect");
                tokio::time::sleep(backoff).await;
            }

            let tx: u32 = rand::rng().random();
            let request = build_connect_request(tx);
            socket.send(&request).await.map_err(|e| {
                ClientError::tracker(TrackerErrorKind::Io, format!("connect send failed: {}", e))
            })?;

            match timeout(self.connect_timeout, socket.recv(&mut recv_buf)).await {
                Err(_) => {
                    last_err = Some(ClientError::tracker(
                        TrackerErrorKind::Timeout,
                        "tracker connect timed out",
                    ));
                }
                Ok(Err(e)) => {
                    return Err(ClientError::tracker(
                        TrackerErrorKind::Io,
                        format!("connect recv failed: {}", e),
                    ))
                }
                Ok(Ok(n)) => return parse_connect_response(&recv_buf[..n], tx),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            ClientError::tracker(TrackerErrorKind::Timeout, "tracker connect timed out")
        }))
    }

    async fn send_announce(
        &self,
        socket: &UdpSocket,
        connection_id: u64,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let tx: u32 = rand::rng().random();
        let packet = build_announce_request(connection_id, tx, request);
        socket.send(&packet).await.map_err(|e| {
            ClientError::tracker(TrackerErrorKind::Io, format!("announce send failed: {}", e))
        })?;

        let mut recv_buf = [0u8; RECV_BUF_LEN];
        let n = timeout(self.announce_timeout, socket.recv(&mut recv_buf))
            .await
            .map_err(|_| {
                ClientError::tracker(TrackerErrorKind::Timeout, "tracker announce timed out")
            })?
            .map_err(|e| {
                ClientError::tracker(
                    TrackerErrorKind::Io,
                    format!("announce recv failed: {}", e),
                )
            })?;

        parse_announce_response(&recv_buf[..n], tx)
    }
}

impl Default for TrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract `host:port` from a `udp://` announce URL.
fn udp_tracker_host(announce_url: &str) -> Result<String> {
    let url = Url::parse(announce_url).map_err(|e| {
        ClientError::tracker(
            TrackerErrorKind::Protocol,
            format!("bad announce URL {:?}: {}", announce_url, e),
        )
    })?;

    if url.scheme() != "udp" {
        return Err(ClientError::tracker(
            TrackerErrorKind::Protocol,
            format!("unsupported tracker scheme {:?}", url.scheme()),
        ));
    }

    let host = url.host_str().ok_or_else(|| {
        ClientError::tracker(TrackerErrorKind::Protocol, "announce URL has no host")
    })?;
    let port = url.port().ok_or_else(|| {
        ClientError::tracker(TrackerErrorKind::Protocol, "announce URL has no port")
    })?;

    Ok(format!("{}:{}", host, port))
}
