//! Peer wire protocol codec
//!
//! Framing and message encoding for the BitTorrent peer protocol (BEP 3):
//! a 4-byte big-endian length prefix, a 1-byte message ID, and a payload.
//! A zero-length frame is a keep-alive.

use bitvec::prelude::*;

use crate::error::{ClientError, Result, TransportErrorKind};

/// Protocol identifier carried in the handshake
pub const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Size of the handshake frame: 1 + 19 + 8 + 20 + 20
pub const HANDSHAKE_LEN: usize = 68;

/// Transfer unit for piece requests (16 KiB)
pub const BLOCK_SIZE: u32 = 16384;

/// Largest frame we accept: one block plus header slack. Anything bigger
/// is a protocol violation, not an allocation.
pub const MAX_FRAME_LEN: usize = 32 * 1024;

/// A decoded peer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length frame; resets the peer's inactivity clock
    KeepAlive,
    /// Peer will not serve our requests (id 0)
    Choke,
    /// Peer will serve our requests (id 1)
    Unchoke,
    /// We want data from the peer (id 2)
    Interested,
    /// We want nothing from the peer (id 3)
    NotInterested,
    /// Peer acquired one piece (id 4)
    Have { piece_index: u32 },
    /// Peer's full piece inventory, MSB-first (id 5)
    Bitfield { bitfield: Vec<u8> },
    /// Ask for a block (id 6)
    Request { index: u32, begin: u32, length: u32 },
    /// A block of piece data (id 7)
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Withdraw a pending request (id 8)
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any ID outside the recognized set; dropped by the session
    Ignored { id: u8 },
}

fn frame_err(message: impl Into<String>) -> ClientError {
    ClientError::transport(TransportErrorKind::Protocol, message)
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
}

impl PeerMessage {
    /// Encode the message as a full frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { piece_index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&piece_index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Cancel {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 8];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Ignored { id } => vec![0, 0, 0, 1, *id],
        }
    }

    /// Decode a frame body (the bytes after the length prefix). An empty
    /// body is a keep-alive.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = body[0];
        let payload = &body[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => {
                if payload.len() < 4 {
                    return Err(frame_err("have message too short"));
                }
                Ok(Self::Have {
                    piece_index: read_u32(payload, 0),
                })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                if payload.len() < 12 {
                    return Err(frame_err("request message too short"));
                }
                Ok(Self::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(frame_err("piece message too short"));
                }
                Ok(Self::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    block: payload[8..].to_vec(),
                })
            }

            8 => {
                if payload.len() < 12 {
                    return Err(frame_err("cancel message too short"));
                }
                Ok(Self::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            _ => Ok(Self::Ignored { id }),
        }
    }
}

/// The 68-byte peer handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Encode: pstrlen, "BitTorrent protocol", 8 zero reserved bytes,
    /// info hash, peer ID.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received handshake, validating the protocol preamble.
    pub fn parse(raw: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if raw[0] as usize != PROTOCOL_STRING.len() {
            return Err(ClientError::handshake(format!(
                "bad pstrlen {}",
                raw[0]
            )));
        }
        if &raw[1..20] != PROTOCOL_STRING {
            return Err(ClientError::handshake("bad protocol string"));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);

        Ok(Self { info_hash, peer_id })
    }
}

/// Expand a bitfield into the piece indices it advertises.
///
/// Bit i (MSB-first within each byte) set means the peer has piece i.
/// Indices at or beyond `num_pieces` are spare padding and are dropped.
pub fn bitfield_pieces(bitfield: &[u8], num_pieces: u32) -> Vec<u32> {
    bitfield
        .view_bits::<Msb0>()
        .iter_ones()
        .map(|i| i as u32)
        .filter(|&i| i < num_pieces)
        .collect()
}

/// Expected bitfield size in bytes for a piece count.
pub fn bitfield_len(num_pieces: u32) -> usize {
    (num_pieces as usize).div_ceil(8)
}
