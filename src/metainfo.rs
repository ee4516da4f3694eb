//! Torrent metainfo parser
//!
//! Parses single-file .torrent files (BEP 3) and computes the info hash
//! from the raw bytes of the `info` dictionary.

use sha1::{Digest, Sha1};

use crate::bencode::{find_info_dict_bytes, BencodeValue};
use crate::error::{ClientError, Result};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Parsed metainfo for a single-file torrent
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the bencoded `info` dictionary
    pub info_hash: Sha1Hash,
    /// Tracker announce URL (`udp://host:port/...`)
    pub announce: String,
    /// Suggested output filename
    pub name: String,
    /// Nominal bytes per piece (the last piece may be shorter)
    pub piece_length: u64,
    /// Total file size in bytes
    pub total_length: u64,
    /// Per-piece SHA-1 hashes
    pub pieces: Vec<Sha1Hash>,
}

impl Metainfo {
    /// Parse a .torrent file from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        if root.as_dict().is_none() {
            return Err(ClientError::config("torrent root must be a dictionary"));
        }

        let announce = root
            .get("announce")
            .and_then(|v| v.as_string())
            .ok_or_else(|| ClientError::config("torrent has no announce URL"))?
            .to_string();

        let info = root
            .get("info")
            .ok_or_else(|| ClientError::config("missing 'info' dictionary"))?;

        // Multi-file torrents carry a "files" list instead of "length"
        if info.get("files").is_some() {
            return Err(ClientError::config("multi-file torrents are not supported"));
        }

        let name = info
            .get("name")
            .and_then(|v| v.as_string())
            .ok_or_else(|| ClientError::config("missing 'name' in info"))?
            .to_string();

        let piece_length = info
            .get("piece length")
            .and_then(|v| v.as_uint())
            .filter(|&n| n > 0)
            .ok_or_else(|| ClientError::config("missing or invalid 'piece length'"))?;

        let total_length = info
            .get("length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| ClientError::config("missing 'length' in info"))?;

        let pieces_bytes = info
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| ClientError::config("missing 'pieces' in info"))?;

        if pieces_bytes.len() % 20 != 0 {
            return Err(ClientError::config(format!(
                "pieces length {} is not a multiple of 20",
                pieces_bytes.len()
            )));
        }

        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected {
            return Err(ClientError::config(format!(
                "piece count mismatch: have {}, expected {} for {} bytes in {}-byte pieces",
                pieces.len(),
                expected,
                total_length,
                piece_length
            )));
        }

        let info_bytes = find_info_dict_bytes(data)?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let info_hash: Sha1Hash = hasher.finalize().into();

        Ok(Self {
            info_hash,
            announce,
            name,
            piece_length,
            total_length,
            pieces,
        })
    }

    /// Total number of pieces.
    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Actual byte length of a piece. The last piece covers only the
    /// remainder of the file.
    pub fn piece_length_at(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        end.saturating_sub(start)
    }

    /// Reference hash for a piece.
    pub fn piece_hash(&self, index: u32) -> Option<&Sha1Hash> {
        self.pieces.get(index as usize)
    }

    /// Info hash as lowercase hex, for logging.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_torrent(piece_length: u64, total_length: u64, num_pieces: usize) -> Vec<u8> {
        let pieces = vec![0u8; num_pieces * 20];
        let mut data = Vec::new();
        data.extend_from_slice(b"d");
        data.extend_from_slice(b"8:announce20:udp://tracker.lan:80");
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(format!("6:lengthi{}e", total_length).as_bytes());
        data.extend_from_slice(b"4:name8:test.bin");
        data.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
        data.extend_from_slice(format!("6:pieces{}:", pieces.len()).as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_parse_single_file() {
        let data = build_torrent(32768, 100, 1);
        let metainfo = Metainfo::parse(&data).unwrap();

        assert_eq!(metainfo.announce, "udp://tracker.lan:80");
        assert_eq!(metainfo.name, "test.bin");
        assert_eq!(metainfo.piece_length, 32768);
        assert_eq!(metainfo.total_length, 100);
        assert_eq!(metainfo.num_pieces(), 1);
    }

    #[test]
    fn test_info_hash_matches_independent_digest() {
        let data = build_torrent(32768, 100, 1);
        let metainfo = Metainfo::parse(&data).unwrap();

        let info_bytes = find_info_dict_bytes(&data).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let expected: Sha1Hash = hasher.finalize().into();

        assert_eq!(metainfo.info_hash, expected);
        assert_eq!(metainfo.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_last_piece_length() {
        // 262144 + 262144 + 12 = 524300
        let data = build_torrent(262144, 524300, 3);
        let metainfo = Metainfo::parse(&data).unwrap();

        assert_eq!(metainfo.piece_length_at(0), 262144);
        assert_eq!(metainfo.piece_length_at(1), 262144);
        assert_eq!(metainfo.piece_length_at(2), 12);
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        // 2 hashes but the sizes call for 1 piece
        let data = build_torrent(32768, 100, 2);
        assert!(Metainfo::parse(&data).is_err());
    }

    #[test]
    fn test_multi_file_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce20:udp://tracker.lan:80");
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(b"5:filesld6:lengthi5e4:pathl1:aeee");
        data.extend_from_slice(b"4:name4:dir1");
        data.extend_from_slice(b"12:piece lengthi16384e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let err = Metainfo::parse(&data).unwrap_err();
        assert!(err.to_string().contains("multi-file"));
    }

    #[test]
    fn test_missing_announce_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:infod6:lengthi5e4:name1:x12:piece lengthi16384e6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());
    }
}
