//! # undertow
//!
//! A single-file BitTorrent download client: UDP tracker announce (BEP 15),
//! concurrent peer sessions over the peer wire protocol (BEP 3), SHA-1
//! piece verification, and positional writes into a pre-allocated output
//! file.
//!
//! ## Architecture
//!
//! - One tokio task per peer session, bounded by a semaphore
//! - A shared [`state::DownloadState`] holding the piece and peer
//!   registries behind two-tier locking
//! - Piece selection is uniform-random over what each peer advertises
//! - Hash-mismatched pieces are reset and re-selected by any session
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use undertow::{Client, ClientConfig, Metainfo};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let raw = std::fs::read("file.torrent")?;
//!     let metainfo = Metainfo::parse(&raw)?;
//!
//!     let client = Client::new(ClientConfig::default());
//!     let path = client.download(metainfo).await?;
//!     println!("saved to {}", path.display());
//!     Ok(())
//! }
//! ```

pub mod bencode;
pub mod client;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod session;
pub mod state;
pub mod tracker;
pub mod wire;

// Re-exports for convenience
pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, Result, TrackerErrorKind, TransportErrorKind};
pub use metainfo::{Metainfo, Sha1Hash};
pub use session::PeerSession;
pub use state::DownloadState;
pub use tracker::{AnnounceRequest, AnnounceResponse, TrackerClient};
pub use wire::{PeerMessage, BLOCK_SIZE};
