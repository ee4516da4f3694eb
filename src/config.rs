//! Client configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one download run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory the output file is created in
    pub download_dir: PathBuf,

    /// Port advertised to the tracker. No inbound listener is opened;
    /// this client is download-only.
    pub listen_port: u16,

    /// Peer session cap. Announce results beyond this are dropped and the
    /// semaphore bounding concurrent sessions has this capacity.
    pub max_peers: usize,

    /// How often the aggregate progress line is logged
    pub progress_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            max_peers: 57,
            progress_interval: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.listen_port, 6881);
        assert_eq!(config.max_peers, 57);
        assert_eq!(config.progress_interval, Duration::from_secs(15));
    }
}
