//! Download orchestrator
//!
//! Top-level flow: announce to the tracker, spawn one bounded session per
//! candidate peer, log progress on an interval, and cancel everything once
//! every piece is saved.

use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::metainfo::Metainfo;
use crate::session::PeerSession;
use crate::state::DownloadState;
use crate::tracker::{AnnounceRequest, TrackerClient};

/// Orchestrates a single torrent download
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Run the download to completion and return the absolute path of the
    /// output file.
    pub async fn download(&self, metainfo: Metainfo) -> Result<PathBuf> {
        tracing::info!(
            name = %metainfo.name,
            pieces = metainfo.num_pieces(),
            bytes = metainfo.total_length,
            info_hash = %metainfo.info_hash_hex(),
            "starting download"
        );

        let peer_id = generate_peer_id();
        let state = Arc::new(DownloadState::create(&metainfo, &self.config.download_dir).await?);

        let announce = TrackerClient::new()
            .announce(
                &metainfo.announce,
                &AnnounceRequest {
                    info_hash: metainfo.info_hash,
                    peer_id,
                    downloaded: 0,
                    // remaining bytes, which at start is the whole file
                    left: metainfo.total_length,
                    uploaded: 0,
                    key: rand::rng().random(),
                    port: self.config.listen_port,
                },
            )
            .await?;

        if announce.peers.is_empty() {
            return Err(ClientError::tracker(
                crate::error::TrackerErrorKind::Protocol,
                "tracker returned no peers",
            ));
        }

        let cancel = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.config.max_peers));

        let reporter = self.spawn_reporter(state.clone(), cancel.clone());

        let mut sessions: JoinSet<Result<()>> = JoinSet::new();
        for addr in announce.peers.into_iter().take(self.config.max_peers) {
            let state = state.clone();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();
            let info_hash = metainfo.info_hash;

            sessions.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::transport(
                        crate::error::TransportErrorKind::Io,
                        "session semaphore closed",
                    ))?;
                PeerSession::new(addr, info_hash, peer_id, state)
                    .run(cancel)
                    .await
            });
        }

        let mut fatal: Option<ClientError> = None;
        loop {
            // Re-checked every pass: a completion notification that fires
            // while a join event is being handled must not be lost.
            if state.is_complete() && !cancel.is_cancelled() {
                tracing::info!("all pieces saved, cancelling remaining sessions");
                cancel.cancel();
            }

            tokio::select! {
                joined = sessions.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) if e.is_fatal() => {
                        tracing::error!(error = %e, "fatal session error, aborting");
                        if fatal.is_none() {
                            fatal = Some(e);
                        }
                        cancel.cancel();
                    }
                    // Transport, handshake and integrity errors are scoped
                    // to their session; the rest of the swarm carries on.
                    Some(Ok(Err(e))) => tracing::debug!(error = %e, "session ended"),
                    Some(Err(e)) => tracing::warn!(error = %e, "session task panicked"),
                },
                // Wakes the loop so the completion check above runs
                _ = state.completed.notified() => {}
            }
        }

        cancel.cancel();
        reporter.await.ok();

        state.finalize().await?;

        if let Some(e) = fatal {
            return Err(e);
        }

        let snapshot = state.progress();
        if state.is_complete() {
            tracing::info!(
                bytes = snapshot.downloaded_bytes,
                "download complete"
            );
        } else {
            tracing::warn!(
                pieces_saved = snapshot.pieces_saved,
                total_pieces = snapshot.total_pieces,
                "all sessions exited before completion"
            );
        }

        let path = state.output_path().to_path_buf();
        Ok(path.canonicalize().unwrap_or(path))
    }

    fn spawn_reporter(
        &self,
        state: Arc<DownloadState>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let period = self.config.progress_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick is not a report
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let p = state.progress();
                        tracing::info!(
                            "progress: {}/{} pieces | {:.2}/{:.2} MiB | peers: {} total, {} unchoked | in flight: {}",
                            p.pieces_saved,
                            p.total_pieces,
                            p.downloaded_bytes as f64 / (1024.0 * 1024.0),
                            p.total_bytes as f64 / (1024.0 * 1024.0),
                            p.peers,
                            p.unchoked_peers,
                            p.pieces_in_flight,
                        );
                    }
                }
            }
        })
    }
}

/// 20 bytes straight from the thread-local CSPRNG; no client prefix.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    rand::rng().fill(&mut peer_id[..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_peer_id() {
        let a = generate_peer_id();
        let b = generate_peer_id();
        assert_eq!(a.len(), 20);
        // two draws from a CSPRNG colliding means something is broken
        assert_ne!(a, b);
    }
}
