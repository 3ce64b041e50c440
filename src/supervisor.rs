//! Reconnect loop around single-peer sessions.
//!
//! The supervisor starts sessions one at a time against the same peer,
//! resuming each from the cursor the previous session returned. Backoff
//! doubles on consecutive failures and resets once a session makes scan
//! progress, so a flaky-but-usable peer is not punished like a dead one.

use std::sync::Arc;

use dashcore::blockdata::constants::genesis_block;
use dashcore::Network;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::chain::HeaderChain;
use crate::config::ClientConfig;
use crate::cursor::ScanCursor;
use crate::error::Result;
use crate::network::PeerTransport;
use crate::session::PeerSession;
use crate::storage::ChainStore;
use crate::tracker::Tracker;
use crate::types::DisconnectReason;

/// Builds a fresh transport for each connection attempt.
pub trait Connector: Send + Sync {
    type Transport: PeerTransport + 'static;

    fn new_transport(&self) -> Self::Transport;
}

/// Runs sessions until shutdown or the retry budget is exhausted.
pub struct ReconnectSupervisor<C: Connector> {
    connector: C,
    config: ClientConfig,
    chain: Arc<RwLock<HeaderChain>>,
    tracker: Arc<Tracker>,
    store: Option<ChainStore>,
    cursor: ScanCursor,
    shutdown: CancellationToken,
}

impl<C: Connector> ReconnectSupervisor<C> {
    pub fn new(
        connector: C,
        config: ClientConfig,
        chain: Arc<RwLock<HeaderChain>>,
        tracker: Arc<Tracker>,
        store: Option<ChainStore>,
        cursor: ScanCursor,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            config,
            chain,
            tracker,
            store,
            cursor,
            shutdown,
        }
    }

    /// Run until shutdown. Returns the final scan cursor.
    pub async fn run(mut self) -> Result<ScanCursor> {
        let mut consecutive_failures = 0u32;
        let mut delay = self.config.reconnect_base_delay;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let session = PeerSession::new(
                self.connector.new_transport(),
                self.config.clone(),
                Arc::clone(&self.chain),
                Arc::clone(&self.tracker),
                self.cursor.clone(),
                self.shutdown.child_token(),
            );

            let height_before = self.cursor.height();
            let result = session.run().await;
            self.cursor = result.final_cursor;
            self.persist().await;

            match result.reason {
                DisconnectReason::ShutdownRequested => break,
                reason => {
                    if self.cursor.height() > height_before {
                        // The session did useful work; treat the drop as fresh.
                        consecutive_failures = 0;
                        delay = self.config.reconnect_base_delay;
                    } else {
                        consecutive_failures += 1;
                    }

                    if let Some(max) = self.config.max_reconnect_attempts {
                        if consecutive_failures >= max {
                            tracing::error!(
                                "Giving up after {} consecutive failed sessions",
                                consecutive_failures
                            );
                            break;
                        }
                    }

                    tracing::warn!(
                        "Session ended ({:?}), reconnecting in {:?}",
                        reason,
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = std::cmp::min(delay.saturating_mul(2), self.config.reconnect_max_delay);
                }
            }
        }

        self.persist().await;
        Ok(self.cursor)
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let headers = self.chain.read().await.serialize();
        if let Err(e) = store.save_headers(headers).await {
            tracing::error!("Failed to persist headers: {}", e);
        }
        if let Err(e) = store.save_cursor(self.cursor.serialize()).await {
            tracing::error!("Failed to persist cursor: {}", e);
        }
        match self.tracker.serialize_scripts().await {
            Ok(bytes) => {
                if let Err(e) = store.save_watch_list(bytes).await {
                    tracing::error!("Failed to persist watch list: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize watch list: {}", e),
        }
    }
}

/// Load the persisted chain, falling back to a genesis-rooted one when the
/// store is absent, empty, or corrupt.
pub async fn load_or_init_chain(store: Option<&ChainStore>, network: Network) -> HeaderChain {
    let genesis = genesis_block(network).header;
    let Some(store) = store else {
        return HeaderChain::new(genesis);
    };

    match store.load_headers().await {
        Ok(Some(bytes)) => match HeaderChain::deserialize(&bytes) {
            Ok(chain) => {
                tracing::info!("Restored header chain at height {}", chain.height());
                chain
            }
            Err(e) => {
                tracing::warn!("Discarding stored headers: {}", e);
                HeaderChain::new(genesis)
            }
        },
        Ok(None) => HeaderChain::new(genesis),
        Err(e) => {
            tracing::warn!("Failed to read stored headers: {}", e);
            HeaderChain::new(genesis)
        }
    }
}

/// Load the persisted cursor, falling back to genesis on absence or
/// corruption.
pub async fn load_or_init_cursor(store: Option<&ChainStore>, network: Network) -> ScanCursor {
    let genesis = genesis_block(network).header;
    let Some(store) = store else {
        return ScanCursor::from_genesis(&genesis);
    };

    match store.load_cursor().await {
        Ok(Some(bytes)) => match ScanCursor::deserialize(&bytes) {
            Ok(cursor) => {
                tracing::info!("Resuming scan from height {}", cursor.height());
                cursor
            }
            Err(e) => {
                tracing::warn!("Discarding stored cursor: {}", e);
                ScanCursor::from_genesis(&genesis)
            }
        },
        Ok(None) => ScanCursor::from_genesis(&genesis),
        Err(e) => {
            tracing::warn!("Failed to read stored cursor: {}", e);
            ScanCursor::from_genesis(&genesis)
        }
    }
}
