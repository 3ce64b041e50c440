//! Single-peer session: handshake, filter install, header sync, filtered
//! block scan.
//!
//! A session owns one transport for its whole life. It ends by returning a
//! [`SessionResult`] carrying the scan cursor to resume from and the reason
//! the connection ended; the supervisor decides whether to start another one.

use std::collections::HashSet;
use std::sync::Arc;

use dashcore::{Header as BlockHeader, OutPoint, Transaction, Txid};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bloom::BloomFilterBuilder;
use crate::chain::HeaderChain;
use crate::config::ClientConfig;
use crate::cursor::ScanCursor;
use crate::error::{ChainError, NetworkResult};
use crate::misbehavior::{Misbehavior, MisbehaviorTracker};
use crate::network::{NetworkEvent, PeerTransport};
use crate::tracker::Tracker;
use crate::types::{ChainLocation, DisconnectReason, Operation, SessionResult};

/// Peers cap a `headers` response at this many entries; a shorter batch
/// means the peer has nothing further.
const MAX_HEADERS_PER_BATCH: usize = 2000;

/// How often the scan loop polls for a stale filter.
const FILTER_STALE_POLL: std::time::Duration = std::time::Duration::from_secs(1);

/// Lifecycle of a session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    FilterInstalled,
    Syncing,
    Scanning,
    Disconnected,
}

/// Result of applying a headers batch.
enum HeadersOutcome {
    /// Extended the tip, or ignorably stale.
    Applied,
    /// Swapped the active tail for a heavier branch.
    Reorganized,
    /// Contained an invalid header; penalized but tolerable.
    Rejected,
    /// Pushed the peer over the misbehavior threshold.
    Drop,
}

/// A filtered block whose transactions are still arriving.
struct PendingBlock {
    location: ChainLocation,
    expected: HashSet<Txid>,
}

/// One connection's worth of protocol state.
pub struct PeerSession<T: PeerTransport> {
    transport: T,
    config: ClientConfig,
    chain: Arc<RwLock<HeaderChain>>,
    tracker: Arc<Tracker>,
    cursor: ScanCursor,
    misbehavior: MisbehaviorTracker,
    state: SessionState,
    shutdown: CancellationToken,
    pending_block: Option<PendingBlock>,
}

impl<T: PeerTransport> PeerSession<T> {
    pub fn new(
        transport: T,
        config: ClientConfig,
        chain: Arc<RwLock<HeaderChain>>,
        tracker: Arc<Tracker>,
        cursor: ScanCursor,
        shutdown: CancellationToken,
    ) -> Self {
        let misbehavior = MisbehaviorTracker::new(
            config.misbehavior_threshold,
            config.misbehavior_decay_interval,
        );
        Self {
            transport,
            config,
            chain,
            tracker,
            cursor,
            misbehavior,
            state: SessionState::Connecting,
            shutdown,
            pending_block: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> SessionResult {
        let reason = match self.run_inner().await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::TransportFailure(e.to_string()),
        };
        self.transport.disconnect().await;
        self.state = SessionState::Disconnected;
        tracing::info!("Session ended: {:?}", reason);
        SessionResult {
            final_cursor: self.cursor,
            reason,
        }
    }

    async fn run_inner(&mut self) -> NetworkResult<DisconnectReason> {
        self.state = SessionState::Handshaking;
        let peer = self.transport.connect().await?;
        tracing::info!(
            "Peer {} (protocol {}) at height {}",
            peer.user_agent,
            peer.version,
            peer.start_height
        );

        // The filter must be live before any block or mempool request, or
        // the peer would relay nothing.
        self.install_filter().await?;
        self.state = SessionState::FilterInstalled;

        self.state = SessionState::Syncing;
        if let Some(reason) = self.sync_headers().await? {
            return Ok(reason);
        }

        self.state = SessionState::Scanning;
        let tip = self.chain.read().await.tip();
        self.tracker.notify_height(tip.height);
        self.scan().await
    }

    async fn install_filter(&mut self) -> NetworkResult<()> {
        let filter = BloomFilterBuilder::new(self.config.false_positive_rate)
            .add_scripts(self.tracker.scripts().await)
            .add_outpoints(self.tracker.watched_outpoints().await)
            .build()
            .map_err(|e| {
                crate::error::NetworkError::ProtocolError(format!(
                    "Filter construction failed: {}",
                    e
                ))
            })?;
        self.tracker.take_filter_stale().await;
        self.transport.install_filter(&filter).await?;
        tracing::debug!("Bloom filter installed");
        Ok(())
    }

    /// Sync headers until the peer runs out. Returns a disconnect reason if
    /// the session must end, `None` when the chain is caught up.
    async fn sync_headers(&mut self) -> NetworkResult<Option<DisconnectReason>> {
        loop {
            let locator: Vec<_> = {
                let chain = self.chain.read().await;
                chain.locator_from(chain.height()).iter().map(|l| l.hash).collect()
            };
            self.transport.request_headers(locator).await?;

            let event = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(Some(DisconnectReason::ShutdownRequested));
                }
                event = tokio::time::timeout(
                    self.config.message_timeout,
                    self.transport.next_event(),
                ) => match event {
                    Ok(event) => event?,
                    Err(_) => {
                        tracing::warn!("Header sync timed out");
                        return Ok(Some(DisconnectReason::Timeout));
                    }
                }
            };

            match event {
                NetworkEvent::Headers(headers) => {
                    let before = self.chain.read().await.height();
                    match self.apply_headers(&headers).await {
                        HeadersOutcome::Drop => {
                            return Ok(Some(DisconnectReason::MisbehaviorThresholdExceeded));
                        }
                        HeadersOutcome::Rejected => {
                            // Penalized but tolerable; ask again.
                            continue;
                        }
                        HeadersOutcome::Applied | HeadersOutcome::Reorganized => {}
                    }
                    let after = self.chain.read().await.height();
                    if headers.len() < MAX_HEADERS_PER_BATCH || after == before {
                        tracing::info!("Header sync complete at height {}", after);
                        return Ok(None);
                    }
                }
                NetworkEvent::Malformed(desc) => {
                    tracing::warn!("Malformed message during sync: {}", desc);
                    if self.misbehavior.penalize(Misbehavior::InvalidMessage) {
                        return Ok(Some(DisconnectReason::MisbehaviorThresholdExceeded));
                    }
                }
                NetworkEvent::FilteredBlock {
                    ..
                }
                | NetworkEvent::Transaction(_) => {
                    // The filter is already live, so relayed matches can
                    // legitimately arrive before the scan starts. They will be
                    // re-served once the scan requests them.
                    tracing::debug!("Deferring filtered data received during header sync");
                }
                NetworkEvent::Disconnected => {
                    return Ok(Some(DisconnectReason::TransportFailure(
                        "peer closed connection".to_string(),
                    )));
                }
            }
        }
    }

    /// Apply a headers batch, all or nothing: a batch containing one invalid
    /// header leaves the chain untouched. Extension at the tip is the
    /// degenerate reorganization that replaces an empty tail.
    async fn apply_headers(&mut self, headers: &[BlockHeader]) -> HeadersOutcome {
        if headers.is_empty() {
            return HeadersOutcome::Applied;
        }

        let mut chain = self.chain.write().await;
        let extends_tip = headers[0].prev_blockhash == chain.tip().hash;

        match chain.reorganize_to(headers) {
            Ok(new_height) => {
                drop(chain);
                self.tracker.notify_height(new_height);
                if extends_tip {
                    HeadersOutcome::Applied
                } else {
                    tracing::info!("Reorganized to height {}", new_height);
                    HeadersOutcome::Reorganized
                }
            }
            Err(ChainError::InsufficientWork) => {
                // A stale or duplicate branch is not misbehavior, just ignorable.
                tracing::debug!("Ignoring branch with insufficient work");
                HeadersOutcome::Applied
            }
            Err(ChainError::InvalidHeader(desc)) => {
                tracing::warn!("Discarding headers batch: {}", desc);
                drop(chain);
                self.reject_headers()
            }
        }
    }

    fn reject_headers(&mut self) -> HeadersOutcome {
        if self.misbehavior.penalize(Misbehavior::InvalidHeader) {
            HeadersOutcome::Drop
        } else {
            HeadersOutcome::Rejected
        }
    }

    /// Steady-state loop: filtered blocks, mempool transactions, filter
    /// refreshes, and chain updates, until disconnect or shutdown.
    async fn scan(&mut self) -> NetworkResult<DisconnectReason> {
        self.transport.request_filtered_blocks(self.cursor.to_locations()).await?;
        self.transport.request_mempool().await?;

        let mut refresh = tokio::time::interval(self.config.filter_refresh_interval);
        refresh.tick().await;
        let mut stale_poll = tokio::time::interval(FILTER_STALE_POLL);
        stale_poll.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.finalize_pending_block();
                    return Ok(DisconnectReason::ShutdownRequested);
                }
                _ = refresh.tick() => {
                    // Fresh tweak on the periodic reinstall.
                    self.install_filter().await?;
                    self.transport.request_mempool().await?;
                }
                _ = stale_poll.tick() => {
                    if self.tracker.take_filter_stale().await {
                        self.install_filter().await?;
                        self.transport.request_mempool().await?;
                    }
                }
                event = self.transport.next_event() => {
                    if let Some(reason) = self.handle_scan_event(event?).await? {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    async fn handle_scan_event(
        &mut self,
        event: NetworkEvent,
    ) -> NetworkResult<Option<DisconnectReason>> {
        match event {
            NetworkEvent::FilteredBlock {
                header,
                matched,
            } => {
                self.finalize_pending_block();
                if self.accept_filtered_block(header, matched).await {
                    return Ok(Some(DisconnectReason::MisbehaviorThresholdExceeded));
                }
            }
            NetworkEvent::Transaction(tx) => {
                if self.process_incoming_tx(tx).await {
                    return Ok(Some(DisconnectReason::MisbehaviorThresholdExceeded));
                }
            }
            NetworkEvent::Headers(headers) => {
                match self.apply_headers(&headers).await {
                    HeadersOutcome::Drop => {
                        return Ok(Some(DisconnectReason::MisbehaviorThresholdExceeded));
                    }
                    HeadersOutcome::Rejected => {}
                    HeadersOutcome::Applied => {
                        // The tip moved forward; pick up the new blocks from
                        // the cursor.
                        self.transport
                            .request_filtered_blocks(self.cursor.to_locations())
                            .await?;
                    }
                    HeadersOutcome::Reorganized => {
                        // The active branch changed under the scan. The cursor
                        // is not rewound; the next session's locator resolves
                        // the branch point and the rescan is deduplicated.
                        tracing::debug!("Deferring rescan of the new branch to the next session");
                    }
                }
            }
            NetworkEvent::Malformed(desc) => {
                tracing::warn!("Malformed message during scan: {}", desc);
                if self.misbehavior.penalize(Misbehavior::InvalidMessage) {
                    return Ok(Some(DisconnectReason::MisbehaviorThresholdExceeded));
                }
            }
            NetworkEvent::Disconnected => {
                self.finalize_pending_block();
                return Ok(Some(DisconnectReason::TransportFailure(
                    "peer closed connection".to_string(),
                )));
            }
        }
        Ok(None)
    }

    /// Start tracking a filtered block. Unknown headers that extend the tip
    /// are appended on the spot; headers that fit nowhere trigger a header
    /// re-sync and the block is dropped (the peer re-serves it afterwards).
    async fn accept_filtered_block(
        &mut self,
        header: BlockHeader,
        matched: Vec<Txid>,
    ) -> bool {
        let hash = header.block_hash();
        let height = {
            let mut chain = self.chain.write().await;
            match chain.height_of(&hash) {
                Some(height) => Some(height),
                None => match chain.try_append(header) {
                    Ok(height) => {
                        drop(chain);
                        self.tracker.notify_height(height);
                        Some(height)
                    }
                    Err(_) => None,
                },
            }
        };

        let Some(height) = height else {
            tracing::debug!("Filtered block {} fits nowhere, re-syncing headers", hash);
            let locator: Vec<_> = {
                let chain = self.chain.read().await;
                chain.locator_from(chain.height()).iter().map(|l| l.hash).collect()
            };
            if let Err(e) = self.transport.request_headers(locator).await {
                tracing::warn!("Header re-sync request failed: {}", e);
            }
            return false;
        };

        let location = ChainLocation::new(hash, height);
        if matched.is_empty() {
            self.advance_cursor(location);
            return false;
        }

        tracing::debug!("Block {} at height {} matched {} txs", hash, height, matched.len());
        self.pending_block = Some(PendingBlock {
            location,
            expected: matched.into_iter().collect(),
        });
        false
    }

    /// Route a transaction to its pending block or treat it as mempool.
    /// Returns true when the peer must be dropped.
    async fn process_incoming_tx(&mut self, tx: Transaction) -> bool {
        let txid = tx.txid();

        let block = match &mut self.pending_block {
            Some(pending) if pending.expected.contains(&txid) => {
                pending.expected.remove(&txid);
                Some(pending.location)
            }
            _ => None,
        };

        let matched = self.process_transaction(&tx, block).await;
        if !matched {
            tracing::debug!("Transaction {} matched nothing we watch", txid);
            if self.misbehavior.penalize(Misbehavior::FalseMatch) {
                return true;
            }
        } else {
            self.misbehavior.record_scanned_tx();
        }

        if self.pending_block.as_ref().is_some_and(|p| p.expected.is_empty()) {
            self.finalize_pending_block();
        }
        false
    }

    /// Record operations for a transaction's outputs and inputs. Returns
    /// whether anything matched the watch state.
    async fn process_transaction(&mut self, tx: &Transaction, block: Option<ChainLocation>) -> bool {
        let txid = tx.txid();
        let mut matched = false;

        for (index, output) in tx.output.iter().enumerate() {
            if self.tracker.contains_script(&output.script_pubkey).await {
                matched = true;
                self.tracker
                    .record_operation(Operation {
                        script: output.script_pubkey.clone(),
                        txid,
                        inbound: true,
                        block,
                    })
                    .await;
                self.tracker
                    .watch_outpoint(
                        OutPoint::new(txid, index as u32),
                        output.script_pubkey.clone(),
                    )
                    .await;
            }
        }

        for input in &tx.input {
            if let Some(script) = self.tracker.outpoint_script(&input.previous_output).await {
                matched = true;
                self.tracker
                    .record_operation(Operation {
                        script,
                        txid,
                        inbound: false,
                        block,
                    })
                    .await;
            }
        }

        matched
    }

    /// A block is done only when every transaction its merkleblock committed
    /// to has arrived. A pending block cut short by disconnect, shutdown, or
    /// a superseding block is discarded without moving the cursor, so the
    /// next session re-scans it; dedup absorbs the replay.
    fn finalize_pending_block(&mut self) {
        if let Some(pending) = self.pending_block.take() {
            if pending.expected.is_empty() {
                self.advance_cursor(pending.location);
            } else {
                tracing::warn!(
                    "Discarding block {} with {} undelivered txs",
                    pending.location.hash,
                    pending.expected.len()
                );
            }
        }
    }

    /// The cursor only moves forward within a session. Blocks at or below the
    /// scanned height (re-served after a reconnect or announced on a reorged
    /// branch) are matched for operations but do not move it.
    fn advance_cursor(&mut self, location: ChainLocation) {
        if location.height > self.cursor.height() {
            self.cursor = self.cursor.advance(location);
        }
    }
}
