//! End-to-end session behavior against a scripted peer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashcore::hashes::Hash;
use dashcore::network::constants::ServiceFlags;
use dashcore::{BlockHash, CompactTarget, Header as BlockHeader, Transaction, Txid};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use spv_tracker::error::NetworkResult;
use spv_tracker::network::{NetworkEvent, PeerInfo, PeerTransport};
use spv_tracker::test_utils::{p2pkh_script, test_genesis, test_header, test_tx, EASY_BITS, HARDER_BITS};
use spv_tracker::{
    ClientConfig, DisconnectReason, HeaderChain, PeerSession, ScanCursor, Tracker,
};

/// A filtered block the mock peer will serve.
#[derive(Clone)]
struct ScriptedBlock {
    header: BlockHeader,
    matched: Vec<Txid>,
    txs: Vec<Transaction>,
}

impl ScriptedBlock {
    fn empty(header: BlockHeader) -> Self {
        Self {
            header,
            matched: Vec::new(),
            txs: Vec::new(),
        }
    }

    fn with_txs(header: BlockHeader, txs: Vec<Transaction>) -> Self {
        Self {
            header,
            matched: txs.iter().map(|tx| tx.txid()).collect(),
            txs,
        }
    }
}

#[derive(Default)]
struct MockPeerState {
    /// One batch served per `request_headers`; empty batch once exhausted.
    header_batches: VecDeque<Vec<BlockHeader>>,
    /// One set of blocks served per `request_filtered_blocks`.
    block_batches: VecDeque<Vec<ScriptedBlock>>,
    /// Transactions served on `request_mempool`.
    mempool: Vec<Transaction>,
    /// Headers pushed unsolicited after the first filtered-block batch, as a
    /// peer announcing a reorg mid-scan would.
    post_scan_headers: Option<Vec<BlockHeader>>,
    /// Never answer getheaders, like a stalled peer.
    ignore_header_requests: bool,
    /// Raw events injected ahead of anything scripted.
    preload: VecDeque<NetworkEvent>,
    /// When the script runs dry: hang (true) or close the connection (false).
    pend_when_idle: bool,
    queue: VecDeque<NetworkEvent>,
    filters_installed: usize,
    header_locators: Vec<Vec<BlockHash>>,
    scan_locators: Vec<Vec<BlockHash>>,
}

#[derive(Clone)]
struct MockTransport {
    state: Arc<Mutex<MockPeerState>>,
}

impl MockTransport {
    fn new(state: MockPeerState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn filters_installed(&self) -> usize {
        self.state.lock().unwrap().filters_installed
    }

    fn header_locators(&self) -> Vec<Vec<BlockHash>> {
        self.state.lock().unwrap().header_locators.clone()
    }

    fn scan_locators(&self) -> Vec<Vec<BlockHash>> {
        self.state.lock().unwrap().scan_locators.clone()
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn connect(&mut self) -> NetworkResult<PeerInfo> {
        let mut state = self.state.lock().unwrap();
        let preload: Vec<_> = state.preload.drain(..).collect();
        state.queue.extend(preload);
        Ok(PeerInfo {
            version: 70230,
            services: ServiceFlags::NONE,
            user_agent: "/mock:0.1/".to_string(),
            start_height: 0,
        })
    }

    async fn install_filter(&mut self, _filter: &dashcore::bloom::BloomFilter) -> NetworkResult<()> {
        self.state.lock().unwrap().filters_installed += 1;
        Ok(())
    }

    async fn request_headers(&mut self, locator: Vec<BlockHash>) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.header_locators.push(locator);
        if !state.ignore_header_requests {
            let batch = state.header_batches.pop_front().unwrap_or_default();
            state.queue.push_back(NetworkEvent::Headers(batch));
        }
        Ok(())
    }

    async fn request_filtered_blocks(&mut self, locator: Vec<BlockHash>) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        state.scan_locators.push(locator);
        if let Some(blocks) = state.block_batches.pop_front() {
            for block in blocks {
                state.queue.push_back(NetworkEvent::FilteredBlock {
                    header: block.header,
                    matched: block.matched,
                });
                for tx in block.txs {
                    state.queue.push_back(NetworkEvent::Transaction(tx));
                }
            }
        }
        if state.scan_locators.len() == 1 {
            if let Some(headers) = state.post_scan_headers.take() {
                state.queue.push_back(NetworkEvent::Headers(headers));
            }
        }
        Ok(())
    }

    async fn request_mempool(&mut self) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        let mempool = std::mem::take(&mut state.mempool);
        for tx in mempool {
            state.queue.push_back(NetworkEvent::Transaction(tx));
        }
        Ok(())
    }

    async fn next_event(&mut self) -> NetworkResult<NetworkEvent> {
        let (event, pend) = {
            let mut state = self.state.lock().unwrap();
            (state.queue.pop_front(), state.pend_when_idle)
        };
        match event {
            Some(event) => Ok(event),
            None if pend => std::future::pending().await,
            None => Ok(NetworkEvent::Disconnected),
        }
    }

    async fn disconnect(&mut self) {}
}

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.message_timeout = Duration::from_millis(500);
    config.filter_refresh_interval = Duration::from_secs(3600);
    config
}

/// Headers chained on top of `prev` with the given bits, heights ascending.
fn header_run(prev: BlockHash, count: usize, seed_base: u32, bits: u32) -> Vec<BlockHeader> {
    let mut headers = Vec::with_capacity(count);
    let mut prev = prev;
    for i in 0..count {
        let header = test_header(prev, seed_base + i as u32, bits);
        prev = header.block_hash();
        headers.push(header);
    }
    headers
}

/// A header whose proof of work cannot pass: difficulty-1 target with a
/// fabricated nonce.
fn bogus_header(prev: BlockHash) -> BlockHeader {
    BlockHeader {
        version: dashcore::block::Version::from_consensus(1),
        prev_blockhash: prev,
        merkle_root: dashcore::TxMerkleNode::all_zeros(),
        time: 1_700_000_000,
        bits: CompactTarget::from_consensus(0x1d00ffff),
        nonce: 0,
    }
}

struct Harness {
    chain: Arc<RwLock<HeaderChain>>,
    tracker: Arc<Tracker>,
    cursor: ScanCursor,
    shutdown: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        let genesis = test_genesis();
        Self {
            chain: Arc::new(RwLock::new(HeaderChain::new(genesis))),
            tracker: Arc::new(Tracker::new()),
            cursor: ScanCursor::from_genesis(&genesis),
            shutdown: CancellationToken::new(),
        }
    }

    fn session(&self, transport: MockTransport, config: ClientConfig) -> PeerSession<MockTransport> {
        PeerSession::new(
            transport,
            config,
            Arc::clone(&self.chain),
            Arc::clone(&self.tracker),
            self.cursor.clone(),
            self.shutdown.clone(),
        )
    }
}

#[tokio::test]
async fn happy_path_syncs_scans_and_records_operations() {
    let harness = Harness::new();
    let script = p2pkh_script(1);
    harness.tracker.add_script(script.clone()).await;

    let genesis = test_genesis();
    let headers = header_run(genesis.block_hash(), 5, 1, EASY_BITS);
    let payment = test_tx(&[script.clone()], &[]);

    let blocks: Vec<ScriptedBlock> = headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            if i == 2 {
                ScriptedBlock::with_txs(*header, vec![payment.clone()])
            } else {
                ScriptedBlock::empty(*header)
            }
        })
        .collect();

    let transport = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![headers.clone()]),
        block_batches: VecDeque::from(vec![blocks]),
        ..Default::default()
    });

    let result = harness.session(transport.clone(), test_config()).run().await;

    assert_eq!(
        result.reason,
        DisconnectReason::TransportFailure("peer closed connection".to_string())
    );
    assert_eq!(result.final_cursor.height(), 5);
    assert_eq!(harness.chain.read().await.height(), 5);

    let ops = harness.tracker.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].script, script);
    assert_eq!(ops[0].txid, payment.txid());
    assert!(ops[0].inbound);
    assert_eq!(ops[0].block.map(|l| l.height), Some(3));

    assert_eq!(transport.filters_installed(), 1);
    // First header request names the current tip.
    assert_eq!(transport.header_locators()[0][0], genesis.block_hash());
    // The scan resumed from the genesis cursor.
    assert_eq!(transport.scan_locators()[0][0], genesis.block_hash());
}

#[tokio::test]
async fn spend_of_matched_output_is_recorded_outbound() {
    let harness = Harness::new();
    let script = p2pkh_script(2);
    harness.tracker.add_script(script.clone()).await;

    let genesis = test_genesis();
    let headers = header_run(genesis.block_hash(), 2, 1, EASY_BITS);
    let payment = test_tx(&[script.clone()], &[]);
    let spend = test_tx(
        &[p2pkh_script(9)],
        &[dashcore::OutPoint::new(payment.txid(), 0)],
    );

    let blocks = vec![
        ScriptedBlock::with_txs(headers[0], vec![payment.clone()]),
        ScriptedBlock::with_txs(headers[1], vec![spend.clone()]),
    ];

    let transport = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![headers]),
        block_batches: VecDeque::from(vec![blocks]),
        ..Default::default()
    });

    let result = harness.session(transport, test_config()).run().await;
    assert_eq!(result.final_cursor.height(), 2);

    let ops = harness.tracker.operations().await;
    assert_eq!(ops.len(), 2);
    assert!(ops[0].inbound);
    assert!(!ops[1].inbound);
    assert_eq!(ops[1].txid, spend.txid());
    assert_eq!(ops[1].script, script);
    assert_eq!(ops[1].block.map(|l| l.height), Some(2));
}

#[tokio::test]
async fn repeated_invalid_headers_cross_the_misbehavior_threshold() {
    let harness = Harness::new();
    harness.tracker.add_script(p2pkh_script(3)).await;

    let genesis = test_genesis();
    let bad = vec![bogus_header(genesis.block_hash())];

    let transport = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![bad.clone(), bad]),
        ..Default::default()
    });

    let result = harness.session(transport, test_config()).run().await;

    assert_eq!(result.reason, DisconnectReason::MisbehaviorThresholdExceeded);
    assert_eq!(harness.chain.read().await.height(), 0);
    assert_eq!(result.final_cursor.height(), 0);
}

#[tokio::test]
async fn silent_peer_times_out_during_header_sync() {
    let harness = Harness::new();
    harness.tracker.add_script(p2pkh_script(4)).await;

    let transport = MockTransport::new(MockPeerState {
        pend_when_idle: true,
        ignore_header_requests: true,
        ..Default::default()
    });

    let result = harness.session(transport, test_config()).run().await;
    assert_eq!(result.reason, DisconnectReason::Timeout);
}

#[tokio::test]
async fn reorg_mid_scan_defers_the_rescan_to_the_next_session() {
    let harness = Harness::new();
    let script = p2pkh_script(5);
    harness.tracker.add_script(script.clone()).await;

    let genesis = test_genesis();
    let old_branch = header_run(genesis.block_hash(), 3, 1, EASY_BITS);
    // Two harder headers out-work three easy ones.
    let new_branch = header_run(genesis.block_hash(), 2, 100, HARDER_BITS);
    let payment = test_tx(&[script.clone()], &[]);

    let old_blocks = vec![
        ScriptedBlock::with_txs(old_branch[0], vec![payment.clone()]),
        ScriptedBlock::empty(old_branch[1]),
        ScriptedBlock::empty(old_branch[2]),
    ];

    let transport = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![old_branch.clone()]),
        block_batches: VecDeque::from(vec![old_blocks]),
        post_scan_headers: Some(new_branch.clone()),
        ..Default::default()
    });

    let result = harness.session(transport.clone(), test_config()).run().await;

    // The chain switched branches.
    let chain = harness.chain.read().await;
    assert_eq!(chain.height(), 2);
    assert_eq!(chain.tip().hash, new_branch[1].block_hash());
    drop(chain);

    assert_eq!(harness.tracker.operations().await.len(), 1);

    // No mid-session rescan: a single filtered-block request, and the cursor
    // is never rewound onto the shorter branch.
    assert_eq!(transport.scan_locators().len(), 1);
    assert_eq!(result.final_cursor.height(), 3);
}

#[tokio::test]
async fn undelivered_matched_transactions_do_not_advance_the_cursor() {
    let harness = Harness::new();
    let script = p2pkh_script(10);
    harness.tracker.add_script(script.clone()).await;

    let genesis = test_genesis();
    let headers = header_run(genesis.block_hash(), 1, 1, EASY_BITS);
    let payment = test_tx(&[script.clone()], &[]);

    // The merkleblock commits to the payment but the peer drops the
    // connection before delivering it.
    let cut_short = ScriptedBlock {
        header: headers[0],
        matched: vec![payment.txid()],
        txs: Vec::new(),
    };
    let first = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![headers.clone()]),
        block_batches: VecDeque::from(vec![vec![cut_short]]),
        ..Default::default()
    });
    let result = harness.session(first, test_config()).run().await;

    // The block does not count as scanned, so the match is not lost.
    assert_eq!(result.final_cursor.height(), 0);
    assert!(harness.tracker.operations().await.is_empty());

    // The next session re-scans the block and picks the match up.
    let second = MockTransport::new(MockPeerState {
        block_batches: VecDeque::from(vec![vec![ScriptedBlock::with_txs(
            headers[0],
            vec![payment.clone()],
        )]]),
        ..Default::default()
    });
    let harness2 = Harness {
        chain: Arc::clone(&harness.chain),
        tracker: Arc::clone(&harness.tracker),
        cursor: result.final_cursor,
        shutdown: CancellationToken::new(),
    };
    let result2 = harness2.session(second, test_config()).run().await;

    assert_eq!(result2.final_cursor.height(), 1);
    let ops = harness.tracker.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].txid, payment.txid());
    assert_eq!(ops[0].block.map(|l| l.height), Some(1));
}

#[tokio::test]
async fn a_batch_with_one_invalid_header_is_discarded_whole() {
    let harness = Harness::new();
    harness.tracker.add_script(p2pkh_script(13)).await;

    let genesis = test_genesis();
    let good = test_header(genesis.block_hash(), 1, EASY_BITS);
    let batch = vec![good, bogus_header(good.block_hash())];

    let transport = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![batch]),
        ..Default::default()
    });

    let result = harness.session(transport, test_config()).run().await;

    // The valid prefix is not retained.
    assert_eq!(harness.chain.read().await.height(), 0);
    assert_eq!(
        result.reason,
        DisconnectReason::TransportFailure("peer closed connection".to_string())
    );
}

#[tokio::test]
async fn resumed_session_does_not_duplicate_operations() {
    let harness = Harness::new();
    let script = p2pkh_script(6);
    harness.tracker.add_script(script.clone()).await;

    let genesis = test_genesis();
    let headers = header_run(genesis.block_hash(), 2, 1, EASY_BITS);
    let payment = test_tx(&[script.clone()], &[]);
    let blocks = vec![
        ScriptedBlock::with_txs(headers[0], vec![payment.clone()]),
        ScriptedBlock::empty(headers[1]),
    ];

    let first = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![headers.clone()]),
        block_batches: VecDeque::from(vec![blocks.clone()]),
        ..Default::default()
    });
    let result = harness.session(first, test_config()).run().await;
    assert_eq!(result.final_cursor.height(), 2);
    assert_eq!(harness.tracker.operations().await.len(), 1);

    // Second session resumes from the returned cursor; the peer ignores the
    // locator and re-serves everything.
    let second = MockTransport::new(MockPeerState {
        block_batches: VecDeque::from(vec![blocks]),
        ..Default::default()
    });
    let harness2 = Harness {
        chain: Arc::clone(&harness.chain),
        tracker: Arc::clone(&harness.tracker),
        cursor: result.final_cursor.clone(),
        shutdown: CancellationToken::new(),
    };
    let result2 = harness2.session(second.clone(), test_config()).run().await;

    // Cursor still points past the rescanned blocks and no duplicates appear.
    assert_eq!(result2.final_cursor.height(), 2);
    assert_eq!(harness.tracker.operations().await.len(), 1);
    // The resume locator leads with the last scanned block.
    assert_eq!(second.scan_locators()[0][0], headers[1].block_hash());
}

#[tokio::test]
async fn mempool_matches_are_recorded_unconfirmed() {
    let harness = Harness::new();
    let script = p2pkh_script(7);
    harness.tracker.add_script(script.clone()).await;

    let payment = test_tx(&[script.clone()], &[]);
    let transport = MockTransport::new(MockPeerState {
        mempool: vec![payment.clone()],
        ..Default::default()
    });

    harness.session(transport, test_config()).run().await;

    let ops = harness.tracker.operations().await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].txid, payment.txid());
    assert!(ops[0].inbound);
    assert_eq!(ops[0].block, None);
}

#[tokio::test]
async fn flood_of_false_positives_disconnects_the_peer() {
    let harness = Harness::new();
    harness.tracker.add_script(p2pkh_script(8)).await;

    // Twenty mempool transactions matching nothing we watch.
    let junk: Vec<Transaction> = (10u8..30).map(|seed| test_tx(&[p2pkh_script(seed)], &[])).collect();
    let transport = MockTransport::new(MockPeerState {
        mempool: junk,
        pend_when_idle: true,
        ..Default::default()
    });

    let result = harness.session(transport, test_config()).run().await;
    assert_eq!(result.reason, DisconnectReason::MisbehaviorThresholdExceeded);
    assert!(harness.tracker.operations().await.is_empty());
}

#[tokio::test]
async fn shutdown_request_ends_the_session_cleanly() {
    let harness = Harness::new();
    harness.tracker.add_script(p2pkh_script(11)).await;

    let genesis = test_genesis();
    let headers = header_run(genesis.block_hash(), 1, 1, EASY_BITS);
    let transport = MockTransport::new(MockPeerState {
        header_batches: VecDeque::from(vec![headers]),
        pend_when_idle: true,
        ..Default::default()
    });

    let shutdown = harness.shutdown.clone();
    let session = harness.session(transport, test_config());
    let handle = tokio::spawn(session.run());

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    let result = handle.await.unwrap();
    assert_eq!(result.reason, DisconnectReason::ShutdownRequested);
}

#[tokio::test]
async fn malformed_messages_accumulate_misbehavior() {
    let harness = Harness::new();
    harness.tracker.add_script(p2pkh_script(12)).await;

    // Ten malformed frames at weight 10 each reach the threshold of 100.
    let preload: VecDeque<NetworkEvent> = (0..10)
        .map(|i| NetworkEvent::Malformed(format!("garbage frame {}", i)))
        .collect();
    let transport = MockTransport::new(MockPeerState {
        preload,
        pend_when_idle: true,
        ..Default::default()
    });

    let result = harness.session(transport, test_config()).run().await;
    assert_eq!(result.reason, DisconnectReason::MisbehaviorThresholdExceeded);
}
