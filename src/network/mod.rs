//! Single-peer transport abstraction.
//!
//! The session drives a [`PeerTransport`] with semantic requests and consumes
//! [`NetworkEvent`]s; all wire encoding, inventory bookkeeping, and keepalive
//! traffic stays inside the transport implementation.

mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;
use dashcore::bloom::BloomFilter;
use dashcore::network::constants::ServiceFlags;
use dashcore::{BlockHash, Header as BlockHeader, Transaction, Txid};

use crate::error::NetworkResult;

/// Peer details learned during the version handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub start_height: i32,
}

/// Inbound events the session consumes.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A `headers` batch, in peer-declared order.
    Headers(Vec<BlockHeader>),
    /// A merkleblock whose proof verified, with the txids it committed to.
    FilteredBlock {
        header: BlockHeader,
        matched: Vec<Txid>,
    },
    /// A transaction delivered after a filtered block or mempool request.
    Transaction(Transaction),
    /// The peer sent something undecodable or protocol-violating. The
    /// connection survives; the session decides whether to tolerate it.
    Malformed(String),
    /// The peer went away.
    Disconnected,
}

/// A connection to one peer.
///
/// Implementations own the socket (or a test double) and are driven from a
/// single task, so methods take `&mut self` and no internal locking is needed.
#[async_trait]
pub trait PeerTransport: Send {
    /// Establish the connection and complete the version handshake.
    async fn connect(&mut self) -> NetworkResult<PeerInfo>;

    /// Install a bloom filter on the peer. May be called again mid-session to
    /// replace the active filter.
    async fn install_filter(&mut self, filter: &BloomFilter) -> NetworkResult<()>;

    /// Request headers after the most recent locator entry the peer knows.
    async fn request_headers(&mut self, locator: Vec<BlockHash>) -> NetworkResult<()>;

    /// Request filtered blocks after the most recent locator entry the peer
    /// knows. Announced blocks arrive as [`NetworkEvent::FilteredBlock`]s.
    async fn request_filtered_blocks(&mut self, locator: Vec<BlockHash>) -> NetworkResult<()>;

    /// Ask the peer to announce mempool transactions matching the filter.
    async fn request_mempool(&mut self) -> NetworkResult<()>;

    /// Wait for the next inbound event.
    async fn next_event(&mut self) -> NetworkResult<NetworkEvent>;

    /// Tear the connection down.
    async fn disconnect(&mut self);
}
