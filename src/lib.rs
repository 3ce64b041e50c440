//! Bloom-filter SPV client that tracks watched scripts over a single Dash
//! peer connection.
//!
//! The client:
//!
//! - Synchronizes and validates block headers, handling reorganizations
//! - Installs a BIP37 bloom filter covering the watched scripts
//! - Scans filtered blocks and the mempool for matching transactions
//! - Records inbound and outbound operations, deduplicated across rescans
//! - Reconnects with backoff, resuming the scan from a persisted cursor
//!
//! # Quick Start
//!
//! ```no_run
//! use spv_tracker::{ClientConfig, HeaderChain, ReconnectSupervisor, ScanCursor, Tracker};
//! use spv_tracker::network::TcpTransport;
//! use spv_tracker::supervisor::Connector;
//! use dashcore::blockdata::constants::genesis_block;
//! use dashcore::Network;
//! use std::sync::Arc;
//! use tokio::sync::RwLock;
//! use tokio_util::sync::CancellationToken;
//!
//! struct PeerConnector(ClientConfig);
//!
//! impl Connector for PeerConnector {
//!     type Transport = TcpTransport;
//!
//!     fn new_transport(&self) -> TcpTransport {
//!         TcpTransport::new(
//!             self.0.peer_address,
//!             self.0.network,
//!             self.0.connect_timeout,
//!             self.0.user_agent.clone(),
//!         )
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new(Network::Testnet, "127.0.0.1:19999".parse()?);
//!     let genesis = genesis_block(config.network).header;
//!
//!     let chain = Arc::new(RwLock::new(HeaderChain::new(genesis)));
//!     let tracker = Arc::new(Tracker::new());
//!     let cursor = ScanCursor::from_genesis(&genesis);
//!
//!     let supervisor = ReconnectSupervisor::new(
//!         PeerConnector(config.clone()),
//!         config,
//!         chain,
//!         tracker,
//!         None,
//!         cursor,
//!         CancellationToken::new(),
//!     );
//!     supervisor.run().await?;
//!     Ok(())
//! }
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod bloom;
pub mod chain;
pub mod config;
pub mod cursor;
pub mod error;
pub mod logging;
pub mod misbehavior;
pub mod network;
pub mod session;
pub mod storage;
pub mod supervisor;
pub mod tracker;
pub mod types;

// Re-export main types for convenience
pub use bloom::BloomFilterBuilder;
pub use chain::{ChainWork, HeaderChain};
pub use config::ClientConfig;
pub use cursor::ScanCursor;
pub use error::{ChainError, NetworkError, Result, SpvError, StorageError};
pub use logging::init_console_logging;
pub use misbehavior::{Misbehavior, MisbehaviorTracker};
pub use session::{PeerSession, SessionState};
pub use storage::ChainStore;
pub use supervisor::{Connector, ReconnectSupervisor};
pub use tracker::Tracker;
pub use types::{ChainLocation, DisconnectReason, Operation, SessionResult, SpvEvent};
