//! Error types for the SPV tracker.

use std::io;
use thiserror::Error;

/// Main error type for the SPV tracker.
#[derive(Debug, Error)]
pub enum SpvError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("General error: {0}")]
    General(String),
}

/// Header chain errors. All recoverable at the session level: an invalid
/// header counts toward misbehavior, a losing reorg candidate is ignored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Insufficient work: candidate tail does not exceed the active branch")]
    InsufficientWork,
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Message serialization error: {0}")]
    Serialization(#[from] dashcore::consensus::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Storage-related errors. `Corruption` is fatal for that store only;
/// callers fall back to a genesis-rooted state rather than aborting.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Type alias for Result with SpvError.
pub type Result<T> = std::result::Result<T, SpvError>;

/// Type alias for chain operation results.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Type alias for network operation results.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
