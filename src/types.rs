//! Core types shared across the SPV tracker.

use dashcore::{BlockHash, ScriptBuf, Txid};

use crate::cursor::ScanCursor;

/// A position on the header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainLocation {
    /// Block hash at this position.
    pub hash: BlockHash,
    /// Height of the block.
    pub height: u32,
}

impl ChainLocation {
    pub fn new(hash: BlockHash, height: u32) -> Self {
        Self {
            hash,
            height,
        }
    }
}

/// An immutable record of a match between a watched script and a transaction.
///
/// Deduplicated by `(script, txid)`: re-scanning the same block after a
/// reconnect never produces a second entry for the same pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// The watched script that matched.
    pub script: ScriptBuf,
    /// Transaction that contained the match.
    pub txid: Txid,
    /// True if the match was on an output (receiving), false if on an input
    /// spending a previously matched output.
    pub inbound: bool,
    /// Containing block, or `None` for an unconfirmed (mempool) transaction.
    pub block: Option<ChainLocation>,
}

impl Operation {
    /// Dedup key for the tracker's operation log.
    pub fn dedup_key(&self) -> (Txid, ScriptBuf) {
        (self.txid, self.script.clone())
    }
}

/// Events emitted to the notification sink (CLI, logger, ...).
#[derive(Debug, Clone)]
pub enum SpvEvent {
    /// A new operation was recorded (emitted exactly once per unique
    /// `(script, txid)` pair).
    NewOperation(Operation),
    /// The active chain tip height changed.
    HeightChanged(u32),
}

/// Why a session reached `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport reported closure or failure.
    TransportFailure(String),
    /// No protocol activity within the configured idle window.
    Timeout,
    /// The decayed misbehavior score crossed the threshold.
    MisbehaviorThresholdExceeded,
    /// Shutdown was requested by the supervisor.
    ShutdownRequested,
}

/// Terminal value handed from a finished session back to the supervisor.
///
/// Carries the resume point by value instead of sharing mutable session
/// state across callbacks.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Scan position after the last fully processed block.
    pub final_cursor: ScanCursor,
    /// Why the session ended.
    pub reason: DisconnectReason,
}
