//! Watched scripts and the append-only operation log.

use std::collections::{HashMap, HashSet};

use dashcore::{OutPoint, Script, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{Result, SpvError};
use crate::types::{Operation, SpvEvent};

/// Persisted form of the watch list: hex-encoded script bytes.
#[derive(Serialize, Deserialize)]
struct WatchList {
    scripts: Vec<String>,
}

#[derive(Default)]
struct TrackerState {
    /// Scripts being watched. Set semantics: duplicates are no-ops.
    scripts: HashSet<ScriptBuf>,
    /// Ordered log of match events.
    operations: Vec<Operation>,
    /// Dedup index over the log.
    seen: HashSet<(Txid, ScriptBuf)>,
    /// Outpoints of matched outputs, for spend detection on later inputs.
    watched_outpoints: HashMap<OutPoint, ScriptBuf>,
    /// Set when the script set changed since the last filter build.
    filter_stale: bool,
}

/// Owns the watched script set and the operation log.
///
/// Scripts may be added while a scan is running; the addition takes effect at
/// the next filter refresh, not retroactively for already-downloaded blocks.
/// State lives behind an async lock because filter rebuilds read the script
/// set from the session loop while user-facing callers mutate it.
pub struct Tracker {
    state: RwLock<TrackerState>,
    event_tx: mpsc::UnboundedSender<SpvEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SpvEvent>>>,
}

impl Tracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            state: RwLock::new(TrackerState::default()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver for external consumption.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SpvEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Add a script to the watch set. Returns true if it was new, in which
    /// case the bloom filter is marked stale for the next refresh.
    pub async fn add_script(&self, script: ScriptBuf) -> bool {
        let mut state = self.state.write().await;
        let is_new = state.scripts.insert(script);
        if is_new {
            state.filter_stale = true;
            tracing::info!("Added watched script ({} total)", state.scripts.len());
        }
        is_new
    }

    /// Whether a script is being watched.
    pub async fn contains_script(&self, script: &Script) -> bool {
        self.state.read().await.scripts.contains(script)
    }

    /// Snapshot of the watched scripts.
    pub async fn scripts(&self) -> Vec<ScriptBuf> {
        self.state.read().await.scripts.iter().cloned().collect()
    }

    /// Snapshot of the watched outpoints.
    pub async fn watched_outpoints(&self) -> Vec<OutPoint> {
        self.state.read().await.watched_outpoints.keys().copied().collect()
    }

    /// Record a match event. Appends iff `(script, txid)` has not been seen,
    /// emitting a [`SpvEvent::NewOperation`] exactly once for new entries.
    /// Returns whether the operation was newly recorded.
    pub async fn record_operation(&self, op: Operation) -> bool {
        let mut state = self.state.write().await;
        if !state.seen.insert(op.dedup_key()) {
            tracing::debug!("Duplicate operation for tx {} ignored", op.txid);
            return false;
        }
        state.operations.push(op.clone());
        drop(state);

        tracing::info!(
            "Recorded {} operation for tx {} ({})",
            if op.inbound { "inbound" } else { "outbound" },
            op.txid,
            match &op.block {
                Some(location) => format!("block {}", location.height),
                None => "unconfirmed".to_string(),
            }
        );
        let _ = self.event_tx.send(SpvEvent::NewOperation(op));
        true
    }

    /// Remember a matched output's outpoint so a later input spending it can
    /// be recorded as an outbound operation.
    pub async fn watch_outpoint(&self, outpoint: OutPoint, script: ScriptBuf) {
        self.state.write().await.watched_outpoints.insert(outpoint, script);
    }

    /// Script associated with a watched outpoint, if any.
    pub async fn outpoint_script(&self, outpoint: &OutPoint) -> Option<ScriptBuf> {
        self.state.read().await.watched_outpoints.get(outpoint).cloned()
    }

    /// Snapshot of the operation log, in recording order.
    pub async fn operations(&self) -> Vec<Operation> {
        self.state.read().await.operations.clone()
    }

    /// Clear and return the filter-stale flag.
    pub async fn take_filter_stale(&self) -> bool {
        let mut state = self.state.write().await;
        std::mem::take(&mut state.filter_stale)
    }

    /// Emit a tip height change to the notification sink.
    pub fn notify_height(&self, height: u32) {
        let _ = self.event_tx.send(SpvEvent::HeightChanged(height));
    }

    /// Serialize the watch list for persistence.
    pub async fn serialize_scripts(&self) -> Result<Vec<u8>> {
        let state = self.state.read().await;
        let list = WatchList {
            scripts: state.scripts.iter().map(|s| hex::encode(s.as_bytes())).collect(),
        };
        serde_json::to_vec(&list)
            .map_err(|e| SpvError::Config(format!("Failed to serialize watch list: {}", e)))
    }

    /// Merge a persisted watch list into the current set.
    pub async fn load_scripts(&self, bytes: &[u8]) -> Result<usize> {
        let list: WatchList = serde_json::from_slice(bytes)
            .map_err(|e| SpvError::Config(format!("Failed to deserialize watch list: {}", e)))?;

        let mut loaded = 0;
        let mut state = self.state.write().await;
        for entry in list.scripts {
            let raw = hex::decode(&entry)
                .map_err(|e| SpvError::Config(format!("Invalid script hex: {}", e)))?;
            if state.scripts.insert(ScriptBuf::from(raw)) {
                loaded += 1;
            }
        }
        if loaded > 0 {
            state.filter_stale = true;
        }
        tracing::info!("Loaded {} watched scripts from storage", loaded);
        Ok(loaded)
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}
