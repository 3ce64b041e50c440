//! Bloom filter construction from the tracker's watch state.

use dashcore::bloom::{BloomFilter, BloomFlags};
use dashcore::{OutPoint, Script, ScriptBuf};

use crate::error::SpvError;

/// Minimum element count used when sizing the filter, so a near-empty watch
/// set still yields a usefully sized filter.
const MIN_ELEMENTS: u32 = 100;

/// Builds a BIP37 filter from watched scripts and outpoints.
///
/// Deterministic for a given `(scripts, rate, tweak)`; callers pick a fresh
/// random tweak per install so the filter is not a stable fingerprint of the
/// watch set across sessions.
pub struct BloomFilterBuilder {
    false_positive_rate: f64,
    tweak: u32,
    scripts: Vec<ScriptBuf>,
    outpoints: Vec<OutPoint>,
}

impl BloomFilterBuilder {
    /// Create a builder with a fresh random tweak.
    pub fn new(false_positive_rate: f64) -> Self {
        Self {
            false_positive_rate,
            tweak: rand::random::<u32>(),
            scripts: Vec::new(),
            outpoints: Vec::new(),
        }
    }

    /// Set an explicit tweak value.
    pub fn tweak(mut self, tweak: u32) -> Self {
        self.tweak = tweak;
        self
    }

    /// Add watched scripts.
    pub fn add_scripts(mut self, scripts: impl IntoIterator<Item = ScriptBuf>) -> Self {
        self.scripts.extend(scripts);
        self
    }

    /// Add watched outpoints (spend detection for matched outputs).
    pub fn add_outpoints(mut self, outpoints: impl IntoIterator<Item = OutPoint>) -> Self {
        self.outpoints.extend(outpoints);
        self
    }

    /// Build the bloom filter.
    pub fn build(self) -> Result<BloomFilter, SpvError> {
        // Each P2PKH script may contribute two patterns.
        let actual_elements = (self.scripts.len() * 2 + self.outpoints.len()) as u32;
        let elements = std::cmp::max(MIN_ELEMENTS, actual_elements);

        let mut filter =
            BloomFilter::new(elements, self.false_positive_rate, self.tweak, BloomFlags::All)
                .map_err(|e| SpvError::General(format!("Failed to create bloom filter: {:?}", e)))?;

        for script in &self.scripts {
            filter.insert(script.as_bytes());

            // For P2PKH, also add the pubkey hash so spends (which push the
            // pubkey into script_sig) match as well as payments.
            if let Some(hash) = extract_pubkey_hash(script) {
                filter.insert(&hash);
            }
        }

        for outpoint in &self.outpoints {
            filter.insert(&outpoint_to_bytes(outpoint));
        }

        Ok(filter)
    }
}

/// Extract pubkey hash from a P2PKH script.
pub fn extract_pubkey_hash(script: &Script) -> Option<Vec<u8>> {
    let bytes = script.as_bytes();
    // P2PKH: OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
    if bytes.len() == 25
        && bytes[0] == 0x76  // OP_DUP
        && bytes[1] == 0xa9  // OP_HASH160
        && bytes[2] == 0x14  // Push 20 bytes
        && bytes[23] == 0x88 // OP_EQUALVERIFY
        && bytes[24] == 0xac // OP_CHECKSIG
    {
        Some(bytes[3..23].to_vec())
    } else {
        None
    }
}

/// Convert an outpoint to the byte pattern peers match against the filter.
pub fn outpoint_to_bytes(outpoint: &OutPoint) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(36);
    bytes.extend_from_slice(&outpoint.txid[..]);
    bytes.extend_from_slice(&outpoint.vout.to_le_bytes());
    bytes
}
