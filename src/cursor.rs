//! Resumable scan position.
//!
//! A [`ScanCursor`] is a sparse, most-recent-first list of chain locations,
//! dense for the latest blocks and exponentially thinner further back. The
//! peer uses it as a locator to find a common ancestor to resume from, so it
//! stays useful even when a reorg has discarded the exact blocks it names.

use dashcore::consensus::{Decodable, Encodable};
use dashcore::{BlockHash, Header as BlockHeader};

use crate::error::{StorageError, StorageResult};
use crate::types::ChainLocation;

/// Most recent entries kept without thinning.
const DENSE_RECENT: usize = 10;

/// A compact "where we left off" pointer for the filtered-block scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    /// Locations, most recent first. Never empty.
    locations: Vec<ChainLocation>,
}

impl ScanCursor {
    /// Cursor pointing at genesis: the default starting point for a fresh scan.
    pub fn from_genesis(genesis: &BlockHeader) -> Self {
        Self {
            locations: vec![ChainLocation::new(genesis.block_hash(), 0)],
        }
    }

    /// Cursor from an explicit location list (most recent first).
    ///
    /// # Panics
    ///
    /// Panics when `locations` is empty; a cursor always names at least one
    /// resume point.
    pub fn from_locations(locations: Vec<ChainLocation>) -> Self {
        assert!(!locations.is_empty(), "a scan cursor needs at least one location");
        Self {
            locations,
        }
    }

    /// The locations, most recent first.
    pub fn locations(&self) -> &[ChainLocation] {
        &self.locations
    }

    /// Locator hashes for wire requests, most recent first.
    pub fn to_locations(&self) -> Vec<BlockHash> {
        self.locations.iter().map(|l| l.hash).collect()
    }

    /// Height of the most recently processed block.
    pub fn height(&self) -> u32 {
        self.locations[0].height
    }

    /// New cursor with `location` prepended and the tail thinned.
    ///
    /// The most recent [`DENSE_RECENT`] entries are kept as-is; older entries
    /// are kept only at exponentially growing height gaps, with the oldest
    /// entry always retained as the anchor. This bounds the cursor size
    /// independent of chain length.
    pub fn advance(&self, location: ChainLocation) -> Self {
        let mut merged = Vec::with_capacity(self.locations.len() + 1);
        merged.push(location);
        merged.extend(self.locations.iter().copied());

        let mut thinned: Vec<ChainLocation> = Vec::with_capacity(DENSE_RECENT + 34);
        let mut step = 1u32;
        for (i, entry) in merged.iter().enumerate() {
            let is_anchor = i == merged.len() - 1;
            if thinned.len() < DENSE_RECENT || is_anchor {
                thinned.push(*entry);
                continue;
            }
            let last_kept = thinned.last().expect("dense prefix is non-empty");
            if last_kept.height.saturating_sub(entry.height) >= step {
                thinned.push(*entry);
                step = step.saturating_mul(2);
            }
        }

        Self {
            locations: thinned,
        }
    }

    /// Serialize as a u32-le entry count followed by `(height, hash)` pairs.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.locations.len() * 36);
        bytes.extend_from_slice(&(self.locations.len() as u32).to_le_bytes());
        for location in &self.locations {
            bytes.extend_from_slice(&location.height.to_le_bytes());
            location
                .hash
                .consensus_encode(&mut bytes)
                .expect("writing to a Vec cannot fail");
        }
        bytes
    }

    /// Exact inverse of [`serialize`](Self::serialize). Truncated or oversized
    /// input is corruption.
    pub fn deserialize(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < 4 {
            return Err(StorageError::Corruption("missing cursor entry count".to_string()));
        }
        let count = u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
        if count == 0 {
            return Err(StorageError::Corruption("empty scan cursor".to_string()));
        }
        if bytes.len() != 4 + count * 36 {
            return Err(StorageError::Corruption(format!(
                "cursor length {} does not match {} entries",
                bytes.len(),
                count
            )));
        }

        let mut locations = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            let height = u32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4 bytes"));
            let mut reader = std::io::Cursor::new(&bytes[offset + 4..offset + 36]);
            let hash = BlockHash::consensus_decode(&mut reader)
                .map_err(|e| StorageError::Corruption(format!("bad cursor hash: {}", e)))?;
            locations.push(ChainLocation::new(hash, height));
            offset += 36;
        }

        Ok(Self {
            locations,
        })
    }
}
