//! Validated, persistable header chain.
//!
//! The chain owns one header per height on the active (best-work) branch,
//! contiguous from genesis. Appends validate prev-hash linkage and proof of
//! work; a reorganization atomically swaps the active tail for an alternative
//! tail with strictly greater cumulative work.

use std::collections::HashMap;

use dashcore::consensus::{encode, Decodable, Encodable};
use dashcore::{BlockHash, Header as BlockHeader};

use crate::chain::ChainWork;
use crate::error::{ChainError, ChainResult, StorageError, StorageResult};
use crate::types::ChainLocation;

/// Number of most-recent locator entries kept dense before exponential spacing.
pub(crate) const LOCATOR_DENSE_ENTRIES: usize = 10;

/// Hard cap on locator length.
pub(crate) const LOCATOR_MAX_ENTRIES: usize = 32;

/// A header on the active branch together with its derived attributes.
#[derive(Debug, Clone)]
struct StoredHeader {
    header: BlockHeader,
    hash: BlockHash,
    /// Cumulative work from genesis through this header.
    work: ChainWork,
}

/// Append/reorg-aware sequence of validated block headers.
#[derive(Debug, Clone)]
pub struct HeaderChain {
    /// Active branch, indexed by height.
    headers: Vec<StoredHeader>,
    /// Hash -> height lookup for the active branch.
    index: HashMap<BlockHash, u32>,
}

impl HeaderChain {
    /// Create a chain rooted at the given genesis header.
    ///
    /// Genesis is the trust anchor and is not proof-of-work checked.
    pub fn new(genesis: BlockHeader) -> Self {
        let hash = genesis.block_hash();
        let work = ChainWork::from_header(&genesis);
        let mut index = HashMap::new();
        index.insert(hash, 0);
        Self {
            headers: vec![StoredHeader {
                header: genesis,
                hash,
                work,
            }],
            index,
        }
    }

    /// Height of the active tip (genesis is height 0).
    pub fn height(&self) -> u32 {
        (self.headers.len() - 1) as u32
    }

    /// Location of the active tip.
    pub fn tip(&self) -> ChainLocation {
        let last = self.headers.last().expect("chain is never empty");
        ChainLocation::new(last.hash, self.height())
    }

    /// Header at the active tip.
    pub fn tip_header(&self) -> &BlockHeader {
        &self.headers.last().expect("chain is never empty").header
    }

    /// Cumulative work of the active branch.
    pub fn tip_work(&self) -> ChainWork {
        self.headers.last().expect("chain is never empty").work
    }

    /// Cumulative work through a height on the active branch.
    pub fn work_at(&self, height: u32) -> Option<ChainWork> {
        self.headers.get(height as usize).map(|s| s.work)
    }

    /// Header at a height on the active branch.
    pub fn header_at(&self, height: u32) -> Option<&BlockHeader> {
        self.headers.get(height as usize).map(|s| &s.header)
    }

    /// Whether a hash is on the active branch.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.index.contains_key(hash)
    }

    /// Height of a hash on the active branch.
    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.index.get(hash).copied()
    }

    /// Validate and append a header extending the active tip.
    ///
    /// Returns the new height on success. A header already on the active
    /// branch is a no-op returning its existing height. A header whose
    /// prev-hash is not the tip, or whose hash does not meet its own target,
    /// fails with [`ChainError::InvalidHeader`].
    pub fn try_append(&mut self, header: BlockHeader) -> ChainResult<u32> {
        let hash = header.block_hash();

        if let Some(height) = self.index.get(&hash) {
            return Ok(*height);
        }

        let tip = self.headers.last().expect("chain is never empty");
        if header.prev_blockhash != tip.hash {
            return Err(ChainError::InvalidHeader(format!(
                "header {} does not connect to tip {}",
                hash, tip.hash
            )));
        }

        if !header.target().is_met_by(hash) {
            return Err(ChainError::InvalidHeader(format!(
                "header {} does not meet its proof-of-work target",
                hash
            )));
        }

        let work = tip.work.add_header(&header);
        let height = self.headers.len() as u32;
        self.headers.push(StoredHeader {
            header,
            hash,
            work,
        });
        self.index.insert(hash, height);
        Ok(height)
    }

    /// Atomically replace the active tail with an alternative tail.
    ///
    /// The first header of `alt_tail` must attach to a header on the active
    /// branch (the tip included, which makes this a plain extension), every
    /// header must link and meet its target, and the cumulative work of the
    /// resulting branch must strictly exceed the current active branch,
    /// otherwise [`ChainError::InsufficientWork`]. Nothing is mutated on
    /// failure.
    pub fn reorganize_to(&mut self, alt_tail: &[BlockHeader]) -> ChainResult<u32> {
        let first = alt_tail
            .first()
            .ok_or_else(|| ChainError::InvalidHeader("empty reorg tail".to_string()))?;

        let fork_height = *self.index.get(&first.prev_blockhash).ok_or_else(|| {
            ChainError::InvalidHeader(format!(
                "reorg tail does not attach to a known header (parent {})",
                first.prev_blockhash
            ))
        })?;

        // Validate the candidate tail before touching the active branch.
        let mut candidate_work = self.headers[fork_height as usize].work;
        let mut prev_hash = self.headers[fork_height as usize].hash;
        for header in alt_tail {
            let hash = header.block_hash();
            if header.prev_blockhash != prev_hash {
                return Err(ChainError::InvalidHeader(format!(
                    "reorg header {} does not connect to {}",
                    hash, prev_hash
                )));
            }
            if !header.target().is_met_by(hash) {
                return Err(ChainError::InvalidHeader(format!(
                    "reorg header {} does not meet its proof-of-work target",
                    hash
                )));
            }
            candidate_work = candidate_work.add_header(header);
            prev_hash = hash;
        }

        if candidate_work <= self.tip_work() {
            return Err(ChainError::InsufficientWork);
        }

        // Swap the tail: drop everything above the fork point, then append.
        for stale in self.headers.drain(fork_height as usize + 1..) {
            self.index.remove(&stale.hash);
        }
        let mut work = self.headers[fork_height as usize].work;
        for header in alt_tail {
            let hash = header.block_hash();
            work = work.add_header(header);
            let height = self.headers.len() as u32;
            self.headers.push(StoredHeader {
                header: *header,
                hash,
                work,
            });
            self.index.insert(hash, height);
        }

        Ok(self.height())
    }

    /// Build a locator-style location list for resuming from a height.
    ///
    /// Dense for the most recent entries, then exponentially sparser going
    /// back, always ending at genesis. Tolerates `height` above the tip by
    /// clamping.
    pub fn locator_from(&self, height: u32) -> Vec<ChainLocation> {
        let mut locator = Vec::new();
        let mut current = height.min(self.height());
        let mut step = 1u32;

        loop {
            let stored = &self.headers[current as usize];
            locator.push(ChainLocation::new(stored.hash, current));

            if current == 0 {
                break;
            }
            if locator.len() >= LOCATOR_DENSE_ENTRIES {
                step = step.saturating_mul(2);
            }
            if locator.len() >= LOCATOR_MAX_ENTRIES {
                let genesis = &self.headers[0];
                locator.push(ChainLocation::new(genesis.hash, 0));
                break;
            }
            current = current.saturating_sub(step);
        }

        locator
    }

    /// Serialize the full header sequence, genesis to tip.
    ///
    /// Layout: u32-le header count followed by consensus-encoded headers.
    /// The explicit count lets a truncated write be detected as corruption
    /// instead of silently shortening the chain on reload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.headers.len() * 80);
        bytes.extend_from_slice(&(self.headers.len() as u32).to_le_bytes());
        for stored in &self.headers {
            stored
                .header
                .consensus_encode(&mut bytes)
                .expect("writing to a Vec cannot fail");
        }
        bytes
    }

    /// Reconstruct a chain from persisted bytes, re-validating linkage and
    /// proof of work and recomputing cumulative work.
    pub fn deserialize(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < 4 {
            return Err(StorageError::Corruption("missing header count".to_string()));
        }
        let count = u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
        if count == 0 {
            return Err(StorageError::Corruption("persisted chain has no genesis".to_string()));
        }

        let mut reader = std::io::Cursor::new(&bytes[4..]);
        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            match BlockHeader::consensus_decode(&mut reader) {
                Ok(header) => headers.push(header),
                Err(encode::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Err(StorageError::Corruption(format!(
                        "persisted chain truncated at header {} of {}",
                        i, count
                    )));
                }
                Err(e) => {
                    return Err(StorageError::Corruption(format!(
                        "failed to decode header {}: {}",
                        i, e
                    )));
                }
            }
        }
        if reader.position() as usize != bytes.len() - 4 {
            return Err(StorageError::Corruption(
                "trailing bytes after persisted chain".to_string(),
            ));
        }

        let mut iter = headers.into_iter();
        let genesis = iter.next().expect("count checked above");
        let mut chain = Self::new(genesis);
        for header in iter {
            chain.try_append(header).map_err(|e| {
                StorageError::Corruption(format!("persisted chain invalid: {}", e))
            })?;
        }
        Ok(chain)
    }
}
