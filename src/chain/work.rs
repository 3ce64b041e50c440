//! Cumulative proof-of-work arithmetic.
//!
//! Work values are 256-bit unsigned integers kept as big-endian byte arrays,
//! which is enough for addition and ordering without a bignum dependency.

use dashcore::{Header as BlockHeader, Target};
use std::cmp::Ordering;
use std::ops::Add;

/// Cumulative chain work as a 256-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainWork {
    /// The work value in big-endian byte order.
    work: [u8; 32],
}

impl ChainWork {
    /// Zero work.
    pub fn zero() -> Self {
        Self {
            work: [0u8; 32],
        }
    }

    /// Work contributed by a single header.
    pub fn from_header(header: &BlockHeader) -> Self {
        Self::from_target(header.target())
    }

    /// Work for a target: 2^256 / (target + 1).
    pub fn from_target(target: Target) -> Self {
        Self {
            work: target.to_work().to_be_bytes(),
        }
    }

    /// Add the work of a header to this cumulative total.
    pub fn add_header(self, header: &BlockHeader) -> Self {
        self.combine(Self::from_header(header))
    }

    /// Add two work values.
    pub fn combine(self, other: Self) -> Self {
        let mut result = [0u8; 32];
        let mut carry = 0u16;

        for i in (0..32).rev() {
            let sum = self.work[i] as u16 + other.work[i] as u16 + carry;
            result[i] = (sum & 0xff) as u8;
            carry = sum >> 8;
        }

        Self {
            work: result,
        }
    }

    /// The work as a byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.work
    }

    /// Whether this work is zero.
    pub fn is_zero(&self) -> bool {
        self.work.iter().all(|&b| b == 0)
    }
}

impl Ord for ChainWork {
    fn cmp(&self, other: &Self) -> Ordering {
        // Big-endian byte order is also numeric order
        self.work.cmp(&other.work)
    }
}

impl PartialOrd for ChainWork {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for ChainWork {
    fn default() -> Self {
        Self::zero()
    }
}

impl Add for ChainWork {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        self.combine(other)
    }
}
