//! Per-session peer misbehavior accounting.
//!
//! Each offense adds a weighted score. The score decays by half per elapsed
//! decay interval, applied lazily, so an otherwise honest peer recovers from
//! occasional false positives while a flooding peer crosses the threshold
//! quickly. The score is session-scoped: a reconnect starts clean.

use std::time::{Duration, Instant};

/// Offenses a peer can commit during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehavior {
    /// Header failed proof of work or linkage validation.
    InvalidHeader,
    /// Message that could not be decoded or violated the protocol.
    InvalidMessage,
    /// Data we never requested.
    UnrequestedData,
    /// Filtered transaction that matched nothing we watch.
    FalseMatch,
}

impl Misbehavior {
    fn weight(self) -> u32 {
        match self {
            Misbehavior::InvalidHeader => 50,
            Misbehavior::InvalidMessage => 10,
            Misbehavior::UnrequestedData => 20,
            Misbehavior::FalseMatch => 5,
        }
    }
}

/// Decaying misbehavior score for the connected peer.
#[derive(Debug)]
pub struct MisbehaviorTracker {
    score: u32,
    threshold: u32,
    decay_interval: Duration,
    last_decay: Instant,
    false_matches: u32,
    scanned_txs: u32,
}

impl MisbehaviorTracker {
    pub fn new(threshold: u32, decay_interval: Duration) -> Self {
        Self {
            score: 0,
            threshold,
            decay_interval,
            last_decay: Instant::now(),
            false_matches: 0,
            scanned_txs: 0,
        }
    }

    /// Record an offense. Returns true when the peer has crossed the
    /// disconnect threshold.
    pub fn penalize(&mut self, offense: Misbehavior) -> bool {
        self.apply_decay(Instant::now());
        self.score = self.score.saturating_add(offense.weight());
        if let Misbehavior::FalseMatch = offense {
            self.false_matches += 1;
        }
        tracing::debug!(
            "Peer misbehavior {:?}: score {}/{}",
            offense,
            self.score,
            self.threshold
        );
        self.score >= self.threshold
    }

    /// Record a filtered transaction that did match the watch set. Keeps the
    /// observed false-positive ratio meaningful.
    pub fn record_scanned_tx(&mut self) {
        self.scanned_txs += 1;
    }

    /// Current score after lazy decay.
    pub fn score(&mut self) -> u32 {
        self.apply_decay(Instant::now());
        self.score
    }

    pub fn threshold_exceeded(&mut self) -> bool {
        self.score() >= self.threshold
    }

    /// Observed false-positive ratio over the session, if any transactions
    /// have been seen.
    pub fn false_positive_ratio(&self) -> Option<f64> {
        let total = self.false_matches + self.scanned_txs;
        if total == 0 {
            None
        } else {
            Some(self.false_matches as f64 / total as f64)
        }
    }

    fn apply_decay(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_decay);
        if elapsed < self.decay_interval {
            return;
        }
        let periods = (elapsed.as_secs() / self.decay_interval.as_secs().max(1)).min(31);
        self.score >>= periods as u32;
        self.last_decay = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_headers_cross_threshold_quickly() {
        let mut tracker = MisbehaviorTracker::new(100, Duration::from_secs(60));
        assert!(!tracker.penalize(Misbehavior::InvalidHeader));
        assert!(tracker.penalize(Misbehavior::InvalidHeader));
    }

    #[test]
    fn false_matches_accumulate_slowly() {
        let mut tracker = MisbehaviorTracker::new(100, Duration::from_secs(60));
        for _ in 0..19 {
            assert!(!tracker.penalize(Misbehavior::FalseMatch));
        }
        assert!(tracker.penalize(Misbehavior::FalseMatch));
    }

    #[test]
    fn score_decays_by_half_per_interval() {
        let mut tracker = MisbehaviorTracker::new(100, Duration::from_secs(60));
        tracker.penalize(Misbehavior::UnrequestedData);
        tracker.penalize(Misbehavior::UnrequestedData);
        assert_eq!(tracker.score, 40);

        tracker.last_decay = Instant::now() - Duration::from_secs(61);
        assert_eq!(tracker.score(), 20);

        tracker.last_decay = Instant::now() - Duration::from_secs(125);
        assert_eq!(tracker.score(), 5);
    }

    #[test]
    fn false_positive_ratio_tracks_scanned_txs() {
        let mut tracker = MisbehaviorTracker::new(100, Duration::from_secs(60));
        assert_eq!(tracker.false_positive_ratio(), None);

        for _ in 0..3 {
            tracker.record_scanned_tx();
        }
        tracker.penalize(Misbehavior::FalseMatch);
        assert_eq!(tracker.false_positive_ratio(), Some(0.25));
    }
}
