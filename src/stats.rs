//! Transfer outcome counters, summarized once at session end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::info;

use crate::protocol::codes;

/// Outcome counters for the session, keyed on backend reply codes.
#[derive(Debug)]
pub struct TransferStats {
    accepted: AtomicU64,
    refused: AtomicU64,
    rejected: AtomicU64,
    tempfail: AtomicU64,
    takethis: AtomicU64,
    ihave: AtomicU64,
    started: Instant,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            tempfail: AtomicU64::new(0),
            takethis: AtomicU64::new(0),
            ihave: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Count one backend reply. Codes outside the IHAVE/CHECK/TAKETHIS
    /// outcome sets (banners, 335 continuations) are ignored.
    pub fn record(&self, code: u16) {
        let (outcome, family) = match code {
            codes::TRANSFER_OK => (&self.accepted, &self.ihave),
            codes::NOT_WANTED => (&self.refused, &self.ihave),
            codes::TRANSFER_FAILED => (&self.tempfail, &self.ihave),
            codes::REJECTED => (&self.rejected, &self.ihave),
            codes::TAKETHIS_OK => (&self.accepted, &self.takethis),
            codes::TRY_LATER => (&self.tempfail, &self.takethis),
            codes::CHECK_NOT_WANTED => (&self.refused, &self.takethis),
            codes::TAKETHIS_REJECTED => (&self.rejected, &self.takethis),
            _ => return,
        };
        outcome.fetch_add(1, Ordering::Relaxed);
        family.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit the one-line session summary.
    pub fn log_summary(&self, name: &str) {
        info!(
            "{}: stats: accepted={} refused={} rejected={} tempfail={} takethis={} ihave={} seconds={}",
            name,
            self.accepted.load(Ordering::Relaxed),
            self.refused.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.tempfail.load(Ordering::Relaxed),
            self.takethis.load(Ordering::Relaxed),
            self.ihave.load(Ordering::Relaxed),
            self.started.elapsed().as_secs()
        );
    }

    #[cfg(test)]
    fn snapshot(&self) -> [u64; 6] {
        [
            self.accepted.load(Ordering::Relaxed),
            self.refused.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.tempfail.load(Ordering::Relaxed),
            self.takethis.load(Ordering::Relaxed),
            self.ihave.load(Ordering::Relaxed),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ihave_outcomes() {
        let stats = TransferStats::new();
        stats.record(235);
        stats.record(435);
        stats.record(436);
        stats.record(437);
        // accepted, refused, rejected, tempfail, takethis, ihave
        assert_eq!(stats.snapshot(), [1, 1, 1, 1, 0, 4]);
    }

    #[test]
    fn test_check_takethis_outcomes() {
        let stats = TransferStats::new();
        stats.record(239);
        stats.record(431);
        stats.record(438);
        stats.record(439);
        assert_eq!(stats.snapshot(), [1, 1, 1, 1, 4, 0]);
    }

    #[test]
    fn test_uncounted_codes_are_ignored() {
        let stats = TransferStats::new();
        for code in [0, 200, 203, 205, 335, 430, 500] {
            stats.record(code);
        }
        assert_eq!(stats.snapshot(), [0; 6]);
    }
}
