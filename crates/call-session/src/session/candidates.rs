//! Remote ICE candidate buffering
//!
//! Candidates can arrive before the remote description they belong to. They
//! are held in arrival order until the description is applied, flushed
//! exactly once, and from then on passed straight through.

use crate::engine::PeerConnectionHandle;
use crate::signaling::envelope::CandidateDescriptor;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// What to do with an incoming candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueue {
    /// Held until the buffer is flushed
    Buffered,
    /// The buffer is already flushed; apply the candidate now
    ApplyNow(CandidateDescriptor),
    /// The buffer is full; the candidate was discarded
    Dropped,
}

/// Result of a flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

/// Ordered, bounded buffer of remote candidates for one generation
#[derive(Debug)]
pub struct CandidateBuffer {
    pending: VecDeque<CandidateDescriptor>,
    capacity: usize,
    flushed: bool,
    dropped: usize,
}

impl CandidateBuffer {
    /// Create an open buffer holding at most `capacity` candidates
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            flushed: false,
            dropped: 0,
        }
    }

    pub fn enqueue(&mut self, candidate: CandidateDescriptor) -> Enqueue {
        if self.flushed {
            return Enqueue::ApplyNow(candidate);
        }

        if self.pending.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                "Candidate buffer full ({}), dropping candidate {}",
                self.capacity, candidate.candidate
            );
            return Enqueue::Dropped;
        }

        self.pending.push_back(candidate);
        Enqueue::Buffered
    }

    /// Apply every buffered candidate in arrival order and close the buffer
    ///
    /// A failing candidate is logged and the flush continues. Calling this
    /// on an already flushed buffer does nothing.
    pub async fn flush_into(&mut self, connection: &dyn PeerConnectionHandle) -> FlushReport {
        let mut report = FlushReport::default();
        if self.flushed {
            return report;
        }
        self.flushed = true;

        while let Some(candidate) = self.pending.pop_front() {
            match connection.add_ice_candidate(&candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to apply buffered candidate: {}", e);
                }
            }
        }

        debug!(
            "Flushed candidate buffer for generation {}: {} applied, {} failed",
            connection.generation(),
            report.applied,
            report.failed
        );
        report
    }

    /// Empty and reopen the buffer for a new generation
    pub fn reset(&mut self) {
        self.pending.clear();
        self.flushed = false;
        self.dropped = 0;
    }

    /// Empty the buffer without reopening it
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Candidates discarded because the buffer was full
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}
