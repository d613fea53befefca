//! Holding area for rejected requests.
//!
//! The admission engine only appends; an external job reads or drains the
//! records for inspection or replay.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

use super::key::{RateLimitKey, Request};

/// A denied request as captured at rejection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRecord {
    /// Position in rejection order across all keys
    pub sequence: u64,
    /// Key the request was evaluated under
    pub key: RateLimitKey,
    /// Copy of the rejected request
    pub request: Request,
    /// Wall-clock time of the rejection, for readers outside the process.
    /// Taken from the system clock, not the limiter's refill clock.
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SinkState {
    records: VecDeque<RejectionRecord>,
    next_sequence: u64,
    dropped: u64,
}

/// Ordered, append-only queue of rejected requests.
///
/// Unbounded unless built with [`RejectionSink::bounded`], in which case the
/// oldest record is discarded to make room.
#[derive(Debug, Default)]
pub struct RejectionSink {
    state: Mutex<SinkState>,
    max_records: Option<usize>,
}

impl RejectionSink {
    /// Create an unbounded sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink holding at most `max_records` records.
    pub fn bounded(max_records: usize) -> Self {
        Self {
            state: Mutex::new(SinkState::default()),
            max_records: Some(max_records.max(1)),
        }
    }

    /// Create a sink from an optional bound.
    pub fn with_limit(max_records: Option<usize>) -> Self {
        match max_records {
            Some(max) => Self::bounded(max),
            None => Self::new(),
        }
    }

    /// Record a rejected request and return its sequence number.
    pub fn append(&self, key: &RateLimitKey, request: &Request) -> u64 {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        if let Some(max) = self.max_records {
            if state.records.len() >= max {
                state.records.pop_front();
                state.dropped += 1;
                if state.dropped == 1 {
                    warn!(max_records = max, "Rejection sink full, discarding oldest records");
                }
            }
        }

        state.records.push_back(RejectionRecord {
            sequence,
            key: key.clone(),
            request: request.clone(),
            rejected_at: Utc::now(),
        });
        sequence
    }

    /// All held records in rejection order, without removing them.
    pub fn snapshot(&self) -> Vec<RejectionRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    /// Remove and return all held records in rejection order.
    pub fn drain(&self) -> Vec<RejectionRecord> {
        self.state.lock().records.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Records discarded because the sink was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn max_records(&self) -> Option<usize> {
        self.max_records
    }
}
