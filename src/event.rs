//! Structured events recorded by the mutation queue.
//!
//! Every change to a queued mutation and every drain leaves an event in the
//! local store. Events outlive the entries they describe and form the audit
//! trail for what the device did while offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RetryClass;
use crate::model::{EntryState, MutationKind, VisitId, VisitStatus};

/// A structured event recorded by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    MutationQueued {
        seq: u64,
        visit_id: VisitId,
        kind: MutationKind,
    },
    /// An identical intent was already queued; nothing was added.
    MutationDeduplicated {
        existing_seq: u64,
        visit_id: VisitId,
        kind: MutationKind,
    },
    /// The actor took the action again; the entry's request was swapped
    /// for the new one and the entry reset to pending.
    MutationReplaced {
        seq: u64,
        visit_id: VisitId,
        kind: MutationKind,
        previous_state: EntryState,
        previous_error: Option<String>,
    },
    MutationCommitted {
        seq: u64,
        visit_id: VisitId,
        status: VisitStatus,
        already_applied: bool,
    },
    /// The remote moved past the mutation; it was dropped.
    ConflictDiscarded {
        seq: u64,
        visit_id: VisitId,
        kind: MutationKind,
        remote_status: VisitStatus,
    },
    RetryScheduled {
        seq: u64,
        attempts: u32,
        retry: RetryClass,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    MutationFailed {
        seq: u64,
        attempts: u32,
        error: String,
    },
    /// A failed entry was put back in the queue by the user.
    MutationRetried {
        seq: u64,
    },
    MutationDismissed {
        seq: u64,
        visit_id: VisitId,
        kind: MutationKind,
    },
    EntryStateChanged {
        seq: u64,
        from: EntryState,
        to: EntryState,
    },
    DrainStarted {
        pending: usize,
    },
    DrainFinished {
        committed: usize,
        conflicts: usize,
        retried: usize,
        failed: usize,
        interrupted: bool,
        duration_ms: u64,
    },
    /// Stored event that this build does not recognize.
    Unknown {
        raw: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_by_type() {
        let kind = EventKind::MutationRetried { seq: 7 };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "mutation_retried");
        assert_eq!(json["seq"], 7);
    }
}
