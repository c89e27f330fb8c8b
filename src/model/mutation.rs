//! Offline mutation queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Actor, MutationKind, TransitionRequest, VisitId};

/// A state change recorded on-device and not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    /// Per-device monotonic sequence number. Orders replay within a visit.
    pub seq: u64,

    pub visit_id: VisitId,

    /// What to do, including coordinates, note text and the device timestamp.
    pub request: TransitionRequest,

    /// Who did it.
    pub actor: Actor,

    pub state: EntryState,

    /// Failed replay attempts so far.
    pub attempts: u32,

    pub last_error: Option<String>,

    /// Earliest instant the next replay may be attempted (backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingMutation {
    pub fn kind(&self) -> MutationKind {
        self.request.kind()
    }

    /// Is the backoff window still open at `now`?
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|t| t > now)
    }
}

/// Lifecycle state of a queue entry. Committed and conflict-discarded
/// entries are removed from the queue rather than kept in a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting for the next drain.
    Pending,
    /// Being replayed against the remote store.
    InFlight,
    /// Exhausted its retry budget or hit a non-retryable error.
    /// Kept until the user retries or dismisses it.
    Failed,
}

impl EntryState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, to),
            (Pending, InFlight)
                | (InFlight, Pending)   // backoff, or went offline mid-drain
                | (InFlight, Failed)
                | (Failed, Pending) // manual retry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::InFlight => "in_flight",
            EntryState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntryState {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "in_flight" => Ok(EntryState::InFlight),
            "failed" => Ok(EntryState::Failed),
            _ => Err(crate::error::Error::Other(format!(
                "unknown queue entry state: {s}"
            ))),
        }
    }
}

/// A mutation to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub visit_id: VisitId,
    pub actor: Actor,
    pub request: TransitionRequest,
}

impl NewMutation {
    pub fn new(visit_id: VisitId, actor: Actor, request: TransitionRequest) -> Self {
        Self {
            visit_id,
            actor,
            request,
        }
    }
}

/// What happened when a mutation was enqueued.
#[derive(Debug)]
pub enum EnqueueResult {
    /// Appended to the queue.
    Queued(Box<PendingMutation>),
    /// The same actor's earlier entry for this visit and kind was pending
    /// with a different payload, or had failed. It now carries the new
    /// request and is pending again, keeping its place in the queue.
    Replaced(Box<PendingMutation>),
    /// The same action by the same actor is already pending.
    Duplicate { existing_seq: u64 },
}

impl EnqueueResult {
    pub fn seq(&self) -> u64 {
        match self {
            EnqueueResult::Queued(entry) | EnqueueResult::Replaced(entry) => entry.seq,
            EnqueueResult::Duplicate { existing_seq } => *existing_seq,
        }
    }
}
