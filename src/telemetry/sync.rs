//! Sync span helpers.
//!
//! Span creation and state-transition recording for queue drains and the
//! mutations replayed inside them.

use tracing::Span;

use crate::model::{MutationKind, VisitId};

/// Start a span covering one drain of the mutation queue.
///
/// `drain.entries` is declared empty and filled in once the queue is read.
pub fn start_drain_span() -> Span {
    tracing::info_span!("sync.drain", "drain.entries" = tracing::field::Empty)
}

/// Start a span for replaying a single queued mutation.
///
/// The `mutation.outcome` field is declared empty and recorded when the
/// replay settles.
pub fn start_mutation_span(seq: u64, visit_id: &VisitId, kind: MutationKind) -> Span {
    tracing::info_span!(
        "sync.mutation",
        "mutation.seq" = seq,
        "mutation.visit_id" = %visit_id,
        "mutation.kind" = %kind,
        "mutation.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
