//! SQLite storage for the offline mutation queue.
//!
//! Single source of truth for queued mutations and the sync event log.
//! WAL mode. Sequence numbers come from an AUTOINCREMENT key, so they are
//! monotonic per device and never reused after an entry is removed.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{Error, Result, RetryClass};
use crate::event::{Event, EventKind};
use crate::model::*;

const ENTRY_COLUMNS: &str = "seq, visit_id, request, actor_id, actor_role, state, attempts, \
                             last_error, next_attempt_at, created_at, updated_at";

/// Durable queue. Owns the SQLite connection.
pub struct QueueStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore").finish_non_exhaustive()
    }
}

impl QueueStore {
    /// Open or create a queue database at the given path.
    ///
    /// Entries left in flight by a previous process are returned to pending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory queue (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS mutations (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                visit_id        TEXT NOT NULL,
                kind            TEXT NOT NULL,
                request         TEXT NOT NULL,
                actor_id        TEXT NOT NULL,
                actor_role      TEXT NOT NULL,
                state           TEXT NOT NULL DEFAULT 'pending',
                attempts        INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                next_attempt_at TEXT,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_mutations_visit ON mutations(visit_id, seq);
            CREATE INDEX IF NOT EXISTS idx_mutations_state ON mutations(state);

            CREATE TABLE IF NOT EXISTS events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp   TEXT NOT NULL,
                kind        TEXT NOT NULL
            );
            ",
        )?;

        let recovered = conn.execute(
            "UPDATE mutations SET state = 'pending', updated_at = ?1 WHERE state = 'in_flight'",
            params![Utc::now().to_rfc3339()],
        )?;
        if recovered > 0 {
            info!(recovered, "returned interrupted mutations to pending");
        }

        Ok(())
    }

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    /// Append a mutation.
    ///
    /// The same actor's latest pending or failed entry for this visit and
    /// kind absorbs the new one: an identical pending action is reported as
    /// a duplicate; anything else replaces that entry's request and puts it
    /// back to pending in its original position. In-flight entries are
    /// never touched.
    pub fn enqueue(&self, mutation: &NewMutation) -> Result<EnqueueResult> {
        let kind = mutation.request.kind();
        self.with_transaction(|conn| {
            let existing = query_entries(
                conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM mutations
                     WHERE visit_id = ?1 AND kind = ?2 AND actor_id = ?3 AND actor_role = ?4
                       AND state IN ('pending', 'failed')
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![
                    mutation.visit_id.to_string(),
                    kind.as_str(),
                    mutation.actor.id,
                    mutation.actor.role.to_string(),
                ],
            )?
            .into_iter()
            .next();

            if let Some(existing) = existing {
                if existing.state == EntryState::Pending
                    && existing.request.same_action(&mutation.request)
                {
                    record_event_on(
                        conn,
                        EventKind::MutationDeduplicated {
                            existing_seq: existing.seq,
                            visit_id: mutation.visit_id,
                            kind,
                        },
                    )?;
                    debug!(visit_id = %mutation.visit_id, %kind, existing_seq = existing.seq, "mutation already queued");
                    return Ok(EnqueueResult::Duplicate {
                        existing_seq: existing.seq,
                    });
                }

                let entry = replace_on(conn, &existing, &mutation.request)?;
                info!(
                    seq = entry.seq,
                    visit_id = %entry.visit_id,
                    %kind,
                    previous_state = %existing.state,
                    "queued mutation replaced by a newer action"
                );
                return Ok(EnqueueResult::Replaced(Box::new(entry)));
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO mutations (
                    visit_id, kind, request, actor_id, actor_role, state, attempts,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
                params![
                    mutation.visit_id.to_string(),
                    kind.as_str(),
                    serde_json::to_string(&mutation.request)?,
                    mutation.actor.id,
                    mutation.actor.role.to_string(),
                    now,
                ],
            )?;
            let seq = conn.last_insert_rowid() as u64;

            record_event_on(
                conn,
                EventKind::MutationQueued {
                    seq,
                    visit_id: mutation.visit_id,
                    kind,
                },
            )?;

            let entry = get_on(conn, seq)?;
            Ok(EnqueueResult::Queued(Box::new(entry)))
        })
    }

    /// Get an entry by sequence number.
    pub fn get(&self, seq: u64) -> Result<PendingMutation> {
        get_on(&self.conn(), seq)
    }

    /// All entries, optionally filtered by state, in sequence order.
    pub fn list(&self, state: Option<EntryState>) -> Result<Vec<PendingMutation>> {
        let conn = self.conn();
        match state {
            Some(state) => query_entries(
                &conn,
                &format!("SELECT {ENTRY_COLUMNS} FROM mutations WHERE state = ?1 ORDER BY seq ASC"),
                params![state.as_str()],
            ),
            None => query_entries(
                &conn,
                &format!("SELECT {ENTRY_COLUMNS} FROM mutations ORDER BY seq ASC"),
                params![],
            ),
        }
    }

    /// Entries for one visit, oldest first.
    pub fn for_visit(&self, visit_id: VisitId) -> Result<Vec<PendingMutation>> {
        query_entries(
            &self.conn(),
            &format!("SELECT {ENTRY_COLUMNS} FROM mutations WHERE visit_id = ?1 ORDER BY seq ASC"),
            params![visit_id.to_string()],
        )
    }

    /// Number of entries in each state.
    pub fn count(&self, state: EntryState) -> Result<usize> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM mutations WHERE state = ?1",
            params![state.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Pending → in flight, just before replay. Returns the entry as
    /// stored, which may carry a newer request than the caller last read.
    pub fn mark_in_flight(&self, seq: u64) -> Result<PendingMutation> {
        self.with_transaction(|conn| {
            update_state_on(conn, seq, EntryState::InFlight)?;
            get_on(conn, seq)
        })
    }

    /// In flight → pending without counting an attempt. Used when
    /// connectivity drops mid-replay.
    pub fn revert_pending(&self, seq: u64) -> Result<()> {
        self.with_transaction(|conn| {
            update_state_on(conn, seq, EntryState::Pending)?;
            record_event_on(
                conn,
                EventKind::EntryStateChanged {
                    seq,
                    from: EntryState::InFlight,
                    to: EntryState::Pending,
                },
            )?;
            Ok(())
        })
    }

    /// In flight → pending with a backoff deadline.
    pub fn schedule_retry(
        &self,
        seq: u64,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        retry: RetryClass,
        error: &str,
    ) -> Result<()> {
        self.with_transaction(|conn| {
            update_state_on(conn, seq, EntryState::Pending)?;
            conn.execute(
                "UPDATE mutations SET attempts = ?1, last_error = ?2, next_attempt_at = ?3
                 WHERE seq = ?4",
                params![attempts, error, next_attempt_at.to_rfc3339(), seq as i64],
            )?;
            record_event_on(
                conn,
                EventKind::RetryScheduled {
                    seq,
                    attempts,
                    retry,
                    next_attempt_at,
                    error: error.to_string(),
                },
            )?;
            Ok(())
        })
    }

    /// In flight → failed. The entry stays until retried or dismissed.
    pub fn mark_failed(&self, seq: u64, attempts: u32, error: &str) -> Result<()> {
        self.with_transaction(|conn| {
            update_state_on(conn, seq, EntryState::Failed)?;
            conn.execute(
                "UPDATE mutations SET attempts = ?1, last_error = ?2, next_attempt_at = NULL
                 WHERE seq = ?3",
                params![attempts, error, seq as i64],
            )?;
            record_event_on(
                conn,
                EventKind::MutationFailed {
                    seq,
                    attempts,
                    error: error.to_string(),
                },
            )?;
            Ok(())
        })
    }

    /// Delete an in-flight entry once the remote has settled it, recording
    /// why (committed or conflict-discarded).
    pub fn settle(&self, seq: u64, event: EventKind) -> Result<Event> {
        self.with_transaction(|conn| {
            let state = get_state_on(conn, seq)?;
            if state != EntryState::InFlight {
                return Err(Error::Other(format!(
                    "entry {seq} is {state}; only in-flight entries can be settled"
                )));
            }
            conn.execute("DELETE FROM mutations WHERE seq = ?1", params![seq as i64])?;
            record_event_on(conn, event)
        })
    }

    /// Failed → pending, with the attempt count reset.
    pub fn retry(&self, seq: u64) -> Result<()> {
        self.with_transaction(|conn| retry_on(conn, seq))
    }

    /// Retry every failed entry. Returns the sequence numbers moved.
    pub fn retry_failed(&self) -> Result<Vec<u64>> {
        self.with_transaction(|conn| {
            let mut stmt =
                conn.prepare("SELECT seq FROM mutations WHERE state = 'failed' ORDER BY seq ASC")?;
            let seqs = stmt
                .query_map([], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for &seq in &seqs {
                retry_on(conn, seq as u64)?;
            }
            Ok(seqs.into_iter().map(|s| s as u64).collect())
        })
    }

    /// Remove a failed entry at the user's request.
    pub fn dismiss(&self, seq: u64) -> Result<PendingMutation> {
        self.with_transaction(|conn| {
            let entry = get_on(conn, seq)?;
            if entry.state != EntryState::Failed {
                return Err(Error::Other(format!(
                    "entry {seq} is {}; only failed entries can be dismissed",
                    entry.state
                )));
            }
            conn.execute("DELETE FROM mutations WHERE seq = ?1", params![seq as i64])?;
            record_event_on(
                conn,
                EventKind::MutationDismissed {
                    seq,
                    visit_id: entry.visit_id,
                    kind: entry.kind(),
                },
            )?;
            Ok(entry)
        })
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Record an event and return it with its sequence number.
    pub fn record_event(&self, kind: EventKind) -> Result<Event> {
        record_event_on(&self.conn(), kind)
    }

    /// Get events since a sequence number.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<Event>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT seq, timestamp, kind FROM events WHERE seq > ?1 ORDER BY seq ASC")?;

        let events = stmt
            .query_map(params![since_seq as i64], |row| {
                let kind_str: String = row.get(2)?;
                Ok(Event {
                    seq: row.get::<_, i64>(0)? as u64,
                    timestamp: row
                        .get::<_, String>(1)?
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    kind: serde_json::from_str(&kind_str)
                        .unwrap_or(EventKind::Unknown { raw: kind_str }),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

// ---------------------------------------------------------------------------
// Inner functions. They take &Connection so they run both on the plain
// connection and inside a transaction.
// ---------------------------------------------------------------------------

fn get_state_on(conn: &Connection, seq: u64) -> Result<EntryState> {
    let state: String = conn
        .query_row(
            "SELECT state FROM mutations WHERE seq = ?1",
            params![seq as i64],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::QueueEntryNotFound(seq))?;
    state.parse()
}

fn get_on(conn: &Connection, seq: u64) -> Result<PendingMutation> {
    query_entries(
        conn,
        &format!("SELECT {ENTRY_COLUMNS} FROM mutations WHERE seq = ?1"),
        params![seq as i64],
    )?
    .into_iter()
    .next()
    .ok_or(Error::QueueEntryNotFound(seq))
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PendingMutation>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| Ok(row_to_entry(row)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut result = Vec::with_capacity(rows.len());
    for row in rows {
        result.push(row.map_err(|e| Error::Other(format!("failed to parse queue entry: {e}")))?);
    }
    Ok(result)
}

/// Validate and apply an entry state change. Returns the previous state.
fn update_state_on(conn: &Connection, seq: u64, to: EntryState) -> Result<EntryState> {
    let from = get_state_on(conn, seq)?;
    if !from.can_transition_to(to) {
        return Err(Error::InvalidEntryTransition { from, to });
    }
    conn.execute(
        "UPDATE mutations SET state = ?1, updated_at = ?2 WHERE seq = ?3",
        params![to.as_str(), Utc::now().to_rfc3339(), seq as i64],
    )?;
    Ok(from)
}

fn retry_on(conn: &Connection, seq: u64) -> Result<()> {
    update_state_on(conn, seq, EntryState::Pending)?;
    conn.execute(
        "UPDATE mutations SET attempts = 0, next_attempt_at = NULL WHERE seq = ?1",
        params![seq as i64],
    )?;
    record_event_on(conn, EventKind::MutationRetried { seq })?;
    Ok(())
}

/// Swap in a newer request for a pending or failed entry and make it
/// pending again with a clean retry record.
fn replace_on(
    conn: &Connection,
    existing: &PendingMutation,
    request: &TransitionRequest,
) -> Result<PendingMutation> {
    let seq = existing.seq;
    if existing.state != EntryState::Pending {
        update_state_on(conn, seq, EntryState::Pending)?;
    }
    conn.execute(
        "UPDATE mutations SET request = ?1, attempts = 0, last_error = NULL,
             next_attempt_at = NULL, updated_at = ?2
         WHERE seq = ?3",
        params![
            serde_json::to_string(request)?,
            Utc::now().to_rfc3339(),
            seq as i64
        ],
    )?;
    record_event_on(
        conn,
        EventKind::MutationReplaced {
            seq,
            visit_id: existing.visit_id,
            kind: existing.kind(),
            previous_state: existing.state,
            previous_error: existing.last_error.clone(),
        },
    )?;
    get_on(conn, seq)
}

fn record_event_on(conn: &Connection, kind: EventKind) -> Result<Event> {
    let now = Utc::now();

    conn.execute(
        "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
        params![now.to_rfc3339(), serde_json::to_string(&kind)?],
    )?;

    let seq = conn.last_insert_rowid();

    Ok(Event {
        seq: seq as u64,
        timestamp: now,
        kind,
    })
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

fn row_to_entry(row: &rusqlite::Row) -> std::result::Result<PendingMutation, String> {
    let visit_str: String = row.get(1).map_err(|e| e.to_string())?;
    let request_str: String = row.get(2).map_err(|e| e.to_string())?;
    let role_str: String = row.get(4).map_err(|e| e.to_string())?;
    let state_str: String = row.get(5).map_err(|e| e.to_string())?;
    let next_str: Option<String> = row.get(8).map_err(|e| e.to_string())?;
    let created_str: String = row.get(9).map_err(|e| e.to_string())?;
    let updated_str: String = row.get(10).map_err(|e| e.to_string())?;

    Ok(PendingMutation {
        seq: row.get::<_, i64>(0).map_err(|e| e.to_string())? as u64,
        visit_id: visit_str.parse().map_err(|e: Error| e.to_string())?,
        request: serde_json::from_str(&request_str).map_err(|e| e.to_string())?,
        actor: Actor {
            id: row.get(3).map_err(|e| e.to_string())?,
            role: role_str.parse().map_err(|e: Error| e.to_string())?,
        },
        state: state_str.parse().map_err(|e: Error| e.to_string())?,
        attempts: row.get(6).map_err(|e| e.to_string())?,
        last_error: row.get(7).map_err(|e| e.to_string())?,
        next_attempt_at: next_str
            .map(|s| s.parse::<DateTime<Utc>>())
            .transpose()
            .map_err(|_| "invalid next_attempt_at".to_string())?,
        created_at: created_str
            .parse()
            .map_err(|_| "invalid created_at".to_string())?,
        updated_at: updated_str
            .parse()
            .map_err(|_| "invalid updated_at".to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-05-04T14:00:00Z".parse().unwrap()
    }

    fn check_in(visit_id: VisitId) -> NewMutation {
        NewMutation::new(
            visit_id,
            Actor::caregiver("cg-1"),
            TransitionRequest::CheckIn {
                proof: Proof::gps(40.0, -75.0),
                at: now(),
            },
        )
    }

    fn check_out(visit_id: VisitId) -> NewMutation {
        NewMutation::new(
            visit_id,
            Actor::caregiver("cg-1"),
            TransitionRequest::CheckOut {
                proof: Proof::gps(40.0, -75.0),
                at: now(),
            },
        )
    }

    #[test]
    fn enqueue_assigns_increasing_sequence_numbers() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let a = store.enqueue(&check_in(visit)).unwrap().seq();
        let b = store.enqueue(&check_out(visit)).unwrap().seq();
        assert!(b > a);

        let entries = store.for_visit(visit).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind(), MutationKind::CheckIn);
        assert_eq!(entries[0].state, EntryState::Pending);
        assert_eq!(entries[0].actor, Actor::caregiver("cg-1"));
        assert_eq!(entries[1].kind(), MutationKind::CheckOut);
    }

    #[test]
    fn sequence_numbers_are_not_reused_after_removal() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let a = store.enqueue(&check_in(visit)).unwrap().seq();
        store.mark_in_flight(a).unwrap();
        store
            .settle(
                a,
                EventKind::MutationCommitted {
                    seq: a,
                    visit_id: visit,
                    status: VisitStatus::CheckedIn,
                    already_applied: false,
                },
            )
            .unwrap();
        let b = store.enqueue(&check_out(visit)).unwrap().seq();
        assert!(b > a);
    }

    #[test]
    fn duplicate_intent_is_not_queued_twice() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let first = store.enqueue(&check_in(visit)).unwrap();
        let second = store.enqueue(&check_in(visit)).unwrap();
        assert!(matches!(second, EnqueueResult::Duplicate { existing_seq } if existing_seq == first.seq()));
        assert_eq!(store.list(None).unwrap().len(), 1);

        let events = store.events_since(0).unwrap();
        assert!(matches!(
            events.last().unwrap().kind,
            EventKind::MutationDeduplicated { .. }
        ));
    }

    #[test]
    fn retaken_check_in_replaces_the_failed_entry() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let bad_fix = NewMutation::new(
            visit,
            Actor::caregiver("cg-1"),
            TransitionRequest::CheckIn {
                proof: Proof::gps(40.01, -75.0),
                at: now(),
            },
        );
        let seq = store.enqueue(&bad_fix).unwrap().seq();
        let later = store.enqueue(&check_out(visit)).unwrap().seq();
        store.mark_in_flight(seq).unwrap();
        store.mark_failed(seq, 0, "outside geofence").unwrap();

        let entry = match store.enqueue(&check_in(visit)).unwrap() {
            EnqueueResult::Replaced(entry) => entry,
            other => panic!("expected Replaced, got {other:?}"),
        };
        assert_eq!(entry.seq, seq);
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.attempts, 0);
        assert!(entry.last_error.is_none());
        assert_eq!(entry.request, check_in(visit).request);

        // Keeps its place ahead of the check-out.
        let seqs: Vec<u64> = store.for_visit(visit).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![seq, later]);

        let events = store.events_since(0).unwrap();
        assert!(matches!(
            &events.last().unwrap().kind,
            EventKind::MutationReplaced {
                previous_state: EntryState::Failed,
                previous_error: Some(e),
                ..
            } if e == "outside geofence"
        ));
    }

    #[test]
    fn pending_entry_takes_the_newer_proof() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let seq = store.enqueue(&check_in(visit)).unwrap().seq();

        let qr = NewMutation::new(
            visit,
            Actor::caregiver("cg-1"),
            TransitionRequest::CheckIn {
                proof: Proof::QrCode {
                    token: "qr-1".into(),
                },
                at: now(),
            },
        );
        assert!(matches!(store.enqueue(&qr).unwrap(), EnqueueResult::Replaced(_)));
        assert_eq!(store.get(seq).unwrap().request, qr.request);
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn other_actors_and_in_flight_entries_are_not_merged() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let cancel = |actor: Actor| {
            NewMutation::new(visit, actor, TransitionRequest::Cancel { at: now() })
        };

        let caregiver = store.enqueue(&cancel(Actor::caregiver("cg-1"))).unwrap();
        let recipient = store.enqueue(&cancel(Actor::care_recipient("elder-1"))).unwrap();
        assert!(matches!(recipient, EnqueueResult::Queued(_)));
        assert_ne!(recipient.seq(), caregiver.seq());

        // A replay already under way is left alone; the new action queues behind it.
        store.mark_in_flight(caregiver.seq()).unwrap();
        let again = store.enqueue(&cancel(Actor::caregiver("cg-1"))).unwrap();
        assert!(matches!(again, EnqueueResult::Queued(_)));
        assert_eq!(store.list(None).unwrap().len(), 3);
    }

    #[test]
    fn entry_state_changes_are_validated() {
        let store = QueueStore::in_memory().unwrap();
        let seq = store.enqueue(&check_in(VisitId::new())).unwrap().seq();

        let err = store.mark_failed(seq, 1, "boom").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidEntryTransition {
                from: EntryState::Pending,
                to: EntryState::Failed
            }
        ));
        assert!(matches!(store.retry(seq), Err(Error::InvalidEntryTransition { .. })));
        assert!(matches!(store.get(999), Err(Error::QueueEntryNotFound(999))));
    }

    #[test]
    fn failed_entries_can_be_retried_or_dismissed() {
        let store = QueueStore::in_memory().unwrap();
        let visit = VisitId::new();
        let a = store.enqueue(&check_in(visit)).unwrap().seq();
        let b = store.enqueue(&check_out(visit)).unwrap().seq();

        for seq in [a, b] {
            store.mark_in_flight(seq).unwrap();
            store.mark_failed(seq, 5, "backend unavailable").unwrap();
        }
        assert_eq!(store.count(EntryState::Failed).unwrap(), 2);

        store.retry(a).unwrap();
        let entry = store.get(a).unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.attempts, 0);

        let dismissed = store.dismiss(b).unwrap();
        assert_eq!(dismissed.kind(), MutationKind::CheckOut);
        assert!(store.get(b).is_err());

        // Pending entries are not dismissable.
        assert!(store.dismiss(a).is_err());
    }

    #[test]
    fn schedule_retry_records_backoff() {
        let store = QueueStore::in_memory().unwrap();
        let seq = store.enqueue(&check_in(VisitId::new())).unwrap().seq();
        store.mark_in_flight(seq).unwrap();
        let next = now() + chrono::Duration::seconds(10);
        store
            .schedule_retry(seq, 1, next, RetryClass::Transient, "timeout")
            .unwrap();

        let entry = store.get(seq).unwrap();
        assert_eq!(entry.state, EntryState::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_attempt_at, Some(next));
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
        assert!(entry.is_deferred(now()));
    }

    #[test]
    fn malformed_event_json_returns_unknown_variant() {
        let store = QueueStore::in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO events (timestamp, kind) VALUES (?1, ?2)",
                params![Utc::now().to_rfc3339(), "not json {{"],
            )
            .unwrap();

        let events = store.events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            EventKind::Unknown { raw } => assert_eq!(raw, "not json {{"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
