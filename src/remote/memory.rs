//! In-process remote store.
//!
//! Behaves like the hosted backend for the fields the engine reads and
//! writes, including the conditional status update and the one-auto-rating
//! per visit rule. Faults and latency can be injected to exercise retry,
//! timeout and offline paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{UpdateOutcome, VisitStore};
use crate::error::{Error, Result, RetryClass};
use crate::model::{NewRating, Rating, Visit, VisitFields, VisitId, VisitStatus};

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetVisit,
    UpdateStatus,
    InsertRating,
    FindRating,
    LinkedUser,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: u32,
    class: RetryClass,
}

#[derive(Debug, Default)]
struct State {
    visits: HashMap<VisitId, Visit>,
    ratings: Vec<Rating>,
    linked_users: HashMap<String, String>,
    faults: HashMap<StoreOp, Fault>,
    calls: HashMap<StoreOp, u32>,
    latency: Option<Duration>,
    interleaved: VecDeque<VisitStatus>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_visit(&self, visit: Visit) -> VisitId {
        let id = visit.id;
        self.state().visits.insert(id, visit);
        id
    }

    pub fn link_user(&self, care_recipient_id: impl Into<String>, user_id: impl Into<String>) {
        self.state()
            .linked_users
            .insert(care_recipient_id.into(), user_id.into());
    }

    pub fn visit(&self, id: VisitId) -> Option<Visit> {
        self.state().visits.get(&id).cloned()
    }

    /// Change a visit's status behind the engine's back, as another device would.
    pub fn set_status(&self, id: VisitId, status: VisitStatus) {
        if let Some(visit) = self.state().visits.get_mut(&id) {
            visit.status = status;
            visit.updated_at = Utc::now();
        }
    }

    pub fn ratings_for(&self, visit_id: VisitId) -> Vec<Rating> {
        self.state()
            .ratings
            .iter()
            .filter(|r| r.visit_id == visit_id)
            .cloned()
            .collect()
    }

    /// Make the next `times` calls of `op` fail with the given class.
    pub fn fail_next(&self, op: StoreOp, times: u32, class: RetryClass) {
        self.state().faults.insert(
            op,
            Fault {
                remaining: times,
                class,
            },
        );
    }

    /// Let another writer move the visit to `status` just before the next
    /// status update is compared, once per queued status.
    pub fn interleave_update(&self, status: VisitStatus) {
        self.state().interleaved.push_back(status);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// How many times `op` has been called, failed calls included.
    pub fn calls(&self, op: StoreOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    async fn enter(&self, op: StoreOp) -> Result<()> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(op).or_default() += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        let Some(fault) = state.faults.get_mut(&op) else {
            return Ok(());
        };
        if fault.remaining == 0 {
            return Ok(());
        }
        fault.remaining -= 1;
        let class = fault.class;
        Err(match class {
            RetryClass::Transient => Error::transient(format!("injected {op:?} failure")),
            _ => Error::permanent(format!("injected {op:?} rejection")),
        })
    }
}

#[async_trait]
impl VisitStore for MemoryStore {
    async fn get_visit(&self, id: VisitId) -> Result<Option<Visit>> {
        self.enter(StoreOp::GetVisit).await?;
        Ok(self.visit(id))
    }

    async fn update_visit_status(
        &self,
        id: VisitId,
        expected: VisitStatus,
        new_status: VisitStatus,
        fields: &VisitFields,
    ) -> Result<UpdateOutcome> {
        self.enter(StoreOp::UpdateStatus).await?;
        let mut state = self.state();
        let interleaved = state.interleaved.pop_front();
        let Some(visit) = state.visits.get_mut(&id) else {
            return Err(Error::VisitNotFound(id));
        };
        if let Some(status) = interleaved {
            visit.status = status;
            visit.updated_at = Utc::now();
        }
        if visit.status != expected {
            return Ok(UpdateOutcome::Conflict);
        }
        visit.apply(new_status, fields, Utc::now());
        Ok(UpdateOutcome::Committed(visit.clone()))
    }

    async fn insert_rating(&self, rating: &NewRating) -> Result<()> {
        self.enter(StoreOp::InsertRating).await?;
        let mut state = self.state();
        if rating.is_auto_generated
            && state
                .ratings
                .iter()
                .any(|r| r.visit_id == rating.visit_id && r.is_auto_generated)
        {
            return Ok(());
        }
        state.ratings.push(Rating {
            id: Uuid::new_v4(),
            visit_id: rating.visit_id,
            rater_id: rating.rater_id.clone(),
            rated_id: rating.rated_id.clone(),
            score: rating.score,
            reason: rating.reason.clone(),
            is_auto_generated: rating.is_auto_generated,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn find_auto_rating(&self, visit_id: VisitId) -> Result<Option<Rating>> {
        self.enter(StoreOp::FindRating).await?;
        Ok(self
            .state()
            .ratings
            .iter()
            .find(|r| r.visit_id == visit_id && r.is_auto_generated)
            .cloned())
    }

    async fn get_linked_user_id(&self, care_recipient_id: &str) -> Result<Option<String>> {
        self.enter(StoreOp::LinkedUser).await?;
        Ok(self.state().linked_users.get(care_recipient_id).cloned())
    }
}
