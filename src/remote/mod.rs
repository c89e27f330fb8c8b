//! The remote system of record.
//!
//! The store is the single arbiter of a visit's current status. Every status
//! write is conditional on the status the caller read; a mismatch is reported
//! as [`UpdateOutcome::Conflict`] rather than overwriting.

pub mod memory;
pub mod rest;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{NewRating, Rating, Visit, VisitFields, VisitId, VisitStatus};

pub use memory::MemoryStore;
pub use rest::RestStore;

/// Result of a guarded status update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Written; the visit as stored afterwards.
    Committed(Visit),
    /// The visit was no longer in the expected status. Nothing was written.
    Conflict,
}

#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Fetch a visit. `Ok(None)` when it does not exist.
    async fn get_visit(&self, id: VisitId) -> Result<Option<Visit>>;

    /// Set `new_status` and `fields` together, only if the visit is still
    /// in `expected`.
    async fn update_visit_status(
        &self,
        id: VisitId,
        expected: VisitStatus,
        new_status: VisitStatus,
        fields: &VisitFields,
    ) -> Result<UpdateOutcome>;

    /// Insert a rating. An auto-generated rating for a visit that already has
    /// one is ignored, not duplicated.
    async fn insert_rating(&self, rating: &NewRating) -> Result<()>;

    /// The auto-generated rating for a visit, if one exists.
    async fn find_auto_rating(&self, visit_id: VisitId) -> Result<Option<Rating>>;

    /// The user account linked to a care recipient, if any.
    async fn get_linked_user_id(&self, care_recipient_id: &str) -> Result<Option<String>>;
}
