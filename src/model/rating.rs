//! Ratings tied to a visit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::VisitId;

/// A stored rating retrieved from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub id: Uuid,
    pub visit_id: VisitId,
    pub rater_id: String,
    pub rated_id: String,
    /// 1 to 5.
    pub score: u8,
    pub reason: Option<String>,
    /// System-generated (late-cancellation penalty) rather than user-submitted.
    pub is_auto_generated: bool,
    pub created_at: DateTime<Utc>,
}

/// Parameters for inserting a rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRating {
    pub visit_id: VisitId,
    pub rater_id: String,
    pub rated_id: String,
    pub score: u8,
    pub reason: Option<String>,
    pub is_auto_generated: bool,
}
