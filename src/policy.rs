//! Cancellation and penalty policy.
//!
//! Care recipients may cancel at any time without penalty. A caregiver who
//! cancels inside the late window gets `cancelled_late` and one system
//! generated 1-star rating, attributed to the care recipient's linked user.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::geofence::DEFAULT_RADIUS_METERS;
use crate::model::{Role, VisitStatus};

/// Minutes before scheduled start inside which a caregiver cancellation is late.
pub const DEFAULT_LATE_CANCELLATION_MINUTES: i64 = 30;

/// Score of the rating recorded against a caregiver who cancels late.
pub const AUTO_RATING_SCORE: u8 = 1;

pub const DEFAULT_AUTO_RATING_REASON: &str = "Late cancellation by caregiver";

/// Business rules that are expected to change. Loaded from the policy file
/// when one is configured.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub late_cancellation_minutes: i64,
    pub geofence_radius_m: f64,
    pub auto_rating_reason: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            late_cancellation_minutes: DEFAULT_LATE_CANCELLATION_MINUTES,
            geofence_radius_m: DEFAULT_RADIUS_METERS,
            auto_rating_reason: DEFAULT_AUTO_RATING_REASON.to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn is_late(&self, scheduled_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        is_late_cancellation_within(scheduled_start, now, self.late_cancellation_minutes)
    }
}

/// Late iff fewer than the default threshold of minutes remain before start.
/// Past starts count as late.
pub fn is_late_cancellation(scheduled_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    is_late_cancellation_within(scheduled_start, now, DEFAULT_LATE_CANCELLATION_MINUTES)
}

pub fn is_late_cancellation_within(
    scheduled_start: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold_minutes: i64,
) -> bool {
    scheduled_start - now < Duration::minutes(threshold_minutes)
}

/// Which side of the visit is cancelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellingParty {
    Caregiver,
    CareRecipient,
}

impl CancellingParty {
    /// Agency owners cannot cancel through this path.
    pub fn from_role(role: Role) -> Option<Self> {
        match role {
            Role::Caregiver => Some(CancellingParty::Caregiver),
            Role::CareRecipient => Some(CancellingParty::CareRecipient),
            Role::AgencyOwner => None,
        }
    }
}

/// Who hears about a cancellation and how it is worded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationNotice {
    /// Tell the caregiver the care recipient cancelled.
    CaregiverRecipientCancelled,
    /// Tell the care recipient the caregiver cancelled in good time.
    RecipientStandard,
    /// Tell the care recipient the caregiver cancelled late.
    RecipientLate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationOutcome {
    pub status: VisitStatus,
    pub was_late: bool,
    /// Record the auto-generated rating against the caregiver.
    pub penalize: bool,
    pub notice: CancellationNotice,
}

/// Decide the resulting status, penalty and notice for a cancellation at `now`.
pub fn cancellation_outcome(
    policy: &PolicyConfig,
    party: CancellingParty,
    scheduled_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> CancellationOutcome {
    match party {
        CancellingParty::CareRecipient => CancellationOutcome {
            status: VisitStatus::Cancelled,
            was_late: false,
            penalize: false,
            notice: CancellationNotice::CaregiverRecipientCancelled,
        },
        CancellingParty::Caregiver if policy.is_late(scheduled_start, now) => {
            CancellationOutcome {
                status: VisitStatus::CancelledLate,
                was_late: true,
                penalize: true,
                notice: CancellationNotice::RecipientLate,
            }
        }
        CancellingParty::Caregiver => CancellationOutcome {
            status: VisitStatus::Cancelled,
            was_late: false,
            penalize: false,
            notice: CancellationNotice::RecipientStandard,
        },
    }
}
