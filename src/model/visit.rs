//! The visit record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::geofence::GeoPoint;

// ---------------------------------------------------------------------------
// Visit
// ---------------------------------------------------------------------------

/// A scheduled care visit as known to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: VisitId,

    pub agency_id: String,
    pub caregiver_id: String,
    pub care_recipient_id: String,

    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,

    /// Set when the visit enters checked_in, in_progress or elder_unavailable.
    pub actual_start: Option<DateTime<Utc>>,
    /// Set when the visit enters checked_out or completed.
    pub actual_end: Option<DateTime<Utc>>,

    pub status: VisitStatus,

    pub check_in_method: Option<CheckInMethod>,
    pub check_in_location: Option<GeoPoint>,
    pub check_out_location: Option<GeoPoint>,

    /// Care recipient's home, when geocoded. Anchors the geofence check.
    pub site: Option<GeoPoint>,

    /// Token printed on the care recipient's QR card.
    pub qr_token: Option<String>,

    /// Free text recorded by the caregiver (unavailable notes, override reasons).
    pub notes: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl Visit {
    /// A freshly scheduled visit with no recorded activity.
    pub fn scheduled(
        agency_id: impl Into<String>,
        caregiver_id: impl Into<String>,
        care_recipient_id: impl Into<String>,
        scheduled_start: DateTime<Utc>,
        scheduled_end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: VisitId::new(),
            agency_id: agency_id.into(),
            caregiver_id: caregiver_id.into(),
            care_recipient_id: care_recipient_id.into(),
            scheduled_start,
            scheduled_end,
            actual_start: None,
            actual_end: None,
            status: VisitStatus::Scheduled,
            check_in_method: None,
            check_in_location: None,
            check_out_location: None,
            site: None,
            qr_token: None,
            notes: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_site(mut self, site: GeoPoint) -> Self {
        self.site = Some(site);
        self
    }

    pub fn with_qr_token(mut self, token: impl Into<String>) -> Self {
        self.qr_token = Some(token.into());
        self
    }

    /// Apply a committed status change and its fields together.
    ///
    /// Only stores call this, after their guard on the expected status
    /// has passed.
    pub fn apply(&mut self, status: VisitStatus, fields: &VisitFields, at: DateTime<Utc>) {
        self.status = status;
        if let Some(t) = fields.actual_start {
            self.actual_start = Some(t);
        }
        if let Some(t) = fields.actual_end {
            self.actual_end = Some(t);
        }
        if let Some(m) = fields.check_in_method {
            self.check_in_method = Some(m);
        }
        if let Some(p) = fields.check_in_location {
            self.check_in_location = Some(p);
        }
        if let Some(p) = fields.check_out_location {
            self.check_out_location = Some(p);
        }
        if let Some(ref n) = fields.notes {
            self.notes = Some(n.clone());
        }
        self.updated_at = at;
    }
}

/// Columns written alongside a status change. `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VisitFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_method: Option<CheckInMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_in_location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_out_location: Option<GeoPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Newtype for visit IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VisitId(pub Uuid);

impl VisitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VisitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VisitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for VisitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(VisitId)
            .map_err(|e| Error::Other(format!("invalid visit id {s}: {e}")))
    }
}

/// How presence was verified at check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInMethod {
    Gps,
    QrCode,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    /// Initial state, created by scheduling.
    Scheduled,
    /// Caregiver verified presence on site.
    CheckedIn,
    /// Task work has begun.
    InProgress,
    /// Caregiver left; post-visit steps outstanding.
    CheckedOut,
    /// Finalized. Terminal.
    Completed,
    /// Cancelled without penalty. Terminal.
    Cancelled,
    /// Cancelled by the caregiver inside the late window. Terminal.
    CancelledLate,
    /// Caregiver arrived, care recipient absent. Terminal.
    ElderUnavailable,
    /// Caregiver never checked in. Terminal.
    NoShow,
}

impl VisitStatus {
    pub const ALL: [VisitStatus; 9] = [
        VisitStatus::Scheduled,
        VisitStatus::CheckedIn,
        VisitStatus::InProgress,
        VisitStatus::CheckedOut,
        VisitStatus::Completed,
        VisitStatus::Cancelled,
        VisitStatus::CancelledLate,
        VisitStatus::ElderUnavailable,
        VisitStatus::NoShow,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: VisitStatus) -> bool {
        use VisitStatus::*;
        matches!(
            (self, to),
            (Scheduled, CheckedIn)
                | (Scheduled, Cancelled)
                | (Scheduled, CancelledLate)
                | (Scheduled, ElderUnavailable)
                | (Scheduled, NoShow)
                | (CheckedIn, InProgress)
                | (CheckedIn, CheckedOut)
                | (InProgress, CheckedOut)
                | (CheckedOut, Completed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VisitStatus::Completed
                | VisitStatus::Cancelled
                | VisitStatus::CancelledLate
                | VisitStatus::ElderUnavailable
                | VisitStatus::NoShow
        )
    }

    /// How far along the visit is. Terminal states share the top rank.
    pub fn progress(self) -> u8 {
        match self {
            VisitStatus::Scheduled => 0,
            VisitStatus::CheckedIn => 1,
            VisitStatus::InProgress => 2,
            VisitStatus::CheckedOut => 3,
            _ => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VisitStatus::Scheduled => "scheduled",
            VisitStatus::CheckedIn => "checked_in",
            VisitStatus::InProgress => "in_progress",
            VisitStatus::CheckedOut => "checked_out",
            VisitStatus::Completed => "completed",
            VisitStatus::Cancelled => "cancelled",
            VisitStatus::CancelledLate => "cancelled_late",
            VisitStatus::ElderUnavailable => "elder_unavailable",
            VisitStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VisitStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VisitStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown visit status: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transitions() {
        for from in VisitStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in VisitStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn scheduled_is_the_only_entry_to_cancellation() {
        for from in VisitStatus::ALL {
            let legal = from.can_transition_to(VisitStatus::Cancelled);
            assert_eq!(legal, from == VisitStatus::Scheduled, "{from} -> cancelled");
        }
    }

    #[test]
    fn check_out_reachable_from_checked_in_and_in_progress() {
        assert!(VisitStatus::CheckedIn.can_transition_to(VisitStatus::CheckedOut));
        assert!(VisitStatus::InProgress.can_transition_to(VisitStatus::CheckedOut));
        assert!(!VisitStatus::Scheduled.can_transition_to(VisitStatus::CheckedOut));
        assert!(!VisitStatus::Scheduled.can_transition_to(VisitStatus::Completed));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in VisitStatus::ALL {
            let parsed: VisitStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
        assert!("checkedin".parse::<VisitStatus>().is_err());
    }

    #[test]
    fn apply_sets_status_and_fields_together() {
        let now = Utc::now();
        let mut visit = Visit::scheduled("agency", "cg", "elder", now, now);
        let fields = VisitFields {
            actual_start: Some(now),
            check_in_method: Some(CheckInMethod::Gps),
            check_in_location: Some(GeoPoint::new(1.0, 2.0)),
            ..Default::default()
        };
        visit.apply(VisitStatus::CheckedIn, &fields, now);
        assert_eq!(visit.status, VisitStatus::CheckedIn);
        assert_eq!(visit.actual_start, Some(now));
        assert_eq!(visit.actual_end, None);
        assert_eq!(visit.check_in_method, Some(CheckInMethod::Gps));
    }
}
