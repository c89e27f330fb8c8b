//! Requested visit transitions. Also the payload of a queued mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CheckInMethod, VisitStatus};
use crate::error::Error;
use crate::geofence::GeoPoint;

/// Evidence of presence offered at check-in or check-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Proof {
    Gps { lat: f64, lon: f64 },
    QrCode { token: String },
    /// Explicit override by the caller, e.g. GPS unavailable indoors.
    Override { reason: String },
}

impl Proof {
    pub fn gps(lat: f64, lon: f64) -> Self {
        Proof::Gps { lat, lon }
    }

    pub fn location(&self) -> Option<GeoPoint> {
        match self {
            Proof::Gps { lat, lon } => Some(GeoPoint::new(*lat, *lon)),
            _ => None,
        }
    }

    pub fn method(&self) -> Option<CheckInMethod> {
        match self {
            Proof::Gps { .. } => Some(CheckInMethod::Gps),
            Proof::QrCode { .. } => Some(CheckInMethod::QrCode),
            Proof::Override { .. } => None,
        }
    }
}

/// A state change requested by an actor. `at` is the device clock reading
/// when the actor took the action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionRequest {
    CheckIn {
        proof: Proof,
        at: DateTime<Utc>,
    },
    StartVisit {
        at: DateTime<Utc>,
    },
    CheckOut {
        proof: Proof,
        at: DateTime<Utc>,
    },
    Complete {
        at: DateTime<Utc>,
    },
    Cancel {
        at: DateTime<Utc>,
    },
    MarkUnavailable {
        note: String,
        location: Option<GeoPoint>,
        at: DateTime<Utc>,
    },
    MarkNoShow {
        at: DateTime<Utc>,
    },
}

impl TransitionRequest {
    pub fn kind(&self) -> MutationKind {
        match self {
            TransitionRequest::CheckIn { .. } => MutationKind::CheckIn,
            TransitionRequest::StartVisit { .. } => MutationKind::StartVisit,
            TransitionRequest::CheckOut { .. } => MutationKind::CheckOut,
            TransitionRequest::Complete { .. } => MutationKind::Complete,
            TransitionRequest::Cancel { .. } => MutationKind::Cancel,
            TransitionRequest::MarkUnavailable { .. } => MutationKind::MarkUnavailable,
            TransitionRequest::MarkNoShow { .. } => MutationKind::MarkNoShow,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TransitionRequest::CheckIn { at, .. }
            | TransitionRequest::StartVisit { at }
            | TransitionRequest::CheckOut { at, .. }
            | TransitionRequest::Complete { at }
            | TransitionRequest::Cancel { at }
            | TransitionRequest::MarkUnavailable { at, .. }
            | TransitionRequest::MarkNoShow { at } => *at,
        }
    }

    /// Same kind with the same proof, note and location. The device
    /// timestamp is not compared.
    pub fn same_action(&self, other: &TransitionRequest) -> bool {
        use TransitionRequest::*;
        match (self, other) {
            (CheckIn { proof: a, .. }, CheckIn { proof: b, .. })
            | (CheckOut { proof: a, .. }, CheckOut { proof: b, .. }) => a == b,
            (
                MarkUnavailable {
                    note: a,
                    location: at_a,
                    ..
                },
                MarkUnavailable {
                    note: b,
                    location: at_b,
                    ..
                },
            ) => a == b && at_a == at_b,
            _ => self.kind() == other.kind(),
        }
    }
}

/// Kind of queued mutation. Used for dedup and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CheckIn,
    StartVisit,
    CheckOut,
    Complete,
    Cancel,
    MarkUnavailable,
    MarkNoShow,
}

impl MutationKind {
    /// Statuses this kind of request expects to find the visit in.
    pub fn source_statuses(self) -> &'static [VisitStatus] {
        match self {
            MutationKind::CheckIn
            | MutationKind::Cancel
            | MutationKind::MarkUnavailable
            | MutationKind::MarkNoShow => &[VisitStatus::Scheduled],
            MutationKind::StartVisit => &[VisitStatus::CheckedIn],
            MutationKind::CheckOut => &[VisitStatus::CheckedIn, VisitStatus::InProgress],
            MutationKind::Complete => &[VisitStatus::CheckedOut],
        }
    }

    /// The status this kind produces. Cancellation resolves to `cancelled`
    /// or `cancelled_late` only once the policy has been consulted.
    pub fn target_status(self) -> Option<VisitStatus> {
        match self {
            MutationKind::CheckIn => Some(VisitStatus::CheckedIn),
            MutationKind::StartVisit => Some(VisitStatus::InProgress),
            MutationKind::CheckOut => Some(VisitStatus::CheckedOut),
            MutationKind::Complete => Some(VisitStatus::Completed),
            MutationKind::Cancel => None,
            MutationKind::MarkUnavailable => Some(VisitStatus::ElderUnavailable),
            MutationKind::MarkNoShow => Some(VisitStatus::NoShow),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::CheckIn => "check_in",
            MutationKind::StartVisit => "start_visit",
            MutationKind::CheckOut => "check_out",
            MutationKind::Complete => "complete",
            MutationKind::Cancel => "cancel",
            MutationKind::MarkUnavailable => "mark_unavailable",
            MutationKind::MarkNoShow => "mark_no_show",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MutationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_in" => Ok(MutationKind::CheckIn),
            "start_visit" => Ok(MutationKind::StartVisit),
            "check_out" => Ok(MutationKind::CheckOut),
            "complete" => Ok(MutationKind::Complete),
            "cancel" => Ok(MutationKind::Cancel),
            "mark_unavailable" => Ok(MutationKind::MarkUnavailable),
            "mark_no_show" => Ok(MutationKind::MarkNoShow),
            _ => Err(Error::Other(format!("unknown mutation kind: {s}"))),
        }
    }
}
