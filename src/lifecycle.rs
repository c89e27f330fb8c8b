//! Visit state machine.
//!
//! Turns a requested transition into a plan against the visit's current
//! status: the guarded status change plus the fields written with it, or a
//! note that the request is already reflected in the visit. Planning is pure;
//! the service commits the plan with a compare-and-swap on the status.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geofence;
use crate::model::{
    Actor, MutationKind, Proof, Role, TransitionRequest, Visit, VisitFields, VisitStatus,
};
use crate::policy::{self, CancellationOutcome, CancellingParty, PolicyConfig};

/// A status change ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Status the commit is guarded on.
    pub from: VisitStatus,
    pub to: VisitStatus,
    pub fields: VisitFields,
    /// Present for cancellations.
    pub cancellation: Option<CancellationOutcome>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Apply(Transition),
    /// The visit already has the requested status; nothing to write.
    AlreadyApplied(VisitStatus),
}

/// Plan `request` by `actor` against `visit`.
///
/// Order of checks: authorization, idempotent re-submission, transition
/// legality, then proof of presence.
pub fn plan(
    visit: &Visit,
    actor: &Actor,
    request: &TransitionRequest,
    policy: &PolicyConfig,
) -> Result<Plan> {
    authorize(visit, actor, request.kind())?;

    if let Some(status) = already_applied(visit.status, request.kind()) {
        debug!(visit_id = %visit.id, %status, kind = %request.kind(), "transition already applied");
        return Ok(Plan::AlreadyApplied(status));
    }

    let from = visit.status;
    let transition = match request {
        TransitionRequest::CheckIn { proof, at } => {
            ensure_legal(from, VisitStatus::CheckedIn)?;
            verify_proof(visit, proof, policy)?;
            Transition {
                from,
                to: VisitStatus::CheckedIn,
                fields: VisitFields {
                    actual_start: Some(*at),
                    check_in_method: proof.method(),
                    check_in_location: proof.location(),
                    notes: override_note(proof),
                    ..Default::default()
                },
                cancellation: None,
            }
        }
        TransitionRequest::StartVisit { .. } => {
            ensure_legal(from, VisitStatus::InProgress)?;
            Transition {
                from,
                to: VisitStatus::InProgress,
                fields: VisitFields::default(),
                cancellation: None,
            }
        }
        TransitionRequest::CheckOut { proof, at } => {
            ensure_legal(from, VisitStatus::CheckedOut)?;
            verify_proof(visit, proof, policy)?;
            Transition {
                from,
                to: VisitStatus::CheckedOut,
                fields: VisitFields {
                    actual_end: Some(*at),
                    check_out_location: proof.location(),
                    notes: override_note(proof),
                    ..Default::default()
                },
                cancellation: None,
            }
        }
        TransitionRequest::Complete { .. } => {
            ensure_legal(from, VisitStatus::Completed)?;
            Transition {
                from,
                to: VisitStatus::Completed,
                fields: VisitFields::default(),
                cancellation: None,
            }
        }
        TransitionRequest::Cancel { at } => {
            let party = CancellingParty::from_role(actor.role).ok_or_else(|| {
                Error::NotAuthorized(format!("{} cannot cancel visits", actor.role))
            })?;
            let outcome = policy::cancellation_outcome(policy, party, visit.scheduled_start, *at);
            ensure_legal(from, outcome.status)?;
            Transition {
                from,
                to: outcome.status,
                fields: VisitFields::default(),
                cancellation: Some(outcome),
            }
        }
        TransitionRequest::MarkUnavailable { note, location, at } => {
            ensure_legal(from, VisitStatus::ElderUnavailable)?;
            Transition {
                from,
                to: VisitStatus::ElderUnavailable,
                fields: VisitFields {
                    actual_start: Some(*at),
                    check_in_location: *location,
                    notes: Some(note.clone()),
                    ..Default::default()
                },
                cancellation: None,
            }
        }
        TransitionRequest::MarkNoShow { .. } => {
            ensure_legal(from, VisitStatus::NoShow)?;
            Transition {
                from,
                to: VisitStatus::NoShow,
                fields: VisitFields::default(),
                cancellation: None,
            }
        }
    };

    Ok(Plan::Apply(transition))
}

/// Has the remote status moved past what a request of `kind` expects?
///
/// True when the visit is terminal or further along than every status the
/// request can start from. False when it is behind (the request's
/// precondition has not been reached yet).
pub fn is_superseded(current: VisitStatus, kind: MutationKind) -> bool {
    if current.is_terminal() {
        return true;
    }
    let latest_source = kind
        .source_statuses()
        .iter()
        .map(|s| s.progress())
        .max()
        .unwrap_or(0);
    current.progress() > latest_source
}

fn already_applied(current: VisitStatus, kind: MutationKind) -> Option<VisitStatus> {
    match kind.target_status() {
        Some(target) if target == current => Some(current),
        None if matches!(current, VisitStatus::Cancelled | VisitStatus::CancelledLate) => {
            Some(current)
        }
        _ => None,
    }
}

fn ensure_legal(from: VisitStatus, to: VisitStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

fn authorize(visit: &Visit, actor: &Actor, kind: MutationKind) -> Result<()> {
    let allowed = match (actor.role, kind) {
        (Role::AgencyOwner, MutationKind::Cancel) => false,
        (Role::AgencyOwner, _) => true,
        (Role::Caregiver, MutationKind::MarkNoShow) => false,
        (Role::Caregiver, _) => actor.id == visit.caregiver_id,
        (Role::CareRecipient, MutationKind::Cancel) => true,
        (Role::CareRecipient, _) => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::NotAuthorized(format!(
            "{} {} may not {kind} visit {}",
            actor.role, actor.id, visit.id
        )))
    }
}

fn verify_proof(visit: &Visit, proof: &Proof, policy: &PolicyConfig) -> Result<()> {
    match proof {
        Proof::Gps { lat, lon } => {
            let Some(site) = visit.site else {
                warn!(visit_id = %visit.id, "visit has no site coordinates; recording location unverified");
                return Ok(());
            };
            if geofence::within_radius(*lat, *lon, site.lat, site.lon, policy.geofence_radius_m) {
                Ok(())
            } else {
                Err(Error::OutsideGeofence {
                    distance_m: geofence::distance_meters(*lat, *lon, site.lat, site.lon),
                    radius_m: policy.geofence_radius_m,
                })
            }
        }
        Proof::QrCode { token } => match visit.qr_token {
            Some(ref expected) if expected == token => Ok(()),
            Some(_) => Err(Error::InvalidProof("QR code does not match this visit".into())),
            None => Err(Error::InvalidProof("visit has no QR code on file".into())),
        },
        Proof::Override { reason } => {
            if reason.trim().is_empty() {
                return Err(Error::InvalidProof("override requires a reason".into()));
            }
            warn!(visit_id = %visit.id, %reason, "presence verification overridden");
            Ok(())
        }
    }
}

fn override_note(proof: &Proof) -> Option<String> {
    match proof {
        Proof::Override { reason } => Some(format!("verification override: {reason}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::GeoPoint;
    use chrono::{DateTime, Duration, Utc};

    fn now() -> DateTime<Utc> {
        "2026-05-04T14:00:00Z".parse().unwrap()
    }

    fn visit_in(minutes: i64) -> Visit {
        let start = now() + Duration::minutes(minutes);
        Visit::scheduled("agency-1", "cg-1", "elder-1", start, start + Duration::hours(2))
            .with_site(GeoPoint::new(40.0, -75.0))
            .with_qr_token("qr-abc")
    }

    fn check_in_gps(lat: f64, lon: f64) -> TransitionRequest {
        TransitionRequest::CheckIn {
            proof: Proof::gps(lat, lon),
            at: now(),
        }
    }

    fn expect_apply(plan: Plan) -> Transition {
        match plan {
            Plan::Apply(t) => t,
            other => panic!("expected Apply, got {other:?}"),
        }
    }

    #[test]
    fn check_in_within_geofence_sets_start_and_location() {
        let visit = visit_in(0);
        let t = expect_apply(
            plan(
                &visit,
                &Actor::caregiver("cg-1"),
                &check_in_gps(40.0005, -75.0),
                &PolicyConfig::default(),
            )
            .unwrap(),
        );
        assert_eq!(t.from, VisitStatus::Scheduled);
        assert_eq!(t.to, VisitStatus::CheckedIn);
        assert_eq!(t.fields.actual_start, Some(now()));
        assert_eq!(t.fields.actual_end, None);
        assert_eq!(t.fields.check_in_location, Some(GeoPoint::new(40.0005, -75.0)));
    }

    #[test]
    fn check_in_outside_geofence_is_rejected() {
        let visit = visit_in(0);
        let err = plan(
            &visit,
            &Actor::caregiver("cg-1"),
            &check_in_gps(40.01, -75.0),
            &PolicyConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::OutsideGeofence { .. }), "got {err:?}");
    }

    #[test]
    fn qr_token_must_match() {
        let visit = visit_in(0);
        let actor = Actor::caregiver("cg-1");
        let good = TransitionRequest::CheckIn {
            proof: Proof::QrCode {
                token: "qr-abc".into(),
            },
            at: now(),
        };
        let bad = TransitionRequest::CheckIn {
            proof: Proof::QrCode {
                token: "qr-xyz".into(),
            },
            at: now(),
        };
        let t = expect_apply(plan(&visit, &actor, &good, &PolicyConfig::default()).unwrap());
        assert_eq!(t.fields.check_in_method, Some(crate::model::CheckInMethod::QrCode));
        assert!(matches!(
            plan(&visit, &actor, &bad, &PolicyConfig::default()),
            Err(Error::InvalidProof(_))
        ));
    }

    #[test]
    fn another_caregiver_cannot_check_in() {
        let visit = visit_in(0);
        let err = plan(
            &visit,
            &Actor::caregiver("cg-2"),
            &check_in_gps(40.0, -75.0),
            &PolicyConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotAuthorized(_)));
    }

    #[test]
    fn repeated_check_in_is_already_applied() {
        let mut visit = visit_in(0);
        visit.status = VisitStatus::CheckedIn;
        let p = plan(
            &visit,
            &Actor::caregiver("cg-1"),
            &check_in_gps(40.0, -75.0),
            &PolicyConfig::default(),
        )
        .unwrap();
        assert_eq!(p, Plan::AlreadyApplied(VisitStatus::CheckedIn));
    }

    #[test]
    fn terminal_visits_reject_other_transitions() {
        let actor = Actor::agency_owner("owner-1");
        for terminal in [VisitStatus::Completed, VisitStatus::Cancelled] {
            let mut visit = visit_in(0);
            visit.status = terminal;
            for request in [
                check_in_gps(40.0, -75.0),
                TransitionRequest::StartVisit { at: now() },
                TransitionRequest::CheckOut {
                    proof: Proof::gps(40.0, -75.0),
                    at: now(),
                },
                TransitionRequest::MarkNoShow { at: now() },
            ] {
                let err = plan(&visit, &actor, &request, &PolicyConfig::default()).unwrap_err();
                assert!(
                    matches!(err, Error::InvalidTransition { from, .. } if from == terminal),
                    "{terminal}: {err:?}"
                );
            }
        }
    }

    #[test]
    fn cancel_on_completed_visit_is_invalid() {
        let mut visit = visit_in(60);
        visit.status = VisitStatus::Completed;
        let err = plan(
            &visit,
            &Actor::caregiver("cg-1"),
            &TransitionRequest::Cancel { at: now() },
            &PolicyConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[test]
    fn caregiver_cancel_inside_window_plans_late_cancellation() {
        let visit = visit_in(10);
        let t = expect_apply(
            plan(
                &visit,
                &Actor::caregiver("cg-1"),
                &TransitionRequest::Cancel { at: now() },
                &PolicyConfig::default(),
            )
            .unwrap(),
        );
        assert_eq!(t.to, VisitStatus::CancelledLate);
        assert!(t.cancellation.unwrap().penalize);
    }

    #[test]
    fn mark_unavailable_records_start_and_note() {
        let visit = visit_in(0);
        let t = expect_apply(
            plan(
                &visit,
                &Actor::caregiver("cg-1"),
                &TransitionRequest::MarkUnavailable {
                    note: "nobody answered".into(),
                    location: Some(GeoPoint::new(40.0, -75.0)),
                    at: now(),
                },
                &PolicyConfig::default(),
            )
            .unwrap(),
        );
        assert_eq!(t.to, VisitStatus::ElderUnavailable);
        assert_eq!(t.fields.actual_start, Some(now()));
        assert_eq!(t.fields.notes.as_deref(), Some("nobody answered"));
    }

    #[test]
    fn superseded_versus_behind() {
        // A cancel queued before someone else checked the visit in.
        assert!(is_superseded(VisitStatus::CheckedIn, MutationKind::Cancel));
        // A check-out waiting on its check-in is behind, not superseded.
        assert!(!is_superseded(VisitStatus::Scheduled, MutationKind::CheckOut));
        assert!(is_superseded(VisitStatus::CheckedOut, MutationKind::CheckIn));
        assert!(is_superseded(VisitStatus::Completed, MutationKind::CheckOut));
        assert!(!is_superseded(VisitStatus::InProgress, MutationKind::CheckOut));
    }

    #[test]
    fn check_in_on_the_geofence_boundary_is_accepted() {
        let visit = visit_in(0);
        let distance = geofence::distance_meters(40.001, -75.0, 40.0, -75.0);
        let at_edge = PolicyConfig {
            geofence_radius_m: distance,
            ..Default::default()
        };
        assert!(matches!(
            plan(&visit, &Actor::caregiver("cg-1"), &check_in_gps(40.001, -75.0), &at_edge),
            Ok(Plan::Apply(_))
        ));

        let short_radius = PolicyConfig {
            geofence_radius_m: distance - 0.5,
            ..Default::default()
        };
        match plan(&visit, &Actor::caregiver("cg-1"), &check_in_gps(40.001, -75.0), &short_radius) {
            Err(Error::OutsideGeofence { distance_m, radius_m }) => {
                assert_eq!(distance_m, distance);
                assert_eq!(radius_m, distance - 0.5);
            }
            other => panic!("expected OutsideGeofence, got {other:?}"),
        }
    }
}
