//! Online visit operations.
//!
//! Each operation reads the visit from the remote store, plans the change
//! with [`lifecycle::plan`], commits it with a guarded status update and then
//! fires the side effects: the late-cancellation rating (part of the
//! operation) and a notification (best-effort, after commit).
//!
//! Every operation is safe to repeat. A request already reflected in the
//! remote visit succeeds without writing, and the auto-rating is only ever
//! inserted once per visit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::geofence::GeoPoint;
use crate::lifecycle::{self, Plan, Transition};
use crate::model::{Actor, NewRating, Proof, TransitionRequest, Visit, VisitId, VisitStatus};
use crate::notify::{Dispatcher, Notification, NotifyTarget};
use crate::policy::{AUTO_RATING_SCORE, CancellationNotice, CancellationOutcome, PolicyConfig};
use crate::remote::{UpdateOutcome, VisitStore};
use crate::telemetry::metrics;

/// Default bound on a single remote call.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of [`VisitService::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    /// The visit as the remote store holds it afterwards.
    pub visit: Visit,
    /// Nothing was written because the visit already had the requested status.
    pub already_applied: bool,
    /// Present when this call committed a cancellation.
    pub cancellation: Option<CancellationOutcome>,
}

/// Result of [`VisitService::cancel_visit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    pub status: VisitStatus,
    pub was_late: bool,
}

pub struct VisitService {
    store: Arc<dyn VisitStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    policy: PolicyConfig,
    remote_timeout: Duration,
}

impl VisitService {
    pub fn new(
        store: Arc<dyn VisitStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            policy,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn check_in(&self, visit_id: VisitId, actor: &Actor, proof: Proof) -> Result<Visit> {
        let request = TransitionRequest::CheckIn {
            proof,
            at: self.clock.now(),
        };
        Ok(self.apply(visit_id, actor, &request).await?.visit)
    }

    pub async fn start_visit(&self, visit_id: VisitId, actor: &Actor) -> Result<Visit> {
        let request = TransitionRequest::StartVisit {
            at: self.clock.now(),
        };
        Ok(self.apply(visit_id, actor, &request).await?.visit)
    }

    pub async fn check_out(&self, visit_id: VisitId, actor: &Actor, proof: Proof) -> Result<Visit> {
        let request = TransitionRequest::CheckOut {
            proof,
            at: self.clock.now(),
        };
        Ok(self.apply(visit_id, actor, &request).await?.visit)
    }

    pub async fn complete(&self, visit_id: VisitId, actor: &Actor) -> Result<Visit> {
        let request = TransitionRequest::Complete {
            at: self.clock.now(),
        };
        Ok(self.apply(visit_id, actor, &request).await?.visit)
    }

    /// Cancel a scheduled visit. The actor's role decides whether the
    /// cancellation can be late and penalized.
    pub async fn cancel_visit(&self, visit_id: VisitId, actor: &Actor) -> Result<CancelOutcome> {
        let request = TransitionRequest::Cancel {
            at: self.clock.now(),
        };
        let applied = self.apply(visit_id, actor, &request).await?;
        let was_late = match applied.cancellation {
            Some(outcome) => outcome.was_late,
            None => applied.visit.status == VisitStatus::CancelledLate,
        };
        Ok(CancelOutcome {
            status: applied.visit.status,
            was_late,
        })
    }

    pub async fn mark_unavailable(
        &self,
        visit_id: VisitId,
        actor: &Actor,
        note: impl Into<String>,
        location: Option<GeoPoint>,
    ) -> Result<Visit> {
        let request = TransitionRequest::MarkUnavailable {
            note: note.into(),
            location,
            at: self.clock.now(),
        };
        Ok(self.apply(visit_id, actor, &request).await?.visit)
    }

    pub async fn mark_no_show(&self, visit_id: VisitId, actor: &Actor) -> Result<Visit> {
        let request = TransitionRequest::MarkNoShow {
            at: self.clock.now(),
        };
        Ok(self.apply(visit_id, actor, &request).await?.visit)
    }

    /// Apply a transition request against the current remote visit.
    ///
    /// The request's own timestamp is used for lateness and recorded times,
    /// so a replayed offline mutation is judged by when it was taken.
    pub async fn apply(
        &self,
        visit_id: VisitId,
        actor: &Actor,
        request: &TransitionRequest,
    ) -> Result<Applied> {
        let mut raced = false;
        loop {
            let visit = self.fetch(visit_id).await?;

            let transition = match lifecycle::plan(&visit, actor, request, &self.policy)? {
                Plan::AlreadyApplied(status) => {
                    if status == VisitStatus::CancelledLate {
                        self.ensure_penalty(&visit).await?;
                    }
                    return Ok(Applied {
                        visit,
                        already_applied: true,
                        cancellation: None,
                    });
                }
                Plan::Apply(transition) => transition,
            };

            // Resolve the rater before writing, so a missing link fails the
            // operation with nothing committed.
            let penalize = transition.cancellation.is_some_and(|c| c.penalize);
            let rater = if penalize {
                Some(self.linked_user(&visit).await?)
            } else {
                None
            };

            let outcome = self
                .remote(
                    "update_visit_status",
                    self.store.update_visit_status(
                        visit_id,
                        transition.from,
                        transition.to,
                        &transition.fields,
                    ),
                )
                .await?;

            match outcome {
                UpdateOutcome::Committed(updated) => {
                    info!(
                        visit_id = %visit_id,
                        from = %transition.from,
                        to = %transition.to,
                        actor = %actor.id,
                        role = %actor.role,
                        "visit transition"
                    );
                    metrics::visit_transitions().add(
                        1,
                        &[
                            KeyValue::new("from", transition.from.as_str()),
                            KeyValue::new("to", transition.to.as_str()),
                        ],
                    );

                    // The status is committed; announce it even if the
                    // rating write below fails and has to be repaired.
                    if let Some(notification) = notification_for(&updated, &transition) {
                        self.dispatcher.dispatch(notification);
                    }
                    if let Some(rater) = rater {
                        self.insert_penalty(&updated, rater).await?;
                    }

                    return Ok(Applied {
                        visit: updated,
                        already_applied: false,
                        cancellation: transition.cancellation,
                    });
                }
                UpdateOutcome::Conflict if !raced => {
                    warn!(
                        visit_id = %visit_id,
                        expected = %transition.from,
                        "visit changed under us; re-reading"
                    );
                    raced = true;
                }
                UpdateOutcome::Conflict => {
                    return Err(Error::transient(format!(
                        "visit {visit_id} kept changing during {}",
                        request.kind()
                    )));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Remote helpers
    // -----------------------------------------------------------------------

    async fn remote<T>(&self, op: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(format!(
                "{op} timed out after {} ms",
                self.remote_timeout.as_millis()
            ))),
        }
    }

    async fn fetch(&self, visit_id: VisitId) -> Result<Visit> {
        self.remote("get_visit", self.store.get_visit(visit_id))
            .await?
            .ok_or(Error::VisitNotFound(visit_id))
    }

    async fn linked_user(&self, visit: &Visit) -> Result<String> {
        self.remote(
            "get_linked_user_id",
            self.store.get_linked_user_id(&visit.care_recipient_id),
        )
        .await?
        .ok_or_else(|| Error::LinkedUserNotFound(visit.care_recipient_id.clone()))
    }

    async fn insert_penalty(&self, visit: &Visit, rater_id: String) -> Result<()> {
        let rating = NewRating {
            visit_id: visit.id,
            rater_id,
            rated_id: visit.caregiver_id.clone(),
            score: AUTO_RATING_SCORE,
            reason: Some(self.policy.auto_rating_reason.clone()),
            is_auto_generated: true,
        };
        self.remote("insert_rating", self.store.insert_rating(&rating))
            .await
            .inspect_err(|e| {
                warn!(visit_id = %visit.id, error = %e, "late-cancellation rating not recorded");
            })?;
        info!(visit_id = %visit.id, caregiver = %visit.caregiver_id, "late-cancellation rating recorded");
        Ok(())
    }

    /// Record the auto-rating for a late cancellation if an earlier attempt
    /// committed the status but not the rating.
    async fn ensure_penalty(&self, visit: &Visit) -> Result<()> {
        let existing = self
            .remote("find_auto_rating", self.store.find_auto_rating(visit.id))
            .await?;
        if existing.is_some() {
            debug!(visit_id = %visit.id, "auto-rating already present");
            return Ok(());
        }
        let rater = self.linked_user(visit).await?;
        self.insert_penalty(visit, rater).await
    }
}

impl std::fmt::Debug for VisitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitService")
            .field("policy", &self.policy)
            .field("remote_timeout", &self.remote_timeout)
            .finish_non_exhaustive()
    }
}

/// The notification for a committed transition, if it has one.
fn notification_for(visit: &Visit, transition: &Transition) -> Option<Notification> {
    let elder = || NotifyTarget::Elder(visit.care_recipient_id.clone());

    let (target, title, body, kind, late) = match (transition.to, transition.cancellation) {
        (VisitStatus::CheckedIn, _) => (
            elder(),
            "Caregiver checked in",
            "Your caregiver has arrived and checked in.",
            "check_in",
            false,
        ),
        (VisitStatus::CheckedOut, _) => (
            elder(),
            "Caregiver checked out",
            "Your caregiver has finished today's visit.",
            "check_out",
            false,
        ),
        (VisitStatus::ElderUnavailable, _) => (
            elder(),
            "Missed visit",
            "Your caregiver arrived but could not reach you.",
            "elder_unavailable",
            false,
        ),
        (_, Some(outcome)) => match outcome.notice {
            CancellationNotice::CaregiverRecipientCancelled => (
                NotifyTarget::User(visit.caregiver_id.clone()),
                "Visit cancelled",
                "The care recipient cancelled an upcoming visit.",
                "visit_cancelled",
                false,
            ),
            CancellationNotice::RecipientStandard => (
                elder(),
                "Visit cancelled",
                "Your caregiver cancelled an upcoming visit.",
                "visit_cancelled",
                false,
            ),
            CancellationNotice::RecipientLate => (
                elder(),
                "Late cancellation",
                "Your caregiver cancelled shortly before the visit was due to start.",
                "visit_cancelled",
                true,
            ),
        },
        _ => return None,
    };

    Some(Notification {
        target,
        title: title.to_string(),
        body: body.to_string(),
        data: json!({
            "type": kind,
            "visit_id": visit.id.to_string(),
            "late": late,
        }),
    })
}
