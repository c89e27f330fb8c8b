//! Online visit operations against the in-memory remote store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use visitq::clock::ManualClock;
use visitq::error::{Error, RetryClass};
use visitq::geofence::GeoPoint;
use visitq::model::{Actor, Proof, Visit, VisitId, VisitStatus};
use visitq::notify::{Dispatcher, Notification, Notifier, NotifyTarget};
use visitq::policy::{AUTO_RATING_SCORE, DEFAULT_AUTO_RATING_REASON, PolicyConfig};
use visitq::remote::MemoryStore;
use visitq::remote::memory::StoreOp;
use visitq::service::{CancelOutcome, VisitService};

const SITE: GeoPoint = GeoPoint {
    lat: 40.7128,
    lon: -74.0060,
};

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> visitq::error::Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _: &Notification) -> visitq::error::Result<()> {
        Err(Error::transient("push service unavailable"))
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    service: VisitService,
}

fn now() -> DateTime<Utc> {
    "2026-05-04T14:00:00Z".parse().unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(now()));
    let notifier = Arc::new(RecordingNotifier::default());
    let dispatcher = Arc::new(Dispatcher::new(notifier.clone(), Duration::from_secs(1)));
    let service = VisitService::new(
        store.clone(),
        dispatcher,
        clock.clone(),
        PolicyConfig::default(),
    );
    Harness {
        store,
        clock,
        notifier,
        service,
    }
}

/// A scheduled visit for caregiver `cg-1` and care recipient `elder-1`,
/// starting `minutes` from now. The care recipient is linked to `user-elder-1`.
fn schedule(h: &Harness, minutes: i64) -> VisitId {
    let start = now() + ChronoDuration::minutes(minutes);
    let visit = Visit::scheduled("agency-1", "cg-1", "elder-1", start, start + ChronoDuration::hours(2))
        .with_site(SITE)
        .with_qr_token("qr-elder-1");
    h.store.link_user("elder-1", "user-elder-1");
    h.store.insert_visit(visit)
}

fn caregiver() -> Actor {
    Actor::caregiver("cg-1")
}

fn at_site() -> Proof {
    Proof::gps(SITE.lat, SITE.lon)
}

#[tokio::test]
async fn caregiver_late_cancellation_penalizes_once_and_notifies() {
    let h = harness();
    let id = schedule(&h, 10);

    let outcome = h.service.cancel_visit(id, &caregiver()).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome {
            status: VisitStatus::CancelledLate,
            was_late: true
        }
    );
    assert_eq!(h.store.visit(id).unwrap().status, VisitStatus::CancelledLate);

    let ratings = h.store.ratings_for(id);
    assert_eq!(ratings.len(), 1);
    let rating = &ratings[0];
    assert_eq!(rating.score, AUTO_RATING_SCORE);
    assert_eq!(rating.rated_id, "cg-1");
    assert_eq!(rating.rater_id, "user-elder-1");
    assert!(rating.is_auto_generated);
    assert_eq!(rating.reason.as_deref(), Some(DEFAULT_AUTO_RATING_REASON));

    h.service.dispatcher().flush().await;
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, NotifyTarget::Elder("elder-1".into()));
    assert_eq!(sent[0].data["late"], true);

    // Re-running the same cancellation changes nothing.
    let again = h.service.cancel_visit(id, &caregiver()).await.unwrap();
    assert_eq!(again, outcome);
    assert_eq!(h.store.ratings_for(id).len(), 1);
    h.service.dispatcher().flush().await;
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn caregiver_on_time_cancellation_is_not_penalized() {
    let h = harness();
    let id = schedule(&h, 45);

    let outcome = h.service.cancel_visit(id, &caregiver()).await.unwrap();
    assert_eq!(outcome.status, VisitStatus::Cancelled);
    assert!(!outcome.was_late);
    assert!(h.store.ratings_for(id).is_empty());

    h.service.dispatcher().flush().await;
    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].target, NotifyTarget::Elder("elder-1".into()));
    assert_eq!(sent[0].data["late"], false);
}

#[tokio::test]
async fn care_recipient_cancellation_never_penalizes() {
    for minutes in [-5, 0, 5, 60] {
        let h = harness();
        let id = schedule(&h, minutes);

        let outcome = h
            .service
            .cancel_visit(id, &Actor::care_recipient("user-elder-1"))
            .await
            .unwrap();
        assert_eq!(outcome.status, VisitStatus::Cancelled, "at {minutes} minutes");
        assert!(!outcome.was_late);
        assert!(h.store.ratings_for(id).is_empty(), "at {minutes} minutes");

        h.service.dispatcher().flush().await;
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, NotifyTarget::User("cg-1".into()));
    }
}

#[tokio::test]
async fn late_cancellation_without_linked_user_commits_nothing() {
    let h = harness();
    let start = now() + ChronoDuration::minutes(10);
    let id = h.store.insert_visit(Visit::scheduled(
        "agency-1",
        "cg-1",
        "elder-unlinked",
        start,
        start + ChronoDuration::hours(1),
    ));

    let err = h.service.cancel_visit(id, &caregiver()).await.unwrap_err();
    assert!(matches!(err, Error::LinkedUserNotFound(ref who) if who == "elder-unlinked"));
    assert!(err.is_not_found());
    assert_eq!(h.store.visit(id).unwrap().status, VisitStatus::Scheduled);
    assert!(h.store.ratings_for(id).is_empty());
}

#[tokio::test]
async fn rating_write_failure_is_repaired_on_retry() {
    let h = harness();
    let id = schedule(&h, 10);
    h.store.fail_next(StoreOp::InsertRating, 1, RetryClass::Transient);

    let err = h.service.cancel_visit(id, &caregiver()).await.unwrap_err();
    assert_eq!(err.retry_class(), RetryClass::Transient);
    assert_eq!(h.store.visit(id).unwrap().status, VisitStatus::CancelledLate);
    assert!(h.store.ratings_for(id).is_empty());

    let outcome = h.service.cancel_visit(id, &caregiver()).await.unwrap();
    assert_eq!(outcome.status, VisitStatus::CancelledLate);
    assert!(outcome.was_late);
    assert_eq!(h.store.ratings_for(id).len(), 1);

    h.service.cancel_visit(id, &caregiver()).await.unwrap();
    assert_eq!(h.store.ratings_for(id).len(), 1);

    // Announced once, when the status committed.
    h.service.dispatcher().flush().await;
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn repeated_check_in_keeps_the_first_start_time() {
    let h = harness();
    let id = schedule(&h, 0);

    let first = h.service.check_in(id, &caregiver(), at_site()).await.unwrap();
    assert_eq!(first.status, VisitStatus::CheckedIn);
    assert_eq!(first.actual_start, Some(now()));
    assert_eq!(first.check_in_location, Some(SITE));

    h.clock.advance(ChronoDuration::minutes(5));
    let second = h.service.check_in(id, &caregiver(), at_site()).await.unwrap();
    assert_eq!(second.status, VisitStatus::CheckedIn);
    assert_eq!(second.actual_start, Some(now()));

    h.service.dispatcher().flush().await;
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn full_visit_runs_to_completion() {
    let h = harness();
    let id = schedule(&h, 0);
    let cg = caregiver();

    h.service.check_in(id, &cg, at_site()).await.unwrap();
    h.service.start_visit(id, &cg).await.unwrap();
    h.clock.advance(ChronoDuration::hours(2));
    let visit = h.service.check_out(id, &cg, at_site()).await.unwrap();
    assert_eq!(visit.status, VisitStatus::CheckedOut);
    assert_eq!(visit.actual_end, Some(now() + ChronoDuration::hours(2)));

    let visit = h.service.complete(id, &cg).await.unwrap();
    assert_eq!(visit.status, VisitStatus::Completed);
    assert_eq!(visit.actual_start, Some(now()));
}

#[tokio::test]
async fn terminal_visits_reject_transitions_and_stay_unchanged() {
    for terminal in [VisitStatus::Completed, VisitStatus::Cancelled] {
        let h = harness();
        let id = schedule(&h, 0);
        h.store.set_status(id, terminal);
        let before = h.store.visit(id).unwrap();

        let err = h
            .service
            .check_in(id, &caregiver(), at_site())
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::InvalidTransition { from, to: VisitStatus::CheckedIn } if from == terminal),
            "{terminal}: {err:?}"
        );
        assert_eq!(err.retry_class(), RetryClass::NotRetryable);
        assert_eq!(h.store.visit(id).unwrap(), before);
    }
}

#[tokio::test]
async fn check_in_away_from_the_site_is_rejected() {
    let h = harness();
    let id = schedule(&h, 0);

    let err = h
        .service
        .check_in(id, &caregiver(), Proof::gps(SITE.lat + 0.01, SITE.lon))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OutsideGeofence { .. }), "got {err:?}");
    assert_eq!(h.store.visit(id).unwrap().status, VisitStatus::Scheduled);

    let visit = h
        .service
        .check_in(
            id,
            &caregiver(),
            Proof::QrCode {
                token: "qr-elder-1".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(visit.status, VisitStatus::CheckedIn);
}

#[tokio::test]
async fn mark_unavailable_records_note_and_location() {
    let h = harness();
    let id = schedule(&h, 0);

    let visit = h
        .service
        .mark_unavailable(id, &caregiver(), "no answer at the door", Some(SITE))
        .await
        .unwrap();
    assert_eq!(visit.status, VisitStatus::ElderUnavailable);
    assert_eq!(visit.notes.as_deref(), Some("no answer at the door"));
    assert_eq!(visit.actual_start, Some(now()));
}

#[tokio::test]
async fn no_show_is_recorded_by_the_agency() {
    let h = harness();
    let id = schedule(&h, -60);

    let err = h.service.mark_no_show(id, &caregiver()).await.unwrap_err();
    assert!(matches!(err, Error::NotAuthorized(_)));

    let visit = h
        .service
        .mark_no_show(id, &Actor::agency_owner("owner-1"))
        .await
        .unwrap();
    assert_eq!(visit.status, VisitStatus::NoShow);
}

#[tokio::test]
async fn missing_visit_is_not_found() {
    let h = harness();
    let err = h
        .service
        .check_in(VisitId::new(), &caregiver(), at_site())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::VisitNotFound(_)));
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn slow_backend_times_out_as_transient() {
    let h = harness();
    let id = schedule(&h, 0);
    h.store.set_latency(Some(Duration::from_secs(30)));
    let service = h.service.with_remote_timeout(Duration::from_millis(100));

    let err = service.check_in(id, &caregiver(), at_site()).await.unwrap_err();
    assert_eq!(err.retry_class(), RetryClass::Transient);
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_operation() {
    let store = Arc::new(MemoryStore::new());
    let start = now() + ChronoDuration::minutes(10);
    let id = store.insert_visit(Visit::scheduled(
        "agency-1",
        "cg-1",
        "elder-1",
        start,
        start + ChronoDuration::hours(1),
    ));
    store.link_user("elder-1", "user-elder-1");
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(FailingNotifier), Duration::from_secs(1)));
    let service = VisitService::new(
        store.clone(),
        dispatcher,
        Arc::new(ManualClock::new(now())),
        PolicyConfig::default(),
    );

    let outcome = service.cancel_visit(id, &caregiver()).await.unwrap();
    service.dispatcher().flush().await;
    assert_eq!(outcome.status, VisitStatus::CancelledLate);
    assert_eq!(store.ratings_for(id).len(), 1);
}

#[tokio::test]
async fn status_changed_before_commit_is_replanned_once() {
    let h = harness();
    let id = schedule(&h, 0);
    h.service.check_in(id, &caregiver(), at_site()).await.unwrap();

    // Another device starts the visit between our read and our write.
    h.store.interleave_update(VisitStatus::InProgress);
    let visit = h.service.check_out(id, &caregiver(), at_site()).await.unwrap();

    assert_eq!(visit.status, VisitStatus::CheckedOut);
    assert_eq!(h.store.calls(StoreOp::GetVisit), 3);
    assert_eq!(h.store.calls(StoreOp::UpdateStatus), 3);
}

#[tokio::test]
async fn repeated_conflicts_are_reported_as_transient() {
    let h = harness();
    let id = schedule(&h, 0);
    h.service.check_in(id, &caregiver(), at_site()).await.unwrap();

    h.store.interleave_update(VisitStatus::InProgress);
    h.store.interleave_update(VisitStatus::CheckedIn);
    let err = h
        .service
        .check_out(id, &caregiver(), at_site())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::CommitFailed {
            retry: RetryClass::Transient,
            ..
        }
    ));
    assert_eq!(h.store.visit(id).unwrap().status, VisitStatus::CheckedIn);
    assert_eq!(h.store.calls(StoreOp::UpdateStatus), 3);
}

#[tokio::test(start_paused = true)]
async fn two_devices_racing_a_late_cancel_rate_once() {
    let h = harness();
    let id = schedule(&h, 10);
    h.store.set_latency(Some(Duration::from_millis(50)));

    let other_device = VisitService::new(
        h.store.clone(),
        h.service.dispatcher().clone(),
        h.clock.clone(),
        PolicyConfig::default(),
    );

    let (actor_a, actor_b) = (caregiver(), caregiver());
    let (a, b) = tokio::join!(
        h.service.cancel_visit(id, &actor_a),
        other_device.cancel_visit(id, &actor_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    for outcome in [a, b] {
        assert_eq!(outcome.status, VisitStatus::CancelledLate);
        assert!(outcome.was_late);
    }
    assert_eq!(h.store.calls(StoreOp::UpdateStatus), 2);
    assert_eq!(h.store.ratings_for(id).len(), 1);

    h.service.dispatcher().flush().await;
    assert_eq!(h.notifier.sent().len(), 1);
}
