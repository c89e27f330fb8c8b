//! Core data model.
//!
//! A visit is a scheduled block of care delivered by one caregiver to one
//! care recipient. Its status is current state, not a log, and changes only
//! through the lifecycle module. Pending mutations are the device-local
//! record of state changes that have not yet reached the remote store.

pub mod actor;
pub mod mutation;
pub mod rating;
pub mod transition;
pub mod visit;

pub use actor::{Actor, Role};
pub use mutation::{EnqueueResult, EntryState, NewMutation, PendingMutation};
pub use rating::{NewRating, Rating};
pub use transition::{MutationKind, Proof, TransitionRequest};
pub use visit::{CheckInMethod, Visit, VisitFields, VisitId, VisitStatus};
