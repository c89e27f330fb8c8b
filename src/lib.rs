//! # visitq
//!
//! Visit lifecycle and offline sync engine for home-care visit verification.
//!
//! Provides the visit state machine with geofenced check-in, the
//! cancellation and late-penalty policy, a durable SQLite mutation queue that
//! replays offline actions against the remote store, best-effort push
//! notifications, and OpenTelemetry observability.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod geofence;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod policy;
pub mod queue;
pub mod remote;
pub mod service;
pub mod telemetry;
