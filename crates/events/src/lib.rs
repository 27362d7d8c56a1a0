//! Job event bus for the mediakeep background execution engine (PRD-23).
//!
//! This crate provides the delivery half of the engine's observability:
//!
//! - [`JobEvent`] — the canonical `{event_type, timestamp, payload}`
//!   envelope handed to the broadcast sink.
//! - [`JobEventBus`] — forwards lifecycle events synchronously and
//!   debounces high-frequency progress updates per job.
//! - [`ProgressUpdate`] — the per-job progress snapshot that gets coalesced.
//!
//! The broadcast sink is pluggable: the API process installs a closure that
//! fans events out to its WebSocket clients; tests install a recorder.

pub mod bus;
pub mod progress;

pub use bus::{BroadcastFn, JobEvent, JobEventBus};
pub use progress::{ProgressUpdate, DEBOUNCE_INTERVAL};
