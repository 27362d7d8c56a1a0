//! Shared type aliases used across all mediakeep crates.

use chrono::{DateTime, Utc};

/// Opaque unique job identifier (uuid v4, stored as text).
pub type JobId = String;

/// Canonical timestamp type: UTC, serialized as ISO-8601 via chrono's serde.
pub type Timestamp = DateTime<Utc>;

/// Generate a fresh [`JobId`].
pub fn new_job_id() -> JobId {
    uuid::Uuid::new_v4().to_string()
}
