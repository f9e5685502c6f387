//! Error types for the ceremony service.
//!
//! Only [`TriggerError`] ever reaches a trigger caller. Datastore and
//! telemetry failures are absorbed on the critical path and surface only
//! through the administrative endpoints.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by trigger resolution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TriggerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No video could be resolved for card {0}")]
    NoVideoResolvable(String),
}

/// Errors raised by a datastore implementation
#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Datastore timed out after {0:?}")]
    Timeout(Duration),

    #[error("Datastore unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while loading the rule/video caches
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to load cache contents: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("Rule {rule_id} has malformed conditions: {reason}")]
    MalformedRule { rule_id: i64, reason: String },
}

/// Errors raised by trigger telemetry
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Trigger event {0} not found")]
    TriggerNotFound(Uuid),

    #[error("Failed to persist telemetry: {0}")]
    Datastore(#[from] DatastoreError),
}
