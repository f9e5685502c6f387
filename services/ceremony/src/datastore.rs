//! The relational datastore the service reads rules from and writes
//! telemetry to.
//!
//! The schema is owned by the administrative side of the platform; this
//! service only reads `ceremony_videos`, `play_rules` and `members`, and
//! writes `trigger_events` and `daily_play_stats`.

use crate::error::DatastoreError;
use crate::models::{CeremonyVideo, DailyPlayStat, Member, PlayRule, TriggerEvent};
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

/// Operations the service needs from the relational store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// The single active default video, if one is configured
    async fn default_video(&self) -> Result<Option<CeremonyVideo>, DatastoreError>;

    /// All active rules whose bound video is also active, paired with that video
    async fn active_rules(&self) -> Result<Vec<(PlayRule, CeremonyVideo)>, DatastoreError>;

    /// The active member holding the given NFC card
    async fn member_by_card(&self, nfc_card_id: &str) -> Result<Option<Member>, DatastoreError>;

    /// Active videos among the given ids, ordered by id
    async fn videos_by_ids(&self, ids: &[i64]) -> Result<Vec<CeremonyVideo>, DatastoreError>;

    async fn insert_trigger_event(&self, event: &TriggerEvent) -> Result<(), DatastoreError>;

    /// Upsert the day's row for a video, adding one play
    async fn increment_daily_plays(
        &self,
        video_id: i64,
        date: NaiveDate,
    ) -> Result<(), DatastoreError>;

    async fn trigger_event(&self, id: Uuid) -> Result<Option<TriggerEvent>, DatastoreError>;

    /// Set the play duration and completion flag on an event not yet completed.
    ///
    /// Returns `false` if there is no such event or it is already completed.
    async fn update_trigger_completion(
        &self,
        id: Uuid,
        play_duration_ms: i64,
        completed: bool,
    ) -> Result<bool, DatastoreError>;

    /// Fold one completed play into the day's row in a single atomic step.
    ///
    /// Returns `None` if there is no row or it has no plays yet.
    async fn record_daily_completion(
        &self,
        video_id: i64,
        date: NaiveDate,
        duration_ms: i64,
    ) -> Result<Option<DailyPlayStat>, DatastoreError>;

    async fn daily_play_stat(
        &self,
        video_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailyPlayStat>, DatastoreError>;

    /// Minimal round-trip used by health checks
    async fn ping(&self) -> Result<(), DatastoreError>;
}
