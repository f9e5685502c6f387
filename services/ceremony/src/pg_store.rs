use crate::config::DatabaseConfig;
use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::models::{CeremonyVideo, DailyPlayStat, Member, PlayRule, TriggerEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A rule joined with its bound video, as returned by the rule query
#[derive(Debug, FromRow)]
struct RuleVideoRow {
    rule_id: i64,
    rule_type: String,
    conditions: serde_json::Value,
    priority: i32,
    rule_is_active: bool,
    video_id: i64,
    title: String,
    file_url: String,
    duration_seconds: i32,
    thumbnail_url: Option<String>,
    file_size_bytes: i64,
    is_default: bool,
    video_is_active: bool,
}

impl RuleVideoRow {
    fn into_parts(self) -> (PlayRule, CeremonyVideo) {
        let rule = PlayRule {
            id: self.rule_id,
            rule_type: self.rule_type,
            conditions: self.conditions,
            priority: self.priority,
            video_id: self.video_id,
            is_active: self.rule_is_active,
        };
        let video = CeremonyVideo {
            id: self.video_id,
            title: self.title,
            file_url: self.file_url,
            duration_seconds: self.duration_seconds,
            thumbnail_url: self.thumbnail_url,
            file_size_bytes: self.file_size_bytes,
            is_default: self.is_default,
            is_active: self.video_is_active,
        };
        (rule, video)
    }
}

/// PostgreSQL-backed datastore
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    /// Create a new datastore with a connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    #[instrument(skip(self))]
    async fn default_video(&self) -> Result<Option<CeremonyVideo>, DatastoreError> {
        let video = sqlx::query_as::<_, CeremonyVideo>(
            r#"
            SELECT id, title, file_url, duration_seconds, thumbnail_url,
                   file_size_bytes, is_default, is_active
            FROM ceremony_videos
            WHERE is_default = TRUE AND is_active = TRUE
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(video)
    }

    #[instrument(skip(self))]
    async fn active_rules(&self) -> Result<Vec<(PlayRule, CeremonyVideo)>, DatastoreError> {
        let rows = sqlx::query_as::<_, RuleVideoRow>(
            r#"
            SELECT r.id AS rule_id, r.rule_type, r.conditions, r.priority,
                   r.is_active AS rule_is_active,
                   v.id AS video_id, v.title, v.file_url, v.duration_seconds,
                   v.thumbnail_url, v.file_size_bytes, v.is_default,
                   v.is_active AS video_is_active
            FROM play_rules r
            JOIN ceremony_videos v ON v.id = r.video_id
            WHERE r.is_active = TRUE AND v.is_active = TRUE
            ORDER BY r.priority DESC, r.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        debug!(rule_count = rows.len(), "Loaded active play rules");

        Ok(rows.into_iter().map(RuleVideoRow::into_parts).collect())
    }

    #[instrument(skip(self))]
    async fn member_by_card(&self, nfc_card_id: &str) -> Result<Option<Member>, DatastoreError> {
        let member = sqlx::query_as::<_, Member>(
            r#"
            SELECT id, name, industry, member_type, nfc_card_id, is_active
            FROM members
            WHERE nfc_card_id = $1 AND is_active = TRUE
            "#,
        )
        .bind(nfc_card_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(member)
    }

    #[instrument(skip(self))]
    async fn videos_by_ids(&self, ids: &[i64]) -> Result<Vec<CeremonyVideo>, DatastoreError> {
        let videos = sqlx::query_as::<_, CeremonyVideo>(
            r#"
            SELECT id, title, file_url, duration_seconds, thumbnail_url,
                   file_size_bytes, is_default, is_active
            FROM ceremony_videos
            WHERE id = ANY($1) AND is_active = TRUE
            ORDER BY id ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(videos)
    }

    #[instrument(skip(self, event), fields(trigger_id = %event.id, video_id = event.video_id))]
    async fn insert_trigger_event(&self, event: &TriggerEvent) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO trigger_events (
                id, nfc_card_id, member_id, video_id, rule_id,
                response_time_ms, device_info, trigger_time,
                play_duration_ms, is_completed
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8,
                $9, $10
            )
            "#,
        )
        .bind(event.id)
        .bind(&event.nfc_card_id)
        .bind(event.member_id)
        .bind(event.video_id)
        .bind(event.rule_id)
        .bind(event.response_time_ms)
        .bind(&event.device_info)
        .bind(event.trigger_time)
        .bind(event.play_duration_ms)
        .bind(event.is_completed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_daily_plays(
        &self,
        video_id: i64,
        date: NaiveDate,
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_play_stats (
                video_id, date, play_count, completion_rate, total_duration_ms
            ) VALUES ($1, $2, 1, 0, 0)
            ON CONFLICT (video_id, date)
            DO UPDATE SET play_count = daily_play_stats.play_count + 1
            "#,
        )
        .bind(video_id)
        .bind(date)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn trigger_event(&self, id: Uuid) -> Result<Option<TriggerEvent>, DatastoreError> {
        let event = sqlx::query_as::<_, TriggerEvent>(
            r#"
            SELECT id, nfc_card_id, member_id, video_id, rule_id,
                   response_time_ms, device_info, trigger_time,
                   play_duration_ms, is_completed
            FROM trigger_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    #[instrument(skip(self))]
    async fn update_trigger_completion(
        &self,
        id: Uuid,
        play_duration_ms: i64,
        completed: bool,
    ) -> Result<bool, DatastoreError> {
        let result = sqlx::query(
            r#"
            UPDATE trigger_events
            SET play_duration_ms = $2, is_completed = $3
            WHERE id = $1 AND is_completed = FALSE
            "#,
        )
        .bind(id)
        .bind(play_duration_ms)
        .bind(completed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn record_daily_completion(
        &self,
        video_id: i64,
        date: NaiveDate,
        duration_ms: i64,
    ) -> Result<Option<DailyPlayStat>, DatastoreError> {
        // Read and write of the rate happen in one statement
        let stat = sqlx::query_as::<_, DailyPlayStat>(
            r#"
            UPDATE daily_play_stats
            SET completion_rate = LEAST(
                    100,
                    ((completion_rate * (play_count - 1)) + 100) / play_count
                ),
                total_duration_ms = total_duration_ms + $3
            WHERE video_id = $1 AND date = $2 AND play_count > 0
            RETURNING video_id, date, play_count, completion_rate, total_duration_ms
            "#,
        )
        .bind(video_id)
        .bind(date)
        .bind(duration_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stat)
    }

    async fn daily_play_stat(
        &self,
        video_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailyPlayStat>, DatastoreError> {
        let stat = sqlx::query_as::<_, DailyPlayStat>(
            r#"
            SELECT video_id, date, play_count, completion_rate, total_duration_ms
            FROM daily_play_stats
            WHERE video_id = $1 AND date = $2
            "#,
        )
        .bind(video_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stat)
    }

    async fn ping(&self) -> Result<(), DatastoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_video_row_split() {
        let row = RuleVideoRow {
            rule_id: 7,
            rule_type: "industry".to_string(),
            conditions: json!({ "industries": ["Finance"] }),
            priority: 12,
            rule_is_active: true,
            video_id: 3,
            title: "Finance welcome".to_string(),
            file_url: "https://cdn.example.com/v3.mp4".to_string(),
            duration_seconds: 30,
            thumbnail_url: None,
            file_size_bytes: 4_096,
            is_default: false,
            video_is_active: true,
        };

        let (rule, video) = row.into_parts();

        assert_eq!(rule.id, 7);
        assert_eq!(rule.video_id, video.id);
        assert_eq!(video.title, "Finance welcome");
        assert!(!video.is_default);
    }
}
