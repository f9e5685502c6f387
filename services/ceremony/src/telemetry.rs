//! Trigger analytics persisted off the response path.

use crate::datastore::Datastore;
use crate::error::TelemetryError;
use crate::models::{DailyPlayStat, TriggerEvent};
use chrono::{FixedOffset, NaiveDate};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a completion signal
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOutcome {
    pub trigger_id: Uuid,
    pub video_id: i64,
    pub date: NaiveDate,
    pub completed: bool,
    /// The trigger had been completed before this signal, so nothing changed
    pub already_completed: bool,
    /// The day's statistics after the update, when a completed play was folded in
    pub daily_stat: Option<DailyPlayStat>,
}

/// Writes trigger events and daily play statistics
pub struct AsyncTelemetry {
    datastore: Arc<dyn Datastore>,
    zone: FixedOffset,
}

impl AsyncTelemetry {
    pub fn new(datastore: Arc<dyn Datastore>, zone: FixedOffset) -> Self {
        Self { datastore, zone }
    }

    /// Persist an event on its own task. Failures are logged and dropped.
    pub fn spawn_record(self: &Arc<Self>, event: TriggerEvent) -> JoinHandle<()> {
        let telemetry = Arc::clone(self);
        tokio::spawn(async move {
            match telemetry.record(&event).await {
                Ok(()) => {
                    metrics::counter!("ceremony.telemetry.recorded").increment(1);
                }
                Err(e) => {
                    metrics::counter!("ceremony.telemetry.failures").increment(1);
                    error!(
                        error = %e,
                        trigger_id = %event.id,
                        video_id = event.video_id,
                        "Failed to persist trigger telemetry"
                    );
                }
            }
        })
    }

    /// Insert the trigger event and count a play for its video and day
    #[instrument(skip(self, event), fields(trigger_id = %event.id, video_id = event.video_id))]
    pub async fn record(&self, event: &TriggerEvent) -> Result<(), TelemetryError> {
        let date = self.event_date(event);

        self.datastore.insert_trigger_event(event).await?;
        self.datastore.increment_daily_plays(event.video_id, date).await?;

        debug!(date = %date, "Trigger telemetry recorded");
        Ok(())
    }

    /// Apply a playback completion signal to its event and the event's day.
    ///
    /// A completed play is folded into the daily statistics once. Repeated
    /// signals for an already completed trigger change nothing.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        trigger_id: Uuid,
        actual_duration_ms: i64,
        completed: bool,
    ) -> Result<CompletionOutcome, TelemetryError> {
        let event = self
            .datastore
            .trigger_event(trigger_id)
            .await?
            .ok_or(TelemetryError::TriggerNotFound(trigger_id))?;
        let date = self.event_date(&event);

        let updated = !event.is_completed
            && self
                .datastore
                .update_trigger_completion(trigger_id, actual_duration_ms, completed)
                .await?;
        if !updated {
            metrics::counter!("ceremony.telemetry.repeat_completions").increment(1);
            info!(
                trigger_id = %trigger_id,
                video_id = event.video_id,
                "Trigger already completed, ignoring repeat signal"
            );
            return Ok(CompletionOutcome {
                trigger_id,
                video_id: event.video_id,
                date,
                completed: true,
                already_completed: true,
                daily_stat: None,
            });
        }

        let daily_stat = if completed {
            let stat = self
                .datastore
                .record_daily_completion(event.video_id, date, actual_duration_ms)
                .await?;
            if stat.is_none() {
                warn!(
                    video_id = event.video_id,
                    date = %date,
                    "No daily play row to fold completion into"
                );
            }
            stat
        } else {
            None
        };

        info!(
            trigger_id = %trigger_id,
            video_id = event.video_id,
            completed = completed,
            duration_ms = actual_duration_ms,
            "Playback completion recorded"
        );

        Ok(CompletionOutcome {
            trigger_id,
            video_id: event.video_id,
            date,
            completed,
            already_completed: false,
            daily_stat,
        })
    }

    /// Calendar day of the event in the venue zone
    fn event_date(&self, event: &TriggerEvent) -> NaiveDate {
        event.trigger_time.with_timezone(&self.zone).date_naive()
    }
}
