use crate::cache::CacheManager;
use crate::clock::Clock;
use crate::datastore::Datastore;
use crate::error::TriggerError;
use crate::models::{CeremonyVideo, Member, TriggerEvent};
use crate::performance::PerformanceMonitor;
use crate::rule_engine::RuleEngine;
use crate::telemetry::AsyncTelemetry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Longest card identifier accepted from a reader
const MAX_CARD_ID_LEN: usize = 128;

/// Result of resolving one trigger
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    /// Identifier the playback surface reports completion against
    pub trigger_id: Uuid,
    pub video: Arc<CeremonyVideo>,
    pub member: Option<Member>,
    pub rule_id: Option<i64>,
    /// Matched rule type, or "default" for the fallback video
    pub rule_applied: &'static str,
    pub response_time_ms: u64,
    /// Whether the member came from the member cache
    pub cache_hit: bool,
}

/// Resolves a scanned card to a video on the latency-critical path.
///
/// At most one datastore read (member lookup on a cache miss) happens before
/// the answer is ready. Persistence is handed to [`AsyncTelemetry`] and never
/// awaited here.
pub struct TriggerHandler {
    cache: Arc<CacheManager>,
    datastore: Arc<dyn Datastore>,
    engine: RuleEngine,
    telemetry: Arc<AsyncTelemetry>,
    monitor: Arc<PerformanceMonitor>,
    clock: Arc<dyn Clock>,
    member_lookup_timeout: Duration,
}

impl TriggerHandler {
    pub fn new(
        cache: Arc<CacheManager>,
        datastore: Arc<dyn Datastore>,
        engine: RuleEngine,
        telemetry: Arc<AsyncTelemetry>,
        monitor: Arc<PerformanceMonitor>,
        clock: Arc<dyn Clock>,
        member_lookup_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            datastore,
            engine,
            telemetry,
            monitor,
            clock,
            member_lookup_timeout,
        }
    }

    #[instrument(skip(self, device_info))]
    pub async fn handle(
        &self,
        nfc_card_id: &str,
        device_info: serde_json::Value,
    ) -> Result<TriggerOutcome, TriggerError> {
        let started = Instant::now();

        let card_id = nfc_card_id.trim();
        if card_id.is_empty() {
            return Err(TriggerError::InvalidRequest(
                "nfc_card_id is required".to_string(),
            ));
        }
        if card_id.len() > MAX_CARD_ID_LEN {
            return Err(TriggerError::InvalidRequest(format!(
                "nfc_card_id exceeds {} characters",
                MAX_CARD_ID_LEN
            )));
        }

        metrics::counter!("ceremony.triggers.total").increment(1);

        let (member, cache_hit) = self.resolve_member(card_id).await;

        let snapshot = self.cache.snapshot();
        let selection = match self.engine.select(&snapshot, member.as_ref(), card_id) {
            Ok(selection) => selection,
            Err(e) => {
                metrics::counter!("ceremony.triggers.not_found").increment(1);
                warn!(card_id = %card_id, error = %e, "No video configured for trigger");
                return Err(e);
            }
        };

        let response_time_ms = started.elapsed().as_millis() as u64;
        let trigger_id = Uuid::new_v4();

        // Everything below is off the response path
        self.telemetry.spawn_record(TriggerEvent {
            id: trigger_id,
            nfc_card_id: card_id.to_string(),
            member_id: member.as_ref().map(|m| m.id),
            video_id: selection.video.id,
            rule_id: selection.rule_id,
            response_time_ms: response_time_ms as i64,
            device_info,
            trigger_time: self.clock.now(),
            play_duration_ms: None,
            is_completed: false,
        });
        self.monitor.observe(response_time_ms);

        info!(
            trigger_id = %trigger_id,
            card_id = %card_id,
            member_id = ?member.as_ref().map(|m| m.id),
            video_id = selection.video.id,
            rule_id = ?selection.rule_id,
            response_time_ms = response_time_ms,
            cache_hit = cache_hit,
            "Trigger resolved"
        );

        Ok(TriggerOutcome {
            trigger_id,
            rule_applied: selection.rule_applied(),
            rule_id: selection.rule_id,
            video: selection.video,
            member,
            response_time_ms,
            cache_hit,
        })
    }

    /// Member for the card from cache, else one bounded datastore read.
    ///
    /// Lookup failures and timeouts yield an unknown member.
    async fn resolve_member(&self, card_id: &str) -> (Option<Member>, bool) {
        if let Some(member) = self.cache.get_member(card_id) {
            metrics::counter!("ceremony.member_cache.hits").increment(1);
            return (Some(member), true);
        }
        metrics::counter!("ceremony.member_cache.misses").increment(1);

        let lookup = self.datastore.member_by_card(card_id);
        match tokio::time::timeout(self.member_lookup_timeout, lookup).await {
            Ok(Ok(Some(member))) => {
                self.cache.insert_member(card_id, member.clone());
                (Some(member), false)
            }
            Ok(Ok(None)) => (None, false),
            Ok(Err(e)) => {
                metrics::counter!("ceremony.member_lookup.degraded").increment(1);
                warn!(card_id = %card_id, error = %e, "Member lookup failed, continuing as unknown member");
                (None, false)
            }
            Err(_) => {
                metrics::counter!("ceremony.member_lookup.degraded").increment(1);
                warn!(
                    card_id = %card_id,
                    timeout_ms = self.member_lookup_timeout.as_millis() as u64,
                    "Member lookup timed out, continuing as unknown member"
                );
                (None, false)
            }
        }
    }
}
