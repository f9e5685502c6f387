//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use ceremony_service::api::AppState;
use ceremony_service::cache::CacheManager;
use ceremony_service::clock::{Clock, ManualClock};
use ceremony_service::datastore::Datastore;
use ceremony_service::memory_store::InMemoryDatastore;
use ceremony_service::models::{CeremonyVideo, Member, PlayRule, TriggerEvent};
use ceremony_service::performance::PerformanceMonitor;
use ceremony_service::rule_engine::{FixedRandom, RuleEngineBuilder};
use ceremony_service::telemetry::AsyncTelemetry;
use ceremony_service::trigger::TriggerHandler;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 3, 19, 0, 0).unwrap()
}

pub fn today() -> NaiveDate {
    start_time().date_naive()
}

pub fn video(id: i64, is_default: bool) -> CeremonyVideo {
    CeremonyVideo {
        id,
        title: format!("Ceremony {}", id),
        file_url: format!("https://cdn.example.com/ceremony/{}.mp4", id),
        duration_seconds: 30,
        thumbnail_url: Some(format!("https://cdn.example.com/ceremony/{}.jpg", id)),
        file_size_bytes: 1_000 * id,
        is_default,
        is_active: true,
    }
}

pub fn rule(id: i64, rule_type: &str, conditions: Value, priority: i32, video_id: i64) -> PlayRule {
    PlayRule {
        id,
        rule_type: rule_type.to_string(),
        conditions,
        priority,
        video_id,
        is_active: true,
    }
}

pub fn member(id: i64, card: &str, member_type: &str, industry: &str) -> Member {
    Member {
        id,
        name: format!("Member {}", id),
        industry: Some(industry.to_string()),
        member_type: Some(member_type.to_string()),
        nfc_card_id: card.to_string(),
        is_active: true,
    }
}

/// A fully wired service over an in-memory datastore and a manual clock
pub struct Stack {
    pub store: Arc<InMemoryDatastore>,
    pub clock: Arc<ManualClock>,
    pub cache: Arc<CacheManager>,
    pub handler: Arc<TriggerHandler>,
    pub telemetry: Arc<AsyncTelemetry>,
    pub monitor: Arc<PerformanceMonitor>,
}

impl Stack {
    pub async fn new(store: InMemoryDatastore) -> Self {
        let store = Arc::new(store);
        let datastore: Arc<dyn Datastore> = store.clone();
        let clock = Arc::new(ManualClock::new(start_time()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let zone = FixedOffset::east_opt(0).unwrap();

        let cache = Arc::new(CacheManager::new(
            datastore.clone(),
            dyn_clock.clone(),
            Duration::from_secs(300),
        ));
        cache.initialize().await.unwrap();

        let engine = RuleEngineBuilder::new()
            .clock(dyn_clock.clone())
            .zone(zone)
            .random(Arc::new(FixedRandom(0.5)))
            .build();
        let telemetry = Arc::new(AsyncTelemetry::new(datastore.clone(), zone));
        let monitor = Arc::new(PerformanceMonitor::new(dyn_clock.clone(), zone, 500, 95.0, 30));
        let handler = Arc::new(TriggerHandler::new(
            cache.clone(),
            datastore,
            engine,
            telemetry.clone(),
            monitor.clone(),
            dyn_clock,
            Duration::from_millis(100),
        ));

        Self {
            store,
            clock,
            cache,
            handler,
            telemetry,
            monitor,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            handler: self.handler.clone(),
            cache: self.cache.clone(),
            datastore: self.store.clone(),
            telemetry: self.telemetry.clone(),
            monitor: self.monitor.clone(),
            health_check_timeout: Duration::from_millis(200),
            default_report_days: 7,
            max_preload_videos: 3,
        }
    }

    /// Wait until the detached telemetry tasks have persisted `count` events
    pub async fn wait_for_events(&self, count: usize) -> Vec<TriggerEvent> {
        for _ in 0..200 {
            let events = self.store.trigger_events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} persisted trigger events", count);
    }

    /// Wait until today's play count for `video_id` reaches `count`
    pub async fn wait_for_daily_plays(&self, video_id: i64, count: i64) {
        for _ in 0..200 {
            let stat = self.store.daily_play_stat(video_id, today()).await.unwrap();
            if stat.map(|s| s.play_count >= count).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} plays of video {}", count, video_id);
    }
}
