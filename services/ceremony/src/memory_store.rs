//! In-memory [`Datastore`] for tests and local runs.
//!
//! Behaves like the PostgreSQL store (active filtering, upsert semantics,
//! atomic completion fold) and can simulate outages and slow calls.

use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::models::{CeremonyVideo, DailyPlayStat, Member, PlayRule, TriggerEvent};
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    videos: BTreeMap<i64, CeremonyVideo>,
    rules: BTreeMap<i64, PlayRule>,
    members: HashMap<String, Member>,
    events: HashMap<Uuid, TriggerEvent>,
    stats: BTreeMap<(i64, NaiveDate), DailyPlayStat>,
}

#[derive(Default)]
struct Faults {
    member_lookup_delay: Duration,
    write_delay: Duration,
    ping_delay: Duration,
}

/// Datastore held entirely in process memory
#[derive(Default)]
pub struct InMemoryDatastore {
    tables: RwLock<Tables>,
    faults: Mutex<Faults>,
    unavailable: AtomicBool,
    member_lookups: AtomicUsize,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(self, video: CeremonyVideo) -> Self {
        self.insert_video(video);
        self
    }

    pub fn with_rule(self, rule: PlayRule) -> Self {
        self.insert_rule(rule);
        self
    }

    pub fn with_member(self, member: Member) -> Self {
        self.insert_member(member);
        self
    }

    pub fn insert_video(&self, video: CeremonyVideo) {
        self.tables.write().videos.insert(video.id, video);
    }

    pub fn insert_rule(&self, rule: PlayRule) {
        self.tables.write().rules.insert(rule.id, rule);
    }

    pub fn insert_member(&self, member: Member) {
        self.tables
            .write()
            .members
            .insert(member.nfc_card_id.clone(), member);
    }

    pub fn remove_member(&self, nfc_card_id: &str) -> Option<Member> {
        self.tables.write().members.remove(nfc_card_id)
    }

    pub fn insert_daily_play_stat(&self, stat: DailyPlayStat) {
        self.tables
            .write()
            .stats
            .insert((stat.video_id, stat.date), stat);
    }

    /// Make every call fail as if the database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay applied to every member lookup
    pub fn set_member_lookup_delay(&self, delay: Duration) {
        self.faults.lock().member_lookup_delay = delay;
    }

    /// Delay applied to trigger event and daily stat writes
    pub fn set_write_delay(&self, delay: Duration) {
        self.faults.lock().write_delay = delay;
    }

    /// Delay applied to every ping
    pub fn set_ping_delay(&self, delay: Duration) {
        self.faults.lock().ping_delay = delay;
    }

    /// Number of member lookups served so far
    pub fn member_lookups(&self) -> usize {
        self.member_lookups.load(Ordering::SeqCst)
    }

    /// All persisted trigger events, oldest first
    pub fn trigger_events(&self) -> Vec<TriggerEvent> {
        let mut events: Vec<_> = self.tables.read().events.values().cloned().collect();
        events.sort_by_key(|e| e.trigger_time);
        events
    }

    fn check_available(&self) -> Result<(), DatastoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatastoreError::Unavailable(
                "in-memory datastore marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_pause(&self) {
        let delay = self.faults.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn default_video(&self) -> Result<Option<CeremonyVideo>, DatastoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .videos
            .values()
            .find(|v| v.is_default && v.is_active)
            .cloned())
    }

    async fn active_rules(&self) -> Result<Vec<(PlayRule, CeremonyVideo)>, DatastoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        let mut rules: Vec<(PlayRule, CeremonyVideo)> = tables
            .rules
            .values()
            .filter(|r| r.is_active)
            .filter_map(|r| {
                tables
                    .videos
                    .get(&r.video_id)
                    .filter(|v| v.is_active)
                    .map(|v| (r.clone(), v.clone()))
            })
            .collect();
        rules.sort_by(|(a, _), (b, _)| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn member_by_card(&self, nfc_card_id: &str) -> Result<Option<Member>, DatastoreError> {
        self.member_lookups.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.lock().member_lookup_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .members
            .get(nfc_card_id)
            .filter(|m| m.is_active)
            .cloned())
    }

    async fn videos_by_ids(&self, ids: &[i64]) -> Result<Vec<CeremonyVideo>, DatastoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables
            .videos
            .values()
            .filter(|v| v.is_active && ids.contains(&v.id))
            .cloned()
            .collect())
    }

    async fn insert_trigger_event(&self, event: &TriggerEvent) -> Result<(), DatastoreError> {
        self.write_pause().await;
        self.check_available()?;
        self.tables.write().events.insert(event.id, event.clone());
        Ok(())
    }

    async fn increment_daily_plays(
        &self,
        video_id: i64,
        date: NaiveDate,
    ) -> Result<(), DatastoreError> {
        self.write_pause().await;
        self.check_available()?;
        let mut tables = self.tables.write();
        tables
            .stats
            .entry((video_id, date))
            .or_insert_with(|| DailyPlayStat {
                video_id,
                date,
                play_count: 0,
                completion_rate: 0.0,
                total_duration_ms: 0,
            })
            .play_count += 1;
        Ok(())
    }

    async fn trigger_event(&self, id: Uuid) -> Result<Option<TriggerEvent>, DatastoreError> {
        self.check_available()?;
        Ok(self.tables.read().events.get(&id).cloned())
    }

    async fn update_trigger_completion(
        &self,
        id: Uuid,
        play_duration_ms: i64,
        completed: bool,
    ) -> Result<bool, DatastoreError> {
        self.check_available()?;
        let mut tables = self.tables.write();
        match tables.events.get_mut(&id) {
            Some(event) if !event.is_completed => {
                event.play_duration_ms = Some(play_duration_ms);
                event.is_completed = completed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_daily_completion(
        &self,
        video_id: i64,
        date: NaiveDate,
        duration_ms: i64,
    ) -> Result<Option<DailyPlayStat>, DatastoreError> {
        self.check_available()?;
        let mut tables = self.tables.write();
        match tables.stats.get_mut(&(video_id, date)) {
            Some(stat) if stat.play_count > 0 => {
                stat.apply_completion(duration_ms);
                Ok(Some(stat.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn daily_play_stat(
        &self,
        video_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DailyPlayStat>, DatastoreError> {
        self.check_available()?;
        Ok(self.tables.read().stats.get(&(video_id, date)).cloned())
    }

    async fn ping(&self) -> Result<(), DatastoreError> {
        let delay = self.faults.lock().ping_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()
    }
}
