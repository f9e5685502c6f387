//! In-memory caches on the trigger path.
//!
//! Rules and the default video live in an immutable [`CacheSnapshot`] that is
//! replaced wholesale on refresh, so readers always see one complete load.
//! Members are cached per card with a TTL checked lazily on read.

use crate::clock::Clock;
use crate::datastore::Datastore;
use crate::error::CacheError;
use crate::models::{CeremonyVideo, Member, RuleCondition};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// A rule ready for evaluation, bound to its video
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRule {
    pub id: i64,
    pub priority: i32,
    pub condition: RuleCondition,
    pub video: Arc<CeremonyVideo>,
}

/// One complete, immutable load of the rule and default-video caches
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    default_video: Option<Arc<CeremonyVideo>>,
    /// Sorted by priority descending, then id ascending
    rules: Vec<CompiledRule>,
    loaded_at: Option<DateTime<Utc>>,
}

impl CacheSnapshot {
    pub fn new(default_video: Option<CeremonyVideo>, mut rules: Vec<CompiledRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Self {
            default_video: default_video.map(Arc::new),
            rules,
            loaded_at: None,
        }
    }

    fn loaded(mut self, at: DateTime<Utc>) -> Self {
        self.loaded_at = Some(at);
        self
    }

    pub fn default_video(&self) -> Option<&Arc<CeremonyVideo>> {
        self.default_video.as_ref()
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.loaded_at
    }
}

#[derive(Debug, Clone)]
struct MemberEntry {
    member: Member,
    inserted_at: DateTime<Utc>,
}

/// Current cache occupancy, reported by health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSizes {
    pub default_video: bool,
    pub rules: usize,
    pub members: usize,
    /// When the current rule snapshot was loaded
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Owner of the default-video, rule and member caches
pub struct CacheManager {
    datastore: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    member_ttl: Duration,
    snapshot: RwLock<Arc<CacheSnapshot>>,
    members: RwLock<HashMap<String, MemberEntry>>,
    refreshing: AtomicBool,
}

/// Clears the in-flight flag when a refresh ends, however it ends
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CacheManager {
    pub fn new(datastore: Arc<dyn Datastore>, clock: Arc<dyn Clock>, member_ttl: Duration) -> Self {
        Self {
            datastore,
            clock,
            member_ttl,
            snapshot: RwLock::new(Arc::new(CacheSnapshot::default())),
            members: RwLock::new(HashMap::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Load the default video and all active rules, then swap them in
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), CacheError> {
        let (default_video, rows) = futures::try_join!(
            self.datastore.default_video(),
            self.datastore.active_rules()
        )?;

        let mut rules = Vec::with_capacity(rows.len());
        for (rule, video) in rows {
            let condition = RuleCondition::parse(&rule.rule_type, &rule.conditions).map_err(
                |reason| CacheError::MalformedRule {
                    rule_id: rule.id,
                    reason,
                },
            )?;
            rules.push(CompiledRule {
                id: rule.id,
                priority: rule.priority,
                condition,
                video: Arc::new(video),
            });
        }

        let snapshot = CacheSnapshot::new(default_video, rules).loaded(self.clock.now());
        let has_default = snapshot.default_video.is_some();
        let rule_count = snapshot.rules.len();

        *self.snapshot.write() = Arc::new(snapshot);

        metrics::gauge!("ceremony.cache.rules").set(rule_count as f64);
        info!(
            rule_count = rule_count,
            has_default_video = has_default,
            "Ceremony caches loaded"
        );

        Ok(())
    }

    /// Reload the caches unless a reload is already running.
    ///
    /// Returns `Ok(false)` when skipped because another refresh is in flight.
    pub async fn refresh(&self) -> Result<bool, CacheError> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("Cache refresh already in flight, skipping");
            return Ok(false);
        }
        let _guard = RefreshGuard(&self.refreshing);

        match self.initialize().await {
            Ok(()) => {
                metrics::counter!("ceremony.cache.refreshes").increment(1);
                Ok(true)
            }
            Err(e) => {
                metrics::counter!("ceremony.cache.refresh_failures").increment(1);
                Err(e)
            }
        }
    }

    /// Run [`refresh`](Self::refresh) every `interval` until `cancel` fires.
    ///
    /// The first tick comes one interval after spawning; the startup load is
    /// expected to have been done through [`initialize`](Self::initialize).
    pub fn spawn_refresh_task(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(interval_secs = interval.as_secs(), "Cache refresh task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            error!(error = %e, "Cache refresh failed, keeping previous contents");
                        }
                    }
                }
            }

            info!("Cache refresh task stopped");
        })
    }

    /// The current rule/default-video snapshot
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// A cached member for the card, if present and younger than the TTL
    pub fn get_member(&self, nfc_card_id: &str) -> Option<Member> {
        let now = self.clock.now();
        {
            let members = self.members.read();
            match members.get(nfc_card_id) {
                None => return None,
                Some(entry) if !self.is_expired(entry, now) => return Some(entry.member.clone()),
                Some(_) => {}
            }
        }

        // Expired: drop it unless someone re-inserted in the meantime
        let mut members = self.members.write();
        if let Some(entry) = members.get(nfc_card_id) {
            if self.is_expired(entry, now) {
                members.remove(nfc_card_id);
            }
        }
        None
    }

    pub fn insert_member(&self, nfc_card_id: &str, member: Member) {
        let entry = MemberEntry {
            member,
            inserted_at: self.clock.now(),
        };
        self.members.write().insert(nfc_card_id.to_string(), entry);
    }

    fn is_expired(&self, entry: &MemberEntry, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(entry.inserted_at);
        match age.to_std() {
            Ok(age) => age >= self.member_ttl,
            // Inserted "in the future" relative to now, e.g. after a clock step back
            Err(_) => false,
        }
    }

    /// Drop every cached member.
    ///
    /// The rule snapshot is only ever replaced by a successful load.
    pub fn clear_members(&self) {
        self.members.write().clear();
        info!("Member cache cleared");
    }

    pub fn sizes(&self) -> CacheSizes {
        let snapshot = self.snapshot();
        CacheSizes {
            default_video: snapshot.default_video.is_some(),
            rules: snapshot.rules.len(),
            members: self.members.read().len(),
            loaded_at: snapshot.loaded_at,
        }
    }
}
