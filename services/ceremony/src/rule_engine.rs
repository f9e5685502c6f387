use crate::cache::{CacheSnapshot, CompiledRule};
use crate::clock::{Clock, SystemClock};
use crate::error::TriggerError;
use crate::models::{CeremonyVideo, Member, RuleCondition, RuleType};
use chrono::{FixedOffset, Offset, Timelike, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::trace;

/// Source of uniform draws in `[0, 1)` for random rules
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local OS-seeded randomness
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Reproducible randomness from a fixed seed
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }
}

/// Always returns the same draw
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Outcome of rule evaluation for one trigger
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Video to play
    pub video: Arc<CeremonyVideo>,
    /// Matched rule, `None` when the default video was used as fallback
    pub rule_id: Option<i64>,
    /// Type of the matched rule
    pub rule_type: Option<RuleType>,
}

impl Selection {
    fn from_rule(rule: &CompiledRule) -> Self {
        Self {
            video: Arc::clone(&rule.video),
            rule_id: Some(rule.id),
            rule_type: Some(rule.condition.rule_type()),
        }
    }

    /// Label reported to clients: the rule type, or "default" for the fallback
    pub fn rule_applied(&self) -> &'static str {
        self.rule_type.map(|t| t.as_str()).unwrap_or("default")
    }
}

/// Priority-ordered matcher deciding which video a trigger plays
///
/// Rules are tried in snapshot order (priority descending, id ascending) and
/// the first whose predicate holds wins:
/// - Default rules always match
/// - Member type and industry rules need a known member
/// - Time window rules compare the current hour in the venue zone
/// - Random rules draw afresh on every evaluation
pub struct RuleEngine {
    clock: Arc<dyn Clock>,
    zone: FixedOffset,
    random: Arc<dyn RandomSource>,
}

impl RuleEngine {
    pub fn new(clock: Arc<dyn Clock>, zone: FixedOffset, random: Arc<dyn RandomSource>) -> Self {
        Self {
            clock,
            zone,
            random,
        }
    }

    /// Resolve the video for a trigger
    pub fn select(
        &self,
        snapshot: &CacheSnapshot,
        member: Option<&Member>,
        nfc_card_id: &str,
    ) -> Result<Selection, TriggerError> {
        let hour = self.clock.local_now(self.zone).hour();

        for rule in snapshot.rules() {
            if self.matches(&rule.condition, member, hour) {
                trace!(
                    card_id = %nfc_card_id,
                    rule_id = rule.id,
                    priority = rule.priority,
                    "Rule matched"
                );
                return Ok(Selection::from_rule(rule));
            }
        }

        snapshot
            .default_video()
            .map(|video| Selection {
                video: Arc::clone(video),
                rule_id: None,
                rule_type: None,
            })
            .ok_or_else(|| TriggerError::NoVideoResolvable(nfc_card_id.to_string()))
    }

    fn matches(&self, condition: &RuleCondition, member: Option<&Member>, hour: u32) -> bool {
        match condition {
            RuleCondition::Default => true,
            RuleCondition::MemberType { member_types } => member
                .and_then(|m| m.member_type.as_deref())
                .map(|t| contains_ignore_case(member_types, t))
                .unwrap_or(false),
            RuleCondition::Industry { industries } => member
                .and_then(|m| m.industry.as_deref())
                .map(|i| contains_ignore_case(industries, i))
                .unwrap_or(false),
            RuleCondition::TimeWindow {
                start_hour,
                end_hour,
            } => hour_in_window(hour, *start_hour, *end_hour),
            RuleCondition::Random { probability } => self.random.next_f64() < *probability,
        }
    }
}

fn contains_ignore_case(values: &[String], needle: &str) -> bool {
    values.iter().any(|v| v.trim().eq_ignore_ascii_case(needle.trim()))
}

/// Inclusive hour range; a start after the end wraps past midnight
fn hour_in_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..=end).contains(&hour)
    } else {
        hour >= start || hour <= end
    }
}

/// Builder for creating a RuleEngine with custom time and randomness sources
pub struct RuleEngineBuilder {
    clock: Arc<dyn Clock>,
    zone: FixedOffset,
    random: Arc<dyn RandomSource>,
}

impl RuleEngineBuilder {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            zone: Utc.fix(),
            random: Arc::new(ThreadRandom),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn zone(mut self, zone: FixedOffset) -> Self {
        self.zone = zone;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn build(self) -> RuleEngine {
        RuleEngine::new(self.clock, self.zone, self.random)
    }
}

impl Default for RuleEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
