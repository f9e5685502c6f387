use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A ceremony video that can be played on a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct CeremonyVideo {
    /// Video ID
    pub id: i64,
    /// Display title
    pub title: String,
    /// Playable file location
    pub file_url: String,
    /// Duration in seconds
    pub duration_seconds: i32,
    /// Poster image location
    pub thumbnail_url: Option<String>,
    /// File size in bytes
    pub file_size_bytes: i64,
    /// Whether this is the fallback video
    pub is_default: bool,
    /// Whether the video may be played
    pub is_active: bool,
}

/// A chapter member identified by an NFC card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub industry: Option<String>,
    pub member_type: Option<String>,
    pub nfc_card_id: String,
    pub is_active: bool,
}

/// Kind of predicate a play rule applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Always matches
    Default,
    /// Matches listed member types
    MemberType,
    /// Matches listed industries
    Industry,
    /// Matches an hour range in the venue zone
    TimeWindow,
    /// Matches with a fixed probability per trigger
    Random,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Default => "default",
            RuleType::MemberType => "member_type",
            RuleType::Industry => "industry",
            RuleType::TimeWindow => "time_window",
            RuleType::Random => "random",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "default" => Ok(RuleType::Default),
            "member_type" | "membertype" => Ok(RuleType::MemberType),
            "industry" => Ok(RuleType::Industry),
            "time_window" | "timewindow" | "time" => Ok(RuleType::TimeWindow),
            "random" => Ok(RuleType::Random),
            other => Err(format!("unknown rule type '{}'", other)),
        }
    }
}

/// A play rule as stored, with its conditions still untyped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PlayRule {
    pub id: i64,
    pub rule_type: String,
    pub conditions: serde_json::Value,
    pub priority: i32,
    pub video_id: i64,
    pub is_active: bool,
}

/// Typed rule predicate, parsed once when the cache is loaded
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCondition {
    Default,
    MemberType { member_types: Vec<String> },
    Industry { industries: Vec<String> },
    TimeWindow { start_hour: u32, end_hour: u32 },
    Random { probability: f64 },
}

#[derive(Deserialize)]
struct MemberTypeConditions {
    #[serde(rename = "memberTypes", alias = "member_types")]
    member_types: Vec<String>,
}

#[derive(Deserialize)]
struct IndustryConditions {
    industries: Vec<String>,
}

#[derive(Deserialize)]
struct TimeWindowConditions {
    #[serde(rename = "startHour", alias = "start_hour")]
    start_hour: u32,
    #[serde(rename = "endHour", alias = "end_hour")]
    end_hour: u32,
}

#[derive(Deserialize)]
struct RandomConditions {
    probability: f64,
}

impl RuleCondition {
    /// Parse a raw rule type and conditions payload into a typed predicate
    pub fn parse(rule_type: &str, conditions: &serde_json::Value) -> Result<Self, String> {
        let rule_type = RuleType::from_str(rule_type)?;

        let condition = match rule_type {
            RuleType::Default => RuleCondition::Default,
            RuleType::MemberType => {
                let parsed: MemberTypeConditions = decode(conditions)?;
                if parsed.member_types.is_empty() {
                    return Err("memberTypes must not be empty".to_string());
                }
                RuleCondition::MemberType {
                    member_types: parsed.member_types,
                }
            }
            RuleType::Industry => {
                let parsed: IndustryConditions = decode(conditions)?;
                if parsed.industries.is_empty() {
                    return Err("industries must not be empty".to_string());
                }
                RuleCondition::Industry {
                    industries: parsed.industries,
                }
            }
            RuleType::TimeWindow => {
                let parsed: TimeWindowConditions = decode(conditions)?;
                if parsed.start_hour > 23 || parsed.end_hour > 23 {
                    return Err(format!(
                        "hours must be within 0-23, got {}-{}",
                        parsed.start_hour, parsed.end_hour
                    ));
                }
                RuleCondition::TimeWindow {
                    start_hour: parsed.start_hour,
                    end_hour: parsed.end_hour,
                }
            }
            RuleType::Random => {
                let parsed: RandomConditions = decode(conditions)?;
                if !(0.0..=1.0).contains(&parsed.probability) {
                    return Err(format!(
                        "probability must be within 0-1, got {}",
                        parsed.probability
                    ));
                }
                RuleCondition::Random {
                    probability: parsed.probability,
                }
            }
        };

        Ok(condition)
    }

    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleCondition::Default => RuleType::Default,
            RuleCondition::MemberType { .. } => RuleType::MemberType,
            RuleCondition::Industry { .. } => RuleType::Industry,
            RuleCondition::TimeWindow { .. } => RuleType::TimeWindow,
            RuleCondition::Random { .. } => RuleType::Random,
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, String> {
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}

/// One resolved trigger, persisted off the response path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TriggerEvent {
    pub id: Uuid,
    pub nfc_card_id: String,
    pub member_id: Option<i64>,
    pub video_id: i64,
    /// `None` when the default video was used as a fallback
    pub rule_id: Option<i64>,
    pub response_time_ms: i64,
    pub device_info: serde_json::Value,
    pub trigger_time: DateTime<Utc>,
    pub play_duration_ms: Option<i64>,
    pub is_completed: bool,
}

/// Rolling per-video, per-day play statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DailyPlayStat {
    pub video_id: i64,
    pub date: NaiveDate,
    pub play_count: i64,
    /// Percentage of plays that completed (0-100)
    pub completion_rate: f64,
    pub total_duration_ms: i64,
}

impl DailyPlayStat {
    /// Fold one completed play into the rate, treating it as the latest play
    pub fn apply_completion(&mut self, duration_ms: i64) {
        if self.play_count <= 0 {
            return;
        }
        let count = self.play_count as f64;
        let rate = (self.completion_rate * (count - 1.0) + 100.0) / count;
        self.completion_rate = rate.clamp(0.0, 100.0);
        self.total_duration_ms += duration_ms;
    }
}
