//! Nier Ceremony Service
//!
//! NFC-triggered ceremony video resolution for chapter meetings. A member taps
//! their card at the door reader, and this service decides which ceremony
//! video the playback surface should show, answering well inside a 500ms
//! service-level target.
//!
//! ## Features
//!
//! - **Layered In-Memory Cache**: Default video and rules held in a snapshot
//!   swapped atomically on refresh; members cached per card with a TTL
//! - **Priority Rule Matching**: Typed rules (member type, industry, time
//!   window, random) evaluated in priority order with a default fallback
//! - **Latency Isolation**: At most one bounded datastore read on the request
//!   path; analytics are persisted on detached tasks
//! - **SLA Monitoring**: Per-day response-time aggregates and reports
//!
//! ## Architecture
//!
//! ```text
//! NFC Reader                                            PostgreSQL
//! ┌──────────────┐                                     ┌──────────────┐
//! │ POST         │                                     │ videos       │
//! │ /trigger     │                                     │ rules        │
//! └──────────────┘                                     │ members      │
//!        │                                             │ events/stats │
//!        ▼                                             └──────────────┘
//! ┌──────────────┐  miss   ┌──────────────┐  refresh          ▲
//! │ Trigger      │────────▶│ Cache        │◀──────────────────┤
//! │ Handler      │◀────────│ Manager      │                   │
//! └──────────────┘         └──────────────┘                   │
//!        │                                                    │
//!        ▼                                                    │
//! ┌──────────────┐                                            │
//! │ Rule         │                                            │
//! │ Engine       │                                            │
//! └──────────────┘                                            │
//!        │ response returned, then detached:                  │
//!        ├──────────────────────────┐                         │
//!        ▼                          ▼                         │
//! ┌──────────────┐           ┌──────────────┐                 │
//! │ Performance  │           │ Async        │─────────────────┘
//! │ Monitor      │           │ Telemetry    │
//! └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod datastore;
pub mod error;
pub mod memory_store;
pub mod models;
pub mod performance;
pub mod pg_store;
pub mod rule_engine;
pub mod telemetry;
pub mod trigger;

pub use api::{create_router, start_api_server, AppState};
pub use cache::{CacheManager, CacheSizes, CacheSnapshot, CompiledRule};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use datastore::Datastore;
pub use error::{CacheError, DatastoreError, TelemetryError, TriggerError};
pub use memory_store::InMemoryDatastore;
pub use models::{CeremonyVideo, DailyPlayStat, Member, PlayRule, RuleCondition, RuleType, TriggerEvent};
pub use performance::{DateRange, PerformanceMonitor, PerformanceReport};
pub use pg_store::PgDatastore;
pub use rule_engine::{
    FixedRandom, RandomSource, RuleEngine, RuleEngineBuilder, SeededRandom, Selection,
    ThreadRandom,
};
pub use telemetry::{AsyncTelemetry, CompletionOutcome};
pub use trigger::{TriggerHandler, TriggerOutcome};
