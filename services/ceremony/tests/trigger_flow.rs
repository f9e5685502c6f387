//! End-to-end trigger resolution against the in-memory datastore.

mod common;

use ceremony_service::datastore::Datastore;
use ceremony_service::error::TriggerError;
use ceremony_service::memory_store::InMemoryDatastore;
use ceremony_service::models::DailyPlayStat;
use common::{member, rule, today, video, Stack};
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn unknown_card_falls_back_to_default_video() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_rule(rule(1, "default", json!({}), 1, 1)),
    )
    .await;

    let outcome = stack.handler.handle("X1", json!({})).await.unwrap();

    assert_eq!(outcome.video.id, 1);
    assert!(outcome.member.is_none());
    assert_eq!(outcome.rule_applied, "default");
}

#[tokio::test]
async fn core_member_gets_member_type_video() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_video(video(2, false))
            .with_rule(rule(1, "member_type", json!({ "memberTypes": ["Core"] }), 20, 2))
            .with_rule(rule(2, "default", json!({}), 1, 1))
            .with_member(member(7, "C-7", "Core", "Finance")),
    )
    .await;

    let outcome = stack.handler.handle("C-7", json!({})).await.unwrap();

    assert_eq!(outcome.video.id, 2);
    assert_eq!(outcome.rule_id, Some(1));
    assert_eq!(outcome.member.map(|m| m.id), Some(7));
}

#[tokio::test]
async fn higher_priority_and_lower_id_win() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_video(video(2, false))
            .with_video(video(3, false))
            .with_video(video(4, false))
            .with_rule(rule(7, "industry", json!({ "industries": ["Finance"] }), 10, 4))
            .with_rule(rule(3, "member_type", json!({ "memberTypes": ["Core"] }), 10, 3))
            .with_rule(rule(9, "default", json!({}), 5, 2))
            .with_member(member(7, "C-7", "Core", "Finance")),
    )
    .await;

    for _ in 0..5 {
        let outcome = stack.handler.handle("C-7", json!({})).await.unwrap();
        assert_eq!(outcome.rule_id, Some(3));
        assert_eq!(outcome.video.id, 3);
    }
}

#[tokio::test]
async fn default_video_survives_every_lookup_failure() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_video(video(2, false))
            .with_rule(rule(1, "member_type", json!({ "memberTypes": ["Core"] }), 20, 2)),
    )
    .await;

    assert!(stack.handler.handle("NOBODY", json!({})).await.is_ok());

    stack.store.set_member_lookup_delay(Duration::from_secs(1));
    assert!(stack.handler.handle("SLOW", json!({})).await.is_ok());

    stack.store.set_member_lookup_delay(Duration::ZERO);
    stack.store.set_unavailable(true);
    let outcome = stack.handler.handle("DOWN", json!({})).await.unwrap();
    assert_eq!(outcome.video.id, 1);
    assert_eq!(outcome.rule_applied, "default");
}

#[tokio::test]
async fn missing_default_is_reported() {
    let stack = Stack::new(InMemoryDatastore::new().with_video(video(2, false))).await;

    let result = stack.handler.handle("X1", json!({})).await;

    assert_eq!(
        result.unwrap_err(),
        TriggerError::NoVideoResolvable("X1".to_string())
    );
}

#[tokio::test]
async fn slow_telemetry_does_not_delay_response() {
    let stack = Stack::new(InMemoryDatastore::new().with_video(video(1, true))).await;
    stack.store.set_write_delay(Duration::from_secs(2));

    let started = Instant::now();
    let outcome = stack.handler.handle("X1", json!({})).await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(200), "took {:?}", elapsed);
    assert!(outcome.response_time_ms < 200);
    assert!(stack.store.trigger_events().is_empty());
}

#[tokio::test]
async fn trigger_is_persisted_and_counted() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_member(member(7, "C-7", "Core", "Finance")),
    )
    .await;

    let outcome = stack
        .handler
        .handle("C-7", json!({ "reader": "front-door" }))
        .await
        .unwrap();

    let events = stack.wait_for_events(1).await;
    assert_eq!(events[0].id, outcome.trigger_id);
    assert_eq!(events[0].member_id, Some(7));
    assert_eq!(events[0].rule_id, None);
    assert_eq!(events[0].device_info["reader"], "front-door");
    assert!(!events[0].is_completed);

    stack.wait_for_daily_plays(1, 1).await;
    let report = stack.monitor.report(stack.monitor.default_range(7));
    assert_eq!(report.total_triggers, 1);
}

#[tokio::test]
async fn completion_updates_daily_rate() {
    let stack = Stack::new(InMemoryDatastore::new().with_video(video(3, true))).await;

    let outcome = stack.handler.handle("X1", json!({})).await.unwrap();
    assert_eq!(outcome.video.id, 3);
    stack.wait_for_daily_plays(3, 1).await;

    stack.store.insert_daily_play_stat(DailyPlayStat {
        video_id: 3,
        date: today(),
        play_count: 4,
        completion_rate: 80.0,
        total_duration_ms: 90_000,
    });

    let completion = stack
        .telemetry
        .complete(outcome.trigger_id, 120_000, true)
        .await
        .unwrap();

    assert_eq!(completion.date, today());
    let stat = stack.store.daily_play_stat(3, today()).await.unwrap().unwrap();
    assert!((stat.completion_rate - 85.0).abs() < 1e-9);
    assert_eq!(stat.total_duration_ms, 210_000);
    assert_eq!(stat.play_count, 4);
}

#[tokio::test]
async fn refresh_picks_up_new_rules() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_video(video(2, false)),
    )
    .await;
    assert_eq!(stack.handler.handle("X1", json!({})).await.unwrap().video.id, 1);

    stack
        .store
        .insert_rule(rule(5, "time_window", json!({ "startHour": 18, "endHour": 21 }), 50, 2));
    assert!(stack.cache.refresh().await.unwrap());

    let outcome = stack.handler.handle("X1", json!({})).await.unwrap();
    assert_eq!(outcome.video.id, 2);
    assert_eq!(outcome.rule_applied, "time_window");
}

#[tokio::test]
async fn member_cache_expires_after_ttl() {
    let stack = Stack::new(
        InMemoryDatastore::new()
            .with_video(video(1, true))
            .with_member(member(7, "C-7", "Core", "Finance")),
    )
    .await;

    assert!(!stack.handler.handle("C-7", json!({})).await.unwrap().cache_hit);
    assert!(stack.handler.handle("C-7", json!({})).await.unwrap().cache_hit);

    stack.clock.advance(chrono::Duration::seconds(300));
    assert!(!stack.handler.handle("C-7", json!({})).await.unwrap().cache_hit);
    assert_eq!(stack.store.member_lookups(), 2);
}
