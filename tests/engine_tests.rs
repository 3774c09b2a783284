use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use threatwatch::config::EngineConfig;
use threatwatch::security::alerts::TracingAlertSink;
use threatwatch::security::event::{EventType, SecurityEvent, Severity, ThreatLevel};
use threatwatch::security::reputation::DisabledReputationProvider;
use threatwatch::security::response::{ResponseAction, ThreatResponseSystem};

// End-to-end scenarios for the threat engine, driven in-process with an
// explicit clock so block expiry can be simulated.

fn engine() -> ThreatResponseSystem {
    engine_with(EngineConfig::default())
}

fn engine_with(config: EngineConfig) -> ThreatResponseSystem {
    ThreatResponseSystem::new(
        config,
        Arc::new(DisabledReputationProvider),
        Arc::new(TracingAlertSink),
    )
}

fn login_failure(ip: &str, at: DateTime<Utc>) -> SecurityEvent {
    SecurityEvent::new(EventType::LoginFailed, Severity::Medium)
        .with_source_ip(ip)
        .with_timestamp(at)
}

/// Feed a failed-login burst and return the response to the final event.
async fn drive_burst(
    engine: &ThreatResponseSystem,
    ip: &str,
    count: usize,
    now: DateTime<Utc>,
) -> threatwatch::security::response::ThreatResponse {
    let mut last = None;
    for i in 0..count {
        let at = now - Duration::seconds(20 * (count - 1 - i) as i64);
        let event = login_failure(ip, at);
        last = Some(engine.process_event_at(event, now).await);
    }
    last.expect("at least one event processed")
}

#[tokio::test]
async fn test_event_without_source_ip_is_noop() {
    let engine = engine();
    let event = SecurityEvent::new(EventType::LoginFailed, Severity::Medium);

    let response = engine.process_security_event(event).await;

    assert_eq!(response.action, ResponseAction::None);
    assert_eq!(response.reason.as_deref(), Some("No source IP"));
    assert!(response.executed_actions.is_empty());
}

#[tokio::test]
async fn test_stable_baseline_no_alert() {
    let engine = engine();
    let now = Utc::now();

    let response = engine
        .process_event_at(login_failure("10.0.0.1", now), now)
        .await;

    assert!(response.threat_score < 25, "score was {}", response.threat_score);
    assert!(matches!(
        response.action,
        ResponseAction::ContinueMonitoring | ResponseAction::EnhanceMonitoring
    ));
}

#[tokio::test]
async fn test_failed_login_burst_triggers_block_or_rate_limit() {
    let engine = engine();
    let now = Utc::now();

    let response = drive_burst(&engine, "10.0.0.5", 5, now).await;

    assert!(matches!(
        response.action,
        ResponseAction::BlockIp | ResponseAction::RateLimitIp
    ));
    assert!(response
        .factors
        .iter()
        .any(|f| f.contains("Failed login burst")));
}

#[tokio::test]
async fn test_unauthorized_access_burst_escalates() {
    let engine = engine();
    let now = Utc::now();

    let mut response = None;
    for minutes_ago in [9, 2] {
        let event = SecurityEvent::new(EventType::UnauthorizedAccess, Severity::High)
            .with_source_ip("10.0.0.2")
            .with_timestamp(now - Duration::minutes(minutes_ago));
        response = Some(engine.process_event_at(event, now).await);
    }
    let response = response.unwrap();

    assert!(response.threat_level >= ThreatLevel::High);
    assert!(matches!(
        response.action,
        ResponseAction::BlockIp | ResponseAction::RateLimitIp
    ));
}

#[tokio::test]
async fn test_block_lifecycle() {
    let engine = engine();
    let now = Utc::now();

    let response = drive_burst(&engine, "10.0.0.9", 5, now).await;
    assert_eq!(response.action, ResponseAction::BlockIp);
    assert!(response.executed_actions.contains(&ResponseAction::BlockIp));

    // Blocked while inside the (capped, 24h) duration
    assert!(engine.is_ip_blocked_at("10.0.0.9", now).await);
    assert!(
        engine
            .is_ip_blocked_at("10.0.0.9", now + Duration::hours(23))
            .await
    );

    // Lazy expiry: the first lookup past expiry removes the record
    assert!(
        !engine
            .is_ip_blocked_at("10.0.0.9", now + Duration::hours(25))
            .await
    );
    assert!(engine
        .list_active_blocks(now + Duration::hours(25))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_blocked_source_short_circuits() {
    let engine = engine();
    let now = Utc::now();

    drive_burst(&engine, "10.0.0.7", 5, now).await;
    assert!(engine.is_ip_blocked_at("10.0.0.7", now).await);

    let later = now + Duration::minutes(1);
    let response = engine
        .process_event_at(login_failure("10.0.0.7", later), later)
        .await;

    assert_eq!(response.action, ResponseAction::Blocked);
    assert!(response.executed_actions.is_empty());
}

#[tokio::test]
async fn test_manual_unblock() {
    let engine = engine();
    let now = Utc::now();

    drive_burst(&engine, "10.0.0.8", 5, now).await;
    assert!(engine.is_ip_blocked_at("10.0.0.8", now).await);

    let record = engine
        .unblock_ip("10.0.0.8", "operator verified legitimate source")
        .await
        .expect("block record should exist");

    assert!(record.unblocked_at.is_some());
    assert_eq!(
        record.unblock_reason.as_deref(),
        Some("operator verified legitimate source")
    );
    assert!(!engine.is_ip_blocked_at("10.0.0.8", now).await);
    assert!(engine.unblock_ip("10.0.0.8", "again").await.is_none());
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let engine = engine();
    let now = Utc::now();

    drive_burst(&engine, "10.0.0.4", 5, now).await;

    let later = now + Duration::hours(25);
    let first = engine.cleanup_at(later).await;
    assert_eq!(first.expired_blocks_removed, 1);

    let second = engine.cleanup_at(later).await;
    assert_eq!(second.expired_blocks_removed, 0);
    assert_eq!(second.expired_rate_limits_removed, 0);
    assert_eq!(second.history_entries_pruned, 0);
}

#[tokio::test]
async fn test_reputation_disabled_still_assesses() {
    let engine = engine();
    let now = Utc::now();

    let response = drive_burst(&engine, "10.0.0.6", 5, now).await;

    assert!(response.threat_score <= 100);
    assert!(!response.factors.is_empty());
    assert!(!response.factors.iter().any(|f| f.contains("reputation")));
}

#[tokio::test]
async fn test_historical_repeat_offender_scores_higher() {
    let config = EngineConfig {
        auto_block_enabled: false,
        ..Default::default()
    };
    let engine = engine_with(config);
    let t0 = Utc::now();

    // Build up an aggressive history for one source
    drive_burst(&engine, "10.0.1.1", 5, t0).await;

    // An hour later the burst has left the recent-events window, so only
    // the decayed history term separates the repeat offender from a
    // first-time source sending the same mild event.
    let t1 = t0 + Duration::minutes(61);
    let offender = engine
        .process_event_at(login_failure("10.0.1.1", t1), t1)
        .await;
    let newcomer = engine
        .process_event_at(login_failure("10.0.2.2", t1), t1)
        .await;

    assert!(
        offender.threat_score > newcomer.threat_score,
        "offender {} vs newcomer {}",
        offender.threat_score,
        newcomer.threat_score
    );
    assert!(offender
        .factors
        .iter()
        .any(|f| f.contains("Historical threat level")));
}

#[tokio::test]
async fn test_auto_block_disabled_computes_without_enforcing() {
    let config = EngineConfig {
        auto_block_enabled: false,
        ..Default::default()
    };
    let engine = engine_with(config);
    let now = Utc::now();

    let response = drive_burst(&engine, "10.0.3.3", 5, now).await;

    assert_eq!(response.action, ResponseAction::BlockIp);
    assert!(!response.executed_actions.contains(&ResponseAction::BlockIp));
    assert!(!engine.is_ip_blocked_at("10.0.3.3", now).await);
}

#[tokio::test]
async fn test_allowlisted_source_never_blocked() {
    let config = EngineConfig {
        allowlist: vec!["10.0.0.0/8".to_string()],
        ..Default::default()
    };
    let engine = engine_with(config);
    let now = Utc::now();

    let response = drive_burst(&engine, "10.0.4.4", 5, now).await;

    assert_eq!(response.action, ResponseAction::BlockIp);
    assert!(!engine.is_ip_blocked_at("10.0.4.4", now).await);
}

#[tokio::test]
async fn test_system_stats_reflect_state() {
    let engine = engine();
    let now = Utc::now();

    drive_burst(&engine, "10.0.5.5", 5, now).await;
    engine
        .process_event_at(login_failure("10.0.6.6", now), now)
        .await;

    let stats = engine.get_system_stats_at(now).await;
    assert_eq!(stats.active_blocks, 1);
    assert_eq!(stats.tracked_sources, 2);
    assert!(stats.average_threat_score > 0.0);
    assert!(stats.auto_block_enabled);
    assert_eq!(stats.threat_score_threshold, 70);
}
