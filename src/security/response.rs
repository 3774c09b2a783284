use crate::config::EngineConfig;
use crate::metrics;
use crate::security::aggregator::{
    AggregatorConfig, ThreatAggregator, ThreatContext, SERIES_EQUIPMENT_ERRORS,
    SERIES_LOGIN_FAILURES, SERIES_UNAUTHORIZED_ACCESS,
};
use crate::security::alerts::AlertSink;
use crate::security::event::{EventType, SecurityEvent, ThreatAssessment, ThreatLevel};
use crate::security::reputation::ReputationProvider;
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EVENT_BUFFER_CAP: usize = 100;
const RECENT_WINDOW_MINUTES: i64 = 60;
const RATE_LIMIT_MINUTES: i64 = 30;
const HISTORY_RETENTION_DAYS: i64 = 7;
/// Trailing window boundaries for the bucketed series, oldest bucket first.
const SERIES_BOUNDARIES_MINUTES: [i64; 6] = [60, 30, 15, 5, 1, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    BlockIp,
    RateLimitIp,
    EnhanceMonitoring,
    ContinueMonitoring,
    NotifySecurityTeam,
    LogIncident,
    FlagForReview,
    ConsiderLockdown,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "none")]
    None,
}

impl ResponseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseAction::BlockIp => "block_ip",
            ResponseAction::RateLimitIp => "rate_limit_ip",
            ResponseAction::EnhanceMonitoring => "enhance_monitoring",
            ResponseAction::ContinueMonitoring => "continue_monitoring",
            ResponseAction::NotifySecurityTeam => "notify_security_team",
            ResponseAction::LogIncident => "log_incident",
            ResponseAction::FlagForReview => "flag_for_review",
            ResponseAction::ConsiderLockdown => "consider_lockdown",
            ResponseAction::Blocked => "blocked",
            ResponseAction::None => "none",
        }
    }
}

/// Lifecycle record of a blocked source. Removed from the active map on
/// expiry check or manual unblock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub threat_score: u8,
    pub threat_level: ThreatLevel,
    pub duration_seconds: i64,
    pub expires_at: DateTime<Utc>,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub unblock_reason: Option<String>,
}

/// Lighter-weight throttling state, separate from the block map. Signals
/// downstream throttling only; does not stop event processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub threat_score: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreatResponse {
    pub action: ResponseAction,
    pub threat_level: ThreatLevel,
    pub threat_score: u8,
    pub executed_actions: Vec<ResponseAction>,
    pub recommendations: Vec<String>,
    pub factors: Vec<String>,
    pub reason: Option<String>,
}

impl ThreatResponse {
    fn noop(reason: &str) -> Self {
        Self {
            action: ResponseAction::None,
            threat_level: ThreatLevel::Low,
            threat_score: 0,
            executed_actions: Vec::new(),
            recommendations: Vec::new(),
            factors: Vec::new(),
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub expired_blocks_removed: usize,
    pub expired_rate_limits_removed: usize,
    pub history_entries_pruned: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub active_blocks: usize,
    pub expired_blocks_pending_cleanup: usize,
    pub rate_limited_sources: usize,
    pub tracked_sources: usize,
    pub average_threat_score: f64,
    pub threat_score_threshold: u8,
    pub auto_block_enabled: bool,
    pub max_block_duration_hours: i64,
    pub max_history_size: usize,
    pub threat_decay_hours: i64,
}

/// Top-level orchestrator: buffers recent events per source, scores them
/// through the aggregator, maps assessments to response actions, and owns
/// the block-lifecycle state machine.
pub struct ThreatResponseSystem {
    aggregator: ThreatAggregator,
    alerts: Arc<dyn AlertSink>,
    config: EngineConfig,
    allowlist: Vec<IpNet>,
    buffers: RwLock<HashMap<String, VecDeque<SecurityEvent>>>,
    blocked: RwLock<HashMap<String, BlockRecord>>,
    rate_limited: RwLock<HashMap<String, RateLimitRecord>>,
}

impl ThreatResponseSystem {
    pub fn new(
        config: EngineConfig,
        reputation: Arc<dyn ReputationProvider>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let aggregator = ThreatAggregator::new(
            reputation,
            AggregatorConfig {
                max_history_size: config.max_history_size,
                threat_decay_hours: config.threat_decay_hours,
                reputation_timeout_seconds: config.reputation.timeout_seconds,
                ..Default::default()
            },
        );
        let allowlist = config.allowlist_nets();

        Self {
            aggregator,
            alerts,
            config,
            allowlist,
            buffers: RwLock::new(HashMap::new()),
            blocked: RwLock::new(HashMap::new()),
            rate_limited: RwLock::new(HashMap::new()),
        }
    }

    pub async fn process_security_event(&self, event: SecurityEvent) -> ThreatResponse {
        self.process_event_at(event, Utc::now()).await
    }

    /// Same as [`process_security_event`] with an explicit clock, so the
    /// lifecycle can be driven with simulated time.
    pub async fn process_event_at(
        &self,
        event: SecurityEvent,
        now: DateTime<Utc>,
    ) -> ThreatResponse {
        let Some(ip) = event.source_ip.clone() else {
            debug!("Event without source IP, skipping threat processing");
            return ThreatResponse::noop("No source IP");
        };

        metrics::EVENTS_TOTAL.inc();

        // Already-blocked sources short-circuit without re-evaluation.
        if let Some(record) = self.active_block(&ip, now).await {
            debug!(ip = ip.as_str(), "Event from blocked source");
            return ThreatResponse {
                action: ResponseAction::Blocked,
                threat_level: record.threat_level,
                threat_score: record.threat_score,
                executed_actions: Vec::new(),
                recommendations: Vec::new(),
                factors: Vec::new(),
                reason: Some("Source is blocked".to_string()),
            };
        }

        let recent_events = self.buffer_event(&ip, event.clone(), now).await;
        let series = build_series(&recent_events, now);

        let context = ThreatContext {
            recent_events,
            series,
            source_ip: Some(ip.clone()),
            user_id: event.user_id.clone(),
            station_id: event.station_id.clone(),
            now,
        };
        let assessment = self.aggregator.evaluate_threat(&context).await;

        let primary = select_primary_action(
            assessment.score,
            assessment.level,
            self.config.threat_score_threshold,
        );

        let mut executed_actions = Vec::new();
        if self
            .execute_action(primary, &assessment, &event, &ip, now)
            .await
        {
            executed_actions.push(primary);
        }

        for action in secondary_actions(assessment.level) {
            if action == primary {
                continue;
            }
            if self
                .execute_action(action, &assessment, &event, &ip, now)
                .await
            {
                executed_actions.push(action);
            }
        }

        info!(
            ip = ip.as_str(),
            score = assessment.score,
            level = assessment.level.as_str(),
            action = primary.as_str(),
            "Threat response computed"
        );

        ThreatResponse {
            action: primary,
            threat_level: assessment.level,
            threat_score: assessment.score,
            executed_actions,
            recommendations: assessment.recommendations,
            factors: assessment.factors,
            reason: None,
        }
    }

    /// Append to the source's bounded buffer and return the events inside
    /// the recent window, oldest first.
    async fn buffer_event(
        &self,
        ip: &str,
        event: SecurityEvent,
        now: DateTime<Utc>,
    ) -> Vec<SecurityEvent> {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers.entry(ip.to_string()).or_default();
        buffer.push_back(event);
        while buffer.len() > EVENT_BUFFER_CAP {
            buffer.pop_front();
        }

        let cutoff = now - Duration::minutes(RECENT_WINDOW_MINUTES);
        buffer
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .cloned()
            .collect()
    }

    /// Runs one response action; returns whether it was actually executed.
    /// Failures are logged and never abort the remaining actions.
    async fn execute_action(
        &self,
        action: ResponseAction,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
        ip: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let result = match action {
            ResponseAction::BlockIp => return self.block_ip_at(ip, assessment, now).await,
            ResponseAction::RateLimitIp => return self.rate_limit_ip_at(ip, assessment, now).await,
            ResponseAction::EnhanceMonitoring => {
                self.alerts.enhance_monitoring(assessment, event).await
            }
            ResponseAction::ContinueMonitoring => {
                debug!(ip = ip, "Continuing routine monitoring");
                Ok(())
            }
            ResponseAction::NotifySecurityTeam => {
                self.alerts.notify_security_team(assessment, event).await
            }
            ResponseAction::LogIncident => self.alerts.log_incident(assessment, event).await,
            ResponseAction::FlagForReview => self.alerts.flag_for_review(assessment, event).await,
            ResponseAction::ConsiderLockdown => {
                self.alerts.consider_system_lockdown(assessment, event).await
            }
            ResponseAction::Blocked | ResponseAction::None => Ok(()),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(action = action.as_str(), error = %e, "Response action failed, skipping");
                false
            }
        }
    }

    async fn block_ip_at(
        &self,
        ip: &str,
        assessment: &ThreatAssessment,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_allowlisted(ip) {
            info!(ip = ip, "Source is allowlisted, skipping block");
            return false;
        }
        if !self.config.auto_block_enabled {
            info!(ip = ip, score = assessment.score, "Auto-block disabled, block not enforced");
            return false;
        }

        let proposed = block_duration_for(assessment.score);
        let cap = Duration::hours(self.config.max_block_duration_hours);
        let duration = if proposed > cap { cap } else { proposed };

        let record = BlockRecord {
            ip: ip.to_string(),
            timestamp: now,
            reason: assessment.factors.join("; "),
            threat_score: assessment.score,
            threat_level: assessment.level,
            duration_seconds: duration.num_seconds(),
            expires_at: now + duration,
            unblocked_at: None,
            unblock_reason: None,
        };

        info!(
            ip = ip,
            score = assessment.score,
            duration_hours = duration.num_hours(),
            "Blocking source"
        );

        // Re-blocking replaces rather than stacks the existing record.
        let mut blocked = self.blocked.write().await;
        blocked.insert(ip.to_string(), record);
        metrics::BLOCKS_TOTAL.inc();
        metrics::ACTIVE_BLOCKS.set(blocked.len() as i64);
        true
    }

    async fn rate_limit_ip_at(
        &self,
        ip: &str,
        assessment: &ThreatAssessment,
        now: DateTime<Utc>,
    ) -> bool {
        if self.is_allowlisted(ip) {
            info!(ip = ip, "Source is allowlisted, skipping rate limit");
            return false;
        }
        if !self.config.auto_block_enabled {
            info!(ip = ip, "Auto-block disabled, rate limit not enforced");
            return false;
        }

        let mut rate_limited = self.rate_limited.write().await;
        rate_limited.insert(
            ip.to_string(),
            RateLimitRecord {
                ip: ip.to_string(),
                timestamp: now,
                expires_at: now + Duration::minutes(RATE_LIMIT_MINUTES),
                threat_score: assessment.score,
            },
        );
        metrics::RATE_LIMITS_TOTAL.inc();
        info!(ip = ip, score = assessment.score, "Rate-limiting source");
        true
    }

    /// Active block record for the source, expiring lazily: a record past
    /// its expiry is deleted on lookup and not returned.
    async fn active_block(&self, ip: &str, now: DateTime<Utc>) -> Option<BlockRecord> {
        {
            let blocked = self.blocked.read().await;
            match blocked.get(ip) {
                Some(record) if record.expires_at > now => return Some(record.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut blocked = self.blocked.write().await;
        if let Some(record) = blocked.get(ip) {
            if record.expires_at <= now {
                blocked.remove(ip);
                metrics::ACTIVE_BLOCKS.set(blocked.len() as i64);
                debug!(ip = ip, "Block expired, removing record");
                return None;
            }
            return Some(record.clone());
        }
        None
    }

    pub async fn is_ip_blocked(&self, ip: &str) -> bool {
        self.is_ip_blocked_at(ip, Utc::now()).await
    }

    pub async fn is_ip_blocked_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.active_block(ip, now).await.is_some()
    }

    pub async fn is_ip_rate_limited_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        {
            let rate_limited = self.rate_limited.read().await;
            match rate_limited.get(ip) {
                Some(record) if record.expires_at > now => return true,
                Some(_) => {}
                None => return false,
            }
        }
        let mut rate_limited = self.rate_limited.write().await;
        if let Some(record) = rate_limited.get(ip) {
            if record.expires_at <= now {
                rate_limited.remove(ip);
                return false;
            }
            return true;
        }
        false
    }

    /// Explicit unblock, independent of natural expiry. Returns the record
    /// stamped with the unblock time and reason.
    pub async fn unblock_ip(&self, ip: &str, reason: &str) -> Option<BlockRecord> {
        let mut blocked = self.blocked.write().await;
        let mut record = blocked.remove(ip)?;
        record.unblocked_at = Some(Utc::now());
        record.unblock_reason = Some(reason.to_string());
        metrics::ACTIVE_BLOCKS.set(blocked.len() as i64);
        info!(ip = ip, reason = reason, "Source unblocked");
        Some(record)
    }

    pub async fn list_active_blocks(&self, now: DateTime<Utc>) -> Vec<BlockRecord> {
        let blocked = self.blocked.read().await;
        blocked
            .values()
            .filter(|r| r.expires_at > now)
            .cloned()
            .collect()
    }

    pub async fn historical_threat_level(&self, ip: &str, now: DateTime<Utc>) -> f64 {
        self.aggregator.historical_threat_level(ip, now).await
    }

    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now()).await
    }

    /// Idempotent maintenance pass: drops expired blocks and rate limits,
    /// and prunes threat history older than the retention window. Safe to
    /// call on any schedule.
    pub async fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let expired_blocks_removed = {
            let mut blocked = self.blocked.write().await;
            let before = blocked.len();
            blocked.retain(|_, record| record.expires_at > now);
            metrics::ACTIVE_BLOCKS.set(blocked.len() as i64);
            before - blocked.len()
        };

        let expired_rate_limits_removed = {
            let mut rate_limited = self.rate_limited.write().await;
            let before = rate_limited.len();
            rate_limited.retain(|_, record| record.expires_at > now);
            before - rate_limited.len()
        };

        let history_entries_pruned = self
            .aggregator
            .prune_history(now - Duration::days(HISTORY_RETENTION_DAYS))
            .await;

        info!(
            expired_blocks = expired_blocks_removed,
            expired_rate_limits = expired_rate_limits_removed,
            history_pruned = history_entries_pruned,
            "Cleanup pass completed"
        );

        CleanupReport {
            expired_blocks_removed,
            expired_rate_limits_removed,
            history_entries_pruned,
        }
    }

    pub async fn get_system_stats(&self) -> SystemStats {
        self.get_system_stats_at(Utc::now()).await
    }

    pub async fn get_system_stats_at(&self, now: DateTime<Utc>) -> SystemStats {
        let (active_blocks, expired_blocks_pending_cleanup) = {
            let blocked = self.blocked.read().await;
            let active = blocked.values().filter(|r| r.expires_at > now).count();
            (active, blocked.len() - active)
        };
        let rate_limited_sources = self.rate_limited.read().await.len();

        SystemStats {
            active_blocks,
            expired_blocks_pending_cleanup,
            rate_limited_sources,
            tracked_sources: self.aggregator.tracked_sources().await,
            average_threat_score: self.aggregator.average_threat_score().await,
            threat_score_threshold: self.config.threat_score_threshold,
            auto_block_enabled: self.config.auto_block_enabled,
            max_block_duration_hours: self.config.max_block_duration_hours,
            max_history_size: self.config.max_history_size,
            threat_decay_hours: self.config.threat_decay_hours,
        }
    }

    fn is_allowlisted(&self, ip: &str) -> bool {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.allowlist.iter().any(|net| net.contains(&addr))
    }
}

/// First match wins, most severe first.
fn select_primary_action(score: u8, level: ThreatLevel, block_threshold: u8) -> ResponseAction {
    if score >= 80 {
        ResponseAction::BlockIp
    } else if score >= block_threshold || level == ThreatLevel::Critical {
        ResponseAction::BlockIp
    } else if score >= 60 {
        ResponseAction::RateLimitIp
    } else if score >= 50 || level == ThreatLevel::High {
        ResponseAction::RateLimitIp
    } else if score >= 25 || level == ThreatLevel::Medium {
        ResponseAction::EnhanceMonitoring
    } else {
        ResponseAction::ContinueMonitoring
    }
}

fn secondary_actions(level: ThreatLevel) -> Vec<ResponseAction> {
    match level {
        ThreatLevel::Critical => vec![
            ResponseAction::BlockIp,
            ResponseAction::NotifySecurityTeam,
            ResponseAction::LogIncident,
            ResponseAction::EnhanceMonitoring,
            ResponseAction::ConsiderLockdown,
        ],
        ThreatLevel::High => vec![
            ResponseAction::RateLimitIp,
            ResponseAction::NotifySecurityTeam,
            ResponseAction::LogIncident,
            ResponseAction::EnhanceMonitoring,
        ],
        ThreatLevel::Medium => vec![
            ResponseAction::LogIncident,
            ResponseAction::EnhanceMonitoring,
            ResponseAction::FlagForReview,
        ],
        ThreatLevel::Low => vec![
            ResponseAction::LogIncident,
            ResponseAction::ContinueMonitoring,
        ],
    }
}

/// Score-driven block duration; the configured cap is applied by the caller.
fn block_duration_for(score: u8) -> Duration {
    match score {
        s if s >= 90 => Duration::days(7),
        s if s >= 80 => Duration::days(3),
        s if s >= 70 => Duration::days(1),
        s if s >= 60 => Duration::hours(6),
        _ => Duration::hours(2),
    }
}

/// Bucketed counts per series key over the trailing windows, one count per
/// disjoint bucket between consecutive boundaries, oldest bucket first.
fn build_series(events: &[SecurityEvent], now: DateTime<Utc>) -> HashMap<String, Vec<f64>> {
    let mut series = HashMap::new();
    for (key, event_type) in [
        (SERIES_LOGIN_FAILURES, EventType::LoginFailed),
        (SERIES_EQUIPMENT_ERRORS, EventType::EquipmentError),
        (SERIES_UNAUTHORIZED_ACCESS, EventType::UnauthorizedAccess),
    ] {
        let mut buckets = vec![0.0; SERIES_BOUNDARIES_MINUTES.len() - 1];
        for event in events.iter().filter(|e| e.event_type == event_type) {
            let age_minutes = (now - event.timestamp).num_seconds() as f64 / 60.0;
            for i in 0..buckets.len() {
                let start = SERIES_BOUNDARIES_MINUTES[i] as f64;
                let end = SERIES_BOUNDARIES_MINUTES[i + 1] as f64;
                if age_minutes <= start && age_minutes > end {
                    buckets[i] += 1.0;
                    break;
                }
            }
        }
        series.insert(key.to_string(), buckets);
    }
    series
}
