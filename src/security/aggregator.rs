use crate::security::behavior::BehaviorAnalyzer;
use crate::security::event::{
    EventType, SecurityEvent, Severity, ThreatAssessment, ThreatLevel,
};
use crate::security::reputation::ReputationProvider;
use crate::security::rules::{EventMetrics, RuleContext, SecurityRuleEngine};
use crate::security::statistics;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const SERIES_LOGIN_FAILURES: &str = "login_failures";
pub const SERIES_EQUIPMENT_ERRORS: &str = "equipment_errors";
pub const SERIES_UNAUTHORIZED_ACCESS: &str = "unauthorized_access";

const LOGIN_ANOMALY_THRESHOLD: f64 = 2.5;
const UNAUTHORIZED_ANOMALY_THRESHOLD: f64 = 2.0;
const EQUIPMENT_OUTLIER_THRESHOLD: f64 = 2.0;
const RULE_CONFIDENCE: f64 = 0.8;

/// Everything one evaluation needs. Optional fields are explicit: signals
/// that require an IP, user, or station stay quiet when the field is absent.
#[derive(Debug, Clone)]
pub struct ThreatContext {
    pub recent_events: Vec<SecurityEvent>,
    /// Named numeric time-series, one count per trailing window bucket,
    /// oldest bucket first.
    pub series: HashMap<String, Vec<f64>>,
    pub source_ip: Option<String>,
    pub user_id: Option<String>,
    pub station_id: Option<String>,
    pub now: DateTime<Utc>,
}

/// `(timestamp, score)` pair appended to a source's history after each
/// evaluation; feeds the decayed historical term of future scores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreatHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub score: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Statistical,
    Rule,
    Reputation,
    Behavioral,
}

/// One signal's contribution before fusion.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatFinding {
    pub source: SignalSource,
    pub severity: Severity,
    pub confidence: f64,
    pub factor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub max_history_size: usize,
    pub threat_decay_hours: i64,
    pub reputation_timeout_seconds: u64,
    /// Share of the decayed historical threat level folded into new scores.
    pub history_weight: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_history_size: 1000,
            threat_decay_hours: 24,
            reputation_timeout_seconds: 3,
            history_weight: 0.3,
        }
    }
}

/// Fuses statistical anomalies, rule findings, IP reputation, and behavioral
/// patterns into one weighted `ThreatAssessment`, with per-source historical
/// decay. Never returns an error to its caller: unexpected failures become a
/// conservative fallback assessment.
pub struct ThreatAggregator {
    rules: SecurityRuleEngine,
    behavior: BehaviorAnalyzer,
    reputation: Arc<dyn ReputationProvider>,
    history: RwLock<HashMap<String, Vec<ThreatHistoryEntry>>>,
    config: AggregatorConfig,
}

impl ThreatAggregator {
    pub fn new(reputation: Arc<dyn ReputationProvider>, config: AggregatorConfig) -> Self {
        Self {
            rules: SecurityRuleEngine::with_default_rules(),
            behavior: BehaviorAnalyzer,
            reputation,
            history: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_rule_engine(mut self, rules: SecurityRuleEngine) -> Self {
        self.rules = rules;
        self
    }

    pub async fn evaluate_threat(&self, context: &ThreatContext) -> ThreatAssessment {
        match self.try_evaluate(context).await {
            Ok(assessment) => assessment,
            Err(e) => {
                warn!(error = %e, "Threat evaluation failed, returning fallback assessment");
                fallback_assessment(context.now)
            }
        }
    }

    async fn try_evaluate(&self, context: &ThreatContext) -> Result<ThreatAssessment> {
        let mut findings = self.statistical_findings(context);

        let metrics = EventMetrics::from_events(&context.recent_events);
        let rule_findings = self.rules.evaluate(&RuleContext {
            recent_events: &context.recent_events,
            metrics: &metrics,
            now: context.now,
        });
        let mut equipment_rule_fired = false;
        for finding in rule_findings {
            equipment_rule_fired |= finding.id == "equipment_error_rate";
            findings.push(ThreatFinding {
                source: SignalSource::Rule,
                severity: finding.severity,
                confidence: RULE_CONFIDENCE,
                factor: finding.message,
            });
        }

        let mut reputation_fired = false;
        if let Some(ip) = &context.source_ip {
            if let Some(finding) = self.reputation_finding(ip).await {
                reputation_fired = true;
                findings.push(finding);
            }
        }

        for pattern in self.behavior.analyze(
            &context.recent_events,
            context.user_id.as_deref(),
            context.station_id.as_deref(),
        ) {
            findings.push(ThreatFinding {
                source: SignalSource::Behavioral,
                severity: pattern.severity,
                confidence: pattern.confidence,
                factor: pattern.description,
            });
        }

        let mut score: f64 = findings
            .iter()
            .map(|f| severity_weight(f.severity) * f.confidence)
            .sum();
        let mut factors: Vec<String> = findings.iter().map(|f| f.factor.clone()).collect();

        let event_count = context.recent_events.len();
        if event_count > 0 {
            score += (event_count as f64).min(30.0);
            factors.push(format!("Event volume: {} events in window", event_count));
        }

        let failed_logins = metrics.type_count(EventType::LoginFailed);
        if failed_logins >= 3 {
            score += (failed_logins as f64 * 5.0).min(25.0);
            factors.push(format!(
                "Failed login pressure: {} failures in window",
                failed_logins
            ));
        }

        let unauthorized = metrics.type_count(EventType::UnauthorizedAccess);
        if unauthorized >= 2 {
            score += (unauthorized as f64 * 8.0).min(20.0);
            factors.push(format!(
                "Unauthorized access pressure: {} denied attempts in window",
                unauthorized
            ));
        }

        if let Some(ip) = &context.source_ip {
            let historical = self.historical_threat_level(ip, context.now).await;
            if historical > 0.0 {
                score += self.config.history_weight * historical;
                factors.push(format!(
                    "Historical threat level: {:.1} (decayed)",
                    historical
                ));
            }
        }

        let score = score.clamp(0.0, 100.0).round() as u8;
        let level = ThreatLevel::from_score(score);
        let severity = findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Low);
        let confidence = if findings.is_empty() {
            0.5
        } else {
            findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64
        };

        if factors.is_empty() {
            factors.push("Routine event processing: no threat signals fired".to_string());
        }

        let recommendations = recommendations_for(level, reputation_fired, equipment_rule_fired);

        if let Some(ip) = &context.source_ip {
            self.record_threat_score(ip, score, context.now).await;
        }

        debug!(
            score = score,
            level = level.as_str(),
            findings = findings.len(),
            "Threat evaluation completed"
        );

        Ok(ThreatAssessment {
            score,
            level,
            severity,
            factors,
            confidence,
            recommendations,
            timestamp: context.now,
        })
    }

    fn statistical_findings(&self, context: &ThreatContext) -> Vec<ThreatFinding> {
        let mut findings = Vec::new();

        if let Some(z) = series_last_point_z(context, SERIES_LOGIN_FAILURES) {
            if z >= LOGIN_ANOMALY_THRESHOLD {
                findings.push(anomaly_finding(
                    "Login failure burst: newest bucket broke from recent history",
                    z,
                    LOGIN_ANOMALY_THRESHOLD,
                ));
            }
        }

        if let Some(z) = series_last_point_z(context, SERIES_UNAUTHORIZED_ACCESS) {
            if z >= UNAUTHORIZED_ANOMALY_THRESHOLD {
                findings.push(anomaly_finding(
                    "Unauthorized access burst: newest bucket broke from recent history",
                    z,
                    UNAUTHORIZED_ANOMALY_THRESHOLD,
                ));
            }
        }

        if let Some(series) = context.series.get(SERIES_EQUIPMENT_ERRORS) {
            let outliers = statistics::detect_outliers(series, EQUIPMENT_OUTLIER_THRESHOLD);
            if !outliers.is_empty() {
                findings.push(ThreatFinding {
                    source: SignalSource::Statistical,
                    severity: Severity::High,
                    confidence: 0.7,
                    factor: format!(
                        "Equipment error outliers: {} buckets deviate from baseline",
                        outliers.len()
                    ),
                });
            }
        }

        // The detector must not go silent when data is sparse but clearly
        // unusual: fall back to coarser checks over the raw events.
        if findings.is_empty() && !context.recent_events.is_empty() {
            findings.extend(self.sparse_data_findings(context));
        }

        findings
    }

    fn sparse_data_findings(&self, context: &ThreatContext) -> Vec<ThreatFinding> {
        let mut findings = Vec::new();

        let mut counts: HashMap<EventType, usize> = HashMap::new();
        for event in &context.recent_events {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        if !counts.is_empty() {
            let max = counts.values().copied().max().unwrap_or(0);
            let avg = counts.values().sum::<usize>() as f64 / counts.len() as f64;
            if max > 5 && max as f64 > 3.0 * avg {
                findings.push(ThreatFinding {
                    source: SignalSource::Statistical,
                    severity: Severity::Medium,
                    confidence: 0.6,
                    factor: format!(
                        "Event type skew: one type accounts for {} of {} events",
                        max,
                        context.recent_events.len()
                    ),
                });
            }
        }

        let count = context.recent_events.len();
        if count >= 3 {
            let oldest = context
                .recent_events
                .iter()
                .map(|e| e.timestamp)
                .min()
                .unwrap_or(context.now);
            let span_minutes = ((context.now - oldest).num_seconds() as f64 / 60.0).max(1.0);
            let rate = count as f64 / span_minutes;
            if rate > 1.5 {
                findings.push(ThreatFinding {
                    source: SignalSource::Statistical,
                    severity: Severity::Medium,
                    confidence: 0.6,
                    factor: format!("Event rate burst: {:.1} events/min", rate),
                });
            }
        }

        if findings.is_empty() {
            for (key, series) in &context.series {
                let mean = statistics::mean(series);
                if mean > 0.0 && statistics::std_dev(series) > 0.5 * mean {
                    findings.push(ThreatFinding {
                        source: SignalSource::Statistical,
                        severity: Severity::Medium,
                        confidence: 0.5,
                        factor: format!("Irregular activity variance in {} series", key),
                    });
                    break;
                }
            }
        }

        findings
    }

    async fn reputation_finding(&self, ip: &str) -> Option<ThreatFinding> {
        if !self.reputation.is_enabled() {
            return None;
        }

        let timeout = std::time::Duration::from_secs(self.config.reputation_timeout_seconds);
        let report = match tokio::time::timeout(timeout, self.reputation.check_ip(ip)).await {
            Ok(report) => report,
            Err(_) => {
                debug!(ip = ip, "IP reputation lookup timed out, skipping signal");
                return None;
            }
        };

        if report.supported && report.is_malicious {
            Some(ThreatFinding {
                source: SignalSource::Reputation,
                severity: Severity::High,
                confidence: report.reputation as f64 / 100.0,
                factor: format!(
                    "Malicious IP reputation: {} scored {} by {}",
                    ip, report.reputation, report.provider
                ),
            })
        } else {
            None
        }
    }

    /// Exponentially decayed weighted average over the source's history
    /// entries inside the decay window; most recent entry has rank 0.
    pub async fn historical_threat_level(&self, source: &str, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::hours(self.config.threat_decay_hours);
        let history = self.history.read().await;
        let Some(entries) = history.get(source) else {
            return 0.0;
        };

        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for (rank, entry) in entries
            .iter()
            .rev()
            .filter(|e| e.timestamp > cutoff)
            .enumerate()
        {
            let weight = (-0.1 * rank as f64).exp();
            weighted_sum += weight * entry.score as f64;
            weight_sum += weight;
        }

        if weight_sum > 0.0 {
            weighted_sum / weight_sum
        } else {
            0.0
        }
    }

    pub async fn record_threat_score(&self, source: &str, score: u8, at: DateTime<Utc>) {
        let mut history = self.history.write().await;
        let entries = history.entry(source.to_string()).or_default();
        entries.push(ThreatHistoryEntry {
            timestamp: at,
            score,
        });
        if entries.len() > self.config.max_history_size {
            let excess = entries.len() - self.config.max_history_size;
            entries.drain(..excess);
        }
    }

    /// Drop history entries older than `cutoff` across all sources and
    /// return how many were removed. Empty sources are forgotten.
    pub async fn prune_history(&self, cutoff: DateTime<Utc>) -> usize {
        let mut history = self.history.write().await;
        let mut removed = 0;
        history.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.timestamp > cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    pub async fn tracked_sources(&self) -> usize {
        self.history.read().await.len()
    }

    /// Mean of the most recent score per tracked source.
    pub async fn average_threat_score(&self) -> f64 {
        let history = self.history.read().await;
        let latest: Vec<f64> = history
            .values()
            .filter_map(|entries| entries.last().map(|e| e.score as f64))
            .collect();
        statistics::mean(&latest)
    }
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 10.0,
        Severity::Medium => 25.0,
        Severity::High => 50.0,
        Severity::Critical => 75.0,
    }
}

fn anomaly_finding(message: &str, z: f64, threshold: f64) -> ThreatFinding {
    ThreatFinding {
        source: SignalSource::Statistical,
        severity: Severity::High,
        confidence: (z / (threshold * 2.0)).clamp(0.6, 1.0),
        factor: format!("{} (z={:.1})", message, z),
    }
}

fn series_last_point_z(context: &ThreatContext, key: &str) -> Option<f64> {
    let series = context.series.get(key)?;
    let finite: Vec<f64> = series.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 3 {
        return None;
    }
    let (baseline, last) = finite.split_at(finite.len() - 1);
    Some(statistics::last_point_z(
        last[0],
        statistics::mean(baseline),
        statistics::std_dev(baseline),
    ))
}

fn fallback_assessment(now: DateTime<Utc>) -> ThreatAssessment {
    ThreatAssessment {
        score: 0,
        level: ThreatLevel::Low,
        severity: Severity::Low,
        factors: vec!["Threat evaluation degraded: conservative fallback assessment".to_string()],
        confidence: 0.1,
        recommendations: vec!["Continue routine monitoring".to_string()],
        timestamp: now,
    }
}

fn recommendations_for(
    level: ThreatLevel,
    reputation_fired: bool,
    equipment_rule_fired: bool,
) -> Vec<String> {
    let mut recommendations = match level {
        ThreatLevel::Critical => vec![
            "Block the source and notify the security team immediately".to_string(),
            "Consider a temporary system lockdown".to_string(),
        ],
        ThreatLevel::High => vec![
            "Rate-limit the source and increase monitoring".to_string(),
        ],
        ThreatLevel::Medium => vec![
            "Enhance monitoring for this source".to_string(),
            "Flag for analyst review".to_string(),
        ],
        ThreatLevel::Low => vec!["Continue routine monitoring".to_string()],
    };

    if reputation_fired {
        recommendations.push("Verify IP legitimacy against the reputation report".to_string());
    }
    if equipment_rule_fired {
        recommendations.push("Schedule inspection of the affected equipment".to_string());
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::reputation::DisabledReputationProvider;
    use async_trait::async_trait;
    use crate::security::reputation::ReputationReport;

    fn aggregator() -> ThreatAggregator {
        ThreatAggregator::new(
            Arc::new(DisabledReputationProvider),
            AggregatorConfig::default(),
        )
    }

    fn context_with_events(events: Vec<SecurityEvent>) -> ThreatContext {
        ThreatContext {
            recent_events: events,
            series: HashMap::new(),
            source_ip: Some("10.1.1.1".to_string()),
            user_id: None,
            station_id: None,
            now: Utc::now(),
        }
    }

    struct MaliciousProvider;

    #[async_trait]
    impl ReputationProvider for MaliciousProvider {
        fn is_enabled(&self) -> bool {
            true
        }

        async fn check_ip(&self, ip: &str) -> ReputationReport {
            ReputationReport {
                provider: "test".to_string(),
                supported: true,
                ip: ip.to_string(),
                reputation: 90,
                is_malicious: true,
                country_code: None,
                usage_type: None,
                isp: None,
                last_reported_at: None,
                reason: None,
            }
        }
    }

    #[tokio::test]
    async fn test_factors_never_empty() {
        let assessment = aggregator()
            .evaluate_threat(&context_with_events(Vec::new()))
            .await;
        assert!(!assessment.factors.is_empty());
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.level, ThreatLevel::Low);
    }

    #[tokio::test]
    async fn test_score_is_bounded() {
        let now = Utc::now();
        let events: Vec<SecurityEvent> = (0..60)
            .map(|i| {
                SecurityEvent::new(EventType::LoginFailed, Severity::Critical)
                    .with_source_ip("10.1.1.1")
                    .with_timestamp(now - Duration::seconds(i))
            })
            .collect();
        let assessment = aggregator().evaluate_threat(&context_with_events(events)).await;
        assert!(assessment.score <= 100);
        assert_eq!(assessment.level, ThreatLevel::Critical);
    }

    #[tokio::test]
    async fn test_failed_login_burst_scores_high() {
        let now = Utc::now();
        let events: Vec<SecurityEvent> = (0..5)
            .map(|i| {
                SecurityEvent::new(EventType::LoginFailed, Severity::Medium)
                    .with_source_ip("10.1.1.1")
                    .with_timestamp(now - Duration::seconds(20 * i))
            })
            .collect();

        let assessment = aggregator().evaluate_threat(&context_with_events(events)).await;
        assert!(assessment.score >= 50, "score was {}", assessment.score);
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.contains("Failed login burst")));
    }

    #[tokio::test]
    async fn test_named_series_anomaly_fires() {
        let mut series = HashMap::new();
        series.insert(
            SERIES_LOGIN_FAILURES.to_string(),
            vec![0.0, 1.0, 0.0, 1.0, 9.0],
        );
        let context = ThreatContext {
            recent_events: Vec::new(),
            series,
            source_ip: None,
            user_id: None,
            station_id: None,
            now: Utc::now(),
        };

        let assessment = aggregator().evaluate_threat(&context).await;
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.contains("Login failure burst")));
        assert!(assessment.score > 0);
    }

    #[tokio::test]
    async fn test_reputation_contributes_when_malicious() {
        let aggregator = ThreatAggregator::new(
            Arc::new(MaliciousProvider),
            AggregatorConfig::default(),
        );
        let event = SecurityEvent::new(EventType::LoginFailed, Severity::Low)
            .with_source_ip("203.0.113.9");
        let mut context = context_with_events(vec![event]);
        context.source_ip = Some("203.0.113.9".to_string());

        let assessment = aggregator.evaluate_threat(&context).await;
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.contains("Malicious IP reputation")));
        assert!(assessment
            .recommendations
            .iter()
            .any(|r| r.contains("Verify IP legitimacy")));
    }

    #[tokio::test]
    async fn test_disabled_reputation_never_contributes() {
        let event = SecurityEvent::new(EventType::LoginFailed, Severity::Low)
            .with_source_ip("203.0.113.9");
        let assessment = aggregator()
            .evaluate_threat(&context_with_events(vec![event]))
            .await;
        assert!(!assessment
            .factors
            .iter()
            .any(|f| f.contains("reputation")));
    }

    #[tokio::test]
    async fn test_historical_decay_weights_recent_entries() {
        let aggregator = aggregator();
        let now = Utc::now();
        aggregator
            .record_threat_score("10.2.2.2", 20, now - Duration::minutes(30))
            .await;
        aggregator.record_threat_score("10.2.2.2", 80, now).await;

        let level = aggregator.historical_threat_level("10.2.2.2", now).await;
        // Most recent entry (80) has rank 0 and must dominate
        assert!(level > 50.0, "level was {}", level);
        assert!(level < 80.0);
    }

    #[tokio::test]
    async fn test_history_outside_decay_window_is_ignored() {
        let aggregator = aggregator();
        let now = Utc::now();
        aggregator
            .record_threat_score("10.3.3.3", 90, now - Duration::hours(48))
            .await;
        let level = aggregator.historical_threat_level("10.3.3.3", now).await;
        assert_eq!(level, 0.0);
    }

    #[tokio::test]
    async fn test_repeat_offender_score_elevated() {
        let aggregator = aggregator();
        let now = Utc::now();
        for i in 0..5 {
            aggregator
                .record_threat_score("10.4.4.4", 80, now - Duration::minutes(10 * i))
                .await;
        }

        let event = SecurityEvent::new(EventType::LoginFailed, Severity::Low)
            .with_source_ip("10.4.4.4")
            .with_timestamp(now);
        let mut context = context_with_events(vec![event]);
        context.source_ip = Some("10.4.4.4".to_string());

        let assessment = aggregator.evaluate_threat(&context).await;
        // One mild event alone contributes ~1; the decayed history term
        // (30% of ~80) must dominate the fused score.
        assert!(assessment.score >= 20, "score was {}", assessment.score);
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.contains("Historical threat level")));
    }

    #[tokio::test]
    async fn test_history_capped_at_max_size() {
        let config = AggregatorConfig {
            max_history_size: 10,
            ..Default::default()
        };
        let aggregator =
            ThreatAggregator::new(Arc::new(DisabledReputationProvider), config);
        let now = Utc::now();
        for i in 0..25 {
            aggregator
                .record_threat_score("10.5.5.5", i as u8, now)
                .await;
        }

        let history = aggregator.history.read().await;
        assert_eq!(history.get("10.5.5.5").unwrap().len(), 10);
        // Oldest entries were evicted first
        assert_eq!(history.get("10.5.5.5").unwrap()[0].score, 15);
    }

    #[tokio::test]
    async fn test_prune_history_is_idempotent() {
        let aggregator = aggregator();
        let now = Utc::now();
        aggregator
            .record_threat_score("10.6.6.6", 40, now - Duration::days(8))
            .await;
        aggregator.record_threat_score("10.6.6.6", 40, now).await;

        let cutoff = now - Duration::days(7);
        assert_eq!(aggregator.prune_history(cutoff).await, 1);
        assert_eq!(aggregator.prune_history(cutoff).await, 0);
    }
}
