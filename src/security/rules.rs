use crate::security::event::{EventType, SecurityEvent, Severity};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// Shared context every rule condition is evaluated against.
pub struct RuleContext<'a> {
    pub recent_events: &'a [SecurityEvent],
    pub metrics: &'a EventMetrics,
    pub now: DateTime<Utc>,
}

/// Per-severity and per-type counts over the recent event window.
#[derive(Debug, Default)]
pub struct EventMetrics {
    pub by_type: HashMap<EventType, usize>,
    pub by_severity: HashMap<Severity, usize>,
}

impl EventMetrics {
    pub fn from_events(events: &[SecurityEvent]) -> Self {
        let mut metrics = Self::default();
        for event in events {
            *metrics.by_type.entry(event.event_type).or_insert(0) += 1;
            *metrics.by_severity.entry(event.severity).or_insert(0) += 1;
        }
        metrics
    }

    pub fn type_count(&self, event_type: EventType) -> usize {
        self.by_type.get(&event_type).copied().unwrap_or(0)
    }

    pub fn severity_count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}

/// Output of one matching rule. Ephemeral: produced and consumed within a
/// single aggregation pass.
#[derive(Debug, Clone, Serialize)]
pub struct RuleFinding {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

type Condition = Box<dyn Fn(&RuleContext) -> Result<bool> + Send + Sync>;
type MetadataFn = Box<dyn Fn(&RuleContext) -> serde_json::Value + Send + Sync>;

/// A detection heuristic as data: id, severity, message, and a predicate.
/// New heuristics are added by registering closures, not by subclassing.
pub struct SecurityRule {
    pub id: &'static str,
    pub severity: Severity,
    pub message: &'static str,
    condition: Condition,
    metadata: Option<MetadataFn>,
}

impl SecurityRule {
    pub fn new(
        id: &'static str,
        severity: Severity,
        message: &'static str,
        condition: impl Fn(&RuleContext) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            severity,
            message,
            condition: Box::new(condition),
            metadata: None,
        }
    }

    pub fn with_metadata(
        mut self,
        metadata: impl Fn(&RuleContext) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.metadata = Some(Box::new(metadata));
        self
    }
}

/// Ordered rule registry. Every rule's condition runs against the shared
/// context; matches become findings in registration order. A failing
/// condition is skipped without aborting the batch.
pub struct SecurityRuleEngine {
    rules: Vec<SecurityRule>,
}

impl SecurityRuleEngine {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_default_rules() -> Self {
        let mut engine = Self::new();
        for rule in default_manufacturing_rules() {
            engine.register(rule);
        }
        engine
    }

    pub fn register(&mut self, rule: SecurityRule) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn evaluate(&self, context: &RuleContext) -> Vec<RuleFinding> {
        let mut findings = Vec::new();
        for rule in &self.rules {
            match (rule.condition)(context) {
                Ok(true) => {
                    findings.push(RuleFinding {
                        id: rule.id.to_string(),
                        severity: rule.severity,
                        message: rule.message.to_string(),
                        metadata: rule.metadata.as_ref().map(|f| f(context)),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "Rule condition failed, skipping");
                }
            }
        }
        findings
    }
}

impl Default for SecurityRuleEngine {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

fn count_in_window(
    context: &RuleContext,
    event_type: EventType,
    window: Duration,
) -> usize {
    let cutoff = context.now - window;
    context
        .recent_events
        .iter()
        .filter(|e| e.event_type == event_type && e.timestamp > cutoff)
        .count()
}

fn severity_in_window(context: &RuleContext, severity: Severity, window: Duration) -> usize {
    let cutoff = context.now - window;
    context
        .recent_events
        .iter()
        .filter(|e| e.severity == severity && e.timestamp > cutoff)
        .count()
}

/// The stock detection rules for the manufacturing backend.
pub fn default_manufacturing_rules() -> Vec<SecurityRule> {
    vec![
        SecurityRule::new(
            "failed_login_burst",
            Severity::High,
            "Failed login burst: repeated authentication failures in a short window",
            |ctx| Ok(count_in_window(ctx, EventType::LoginFailed, Duration::minutes(5)) >= 5),
        )
        .with_metadata(|ctx| {
            serde_json::json!({
                "count": count_in_window(ctx, EventType::LoginFailed, Duration::minutes(5)),
                "window_minutes": 5,
            })
        }),
        SecurityRule::new(
            "equipment_error_rate",
            Severity::Critical,
            "Equipment error rate: repeated equipment failures in a short window",
            |ctx| Ok(count_in_window(ctx, EventType::EquipmentError, Duration::minutes(10)) >= 3),
        )
        .with_metadata(|ctx| {
            serde_json::json!({
                "count": count_in_window(ctx, EventType::EquipmentError, Duration::minutes(10)),
                "window_minutes": 10,
            })
        }),
        SecurityRule::new(
            "unauthorized_access_burst",
            Severity::High,
            "Unauthorized access burst: repeated denied access attempts",
            |ctx| {
                Ok(count_in_window(ctx, EventType::UnauthorizedAccess, Duration::minutes(10)) >= 2)
            },
        )
        .with_metadata(|ctx| {
            serde_json::json!({
                "count": count_in_window(ctx, EventType::UnauthorizedAccess, Duration::minutes(10)),
                "window_minutes": 10,
            })
        }),
        SecurityRule::new(
            "rapid_threat_escalation",
            Severity::Critical,
            "Rapid threat escalation: severity climbing across recent events",
            |ctx| {
                let window = Duration::minutes(30);
                let critical = severity_in_window(ctx, Severity::Critical, window);
                let high = severity_in_window(ctx, Severity::High, window);
                Ok(critical >= 2 || (critical >= 1 && high >= 3))
            },
        ),
    ]
}
