pub mod aggregator;
pub mod alerts;
pub mod behavior;
pub mod event;
pub mod reputation;
pub mod response;
pub mod rules;
pub mod statistics;

pub use aggregator::{ThreatAggregator, ThreatContext};
pub use alerts::{AlertSink, TracingAlertSink};
pub use behavior::BehaviorAnalyzer;
pub use event::{EventType, SecurityEvent, Severity, ThreatAssessment, ThreatLevel};
pub use reputation::{AbuseIpdbClient, DisabledReputationProvider, ReputationProvider};
pub use response::{BlockRecord, ResponseAction, ThreatResponse, ThreatResponseSystem};
pub use rules::{SecurityRule, SecurityRuleEngine};

use crate::config::EngineConfig;
use crate::security::reputation::AbuseIpdbConfig;
use std::sync::Arc;

/// Wire up the full engine from configuration: reputation provider, alert
/// sink, aggregator, and response system.
pub fn build_engine(config: EngineConfig) -> Arc<ThreatResponseSystem> {
    let reputation: Arc<dyn ReputationProvider> = if config.reputation.api_key.is_some() {
        Arc::new(AbuseIpdbClient::new(AbuseIpdbConfig {
            api_key: config.reputation.api_key.clone(),
            api_url: config.reputation.api_url.clone(),
            timeout_seconds: config.reputation.timeout_seconds,
            max_age_days: config.reputation.max_age_days,
            malicious_threshold: config.reputation.malicious_threshold,
        }))
    } else {
        Arc::new(DisabledReputationProvider)
    };

    Arc::new(ThreatResponseSystem::new(
        config,
        reputation,
        Arc::new(TracingAlertSink),
    ))
}
