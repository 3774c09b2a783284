use crate::security::event::{SecurityEvent, ThreatAssessment};
use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

/// Downstream side-effect hooks. Every call is fire-and-forget from the
/// response system's point of view: a failing sink is logged and skipped.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_security_team(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()>;

    async fn log_incident(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()>;

    async fn enhance_monitoring(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()>;

    async fn flag_for_review(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()>;

    async fn consider_system_lockdown(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()>;
}

/// Default sink: structured log lines only. Real deployments swap in email,
/// chat, or paging integrations behind the same trait.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify_security_team(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()> {
        warn!(
            score = assessment.score,
            level = assessment.level.as_str(),
            event_type = event.event_type.as_str(),
            source_ip = event.source_ip.as_deref().unwrap_or("-"),
            "Security team notification"
        );
        Ok(())
    }

    async fn log_incident(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()> {
        info!(
            score = assessment.score,
            level = assessment.level.as_str(),
            event_type = event.event_type.as_str(),
            factors = ?assessment.factors,
            "Security incident recorded"
        );
        Ok(())
    }

    async fn enhance_monitoring(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()> {
        info!(
            source_ip = event.source_ip.as_deref().unwrap_or("-"),
            level = assessment.level.as_str(),
            "Monitoring enhanced for source"
        );
        Ok(())
    }

    async fn flag_for_review(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()> {
        info!(
            source_ip = event.source_ip.as_deref().unwrap_or("-"),
            score = assessment.score,
            "Source flagged for analyst review"
        );
        Ok(())
    }

    async fn consider_system_lockdown(
        &self,
        assessment: &ThreatAssessment,
        event: &SecurityEvent,
    ) -> Result<()> {
        warn!(
            score = assessment.score,
            event_type = event.event_type.as_str(),
            "System lockdown recommended"
        );
        Ok(())
    }
}
