use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Consumer-facing result of one reputation lookup. Every failure path
/// produces an unsupported report instead of an error, so callers treat
/// `supported == false` identically to "no signal".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationReport {
    pub provider: String,
    pub supported: bool,
    pub ip: String,
    pub reputation: u8,
    pub is_malicious: bool,
    pub country_code: Option<String>,
    pub usage_type: Option<String>,
    pub isp: Option<String>,
    pub last_reported_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl ReputationReport {
    fn unsupported(provider: &str, ip: &str, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            supported: false,
            ip: ip.to_string(),
            reputation: 0,
            is_malicious: false,
            country_code: None,
            usage_type: None,
            isp: None,
            last_reported_at: None,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait ReputationProvider: Send + Sync {
    /// Whether a provider credential/configuration is present.
    fn is_enabled(&self) -> bool;

    /// Look up an IP. Must not error: degraded lookups return an
    /// unsupported report with a reason code.
    async fn check_ip(&self, ip: &str) -> ReputationReport;
}

/// Always-off provider for deployments without a reputation credential.
pub struct DisabledReputationProvider;

#[async_trait]
impl ReputationProvider for DisabledReputationProvider {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn check_ip(&self, ip: &str) -> ReputationReport {
        ReputationReport::unsupported("disabled", ip, "no_api_key")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseIpdbConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub timeout_seconds: u64,
    pub max_age_days: u32,
    /// Abuse confidence score at or above which an IP is treated as malicious.
    pub malicious_threshold: u8,
}

impl Default for AbuseIpdbConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.abuseipdb.com/api/v2/check".to_string(),
            timeout_seconds: 5,
            max_age_days: 90,
            malicious_threshold: 75,
        }
    }
}

/// AbuseIPDB-backed reputation client with graceful degradation: invalid
/// input, a missing key, a non-2xx response, and transport errors all come
/// back as unsupported reports with a reason code.
pub struct AbuseIpdbClient {
    client: reqwest::Client,
    config: AbuseIpdbConfig,
}

#[derive(Debug, Deserialize)]
struct AbuseIpdbEnvelope {
    data: AbuseIpdbData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbuseIpdbData {
    ip_address: String,
    abuse_confidence_score: u8,
    country_code: Option<String>,
    usage_type: Option<String>,
    isp: Option<String>,
    last_reported_at: Option<DateTime<Utc>>,
}

impl AbuseIpdbClient {
    pub fn new(config: AbuseIpdbConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    const PROVIDER: &'static str = "abuseipdb";

    async fn lookup(&self, ip: &str, api_key: &str) -> ReputationReport {
        let response = self
            .client
            .get(&self.config.api_url)
            .header("Key", api_key)
            .header("Accept", "application/json")
            .query(&[
                ("ipAddress", ip),
                ("maxAgeInDays", &self.config.max_age_days.to_string()),
            ])
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                warn!(ip = ip, error = %e, "IP reputation lookup failed");
                return ReputationReport::unsupported(Self::PROVIDER, ip, "exception");
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(ip = ip, status = status.as_u16(), "IP reputation lookup rejected");
            return ReputationReport::unsupported(
                Self::PROVIDER,
                ip,
                format!("http_{}", status.as_u16()),
            );
        }

        match response.json::<AbuseIpdbEnvelope>().await {
            Ok(envelope) => {
                let data = envelope.data;
                debug!(
                    ip = ip,
                    score = data.abuse_confidence_score,
                    "IP reputation lookup completed"
                );
                ReputationReport {
                    provider: Self::PROVIDER.to_string(),
                    supported: true,
                    ip: data.ip_address,
                    reputation: data.abuse_confidence_score,
                    is_malicious: data.abuse_confidence_score >= self.config.malicious_threshold,
                    country_code: data.country_code,
                    usage_type: data.usage_type,
                    isp: data.isp,
                    last_reported_at: data.last_reported_at,
                    reason: None,
                }
            }
            Err(e) => {
                warn!(ip = ip, error = %e, "IP reputation response could not be parsed");
                ReputationReport::unsupported(Self::PROVIDER, ip, "exception")
            }
        }
    }
}

#[async_trait]
impl ReputationProvider for AbuseIpdbClient {
    fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn check_ip(&self, ip: &str) -> ReputationReport {
        if ip.parse::<IpAddr>().is_err() {
            return ReputationReport::unsupported(Self::PROVIDER, ip, "invalid_ip");
        }

        let api_key = match &self.config.api_key {
            Some(key) => key.clone(),
            None => return ReputationReport::unsupported(Self::PROVIDER, ip, "no_api_key"),
        };

        self.lookup(ip, &api_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_provider_reports_unsupported() {
        let provider = DisabledReputationProvider;
        assert!(!provider.is_enabled());

        let report = provider.check_ip("203.0.113.9").await;
        assert!(!report.supported);
        assert!(!report.is_malicious);
        assert_eq!(report.reputation, 0);
        assert_eq!(report.reason.as_deref(), Some("no_api_key"));
    }

    #[tokio::test]
    async fn test_invalid_ip_short_circuits() {
        let client = AbuseIpdbClient::new(AbuseIpdbConfig {
            api_key: Some("key".to_string()),
            ..Default::default()
        });

        let report = client.check_ip("not-an-ip").await;
        assert!(!report.supported);
        assert_eq!(report.reason.as_deref(), Some("invalid_ip"));
    }

    #[tokio::test]
    async fn test_missing_key_short_circuits() {
        let client = AbuseIpdbClient::new(AbuseIpdbConfig::default());
        assert!(!client.is_enabled());

        let report = client.check_ip("203.0.113.9").await;
        assert!(!report.supported);
        assert_eq!(report.reason.as_deref(), Some("no_api_key"));
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "data": {
                "ipAddress": "203.0.113.9",
                "abuseConfidenceScore": 92,
                "countryCode": "US",
                "usageType": "Data Center/Web Hosting/Transit",
                "isp": "Example Hosting",
                "lastReportedAt": "2024-11-02T08:15:00+00:00"
            }
        }"#;
        let envelope: AbuseIpdbEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.data.ip_address, "203.0.113.9");
        assert_eq!(envelope.data.abuse_confidence_score, 92);
        assert_eq!(envelope.data.country_code.as_deref(), Some("US"));
    }
}
