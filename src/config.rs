use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::IpAddr;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    /// Score at which blocking starts (the `score >= 80` tier always blocks).
    #[validate(range(min = 0, max = 100))]
    pub threat_score_threshold: u8,
    /// When false, block/rate-limit decisions are computed but not enforced.
    pub auto_block_enabled: bool,
    /// Hard cap on any block duration the score table proposes.
    #[validate(range(min = 1))]
    pub max_block_duration_hours: i64,
    #[validate(range(min = 1))]
    pub max_history_size: usize,
    #[validate(range(min = 1))]
    pub threat_decay_hours: i64,
    /// IPs or CIDRs that are never blocked or rate-limited.
    pub allowlist: Vec<String>,
    #[validate(nested)]
    pub reputation: ReputationSettings,
    #[validate(nested)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ReputationSettings {
    pub api_key: Option<String>,
    #[validate(url)]
    pub api_url: String,
    #[validate(range(min = 1, max = 30))]
    pub timeout_seconds: u64,
    #[validate(range(min = 1))]
    pub max_age_days: u32,
    #[validate(range(min = 1, max = 100))]
    pub malicious_threshold: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    #[validate(range(min = 1024, max = 65535))]
    pub port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threat_score_threshold: 70,
            auto_block_enabled: true,
            max_block_duration_hours: 24,
            max_history_size: 1000,
            threat_decay_hours: 24,
            allowlist: Vec::new(),
            reputation: ReputationSettings {
                api_key: None,
                api_url: "https://api.abuseipdb.com/api/v2/check".to_string(),
                timeout_seconds: 5,
                max_age_days: 90,
                malicious_threshold: 75,
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8082,
            },
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            threat_score_threshold: env_parse(
                "THREATWATCH_THREAT_SCORE_THRESHOLD",
                defaults.threat_score_threshold,
            )?,
            auto_block_enabled: env_parse(
                "THREATWATCH_AUTO_BLOCK_ENABLED",
                defaults.auto_block_enabled,
            )?,
            max_block_duration_hours: env_parse(
                "THREATWATCH_MAX_BLOCK_DURATION_HOURS",
                defaults.max_block_duration_hours,
            )?,
            max_history_size: env_parse(
                "THREATWATCH_MAX_HISTORY_SIZE",
                defaults.max_history_size,
            )?,
            threat_decay_hours: env_parse(
                "THREATWATCH_THREAT_DECAY_HOURS",
                defaults.threat_decay_hours,
            )?,
            allowlist: env::var("THREATWATCH_ALLOWLIST")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            reputation: ReputationSettings {
                api_key: env::var("ABUSEIPDB_API_KEY").ok().filter(|k| !k.is_empty()),
                api_url: env::var("ABUSEIPDB_API_URL")
                    .unwrap_or(defaults.reputation.api_url),
                timeout_seconds: env_parse(
                    "THREATWATCH_REPUTATION_TIMEOUT_SECS",
                    defaults.reputation.timeout_seconds,
                )?,
                max_age_days: defaults.reputation.max_age_days,
                malicious_threshold: defaults.reputation.malicious_threshold,
            },
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env_parse("PORT", defaults.server.port)?,
            },
        };

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Parsed allowlist. Bare addresses become host-length prefixes;
    /// malformed entries are skipped with a warning.
    pub fn allowlist_nets(&self) -> Vec<IpNet> {
        self.allowlist
            .iter()
            .filter_map(|entry| {
                if let Ok(net) = entry.parse::<IpNet>() {
                    return Some(net);
                }
                if let Ok(addr) = entry.parse::<IpAddr>() {
                    return Some(IpNet::from(addr));
                }
                tracing::warn!(entry = entry.as_str(), "Ignoring malformed allowlist entry");
                None
            })
            .collect()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("Failed to parse {}", key)),
        Err(_) => Ok(default),
    }
}
