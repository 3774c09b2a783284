use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One security-relevant occurrence observed by an upstream collaborator
/// (auth flow, access control, equipment telemetry). Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub severity: Severity,
    pub source_ip: Option<String>,
    pub user_id: Option<String>,
    pub station_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "auth.login.failed")]
    LoginFailed,
    #[serde(rename = "auth.login.success")]
    LoginSuccess,
    #[serde(rename = "data.access.unauthorized")]
    UnauthorizedAccess,
    #[serde(rename = "equipment.error")]
    EquipmentError,
    #[serde(rename = "equipment.warning")]
    EquipmentWarning,
    #[serde(rename = "station.offline")]
    StationOffline,
    #[serde(rename = "config.change")]
    ConfigChange,
    #[serde(rename = "data.export")]
    DataExport,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LoginFailed => "auth.login.failed",
            EventType::LoginSuccess => "auth.login.success",
            EventType::UnauthorizedAccess => "data.access.unauthorized",
            EventType::EquipmentError => "equipment.error",
            EventType::EquipmentWarning => "equipment.warning",
            EventType::StationOffline => "station.offline",
            EventType::ConfigChange => "config.change",
            EventType::DataExport => "data.export",
        }
    }
}

/// Severity assigned by the producer of an event. Ordering matters: it is
/// used to pick the maximum severity among findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Coarse threat bucket derived from the numeric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Pure, monotonic step function over the 0-100 score.
    pub fn from_score(score: u8) -> Self {
        match score {
            s if s >= 75 => ThreatLevel::Critical,
            s if s >= 50 => ThreatLevel::High,
            s if s >= 25 => ThreatLevel::Medium,
            _ => ThreatLevel::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl SecurityEvent {
    pub fn new(event_type: EventType, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity,
            source_ip: None,
            user_id: None,
            station_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_station_id(mut self, station_id: impl Into<String>) -> Self {
        self.station_id = Some(station_id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// The engine's output for one evaluation. Created per evaluation, never
/// mutated; consumed by the response layer and folded into history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub score: u8,
    pub level: ThreatLevel,
    pub severity: Severity,
    pub factors: Vec<String>,
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
