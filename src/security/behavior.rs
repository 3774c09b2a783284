use crate::security::event::{SecurityEvent, Severity};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One suspicious pattern in the activity of a user or station.
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorPattern {
    pub pattern_type: PatternType,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    DiverseEventMix,
    RapidCadence,
    EventTypeConcentration,
    StationCriticalActivity,
    StationSeverityConcentration,
    DiverseActivity,
}

/// Examines events scoped to a user and/or station for patterns that
/// rate-based rules miss. The signal falls back to a generic finding when
/// activity is genuinely diverse but no specific pattern matched, so it is
/// never silent in the face of varied behavior.
pub struct BehaviorAnalyzer;

impl BehaviorAnalyzer {
    pub fn analyze(
        &self,
        events: &[SecurityEvent],
        user_id: Option<&str>,
        station_id: Option<&str>,
    ) -> Vec<BehaviorPattern> {
        let mut patterns = Vec::new();

        let user_events: Vec<&SecurityEvent> = match user_id {
            Some(user) => events
                .iter()
                .filter(|e| e.user_id.as_deref() == Some(user))
                .collect(),
            None => Vec::new(),
        };
        let station_events: Vec<&SecurityEvent> = match station_id {
            Some(station) => events
                .iter()
                .filter(|e| e.station_id.as_deref() == Some(station))
                .collect(),
            None => Vec::new(),
        };

        if let Some(user) = user_id {
            patterns.extend(self.analyze_event_mix(user, &user_events));
            patterns.extend(self.analyze_cadence(user, &user_events));
            patterns.extend(self.analyze_concentration(user, &user_events));
        }

        if let Some(station) = station_id {
            patterns.extend(self.analyze_station_activity(station, &station_events));
        }

        if patterns.is_empty() {
            let scoped: Vec<&SecurityEvent> = user_events
                .iter()
                .chain(station_events.iter())
                .copied()
                .collect();
            let distinct = distinct_types(&scoped);
            if distinct >= 3 {
                patterns.push(BehaviorPattern {
                    pattern_type: PatternType::DiverseActivity,
                    severity: Severity::Low,
                    confidence: 0.5,
                    description: format!(
                        "Diverse activity: {} distinct event types without a dominant pattern",
                        distinct
                    ),
                });
            }
        }

        debug!(
            patterns = patterns.len(),
            user_id = user_id.unwrap_or("-"),
            station_id = station_id.unwrap_or("-"),
            "Behavioral analysis completed"
        );

        patterns
    }

    fn analyze_event_mix(&self, user: &str, events: &[&SecurityEvent]) -> Vec<BehaviorPattern> {
        let distinct = distinct_types(events);
        if events.len() > 10 && distinct > 5 {
            return vec![BehaviorPattern {
                pattern_type: PatternType::DiverseEventMix,
                severity: Severity::Medium,
                confidence: 0.6,
                description: format!(
                    "Unusually diverse event mix for user {}: {} types across {} events",
                    user,
                    distinct,
                    events.len()
                ),
            }];
        }
        Vec::new()
    }

    fn analyze_cadence(&self, user: &str, events: &[&SecurityEvent]) -> Vec<BehaviorPattern> {
        if events.len() < 3 {
            return Vec::new();
        }
        let oldest = events.iter().map(|e| e.timestamp).min();
        let newest = events.iter().map(|e| e.timestamp).max();
        let (Some(oldest), Some(newest)) = (oldest, newest) else {
            return Vec::new();
        };
        let span_minutes = ((newest - oldest).num_seconds() as f64 / 60.0).max(1.0);
        let rate = events.len() as f64 / span_minutes;
        if rate > 2.0 {
            return vec![BehaviorPattern {
                pattern_type: PatternType::RapidCadence,
                severity: Severity::High,
                confidence: 0.7,
                description: format!(
                    "Rapid event cadence for user {}: {:.1} events/min over {} events",
                    user,
                    rate,
                    events.len()
                ),
            }];
        }
        Vec::new()
    }

    fn analyze_concentration(&self, user: &str, events: &[&SecurityEvent]) -> Vec<BehaviorPattern> {
        if events.len() <= 5 {
            return Vec::new();
        }
        let mut counts: HashMap<_, usize> = HashMap::new();
        for event in events {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        if let Some((event_type, count)) = counts.into_iter().max_by_key(|(_, c)| *c) {
            let share = count as f64 / events.len() as f64;
            if share > 0.7 {
                return vec![BehaviorPattern {
                    pattern_type: PatternType::EventTypeConcentration,
                    severity: Severity::Medium,
                    confidence: 0.65,
                    description: format!(
                        "Event concentration for user {}: {:.0}% of activity is {}",
                        user,
                        share * 100.0,
                        event_type.as_str()
                    ),
                }];
            }
        }
        Vec::new()
    }

    fn analyze_station_activity(
        &self,
        station: &str,
        events: &[&SecurityEvent],
    ) -> Vec<BehaviorPattern> {
        let mut patterns = Vec::new();

        let critical = events
            .iter()
            .filter(|e| e.severity == Severity::Critical)
            .count();
        if critical > 2 {
            patterns.push(BehaviorPattern {
                pattern_type: PatternType::StationCriticalActivity,
                severity: Severity::High,
                confidence: 0.75,
                description: format!(
                    "Elevated critical events at station {}: {} critical events",
                    station, critical
                ),
            });
        }

        if events.len() > 4 {
            let high = events
                .iter()
                .filter(|e| e.severity >= Severity::High)
                .count();
            let share = high as f64 / events.len() as f64;
            if share > 0.5 {
                patterns.push(BehaviorPattern {
                    pattern_type: PatternType::StationSeverityConcentration,
                    severity: Severity::High,
                    confidence: 0.7,
                    description: format!(
                        "High-severity concentration at station {}: {:.0}% of events",
                        station,
                        share * 100.0
                    ),
                });
            }
        }

        patterns
    }
}

fn distinct_types(events: &[&SecurityEvent]) -> usize {
    let mut types: Vec<_> = events.iter().map(|e| e.event_type).collect();
    types.sort_by_key(|t| t.as_str());
    types.dedup();
    types.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::event::EventType;
    use chrono::{Duration, Utc};

    fn user_event(event_type: EventType, severity: Severity, secs_ago: i64) -> SecurityEvent {
        SecurityEvent::new(event_type, severity)
            .with_user_id("operator-7")
            .with_timestamp(Utc::now() - Duration::seconds(secs_ago))
    }

    #[test]
    fn test_rapid_cadence_detected() {
        // 9 events inside two minutes is well past 2 events/min
        let events: Vec<_> = (0..9)
            .map(|i| user_event(EventType::LoginFailed, Severity::Medium, i * 10))
            .collect();

        let patterns = BehaviorAnalyzer.analyze(&events, Some("operator-7"), None);
        assert!(patterns
            .iter()
            .any(|p| p.pattern_type == PatternType::RapidCadence));
    }

    #[test]
    fn test_concentration_detected() {
        let mut events: Vec<_> = (0..8)
            .map(|i| user_event(EventType::DataExport, Severity::Low, 600 + i * 300))
            .collect();
        events.push(user_event(EventType::LoginSuccess, Severity::Low, 60));

        let patterns = BehaviorAnalyzer.analyze(&events, Some("operator-7"), None);
        assert!(patterns
            .iter()
            .any(|p| p.pattern_type == PatternType::EventTypeConcentration));
    }

    #[test]
    fn test_station_critical_activity() {
        let events: Vec<_> = (0..3)
            .map(|i| {
                SecurityEvent::new(EventType::EquipmentError, Severity::Critical)
                    .with_station_id("press-04")
                    .with_timestamp(Utc::now() - Duration::seconds(i * 60))
            })
            .collect();

        let patterns = BehaviorAnalyzer.analyze(&events, None, Some("press-04"));
        assert!(patterns
            .iter()
            .any(|p| p.pattern_type == PatternType::StationCriticalActivity));
    }

    #[test]
    fn test_diverse_activity_fallback() {
        // Three distinct types, spread out enough that nothing specific fires
        let events = vec![
            user_event(EventType::LoginSuccess, Severity::Low, 3000),
            user_event(EventType::ConfigChange, Severity::Low, 2000),
            user_event(EventType::DataExport, Severity::Low, 500),
        ];

        let patterns = BehaviorAnalyzer.analyze(&events, Some("operator-7"), None);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, PatternType::DiverseActivity);
    }

    #[test]
    fn test_single_event_is_quiet() {
        let events = vec![user_event(EventType::LoginFailed, Severity::Medium, 30)];
        let patterns = BehaviorAnalyzer.analyze(&events, Some("operator-7"), None);
        assert!(patterns.is_empty());
    }

    #[test]
    fn test_no_scope_no_patterns() {
        let events: Vec<_> = (0..10)
            .map(|i| user_event(EventType::LoginFailed, Severity::Medium, i * 5))
            .collect();
        let patterns = BehaviorAnalyzer.analyze(&events, None, None);
        assert!(patterns.is_empty());
    }
}
