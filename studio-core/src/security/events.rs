use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, IntoEnumIterator};
use uuid::Uuid;

use crate::security::validator::ThreatLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SecurityEventKind {
    RateLimitExceeded,
    SuspiciousIp,
    SuspiciousUserAgent,
    MaliciousInput,
    PromptRejected,
    BruteForceAttempt,
    UploadRejected,
}

/// Immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub event_type: SecurityEventKind,
    pub threat_level: ThreatLevel,
    pub ip_address: String,
    pub user_id: Option<String>,
    pub user_agent: Option<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Bounded append-only event log; the oldest events are evicted first.
#[derive(Debug)]
pub struct SecurityEventLog {
    capacity: usize,
    events: Mutex<VecDeque<SecurityEvent>>,
}

impl SecurityEventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append an event and mirror it to the tracing log.
    pub fn record(&self, event: SecurityEvent) {
        if event.threat_level >= ThreatLevel::High {
            tracing::warn!(
                event_type = %event.event_type,
                threat_level = %event.threat_level,
                ip = %event.ip_address,
                user_id = event.user_id.as_deref().unwrap_or("-"),
                "security event: {}",
                event.description
            );
        } else {
            tracing::info!(
                event_type = %event.event_type,
                threat_level = %event.threat_level,
                ip = %event.ip_address,
                "security event: {}",
                event.description
            );
        }

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// The newest `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.events.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Count events newer than `since`, in total and per threat level.
    pub fn count_since(&self, since: DateTime<Utc>) -> (usize, Vec<(ThreatLevel, usize)>) {
        let events = self.events.lock();
        let recent: Vec<&SecurityEvent> = events.iter().filter(|e| e.timestamp > since).collect();
        let per_level = ThreatLevel::iter()
            .map(|level| (level, recent.iter().filter(|e| e.threat_level == level).count()))
            .collect();
        (recent.len(), per_level)
    }
}
