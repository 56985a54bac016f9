use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SecurityConfig;
use crate::security::events::{SecurityEvent, SecurityEventKind, SecurityEventLog};
use crate::security::rate_limit::{RateLimiter, SecurityAction};
use crate::security::validator::{InputValidator, MAX_TEXT_LEN, ThreatLevel, Verdict};

const SUSPICIOUS_AGENT_MARKERS: &[&str] = &["bot", "crawler", "spider", "scraper", "scanner"];
const MIN_AGENT_LEN: usize = 10;

/// Who is asking, and where.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub endpoint: &'a str,
    pub ip: &'a str,
    pub user_id: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Which check decided the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    RateLimit,
    IpReputation,
    RequestData,
    Passed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub action: SecurityAction,
    pub reason: String,
    pub stage: GateStage,
    /// Rate-limit rule the endpoint mapped to.
    pub rule: String,
    pub threats: Vec<String>,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityStats {
    pub total_events: usize,
    pub events_last_hour: usize,
    pub events_last_day: usize,
    pub blocked_ips_count: usize,
    pub trusted_ips_count: usize,
    /// Events per threat level over the last day.
    pub threat_levels: BTreeMap<ThreatLevel, usize>,
}

/// Composes rate limiting, IP/user-agent heuristics and input screening into
/// a single admission decision, and keeps the security audit log.
#[derive(Debug)]
pub struct SecurityGate {
    limiter: RateLimiter,
    validator: InputValidator,
    events: SecurityEventLog,
    clock: SharedClock,
    blocked_ips: RwLock<HashSet<String>>,
    trusted_ips: RwLock<HashSet<String>>,
    failed_logins: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    max_failed_attempts: usize,
    failed_attempt_window: Duration,
}

/// Rate-limit rule for an endpoint path.
pub fn rule_for_endpoint(endpoint: &str) -> &'static str {
    let endpoint = endpoint.to_ascii_lowercase();
    if endpoint.contains("auth") || endpoint.contains("login") {
        "auth"
    } else if endpoint.contains("generate") || endpoint.contains("create") {
        "generation"
    } else if endpoint.contains("upload") {
        "upload"
    } else {
        "api_general"
    }
}

impl SecurityGate {
    pub fn new(config: &SecurityConfig, clock: SharedClock) -> Self {
        Self {
            limiter: RateLimiter::new(config.rate_limit_rules.iter().cloned(), clock.clone()),
            validator: InputValidator,
            events: SecurityEventLog::new(config.event_log_capacity),
            clock,
            blocked_ips: RwLock::new(config.blocked_ips.iter().cloned().collect()),
            trusted_ips: RwLock::new(config.trusted_ips.iter().cloned().collect()),
            failed_logins: Mutex::new(HashMap::new()),
            max_failed_attempts: config.max_failed_attempts.max(1),
            failed_attempt_window: Duration::seconds(config.failed_attempt_window_secs.max(1)),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Run the admission checks in order, stopping at the first rejection.
    pub fn check(&self, ctx: &RequestContext<'_>, request_data: Option<&Map<String, Value>>) -> GateDecision {
        let rule = rule_for_endpoint(ctx.endpoint);

        let rate = self.limiter.check(rule, ctx.ip, ctx.user_id);
        if rate.action != SecurityAction::Allow {
            self.log(
                ctx,
                SecurityEventKind::RateLimitExceeded,
                ThreatLevel::Medium,
                format!("rate limit exceeded for {}", ctx.endpoint),
                Map::from_iter([
                    ("endpoint".to_owned(), Value::from(ctx.endpoint)),
                    ("rule".to_owned(), Value::from(rule)),
                    ("action".to_owned(), Value::from(rate.action.as_ref())),
                ]),
            );
            return GateDecision {
                allowed: false,
                action: rate.action,
                reason: "rate limit exceeded".into(),
                stage: GateStage::RateLimit,
                rule: rule.into(),
                threats: Vec::new(),
                retry_after_secs: rate.retry_after_secs,
            };
        }

        if self.is_suspicious_ip(ctx.ip) {
            self.log(
                ctx,
                SecurityEventKind::SuspiciousIp,
                ThreatLevel::High,
                "request from suspicious IP address".into(),
                Map::from_iter([("endpoint".to_owned(), Value::from(ctx.endpoint))]),
            );
            return GateDecision {
                allowed: false,
                action: SecurityAction::BlockTemporary,
                reason: "suspicious IP address".into(),
                stage: GateStage::IpReputation,
                rule: rule.into(),
                threats: Vec::new(),
                retry_after_secs: 0,
            };
        }

        // Advisory only.
        if let Some(agent) = ctx.user_agent {
            if Self::is_suspicious_user_agent(agent) {
                self.log(
                    ctx,
                    SecurityEventKind::SuspiciousUserAgent,
                    ThreatLevel::Medium,
                    "suspicious user agent detected".into(),
                    Map::from_iter([("endpoint".to_owned(), Value::from(ctx.endpoint))]),
                );
            }
        }

        if let Some(data) = request_data {
            let threats = self.request_data_threats(data);
            if !threats.is_empty() {
                self.log(
                    ctx,
                    SecurityEventKind::MaliciousInput,
                    ThreatLevel::High,
                    format!("malicious input detected: {}", threats.join("; ")),
                    Map::from_iter([
                        ("endpoint".to_owned(), Value::from(ctx.endpoint)),
                        ("threats".to_owned(), Value::from(threats.clone())),
                    ]),
                );
                return GateDecision {
                    allowed: false,
                    action: SecurityAction::BlockTemporary,
                    reason: "malicious input detected".into(),
                    stage: GateStage::RequestData,
                    rule: rule.into(),
                    threats,
                    retry_after_secs: 0,
                };
            }
        }

        GateDecision {
            allowed: true,
            action: SecurityAction::Allow,
            reason: "request passed security checks".into(),
            stage: GateStage::Passed,
            rule: rule.into(),
            threats: Vec::new(),
            retry_after_secs: 0,
        }
    }

    /// Prompt screening; rejections are written to the audit log.
    pub fn screen_prompt(&self, ctx: &RequestContext<'_>, prompt: &str) -> Verdict {
        let verdict = self.validator.validate_prompt(prompt);
        if !verdict.is_valid() {
            let threats = verdict.threat_strings();
            self.log(
                ctx,
                SecurityEventKind::PromptRejected,
                verdict.threat_level,
                format!("prompt rejected: {}", threats.join("; ")),
                Map::from_iter([("threats".to_owned(), Value::from(threats))]),
            );
        }
        verdict
    }

    pub fn validate_upload(
        &self,
        ctx: &RequestContext<'_>,
        filename: &str,
        content_type: &str,
        size: u64,
    ) -> Verdict {
        let verdict = self.validator.validate_upload(filename, content_type, size);
        if !verdict.is_valid() {
            self.log(
                ctx,
                SecurityEventKind::UploadRejected,
                verdict.threat_level,
                format!("upload '{filename}' rejected"),
                Map::from_iter([
                    ("filename".to_owned(), Value::from(filename)),
                    ("threats".to_owned(), Value::from(verdict.threat_strings())),
                ]),
            );
        }
        verdict
    }

    /// Record an authentication failure. Returns `true` once the identifier
    /// has failed often enough inside the window to be locked; the source IP
    /// is blocked at the same time.
    pub fn record_failed_login(&self, identifier: &str, ip: &str) -> bool {
        let now = self.clock.now();
        let cutoff = now - self.failed_attempt_window;
        let attempts = {
            let mut ledger = self.failed_logins.lock();
            let attempts = ledger.entry(identifier.to_owned()).or_default();
            while attempts.front().is_some_and(|t| *t <= cutoff) {
                attempts.pop_front();
            }
            attempts.push_back(now);
            attempts.len()
        };

        if attempts < self.max_failed_attempts {
            return false;
        }
        let ctx = RequestContext {
            endpoint: "auth",
            ip,
            user_id: None,
            user_agent: None,
        };
        self.log(
            &ctx,
            SecurityEventKind::BruteForceAttempt,
            ThreatLevel::High,
            format!("multiple failed login attempts for {identifier}"),
            Map::from_iter([("attempts".to_owned(), Value::from(attempts))]),
        );
        self.block_ip(ip);
        true
    }

    pub fn block_ip(&self, ip: &str) {
        self.blocked_ips.write().insert(ip.to_owned());
    }

    /// Lift both the explicit block and any temporary rate-limit block.
    /// Clears both the block list entry and any rate-limit block on `ip`.
    /// User blocks from the same burst stay; see [`SecurityGate::unblock_user`].
    pub fn unblock_ip(&self, ip: &str) -> bool {
        let listed = self.blocked_ips.write().remove(ip);
        let limited = self.limiter.unblock_ip(ip);
        listed || limited
    }

    pub fn unblock_user(&self, user_id: &str) -> bool {
        self.limiter.unblock_user(user_id)
    }

    pub fn trust_ip(&self, ip: &str) {
        self.trusted_ips.write().insert(ip.to_owned());
    }

    pub fn events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.events.recent(limit)
    }

    pub fn stats(&self) -> SecurityStats {
        let now = self.clock.now();
        let (events_last_hour, _) = self.events.count_since(now - Duration::hours(1));
        let (events_last_day, per_level) = self.events.count_since(now - Duration::days(1));
        SecurityStats {
            total_events: self.events.len(),
            events_last_hour,
            events_last_day,
            blocked_ips_count: self.blocked_ips.read().len(),
            trusted_ips_count: self.trusted_ips.read().len(),
            threat_levels: per_level.into_iter().collect(),
        }
    }

    /// Drop stale limiter state and expired failed-login entries.
    pub fn sweep(&self) -> usize {
        let cutoff = self.clock.now() - self.failed_attempt_window;
        let mut removed = self.limiter.sweep();
        let mut ledger = self.failed_logins.lock();
        let before = ledger.len();
        ledger.retain(|_, attempts| attempts.back().is_some_and(|t| *t > cutoff));
        removed += before - ledger.len();
        removed
    }

    fn is_suspicious_ip(&self, ip: &str) -> bool {
        if self.blocked_ips.read().contains(ip) {
            return true;
        }
        if self.trusted_ips.read().contains(ip) {
            return false;
        }
        // No external reputation feed: private, loopback and public
        // addresses all pass; only malformed ones are flagged.
        ip.parse::<IpAddr>().is_err()
    }

    fn is_suspicious_user_agent(agent: &str) -> bool {
        let trimmed = agent.trim();
        if trimmed.chars().count() < MIN_AGENT_LEN {
            return true;
        }
        let lowered = trimmed.to_ascii_lowercase();
        SUSPICIOUS_AGENT_MARKERS.iter().any(|m| lowered.contains(m))
    }

    fn request_data_threats(&self, data: &Map<String, Value>) -> Vec<String> {
        let mut threats = Vec::new();
        for (key, value) in data {
            self.collect_threats(key, value, &mut threats);
        }
        threats
    }

    fn collect_threats(&self, path: &str, value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(text) => {
                let verdict = self.validator.validate_text(text, MAX_TEXT_LEN);
                out.extend(verdict.threats.iter().map(|t| format!("{path}: {t}")));
            }
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.collect_threats(&format!("{path}[{i}]"), item, out);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    self.collect_threats(&format!("{path}.{key}"), item, out);
                }
            }
            _ => {}
        }
    }

    fn log(
        &self,
        ctx: &RequestContext<'_>,
        kind: SecurityEventKind,
        level: ThreatLevel,
        description: String,
        metadata: Map<String, Value>,
    ) {
        self.events.record(SecurityEvent {
            event_id: Uuid::new_v4(),
            event_type: kind,
            threat_level: level,
            ip_address: ctx.ip.to_owned(),
            user_id: ctx.user_id.map(str::to_owned),
            user_agent: ctx.user_agent.map(str::to_owned),
            description,
            timestamp: self.clock.now(),
            metadata,
        });
    }
}
