//! Sliding-window request counters with burst detection and temporary blocks.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tracing::warn;

use crate::clock::SharedClock;

/// Width of the secondary window used for burst detection.
const BURST_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SecurityAction {
    Allow,
    RateLimit,
    BlockTemporary,
}

/// Declarative rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub name: String,
    pub requests_per_window: u32,
    pub window_seconds: u64,
    /// Requests tolerated inside one minute before the caller is blocked.
    #[serde(default)]
    pub burst_limit: Option<u32>,
    #[serde(default = "default_block_duration")]
    pub block_duration_seconds: u64,
}

fn default_block_duration() -> u64 {
    300
}

impl RateLimitRule {
    pub fn new(
        name: impl Into<String>,
        requests_per_window: u32,
        window_seconds: u64,
        burst_limit: Option<u32>,
        block_duration_seconds: u64,
    ) -> Self {
        Self {
            name: name.into(),
            requests_per_window,
            window_seconds,
            burst_limit,
            block_duration_seconds,
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(i64::try_from(self.window_seconds).unwrap_or(i64::MAX / 1_000))
    }
}

/// The built-in rules: `api_general`, `auth`, `generation`, `upload`.
pub fn default_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("api_general", 100, 3_600, Some(10), 300),
        RateLimitRule::new("auth", 5, 300, Some(2), 900),
        RateLimitRule::new("generation", 10, 60, Some(3), 120),
        RateLimitRule::new("upload", 20, 3_600, Some(5), 600),
    ]
}

/// Outcome of a single limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub action: SecurityAction,
    /// Seconds until a retry can succeed; zero when allowed.
    pub retry_after_secs: u64,
}

impl RateCheck {
    fn allow() -> Self {
        Self {
            action: SecurityAction::Allow,
            retry_after_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Subject {
    Ip(String),
    User(String),
}

#[derive(Debug, Default)]
struct LimiterState {
    /// Request timestamps per (rule, subject). Keyed by rule so that windows
    /// of different lengths never prune each other's history.
    windows: HashMap<(String, Subject), VecDeque<DateTime<Utc>>>,
    /// Subject -> block expiry.
    blocks: HashMap<Subject, DateTime<Utc>>,
}

impl LimiterState {
    /// Remaining block time for any of `subjects`, clearing expired blocks.
    fn blocked_for(&mut self, subjects: &[Subject], now: DateTime<Utc>) -> Option<Duration> {
        let mut longest: Option<Duration> = None;
        for subject in subjects {
            if let Some(until) = self.blocks.get(subject).copied() {
                if now < until {
                    let left = until - now;
                    longest = Some(longest.map_or(left, |l| l.max(left)));
                } else {
                    self.blocks.remove(subject);
                }
            }
        }
        longest
    }

    fn pruned(&mut self, rule: &RateLimitRule, subject: &Subject, now: DateTime<Utc>) -> &mut VecDeque<DateTime<Utc>> {
        let cutoff = now - rule.window();
        let window = self
            .windows
            .entry((rule.name.clone(), subject.clone()))
            .or_default();
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
        window
    }
}

/// Per-IP and per-user sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    rules: HashMap<String, RateLimitRule>,
    clock: SharedClock,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(rules: impl IntoIterator<Item = RateLimitRule>, clock: SharedClock) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.name.clone(), r)).collect(),
            clock,
            state: Mutex::new(LimiterState::default()),
        }
    }

    pub fn rule(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.get(name)
    }

    /// Check and, when allowed, record one request.
    ///
    /// Unknown rule names are allowed.
    pub fn check(&self, rule_name: &str, ip: &str, user_id: Option<&str>) -> RateCheck {
        let Some(rule) = self.rules.get(rule_name) else {
            return RateCheck::allow();
        };
        let now = self.clock.now();

        let mut subjects = vec![Subject::Ip(ip.to_owned())];
        if let Some(user) = user_id {
            subjects.push(Subject::User(user.to_owned()));
        }

        let mut state = self.state.lock();
        if let Some(left) = state.blocked_for(&subjects, now) {
            return RateCheck {
                action: SecurityAction::BlockTemporary,
                retry_after_secs: ceil_secs(left),
            };
        }

        let burst_cutoff = now - Duration::seconds(BURST_WINDOW_SECS);
        let mut max_count = 0usize;
        let mut max_recent = 0usize;
        let mut oldest: Option<DateTime<Utc>> = None;
        for subject in &subjects {
            let window = state.pruned(rule, subject, now);
            max_count = max_count.max(window.len());
            max_recent = max_recent.max(window.iter().filter(|t| **t > burst_cutoff).count());
            if let Some(front) = window.front() {
                oldest = Some(oldest.map_or(*front, |o| o.min(*front)));
            }
        }

        if let Some(burst) = rule.burst_limit {
            let burst = burst as usize;
            if max_count >= burst && max_recent >= burst {
                let until = now + Duration::seconds(rule.block_duration_seconds as i64);
                for subject in &subjects {
                    state.blocks.insert(subject.clone(), until);
                }
                warn!(
                    rule = %rule.name,
                    ip,
                    user_id = user_id.unwrap_or("-"),
                    block_secs = rule.block_duration_seconds,
                    "burst limit exceeded, temporarily blocked"
                );
                return RateCheck {
                    action: SecurityAction::BlockTemporary,
                    retry_after_secs: rule.block_duration_seconds,
                };
            }
        }

        if max_count >= rule.requests_per_window as usize {
            let retry_after = oldest
                .map(|o| ceil_secs(o + rule.window() - now))
                .unwrap_or(rule.window_seconds);
            return RateCheck {
                action: SecurityAction::RateLimit,
                retry_after_secs: retry_after.max(1),
            };
        }

        for subject in &subjects {
            state
                .windows
                .entry((rule.name.clone(), subject.clone()))
                .or_default()
                .push_back(now);
        }
        RateCheck::allow()
    }

    /// Block an IP until `now + duration`.
    pub fn block_ip(&self, ip: &str, duration: Duration) {
        let until = self.clock.now() + duration;
        self.state
            .lock()
            .blocks
            .insert(Subject::Ip(ip.to_owned()), until);
    }

    /// Lift the block on an IP. A burst block also locks out the user that
    /// tripped it; lift that one with [`RateLimiter::unblock_user`].
    pub fn unblock_ip(&self, ip: &str) -> bool {
        self.state
            .lock()
            .blocks
            .remove(&Subject::Ip(ip.to_owned()))
            .is_some()
    }

    pub fn unblock_user(&self, user_id: &str) -> bool {
        self.state
            .lock()
            .blocks
            .remove(&Subject::User(user_id.to_owned()))
            .is_some()
    }

    /// Number of IPs and users with an unexpired block.
    pub fn active_blocks(&self) -> usize {
        let now = self.clock.now();
        self.state.lock().blocks.values().filter(|until| now < **until).count()
    }

    /// Drop expired blocks and empty windows. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let before = state.windows.len() + state.blocks.len();
        state.blocks.retain(|_, until| now < *until);
        let rules = &self.rules;
        state.windows.retain(|(rule_name, _), window| {
            if let Some(rule) = rules.get(rule_name) {
                let cutoff = now - rule.window();
                while window.front().is_some_and(|t| *t <= cutoff) {
                    window.pop_front();
                }
            }
            !window.is_empty()
        });
        before - (state.windows.len() + state.blocks.len())
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let millis = d.num_milliseconds().max(0) as u64;
    millis.div_ceil(1_000)
}
