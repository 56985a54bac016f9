//! Per-user, per-resource consumption against role-derived limits.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::error::StudioError;

pub const DAILY_TASKS: &str = "daily_tasks";
pub const MONTHLY_STORAGE_MB: &str = "monthly_storage_mb";
pub const CONCURRENT_TASKS: &str = "concurrent_tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Role {
    #[serde(alias = "user")]
    #[strum(to_string = "standard", serialize = "user")]
    Standard,
    Premium,
    Admin,
}

/// A resource limit; serialized as `-1` for unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum QuotaLimit {
    Unlimited,
    Limited(u64),
}

impl From<i64> for QuotaLimit {
    fn from(value: i64) -> Self {
        if value < 0 {
            QuotaLimit::Unlimited
        } else {
            QuotaLimit::Limited(value as u64)
        }
    }
}

impl From<QuotaLimit> for i64 {
    fn from(limit: QuotaLimit) -> Self {
        match limit {
            QuotaLimit::Unlimited => -1,
            QuotaLimit::Limited(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

impl QuotaLimit {
    pub fn allows(self, used: u64, amount: u64) -> bool {
        match self {
            QuotaLimit::Unlimited => true,
            QuotaLimit::Limited(limit) => used.saturating_add(amount) <= limit,
        }
    }

    pub fn remaining(self, used: u64) -> Option<u64> {
        match self {
            QuotaLimit::Unlimited => None,
            QuotaLimit::Limited(limit) => Some(limit.saturating_sub(used)),
        }
    }
}

/// When a resource's `used` counter is zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResetClass {
    Daily,
    Monthly,
    Never,
}

impl ResetClass {
    pub fn of(resource: &str) -> Self {
        if resource == DAILY_TASKS || resource.ends_with("_generation") {
            ResetClass::Daily
        } else if resource.starts_with("monthly_") {
            ResetClass::Monthly
        } else {
            ResetClass::Never
        }
    }

    /// The next reset boundary strictly after `now` (UTC midnight, or the
    /// first day of the next month).
    pub fn next_reset(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let date = match self {
            ResetClass::Daily => now.date_naive() + Duration::days(1),
            ResetClass::Monthly => {
                let (year, month) = if now.month() == 12 {
                    (now.year() + 1, 1)
                } else {
                    (now.year(), now.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)?
            }
            ResetClass::Never => return None,
        };
        Some(date.and_hms_opt(0, 0, 0)?.and_utc())
    }
}

pub type LimitTable = BTreeMap<String, QuotaLimit>;

/// Default limits per role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoleTables {
    pub standard: LimitTable,
    pub premium: LimitTable,
    pub admin: LimitTable,
}

fn table(entries: [(&str, i64); 8]) -> LimitTable {
    entries
        .into_iter()
        .map(|(name, limit)| (name.to_owned(), QuotaLimit::from(limit)))
        .collect()
}

impl Default for RoleTables {
    fn default() -> Self {
        Self {
            standard: table([
                (DAILY_TASKS, 10),
                (MONTHLY_STORAGE_MB, 100),
                (CONCURRENT_TASKS, 2),
                ("video_generation", 2),
                ("audio_generation", 5),
                ("image_generation", 10),
                ("code_generation", 20),
                ("text_generation", 50),
            ]),
            premium: table([
                (DAILY_TASKS, 100),
                (MONTHLY_STORAGE_MB, 1_000),
                (CONCURRENT_TASKS, 5),
                ("video_generation", 20),
                ("audio_generation", 50),
                ("image_generation", 100),
                ("code_generation", 200),
                ("text_generation", 500),
            ]),
            admin: table([
                (DAILY_TASKS, -1),
                (MONTHLY_STORAGE_MB, -1),
                (CONCURRENT_TASKS, -1),
                ("video_generation", -1),
                ("audio_generation", -1),
                ("image_generation", -1),
                ("code_generation", -1),
                ("text_generation", -1),
            ]),
        }
    }
}

impl RoleTables {
    pub fn for_role(&self, role: Role) -> &LimitTable {
        match role {
            Role::Standard => &self.standard,
            Role::Premium => &self.premium,
            Role::Admin => &self.admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceUsage {
    pub limit: QuotaLimit,
    pub used: u64,
    /// `None` for unlimited resources.
    pub remaining: Option<u64>,
    pub resets_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub user_id: String,
    pub role: Role,
    pub resources: BTreeMap<String, ResourceUsage>,
}

#[derive(Debug, Clone)]
struct Account {
    role: Role,
    limits: LimitTable,
    used: BTreeMap<String, u64>,
}

impl Account {
    fn new(role: Role, limits: LimitTable) -> Self {
        let used = limits.keys().map(|k| (k.clone(), 0)).collect();
        Self { role, limits, used }
    }

    /// Unknown resources have a zero limit.
    fn limit(&self, resource: &str) -> QuotaLimit {
        self.limits
            .get(resource)
            .copied()
            .unwrap_or(QuotaLimit::Limited(0))
    }

    fn used(&self, resource: &str) -> u64 {
        self.used.get(resource).copied().unwrap_or(0)
    }

    fn allows(&self, resource: &str, amount: u64) -> bool {
        self.limit(resource).allows(self.used(resource), amount)
    }
}

/// Thread-safe quota ledger.
///
/// Every check-and-consume runs under one lock, so concurrent callers can
/// never oversell a limit.
#[derive(Debug)]
pub struct QuotaLedger {
    tables: RoleTables,
    clock: SharedClock,
    accounts: Mutex<HashMap<String, Account>>,
}

impl QuotaLedger {
    pub fn new(tables: RoleTables, clock: SharedClock) -> Self {
        Self {
            tables,
            clock,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Create an account with the role's default limits. Returns `false` if
    /// the user already exists (the account is left untouched).
    pub fn register_user(&self, user_id: &str, role: Role) -> bool {
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(user_id) {
            return false;
        }
        let limits = self.tables.for_role(role).clone();
        accounts.insert(user_id.to_owned(), Account::new(role, limits));
        info!(user_id, %role, "quota account created");
        true
    }

    pub fn is_registered(&self, user_id: &str) -> bool {
        self.accounts.lock().contains_key(user_id)
    }

    /// Switch to another role's limits, keeping usage counters.
    pub fn set_role(&self, user_id: &str, role: Role) -> Result<(), StudioError> {
        let mut accounts = self.accounts.lock();
        let account = accounts.get_mut(user_id).ok_or_else(|| unknown(user_id))?;
        account.role = role;
        account.limits = self.tables.for_role(role).clone();
        for key in account.limits.keys() {
            account.used.entry(key.clone()).or_insert(0);
        }
        Ok(())
    }

    pub fn set_limit(&self, user_id: &str, resource: &str, limit: QuotaLimit) -> Result<(), StudioError> {
        let mut accounts = self.accounts.lock();
        let account = accounts.get_mut(user_id).ok_or_else(|| unknown(user_id))?;
        account.limits.insert(resource.to_owned(), limit);
        account.used.entry(resource.to_owned()).or_insert(0);
        Ok(())
    }

    pub fn limit_of(&self, user_id: &str, resource: &str) -> Option<QuotaLimit> {
        self.accounts.lock().get(user_id).map(|a| a.limit(resource))
    }

    pub fn used_of(&self, user_id: &str, resource: &str) -> Option<u64> {
        self.accounts.lock().get(user_id).map(|a| a.used(resource))
    }

    /// `true` iff the account exists and `used + amount` fits the limit.
    pub fn check(&self, user_id: &str, resource: &str, amount: u64) -> bool {
        self.accounts
            .lock()
            .get(user_id)
            .is_some_and(|a| a.allows(resource, amount))
    }

    /// Atomic check-and-consume of a single resource.
    pub fn consume(&self, user_id: &str, resource: &str, amount: u64) -> bool {
        let mut accounts = self.accounts.lock();
        let Some(account) = accounts.get_mut(user_id) else {
            return false;
        };
        if !account.allows(resource, amount) {
            return false;
        }
        let used = account.used.entry(resource.to_owned()).or_insert(0);
        *used = used.saturating_add(amount);
        debug!(user_id, resource, amount, "quota consumed");
        true
    }

    /// Consume several resources at once, all or nothing.
    pub fn consume_all(&self, user_id: &str, charges: &[(&str, u64)]) -> Result<(), StudioError> {
        let mut accounts = self.accounts.lock();
        let account = accounts.get_mut(user_id).ok_or_else(|| unknown(user_id))?;
        for (resource, amount) in charges {
            if !account.allows(resource, *amount) {
                let limit = match account.limit(resource) {
                    QuotaLimit::Limited(n) => n,
                    QuotaLimit::Unlimited => u64::MAX,
                };
                return Err(StudioError::QuotaExceeded {
                    resource: (*resource).to_owned(),
                    limit,
                    used: account.used(resource),
                    requested: *amount,
                    resets_at: ResetClass::of(resource).next_reset(self.clock.now()),
                });
            }
        }
        for (resource, amount) in charges {
            let used = account.used.entry((*resource).to_owned()).or_insert(0);
            *used = used.saturating_add(*amount);
        }
        debug!(user_id, ?charges, "quota consumed");
        Ok(())
    }

    /// Give back previously consumed units (never below zero).
    pub fn refund(&self, user_id: &str, resource: &str, amount: u64) {
        if let Some(account) = self.accounts.lock().get_mut(user_id) {
            if let Some(used) = account.used.get_mut(resource) {
                *used = used.saturating_sub(amount);
            }
        }
    }

    /// Zero every counter in `class` for every user. Idempotent.
    pub fn reset(&self, class: ResetClass) -> usize {
        let mut accounts = self.accounts.lock();
        let mut cleared = 0;
        for account in accounts.values_mut() {
            for (resource, used) in account.used.iter_mut() {
                if ResetClass::of(resource) == class && *used > 0 {
                    *used = 0;
                    cleared += 1;
                }
            }
        }
        info!(%class, cleared, "quota counters reset");
        cleared
    }

    pub fn snapshot(&self, user_id: &str) -> Option<QuotaSnapshot> {
        let now = self.clock.now();
        let accounts = self.accounts.lock();
        let account = accounts.get(user_id)?;
        let resources = account
            .limits
            .iter()
            .map(|(resource, limit)| {
                let used = account.used(resource);
                let usage = ResourceUsage {
                    limit: *limit,
                    used,
                    remaining: limit.remaining(used),
                    resets_at: ResetClass::of(resource).next_reset(now),
                };
                (resource.clone(), usage)
            })
            .collect();
        Some(QuotaSnapshot {
            user_id: user_id.to_owned(),
            role: account.role,
            resources,
        })
    }
}

fn unknown(user_id: &str) -> StudioError {
    StudioError::UnknownUser {
        user_id: user_id.to_owned(),
    }
}
