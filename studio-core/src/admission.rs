//! The admission decision made before a task exists: security gate, prompt
//! screening, parameter validation, then quota.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::StudioError;
use crate::quota::{CONCURRENT_TASKS, DAILY_TASKS, QuotaLedger, QuotaLimit};
use crate::runtime::params::TaskParameters;
use crate::runtime::storage::TaskStore;
use crate::runtime::types::TaskKind;
use crate::security::{GateStage, RequestContext, SecurityGate};

#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub kind: TaskKind,
    pub prompt: &'a str,
    pub parameters: &'a Value,
    pub ctx: RequestContext<'a>,
}

/// A request that passed admission. Quota has already been consumed.
///
/// Holds the user's admission turn: keep it alive until the task is stored,
/// so the next admission for the same user counts it.
#[derive(Debug)]
pub struct Admitted {
    pub user_id: String,
    pub parameters: TaskParameters,
    /// Units consumed per resource, for refunds.
    pub charges: Vec<(String, u64)>,
    _turn: OwnedMutexGuard<()>,
}

#[derive(Debug)]
pub struct AdmissionPipeline {
    gate: Arc<SecurityGate>,
    quotas: Arc<QuotaLedger>,
    store: Arc<dyn TaskStore>,
    /// Serialises the count-then-insert of concurrent-task admission per user.
    turns: Mutex<HashMap<String, Arc<TurnLock<()>>>>,
}

impl AdmissionPipeline {
    pub fn new(gate: Arc<SecurityGate>, quotas: Arc<QuotaLedger>, store: Arc<dyn TaskStore>) -> Self {
        Self {
            gate,
            quotas,
            store,
            turns: Mutex::new(HashMap::new()),
        }
    }

    fn turn(&self, user_id: &str) -> Arc<TurnLock<()>> {
        Arc::clone(
            self.turns
                .lock()
                .entry(user_id.to_owned())
                .or_insert_with(|| Arc::new(TurnLock::new(()))),
        )
    }

    /// Run every admission check. On success the per-kind and daily quotas
    /// have been charged; on failure nothing has been charged.
    pub async fn admit(&self, req: AdmissionRequest<'_>) -> Result<Admitted, StudioError> {
        let result = self.evaluate(req).await;
        if let Err(err) = &result {
            warn!(
                user_id = req.ctx.user_id.unwrap_or("-"),
                ip = req.ctx.ip,
                kind = %req.kind,
                error = %err,
                "task admission rejected"
            );
        }
        result
    }

    async fn evaluate(&self, req: AdmissionRequest<'_>) -> Result<Admitted, StudioError> {
        let Some(user_id) = req.ctx.user_id else {
            return Err(rejected("missing user identity", Vec::new()));
        };

        let decision = self.gate.check(&req.ctx, req.parameters.as_object());
        match decision.stage {
            GateStage::Passed => {}
            GateStage::RateLimit => {
                return Err(StudioError::RateLimited {
                    rule: decision.rule,
                    action: decision.action,
                    retry_after_secs: decision.retry_after_secs,
                });
            }
            GateStage::IpReputation | GateStage::RequestData => {
                return Err(rejected(&decision.reason, decision.threats));
            }
        }

        if req.prompt.trim().is_empty() {
            return Err(rejected("prompt must not be empty", Vec::new()));
        }

        let parameters = TaskParameters::parse(req.kind, req.parameters.clone()).map_err(|err| match err {
            StudioError::InvalidParameters { message, .. } => rejected("malformed parameters", vec![message]),
            other => other,
        })?;

        let verdict = self.gate.screen_prompt(&req.ctx, req.prompt);
        if !verdict.is_valid() {
            return Err(rejected("prompt rejected", verdict.threat_strings()));
        }

        let concurrent = self
            .quotas
            .limit_of(user_id, CONCURRENT_TASKS)
            .ok_or_else(|| StudioError::UnknownUser {
                user_id: user_id.to_owned(),
            })?;
        let turn = self.turn(user_id).lock_owned().await;
        if let QuotaLimit::Limited(limit) = concurrent {
            let active = self.store.count_active_for_user(user_id).await? as u64;
            if active >= limit {
                return Err(StudioError::QuotaExceeded {
                    resource: CONCURRENT_TASKS.to_owned(),
                    limit,
                    used: active,
                    requested: 1,
                    resets_at: None,
                });
            }
        }

        let charges = vec![
            (req.kind.quota_resource().to_owned(), parameters.quota_units()),
            (DAILY_TASKS.to_owned(), 1),
        ];
        let borrowed: Vec<(&str, u64)> = charges.iter().map(|(r, n)| (r.as_str(), *n)).collect();
        self.quotas.consume_all(user_id, &borrowed)?;
        debug!(user_id, kind = %req.kind, "task admitted");

        Ok(Admitted {
            user_id: user_id.to_owned(),
            parameters,
            charges,
            _turn: turn,
        })
    }

    /// Return the quota charged for an admission whose task was never created.
    pub fn refund(&self, admitted: &Admitted) {
        for (resource, units) in &admitted.charges {
            self.quotas.refund(&admitted.user_id, resource, *units);
        }
    }
}

fn rejected(reason: &str, threats: Vec<String>) -> StudioError {
    StudioError::AdmissionRejected {
        reason: reason.to_owned(),
        threats,
    }
}
