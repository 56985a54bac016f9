//! Admission-time security: rate limiting, input screening, IP heuristics and
//! the security audit log.

pub mod events;
pub mod gate;
pub mod rate_limit;
pub mod validator;

pub use events::{SecurityEvent, SecurityEventKind};
pub use gate::{GateDecision, GateStage, RequestContext, SecurityGate, SecurityStats};
pub use rate_limit::{RateLimitRule, RateLimiter, SecurityAction};
pub use validator::{InputValidator, Threat, ThreatLevel, Verdict};
