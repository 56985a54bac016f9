//! Request extractors for caller identity and origin.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRef, FromRequestParts};
use axum::http::header;
use axum::http::request::Parts;
use studio_core::ClientInfo;

use crate::error::ServerError;
use crate::state::AppState;

pub static X_USER_ID: &str = "x-user-id";
pub static X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Peers allowed to report the client address through `x-forwarded-for`.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies(pub Vec<IpAddr>);

impl FromRef<Arc<AppState>> for TrustedProxies {
    fn from_ref(state: &Arc<AppState>) -> Self {
        Self(state.config.trusted_proxies.clone())
    }
}

/// The authenticated user and where the request came from.
///
/// Identity is taken from `x-user-id`. The client IP is the peer address,
/// unless the peer is a trusted proxy; then it is the nearest untrusted
/// `x-forwarded-for` hop.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub client: ClientInfo,
}

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
    TrustedProxies: FromRef<S>,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(X_USER_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ServerError::Unauthorized(format!("missing {X_USER_ID} header")))?
            .to_owned();
        let TrustedProxies(trusted) = TrustedProxies::from_ref(state);
        Ok(Self {
            user_id,
            client: client_info(parts, &trusted),
        })
    }
}

pub fn client_info(parts: &Parts, trusted: &[IpAddr]) -> ClientInfo {
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ip = match peer {
        Some(peer) if trusted.contains(&peer) => forwarded_client(parts, trusted).unwrap_or(peer),
        Some(peer) => peer,
        None => IpAddr::from([127, 0, 0, 1]),
    };
    let user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    ClientInfo {
        ip: ip.to_string(),
        user_agent,
        endpoint: None,
    }
}

/// Walk the forwarded chain right to left, skipping our own proxies.
/// `None` when a hop is not an IP address.
fn forwarded_client(parts: &Parts, trusted: &[IpAddr]) -> Option<IpAddr> {
    let chain: Vec<&str> = parts
        .headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect();
    for hop in chain.iter().rev() {
        let ip: IpAddr = hop.parse().ok()?;
        if !trusted.contains(&ip) {
            return Some(ip);
        }
    }
    chain.first().and_then(|hop| hop.parse().ok())
}
