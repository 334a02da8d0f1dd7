use std::collections::BTreeMap;
use std::convert::Infallible;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::cache::key::normalize_domain;
use crate::cache::store::ensure_safe_name;
use crate::cache::EntrySummary;
use crate::http::response::ApiError;
use crate::http::server::AppState;
use crate::mode::{Mode, ModeChangeAuditEntry, ModeSelection};

pub const USER_HEADER: &str = "x-proxy-user";
pub const ANONYMOUS: &str = "anonymous";

/// Who is making an admin change: `X-Proxy-User`, then `?user=`, then anonymous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingUser(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ActingUser {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        let from_query = || {
            let query = parts.uri.query()?;
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(k, v)| k == "user" && !v.is_empty())
                .map(|(_, v)| v.into_owned())
        };
        Ok(ActingUser(
            from_header
                .or_else(from_query)
                .unwrap_or_else(|| ANONYMOUS.to_string()),
        ))
    }
}

/// Normalize an admin-supplied domain and make sure it is a safe directory name.
fn admin_domain(raw: &str) -> Result<String, ApiError> {
    let domain = normalize_domain(raw);
    ensure_safe_name(&domain).map_err(|_| ApiError::InvalidDomain(raw.to_string()))?;
    Ok(domain)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub mode: Mode,
    pub hybrid_fallback: bool,
    pub domain_overrides: BTreeMap<String, Mode>,
    pub fixtures_count: usize,
    pub cache_count: usize,
    pub domains: Vec<String>,
    pub in_flight: usize,
    pub active_connections: u64,
    pub tls_interception: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeResponse {
    pub mode: Mode,
    pub previous: Mode,
    pub hybrid_fallback: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DomainModeResponse {
    pub domain: String,
    pub mode: Mode,
    pub previous: Mode,
    pub overridden: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HybridRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HybridResponse {
    pub hybrid_fallback: bool,
    pub previous: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub message: String,
    pub removed: usize,
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.modes.snapshot();
    let stats = state.store.stats().await;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode: snapshot.mode,
        hybrid_fallback: snapshot.hybrid_fallback,
        domain_overrides: snapshot.domain_overrides,
        fixtures_count: stats.fixtures_count,
        cache_count: stats.cache_count,
        domains: stats.domains,
        in_flight: state.dispatcher.in_flight(),
        active_connections: state.tracker.active_count(),
        tls_interception: state.interceptor.intercepts(),
    })
}

pub async fn set_mode(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(mode): Path<String>,
) -> Result<Json<ModeResponse>, ApiError> {
    let selection: ModeSelection = mode.parse()?;
    let previous = state.modes.apply_selection(selection, &user);
    let snapshot = state.modes.snapshot();
    Ok(Json(ModeResponse {
        mode: snapshot.mode,
        previous,
        hybrid_fallback: snapshot.hybrid_fallback,
        message: format!("Mode switched to {selection}"),
    }))
}

pub async fn set_domain_mode(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path((domain, mode)): Path<(String, String)>,
) -> Result<Json<DomainModeResponse>, ApiError> {
    let mode: Mode = mode.parse()?;
    let domain = admin_domain(&domain)?;
    let previous = state.modes.set_domain_mode(&domain, mode, &user);
    Ok(Json(DomainModeResponse {
        domain,
        mode,
        previous,
        overridden: true,
    }))
}

pub async fn clear_domain_mode(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(domain): Path<String>,
) -> Result<Json<DomainModeResponse>, ApiError> {
    let domain = admin_domain(&domain)?;
    let removed = state.modes.clear_domain_mode(&domain, &user);
    let mode = state.modes.effective_mode(&domain);
    Ok(Json(DomainModeResponse {
        domain,
        mode,
        previous: removed.unwrap_or(mode),
        overridden: false,
    }))
}

pub async fn set_hybrid(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Json(request): Json<HybridRequest>,
) -> Json<HybridResponse> {
    let previous = state.modes.set_hybrid_fallback(request.enabled, &user);
    Json(HybridResponse {
        hybrid_fallback: request.enabled,
        previous,
    })
}

pub async fn list_cache(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.stats().await.domains)
}

pub async fn list_domain_cache(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Vec<EntrySummary>>, ApiError> {
    let domain = admin_domain(&domain)?;
    Ok(Json(state.store.list_domain(&domain).await?))
}

pub async fn clear_cache(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
) -> Result<Json<ClearResponse>, ApiError> {
    let removed = state.store.clear_all().await?;
    tracing::info!(user = %user, removed, "Recorded cache cleared");
    Ok(Json(ClearResponse {
        message: "Cache cleared".to_string(),
        removed,
    }))
}

pub async fn clear_domain_cache(
    State(state): State<AppState>,
    ActingUser(user): ActingUser,
    Path(domain): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let domain = admin_domain(&domain)?;
    let removed = state.store.clear_domain(&domain).await?;
    tracing::info!(user = %user, domain = %domain, removed, "Recorded cache cleared for domain");
    Ok(Json(ClearResponse {
        message: format!("Cache cleared for {domain}"),
        removed: usize::from(removed),
    }))
}

pub async fn get_audit(State(state): State<AppState>) -> Json<Vec<ModeChangeAuditEntry>> {
    Json(state.modes.audit().list())
}
