// Key management API
//
// Owners are identified by request fields; the routes themselves are guarded
// by the admin bearer token, which the account service in front of the
// gateway holds.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info};

use super::admin::validate_admin_token;
use crate::keys::{KeyEnvironment, KeyRecord, KeyRegistry, KeyStore, Owner, Plan, RegistryError};
use crate::quota::{QuotaError, QuotaStatus, QuotaTracker};

/// State for the key management API
#[derive(Clone)]
pub struct KeysAppState {
    pub registry: KeyRegistry,
    pub quota: QuotaTracker,
    pub admin_token: Option<String>,
}

#[derive(Deserialize)]
pub struct IssueRequest {
    pub owner: Owner,
    pub plan_id: String,
    #[serde(default = "default_environment")]
    pub environment: KeyEnvironment,
}

fn default_environment() -> KeyEnvironment {
    KeyEnvironment::Live
}

#[derive(Deserialize)]
pub struct PlanRequest {
    pub rate_limit: u64,
    #[serde(default)]
    pub burst_limit: Option<u64>,
    #[serde(default)]
    pub quota: Option<u64>,
}

#[derive(Deserialize)]
pub struct OwnerRequest {
    pub owner: Owner,
}

#[derive(Deserialize)]
pub struct WhitelistRequest {
    pub owner: Owner,
    pub ips: Vec<String>,
}

/// Owner as query parameters: `?owner_type=user&owner_id=u1`
#[derive(Deserialize)]
pub struct OwnerQuery {
    pub owner_type: String,
    pub owner_id: String,
}

impl OwnerQuery {
    fn owner(self) -> Result<Owner, KeyApiError> {
        Owner::from_parts(&self.owner_type, self.owner_id)
            .ok_or_else(|| {
                KeyApiError::BadRequest(format!("Unknown owner type '{}'", self.owner_type))
            })
    }
}

/// Issued or rotated key. The plaintext key is only ever returned here.
#[derive(Serialize)]
pub struct IssuedKeyResponse {
    pub key: String,
    pub record: KeyRecord,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create key management router
pub fn create_keys_router(state: KeysAppState) -> Router {
    Router::new()
        .route("/api/plans/:id", put(upsert_plan))
        .route("/api/keys", post(issue_key).get(list_keys))
        .route("/api/keys/:id", axum::routing::delete(revoke_key))
        .route("/api/keys/:id/rotate", post(rotate_key))
        .route("/api/keys/:id/whitelist", put(set_whitelist))
        .route("/api/keys/:id/quota", get(quota_status))
        .with_state(Arc::new(state))
}

fn authorize(state: &KeysAppState, headers: &HeaderMap) -> Result<(), KeyApiError> {
    if validate_admin_token(headers, &state.admin_token) {
        Ok(())
    } else {
        Err(KeyApiError::Unauthorized)
    }
}

/// PUT /api/plans/:id - Create or replace a plan
async fn upsert_plan(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PlanRequest>,
) -> Result<Json<Plan>, KeyApiError> {
    authorize(&state, &headers)?;
    let plan = Plan {
        id,
        rate_limit: request.rate_limit,
        burst_limit: request.burst_limit,
        quota: request.quota,
    };
    if plan.rate_limit == 0 {
        return Err(KeyApiError::BadRequest("rate_limit must be positive".to_string()));
    }
    state
        .registry
        .store()
        .insert_plan(&plan)
        .map_err(RegistryError::from)?;
    info!(plan_id = %plan.id, rate_limit = plan.rate_limit, "Plan saved");
    Ok(Json(plan))
}

/// POST /api/keys - Issue a key
async fn issue_key(
    State(state): State<Arc<KeysAppState>>,
    headers: HeaderMap,
    Json(request): Json<IssueRequest>,
) -> Result<(StatusCode, Json<IssuedKeyResponse>), KeyApiError> {
    authorize(&state, &headers)?;
    let issued = state
        .registry
        .issue(request.owner, &request.plan_id, request.environment)?;
    Ok((
        StatusCode::CREATED,
        Json(IssuedKeyResponse {
            key: issued.plaintext,
            record: issued.record,
        }),
    ))
}

/// GET /api/keys?owner_type=..&owner_id=.. - List an owner's keys
async fn list_keys(
    State(state): State<Arc<KeysAppState>>,
    headers: HeaderMap,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<Vec<KeyRecord>>, KeyApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.registry.list(&query.owner()?)?))
}

/// POST /api/keys/:id/rotate - Replace the secret
async fn rotate_key(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<OwnerRequest>,
) -> Result<Json<IssuedKeyResponse>, KeyApiError> {
    authorize(&state, &headers)?;
    let rotated = state.registry.rotate(&id, &request.owner)?;
    Ok(Json(IssuedKeyResponse {
        key: rotated.plaintext,
        record: rotated.record,
    }))
}

/// DELETE /api/keys/:id?owner_type=..&owner_id=.. - Revoke
async fn revoke_key(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<KeyRecord>, KeyApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.registry.revoke(&id, &query.owner()?)?))
}

/// PUT /api/keys/:id/whitelist - Replace the IP whitelist
async fn set_whitelist(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<WhitelistRequest>,
) -> Result<Json<KeyRecord>, KeyApiError> {
    authorize(&state, &headers)?;
    let ips = request
        .ips
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|_| KeyApiError::BadRequest(format!("Invalid IP address '{}'", raw)))
        })
        .collect::<Result<BTreeSet<String>, _>>()?;
    Ok(Json(state.registry.set_ip_whitelist(&id, &request.owner, ips)?))
}

/// GET /api/keys/:id/quota?owner_type=..&owner_id=.. - Current quota position
async fn quota_status(
    State(state): State<Arc<KeysAppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<OwnerQuery>,
) -> Result<Json<QuotaStatus>, KeyApiError> {
    authorize(&state, &headers)?;
    let status = state.quota.status(&id)?;
    if status.owner != query.owner()? {
        return Err(KeyApiError::Registry(RegistryError::RecordNotOwned(id)));
    }
    Ok(Json(status))
}

/// Key management API errors
#[derive(Debug)]
pub enum KeyApiError {
    Unauthorized,
    BadRequest(String),
    Registry(RegistryError),
    Quota(QuotaError),
}

impl From<RegistryError> for KeyApiError {
    fn from(e: RegistryError) -> Self {
        KeyApiError::Registry(e)
    }
}

impl From<QuotaError> for KeyApiError {
    fn from(e: QuotaError) -> Self {
        KeyApiError::Quota(e)
    }
}

impl IntoResponse for KeyApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            KeyApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, "Admin token required".to_string())
            }
            KeyApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            KeyApiError::Registry(e) => match e {
                RegistryError::PlanNotFound(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                RegistryError::RecordNotFound(_) => {
                    (StatusCode::NOT_FOUND, "API key not found".to_string())
                }
                RegistryError::RecordNotOwned(_) => (
                    StatusCode::FORBIDDEN,
                    "API key belongs to a different owner".to_string(),
                ),
                RegistryError::KeyRevoked(_) => (StatusCode::CONFLICT, e.to_string()),
                RegistryError::MalformedKey | RegistryError::InvalidKey => {
                    (StatusCode::BAD_REQUEST, e.to_string())
                }
                RegistryError::Store(ref store) => {
                    error!(error = %store, "Key store failure");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Key store unavailable".to_string(),
                    )
                }
            },
            KeyApiError::Quota(e) => match e {
                QuotaError::KeyNotFound(_) => {
                    (StatusCode::NOT_FOUND, "API key not found".to_string())
                }
                QuotaError::PlanNotFound(_) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                QuotaError::Store(ref store) => {
                    error!(error = %store, "Key store failure");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Key store unavailable".to_string(),
                    )
                }
            },
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
