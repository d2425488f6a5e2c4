use axum::{
    middleware::from_fn_with_state,
    response::Json,
    routing::get,
    Extension, Router,
};
use serde::Serialize;
use std::sync::Arc;

use super::middleware::{admission_layer, AdmissionLayerState};
use crate::admission::KeyContext;
use crate::keys::{KeyEnvironment, Owner};

/// Wrap a product router in admission. Every route in `router` then requires a key.
pub fn protect(router: Router, state: AdmissionLayerState) -> Router {
    router.layer(from_fn_with_state(Arc::new(state), admission_layer))
}

#[derive(Serialize)]
pub struct WhoAmI {
    pub key_id: String,
    pub identifier: String,
    pub owner: Owner,
    pub plan_id: String,
    pub environment: KeyEnvironment,
}

/// Gateway router: `GET /v1/whoami` reports the key a request was admitted with.
pub fn create_gateway_router(state: AdmissionLayerState) -> Router {
    protect(Router::new().route("/v1/whoami", get(whoami)), state)
}

async fn whoami(Extension(context): Extension<KeyContext>) -> Json<WhoAmI> {
    Json(WhoAmI {
        key_id: context.record.id,
        identifier: context.record.identifier,
        owner: context.owner,
        plan_id: context.plan.id,
        environment: context.record.environment,
    })
}
