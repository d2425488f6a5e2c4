// HTTP surfaces: admission middleware, key management, runtime admin

pub mod admin;
pub mod gateway;
pub mod keys;
pub mod middleware;

pub use admin::{create_admin_router, AdminAppState};
pub use gateway::{create_gateway_router, protect};
pub use keys::{create_keys_router, KeysAppState};
pub use middleware::{admission_layer, AdmissionLayerState};
