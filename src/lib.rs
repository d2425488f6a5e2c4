// Shared storage primitives (counter store, store timeouts)
pub mod store;

// API key issuance, validation and persistence
pub mod keys;

// Key extraction from requests
pub mod auth;

// Sliding-window rate limiting
pub mod rate_limit;

// Monthly quota counters
pub mod quota;

// Request admission pipeline
pub mod admission;

// Usage events, counters and notifications
pub mod telemetry;

// NATS notification delivery
pub mod nats;

// Configuration (TOML + runtime)
pub mod config;

// HTTP APIs
pub mod api;
