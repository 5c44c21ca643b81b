// Configuration (TOML file + environment secrets)
pub mod config;

// Encrypted secret storage facade
pub mod credentials;

// Linked accounts, pending challenges, schedules (SQLite)
pub mod store;

// Riot identity provider client
pub mod riot;

// Signed webhook event processing
pub mod handshake;

// Re-authentication wrapper for authenticated fetches
pub mod session;

// HTTP API (webhook receiver + link/account endpoints)
pub mod api;
