//! Parley Service - Chat Service Wiring
//!
//! Composes the storage and presence crates into a running service:
//! a PostgreSQL-backed [`ChatStore`](parley_storage::ChatStore), the
//! direct-message key resolver, the cached chat service, configuration,
//! tracing setup, and the shared [`ServiceState`].

pub mod chat_service;
pub mod config;
pub mod db;
pub mod dm;
pub mod state;
pub mod telemetry;

pub use chat_service::{ChatService, MAX_MESSAGE_CHARS};
pub use config::{KvConfig, ServiceConfig};
pub use db::{DbConfig, PgChatStore, INIT_MIGRATION};
pub use dm::{BackfillOptions, BackfillReport, DmKeyResolver, DmResolution};
pub use state::{ProductionState, Readiness, ServiceState};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
