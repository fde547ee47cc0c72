//! DM Key Backfill
//!
//! Writes canonical keys onto direct chats created before keys existed and
//! prints the resulting report as JSON to stdout.
//!
//! Connection settings come from `PARLEY_DATABASE_URL` and `PARLEY_DB_*`.

use std::sync::Arc;

use clap::Parser;
use parley_core::ParleyConfig;
use parley_service::{
    init_tracing, BackfillOptions, DbConfig, DmKeyResolver, PgChatStore, TelemetryConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Backfill canonical keys onto legacy direct chats", long_about = None)]
struct Args {
    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,

    /// Chats fetched per page
    #[arg(long, default_value_t = BackfillOptions::default().batch_size)]
    batch_size: u32,
}

impl From<Args> for BackfillOptions {
    fn from(args: Args) -> Self {
        Self {
            batch_size: args.batch_size,
            dry_run: args.dry_run,
        }
    }
}

#[tokio::main]
async fn main() {
    let options = BackfillOptions::from(Args::parse());

    let _root = match init_tracing(&TelemetryConfig::from_env()) {
        Ok(span) => span.entered(),
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            std::process::exit(1);
        }
    };

    let store = match PgChatStore::from_config(&DbConfig::from_env()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "Failed to create database pool");
            std::process::exit(1);
        }
    };
    let resolver = DmKeyResolver::from_config(store, &ParleyConfig::from_env());

    let report = match resolver.backfill(options).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Backfill failed");
            std::process::exit(1);
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to serialize report: {}", e);
            std::process::exit(1);
        }
    }
}
