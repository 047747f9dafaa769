//! `courier-docstore` -- reference document store for Courier clients.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100
//! cargo run --bin courier-docstore
//!
//! # Run on custom address with a tighter write quota
//! cargo run --bin courier-docstore -- --bind 127.0.0.1:8080 --writes-per-minute 60
//!
//! # Or via environment variable
//! DOCSTORE_ADDR=127.0.0.1:8080 cargo run --bin courier-docstore
//! ```

use std::sync::Arc;

use clap::Parser;
use courier_docstore::config::{DocstoreCliArgs, DocstoreConfig};
use courier_docstore::server;

#[tokio::main]
async fn main() {
    let cli = DocstoreCliArgs::parse();

    let config = match DocstoreConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        max_document_size = config.max_document_size,
        writes_per_minute = config.writes_per_minute,
        "starting courier docstore"
    );

    let state = Arc::new(config.state());
    match server::start_server_with_state(&config.bind_addr.to_string(), state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "docstore listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "docstore server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start docstore");
            std::process::exit(1);
        }
    }
}
