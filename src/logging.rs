//! Tracing setup for applications embedding the manager.

use crate::error::{DbError, DbResult};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install a global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, events are
/// written as JSON lines. Fails if a subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> DbResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = if json {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init()
    };
    result.map_err(|e| DbError::internal(format!("Failed to initialize tracing: {}", e)))
}
