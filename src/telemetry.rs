// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Debug builds log human-readable lines, release builds log JSON. The level
/// comes from `RUST_LOG` and defaults to `info`. Calling this twice is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
