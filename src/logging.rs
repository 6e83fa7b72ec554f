//! Logging setup and replay-aware log macros for orchestration code.
//!
//! Orchestration functions run again from the top on every new event. The
//! `durable_*` macros only emit while the context is past the replayed part
//! of history, so each line shows up once per logical step instead of once
//! per pass.

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber honoring `RUST_LOG` (default `info`).
///
/// Safe to call repeatedly; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .try_init();
}

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::info!(instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::warn!(instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        if !ctx.is_replaying() {
            ::tracing::error!(instance_id = %ctx.instance_id(), $($arg)+);
        }
    }};
}
