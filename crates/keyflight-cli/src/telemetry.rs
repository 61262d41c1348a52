//! Log output for the `keyflight` binary.
//!
//! Events from the binary and from the library's `tracing` feature go through
//! a single `tracing_subscriber` registry. `RUST_LOG` controls verbosity and
//! defaults to `info`; set it to `keyflight=trace` to see per-key flight lock
//! bookkeeping. Everything is written to stderr so stdout carries only command
//! output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry(json: bool) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()));

    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_thread_ids(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_thread_ids(true)
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}
