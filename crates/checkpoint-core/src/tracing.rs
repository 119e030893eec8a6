// Purpose: Logging setup for checkpoint users and tests

use std::sync::Once;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    EnvFilter, Registry,
};

//-----------------------------------------------------------------------------
// Tracing Initialization
//-----------------------------------------------------------------------------

/// Initializes the tracing subscriber with configurable log level and output format.
///
/// # Arguments
///
/// * `log_level`: An optional filter directive, defaulting to "info".
///                `RUST_LOG` takes precedence when set. Checkpoint events are
///                emitted under the `checkpoint_core` target, e.g.
///                "checkpoint_core=trace,info".
/// * `json_output`: Whether to output logs in JSON format. Defaults to `false`.
///
/// # Returns
///
/// * `Result<()>`: Ok if initialization was successful, otherwise an `anyhow::Error`,
///   for instance when a global subscriber is already installed.
pub fn init_tracing(log_level: Option<&str>, json_output: Option<bool>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.unwrap_or("info")))?;

    let subscriber = Registry::default().with(env_filter);

    if json_output.unwrap_or(false) {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(true);
        tracing::subscriber::set_global_default(subscriber.with(json_layer))?;
    } else {
        let fmt_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_thread_names(true);
        tracing::subscriber::set_global_default(subscriber.with(fmt_layer))?;
    }

    Ok(())
}

static TEST_LOGGING: Once = Once::new();

/// Route log events into the test harness output, once per process
///
/// Honors `RUST_LOG` and otherwise shows debug events.
pub fn init_test_logging() {
    TEST_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("checkpoint_core=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

//-----------------------------------------------------------------------------
// Tests
//-----------------------------------------------------------------------------
