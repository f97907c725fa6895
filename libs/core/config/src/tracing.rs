use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for this process.
///
/// Output format follows the runtime environment: production emits JSON
/// lines with module targets suppressed (for log shippers), development
/// emits compact human-readable lines. `RUST_LOG` overrides the default
/// filter ("info" in production, "debug" elsewhere).
///
/// Calling this twice is harmless; the second call leaves the existing
/// subscriber in place.
pub fn init_tracing(environment: &Environment) {
    let already_set = match environment {
        Environment::Production => tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter("info"))
            .with_target(false)
            .try_init()
            .is_err(),
        Environment::Development => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter("debug"))
            .try_init()
            .is_err(),
    };

    if already_set {
        // Common in tests, where the first test wins.
        debug!("Tracing subscriber already installed, keeping the existing one");
    } else {
        info!(environment = ?environment, "Tracing initialized");
    }
}

/// `RUST_LOG` when set, otherwise the given default directive.
fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}
