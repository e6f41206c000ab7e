//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::CoordinatorConfig;
use crate::domain::CoordinatorError;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to the configured level.
///
/// Returns false when a global subscriber was already installed (by an
/// earlier call or by the host application); that is not an error.
pub fn init_tracing(config: &CoordinatorConfig) -> Result<bool, CoordinatorError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| CoordinatorError::configuration(format!("invalid log filter: {}", e)))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(false);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            backend = %config.backend,
            debug_resources = config.debug_resources,
            "Transaction coordinator tracing initialized"
        );
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        let config = CoordinatorConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(!init_tracing(&config).unwrap());
    }
}
