//! Tracing setup

use sequencer_core::LogFormat;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Build the env filter, falling back to [`DEFAULT_FILTER`]
pub fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed.
pub fn init(format: LogFormat) -> bool {
    let registry = tracing_subscriber::registry().with(filter());
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
            .is_ok(),
        LogFormat::Text => registry.with(fmt::layer()).try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init(LogFormat::Text);
        assert!(!init(LogFormat::Json));
    }
}
