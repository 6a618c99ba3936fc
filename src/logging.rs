//! Logging setup

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Install the global subscriber
///
/// `RUST_LOG` wins over `level` when set. `format` is `pretty` for humans or
/// `json` for log shippers.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Configuration(format!("log level {level}: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        _ => registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init(),
    };

    installed.map_err(|e| Error::Configuration(format!("install logger: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // Whichever call comes first in the test binary wins the global slot.
        let _ = init_logging("debug", "pretty");
        assert!(init_logging("info", "json").is_err());
    }
}
