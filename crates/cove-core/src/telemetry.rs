use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt};

use crate::CoveError;
use crate::config::LoggingConfig;

static TELEMETRY_GUARD: OnceLock<()> = OnceLock::new();

/// HTTP plumbing that floods debug output with one line per model call.
const QUIET_TARGETS: [&str; 3] = ["reqwest", "hyper", "h2"];

#[derive(Debug, Clone)]
pub struct TelemetryOptions {
    /// Full filter directive; overrides `RUST_LOG` and `default_level`.
    pub env_filter: Option<String>,
    pub default_level: String,
    pub with_ansi: bool,
}

impl Default for TelemetryOptions {
    fn default() -> Self {
        Self {
            env_filter: None,
            default_level: "info".to_string(),
            with_ansi: true,
        }
    }
}

impl TelemetryOptions {
    pub fn from_logging(logging: &LoggingConfig) -> Self {
        Self {
            default_level: logging.level.clone(),
            ..Self::default()
        }
    }

    /// Directive used when neither an explicit filter nor `RUST_LOG` is set.
    ///
    /// Progress and sandbox telemetry stay at `info` even when the configured level is quieter.
    pub fn default_directive(&self) -> String {
        let level = self.default_level.trim();
        let mut directives = vec![level.to_string()];
        directives.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
        if matches!(level, "warn" | "error" | "off") {
            directives.push("telemetry=info".to_string());
        }
        directives.join(",")
    }
}

/// Initialise the global tracing subscriber. Later calls are no-ops.
pub fn init_telemetry(options: TelemetryOptions) -> Result<(), CoveError> {
    if TELEMETRY_GUARD.get().is_some() {
        return Ok(());
    }

    let directive = options
        .env_filter
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| options.default_directive());
    let filter = EnvFilter::try_new(&directive).map_err(|err| {
        CoveError::InvalidConfiguration(format!("invalid log filter '{directive}': {err}"))
    })?;

    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(options.with_ansi)
        .with_target(false)
        .try_init()
        .map_err(|err| CoveError::InvalidConfiguration(format!("telemetry init failed: {err}")))?;

    TELEMETRY_GUARD.get_or_init(|| ());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_quiets_http_crates() {
        let options = TelemetryOptions::from_logging(&LoggingConfig {
            level: "debug".to_string(),
        });
        assert_eq!(
            options.default_directive(),
            "debug,reqwest=warn,hyper=warn,h2=warn"
        );
    }

    #[test]
    fn quiet_level_keeps_telemetry_targets() {
        let options = TelemetryOptions {
            default_level: "warn".to_string(),
            ..TelemetryOptions::default()
        };
        assert!(options.default_directive().ends_with(",telemetry=info"));
    }
}
