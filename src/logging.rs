use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Driver crates that log every statement or request at info
const NOISY_TARGETS: [&str; 5] = ["sqlx", "mongodb", "aws_config", "aws_smithy_runtime", "hyper"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line, with the current storage span attached
    #[default]
    Json,
    /// Single-line human readable output
    Compact,
}

/// `log_level` plus warn-level caps for driver crates. Used when `RUST_LOG`
/// is unset; an explicit `RUST_LOG` is taken as is.
fn default_filter(log_level: &str) -> EnvFilter {
    NOISY_TARGETS
        .iter()
        .filter_map(|target| format!("{}=warn", target).parse::<Directive>().ok())
        .fold(EnvFilter::new(log_level), EnvFilter::add_directive)
}

/// Install the global subscriber
pub fn init(log_format: LogFormat, log_level: &str) {
    let env_filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(log_level)),
        None => default_filter(log_level),
    };

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(false)
                        .with_target(true)
                        .with_file(false)
                        .with_line_number(false),
                )
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_file(false)
                        .with_line_number(false),
                )
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_caps_driver_targets() {
        let rendered = default_filter("debug").to_string();
        assert!(rendered.contains("debug"));
        for target in NOISY_TARGETS {
            assert!(
                rendered.contains(&format!("{}=warn", target)),
                "{} missing from {}",
                target,
                rendered
            );
        }
    }
}
