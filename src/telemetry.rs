//! Log subscriber setup for hosts that do not install their own.

use crate::config::{LogLevel, LoggingConfig};
use crate::error::RelayResult;
use std::sync::Once;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

fn build_env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

/// Install a global fmt subscriber configured by `config`.
///
/// `RUST_LOG` overrides the configured level. Only the first call installs
/// anything; later calls, or a subscriber installed by someone else, leave
/// the existing one in place. An unknown level fails with `InvalidLogLevel`
/// before anything is installed.
pub fn init_tracing(config: &LoggingConfig) -> RelayResult<()> {
    let level = LevelFilter::from(LogLevel::parse(&config.level)?);

    INIT.call_once(|| {
        let env_filter = build_env_filter(level);
        let registry = tracing_subscriber::registry().with(env_filter);

        let installed = if config.json_format {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(config.include_targets)
                        .with_current_span(true),
                )
                .try_init()
        } else {
            registry
                .with(
                    fmt::layer()
                        .compact()
                        .with_ansi(config.colored)
                        .with_target(config.include_targets),
                )
                .try_init()
        };

        if installed.is_err() {
            tracing::debug!("A global subscriber is already installed");
        }
    });

    Ok(())
}
