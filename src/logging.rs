use crate::config::AppConfig;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Target used for operator alerts and dead-letter notices
pub const ALERT_TARGET: &str = "settlement_alert";

/// Writer guards. Keep alive for the process lifetime or buffered lines are lost.
pub struct LogGuards {
    _main: WorkerGuard,
    _alerts: WorkerGuard,
}

fn appender(rotation: &str, dir: &str, file: &str) -> RollingFileAppender {
    match rotation {
        "hourly" => tracing_appender::rolling::hourly(dir, file),
        "daily" => tracing_appender::rolling::daily(dir, file),
        _ => tracing_appender::rolling::never(dir, file),
    }
}

/// `RUST_LOG` when set, otherwise `log_level` with sqlx quietened
fn env_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.log_level)))
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `log_level`. Events on [`ALERT_TARGET`] are also
/// copied to `<log_file>.alerts` regardless of the main filter.
pub fn init_logging(config: &AppConfig) -> LogGuards {
    let (main_writer, main_guard) = tracing_appender::non_blocking(appender(
        &config.rotation,
        &config.log_dir,
        &config.log_file,
    ));
    let (alert_writer, alert_guard) = tracing_appender::non_blocking(appender(
        &config.rotation,
        &config.log_dir,
        &format!("{}.alerts", config.log_file),
    ));

    // alerts bypass the main filter, so each layer carries its own
    let alert_targets = || Targets::new().with_target(ALERT_TARGET, Level::WARN);

    if config.use_json {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(main_writer)
                    .with_ansi(false)
                    .with_filter(env_filter(config)),
            )
            .with(
                fmt::layer()
                    .json()
                    .with_writer(alert_writer)
                    .with_ansi(false)
                    .with_filter(alert_targets()),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(main_writer)
                    .with_ansi(false)
                    .with_filter(env_filter(config)),
            )
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(true)
                    .with_filter(env_filter(config)),
            )
            .with(
                fmt::layer()
                    .json()
                    .with_writer(alert_writer)
                    .with_ansi(false)
                    .with_filter(alert_targets()),
            )
            .init();
    }

    tracing::debug!(dir = %config.log_dir, file = %config.log_file, "Logging initialized");
    LogGuards {
        _main: main_guard,
        _alerts: alert_guard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alerts_copied_past_main_filter() {
        let dir = std::env::temp_dir().join(format!("settlement-log-{}", uuid::Uuid::new_v4()));
        let mut config = AppConfig::load("dev").unwrap();
        config.log_dir = dir.display().to_string();
        config.log_file = "test.log".into();
        config.rotation = "never".into();
        config.log_level = "error".into();

        let guards = init_logging(&config);
        tracing::warn!(target: ALERT_TARGET, kind = "payout_dead_lettered", "Payout dead-lettered");
        tracing::warn!("below the main filter");
        drop(guards);

        let alerts = std::fs::read_to_string(dir.join("test.log.alerts")).unwrap();
        assert!(alerts.contains("payout_dead_lettered"));
        let main = std::fs::read_to_string(dir.join("test.log")).unwrap_or_default();
        assert!(!main.contains("below the main filter"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
