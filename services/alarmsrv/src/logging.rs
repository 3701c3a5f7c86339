//! Logging bootstrap
//!
//! Console output as `timestamp [LEVEL] message` or JSON lines. The filter
//! comes from `RUST_LOG` when set, otherwise from the configured level, and
//! can be swapped at runtime through [`LogHandle`].

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LogConfig;

fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// `2026-01-05T10:00:00.000000Z [INFO] message`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Runtime access to the active log filter
#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Replace the filter, e.g. `"debug"` or `"info,voltage_alarm=trace"`
    pub fn set_level(&self, filter: &str) -> Result<()> {
        let filter = EnvFilter::try_new(filter)
            .with_context(|| format!("Invalid log filter '{}'", filter))?;
        self.handle
            .reload(filter)
            .context("Failed to reload log filter")?;
        tracing::info!("Log level changed");
        Ok(())
    }
}

/// Filter directive used when `RUST_LOG` is not set
pub fn default_directive(config: &LogConfig, service_name: &str) -> String {
    format!(
        "{level},{service}={level},voltage_alarm={level}",
        level = config.level,
        service = service_name
    )
}

pub fn init(config: &LogConfig, service_name: &str) -> Result<LogHandle> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directive) => EnvFilter::try_new(&directive)
            .with_context(|| format!("Invalid RUST_LOG '{}'", directive))?,
        Err(_) => {
            let directive = default_directive(config, service_name);
            EnvFilter::try_new(&directive)
                .with_context(|| format!("Invalid log level '{}'", config.level))?
        },
    };
    let (filter, handle) = reload::Layer::new(filter);

    let output = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().event_format(BracketedLevelFormat).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LogHandle { handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_covers_engine_crate() {
        let config = LogConfig {
            level: "debug".to_string(),
            json: false,
        };
        assert_eq!(
            default_directive(&config, "alarmsrv"),
            "debug,alarmsrv=debug,voltage_alarm=debug"
        );
    }

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }
}
