use std::fmt::{self, Write as _};
use std::io::IsTerminal;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Column widths
const COMPONENT_WIDTH: usize = 14;
const LOG_LEVEL_WIDTH: usize = 7;

/// Renders `[timestamp] [component] [level] message key=value ...`
pub struct ChirpLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl ChirpLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_supported(),
        }
    }

    /// `chirp_session::registry` becomes `chirp-session`, anything outside
    /// the chirp crates is shown under the service name
    fn component(&self, target: &str) -> String {
        let krate = target.split("::").next().unwrap_or(target);
        let name = match krate.strip_prefix("chirp_") {
            Some(rest) => format!("{}-{}", self.service_name, rest),
            None => self.service_name.clone(),
        };
        if name.len() > COMPONENT_WIDTH {
            format!("{}…", &name[..COMPONENT_WIDTH - 1])
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn level(&self, level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for ChirpLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let meta = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color(meta.level());
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.component(meta.target()),
            color,
            self.level(meta.level()),
            reset
        )?;
        writeln!(writer, "{}{}{}", visitor.message, visitor.fields, reset)
    }
}

/// Collects the message and renders the remaining fields as `key=value`
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

fn color_supported() -> bool {
    if std::env::var("TERM").is_ok_and(|term| term == "dumb") {
        return false;
    }
    std::io::stdout().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> ChirpLogFormatter {
        ChirpLogFormatter {
            service_name: "chirp".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_component_from_target() {
        let f = formatter();
        assert_eq!(f.component("chirp_session::registry").trim_end(), "chirp-session");
        assert_eq!(f.component("chirp_wire").trim_end(), "chirp-wire");
        assert_eq!(f.component("rustls::conn").trim_end(), "chirp");
        assert_eq!(f.component("chirp").len(), COMPONENT_WIDTH);
    }

    #[test]
    fn test_level_without_color() {
        let f = formatter();
        assert_eq!(f.color(&Level::ERROR), "");
        assert!(f.level(&Level::WARN).starts_with("⚠ WARN"));
    }
}
