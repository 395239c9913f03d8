use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// ANSI color codes for console output
const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

/// Module path prefixes and the component shown for events logged there.
/// More specific prefixes come first.
const TARGET_COMPONENTS: &[(&str, &str)] = &[
    ("slick_session::supervisor", "retry"),
    ("slick_session::keepalive", "ping"),
    ("slick_session::transport", "socket"),
    ("slick_session", "session"),
    ("slick_engage::activity", "activity"),
    ("slick_engage::http", "http"),
    ("slick_engage", "engage"),
    ("slick_bus", "bus"),
    ("slick_storage", "storage"),
    ("slick_wire", "wire"),
];

/// Column widths for alignment
const SERVICE_NAME_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// `[timestamp] [service-component] [level] message` line formatter
pub struct SlickLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log at info level tagged with a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log at warn level tagged with a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log at debug level tagged with a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

impl SlickLogFormatter {
    pub fn new(service_name: String) -> Self {
        let color_enabled = is_terminal();
        Self {
            service_name,
            color_enabled,
        }
    }

    /// Service name padded or truncated to a fixed width
    fn format_service_name(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        // +2 for the icon
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn color_for_level(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

/// Component for an event that did not name one, derived from its target
fn component_for_target(target: &str) -> Option<&'static str> {
    TARGET_COMPONENTS
        .iter()
        .find(|(prefix, _)| {
            target
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
        })
        .map(|(_, component)| *component)
}

impl<S, N> FormatEvent<S, N> for SlickLogFormatter
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
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        let component = visitor
            .component
            .as_deref()
            .or_else(|| component_for_target(event.metadata().target()));
        let formatted_service = self.format_service_name(component);
        let formatted_level = self.format_log_level(level);

        let color = self.color_for_level(level);
        let reset_color = if self.color_enabled { COLOR_RESET } else { "" };
        let cyan_color = if self.color_enabled { COLOR_CYAN } else { "" };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan_color, timestamp, formatted_service, color, formatted_level, reset_color
        )?;
        writeln!(writer, "{}{}", visitor.message, reset_color)?;

        Ok(())
    }
}

/// Extracts the message and component fields from an event
struct FieldVisitor {
    message: String,
    component: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            message: String::new(),
            component: None,
        }
    }
}

fn strip_quotes(raw: String) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].to_string()
    } else {
        raw
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = strip_quotes(format!("{:?}", value)),
            "component" => self.component = Some(strip_quotes(format!("{:?}", value))),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Whether output goes to a colour-capable terminal
fn is_terminal() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_name_column() {
        let formatter = SlickLogFormatter::new("slick".to_string());

        let plain = formatter.format_service_name(None);
        assert_eq!(plain.len(), SERVICE_NAME_WIDTH);
        assert!(plain.starts_with("slick "));

        let tagged = formatter.format_service_name(Some("session"));
        assert!(tagged.starts_with("slick-session"));

        let long = formatter.format_service_name(Some("a-very-long-component-name"));
        assert_eq!(long.chars().count(), SERVICE_NAME_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_component_from_target() {
        assert_eq!(component_for_target("slick_session::client"), Some("session"));
        assert_eq!(component_for_target("slick_session::supervisor"), Some("retry"));
        assert_eq!(component_for_target("slick_session::keepalive"), Some("ping"));
        assert_eq!(component_for_target("slick_engage::activity"), Some("activity"));
        assert_eq!(component_for_target("slick_engage::facade"), Some("engage"));
        assert_eq!(component_for_target("slick_storage"), Some("storage"));
        // Whole path segments only
        assert_eq!(component_for_target("slick_session_extra::x"), None);
        assert_eq!(component_for_target("slick"), None);
        assert_eq!(component_for_target("reqwest::connect"), None);
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"hello\"".to_string()), "hello");
        assert_eq!(strip_quotes("42".to_string()), "42");
        assert_eq!(strip_quotes("\"".to_string()), "\"");
    }
}
