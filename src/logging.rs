use crate::cli::LogLevel;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// Each line carries a local timestamp, the level and the active span scope,
/// e.g. `12:00:01.042 INFO coordinator: Case 3 complete`. Many workers share
/// one process, so the scope (`worker{id=sender-1a2b3c4d}`) is what tells
/// their lines apart. The whole line is colored by severity.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();

        // Buffer the whole line so the color covers all of it.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        write!(
            buf_writer,
            "{} {:>5} ",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            level
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(buf_writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(buf_writer, "{{{}}}", fields)?;
                    }
                }
                write!(buf_writer, ": ")?;
            }
        }
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match level {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    // A second init (as in tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stderr)
        .try_init();
}
