use colored::*;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// Wire up the two output streams: a clean colorized console line for the
/// user and a detailed diagnostic record elsewhere.
///
/// The diagnostic stream goes to a daily-rolling file (default
/// `serial-fabric.log` in the working directory) through a non-blocking
/// writer; passing `stderr` as the log file sends it to stderr instead.
/// Returns the appender guard that must stay alive for file logging to keep
/// flushing — the caller holds it for the life of the process.
pub fn init(verbose: u8, quiet: bool, log_file: Option<&str>) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    if log_file == Some("stderr") {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(level),
            )
            .with(console_layer(quiet, level))
            .init();
        return None;
    }

    let target = log_file
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("serial-fabric.log"));
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = target
        .file_name()
        .map(Path::new)
        .unwrap_or_else(|| Path::new("serial-fabric.log"))
        .to_path_buf();

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level),
        )
        .with(console_layer(quiet, level))
        .init();
    Some(guard)
}

/// User-facing stream, suppressed entirely by --quiet.
///
/// Generic over the parent subscriber so it can be attached after either
/// the stderr or the file diagnostic layer without type mismatches.
fn console_layer<S>(quiet: bool, level: LevelFilter) -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    (!quiet).then(|| {
        Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(level),
        ) as Box<dyn Layer<S> + Send + Sync>
    })
}

/// Colorized formatter for the user-facing stdout stream.
///
/// Relayed port traffic and status lines print without metadata clutter;
/// problems stand out with a severity prefix and color. The detailed
/// timestamped record goes to the file layer, not here.
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
        // Buffer the formatted fields so color and prefix wrap the whole
        // line, not just the leading fragment.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let line = match *event.metadata().level() {
            Level::ERROR => format!("error: {buffer}").red().bold(),
            Level::WARN => format!("warning: {buffer}").yellow(),
            Level::INFO => buffer.normal(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.bright_black(),
        };

        writeln!(writer, "{}", line)
    }
}
