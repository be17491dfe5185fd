//! Console and log file layers.
use std::fmt::{self, Write as _};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

use super::utils::{clock, log_path, stamp, strip_ansi};
use super::{DRY_RUN_TARGET, STAGE_TARGET};

/// Collects an event's `message` field and any other fields as `k=v`.
#[derive(Default)]
struct Fields {
    message: String,
    extra: String,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.extra, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.extra, " {}={value:?}", field.name());
        }
    }
}

impl Fields {
    fn of(event: &Event<'_>) -> Self {
        let mut fields = Self::default();
        event.record(&mut fields);
        fields
    }

    fn line(&self) -> String {
        format!("{}{}", self.message, self.extra)
    }
}

/// Writes one plain-text line per event to the command's log file.
#[derive(Debug)]
pub(super) struct FileLayer {
    file: Mutex<File>,
}

impl FileLayer {
    /// Start a fresh log for `command` in the cache directory.
    pub(super) fn new(command: &str) -> Option<Self> {
        Self::open(&log_path(command)?)
    }

    fn open(path: &Path) -> Option<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .ok()?;
        let version =
            option_env!("DOTSTATE_VERSION").unwrap_or(concat!("dev-", env!("CARGO_PKG_VERSION")));
        writeln!(file, "# dotstate {version} {}", stamp(chrono::Utc::now())).ok()?;
        Some(Self {
            file: Mutex::new(file),
        })
    }
}

impl<S: Subscriber> Layer<S> for FileLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let text = Fields::of(event).line();
        let text = strip_ansi(&text);
        let label = match (*meta.level(), meta.target()) {
            (Level::INFO, STAGE_TARGET) => "stage".to_string(),
            (Level::INFO, DRY_RUN_TARGET) => "dry-run".to_string(),
            (Level::DEBUG | Level::TRACE, target) => format!("debug {target}"),
            (level, _) => level.as_str().to_ascii_lowercase(),
        };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(file, "{} [{label}] {text}", clock(chrono::Utc::now()));
    }
}

/// Terminal rendering: bold stage headers, colored warnings and errors,
/// indented progress lines.
struct ConsoleFormat;

impl<S, N> FormatEvent<S, N> for ConsoleFormat
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
        let meta = event.metadata();
        let text = Fields::of(event).line();
        match (*meta.level(), meta.target()) {
            (Level::ERROR, _) => writeln!(writer, "\x1b[1;31merror:\x1b[0m {text}"),
            (Level::WARN, _) => writeln!(writer, "\x1b[1;33mwarning:\x1b[0m {text}"),
            (Level::INFO, STAGE_TARGET) => writeln!(writer, "\x1b[1m:: {text}\x1b[0m"),
            (Level::INFO, DRY_RUN_TARGET) => writeln!(writer, "   \x1b[36m(dry run)\x1b[0m {text}"),
            (Level::INFO, _) => writeln!(writer, "   {text}"),
            _ => writeln!(writer, "   \x1b[2m{text}\x1b[0m"),
        }
    }
}

/// Install the global subscriber.
///
/// The console shows INFO and above (DEBUG with `verbose`). Warnings and
/// errors go to stderr and the rest to stdout. The log file for `command`
/// receives DEBUG and above regardless.
pub fn init_subscriber(verbose: bool, command: &str) {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::fmt::writer::MakeWriterExt as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let console_writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);
    let console = tracing_subscriber::fmt::layer()
        .event_format(ConsoleFormat)
        .with_writer(console_writer)
        .with_filter(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        });
    let file = FileLayer::new(command).map(|layer| layer.with_filter(LevelFilter::DEBUG));

    tracing_subscriber::registry().with(console).with(file).init();
}
