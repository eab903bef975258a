//! Logging.

use std::{backtrace::Backtrace, fmt, path::PathBuf, sync::OnceLock};

use chrono::{
    format::{DelayedFormat, Item, StrftimeItems},
    Utc,
};
use pulse_config::GenericConfiguration;
use pulse_error::{ErrorContext as _, GenericError};
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use serde::Deserialize;
use tracing::{error, field, Event, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer, Registry,
};

const DEFAULT_LOG_FILE_MAX_SIZE: u64 = 10485760;
const DEFAULT_LOG_FILE_MAX_ROLLS: usize = 1;

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_log_file_max_size() -> u64 {
    DEFAULT_LOG_FILE_MAX_SIZE
}

const fn default_log_file_max_rolls() -> usize {
    DEFAULT_LOG_FILE_MAX_ROLLS
}

/// Logging configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfiguration {
    /// Log filtering directives, in `EnvFilter` syntax.
    ///
    /// Defaults to `info`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to log as JSON instead of plain text.
    ///
    /// Defaults to `false`.
    #[serde(default)]
    pub log_format_json: bool,

    /// File to additionally write logs to.
    ///
    /// Defaults to unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Size, in bytes, at which the log file is rolled.
    ///
    /// Defaults to 10MiB.
    #[serde(default = "default_log_file_max_size")]
    pub log_file_max_size: u64,

    /// Number of rolled log files to keep.
    ///
    /// Defaults to 1.
    #[serde(default = "default_log_file_max_rolls")]
    pub log_file_max_rolls: usize,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` from the given configuration.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed()?)
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: false,
            log_file: None,
            log_file_max_size: DEFAULT_LOG_FILE_MAX_SIZE,
            log_file_max_rolls: DEFAULT_LOG_FILE_MAX_ROLLS,
        }
    }
}

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Routes panics through `tracing`, along with a backtrace.
///
/// Panics are still caught wherever they would be otherwise; this only controls how they are reported.
pub fn set_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = Backtrace::force_capture();
        error!(panic = %info, backtrace = %backtrace, "Panicked.");
    }));
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are written to standard output, either as plain text or as JSON, and optionally to a rolling log file as plain
/// text. The returned guard must be held for as long as logs should be written to the log file.
///
/// # Errors
///
/// If the log level directives are invalid, the log file cannot be opened, or the logging subsystem was already
/// initialized, an error will be returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<Option<WorkerGuard>, GenericError> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stdout_layer: Box<dyn Layer<Registry> + Send + Sync> = if config.log_format_json {
        tracing_subscriber::fmt::Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(level_filter(&config.log_level)?)
            .boxed()
    } else {
        tracing_subscriber::fmt::Layer::new()
            .event_format(PlainFormatter)
            .with_filter(level_filter(&config.log_level)?)
            .boxed()
    };
    layers.push(stdout_layer);

    let guard = match &config.log_file {
        Some(log_file) => {
            let file_appender = BasicRollingFileAppender::new(
                log_file,
                RollingConditionBasic::new().max_size(config.log_file_max_size),
                config.log_file_max_rolls,
            )
            .with_error_context(|| format!("Failed to open log file '{}'.", log_file.display()))?;
            let (file_nb, guard) = tracing_appender::non_blocking(file_appender);

            layers.push(
                tracing_subscriber::fmt::Layer::new()
                    .with_ansi(false)
                    .event_format(PlainFormatter)
                    .with_writer(file_nb)
                    .with_filter(level_filter(&config.log_level)?)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .error_context("Failed to initialize logging.")?;

    Ok(guard)
}

fn level_filter(directives: &str) -> Result<EnvFilter, GenericError> {
    EnvFilter::try_new(directives).with_error_context(|| format!("Invalid log level '{}'.", directives))
}

/// Plain text formatter.
///
/// Lines look like `2024-12-31 23:59:59 UTC | PULSE | INFO | (file.rs:10) | key:value,key2:value2 | message`.
struct PlainFormatter;

impl<S, N> FormatEvent<S, N> for PlainFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(writer, "{} | PULSE | {} | ", get_delayed_format_now(), metadata.level())?;

        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "({}:{})", file, line)?;
        } else {
            write!(writer, "(unknown:0)")?;
        }

        let mut v = PlainFieldVisitor::new(writer.by_ref());
        event.record(&mut v);
        v.finish()?;

        writeln!(writer)
    }
}

/// Writes structured fields as `key:value` pairs separated by commas, followed by the message.
///
/// Fields and the message are each written as `| <text>`. The first write error is kept and returned when the visitor
/// is finished; every write after it is skipped.
struct PlainFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    last_result: fmt::Result,
}

impl<'writer> PlainFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            last_result: Ok(()),
        }
    }

    fn try_write(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.last_result.is_err() {
            return;
        }

        if field.name() == "message" {
            // The message always comes last.
            self.last_result = f(&mut self.message);
            return;
        }

        let separator = if self.fields_written == 0 { " | " } else { "," };
        self.last_result = write!(self.writer, "{}{}:", separator, field.name());
        if self.last_result.is_err() {
            return;
        }

        self.last_result = f(&mut self.writer);
        if self.last_result.is_ok() {
            self.fields_written += 1;
        }
    }
}

impl field::Visit for PlainFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.try_write(field, |w| write!(w, "{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.try_write(field, |w| write!(w, "{}", value));
    }
}

impl VisitOutput<fmt::Result> for PlainFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.last_result?;

        if !self.message.is_empty() {
            write!(self.writer, " | {}", self.message)
        } else {
            Ok(())
        }
    }
}

/// Gets a delayed formatter for the current time, like `2024-12-31 23:59:59 UTC`.
fn get_delayed_format_now() -> DelayedFormat<impl Iterator<Item = &'static Item<'static>> + Clone> {
    static FORMAT_ITEMS: OnceLock<Vec<Item<'static>>> = OnceLock::new();
    let format_items = FORMAT_ITEMS.get_or_init(|| StrftimeItems::new("%Y-%m-%d %H:%M:%S UTC").collect());

    Utc::now().format_with_items(format_items.iter())
}
