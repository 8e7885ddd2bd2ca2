use crate::config::LogLevel;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Once};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

const LOG_BUFFER_SIZE: usize = 5000;

/// Most recent log lines, for hosts that show them in a UI
static LOG_BUFFER: once_cell::sync::Lazy<Arc<Mutex<LogBuffer>>> =
    once_cell::sync::Lazy::new(|| Arc::new(Mutex::new(LogBuffer::new(LOG_BUFFER_SIZE))));

/// Buffer for storing recent log messages
pub struct LogBuffer {
    logs: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            logs: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    pub fn push(&mut self, log: String) {
        if self.logs.len() >= self.max_size {
            self.logs.pop_front();
        }
        self.logs.push_back(log);
    }

    /// Last `count` entries; 0 means all of them
    pub fn get_logs(&self, count: usize) -> Vec<String> {
        if count == 0 || count >= self.logs.len() {
            return self.logs.iter().cloned().collect();
        }
        let start = self.logs.len() - count;
        self.logs.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }
}

/// Get recent logs from the buffer
pub fn get_recent_logs(count: usize) -> Vec<String> {
    if let Ok(buffer) = LOG_BUFFER.lock() {
        buffer.get_logs(count)
    } else {
        vec![]
    }
}

/// Clear the log buffer
pub fn clear_logs() {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.clear();
    }
}

fn add_log(message: String) {
    if let Ok(mut buffer) = LOG_BUFFER.lock() {
        buffer.push(message);
    }
}

/// Initialize logging once per process; later calls are no-ops
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn directive(text: String) -> Result<tracing_subscriber::filter::Directive> {
    text.parse::<tracing_subscriber::filter::Directive>()
        .map_err(|e| Error::config(format!("Invalid log directive {}: {}", text, e)))
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let mut filter = EnvFilter::from_default_env();
    for krate in ["splitlink", "splitlink_core", "splitlink_netstack", "splitlink_sock2proc"] {
        filter = filter.add_directive(directive(format!("{}={}", krate, tracing_level))?);
    }
    let filter = filter.add_directive(directive("tokio=warn".to_string())?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // try_init: an embedding host may already own the global subscriber
    let result = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BufferLayer)
        .try_init();

    if result.is_err() {
        add_log("[INFO] Tracing already initialized, using existing subscriber".to_string());
    } else {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

/// Captures events into [`LOG_BUFFER`]
struct BufferLayer;

impl<S> tracing_subscriber::Layer<S> for BufferLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with("tokio") {
            return;
        }

        let mut visitor = LogVisitor::default();
        event.record(&mut visitor);
        add_log(format_line(metadata.level(), &visitor.message));
    }
}

fn format_line(level: &Level, message: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] [{}] {}", timestamp, level, message)
}

#[derive(Default)]
struct LogVisitor {
    message: String,
}

impl tracing::field::Visit for LogVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        } else {
            self.message.push_str(&format!(" {}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = format!("{:?}", value);
        } else {
            self.message.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// Log an error with context
pub fn log_error(error: &Error, context: Option<&str>) {
    let as_warning = error.is_recoverable();
    match (as_warning, context) {
        (true, Some(ctx)) => tracing::warn!("{}: {}", ctx, error),
        (true, None) => tracing::warn!("{}", error),
        (false, Some(ctx)) => tracing::error!("{}: {}", ctx, error),
        (false, None) => tracing::error!("{}", error),
    }
}

/// Log successful operation
pub fn log_success(operation: &str, details: Option<&str>) {
    if let Some(details) = details {
        tracing::info!("{}: {}", operation, details);
    } else {
        tracing::info!("{}", operation);
    }
}

/// Performance logging
pub struct PerformanceLogger {
    operation: String,
    start_time: std::time::Instant,
}

impl PerformanceLogger {
    pub fn new<S: Into<String>>(operation: S) -> Self {
        Self {
            operation: operation.into(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        tracing::debug!("{} completed in {:?}", self.operation, duration);
    }

    pub fn finish_with_result(self, result: &str) {
        let duration = self.start_time.elapsed();
        tracing::debug!("{} completed in {:?}: {}", self.operation, duration, result);
    }
}

/// Create a performance logger guard
pub fn time_operation<S: Into<String>>(operation: S) -> PerformanceLogger {
    PerformanceLogger::new(operation)
}
