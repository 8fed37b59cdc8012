//! Leveled event sink shared by every component of the cell.
//!
//! One [`EventSink`] is built at startup and a clone handed to each
//! transport, device, controller and bridge. Events are kept in a bounded
//! ring buffer for the presentation tier, fanned out to subscribed callbacks,
//! and forwarded to the `log` facade so `env_logger` (or any other backend)
//! sees the same ordered stream.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

/// Default number of events retained in the ring buffer
pub const DEFAULT_EVENT_CAPACITY: usize = 200;

/// Log levels for the event sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Error messages
    Error,
    /// Warning messages
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }

    fn to_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// One entry in the event stream
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
}

impl LogEvent {
    /// `[HH:MM:SS.mmm] LEVEL [component] message`
    pub fn format_line(&self) -> String {
        format!(
            "[{}] {:<5} [{}] {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level.as_str(),
            self.component,
            self.message
        )
    }
}

/// Type alias for event subscribers
pub type LogCallback = Box<dyn Fn(&LogEvent) + Send + Sync>;

struct SinkInner {
    buffer: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
    min_level: LogLevel,
    subscribers: RwLock<Vec<Arc<LogCallback>>>,
}

/// Cloneable handle to the shared event stream
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink {
    /// Create a sink retaining at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self::with_min_level(capacity, LogLevel::Debug)
    }

    /// Create a sink that drops events below `min_level`
    pub fn with_min_level(capacity: usize, min_level: LogLevel) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(SinkInner {
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                min_level,
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a callback invoked for every accepted event
    pub fn subscribe(&self, callback: LogCallback) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.push(Arc::new(callback));
    }

    /// Append an event
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if level > self.inner.min_level {
            return;
        }

        log::log!(level.to_log_level(), "[{}] {}", component, message);

        let event = LogEvent {
            timestamp: Local::now(),
            level,
            component: component.to_string(),
            message: message.to_string(),
        };

        {
            let mut buffer = self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() == self.inner.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // Snapshot so a callback may log without deadlocking
        let subscribers: Vec<Arc<LogCallback>> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in subscribers {
            callback(&event);
        }
    }

    pub fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, component, message);
    }

    pub fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, component, message);
    }

    pub fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, component, message);
    }

    pub fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, component, message);
    }

    /// Log packet data as a hex dump
    pub fn log_packet(&self, component: &str, direction: &str, data: &[u8]) {
        if LogLevel::Debug > self.inner.min_level {
            return;
        }
        let message = format!(
            "{} ({} bytes): {}",
            direction,
            data.len(),
            hex::encode(data)
        );
        self.debug(component, &message);
    }

    /// Retained events, oldest first
    pub fn recent(&self) -> Vec<LogEvent> {
        let buffer = self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.iter().cloned().collect()
    }

    /// Retained events rendered with [`LogEvent::format_line`]
    pub fn recent_lines(&self) -> Vec<String> {
        self.recent().iter().map(LogEvent::format_line).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn clear(&self) {
        self.inner.buffer.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Retained events as CSV with a `Timestamp,Level,Component,Message` header
    pub fn export_csv(&self) -> String {
        let mut out = String::from("Timestamp,Level,Component,Message\n");
        for event in self.recent() {
            out.push_str(&format!(
                "{},{},{},{}\n",
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.level.as_str(),
                csv_field(&event.component),
                csv_field(&event.message)
            ));
        }
        out
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Sink that mirrors every event to stdout/stderr
#[macro_export]
macro_rules! console_sink {
    () => {{
        let sink = $crate::logging::EventSink::default();
        sink.subscribe(Box::new(|event| match event.level {
            $crate::logging::LogLevel::Error | $crate::logging::LogLevel::Warn => {
                eprintln!("{}", event.format_line())
            }
            _ => println!("{}", event.format_line()),
        }));
        sink
    }};
}
