//! Leveled logging sink with structured fields
//!
//! The pool, executor and transaction coordinator report lifecycle events
//! through a [`LogSink`]. The default [`TracingSink`] forwards to `tracing`;
//! applications with their own logging pipeline implement the trait.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for leveled log messages
pub trait LogSink: Send + Sync + 'static {
    /// Informational event
    fn info(&self, message: &str, fields: &LogFields);
    /// Something unexpected that the caller can recover from
    fn warn(&self, message: &str, fields: &LogFields);
    /// A failed operation
    fn error(&self, message: &str, fields: &LogFields);
}

/// A scalar log field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// String
    Str(String),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    Uint(u64),
    /// Float
    Float(f64),
    /// Boolean
    Bool(bool),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{:?}", s),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Uint(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Uint(v.into())
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Uint(v as u64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Ordered set of structured fields attached to a log message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogFields(BTreeMap<&'static str, FieldValue>);

impl LogFields {
    /// Empty field set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field (builder style)
    pub fn with(mut self, key: &'static str, value: impl Into<FieldValue>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    /// Add a field in place
    pub fn insert(&mut self, key: &'static str, value: impl Into<FieldValue>) {
        self.0.insert(key, value.into());
    }

    /// Field value by key
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    /// Iterate fields in key order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }

    /// Whether no fields are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LogFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

/// Keys [`TracingSink`] records as individual event fields
const EVENT_FIELDS: [&str; 13] = [
    "query",
    "params",
    "sqlstate",
    "error",
    "elapsed_ms",
    "attempt",
    "max_attempts",
    "delay_ms",
    "version",
    "max_conns",
    "min_conns",
    "in_use",
    "closed_idle",
];

/// A field value rendered without quoting
struct Bare<'a>(&'a FieldValue);

impl fmt::Display for Bare<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            FieldValue::Str(s) => f.write_str(s),
            other => fmt::Display::fmt(other, f),
        }
    }
}

/// Fields outside [`EVENT_FIELDS`], rendered `key=value`
struct Other<'a>(&'a LogFields);

impl fmt::Display for Other<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.0.iter().filter(|(k, _)| !EVENT_FIELDS.contains(k)) {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

impl LogFields {
    fn event_field(&self, key: &str) -> Option<tracing::field::DisplayValue<Bare<'_>>> {
        self.get(key).map(|v| tracing::field::display(Bare(v)))
    }

    fn other(&self) -> Option<tracing::field::DisplayValue<Other<'_>>> {
        self.iter()
            .any(|(k, _)| !EVENT_FIELDS.contains(&k))
            .then(|| tracing::field::display(Other(self)))
    }
}

/// One `tracing` event per message; absent fields are not recorded
macro_rules! emit {
    ($level:expr, $message:expr, $fields:expr) => {{
        let fields: &LogFields = $fields;
        tracing::event!(
            $level,
            component = "ysql",
            query = fields.event_field("query"),
            params = fields.event_field("params"),
            sqlstate = fields.event_field("sqlstate"),
            error = fields.event_field("error"),
            elapsed_ms = fields.event_field("elapsed_ms"),
            attempt = fields.event_field("attempt"),
            max_attempts = fields.event_field("max_attempts"),
            delay_ms = fields.event_field("delay_ms"),
            version = fields.event_field("version"),
            max_conns = fields.event_field("max_conns"),
            min_conns = fields.event_field("min_conns"),
            in_use = fields.event_field("in_use"),
            closed_idle = fields.event_field("closed_idle"),
            other = fields.other(),
            "{}",
            $message
        )
    }};
}

/// Forwards to `tracing` events tagged `component = "ysql"`
///
/// Each structured field becomes an event field of the same name. Keys the
/// crate does not log itself are collected into a single `other` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn info(&self, message: &str, fields: &LogFields) {
        emit!(tracing::Level::INFO, message, fields);
    }

    fn warn(&self, message: &str, fields: &LogFields) {
        emit!(tracing::Level::WARN, message, fields);
    }

    fn error(&self, message: &str, fields: &LogFields) {
        emit!(tracing::Level::ERROR, message, fields);
    }
}

/// Log level of a captured record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Info
    Info,
    /// Warn
    Warn,
    /// Error
    Error,
}

/// A captured log record
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Level
    pub level: Level,
    /// Message
    pub message: String,
    /// Structured fields
    pub fields: LogFields,
}

/// Sink that keeps records in memory, for tests and diagnostics
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far
    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records whose message contains `needle`
    pub fn find(&self, needle: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.message.contains(needle))
            .collect()
    }

    fn push(&self, level: Level, message: &str, fields: &LogFields) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Record {
                level,
                message: message.to_string(),
                fields: fields.clone(),
            });
    }
}

impl LogSink for MemorySink {
    fn info(&self, message: &str, fields: &LogFields) {
        self.push(Level::Info, message, fields);
    }

    fn warn(&self, message: &str, fields: &LogFields) {
        self.push(Level::Warn, message, fields);
    }

    fn error(&self, message: &str, fields: &LogFields) {
        self.push(Level::Error, message, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_display_in_key_order() {
        let fields = LogFields::new()
            .with("min_conns", 5u32)
            .with("max_conns", 25u32)
            .with("version", "PostgreSQL 11.2-YB");
        assert_eq!(
            fields.to_string(),
            "max_conns=25 min_conns=5 version=\"PostgreSQL 11.2-YB\""
        );
    }

    #[test]
    fn test_memory_sink_captures_levels() {
        let sink = MemorySink::new();
        sink.info("pool ready", &LogFields::new());
        sink.warn("retrying", &LogFields::new().with("attempt", 2u32));
        sink.error("query failed", &LogFields::new());

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].level, Level::Warn);
        assert_eq!(records[1].fields.get("attempt"), Some(&FieldValue::Uint(2)));
        assert_eq!(sink.find("query").len(), 1);
    }

    #[test]
    fn test_memory_sink_clones_share_records() {
        let sink = MemorySink::new();
        let shared: Arc<dyn LogSink> = Arc::new(sink.clone());
        shared.info("hello", &LogFields::new());
        assert_eq!(sink.records().len(), 1);
    }

    /// Captures `name=value` for every field of every event
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Captured {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            struct Visitor<'a>(&'a mut Vec<String>);

            impl tracing::field::Visit for Visitor<'_> {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
                    self.0.push(format!("{}={:?}", field.name(), value));
                }

                fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                    self.0.push(format!("{}={}", field.name(), value));
                }
            }

            let mut out = self.0.lock().unwrap();
            event.record(&mut Visitor(&mut out));
        }
    }

    #[test]
    fn test_tracing_sink_records_fields_individually() {
        use tracing_subscriber::layer::SubscriberExt;

        let captured = Captured::default();
        let subscriber = tracing_subscriber::registry().with(captured.clone());
        tracing::subscriber::with_default(subscriber, || {
            TracingSink.error(
                "query failed",
                &LogFields::new()
                    .with("query", "SELECT 1")
                    .with("sqlstate", "40001")
                    .with("elapsed_ms", 12u64)
                    .with("shard", 3u32),
            );
        });

        let fields = captured.0.lock().unwrap().clone();
        assert!(fields.contains(&"component=ysql".to_string()), "{fields:?}");
        assert!(fields.contains(&"query=SELECT 1".to_string()), "{fields:?}");
        assert!(fields.contains(&"sqlstate=40001".to_string()), "{fields:?}");
        assert!(fields.contains(&"elapsed_ms=12".to_string()), "{fields:?}");
        assert!(fields.contains(&"other=shard=3".to_string()), "{fields:?}");
        assert!(fields.contains(&"message=query failed".to_string()), "{fields:?}");
        // Keys that were not supplied are left out
        assert!(!fields.iter().any(|f| f.starts_with("error=")), "{fields:?}");
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.info("no subscriber", &LogFields::new().with("k", true));
    }
}
