//! Tracing setup and log forwarding.
//!
//! Every event that passes the filter is printed to the console and also
//! buffered by [`LogCaptureLayer`]. At the end of a run the buffer is sent
//! to the log API in one batch by [`LogForwarder`].

use crate::error::{TrackerError, TrackerResult};
use crate::telemetry::post_ingest;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber, debug, warn};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer};

/// Events on this target go to the console only.
pub const CONSOLE_TARGET: &str = "user_tracker::console";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub timestamp: i64,
    pub message: String,
    pub attributes: BTreeMap<String, String>
}

/// Shared, append-only buffer of captured log records.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    records: Arc<Mutex<Vec<LogRecord>>>
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: LogRecord) {
        self.records.lock().push(record);
    }

    /// Takes every buffered record, leaving the buffer empty.
    pub fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

pub struct LogCaptureLayer {
    buffer: LogBuffer
}

impl LogCaptureLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target() == CONSOLE_TARGET {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut attributes = visitor.fields;
        attributes.insert("level".to_string(), metadata.level().to_string());
        attributes.insert("target".to_string(), metadata.target().to_string());

        self.buffer.push(LogRecord {
            timestamp: Utc::now().timestamp_millis(),
            message: visitor.message.unwrap_or_default(),
            attributes
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: BTreeMap<String, String>
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }
}

/// Installs the global subscriber and returns the buffer it captures into.
pub fn init_tracing() -> LogBuffer {
    let buffer = LogBuffer::new();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,user_tracker=debug"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer())
        .with(LogCaptureLayer::new(buffer.clone()))
        .try_init();
    if installed.is_err() {
        warn!("Tracing subscriber already installed, logs will not be captured");
    }

    buffer
}

#[derive(Serialize)]
struct LogCommon<'a> {
    attributes: &'a BTreeMap<String, String>
}

#[derive(Serialize)]
struct LogBatch<'a> {
    common: LogCommon<'a>,
    logs: &'a [LogRecord]
}

/// Sends captured records to the log API.
pub struct LogForwarder {
    client: Client,
    endpoint: String,
    license_key: String,
    common_attributes: BTreeMap<String, String>,
    buffer: LogBuffer
}

impl LogForwarder {
    pub fn new(
        endpoint: &str,
        license_key: &str,
        common_attributes: BTreeMap<String, String>,
        buffer: LogBuffer
    ) -> TrackerResult<Self> {
        let client = Client::builder().build().map_err(TrackerError::HttpError)?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            license_key: license_key.to_string(),
            common_attributes,
            buffer
        })
    }

    /// Forwards and clears the buffer, returning how many records were sent.
    pub async fn flush(&self) -> TrackerResult<usize> {
        let records = self.buffer.drain();
        if records.is_empty() {
            return Ok(0);
        }

        debug!(target: CONSOLE_TARGET, count = records.len(), "Forwarding logs");
        let batch = [LogBatch {
            common: LogCommon {
                attributes: &self.common_attributes
            },
            logs: &records
        }];
        post_ingest(
            &self.client,
            &self.endpoint,
            &self.license_key,
            "logs",
            &batch
        )
        .await?;

        Ok(records.len())
    }

    /// Like [`LogForwarder::flush`], but failures only reach the console.
    pub async fn flush_or_report(&self) {
        if let Err(e) = self.flush().await {
            warn!(target: CONSOLE_TARGET, error = %e, "logs could not be forwarded");
        }
    }
}
