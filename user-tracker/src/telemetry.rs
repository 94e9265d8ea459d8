use crate::error::{TrackerError, TrackerResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A gauge sample handed to the metric backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    /// Milliseconds since the epoch; emit time is used when absent.
    pub timestamp: Option<i64>,
    pub attributes: BTreeMap<String, String>
}

impl MetricRecord {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: None,
            attributes: BTreeMap::new()
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Forwards one batch of metrics to the telemetry backend.
#[async_trait]
pub trait MetricEmitter: Send + Sync {
    async fn emit(&self, metrics: &[MetricRecord]) -> TrackerResult<()>;
}

#[derive(Serialize)]
struct CommonBlock<'a> {
    attributes: &'a BTreeMap<String, String>
}

#[derive(Serialize)]
struct MetricBatch<'a> {
    common: CommonBlock<'a>,
    metrics: Vec<WireMetric<'a>>
}

#[derive(Serialize)]
struct WireMetric<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    metric_type: &'static str,
    value: f64,
    timestamp: i64,
    attributes: &'a BTreeMap<String, String>
}

/// Posts a JSON payload to a New Relic ingest API.
pub(crate) async fn post_ingest<T: Serialize + ?Sized>(
    client: &Client,
    endpoint: &str,
    license_key: &str,
    target: &'static str,
    payload: &T
) -> TrackerResult<()> {
    let response = client
        .post(endpoint)
        .header("Api-Key", license_key)
        .header("Content-Type", "application/json")
        .json(payload)
        .send()
        .await
        .map_err(|e| TrackerError::FlushError {
            target,
            message: e.to_string()
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TrackerError::FlushError {
            target,
            message: format!("{} - {}", status.as_u16(), body)
        });
    }

    Ok(())
}

/// Metric API client attaching a fixed set of common attributes to each batch.
pub struct NewRelicMetricForwarder {
    client: Client,
    endpoint: String,
    license_key: String,
    common_attributes: BTreeMap<String, String>
}

impl NewRelicMetricForwarder {
    pub fn new(
        endpoint: impl Into<String>,
        license_key: impl Into<String>,
        common_attributes: BTreeMap<String, String>
    ) -> TrackerResult<Self> {
        let client = Client::builder().build().map_err(TrackerError::HttpError)?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            license_key: license_key.into(),
            common_attributes
        })
    }
}

#[async_trait]
impl MetricEmitter for NewRelicMetricForwarder {
    async fn emit(&self, metrics: &[MetricRecord]) -> TrackerResult<()> {
        if metrics.is_empty() {
            debug!("No metrics to forward");
            return Ok(());
        }

        let now = Utc::now().timestamp_millis();
        let batch = [MetricBatch {
            common: CommonBlock {
                attributes: &self.common_attributes
            },
            metrics: metrics
                .iter()
                .map(|m| WireMetric {
                    name: &m.name,
                    metric_type: "gauge",
                    value: m.value,
                    timestamp: m.timestamp.unwrap_or(now),
                    attributes: &m.attributes
                })
                .collect()
        }];

        debug!(count = metrics.len(), endpoint = %self.endpoint, "Forwarding metrics");
        post_ingest(
            &self.client,
            &self.endpoint,
            &self.license_key,
            "metrics",
            &batch
        )
        .await
    }
}

pub fn create_metric_forwarder(
    endpoint: &str,
    license_key: &str,
    common_attributes: BTreeMap<String, String>
) -> TrackerResult<Arc<dyn MetricEmitter>> {
    Ok(Arc::new(NewRelicMetricForwarder::new(
        endpoint,
        license_key,
        common_attributes
    )?))
}

/// Emitter keeping every batch in memory.
#[derive(Default)]
pub struct InMemoryEmitter {
    batches: Mutex<Vec<Vec<MetricRecord>>>,
    fail: bool
}

impl InMemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emitter that records nothing and fails every call.
    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            fail: true
        }
    }

    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        self.batches.lock().clone()
    }

    pub fn emitted(&self) -> Vec<MetricRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl MetricEmitter for InMemoryEmitter {
    async fn emit(&self, metrics: &[MetricRecord]) -> TrackerResult<()> {
        if self.fail {
            return Err(TrackerError::FlushError {
                target: "metrics",
                message: "in-memory failure".to_string()
            });
        }
        self.batches.lock().push(metrics.to_vec());
        Ok(())
    }
}
