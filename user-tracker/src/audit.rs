use crate::config::TrackerConfig;
use crate::error::TrackerResult;
use crate::graphql::{GraphQlRequest, QueryExecutor, create_nerdgraph_client, fetch};
use crate::records::null_as_default;
use crate::runner::UnitReport;
use crate::telemetry::{MetricEmitter, MetricRecord, create_metric_forwarder};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

pub const AUDIT_OPERATION: &str = "nrqlAuditEvents";
pub const AUDIT_NRQL: &str = "FROM NrAuditEvent SELECT * SINCE 1 day ago LIMIT MAX";
pub const AUDIT_METRIC: &str = "tracker.users.audit.value";

fn audit_request(account_id: i64) -> GraphQlRequest {
    let query = format!(
        r#"{{
  actor {{
    nrql(accounts: {account_id}, query: "{AUDIT_NRQL}") {{
      results
    }}
  }}
}}"#
    );

    GraphQlRequest::new(AUDIT_OPERATION, query)
        .with_variable("accountId", account_id.to_string())
        .with_variable("nrqlQuery", AUDIT_NRQL)
}

/// One `NrAuditEvent` row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditEvent {
    #[serde(deserialize_with = "lenient_string")]
    pub action_identifier: String,
    #[serde(deserialize_with = "lenient_string")]
    pub actor_email: String,
    #[serde(deserialize_with = "lenient_string")]
    pub actor_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub actor_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub scope_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub scope_type: String,
    #[serde(deserialize_with = "lenient_string")]
    pub target_id: String,
    #[serde(deserialize_with = "lenient_string")]
    pub target_type: String,
    /// Milliseconds since the epoch. Rows without one are stamped at emit time.
    pub timestamp: Option<i64>
}

/// NRQL returns IDs as numbers or strings depending on the event source.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string()
    })
}

impl AuditEvent {
    pub fn to_metric(&self) -> MetricRecord {
        let attributes = BTreeMap::from([
            (
                "tracker.users.audit.actionIdentifier".to_string(),
                self.action_identifier.clone()
            ),
            (
                "tracker.users.audit.actorEmail".to_string(),
                self.actor_email.clone()
            ),
            (
                "tracker.users.audit.actorId".to_string(),
                self.actor_id.clone()
            ),
            (
                "tracker.users.audit.actorType".to_string(),
                self.actor_type.clone()
            ),
            (
                "tracker.users.audit.description".to_string(),
                self.description.clone()
            ),
            ("tracker.users.audit.id".to_string(), self.id.clone()),
            (
                "tracker.users.audit.scopeId".to_string(),
                self.scope_id.clone()
            ),
            (
                "tracker.users.audit.scopeType".to_string(),
                self.scope_type.clone()
            ),
            (
                "tracker.users.audit.targetId".to_string(),
                self.target_id.clone()
            ),
            (
                "tracker.users.audit.targetType".to_string(),
                self.target_type.clone()
            )
        ]);

        let metric = MetricRecord::gauge(AUDIT_METRIC, 1.0).with_attributes(attributes);
        match self.timestamp {
            Some(timestamp) => metric.with_timestamp(timestamp),
            None => metric
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NrqlData {
    #[serde(deserialize_with = "null_as_default")]
    actor: NrqlActor
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NrqlActor {
    #[serde(deserialize_with = "null_as_default")]
    nrql: NrqlResults
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NrqlResults {
    #[serde(deserialize_with = "null_as_default")]
    results: Vec<AuditEvent>
}

pub struct AuditTracker {
    account_id: i64,
    executor: Arc<dyn QueryExecutor>,
    emitter: Arc<dyn MetricEmitter>
}

impl AuditTracker {
    pub fn new(
        account_id: i64,
        executor: Arc<dyn QueryExecutor>,
        emitter: Arc<dyn MetricEmitter>
    ) -> Self {
        Self {
            account_id,
            executor,
            emitter
        }
    }

    pub fn from_config(config: &TrackerConfig) -> TrackerResult<Self> {
        Ok(Self::new(
            config.account_id,
            create_nerdgraph_client(&config.graphql_endpoint, &config.api_key)?,
            create_metric_forwarder(
                &config.metric_endpoint,
                &config.license_key,
                config.audit_attributes()
            )?
        ))
    }

    /// Audit events of the last day, in a single non-paginated query.
    pub async fn fetch_audit_events(&self) -> TrackerResult<Vec<AuditEvent>> {
        let request = audit_request(self.account_id);
        let data: NrqlData = fetch(self.executor.as_ref(), &request).await?;
        Ok(data.actor.nrql.results)
    }

    pub async fn run(&self) -> TrackerResult<UnitReport> {
        let mut report = UnitReport::new("auditEvent");

        let events = self.fetch_audit_events().await.inspect_err(|e| {
            error!(account_id = self.account_id, error = %e, "Fetching audit events failed");
        })?;
        report.records_fetched = events.len();
        info!(count = events.len(), "Fetched audit events");

        let metrics: Vec<MetricRecord> = events.iter().map(AuditEvent::to_metric).collect();
        let result = self.emitter.emit(&metrics).await;
        report.record_emit(result, metrics.len());

        report.complete();
        info!(
            records_fetched = report.records_fetched,
            metrics_emitted = report.metrics_emitted,
            "Audit unit completed"
        );

        Ok(report)
    }
}
