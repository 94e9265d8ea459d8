use crate::audit::AuditTracker;
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::logs::{LogForwarder, init_tracing};
use crate::users::UsersTracker;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

/// Outcome of one unit of work that got past its fetch.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub unit: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_fetched: usize,
    pub metrics_emitted: usize,
    pub flush_error: Option<String>
}

impl UnitReport {
    pub fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            records_fetched: 0,
            metrics_emitted: 0,
            flush_error: None
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Emission failures are recorded, never propagated.
    pub fn record_emit(&mut self, result: TrackerResult<()>, count: usize) {
        match result {
            Ok(()) => self.metrics_emitted = count,
            Err(e) => {
                warn!(unit = %self.unit, error = %e, "Metrics could not be forwarded");
                self.flush_error = Some(e.to_string());
            }
        }
    }
}

/// Results of both units of a run.
#[derive(Debug)]
pub struct RunReport {
    pub users: TrackerResult<UnitReport>,
    pub audit: TrackerResult<UnitReport>
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.users.is_ok() && self.audit.is_ok()
    }

    /// Units whose fetch failed, with the error that stopped them.
    pub fn failures(&self) -> Vec<(&'static str, &TrackerError)> {
        [("users", &self.users), ("auditEvent", &self.audit)]
            .into_iter()
            .filter_map(|(unit, result)| result.as_ref().err().map(|e| (unit, e)))
            .collect()
    }

    pub fn failed_units(&self) -> Vec<&'static str> {
        self.failures().into_iter().map(|(unit, _)| unit).collect()
    }
}

/// Runs both units concurrently and waits for both to finish.
///
/// A failure in one unit does not cancel the other.
pub async fn run_units(users: &UsersTracker, audit: &AuditTracker) -> RunReport {
    let (users, audit) = tokio::join!(users.run(), audit.run());
    RunReport { users, audit }
}

/// Builds both units from `config`, runs them, then forwards captured logs.
pub async fn run(config: &TrackerConfig, logs: Option<&LogForwarder>) -> TrackerResult<RunReport> {
    let users = UsersTracker::from_config(config)?;
    let audit = AuditTracker::from_config(config)?;

    info!(
        organization_id = %config.organization_id,
        account_id = config.account_id,
        "Starting tracker run"
    );
    let report = run_units(&users, &audit).await;

    if let Some(logs) = logs {
        logs.flush_or_report().await;
    }

    Ok(report)
}

/// Process entry: reads the environment, runs once, and fails if any unit
/// could not fetch its data.
pub async fn run_from_env() -> TrackerResult<()> {
    let buffer = init_tracing();
    let config = TrackerConfig::from_env()?;
    let logs = LogForwarder::new(
        &config.log_endpoint,
        &config.license_key,
        config.log_attributes(),
        buffer
    )?;

    let report = run(&config, Some(&logs)).await?;
    if report.is_success() {
        info!("Tracker run completed");
        return Ok(());
    }

    for (unit, e) in report.failures() {
        error!(unit, transport = e.is_transport(), error = %e, "Unit failed");
    }
    let failed = report.failed_units();
    error!(units = ?failed, "Tracker run failed");
    Err(TrackerError::UnitsFailed(failed))
}
