use crate::error::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_GRAPHQL_ENDPOINT: &str = "https://api.eu.newrelic.com/graphql";
pub const DEFAULT_METRIC_ENDPOINT: &str = "https://metric-api.eu.newrelic.com/metric/v1";
pub const DEFAULT_LOG_ENDPOINT: &str = "https://log-api.eu.newrelic.com/log/v1";

/// Settings resolved once at process start and handed to every unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub organization_id: String,
    pub account_id: i64,
    /// User key for NerdGraph.
    pub api_key: String,
    /// Ingest key for the metric and log APIs.
    pub license_key: String,
    #[serde(default = "default_graphql_endpoint")]
    pub graphql_endpoint: String,
    #[serde(default = "default_metric_endpoint")]
    pub metric_endpoint: String,
    #[serde(default = "default_log_endpoint")]
    pub log_endpoint: String
}

fn default_graphql_endpoint() -> String {
    DEFAULT_GRAPHQL_ENDPOINT.to_string()
}

fn default_metric_endpoint() -> String {
    DEFAULT_METRIC_ENDPOINT.to_string()
}

fn default_log_endpoint() -> String {
    DEFAULT_LOG_ENDPOINT.to_string()
}

impl TrackerConfig {
    /// Reads the `NEWRELIC_*` environment variables.
    pub fn from_env() -> TrackerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> TrackerResult<Self>
    where
        F: Fn(&str) -> Option<String>
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| TrackerError::ConfigError(format!("{key} not set")))
        };

        let account_id = required("NEWRELIC_ACCOUNT_ID")?;
        let account_id = account_id.trim().parse::<i64>().map_err(|e| {
            TrackerError::ConfigError(format!("NEWRELIC_ACCOUNT_ID is not a number: {e}"))
        })?;

        Ok(Self {
            organization_id: required("NEWRELIC_ORGANIZATION_ID")?,
            account_id,
            api_key: required("NEWRELIC_API_KEY")?,
            license_key: required("NEWRELIC_LICENSE_KEY")?,
            graphql_endpoint: lookup("NEWRELIC_GRAPHQL_ENDPOINT")
                .unwrap_or_else(default_graphql_endpoint),
            metric_endpoint: lookup("NEWRELIC_METRIC_ENDPOINT")
                .unwrap_or_else(default_metric_endpoint),
            log_endpoint: lookup("NEWRELIC_LOG_ENDPOINT").unwrap_or_else(default_log_endpoint)
        })
    }

    pub fn builder() -> TrackerConfigBuilder {
        TrackerConfigBuilder::default()
    }

    /// Attributes attached to every metric of the users unit.
    pub fn users_attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("tracker.attributeType".to_string(), "users".to_string()),
            (
                "tracker.organizationId".to_string(),
                self.organization_id.clone()
            )
        ])
    }

    /// Attributes attached to every metric of the audit unit and to forwarded logs.
    pub fn audit_attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("tracker.attributeType".to_string(), "auditEvent".to_string()),
            (
                "tracker.organizationId".to_string(),
                self.organization_id.clone()
            ),
            ("tracker.accountId".to_string(), self.account_id.to_string())
        ])
    }

    pub fn log_attributes(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "tracker.organizationId".to_string(),
                self.organization_id.clone()
            ),
            ("tracker.accountId".to_string(), self.account_id.to_string())
        ])
    }
}

/// Builder for `TrackerConfig`, mostly used to point the tracker at mock servers.
#[derive(Default)]
pub struct TrackerConfigBuilder {
    organization_id: Option<String>,
    account_id: Option<i64>,
    api_key: Option<String>,
    license_key: Option<String>,
    graphql_endpoint: Option<String>,
    metric_endpoint: Option<String>,
    log_endpoint: Option<String>
}

impl TrackerConfigBuilder {
    #[must_use]
    pub fn organization_id(mut self, id: impl Into<String>) -> Self {
        self.organization_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn account_id(mut self, id: i64) -> Self {
        self.account_id = Some(id);
        self
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn license_key(mut self, key: impl Into<String>) -> Self {
        self.license_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn graphql_endpoint(mut self, url: impl Into<String>) -> Self {
        self.graphql_endpoint = Some(url.into());
        self
    }

    #[must_use]
    pub fn metric_endpoint(mut self, url: impl Into<String>) -> Self {
        self.metric_endpoint = Some(url.into());
        self
    }

    #[must_use]
    pub fn log_endpoint(mut self, url: impl Into<String>) -> Self {
        self.log_endpoint = Some(url.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the organization ID or the account ID is missing.
    pub fn build(self) -> TrackerResult<TrackerConfig> {
        let organization_id = self
            .organization_id
            .ok_or_else(|| TrackerError::ConfigError("organization_id is required".to_string()))?;
        let account_id = self
            .account_id
            .ok_or_else(|| TrackerError::ConfigError("account_id is required".to_string()))?;

        Ok(TrackerConfig {
            organization_id,
            account_id,
            api_key: self.api_key.unwrap_or_default(),
            license_key: self.license_key.unwrap_or_default(),
            graphql_endpoint: self
                .graphql_endpoint
                .unwrap_or_else(default_graphql_endpoint),
            metric_endpoint: self.metric_endpoint.unwrap_or_else(default_metric_endpoint),
            log_endpoint: self.log_endpoint.unwrap_or_else(default_log_endpoint)
        })
    }
}
