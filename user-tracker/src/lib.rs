//! # User Tracker
//!
//! Republishes New Relic organization data as metrics. Two independent units
//! run per invocation:
//!
//! - `users`: walks every authentication domain and every user in it through
//!   NerdGraph's cursor pagination and emits one `tracker.users.type` gauge
//!   per user.
//! - `auditEvent`: runs a single NRQL query over the last day of
//!   `NrAuditEvent` rows and emits one `tracker.users.audit.value` gauge per
//!   event.
//!
//! Captured logs are forwarded to the log API once both units have finished.

pub mod audit;
pub mod config;
pub mod cursor;
pub mod error;
pub mod graphql;
pub mod logs;
pub mod records;
pub mod runner;
pub mod telemetry;
pub mod users;

pub use audit::{AuditEvent, AuditTracker};
pub use config::TrackerConfig;
pub use cursor::{Page, TraversalState, encode_cursor};
pub use error::{TrackerError, TrackerResult};
pub use graphql::{GraphQlRequest, InMemoryExecutor, NerdGraphClient, QueryExecutor};
pub use records::{DomainId, FlatRecord, User, flatten, regroup};
pub use runner::{RunReport, UnitReport, run, run_from_env};
pub use telemetry::{InMemoryEmitter, MetricEmitter, MetricRecord, NewRelicMetricForwarder};
pub use users::UsersTracker;
