//! Authentication domain users.
//!
//! Users are enumerated in two nested levels. The domain level pages through
//! every authentication domain of the organization; then, domain by domain
//! in discovery order, the user level pages through the users of that domain
//! with its own cursor. Each level runs until the remote API stops returning
//! a `nextCursor`.

use crate::config::TrackerConfig;
use crate::cursor::{Page, TraversalState};
use crate::error::{TrackerError, TrackerResult};
use crate::graphql::{GraphQlRequest, QueryExecutor, create_nerdgraph_client, fetch};
use crate::records::{DomainId, FlatRecord, User, flatten, null_as_default};
use crate::runner::UnitReport;
use crate::telemetry::{MetricEmitter, MetricRecord, create_metric_forwarder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const DOMAINS_OPERATION: &str = "authenticationDomains";
pub const USERS_OPERATION: &str = "authenticationDomainUsers";

fn domains_request(cursor: &str) -> GraphQlRequest {
    let query = format!(
        r#"{{
  actor {{
    organization {{
      userManagement {{
        authenticationDomains(cursor: {cursor}) {{
          nextCursor
          authenticationDomains {{
            id
            name
          }}
        }}
      }}
    }}
  }}
}}"#
    );

    GraphQlRequest::new(DOMAINS_OPERATION, query).with_variable("cursorDomain", cursor)
}

fn users_request(domain_id: &str, cursor: &str) -> GraphQlRequest {
    let query = format!(
        r#"{{
  actor {{
    organization {{
      userManagement {{
        authenticationDomains(id: ["{domain_id}"]) {{
          authenticationDomains {{
            id
            users(cursor: {cursor}) {{
              nextCursor
              users {{
                id
                name
                email
                timeZone
                emailVerificationState
                lastActive
                type {{
                  id
                }}
              }}
            }}
          }}
        }}
      }}
    }}
  }}
}}"#
    );

    GraphQlRequest::new(USERS_OPERATION, query)
        .with_variable("authDomainId", domain_id)
        .with_variable("cursorUser", cursor)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserManagementData {
    #[serde(deserialize_with = "null_as_default")]
    actor: Actor
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Actor {
    #[serde(deserialize_with = "null_as_default")]
    organization: Organization
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Organization {
    #[serde(deserialize_with = "null_as_default")]
    user_management: UserManagement
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserManagement {
    #[serde(deserialize_with = "null_as_default")]
    authentication_domains: AuthDomainPage
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AuthDomainPage {
    next_cursor: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    authentication_domains: Vec<AuthDomain>
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthDomain {
    #[serde(deserialize_with = "null_as_default")]
    id: String,
    #[serde(deserialize_with = "null_as_default")]
    name: String,
    #[serde(deserialize_with = "null_as_default")]
    users: UserPage
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UserPage {
    next_cursor: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    users: Vec<User>
}

impl UserManagementData {
    fn into_domain_page(self) -> AuthDomainPage {
        self.actor.organization.user_management.authentication_domains
    }
}

pub struct UsersTracker {
    executor: Arc<dyn QueryExecutor>,
    emitter: Arc<dyn MetricEmitter>
}

impl UsersTracker {
    pub fn new(executor: Arc<dyn QueryExecutor>, emitter: Arc<dyn MetricEmitter>) -> Self {
        Self { executor, emitter }
    }

    pub fn from_config(config: &TrackerConfig) -> TrackerResult<Self> {
        Ok(Self::new(
            create_nerdgraph_client(&config.graphql_endpoint, &config.api_key)?,
            create_metric_forwarder(
                &config.metric_endpoint,
                &config.license_key,
                config.users_attributes()
            )?
        ))
    }

    /// Pages through every authentication domain, returning IDs in discovery order.
    pub async fn enumerate_domains(&self) -> TrackerResult<Vec<DomainId>> {
        let mut state: TraversalState<DomainId> = TraversalState::start();

        while !state.is_exhausted() {
            let request = domains_request(&state.encoded_cursor());
            let data: UserManagementData = fetch(self.executor.as_ref(), &request).await?;
            let page = data.into_domain_page();

            metrics::counter!("tracker_pages_fetched_total", "level" => "domain").increment(1);
            debug!(
                page = state.pages() + 1,
                domains = page.authentication_domains.len(),
                has_next = page.next_cursor.is_some(),
                "Fetched authentication domain page"
            );

            let ids: Vec<DomainId> = page
                .authentication_domains
                .into_iter()
                .map(|domain| {
                    debug!(
                        domain_id = %domain.id,
                        domain_name = %domain.name,
                        "Discovered authentication domain"
                    );
                    domain.id
                })
                .collect();
            state = state.advance(Page::new(ids, page.next_cursor));
        }

        Ok(state.into_items())
    }

    /// Pages through the users of each domain in the given order.
    ///
    /// The first failure aborts the whole enumeration; records of domains
    /// already walked are dropped. A user page that does not echo the
    /// requested domain counts as a failure.
    pub async fn enumerate_users(&self, domain_ids: &[DomainId]) -> TrackerResult<Vec<FlatRecord>> {
        let mut records = Vec::new();

        for domain_id in domain_ids {
            let domain_records = self.enumerate_domain_users(domain_id).await?;
            debug!(domain_id = %domain_id, users = domain_records.len(), "Enumerated domain users");
            records.extend(domain_records);
        }

        Ok(records)
    }

    async fn enumerate_domain_users(&self, domain_id: &str) -> TrackerResult<Vec<FlatRecord>> {
        let mut state: TraversalState<FlatRecord> = TraversalState::start();

        while !state.is_exhausted() {
            let request = users_request(domain_id, &state.encoded_cursor());
            let data: UserManagementData = fetch(self.executor.as_ref(), &request).await?;

            metrics::counter!("tracker_pages_fetched_total", "level" => "user").increment(1);

            let Some(domain) = data
                .into_domain_page()
                .authentication_domains
                .into_iter()
                .find(|d| d.id == domain_id)
            else {
                warn!(
                    domain_id = %domain_id,
                    page = state.pages() + 1,
                    "Authentication domain missing from user page"
                );
                return Err(TrackerError::MissingDomain(domain_id.to_string()));
            };

            let page = Page::new(
                domain
                    .users
                    .users
                    .into_iter()
                    .map(|user| flatten(user, domain_id))
                    .collect(),
                domain.users.next_cursor
            );

            debug!(
                domain_id = %domain_id,
                page = state.pages() + 1,
                users = page.items.len(),
                has_next = page.next_cursor.is_some(),
                "Fetched user page"
            );
            state = state.advance(page);
        }

        Ok(state.into_items())
    }

    /// Walks both levels and returns every user of the organization.
    pub async fn fetch_users(&self) -> TrackerResult<Vec<FlatRecord>> {
        let domain_ids = self.enumerate_domains().await?;
        info!(count = domain_ids.len(), "Fetched authentication domains");

        let records = self.enumerate_users(&domain_ids).await?;
        info!(count = records.len(), "Fetched authentication domain users");

        Ok(records)
    }

    /// Fetches all users and forwards them as one metric batch.
    pub async fn run(&self) -> TrackerResult<UnitReport> {
        let mut report = UnitReport::new("users");

        let records = self.fetch_users().await.inspect_err(|e| {
            error!(error = %e, "Fetching users failed");
        })?;
        report.records_fetched = records.len();

        let metrics: Vec<MetricRecord> = records.iter().map(FlatRecord::to_metric).collect();
        let result = self.emitter.emit(&metrics).await;
        report.record_emit(result, metrics.len());

        report.complete();
        info!(
            records_fetched = report.records_fetched,
            metrics_emitted = report.metrics_emitted,
            "Users unit completed"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphql::InMemoryExecutor;
    use crate::telemetry::InMemoryEmitter;
    use serde_json::{Value, json};

    fn domain_page(ids: &[&str], next: Option<&str>) -> Value {
        let domains: Vec<Value> = ids
            .iter()
            .map(|id| json!({ "id": id, "name": format!("{id} name") }))
            .collect();
        json!({
            "data": { "actor": { "organization": { "userManagement": {
                "authenticationDomains": { "nextCursor": next, "authenticationDomains": domains }
            } } } }
        })
    }

    fn user_page(domain_id: &str, user_ids: &[&str], next: Option<&str>) -> Value {
        let users: Vec<Value> = user_ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "name": format!("{id} name"),
                    "email": format!("{id}@example.com"),
                    "timeZone": "Etc/UTC",
                    "emailVerificationState": "VERIFIED",
                    "lastActive": "2024-05-01T10:00:00Z",
                    "type": { "id": "1" }
                })
            })
            .collect();
        json!({
            "data": { "actor": { "organization": { "userManagement": {
                "authenticationDomains": {
                    "nextCursor": null,
                    "authenticationDomains": [
                        { "id": domain_id, "users": { "nextCursor": next, "users": users } }
                    ]
                }
            } } } }
        })
    }

    fn tracker(executor: Arc<InMemoryExecutor>, emitter: Arc<InMemoryEmitter>) -> UsersTracker {
        UsersTracker::new(executor, emitter)
    }

    /// dom1 and dom2, each with two pages of one user.
    fn two_domain_executor() -> Arc<InMemoryExecutor> {
        Arc::new(InMemoryExecutor::new(|request| {
            let page = match request.operation {
                DOMAINS_OPERATION => match request.variable("cursorDomain") {
                    Some("null") => domain_page(&["dom1"], Some("d2")),
                    Some("\"d2\"") => domain_page(&["dom2"], None),
                    other => panic!("unexpected domain cursor {other:?}")
                },
                USERS_OPERATION => {
                    let domain = request.variable("authDomainId").unwrap_or_default();
                    let first = format!("{domain}user1");
                    let second = format!("{domain}user2");
                    match request.variable("cursorUser") {
                        Some("null") => user_page(domain, &[first.as_str()], Some("u2")),
                        Some("\"u2\"") => user_page(domain, &[second.as_str()], None),
                        other => panic!("unexpected user cursor {other:?}")
                    }
                }
                other => panic!("unexpected operation {other}")
            };
            Ok(page)
        }))
    }

    #[tokio::test]
    async fn test_enumerate_domains_concatenates_pages() {
        let executor = Arc::new(InMemoryExecutor::new(|request| {
            Ok(match request.variable("cursorDomain") {
                Some("null") => domain_page(&["a", "b"], Some("c1")),
                Some("\"c1\"") => domain_page(&[], Some("c2")),
                Some("\"c2\"") => domain_page(&["c"], None),
                other => panic!("unexpected cursor {other:?}")
            })
        }));
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        let ids = tracker.enumerate_domains().await.unwrap();

        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(executor.call_count(), 3);
        let cursors: Vec<String> = executor
            .requests()
            .iter()
            .map(|r| r.variable("cursorDomain").unwrap_or_default().to_string())
            .collect();
        assert_eq!(cursors, vec!["null", "\"c1\"", "\"c2\""]);
    }

    #[tokio::test]
    async fn test_single_page_makes_one_call() {
        let executor = Arc::new(InMemoryExecutor::new(|_| Ok(domain_page(&["only"], None))));
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        assert_eq!(tracker.enumerate_domains().await.unwrap(), vec!["only"]);
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_enumerate_domains_fails_fast() {
        let executor = Arc::new(InMemoryExecutor::failing());
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        let result = tracker.enumerate_domains().await;

        assert!(result.is_err());
        assert_eq!(executor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_enumerate_users_orders_by_domain_then_page() {
        let executor = two_domain_executor();
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        let domain_ids = tracker.enumerate_domains().await.unwrap();
        let records = tracker.enumerate_users(&domain_ids).await.unwrap();

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["dom1user1", "dom1user2", "dom2user1", "dom2user2"]);
        let owners: Vec<&str> = records.iter().map(|r| r.auth_domain_id.as_str()).collect();
        assert_eq!(owners, vec!["dom1", "dom1", "dom2", "dom2"]);
        // 2 domain pages + 2 user pages per domain
        assert_eq!(executor.call_count(), 6);
    }

    #[tokio::test]
    async fn test_user_cursor_resets_per_domain() {
        let executor = two_domain_executor();
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        tracker
            .enumerate_users(&["dom1".to_string(), "dom2".to_string()])
            .await
            .unwrap();

        let calls: Vec<(String, String)> = executor
            .requests()
            .iter()
            .map(|r| {
                (
                    r.variable("authDomainId").unwrap_or_default().to_string(),
                    r.variable("cursorUser").unwrap_or_default().to_string()
                )
            })
            .collect();
        assert_eq!(
            calls,
            vec![
                ("dom1".to_string(), "null".to_string()),
                ("dom1".to_string(), "\"u2\"".to_string()),
                ("dom2".to_string(), "null".to_string()),
                ("dom2".to_string(), "\"u2\"".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_enumerate_users_fails_on_second_domain_second_page() {
        let executor = Arc::new(InMemoryExecutor::new(|request| {
            let domain = request.variable("authDomainId").unwrap_or_default();
            match (domain, request.variable("cursorUser")) {
                ("dom2", Some("\"u2\"")) => Err(TrackerError::ApiError {
                    status: 502,
                    message: "bad gateway".to_string()
                }),
                (_, Some("null")) => Ok(user_page(domain, &["first"], Some("u2"))),
                _ => Ok(user_page(domain, &["second"], None))
            }
        }));
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        let result = tracker
            .enumerate_users(&["dom1".to_string(), "dom2".to_string()])
            .await;

        assert!(matches!(result, Err(TrackerError::ApiError { status: 502, .. })));
        assert_eq!(executor.call_count(), 4);
    }

    #[tokio::test]
    async fn test_graphql_errors_abort_enumeration() {
        let executor = Arc::new(InMemoryExecutor::new(|_| {
            Ok(json!({ "data": null, "errors": [{ "message": "Unauthorized" }] }))
        }));
        let tracker = tracker(executor, Arc::new(InMemoryEmitter::new()));

        let result = tracker.enumerate_domains().await;
        assert!(matches!(result, Err(TrackerError::GraphQlErrors)));
    }

    #[tokio::test]
    async fn test_missing_domain_in_user_page_fails() {
        let executor = Arc::new(InMemoryExecutor::new(|request| {
            match request.variable("authDomainId") {
                Some("dom1") => Ok(user_page("dom1", &["kept"], None)),
                _ => Ok(user_page("other", &["x"], Some("u2")))
            }
        }));
        let tracker = tracker(executor.clone(), Arc::new(InMemoryEmitter::new()));

        let result = tracker
            .enumerate_users(&["dom1".to_string(), "dom2".to_string(), "dom3".to_string()])
            .await;

        assert!(matches!(result, Err(TrackerError::MissingDomain(ref id)) if id == "dom2"));
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_run_emits_one_batch() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let tracker = tracker(two_domain_executor(), emitter.clone());

        let report = tracker.run().await.unwrap();

        assert_eq!(report.records_fetched, 4);
        assert_eq!(report.metrics_emitted, 4);
        assert!(report.flush_error.is_none());
        assert!(report.completed_at.is_some());

        let batches = emitter.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].iter().all(|m| m.name == "tracker.users.type" && m.value == 1.0));
        assert_eq!(batches[0][2].attributes["tracker.users.id"], "dom2user1");
    }

    #[tokio::test]
    async fn test_run_without_data_emits_nothing() {
        let emitter = Arc::new(InMemoryEmitter::new());
        let tracker = tracker(Arc::new(InMemoryExecutor::failing()), emitter.clone());

        assert!(tracker.run().await.is_err());
        assert!(emitter.batches().is_empty());
    }

    #[tokio::test]
    async fn test_run_tolerates_emitter_failure() {
        let tracker = tracker(two_domain_executor(), Arc::new(InMemoryEmitter::failing()));

        let report = tracker.run().await.unwrap();

        assert_eq!(report.records_fetched, 4);
        assert_eq!(report.metrics_emitted, 0);
        assert!(report.flush_error.is_some());
    }

    #[test]
    fn test_requests_bind_cursor_literals() {
        let first = domains_request("null");
        assert!(first.query.contains("authenticationDomains(cursor: null)"));

        let next = users_request("dom-1", "\"abc\"");
        assert!(next.query.contains(r#"authenticationDomains(id: ["dom-1"])"#));
        assert!(next.query.contains(r#"users(cursor: "abc")"#));
        assert_eq!(next.variable("authDomainId"), Some("dom-1"));
    }
}
