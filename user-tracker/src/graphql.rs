use crate::error::{GRAPHQL_HAS_RETURNED_ERRORS, TrackerError, TrackerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A rendered query plus the variables that were bound into it.
///
/// Only `query` goes over the wire; the rest is kept for logging and for
/// test doubles that answer based on the bound values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphQlRequest {
    #[serde(skip)]
    pub operation: &'static str,
    #[serde(skip)]
    pub variables: BTreeMap<&'static str, String>,
    pub query: String
}

impl GraphQlRequest {
    pub fn new(operation: &'static str, query: impl Into<String>) -> Self {
        Self {
            operation,
            variables: BTreeMap::new(),
            query: query.into()
        }
    }

    #[must_use]
    pub fn with_variable(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.variables.insert(name, value.into());
        self
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }
}

/// Performs one GraphQL call and returns the undecoded response body.
///
/// Implementations fail on transport errors and non-2xx statuses. A body
/// with a populated `errors` field is a successful call at this level.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, request: &GraphQlRequest) -> TrackerResult<Value>;
}

/// Standard GraphQL response envelope.
#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    pub errors: Option<Value>
}

impl<T> GraphQlResponse<T> {
    pub fn has_errors(&self) -> bool {
        match &self.errors {
            None | Some(Value::Null) => false,
            Some(Value::Array(errors)) => !errors.is_empty(),
            Some(_) => true
        }
    }
}

/// Executes `request` and decodes the `data` member into `T`.
///
/// Missing `data` decodes as `T::default()`, so absent lists read as empty
/// and absent cursors end pagination.
pub async fn fetch<T>(executor: &dyn QueryExecutor, request: &GraphQlRequest) -> TrackerResult<T>
where
    T: DeserializeOwned + Default
{
    metrics::counter!("tracker_graphql_requests_total", "operation" => request.operation)
        .increment(1);

    let body = executor.execute(request).await?;
    let response: GraphQlResponse<T> = serde_json::from_value(body)?;

    if response.has_errors() {
        metrics::counter!("tracker_graphql_errors_total", "operation" => request.operation)
            .increment(1);
        warn!(
            operation = request.operation,
            error = %response.errors.unwrap_or_default(),
            "{}",
            GRAPHQL_HAS_RETURNED_ERRORS
        );
        return Err(TrackerError::GraphQlErrors);
    }

    Ok(response.data.unwrap_or_default())
}

/// NerdGraph client authenticated with a user API key.
pub struct NerdGraphClient {
    client: Client,
    endpoint: String,
    api_key: String
}

impl NerdGraphClient {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> TrackerResult<Self> {
        // TODO: give each call a deadline once the run's join point can cancel units.
        let client = Client::builder().build().map_err(TrackerError::HttpError)?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into()
        })
    }
}

#[async_trait]
impl QueryExecutor for NerdGraphClient {
    async fn execute(&self, request: &GraphQlRequest) -> TrackerResult<Value> {
        debug!(
            endpoint = %self.endpoint,
            operation = request.operation,
            variables = ?request.variables,
            "Executing GraphQL query"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header("API-Key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrackerError::ApiError {
                status: status.as_u16(),
                message: body
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

pub fn create_nerdgraph_client(
    endpoint: &str,
    api_key: &str
) -> TrackerResult<Arc<dyn QueryExecutor>> {
    Ok(Arc::new(NerdGraphClient::new(endpoint, api_key)?))
}

type Responder = dyn Fn(&GraphQlRequest) -> TrackerResult<Value> + Send + Sync;

/// Deterministic executor answering from a closure and recording every request.
pub struct InMemoryExecutor {
    responder: Box<Responder>,
    requests: Mutex<Vec<GraphQlRequest>>
}

impl InMemoryExecutor {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GraphQlRequest) -> TrackerResult<Value> + Send + Sync + 'static
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new())
        }
    }

    /// Executor whose every call fails with a 500.
    pub fn failing() -> Self {
        Self::new(|_| {
            Err(TrackerError::ApiError {
                status: 500,
                message: "in-memory failure".to_string()
            })
        })
    }

    pub fn requests(&self) -> Vec<GraphQlRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl QueryExecutor for InMemoryExecutor {
    async fn execute(&self, request: &GraphQlRequest) -> TrackerResult<Value> {
        self.requests.lock().push(request.clone());
        (self.responder)(request)
    }
}
