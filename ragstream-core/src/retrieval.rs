//! Client for the external retrieval backend.
//!
//! The backend exposes two operations over HTTP:
//! - `POST /query` with `{"query": ..., "k": ...}` -> `{"results": [...]}`
//! - `POST /insert` with `{"text": ...}` -> opaque success
//!
//! Calls are made once with no retry. A backend that cannot be reached is
//! reported as [`RetrievalError::Unavailable`], which is distinct from a
//! successful query returning zero results.

use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// The retrieval operations the pipeline and ingester depend on.
#[async_trait]
pub trait RetrievalBackend: Send + Sync {
    /// Return up to `k` chunks similar to `text`, in backend order.
    async fn query(&self, text: &str, k: usize) -> Result<Vec<String>, RetrievalError>;

    /// Index one chunk of text.
    async fn insert(&self, text: &str) -> Result<(), RetrievalError>;
}

/// Remove repeated chunks, keeping the first occurrence of each.
pub fn dedup_preserving_order(chunks: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(chunks.len());
    chunks
        .into_iter()
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct InsertRequest<'a> {
    text: &'a str,
}

/// HTTP implementation of [`RetrievalBackend`].
#[derive(Debug, Clone)]
pub struct HttpRetrievalClient {
    client: Client,
    base_url: String,
}

impl HttpRetrievalClient {
    /// Create a client from configuration.
    pub fn new(config: &RetrievalConfig) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL the client talks to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, RetrievalError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("{}: {}", url, e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RetrievalError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RetrievalBackend for HttpRetrievalClient {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<String>, RetrievalError> {
        let response = self.post("/query", &QueryRequest { query: text, k }).await?;
        let parsed: QueryResponse =
            response
                .json()
                .await
                .map_err(|e| RetrievalError::Decode {
                    message: e.to_string(),
                })?;
        let results = parsed.results.unwrap_or_default();
        debug!(k, returned = results.len(), "Retrieval query complete");
        Ok(results)
    }

    async fn insert(&self, text: &str) -> Result<(), RetrievalError> {
        self.post("/insert", &InsertRequest { text }).await?;
        Ok(())
    }
}

/// In-memory [`RetrievalBackend`] for tests and offline runs.
///
/// Returns a fixed result list for every query (truncated to `k`) and records
/// inserted text. In unavailable mode every call fails like an unreachable
/// backend.
#[derive(Debug, Default)]
pub struct MockRetrieval {
    results: Vec<String>,
    unavailable: bool,
    inserted: Mutex<Vec<String>>,
    queries: Mutex<Vec<(String, usize)>>,
}

impl MockRetrieval {
    /// A backend that knows nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A backend that answers every query with `results`.
    pub fn with_results<I, S>(results: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            results: results.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A backend that behaves as if the connection were refused.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Texts passed to `insert`, in call order.
    pub fn inserted(&self) -> Vec<String> {
        self.inserted
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// `(text, k)` pairs passed to `query`, in call order.
    pub fn queries(&self) -> Vec<(String, usize)> {
        self.queries
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    fn refused() -> RetrievalError {
        RetrievalError::Unavailable {
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl RetrievalBackend for MockRetrieval {
    async fn query(&self, text: &str, k: usize) -> Result<Vec<String>, RetrievalError> {
        if let Ok(mut q) = self.queries.lock() {
            q.push((text.to_string(), k));
        }
        if self.unavailable {
            return Err(Self::refused());
        }
        Ok(self.results.iter().take(k).cloned().collect())
    }

    async fn insert(&self, text: &str) -> Result<(), RetrievalError> {
        if self.unavailable {
            return Err(Self::refused());
        }
        if let Ok(mut inserted) = self.inserted.lock() {
            inserted.push(text.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{Value, json};
    use std::sync::Arc;

    async fn spawn_backend(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(base_url: String) -> HttpRetrievalClient {
        HttpRetrievalClient::new(&RetrievalConfig {
            base_url,
            ..RetrievalConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_dedup_preserves_first_occurrence() {
        let chunks = vec!["b", "a", "b", "c", "a"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(dedup_preserving_order(chunks), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_dedup_empty() {
        assert!(dedup_preserving_order(Vec::new()).is_empty());
    }

    proptest! {
        #[test]
        fn dedup_has_no_repeats_and_keeps_order(items in prop::collection::vec("[a-c]{1,2}", 0..30)) {
            let deduped = dedup_preserving_order(items.clone());
            let unique: HashSet<&String> = deduped.iter().collect();
            prop_assert_eq!(unique.len(), deduped.len());

            let mut expected: Vec<String> = Vec::new();
            for item in items {
                if !expected.contains(&item) {
                    expected.push(item);
                }
            }
            prop_assert_eq!(deduped, expected);
        }
    }

    #[tokio::test]
    async fn test_http_query_sends_query_and_k() {
        let seen: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let app = Router::new().route(
            "/query",
            post(move |Json(body): Json<Value>| {
                let seen = seen_clone.clone();
                async move {
                    *seen.lock().unwrap() = Some(body);
                    Json(json!({"results": ["one", "two"]}))
                }
            }),
        );
        let client = client_for(spawn_backend(app).await);

        let results = client.query("cheap SUVs", 6).await.unwrap();
        assert_eq!(results, vec!["one", "two"]);
        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body, json!({"query": "cheap SUVs", "k": 6}));
    }

    #[tokio::test]
    async fn test_http_query_missing_results_is_empty() {
        let app = Router::new().route("/query", post(|| async { Json(json!({})) }));
        let client = client_for(spawn_backend(app).await);
        assert!(client.query("x", 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_http_query_status_error() {
        let app = Router::new().route(
            "/query",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "index exploded") }),
        );
        let client = client_for(spawn_backend(app).await);
        match client.query("x", 3).await {
            Err(RetrievalError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "index exploded");
            }
            other => panic!("Expected Status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_query_decode_error() {
        let app = Router::new().route("/query", post(|| async { "not json" }));
        let client = client_for(spawn_backend(app).await);
        assert!(matches!(
            client.query("x", 3).await,
            Err(RetrievalError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_connection_refused_is_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("http://{}", addr));
        assert!(matches!(
            client.query("x", 3).await,
            Err(RetrievalError::Unavailable { .. })
        ));
        assert!(matches!(
            client.insert("x").await,
            Err(RetrievalError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_insert_posts_text() {
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let app = Router::new().route(
            "/insert",
            post(move |Json(body): Json<Value>| {
                let seen = seen_clone.clone();
                async move {
                    seen.lock().unwrap().push(body);
                    Json(json!({"status": "ok"}))
                }
            }),
        );
        let client = client_for(spawn_backend(app).await);
        client.insert("Compact cars cost $40/day.").await.unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[json!({"text": "Compact cars cost $40/day."})]
        );
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = client_for("http://localhost:8000/".into());
        assert_eq!(client.base_url(), "http://localhost:8000");
    }

    #[tokio::test]
    async fn test_mock_retrieval() {
        let mock = MockRetrieval::with_results(["a", "b", "c"]);
        assert_eq!(mock.query("q", 2).await.unwrap(), vec!["a", "b"]);
        mock.insert("doc").await.unwrap();
        assert_eq!(mock.inserted(), vec!["doc"]);
        assert_eq!(mock.queries(), vec![("q".to_string(), 2)]);

        let down = MockRetrieval::unavailable();
        assert!(down.query("q", 2).await.is_err());
        assert!(down.insert("doc").await.is_err());
    }
}
