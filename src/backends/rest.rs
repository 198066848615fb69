//! Remote-service storage backend.
//!
//! Talks JSON over HTTP to a memory service:
//!
//! - `GET /health` answers 200 when the service is up
//! - `POST /memories` stores `{content, space_name, metadata}` and returns `{id}`
//! - `GET /memories/search` returns `{memories: [...]}`
//! - `GET|PUT|DELETE /memories/{id}` fetch, patch and remove single records
//!
//! Record fields beyond content ride in the metadata object (`category`,
//! `tags`, `project`, `created_at`, `updated_at`) and are folded back out
//! when responses are converted to records. Transport failures are retried
//! with linear backoff; HTTP error statuses are not.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::backends::MemoryStore;
use crate::core::{
    normalize_tags, BackendFeatures, MemoryCategory, MemoryDraft, MemoryItem, MemoryPatch,
    MemoryQuery, MemoryStats,
};
use crate::error::{Result, StratumError};

/// Metadata keys the backend manages itself. They are stripped from the
/// user-visible metadata map when records come back.
const RESERVED_KEYS: [&str; 5] = ["category", "tags", "project", "created_at", "updated_at"];

/// Remote-service backend configuration.
#[derive(Debug, Clone)]
pub struct RestOptions {
    /// Service host.
    pub host: String,
    /// Service port.
    pub port: u16,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Connection pool size per host.
    pub pool_size: usize,
    /// Transport-error retries per request.
    pub max_retries: u32,
    /// Base delay between retries, scaled linearly per attempt.
    pub retry_delay: Duration,
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8002,
            timeout: Duration::from_secs(30),
            api_key: None,
            pool_size: 10,
            max_retries: 3,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Remote-service backend.
pub struct RestBackend {
    options: RestOptions,
    base_url: String,
    client: Mutex<Option<Client>>,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MemoriesResponse {
    #[serde(default)]
    memories: Vec<RemoteMemory>,
}

#[derive(Debug, Deserialize)]
struct RemoteMemory {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl RestBackend {
    /// Create a backend for the configured service. No connection is made
    /// until `initialize`.
    pub fn new(options: RestOptions) -> Self {
        let base_url = format!("http://{}:{}", options.host, options.port);
        Self {
            options,
            base_url,
            client: Mutex::new(None),
        }
    }

    /// Create a backend pointed at an explicit base URL, mainly for tests.
    pub fn with_base_url(options: RestOptions, base_url: impl Into<String>) -> Self {
        Self {
            options,
            base_url: base_url.into(),
            client: Mutex::new(None),
        }
    }

    /// The service base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn client(&self) -> Result<Client> {
        self.client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| {
                StratumError::read("rest", "client not initialized, call initialize() first")
            })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let client = self.client()?;
        let mut builder = client.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.options.api_key {
            builder = builder.bearer_auth(key);
        }
        Ok(builder)
    }

    /// Send a request, retrying transport errors with linear backoff.
    /// HTTP error statuses are returned to the caller untouched; the
    /// error message here covers transport failures only, so each call
    /// site can wrap it as a read or write error.
    async fn send(
        &self,
        build: impl Fn() -> Result<RequestBuilder>,
    ) -> std::result::Result<reqwest::Response, String> {
        let attempts = self.options.max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let builder = build().map_err(|e| e.to_string())?;
            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("rest request attempt {attempt} failed: {e}");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.options.retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(format!(
            "request failed after {attempts} attempts: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    fn to_item(&self, remote: RemoteMemory, include_metadata: bool) -> MemoryItem {
        let meta = &remote.metadata;
        let category = meta
            .get("category")
            .and_then(Value::as_str)
            .map(MemoryCategory::parse)
            .unwrap_or(MemoryCategory::Project);
        let tags = meta
            .get("tags")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .map(normalize_tags)
            .unwrap_or_default();
        let project_name = meta
            .get("project")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let created_at = parse_meta_timestamp(meta, "created_at");
        let updated_at = meta
            .get("updated_at")
            .is_some()
            .then(|| parse_meta_timestamp(meta, "updated_at"))
            .unwrap_or(created_at);

        let metadata = if include_metadata {
            remote
                .metadata
                .into_iter()
                .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
                .collect()
        } else {
            Map::new()
        };

        MemoryItem {
            id: remote.id,
            project_name,
            content: remote.content,
            category,
            tags,
            metadata,
            created_at,
            updated_at,
        }
    }
}

fn parse_meta_timestamp(meta: &Map<String, Value>, key: &str) -> DateTime<Utc> {
    meta.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl MemoryStore for RestBackend {
    async fn initialize(&self) -> Result<()> {
        {
            let guard = self.client.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Ok(());
            }
        }

        let client = Client::builder()
            .timeout(self.options.timeout)
            .pool_max_idle_per_host(self.options.pool_size)
            .build()
            .map_err(|e| StratumError::initialization("rest", e.to_string()))?;

        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);

        // The service must answer the health endpoint before the backend
        // counts as initialized.
        match self.health_check().await {
            Ok(true) => {
                debug!("rest backend initialized at {}", self.base_url);
                Ok(())
            }
            Ok(false) | Err(_) => {
                *self.client.lock().unwrap_or_else(|e| e.into_inner()) = None;
                Err(StratumError::initialization(
                    "rest",
                    format!("service at {} is unreachable", self.base_url),
                ))
            }
        }
    }

    async fn health_check(&self) -> Result<bool> {
        let Ok(client) = self.client() else {
            return Ok(false);
        };
        let mut builder = client.get(format!("{}/health", self.base_url));
        if let Some(key) = &self.options.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) => Ok(response.status() == StatusCode::OK),
            Err(e) => {
                debug!("rest health check failed: {e}");
                Ok(false)
            }
        }
    }

    async fn add(&self, project_name: &str, draft: MemoryDraft) -> Result<String> {
        let mut metadata = draft.metadata.clone();
        metadata.insert("category".to_string(), json!(draft.category.as_str()));
        metadata.insert("tags".to_string(), json!(draft.tags));
        metadata.insert("project".to_string(), json!(project_name));
        metadata.insert("created_at".to_string(), json!(Utc::now().to_rfc3339()));

        let body = json!({
            "content": draft.content,
            "space_name": project_name,
            "metadata": metadata,
        });

        let response = self
            .send(|| Ok(self.request(Method::POST, "/memories")?.json(&body)))
            .await
            .map_err(|e| StratumError::write("rest", e))?;

        if !response.status().is_success() {
            return Err(StratumError::write(
                "rest",
                format!("service answered {}", response.status()),
            ));
        }

        let parsed: AddResponse = response
            .json()
            .await
            .map_err(|e| StratumError::write("rest", format!("bad add response: {e}")))?;
        Ok(parsed.id)
    }

    async fn search(&self, project_name: &str, query: &MemoryQuery) -> Result<Vec<MemoryItem>> {
        let query = query.normalized();

        let mut params: Vec<(String, String)> = vec![
            ("query".to_string(), query.query.clone()),
            ("space_name".to_string(), project_name.to_string()),
            ("limit".to_string(), query.limit.to_string()),
            ("offset".to_string(), query.offset.to_string()),
            (
                "include_metadata".to_string(),
                query.include_metadata.to_string(),
            ),
        ];
        if let Some(category) = query.category {
            params.push(("category".to_string(), category.as_str().to_string()));
        }
        if let Some(tags) = &query.tags {
            params.push(("tags".to_string(), tags.join(",")));
        }
        params.push((
            "similarity_threshold".to_string(),
            query.similarity_threshold.to_string(),
        ));

        let response = self
            .send(|| Ok(self.request(Method::GET, "/memories/search")?.query(&params)))
            .await
            .map_err(|e| StratumError::read("rest", e))?;

        if !response.status().is_success() {
            return Err(StratumError::read(
                "rest",
                format!("search answered {}", response.status()),
            ));
        }

        let parsed: MemoriesResponse = response
            .json()
            .await
            .map_err(|e| StratumError::read("rest", format!("bad search response: {e}")))?;

        let items = parsed
            .memories
            .into_iter()
            .map(|remote| self.to_item(remote, query.include_metadata))
            .take(query.limit)
            .collect();
        Ok(items)
    }

    async fn get(&self, project_name: &str, memory_id: &str) -> Result<Option<MemoryItem>> {
        let path = format!("/memories/{memory_id}");
        let params = [("space_name", project_name)];
        let response = self
            .send(|| Ok(self.request(Method::GET, &path)?.query(&params)))
            .await
            .map_err(|e| StratumError::read("rest", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let remote: RemoteMemory = response
                    .json()
                    .await
                    .map_err(|e| StratumError::read("rest", format!("bad get response: {e}")))?;
                Ok(Some(self.to_item(remote, true)))
            }
            status => Err(StratumError::read(
                "rest",
                format!("get answered {status}"),
            )),
        }
    }

    async fn update(
        &self,
        project_name: &str,
        memory_id: &str,
        patch: MemoryPatch,
    ) -> Result<bool> {
        let mut body = Map::new();
        body.insert("space_name".to_string(), json!(project_name));
        if let Some(content) = &patch.content {
            body.insert("content".to_string(), json!(content));
        }
        if let Some(tags) = &patch.tags {
            body.insert("tags".to_string(), json!(normalize_tags(tags.clone())));
        }
        if let Some(metadata) = &patch.metadata {
            body.insert("metadata".to_string(), Value::Object(metadata.clone()));
        }

        let path = format!("/memories/{memory_id}");
        let body = Value::Object(body);
        let response = self
            .send(|| Ok(self.request(Method::PUT, &path)?.json(&body)))
            .await
            .map_err(|e| StratumError::write("rest", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StratumError::write(
                "rest",
                format!("update answered {status}"),
            )),
        }
    }

    async fn delete(&self, project_name: &str, memory_id: &str) -> Result<bool> {
        let path = format!("/memories/{memory_id}");
        let params = [("space_name", project_name)];
        let response = self
            .send(|| Ok(self.request(Method::DELETE, &path)?.query(&params)))
            .await
            .map_err(|e| StratumError::write("rest", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(StratumError::write(
                "rest",
                format!("delete answered {status}"),
            )),
        }
    }

    async fn list_project(
        &self,
        project_name: &str,
        category: Option<MemoryCategory>,
        limit: usize,
    ) -> Result<Vec<MemoryItem>> {
        let mut params: Vec<(String, String)> = vec![
            ("space_name".to_string(), project_name.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(category) = category {
            params.push(("category".to_string(), category.as_str().to_string()));
        }

        let response = self
            .send(|| Ok(self.request(Method::GET, "/memories")?.query(&params)))
            .await
            .map_err(|e| StratumError::read("rest", e))?;

        if !response.status().is_success() {
            return Err(StratumError::read(
                "rest",
                format!("list answered {}", response.status()),
            ));
        }

        let parsed: MemoriesResponse = response
            .json()
            .await
            .map_err(|e| StratumError::read("rest", format!("bad list response: {e}")))?;

        Ok(parsed
            .memories
            .into_iter()
            .map(|remote| self.to_item(remote, true))
            .take(limit)
            .collect())
    }

    async fn stats(&self, project_name: &str) -> Result<MemoryStats> {
        let params = [("space_name", project_name)];
        let response = self
            .send(|| Ok(self.request(Method::GET, "/stats")?.query(&params)))
            .await
            .map_err(|e| StratumError::read("rest", e))?;

        if !response.status().is_success() {
            return Err(StratumError::read(
                "rest",
                format!("stats answered {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| StratumError::read("rest", format!("bad stats response: {e}")))
    }

    async fn list_projects(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct SpacesResponse {
            #[serde(default)]
            spaces: Vec<String>,
        }

        let response = self
            .send(|| self.request(Method::GET, "/spaces"))
            .await
            .map_err(|e| StratumError::read("rest", e))?;

        if !response.status().is_success() {
            // Older services have no spaces endpoint; report none rather
            // than failing the caller.
            warn!("rest spaces endpoint answered {}", response.status());
            return Ok(Vec::new());
        }

        let parsed: SpacesResponse = response
            .json()
            .await
            .map_err(|e| StratumError::read("rest", format!("bad spaces response: {e}")))?;
        Ok(parsed.spaces)
    }

    async fn cleanup(&self) -> Result<()> {
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "rest"
    }

    fn supports_similarity_search(&self) -> bool {
        true
    }

    fn features(&self) -> BackendFeatures {
        BackendFeatures {
            similarity_search: true,
            bulk_operations: true,
            transactions: false,
        }
    }
}
