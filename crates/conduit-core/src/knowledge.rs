//! Built-in knowledge capabilities.
//!
//! `mem0` searches an agent's personal memory through a [`MemoryBackend`];
//! `memento` queries the company document service over HTTP. Index creation
//! for the memory store is serialised across workers by
//! [`guarded_create_index`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::capability::{
    Capability, CapabilityArguments, CapabilityHandler, CapabilityParameters,
};
use crate::error::{ConduitError, Result};

/// Hits at or above this score are always kept.
const SCORE_THRESHOLD: f64 = 0.5;

/// Fewer than this many qualifying hits falls back to the top hits.
const MIN_RESULTS: usize = 5;

/// Default memento endpoint.
pub const DEFAULT_MEMENTO_URL: &str = "https://memento.process-gpt.io";

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("memory backend error: {0}")]
    Backend(String),

    #[error("memento request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("advisory lock on {key} failed: {reason}")]
    Lock { key: i64, reason: String },

    #[error("index catalog error: {0}")]
    Catalog(String),
}

/// One memory search hit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemoryHit {
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub score: f64,
}

/// Vector memory store queried by `mem0`.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn search(&self, query: &str, user_id: &str) -> std::result::Result<Vec<MemoryHit>, KnowledgeError>;
}

/// Keeps hits scoring at least 0.5, best first. When that leaves fewer than
/// five, the five best hits are kept regardless of score.
pub fn select_hits(mut hits: Vec<MemoryHit>) -> Vec<MemoryHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    let qualifying = hits.iter().filter(|h| h.score >= SCORE_THRESHOLD).count();
    if qualifying < MIN_RESULTS {
        hits.truncate(MIN_RESULTS);
    } else {
        hits.truncate(qualifying);
    }
    hits
}

fn format_hits(hits: &[MemoryHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| format!("개인지식 {} (관련도: {:.2})\n{}", i + 1, hit.score, hit.memory))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Accepts a plain string, or an object the model wrapped the query in.
fn query_text(args: &CapabilityArguments) -> String {
    match args.args.get("query") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(map)) => match map.get("description").or_else(|| map.values().next()) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        },
        Some(other) => other.to_string(),
    }
}

fn query_schema(description: &str) -> Value {
    CapabilityParameters::new().add_property("query", "string", description, true).to_schema()
}

/// Personal memory search for one agent.
pub struct Mem0 {
    backend: Arc<dyn MemoryBackend>,
    user_id: Option<String>,
}

impl Mem0 {
    pub fn new(backend: Arc<dyn MemoryBackend>, user_id: Option<String>) -> Self {
        Self { backend, user_id }
    }

    pub async fn search(&self, query: &str) -> Result<String> {
        if query.is_empty() {
            warn!("mem0 called with an empty query");
            return Ok("검색할 쿼리를 입력해주세요.".to_string());
        }
        let Some(user_id) = self.user_id.as_deref() else {
            error!("mem0 called without a user id");
            return Err(ConduitError::Config("mem0 requires user_id".to_string()));
        };

        let hits = self.backend.search(query, user_id).await.inspect_err(|e| {
            error!(user_id, error = %e, "Memory search failed");
        })?;
        let hits = select_hits(hits);
        info!(user_id, hits = hits.len(), "Memory search finished");

        if hits.is_empty() {
            return Ok(format!("'{}'에 대한 개인 지식이 없습니다.", query));
        }
        Ok(format_hits(&hits))
    }

    pub fn into_capability(self) -> Capability {
        Capability::new(
            "mem0",
            "Searches the agent's personal knowledge: feedback and lessons from earlier runs \
             of the same work, past failures and their fixes, and objective facts (names, \
             numbers, dates). Search for feedback before starting any task, phrasing the \
             query as a full sentence with key entities and constraints.",
            query_schema("Knowledge query"),
            Arc::new(self),
        )
    }
}

#[async_trait]
impl CapabilityHandler for Mem0 {
    async fn execute(&self, args: &CapabilityArguments) -> Result<String> {
        self.search(&query_text(args)).await
    }
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    response: Vec<Document>,
}

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    metadata: Option<DocumentMeta>,
    #[serde(default)]
    page_content: String,
}

#[derive(Debug, Default, Deserialize)]
struct DocumentMeta {
    file_name: Option<String>,
    chunk_index: Option<Value>,
}

/// Company document search.
pub struct Memento {
    client: reqwest::Client,
    base_url: String,
    tenant_id: String,
    process_instance_id: Option<String>,
    timeout: Duration,
}

impl Memento {
    pub fn new(base_url: impl Into<String>, tenant_id: impl Into<String>, process_instance_id: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            tenant_id: tenant_id.into(),
            process_instance_id,
            timeout: Duration::from_secs(40),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn search(&self, query: &str) -> Result<String> {
        let tenant = self.tenant_id.as_str();
        info!(tenant, query, "Document search started");

        let url = format!("{}/api/retrieve", self.base_url.trim_end_matches('/'));
        let mut params = vec![("query", query), ("tenant_id", tenant)];
        if let Some(proc_inst_id) = self.process_instance_id.as_deref() {
            params.push(("proc_inst_id", proc_inst_id));
        }

        let response = self
            .client
            .get(&url)
            .query(&params)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                error!(tenant, query, error = %e, "Document search failed");
                KnowledgeError::Http(e)
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        let body = response.text().await.map_err(KnowledgeError::Http)?;

        let no_results = || format!("테넌트 '{}'에서 '{}' 검색 결과가 없습니다.", tenant, query);
        if body.trim().is_empty() {
            info!(tenant, status, "Document search returned an empty body");
            return Ok(no_results());
        }

        let parsed: RetrieveResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                let snippet: String = body.chars().take(200).collect();
                warn!(tenant, status, content_type, snippet, error = %e, "Document search response is not JSON");
                return Ok(format!(
                    "사내문서 검색 응답이 JSON이 아닙니다 (status={}, content_type='{}').",
                    status, content_type
                ));
            }
        };

        info!(tenant, documents = parsed.response.len(), "Document search finished");
        if parsed.response.is_empty() {
            return Ok(no_results());
        }

        let blocks = parsed
            .response
            .iter()
            .map(|doc| {
                let meta = doc.metadata.as_ref();
                let file = meta.and_then(|m| m.file_name.as_deref()).unwrap_or("unknown");
                let chunk = match meta.and_then(|m| m.chunk_index.as_ref()) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => "unknown".to_string(),
                    Some(other) => other.to_string(),
                };
                format!("📄 파일: {} (청크 #{})\n내용: {}\n---", file, chunk, doc.page_content)
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(format!("테넌트 '{}'에서 '{}' 검색 결과:\n\n{}", tenant, query, blocks))
    }

    pub fn into_capability(self) -> Capability {
        Capability::new(
            "memento",
            "Searches confidential company documents: policies, regulations, processes and \
             technical manuals. Query with full sentences that name the document, version, \
             owning team and environment. Use only for legitimate work purposes.",
            query_schema("Search keywords or question"),
            Arc::new(self),
        )
    }
}

#[async_trait]
impl CapabilityHandler for Memento {
    async fn execute(&self, args: &CapabilityArguments) -> Result<String> {
        self.search(&query_text(args)).await
    }
}

/// Collection whose index is being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionKey {
    pub schema: String,
    pub table: String,
}

impl CollectionKey {
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Self {
        let schema = schema.filter(|s| !s.is_empty()).unwrap_or("vecs");
        Self { schema: schema.to_string(), table: table.into() }
    }

    /// Advisory lock key: non-negative, derived from `vecs:<schema>.<table>`.
    pub fn lock_key(&self) -> i64 {
        let digest = Sha256::digest(format!("vecs:{}.{}", self.schema, self.table).as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes) & i64::MAX
    }
}

/// Cross-process mutual exclusion keyed by an integer.
pub trait AdvisoryLock {
    fn acquire(&self, key: i64) -> std::result::Result<(), KnowledgeError>;
    fn release(&self, key: i64) -> std::result::Result<(), KnowledgeError>;
}

/// Index metadata of a vector collection.
pub trait IndexCatalog {
    /// Fresh lookup of the current index, bypassing any cache.
    fn current_index(&self, collection: &CollectionKey) -> std::result::Result<Option<String>, KnowledgeError>;

    /// Creates the index without replacing an existing one.
    fn create_index(&self, collection: &CollectionKey) -> std::result::Result<String, KnowledgeError>;
}

/// Creates the collection index unless one exists, holding the advisory
/// lock throughout. The lock is released on every path once acquired.
/// Returns the created index name, or `None` when one already existed.
pub fn guarded_create_index(
    lock: &dyn AdvisoryLock,
    catalog: &dyn IndexCatalog,
    collection: &CollectionKey,
) -> std::result::Result<Option<String>, KnowledgeError> {
    let key = collection.lock_key();
    let target = format!("{}.{}", collection.schema, collection.table);
    info!(collection = %target, key, "Waiting for index lock");
    lock.acquire(key)?;
    info!(collection = %target, key, "Index lock acquired");

    let outcome = match catalog.current_index(collection) {
        Ok(Some(existing)) => {
            info!(collection = %target, index = %existing, "Index already present, skipping");
            Ok(None)
        }
        Ok(None) => {
            info!(collection = %target, "Creating index");
            catalog.create_index(collection).map(Some)
        }
        Err(e) => Err(e),
    };

    if let Err(e) = lock.release(key) {
        warn!(collection = %target, key, error = %e, "Failed to release index lock");
        if outcome.is_ok() {
            return Err(e);
        }
    }
    info!(collection = %target, key, "Index lock released");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Mutex;

    fn hit(memory: &str, score: f64) -> MemoryHit {
        MemoryHit { memory: memory.to_string(), score }
    }

    struct FixedBackend {
        hits: Vec<MemoryHit>,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MemoryBackend for FixedBackend {
        async fn search(&self, query: &str, user_id: &str) -> std::result::Result<Vec<MemoryHit>, KnowledgeError> {
            self.seen.lock().unwrap().push((query.to_string(), user_id.to_string()));
            Ok(self.hits.clone())
        }
    }

    fn backend(hits: Vec<MemoryHit>) -> Arc<FixedBackend> {
        Arc::new(FixedBackend { hits, seen: Mutex::new(Vec::new()) })
    }

    #[test]
    fn test_select_hits_keeps_top_five_when_few_qualify() {
        let hits = vec![hit("a", 0.1), hit("b", 0.9), hit("c", 0.2), hit("d", 0.3), hit("e", 0.4), hit("f", 0.05)];
        let selected = select_hits(hits);
        let names: Vec<_> = selected.iter().map(|h| h.memory.as_str()).collect();
        assert_eq!(names, vec!["b", "e", "d", "c", "a"]);
    }

    #[test]
    fn test_select_hits_drops_low_scores_when_enough_qualify() {
        let mut hits: Vec<_> = (0..6).map(|i| hit(&format!("m{}", i), 0.6 + f64::from(i) / 100.0)).collect();
        hits.push(hit("low", 0.2));
        let selected = select_hits(hits);
        assert_eq!(selected.len(), 6);
        assert!(selected.iter().all(|h| h.score >= 0.5));
        assert_eq!(selected[0].memory, "m5");
    }

    #[tokio::test]
    async fn test_mem0_formats_hits() {
        let backend = backend(vec![hit("배포는 금요일 금지", 0.87), hit("담당자: 김", 0.613)]);
        let mem0 = Mem0::new(backend.clone(), Some("agent-7".to_string()));
        let out = mem0.search("배포 규칙").await.unwrap();
        assert_eq!(out, "개인지식 1 (관련도: 0.87)\n배포는 금요일 금지\n\n개인지식 2 (관련도: 0.61)\n담당자: 김");
        assert_eq!(backend.seen.lock().unwrap()[0], ("배포 규칙".to_string(), "agent-7".to_string()));
    }

    #[tokio::test]
    async fn test_mem0_edge_cases() {
        let mem0 = Mem0::new(backend(vec![]), Some("agent-7".to_string()));
        assert_eq!(mem0.search("").await.unwrap(), "검색할 쿼리를 입력해주세요.");
        assert_eq!(mem0.search("deploy").await.unwrap(), "'deploy'에 대한 개인 지식이 없습니다.");

        let anonymous = Mem0::new(backend(vec![]), None);
        assert!(matches!(anonymous.search("deploy").await, Err(ConduitError::Config(_))));
    }

    #[tokio::test]
    async fn test_mem0_capability_unwraps_object_query() {
        let backend = backend(vec![]);
        let capability = Mem0::new(backend.clone(), Some("u".to_string())).into_capability();
        capability.execute(json!({"query": {"description": "feedback on deploys"}})).await.unwrap();
        assert_eq!(backend.seen.lock().unwrap()[0].0, "feedback on deploys");
    }

    #[tokio::test]
    async fn test_memento_renders_documents() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/retrieve")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("query".into(), "leave policy".into()),
                Matcher::UrlEncoded("tenant_id".into(), "acme".into()),
                Matcher::UrlEncoded("proc_inst_id".into(), "p-1".into()),
            ]))
            .match_header("accept", "application/json")
            .with_header("content-type", "application/json")
            .with_body(
                json!({"response": [
                    {"metadata": {"file_name": "hr.pdf", "chunk_index": 3}, "page_content": "15 days"},
                    {"page_content": "see handbook"}
                ]})
                .to_string(),
            )
            .create_async()
            .await;

        let memento = Memento::new(server.url(), "acme", Some("p-1".to_string()));
        let out = memento.search("leave policy").await.unwrap();
        mock.assert_async().await;
        assert_eq!(
            out,
            "테넌트 'acme'에서 'leave policy' 검색 결과:\n\n\
             📄 파일: hr.pdf (청크 #3)\n내용: 15 days\n---\n\
             📄 파일: unknown (청크 #unknown)\n내용: see handbook\n---"
        );
    }

    #[tokio::test]
    async fn test_memento_empty_and_non_json_bodies() {
        let mut server = mockito::Server::new_async().await;
        let _empty = server
            .mock("GET", "/api/retrieve")
            .match_query(Matcher::UrlEncoded("query".into(), "empty".into()))
            .with_body("  ")
            .create_async()
            .await;
        let _html = server
            .mock("GET", "/api/retrieve")
            .match_query(Matcher::UrlEncoded("query".into(), "html".into()))
            .with_header("content-type", "text/html")
            .with_body("<html>oops</html>")
            .create_async()
            .await;

        let memento = Memento::new(server.url(), "acme", None);
        assert_eq!(memento.search("empty").await.unwrap(), "테넌트 'acme'에서 'empty' 검색 결과가 없습니다.");
        assert_eq!(
            memento.search("html").await.unwrap(),
            "사내문서 검색 응답이 JSON이 아닙니다 (status=200, content_type='text/html')."
        );
    }

    #[tokio::test]
    async fn test_memento_http_error_propagates() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/api/retrieve").match_query(Matcher::Any).with_status(500).create_async().await;
        let memento = Memento::new(server.url(), "acme", None);
        let err = memento.search("anything").await.unwrap_err();
        assert!(matches!(err, ConduitError::Knowledge(KnowledgeError::Http(_))));
    }

    #[derive(Default)]
    struct RecordingLock {
        calls: Mutex<Vec<String>>,
    }

    impl AdvisoryLock for RecordingLock {
        fn acquire(&self, key: i64) -> std::result::Result<(), KnowledgeError> {
            self.calls.lock().unwrap().push(format!("lock {}", key));
            Ok(())
        }

        fn release(&self, key: i64) -> std::result::Result<(), KnowledgeError> {
            self.calls.lock().unwrap().push(format!("unlock {}", key));
            Ok(())
        }
    }

    struct Catalog {
        existing: Mutex<Option<String>>,
        fail_create: bool,
    }

    impl IndexCatalog for Catalog {
        fn current_index(&self, _: &CollectionKey) -> std::result::Result<Option<String>, KnowledgeError> {
            Ok(self.existing.lock().unwrap().clone())
        }

        fn create_index(&self, c: &CollectionKey) -> std::result::Result<String, KnowledgeError> {
            if self.fail_create {
                return Err(KnowledgeError::Catalog("relation does not exist".to_string()));
            }
            let name = format!("ix_{}_hnsw", c.table);
            *self.existing.lock().unwrap() = Some(name.clone());
            Ok(name)
        }
    }

    #[test]
    fn test_lock_key_is_deterministic() {
        let a = CollectionKey::new(None, "memories");
        let b = CollectionKey::new(Some("vecs"), "memories");
        assert_eq!(a, b);
        assert_eq!(a.lock_key(), b.lock_key());
        assert!(a.lock_key() >= 0);
        assert_ne!(a.lock_key(), CollectionKey::new(Some("public"), "memories").lock_key());
    }

    #[test]
    fn test_guarded_create_index_creates_once() {
        let lock = RecordingLock::default();
        let catalog = Catalog { existing: Mutex::new(None), fail_create: false };
        let key = CollectionKey::new(None, "memories");

        assert_eq!(guarded_create_index(&lock, &catalog, &key).unwrap().as_deref(), Some("ix_memories_hnsw"));
        assert_eq!(guarded_create_index(&lock, &catalog, &key).unwrap(), None);

        let k = key.lock_key();
        let expected: Vec<String> =
            vec![format!("lock {k}"), format!("unlock {k}"), format!("lock {k}"), format!("unlock {k}")];
        assert_eq!(*lock.calls.lock().unwrap(), expected);
    }

    #[test]
    fn test_guarded_create_index_releases_on_failure() {
        let lock = RecordingLock::default();
        let catalog = Catalog { existing: Mutex::new(None), fail_create: true };
        let key = CollectionKey::new(None, "memories");

        let err = guarded_create_index(&lock, &catalog, &key).unwrap_err();
        assert!(matches!(err, KnowledgeError::Catalog(_)));
        assert_eq!(lock.calls.lock().unwrap().len(), 2);
    }
}
