#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tracelens::app::{self, AppContext};
use tracelens::config::AppConfig;
use tracelens::embeddings::{EmbeddingError, EmbeddingsProvider};
use tracelens::pipeline::pii::PatternDetector;
use tracelens::pricing::PricingTable;
use tracelens::project::{self, Project};
use tracelens::storage::sqlite::{create_pool, init_pool};

const DIMENSIONS: usize = 32;

/// Bag-of-words hashing: identical texts embed identically, shared words pull vectors together.
pub struct WordHashEmbeddings;

#[async_trait]
impl EmbeddingsProvider for WordHashEmbeddings {
    fn model(&self) -> &str {
        "word-hash"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; DIMENSIONS];
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let bucket = word
                        .to_lowercase()
                        .bytes()
                        .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
                    vector[bucket % DIMENSIONS] += 1.0;
                }
                vector
            })
            .collect())
    }
}

/// Provider whose upstream is always down.
pub struct UnavailableEmbeddings;

#[async_trait]
impl EmbeddingsProvider for UnavailableEmbeddings {
    fn model(&self) -> &str {
        "unavailable"
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Api {
            status: 503,
            body: "upstream unavailable".into(),
        })
    }
}

pub enum Embedder {
    None,
    WordHash,
    Unavailable,
}

pub struct TestServer {
    pub base: String,
    pub client: reqwest::Client,
    pub pool: deadpool_sqlite::Pool,
    pub project: Project,
    /// messages:view + cost:view
    pub admin_token: String,
    /// messages:view only
    pub viewer_token: String,
    _dir: TempDir,
}

pub async fn spawn_server(embedder: Embedder) -> TestServer {
    spawn_server_with(embedder, true).await
}

pub async fn spawn_server_with(embedder: Embedder, pii_redaction: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.database.path = dir.path().join("test.db");
    config.rate_limit.enabled = false;

    let pool = create_pool(&config.database).unwrap();
    init_pool(&pool).await.unwrap();

    let project = project::create_project(&pool, "demo", pii_redaction)
        .await
        .unwrap();
    let admin_token = project::create_token(
        &pool,
        &project.id,
        "admin",
        vec!["messages:view".into(), "cost:view".into()],
        None,
    )
    .await
    .unwrap()
    .token;
    let viewer_token = project::create_token(
        &pool,
        &project.id,
        "viewer",
        vec!["messages:view".into()],
        Some(30),
    )
    .await
    .unwrap()
    .token;

    let embeddings: Option<Arc<dyn EmbeddingsProvider>> = match embedder {
        Embedder::None => None,
        Embedder::WordHash => Some(Arc::new(WordHashEmbeddings)),
        Embedder::Unavailable => Some(Arc::new(UnavailableEmbeddings)),
    };
    let detector = Arc::new(PatternDetector::from_names(&config.pii.detectors));

    let router = app::router(AppContext {
        config,
        pool: pool.clone(),
        estimator: Arc::new(PricingTable::new()),
        detector,
        embeddings,
    })
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        pool,
        project,
        admin_token,
        viewer_token,
        _dir: dir,
    }
}

impl TestServer {
    pub fn api(&self, path: &str) -> String {
        format!("{}/api/projects/{}{}", self.base, self.project.id, path)
    }

    pub async fn collect(&self, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/collector", self.base))
            .header("X-Auth-Token", &self.project.api_key)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn collect_ok(&self, body: Value) -> Value {
        let resp = self.collect(body).await;
        assert_eq!(resp.status(), 200, "collector rejected batch");
        resp.json().await.unwrap()
    }

    pub async fn post_api(&self, token: &str, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.api(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn get_api(&self, token: &str, path: &str) -> reqwest::Response {
        self.client
            .get(self.api(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    pub async fn search(&self, body: Value) -> Value {
        let resp = self.post_api(&self.admin_token, "/traces/search", body).await;
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    pub async fn exec(&self, sql: &'static str, values: Vec<String>) {
        let conn = self.pool.get().await.unwrap();
        conn.interact(move |conn| {
            conn.execute(sql, rusqlite::params_from_iter(values.iter()))
                .map(|_| ())
        })
        .await
        .unwrap()
        .unwrap();
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A finished `span` with text input and output.
pub fn span(id: &str, trace_id: &str, started_at: i64, input: &str, output: &str) -> Value {
    json!({
        "span_id": id,
        "trace_id": trace_id,
        "type": "span",
        "name": id,
        "input": {"type": "text", "value": input},
        "outputs": [{"type": "text", "value": output}],
        "timestamps": {"started_at": started_at, "finished_at": started_at + 100}
    })
}

/// An `llm` span on gpt-4o with no reported token counts.
pub fn llm_span(id: &str, trace_id: &str, started_at: i64, input: &str, output: &str) -> Value {
    json!({
        "span_id": id,
        "trace_id": trace_id,
        "type": "llm",
        "vendor": "openai",
        "model": "gpt-4o",
        "input": {"type": "text", "value": input},
        "outputs": [{"type": "text", "value": output}],
        "timestamps": {"started_at": started_at, "finished_at": started_at + 250}
    })
}

pub fn guardrail_span(id: &str, trace_id: &str, started_at: i64, slug: &str, passed: bool) -> Value {
    json!({
        "span_id": id,
        "trace_id": trace_id,
        "type": "guardrail",
        "name": slug,
        "outputs": [{
            "type": "guardrail_result",
            "value": {"passed": passed, "cost": {"amount": 0.002, "currency": "USD"}}
        }],
        "timestamps": {"started_at": started_at, "finished_at": started_at + 5}
    })
}

pub fn trace_ids(groups: &Value) -> Vec<Vec<String>> {
    groups["groups"]
        .as_array()
        .unwrap()
        .iter()
        .map(|group| {
            group
                .as_array()
                .unwrap()
                .iter()
                .map(|t| t["trace_id"].as_str().unwrap().to_string())
                .collect()
        })
        .collect()
}
