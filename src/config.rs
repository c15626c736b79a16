use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub pii: PiiConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5560
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("tracelens.db")
}
fn default_pool_size() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_id_len")]
    pub max_id_len: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            max_batch_size: default_max_batch_size(),
            max_id_len: default_max_id_len(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_batch_size() -> usize {
    500
}
fn default_max_id_len() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct PiiConfig {
    /// Applied to projects created without an explicit setting.
    #[serde(default = "default_true")]
    pub default_enabled: bool,
    #[serde(default = "default_pii_detectors")]
    pub detectors: Vec<String>,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            detectors: default_pii_detectors(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_pii_detectors() -> Vec<String> {
    vec!["credit_card".to_string(), "email".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_embeddings_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_embeddings_model")]
    pub model: String,
    #[serde(default = "default_embeddings_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_embeddings_base_url(),
            api_key: String::new(),
            model: default_embeddings_model(),
            dimensions: default_embeddings_dimensions(),
        }
    }
}

fn default_embeddings_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embeddings_dimensions() -> usize {
    1536
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    /// 0 disables the background refresh.
    #[serde(default = "default_pricing_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_pricing_url")]
    pub url: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_pricing_refresh_interval(),
            url: default_pricing_url(),
        }
    }
}

fn default_pricing_refresh_interval() -> u64 {
    86400
}
fn default_pricing_url() -> String {
    "https://raw.githubusercontent.com/BerriAI/litellm/main/model_prices_and_context_window.json"
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Upper bound on candidate ids resolved for a free-text query.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_knn_k")]
    pub knn_k: usize,
    #[serde(default = "default_rrf_window")]
    pub rrf_window: usize,
    #[serde(default = "default_rrf_rank_constant")]
    pub rrf_rank_constant: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_date_range_days")]
    pub default_date_range_days: i64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_candidates: default_max_candidates(),
            knn_k: default_knn_k(),
            rrf_window: default_rrf_window(),
            rrf_rank_constant: default_rrf_rank_constant(),
            lexical_weight: default_lexical_weight(),
            default_date_range_days: default_date_range_days(),
        }
    }
}

fn default_page_size() -> usize {
    25
}
fn default_max_page_size() -> usize {
    1000
}
fn default_max_candidates() -> usize {
    10_000
}
fn default_knn_k() -> usize {
    10
}
fn default_rrf_window() -> usize {
    100
}
fn default_rrf_rank_constant() -> f64 {
    60.0
}
fn default_lexical_weight() -> f64 {
    100.0
}
fn default_date_range_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    /// Applies to the collector only.
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_per_second")]
    pub per_second: u64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            per_second: default_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

fn default_rate_limit_enabled() -> bool {
    true
}
fn default_per_second() -> u64 {
    50
}
fn default_burst_size() -> u32 {
    200
}

impl AppConfig {
    /// Reject settings that would make the service misbehave at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.embeddings.enabled && self.embeddings.api_key.is_empty() {
            return Err("embeddings.api_key must be set when embeddings are enabled. \
                 Set it in config.toml or via TRACELENS__EMBEDDINGS__API_KEY env var."
                .to_string());
        }
        if self.embeddings.dimensions == 0 {
            return Err("embeddings.dimensions must be greater than 0".to_string());
        }
        let q = &self.query;
        if q.default_page_size == 0 || q.default_page_size > q.max_page_size {
            return Err(format!(
                "query.default_page_size must be between 1 and query.max_page_size ({})",
                q.max_page_size
            ));
        }
        if q.rrf_rank_constant <= 0.0 || q.lexical_weight <= 0.0 {
            return Err("query.rrf_rank_constant and query.lexical_weight must be positive".into());
        }
        if q.knn_k == 0 {
            return Err("query.knn_k must be greater than 0".to_string());
        }
        if self.ingest.max_batch_size == 0 {
            return Err("ingest.max_batch_size must be greater than 0".to_string());
        }
        for detector in &self.pii.detectors {
            if !crate::pipeline::pii::KNOWN_DETECTORS.contains(&detector.as_str()) {
                return Err(format!("pii.detectors: unknown detector {detector}"));
            }
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // TRACELENS__SERVER__PORT=5561, TRACELENS__EMBEDDINGS__API_KEY=..., etc.
        builder = builder.add_source(
            Environment::with_prefix("TRACELENS")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
