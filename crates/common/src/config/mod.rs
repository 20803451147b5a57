//! Configuration management for Keystone services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default.toml, config/{APP_ENV}.toml)
//! - Default values for the service sections
//!
//! The `retrieval` section carries no serde defaults: every tunable of the
//! retrieval pipeline must be spelled out in a file or the environment.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// External collaborators (index, oracle, identity, audit)
    pub upstream: UpstreamConfig,

    /// Identity cache configuration
    pub identity_cache: IdentityCacheConfig,

    /// Retrieval pipeline tunables
    pub retrieval: RetrievalParams,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Deadline applied to a retrieval when the caller does not send one
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g. "info", "keystone_retrieval=debug")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Search index base URL
    pub search_index_url: String,

    /// Largest group list the index accepts in one membership clause
    /// (no limit when absent)
    #[serde(default)]
    pub search_index_group_limit: Option<usize>,

    /// Relevance oracle chat-completions endpoint
    pub oracle_url: String,

    /// Model name sent to the oracle
    #[serde(default = "default_oracle_model")]
    pub oracle_model: String,

    /// API key for the oracle
    pub oracle_api_key: Option<String>,

    /// Identity resolver base URL
    pub identity_url: String,

    /// Audit sink URL (tracing-only audit when absent)
    pub audit_url: Option<String>,

    /// Transport-level timeout for every upstream HTTP client
    #[serde(default = "default_upstream_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityCacheConfig {
    /// Entry time-to-live in seconds
    #[serde(default = "default_identity_ttl")]
    pub ttl_secs: u64,

    /// Maximum cached identities
    #[serde(default = "default_identity_capacity")]
    pub max_capacity: u64,
}

/// Reranking strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RerankStrategy {
    /// Skip the rerank stage entirely
    Disabled,
    /// Single 0-3 relevance judgment
    RelevanceOnly,
    /// Relevance plus a 0-1 explicit-evidence judgment
    RelevanceWithSupport,
    /// Relevance, support, and a hallucination-risk tag
    FullAnalysis,
}

impl RerankStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerankStrategy::Disabled => "disabled",
            RerankStrategy::RelevanceOnly => "relevance_only",
            RerankStrategy::RelevanceWithSupport => "relevance_with_support",
            RerankStrategy::FullAnalysis => "full_analysis",
        }
    }
}

/// Order in which the context assembler considers chunks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyOrder {
    /// Highest score first
    Score,
    /// Document id, then reading order
    Document,
}

/// Raw retrieval tunables, validated by the retrieval crate before use
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetrievalParams {
    /// Vector results requested per query variant
    pub vector_k: usize,
    /// Lexical results requested per query variant
    pub lexical_top: usize,
    /// Chunks kept after reranking
    pub final_top_k: usize,
    pub vector_weight: f64,
    pub lexical_weight: f64,
    /// RRF smoothing constant
    pub rrf_k: f64,
    pub table_boost: f64,
    pub image_boost: f64,
    pub recency_boost: f64,
    /// Chunks updated within this many days receive the recency boost
    pub recency_window_days: u32,
    /// Scale applied to the index's semantic-ranker hint
    pub semantic_hint_weight: f64,
    /// Largest group list a single predicate clause may carry
    pub max_acl_group_predicate_size: usize,
    pub max_query_variants: usize,
    /// Concurrent search calls per request
    pub search_concurrency: usize,
    pub search_timeout_ms: u64,
    pub max_context_tokens: usize,
    pub assembly_order: AssemblyOrder,
    pub rerank: RerankParams,
    pub stitch: StitchParams,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RerankParams {
    pub strategy: RerankStrategy,
    pub max_chunks_to_rerank: usize,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub judge_timeout_ms: u64,
    /// Combined scores below this are dropped
    pub min_relevance_score: f64,
    pub relevance_weight: f64,
    pub support_weight: f64,
    /// Weight of the pre-rerank boosted score
    pub residual_weight: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StitchParams {
    pub enabled: bool,
    pub max_neighbors: usize,
    /// Multiplier applied to a neighbor's inherited score
    pub neighbor_discount: f64,
    pub max_total_tokens: usize,
}

impl RetrievalParams {
    /// Production-tested values, used by `config/default.toml` and tests
    pub fn recommended() -> Self {
        Self {
            vector_k: 50,
            lexical_top: 50,
            final_top_k: 10,
            vector_weight: 0.6,
            lexical_weight: 0.4,
            rrf_k: 60.0,
            table_boost: 1.3,
            image_boost: 1.25,
            recency_boost: 1.1,
            recency_window_days: 90,
            semantic_hint_weight: 0.2,
            max_acl_group_predicate_size: 128,
            max_query_variants: 6,
            search_concurrency: 8,
            search_timeout_ms: 3_000,
            max_context_tokens: 6_000,
            assembly_order: AssemblyOrder::Score,
            rerank: RerankParams {
                strategy: RerankStrategy::RelevanceWithSupport,
                max_chunks_to_rerank: 20,
                batch_size: 5,
                max_concurrent_batches: 2,
                judge_timeout_ms: 8_000,
                min_relevance_score: 0.3,
                relevance_weight: 0.6,
                support_weight: 0.25,
                residual_weight: 0.15,
            },
            stitch: StitchParams {
                enabled: true,
                max_neighbors: 2,
                neighbor_discount: 0.8,
                max_total_tokens: 8_000,
            },
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_deadline_ms() -> u64 { 20_000 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "keystone".to_string() }
fn default_oracle_model() -> String { "gpt-4o-mini".to_string() }
fn default_upstream_timeout() -> u64 { 10_000 }
fn default_identity_ttl() -> u64 { 300 }
fn default_identity_capacity() -> u64 { 10_000 }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__RETRIEVAL__RRF_K=30
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the default retrieval deadline as Duration
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.server.default_deadline_ms)
    }

    /// Get the identity cache TTL as Duration
    pub fn identity_ttl(&self) -> Duration {
        Duration::from_secs(self.identity_cache.ttl_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                default_deadline_ms: default_deadline_ms(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
            upstream: UpstreamConfig {
                search_index_url: "http://localhost:7700".to_string(),
                search_index_group_limit: None,
                oracle_url: "https://api.openai.com/v1/chat/completions".to_string(),
                oracle_model: default_oracle_model(),
                oracle_api_key: None,
                identity_url: "http://localhost:7800".to_string(),
                audit_url: None,
                timeout_ms: default_upstream_timeout(),
            },
            identity_cache: IdentityCacheConfig {
                ttl_secs: default_identity_ttl(),
                max_capacity: default_identity_capacity(),
            },
            retrieval: RetrievalParams::recommended(),
        }
    }
}
