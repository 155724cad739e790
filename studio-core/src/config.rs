//! Configuration system for TT Studio.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Environment variables use the `TT_STUDIO_` prefix with `__` as the nesting
//! separator (`TT_STUDIO_CCS__JWT_SECRET`). A handful of flat legacy names
//! (`JWT_SECRET`, `CHROMA_HOST`, ...) are honoured for compatibility with
//! existing appliance deployments.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment prefix for nested configuration keys.
pub const ENV_PREFIX: &str = "TT_STUDIO_";

/// Flat environment names and the nested keys they populate.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("DOCKER_HOST", "ccs.runtime_endpoint"),
    ("JWT_SECRET", "ccs.jwt_secret"),
    ("BACKEND_JWT_SECRET", "inference.backend_jwt_secret"),
    ("CHROMA_HOST", "rag.chroma_host"),
    ("CHROMA_PORT", "rag.chroma_port"),
    ("EMBEDDING_MODEL", "rag.embedding_model"),
    ("INTERNAL_PERSISTENT_STORAGE_VOLUME", "storage_root"),
];

/// Top-level configuration shared by every TT Studio process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudioConfig {
    /// Root for persistent state (deployment database, caches, logs).
    pub storage_root: PathBuf,
    /// Relaxes secret validation for local development.
    #[serde(default)]
    pub dev_mode: bool,
    pub ccs: CcsConfig,
    pub supervisor: SupervisorConfig,
    pub inference: InferenceConfig,
    pub rag: RagConfig,
    pub logging: LoggingConfig,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/lib/tt-studio"),
            dev_mode: false,
            ccs: CcsConfig::default(),
            supervisor: SupervisorConfig::default(),
            inference: InferenceConfig::default(),
            rag: RagConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Container Control Service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CcsConfig {
    /// Address the CCS HTTP server binds to.
    pub bind: SocketAddr,
    /// Container runtime endpoint (`unix:///var/run/docker.sock`, `tcp://host:2375`).
    pub runtime_endpoint: String,
    /// Timeout for every call into the runtime, in seconds.
    pub runtime_timeout_secs: u64,
    /// HS256 secret shared by CCS and its trusted callers.
    pub jwt_secret: String,
    /// Image references must start with one of these prefixes.
    pub allowed_image_prefixes: Vec<String>,
    /// Networks a container may join.
    pub allowed_networks: Vec<String>,
    /// Upper bound on container memory, in bytes.
    pub max_memory_bytes: i64,
    /// Upper bound on container CPU, in whole CPUs.
    pub max_cpus: f64,
    /// Host directories a container may bind-mount from.
    pub allowed_bind_roots: Vec<PathBuf>,
    /// Host device nodes a container may be given.
    pub allowed_device_prefixes: Vec<PathBuf>,
    /// Filesystem checked by the disk health probe.
    pub disk_path: PathBuf,
    /// Free-space percentage below which health is degraded.
    pub disk_free_warn_percent: f64,
    /// Origins allowed by CORS.
    pub cors_origins: Vec<String>,
    /// Reconnect hint sent as the first frame of every log stream.
    pub log_retry_ms: u64,
}

impl Default for CcsConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8002)),
            runtime_endpoint: "unix:///var/run/docker.sock".to_string(),
            runtime_timeout_secs: 120,
            jwt_secret: String::new(),
            allowed_image_prefixes: vec![
                "ghcr.io/tenstorrent/".to_string(),
                "docker.io/tenstorrent/".to_string(),
            ],
            allowed_networks: vec!["tt_studio_network".to_string(), "bridge".to_string()],
            max_memory_bytes: 128 * 1024 * 1024 * 1024,
            max_cpus: 32.0,
            allowed_bind_roots: vec![
                PathBuf::from("/var/lib/tt-studio"),
                PathBuf::from("/dev/hugepages-1G"),
            ],
            allowed_device_prefixes: vec![PathBuf::from("/dev/tenstorrent")],
            disk_path: PathBuf::from("/"),
            disk_free_warn_percent: 10.0,
            cors_origins: vec![
                "http://localhost:8000".to_string(),
                "http://tt_studio_backend_api:8000".to_string(),
            ],
            log_retry_ms: 3000,
        }
    }
}

/// Deployment Supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Address the backend API binds to.
    pub bind: SocketAddr,
    /// Base URL of the Container Control Service.
    pub ccs_url: String,
    /// Secret used to sign tokens presented to CCS. Falls back to `ccs.jwt_secret`.
    #[serde(default)]
    pub ccs_jwt_secret: Option<String>,
    /// Timeout for ordinary CCS calls, in seconds.
    pub ccs_timeout_secs: u64,
    /// Timeout for `run_container`, which may pull large images.
    pub run_timeout_secs: u64,
    /// Deployment database file. Relative paths resolve under `storage_root`.
    pub database_path: PathBuf,
    /// First host port handed to deployments.
    pub port_range_start: u16,
    /// Last host port handed to deployments (inclusive).
    pub port_range_end: u16,
    /// Skip ports that something else on the host already listens on.
    pub probe_host_ports: bool,
    /// Grace period given to a container on stop, in seconds.
    pub stop_grace_secs: u64,
    /// Nominal reconciler cadence, in seconds.
    pub reconcile_interval_secs: u64,
    /// Bound on each per-record runtime lookup during a sweep, in seconds.
    pub reconcile_record_timeout_secs: u64,
    /// Ceiling for the reconciler's backoff when CCS is unavailable.
    pub reconcile_max_backoff_secs: u64,
    /// Records stuck in `starting` longer than this become `error`.
    pub starting_grace_secs: u64,
    /// Docker network model containers join.
    pub network: String,
    /// Host directory mounted as the model cache root.
    pub cache_root: PathBuf,
    /// Host directory holding custom weights.
    pub weights_root: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            ccs_url: "http://127.0.0.1:8002".to_string(),
            ccs_jwt_secret: None,
            ccs_timeout_secs: 30,
            run_timeout_secs: 900,
            database_path: PathBuf::from("deployments.sqlite3"),
            port_range_start: 7001,
            port_range_end: 7100,
            probe_host_ports: true,
            stop_grace_secs: 30,
            reconcile_interval_secs: 60,
            reconcile_record_timeout_secs: 10,
            reconcile_max_backoff_secs: 600,
            starting_grace_secs: 1800,
            network: "tt_studio_network".to_string(),
            cache_root: PathBuf::from("/var/lib/tt-studio/cache"),
            weights_root: PathBuf::from("/var/lib/tt-studio/weights"),
        }
    }
}

/// How the inference proxy reaches a deployed container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamAddressing {
    /// `http://<container-name>:<service-port>` over the shared network.
    #[default]
    Network,
    /// `http://127.0.0.1:<host-port>` through the published port.
    Host,
}

/// Streaming Inference Proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Secret used to sign tokens presented to model containers.
    pub backend_jwt_secret: String,
    pub default_temperature: f32,
    pub default_top_k: u32,
    pub default_top_p: f32,
    pub default_max_tokens: u32,
    /// Let clients choose their own sampling parameters.
    pub allow_client_overrides: bool,
    /// Capacity of the reader -> writer channel, in frames.
    pub channel_capacity: usize,
    pub connect_timeout_secs: u64,
    /// Bound on waiting for the response headers.
    pub first_byte_timeout_secs: u64,
    /// Bound on silence between two upstream chunks.
    pub idle_timeout_secs: u64,
    pub addressing: UpstreamAddressing,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend_jwt_secret: String::new(),
            default_temperature: 1.0,
            default_top_k: 20,
            default_top_p: 0.9,
            default_max_tokens: 512,
            allow_client_overrides: false,
            channel_capacity: 32,
            connect_timeout_secs: 10,
            first_byte_timeout_secs: 120,
            idle_timeout_secs: 60,
            addressing: UpstreamAddressing::Network,
        }
    }
}

/// Which vector index backs the RAG gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Chroma,
    Memory,
}

/// Retrieval and grounding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub vector_backend: VectorBackend,
    pub chroma_host: String,
    pub chroma_port: u16,
    /// Embedding model name; also recorded in collection metadata.
    pub embedding_model: String,
    /// When false every embedding is a zero vector.
    pub embeddings_enabled: bool,
    /// Base URL of a remote embedding service, for non-local models.
    #[serde(default)]
    pub embedding_url: Option<String>,
    /// Cosine distance above which results are discarded.
    pub distance_threshold: f32,
    /// Nearest neighbours fetched before filtering.
    pub n_results: usize,
    /// Minimum surviving documents for a query to be answerable.
    pub min_documents: usize,
    /// Minimum response/source similarity accepted by the validator.
    pub similarity_threshold: f32,
    /// Scan responses for dates, years and amounts absent from the sources.
    pub check_unsupported_facts: bool,
    /// Collection created and seeded on first start.
    pub default_collection: String,
    pub request_timeout_secs: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            vector_backend: VectorBackend::Chroma,
            chroma_host: "tt_studio_chroma".to_string(),
            chroma_port: 8111,
            embedding_model: "local-hash-384".to_string(),
            embeddings_enabled: true,
            embedding_url: None,
            distance_threshold: 0.8,
            n_results: 5,
            min_documents: 0,
            similarity_threshold: 0.3,
            check_unsupported_facts: true,
            default_collection: "tt_studio_internal_knowledge".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Logging settings consumed by the CLI when installing subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter for the stderr layer when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for JSON log files; `None` picks a per-user data directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
        }
    }
}

/// Errors that make a configuration unusable.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl StudioConfig {
    /// Resolve a path relative to `storage_root`.
    pub fn storage_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.storage_root.join(path)
        }
    }

    /// The secret the supervisor signs CCS tokens with.
    pub fn ccs_client_secret(&self) -> &str {
        self.supervisor
            .ccs_jwt_secret
            .as_deref()
            .unwrap_or(&self.ccs.jwt_secret)
    }

    /// Validate the configuration.
    ///
    /// Returns human-readable warnings for questionable values, or an error
    /// when the configuration cannot be used at all.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let mut warnings = Vec::new();

        if self.supervisor.port_range_start > self.supervisor.port_range_end {
            return Err(ConfigError::Invalid {
                message: format!(
                    "port range {}-{} is inverted",
                    self.supervisor.port_range_start, self.supervisor.port_range_end
                ),
            });
        }
        if self.ccs.allowed_image_prefixes.iter().any(|p| p.is_empty()) {
            return Err(ConfigError::Invalid {
                message: "an empty image prefix would allow every image".to_string(),
            });
        }
        if self.ccs.jwt_secret.is_empty() {
            if self.dev_mode {
                warnings.push("ccs.jwt_secret is empty; tokens are signed with an empty key".into());
            } else {
                return Err(ConfigError::Invalid {
                    message: "ccs.jwt_secret must be set (JWT_SECRET)".to_string(),
                });
            }
        }
        if self.inference.backend_jwt_secret.is_empty() {
            warnings.push(
                "inference.backend_jwt_secret is empty; model containers will reject requests"
                    .into(),
            );
        }
        if !(0.0..=100.0).contains(&self.ccs.disk_free_warn_percent) {
            warnings.push(format!(
                "ccs.disk_free_warn_percent ({}) is outside 0-100",
                self.ccs.disk_free_warn_percent
            ));
        }
        if self.inference.default_temperature < 0.0 || self.inference.default_temperature > 2.0 {
            warnings.push(format!(
                "inference.default_temperature ({}) is outside the typical range 0.0-2.0",
                self.inference.default_temperature
            ));
        }
        if self.rag.distance_threshold <= 0.0 || self.rag.distance_threshold > 2.0 {
            warnings.push(format!(
                "rag.distance_threshold ({}) is outside the cosine distance range (0, 2]",
                self.rag.distance_threshold
            ));
        }
        for (key, root) in [
            ("supervisor.cache_root", &self.supervisor.cache_root),
            ("supervisor.weights_root", &self.supervisor.weights_root),
        ] {
            let root = self.storage_path(root);
            if !self.ccs.allowed_bind_roots.iter().any(|a| root.starts_with(a)) {
                warnings.push(format!(
                    "{key} ({}) is outside ccs.allowed_bind_roots; deployments will be refused",
                    root.display()
                ));
            }
        }
        if self.supervisor.reconcile_record_timeout_secs >= self.supervisor.reconcile_interval_secs
        {
            warnings.push(
                "supervisor.reconcile_record_timeout_secs should be shorter than the sweep interval"
                    .into(),
            );
        }
        Ok(warnings)
    }
}

fn legacy_key(name: &str) -> &'static str {
    LEGACY_ENV
        .iter()
        .find(|(env, _)| env.eq_ignore_ascii_case(name))
        .map(|(_, key)| *key)
        .unwrap_or("")
}

/// Build the layered figment without extracting it.
pub fn figment(config_file: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(StudioConfig::default()));

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    } else if let Some(dirs) = directories::ProjectDirs::from("com", "tenstorrent", "tt-studio") {
        let user_config = dirs.config_dir().join("tt-studio.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(user_config));
        }
    }

    let legacy: Vec<&str> = LEGACY_ENV.iter().map(|(env, _)| *env).collect();
    figment = figment.merge(
        Env::raw()
            .only(&legacy)
            .map(|key| legacy_key(key.as_str()).into()),
    );

    // TT_STUDIO_CCS__JWT_SECRET, TT_STUDIO_RAG__CHROMA_PORT, ...
    figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load configuration from defaults, an optional TOML file and the environment.
///
/// Priority (highest to lowest):
/// 1. `TT_STUDIO_*` environment variables
/// 2. Flat legacy environment variables
/// 3. The TOML file (explicit path, else the per-user config if present)
/// 4. Built-in defaults
pub fn load_config(config_file: Option<&Path>) -> Result<StudioConfig, ConfigError> {
    figment(config_file).extract().map_err(|e| ConfigError::Parse(Box::new(e)))
}
