//! TT Studio control plane.
//!
//! `tt-studio ccs serve` runs the Container Control Service next to the
//! container runtime socket; `tt-studio backend serve` runs the deployment
//! supervisor, the streaming inference proxy and the RAG API in one process.

mod commands;

use clap::Parser;
use std::path::{Path, PathBuf};
use studio_core::config::{LoggingConfig, StudioConfig, load_config};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// TT Studio: model-serving control plane
#[derive(Parser, Debug)]
#[command(name = "tt-studio", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Container Control Service
    Ccs {
        #[command(subcommand)]
        action: ServeAction,
    },
    /// Backend API: deployments, inference and RAG
    Backend {
        #[command(subcommand)]
        action: ServeAction,
    },
    /// Service tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Model catalog
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ServeAction {
    /// Run the HTTP server until interrupted
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum TokenAction {
    /// Mint an HS256 service token
    Issue {
        /// Service name placed in the `sub` claim
        #[arg(long)]
        service: String,
        /// Lifetime in seconds
        #[arg(long, default_value_t = 300)]
        ttl: u64,
        /// Which secret signs the token
        #[arg(long, value_enum, default_value_t = Audience::Ccs)]
        audience: Audience,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Audience {
    /// Accepted by the Container Control Service
    Ccs,
    /// Accepted by deployed model containers
    Backend,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ModelsAction {
    /// List deployable models
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration with secrets masked
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let _guard = init_tracing(&config.logging, cli.verbose);

    let warnings = config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    for warning in warnings {
        tracing::warn!("{warning}");
    }

    commands::handle_command(cli.command, config).await
}

/// Human-readable stderr plus JSON files rolled daily. The returned guard
/// flushes the file writer when dropped.
fn init_tracing(logging: &LoggingConfig, verbose: u8) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let log_dir = log_directory(logging);
    let (json_layer, guard) = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, "tt-studio.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

fn log_directory(logging: &LoggingConfig) -> PathBuf {
    logging.directory.clone().unwrap_or_else(|| {
        directories::ProjectDirs::from("com", "tenstorrent", "tt-studio")
            .map(|d| d.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs"))
    })
}

/// Parent directory of `path`, created if missing.
pub(crate) fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Configuration as TOML with every secret replaced by `***`.
pub(crate) fn masked_config(config: &StudioConfig) -> anyhow::Result<String> {
    let mut shown = config.clone();
    for secret in [
        &mut shown.ccs.jwt_secret,
        &mut shown.inference.backend_jwt_secret,
    ] {
        if !secret.is_empty() {
            *secret = "***".to_string();
        }
    }
    if let Some(secret) = shown.supervisor.ccs_jwt_secret.as_mut() {
        *secret = "***".to_string();
    }
    Ok(toml::to_string_pretty(&shown)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backend_serve_with_bind() {
        let cli = Cli::try_parse_from(["tt-studio", "-v", "backend", "serve", "--bind", "0.0.0.0:8000"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Backend {
                action: ServeAction::Serve { bind },
            } => assert_eq!(bind, Some("0.0.0.0:8000".parse().unwrap())),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_token_issue_defaults() {
        let cli =
            Cli::try_parse_from(["tt-studio", "token", "issue", "--service", "tt-studio-backend"])
                .unwrap();
        match cli.command {
            Commands::Token {
                action:
                    TokenAction::Issue {
                        service,
                        ttl,
                        audience,
                    },
            } => {
                assert_eq!(service, "tt-studio-backend");
                assert_eq!(ttl, 300);
                assert_eq!(audience, Audience::Ccs);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tt-studio",
            "config",
            "show",
            "--config",
            "/etc/tt-studio.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/tt-studio.toml")));
    }

    #[test]
    fn test_token_issue_requires_service() {
        assert!(Cli::try_parse_from(["tt-studio", "token", "issue"]).is_err());
    }

    #[test]
    fn test_masked_config_hides_secrets() {
        let mut config = StudioConfig::default();
        config.ccs.jwt_secret = "ccs-secret".to_string();
        config.inference.backend_jwt_secret = "backend-secret".to_string();
        config.supervisor.ccs_jwt_secret = Some("other".to_string());

        let shown = masked_config(&config).unwrap();
        assert!(!shown.contains("ccs-secret"));
        assert!(!shown.contains("backend-secret"));
        assert!(!shown.contains("\"other\""));
        assert!(shown.contains("***"));

        let parsed: StudioConfig = toml::from_str(&shown).unwrap();
        assert_eq!(parsed.supervisor.port_range_start, 7001);
    }

    #[test]
    fn test_ensure_parent_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state/db/deployments.sqlite3");
        ensure_parent(&db).unwrap();
        assert!(db.parent().unwrap().is_dir());
    }
}
