//! Subcommand handlers.

use crate::{
    Audience, Commands, ConfigAction, ModelsAction, ServeAction, TokenAction, ensure_parent,
    masked_config,
};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use studio_ccs::{ContainerService, DockerRuntime};
use studio_core::auth::ServiceAuth;
use studio_core::config::StudioConfig;
use studio_core::http::serve;
use studio_inference::InferenceService;
use studio_rag::{EmbedderRegistry, RagPipeline, VectorGateway};
use studio_supervisor::{
    CcsClient, DeploySettings, DeploymentStore, ModelCatalog, PortAllocator, Reconciler,
    Supervisor,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub async fn handle_command(command: Commands, config: StudioConfig) -> anyhow::Result<()> {
    match command {
        Commands::Ccs {
            action: ServeAction::Serve { bind },
        } => serve_ccs(config, bind).await,
        Commands::Backend {
            action: ServeAction::Serve { bind },
        } => serve_backend(config, bind).await,
        Commands::Token {
            action:
                TokenAction::Issue {
                    service,
                    ttl,
                    audience,
                },
        } => {
            println!("{}", issue_token(&config, &service, ttl, audience)?);
            Ok(())
        }
        Commands::Models {
            action: ModelsAction::List { json },
        } => {
            let catalog = ModelCatalog::default();
            if json {
                println!("{}", serde_json::to_string_pretty(catalog.all())?);
            } else {
                println!("{:<28} {:<8} {:<18} IMAGE", "ID", "DEVICE", "TYPE");
                for model in catalog.all() {
                    println!(
                        "{:<28} {:<8} {:<18} {}",
                        model.id,
                        model.device,
                        serde_json::to_value(model.model_type)?
                            .as_str()
                            .unwrap_or_default(),
                        model.image
                    );
                }
            }
            Ok(())
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            print!("{}", masked_config(&config)?);
            Ok(())
        }
    }
}

fn issue_token(
    config: &StudioConfig,
    service: &str,
    ttl: u64,
    audience: Audience,
) -> anyhow::Result<String> {
    let secret = match audience {
        Audience::Ccs => config.ccs_client_secret(),
        Audience::Backend => config.inference.backend_jwt_secret.as_str(),
    };
    if secret.is_empty() {
        anyhow::bail!("no secret configured for {audience:?} tokens");
    }
    Ok(ServiceAuth::new(secret).issue(service, Duration::from_secs(ttl))?)
}

/// Cancelled on Ctrl-C or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn serve_ccs(config: StudioConfig, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let ccs = &config.ccs;
    let runtime = DockerRuntime::connect(
        &ccs.runtime_endpoint,
        Duration::from_secs(ccs.runtime_timeout_secs),
    )?;
    let service = ContainerService::new(Arc::new(runtime), ccs);
    if !service.ready().await {
        warn!(endpoint = %ccs.runtime_endpoint, "Container runtime is not answering yet");
    }

    let app = studio_ccs::router(service, Arc::new(ServiceAuth::new(&ccs.jwt_secret)), ccs);
    serve(app, bind.unwrap_or(ccs.bind), "ccs", shutdown_token()).await?;
    Ok(())
}

async fn serve_backend(config: StudioConfig, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let sup = &config.supervisor;

    let db_path = config.storage_path(&sup.database_path);
    ensure_parent(&db_path)?;
    let store = DeploymentStore::open(&db_path)?;
    let client = CcsClient::from_config(sup, config.ccs_client_secret())?;
    let ports = Arc::new(PortAllocator::new(
        sup.port_range_start..=sup.port_range_end,
        sup.probe_host_ports,
    ));
    let supervisor = Arc::new(Supervisor::new(
        store,
        Arc::new(client),
        ports,
        ModelCatalog::default(),
        DeploySettings::from_config(&config),
    ));

    match supervisor.hydrate().await {
        Ok(restored) => info!(restored, "Port reservations restored"),
        Err(e) => warn!(error = %e, "Could not restore port reservations"),
    }
    if let Err(e) = supervisor.ensure_network().await {
        warn!(network = %sup.network, error = %e, "Could not ensure deployment network");
    }

    let shutdown = shutdown_token();
    let reconciler = Reconciler::from_config(Arc::clone(&supervisor), sup);
    let reconciling = tokio::spawn(reconciler.run(shutdown.clone()));

    let inference = InferenceService::from_config(Arc::clone(&supervisor), &config.inference)?;

    let registry = EmbedderRegistry::from_config(&config.rag);
    let gateway = VectorGateway::from_config(&config.rag, &registry)?;
    match gateway.ensure_default_collection().await {
        Ok(true) => info!(collection = %config.rag.default_collection, "Default collection created"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Could not prepare the default collection"),
    }
    let pipeline = Arc::new(RagPipeline::from_config(
        gateway,
        Arc::new(inference.clone()),
        &config.rag,
    ));

    let app = backend_router(supervisor, inference, pipeline);
    let result = serve(app, bind.unwrap_or(sup.bind), "backend", shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = reconciling.await {
        warn!(error = %e, "Reconciler task failed");
    }
    result?;
    Ok(())
}

fn backend_router(
    supervisor: Arc<Supervisor>,
    inference: InferenceService,
    pipeline: Arc<RagPipeline>,
) -> Router {
    studio_supervisor::api::router(supervisor)
        .merge(studio_inference::api::router(inference))
        .merge(studio_rag::api::router(pipeline))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
