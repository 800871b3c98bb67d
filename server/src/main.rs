mod collaborators;
mod config;
mod handlers;
mod state;
mod store;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServiceConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG tiene prioridad sobre el filtro por defecto
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("server=debug,common=debug,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServiceConfig::from_env();
    info!(
        "configuración: datos en {}, concurrencia {}, sub-lotes de {}, {} intentos por registro",
        config.data_dir.display(),
        config.pipeline.max_concurrency,
        config.pipeline.chunk_size,
        config.pipeline.max_attempts
    );

    let state = AppState::from_config(&config)
        .await
        .context("no se pudo inicializar el servicio")?;

    // operaciones que quedaron a medias en una ejecución anterior
    match state.orchestrator.recover().await {
        Ok(0) => {}
        Ok(n) => info!("{} operaciones reanudadas tras el reinicio", n),
        Err(e) => warn!("no se pudo revisar operaciones pendientes: {}", e),
    }

    // router HTTP
    let app = handlers::build_router(state).layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", config.bind_addr))?;
    info!("servidor escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
