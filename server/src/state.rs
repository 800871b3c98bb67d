// server/src/state.rs

use std::sync::Arc;

use anyhow::Result;
use common::{
    FarmerCreator, InMemoryFarmerRegistry, Orchestrator, OperationStore, PermissionChecker,
    StaticPermissionChecker,
};
use tracing::{info, warn};

use crate::collaborators::{HttpFarmerCreator, HttpPermissionChecker};
use crate::config::ServiceConfig;
use crate::store::FileStore;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Arma el estado con los colaboradores que indique la configuración.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let store: Arc<dyn OperationStore> = Arc::new(FileStore::open(&config.data_dir).await?);

        let authz: Arc<dyn PermissionChecker> = match &config.authz_url {
            Some(url) => {
                info!("autorización contra {}", url);
                Arc::new(HttpPermissionChecker::new(url.clone(), config.collaborator_timeout)?)
            }
            None => {
                warn!(
                    "AUTHZ_URL no definida: checker fijo (allow_all={})",
                    config.authz_allow_all
                );
                Arc::new(StaticPermissionChecker {
                    allow: config.authz_allow_all,
                })
            }
        };

        let creator: Arc<dyn FarmerCreator> = match &config.farmer_service_url {
            Some(url) => {
                info!("servicio de agricultores en {}", url);
                Arc::new(HttpFarmerCreator::new(url.clone(), config.collaborator_timeout)?)
            }
            None => {
                warn!("FARMER_SERVICE_URL no definida: registro en memoria");
                Arc::new(InMemoryFarmerRegistry::new())
            }
        };

        Ok(Self::new(Orchestrator::new(
            store,
            authz,
            creator,
            config.pipeline.clone(),
        )))
    }
}
