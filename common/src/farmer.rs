use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CreateError;
use crate::record::FarmerInput;

/// Creación de un agricultor en el servicio de datos maestros.
/// No se asume idempotencia; la clasificación transitorio/permanente viene en el error.
#[async_trait]
pub trait FarmerCreator: Send + Sync {
    async fn create_farmer(&self, fpo_org_id: &str, farmer: &FarmerInput) -> Result<String, CreateError>;
}

/// Registro en memoria: rechaza teléfonos ya existentes como duplicados.
/// Lo usa el servidor cuando no hay servicio de agricultores configurado.
#[derive(Debug, Default)]
pub struct InMemoryFarmerRegistry {
    // teléfono -> id del agricultor
    by_phone: Mutex<HashMap<String, String>>,
    latency: Option<Duration>,
}

impl InMemoryFarmerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simula la latencia de la llamada remota.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn len(&self) -> usize {
        self.by_phone
            .lock()
            .map(|m| m.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FarmerCreator for InMemoryFarmerRegistry {
    async fn create_farmer(&self, fpo_org_id: &str, farmer: &FarmerInput) -> Result<String, CreateError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut by_phone = self
            .by_phone
            .lock()
            .map_err(|_| CreateError::Transient("registro en memoria no disponible".to_string()))?;

        if let Some(existing) = by_phone.get(&farmer.phone_number) {
            return Err(CreateError::Duplicate(format!(
                "el teléfono {} ya pertenece al agricultor {}",
                farmer.phone_number, existing
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        by_phone.insert(farmer.phone_number.clone(), id.clone());
        tracing::debug!("agricultor {} creado en fpo {}", id, fpo_org_id);
        Ok(id)
    }
}
