use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AuthzError, OperationError};

pub const RESOURCE_FARMER: &str = "farmer";
pub const ACTION_BULK_CREATE: &str = "bulk_create";

/// Identidad del caller, ya autenticada por la capa HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub subject: String,
    pub org: String,
}

/// Consulta al colaborador de autorización.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub subject: String,
    pub resource: String,
    pub action: String,
    pub object: String,
    pub org: String,
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check_permission(&self, req: &PermissionRequest) -> Result<bool, AuthzError>;
}

/// Checker fijo: permite o niega todo. Útil en desarrollo y en pruebas.
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissionChecker {
    pub allow: bool,
}

impl StaticPermissionChecker {
    pub fn allow_all() -> Self {
        Self { allow: true }
    }

    pub fn deny_all() -> Self {
        Self { allow: false }
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissionChecker {
    async fn check_permission(&self, _req: &PermissionRequest) -> Result<bool, AuthzError> {
        Ok(self.allow)
    }
}

/// Chequeo único de nivel operación: (subject, farmer, bulk_create, fpo, org).
/// Nunca se llama por registro.
pub async fn authorize_bulk_create(
    checker: &dyn PermissionChecker,
    caller: &Caller,
    fpo_org_id: &str,
) -> Result<(), OperationError> {
    let req = PermissionRequest {
        subject: caller.subject.clone(),
        resource: RESOURCE_FARMER.to_string(),
        action: ACTION_BULK_CREATE.to_string(),
        object: fpo_org_id.to_string(),
        org: caller.org.clone(),
    };

    match checker.check_permission(&req).await {
        Ok(true) => {
            info!(
                "permiso concedido: {} puede hacer bulk_create en fpo {}",
                caller.subject, fpo_org_id
            );
            Ok(())
        }
        Ok(false) => {
            warn!(
                "permiso denegado: {} no puede hacer bulk_create en fpo {}",
                caller.subject, fpo_org_id
            );
            Err(OperationError::Forbidden {
                operation_id: None,
                fpo_org_id: fpo_org_id.to_string(),
            })
        }
        Err(e) => {
            warn!("error consultando autorización para fpo {}: {}", fpo_org_id, e);
            Err(OperationError::AuthorizationUnavailable {
                operation_id: None,
                reason: e.0,
            })
        }
    }
}
