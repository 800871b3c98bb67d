use std::time::Duration;

use async_trait::async_trait;
use common::{
    AuthzError, CreateError, FarmerCreator, FarmerInput, PermissionChecker, PermissionRequest,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().timeout(timeout).build()
}

/* ---------------- autorización ---------------- */

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    allowed: bool,
}

/// Checker contra el servicio de autorización (AUTHZ_URL).
#[derive(Debug, Clone)]
pub struct HttpPermissionChecker {
    client: Client,
    base_url: String,
}

impl HttpPermissionChecker {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PermissionChecker for HttpPermissionChecker {
    async fn check_permission(&self, req: &PermissionRequest) -> Result<bool, AuthzError> {
        let url = format!("{}/api/v1/permissions/check", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| AuthzError(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AuthzError(format!("respuesta {status} de {url}")));
        }
        let body: PermissionResponse = resp.json().await.map_err(|e| AuthzError(e.to_string()))?;
        debug!(
            "authz {} {}/{} sobre {}: {}",
            req.subject, req.resource, req.action, req.object, body.allowed
        );
        Ok(body.allowed)
    }
}

/* ---------------- servicio de agricultores ---------------- */

#[derive(Debug, Serialize)]
struct CreateFarmerBody<'a> {
    fpo_org_id: &'a str,
    #[serde(flatten)]
    farmer: &'a FarmerInput,
}

#[derive(Debug, Deserialize)]
struct CreatedFarmer {
    id: String,
}

/// Creador contra el servicio de datos maestros (FARMER_SERVICE_URL).
#[derive(Debug, Clone)]
pub struct HttpFarmerCreator {
    client: Client,
    base_url: String,
}

impl HttpFarmerCreator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

/// 409 duplicado; 429 y 5xx transitorios; el resto de 4xx, rechazo permanente.
pub fn classify_status(status: StatusCode, body: &str) -> CreateError {
    let detail = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    if status == StatusCode::CONFLICT {
        CreateError::Duplicate(detail)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        CreateError::Transient(detail)
    } else {
        CreateError::Rejected(detail)
    }
}

#[async_trait]
impl FarmerCreator for HttpFarmerCreator {
    async fn create_farmer(&self, fpo_org_id: &str, farmer: &FarmerInput) -> Result<String, CreateError> {
        let url = format!("{}/api/v1/farmers", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&CreateFarmerBody { fpo_org_id, farmer })
            .send()
            .await
            // conexión rechazada, timeout, etc.
            .map_err(|e| CreateError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            let created: CreatedFarmer = resp
                .json()
                .await
                .map_err(|e| CreateError::Transient(format!("respuesta ilegible: {e}")))?;
            return Ok(created.id);
        }

        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}
