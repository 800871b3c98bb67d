use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OperationError;
use crate::operation::{
    BulkOperation, InputFormat, OperationId, OperationOptions, OperationStatus, ProcessingMode,
    Progress,
};
use crate::record::RecordOutcome;

/// Solicitud para iniciar una carga masiva. El contenido llega como texto
/// (`data`) o como arreglo de objetos (`farmers`), nunca ambos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartOperationRequest {
    pub fpo_org_id: String,
    #[serde(default)]
    pub input_format: Option<InputFormat>,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmers: Option<Vec<Value>>,
    #[serde(default)]
    pub options: OperationOptions,
}

/// Validación sin crear operación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub fpo_org_id: String,
    #[serde(default)]
    pub input_format: Option<InputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub farmers: Option<Vec<Value>>,
}

/// Resuelve el formato efectivo y los bytes a parsear.
pub fn resolve_payload(
    input_format: Option<InputFormat>,
    data: Option<String>,
    farmers: Option<Vec<Value>>,
) -> Result<(InputFormat, Vec<u8>), OperationError> {
    match (data, farmers) {
        (Some(_), Some(_)) => Err(OperationError::InvalidRequest(
            "enviar sólo uno de data o farmers".to_string(),
        )),
        (None, Some(farmers)) => {
            if matches!(input_format, Some(f) if f != InputFormat::StructuredJson) {
                return Err(OperationError::InvalidRequest(
                    "farmers sólo se acepta con input_format structured_json".to_string(),
                ));
            }
            let bytes = serde_json::to_vec(&farmers)
                .map_err(|e| OperationError::InvalidRequest(e.to_string()))?;
            Ok((InputFormat::StructuredJson, bytes))
        }
        (Some(data), None) => {
            let format = input_format.ok_or_else(|| {
                OperationError::InvalidRequest("input_format es obligatorio con data".to_string())
            })?;
            Ok((format, data.into_bytes()))
        }
        (None, None) => Err(OperationError::InvalidRequest(
            "se requiere data o farmers".to_string(),
        )),
    }
}

/// Reintento de los registros fallidos de una operación terminada.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub retry_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_indices: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_mode: Option<ProcessingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<OperationOptions>,
}

impl RetryRequest {
    /// None = todos los fallidos; Some = sólo esos índices (ordenados, sin repetir).
    pub fn selection(&self) -> Result<Option<BTreeSet<usize>>, OperationError> {
        match (&self.record_indices, self.retry_all) {
            (Some(indices), false) if !indices.is_empty() => {
                Ok(Some(indices.iter().copied().collect()))
            }
            (None, true) => Ok(None),
            (Some(indices), true) if indices.is_empty() => Ok(None),
            (Some(_), true) => Err(OperationError::InvalidRequest(
                "retry_all y record_indices son excluyentes".to_string(),
            )),
            _ => Err(OperationError::InvalidRequest(
                "indicar retry_all o una lista no vacía de record_indices".to_string(),
            )),
        }
    }
}

/// Lo que recibe el caller al iniciar (o reintentar) una operación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub id: OperationId,
    pub status: OperationStatus,
    pub status_url: String,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_operation_id: Option<OperationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sólo en modo síncrono: resultados por registro, ordenados por índice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcomes: Option<Vec<RecordOutcome>>,
}

impl OperationDescriptor {
    pub fn from_operation(op: &BulkOperation, outcomes: Option<Vec<RecordOutcome>>) -> Self {
        Self {
            id: op.id.clone(),
            status: op.status,
            status_url: op.status_url(),
            progress: op.progress,
            parent_operation_id: op.parent_operation_id.clone(),
            error: op.error.clone(),
            outcomes,
        }
    }
}

/// Estado consultable de una operación.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub id: OperationId,
    pub status: OperationStatus,
    pub progress: Progress,
    pub percentage: f64,
    pub cancel_requested: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: OperationId,
    pub status: OperationStatus,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default)]
    pub include_all: bool,
}
