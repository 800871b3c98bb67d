use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Campos crudos de un registro tal como vinieron en la entrada (nombre normalizado -> valor).
pub type RawFields = BTreeMap<String, String>;

/// Registro parseado, con su posición original (base 0) en la entrada.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub index: usize,
    pub fields: RawFields,
}

impl ParsedRecord {
    /// Valor de un campo, recortado; None si falta o está vacío.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Agricultor ya validado y normalizado, listo para crearse en el servicio externo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmerInput {
    pub first_name: String,
    pub last_name: String,
    /// 10 dígitos, sin prefijo de país.
    pub phone_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aadhaar_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub village: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pincode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub land_acres: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experience_years: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Success,
    Failed,
}

/// Clasificación de errores por registro.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "TRANSIENT_ERROR")]
    Transient,
    #[serde(rename = "PERMANENT_ERROR")]
    Permanent,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Transient => "TRANSIENT_ERROR",
            ErrorKind::Permanent => "PERMANENT_ERROR",
        }
    }
}

/// Resultado de un registro dentro de una operación. Se escribe una sola vez.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub record_index: usize,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_farmer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl RecordOutcome {
    pub fn success(record_index: usize, farmer_id: String, attempts: u32) -> Self {
        Self {
            record_index,
            status: OutcomeStatus::Success,
            created_farmer_id: Some(farmer_id),
            error_kind: None,
            error_detail: None,
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        record_index: usize,
        kind: ErrorKind,
        detail: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            record_index,
            status: OutcomeStatus::Failed,
            created_farmer_id: None,
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}
