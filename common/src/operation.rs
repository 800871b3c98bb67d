use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type OperationId = String;

/// Formato declarado del archivo o payload de entrada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    #[serde(alias = "csv")]
    DelimitedText,
    /// Hoja exportada como texto separado por tabulaciones.
    #[serde(alias = "excel", alias = "xlsx", alias = "tsv")]
    Spreadsheet,
    #[serde(alias = "json")]
    StructuredJson,
}

impl InputFormat {
    /// Deduce el formato a partir de la extensión de un archivo (sin el punto).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "txt" => Some(InputFormat::DelimitedText),
            "tsv" | "xls" | "xlsx" => Some(InputFormat::Spreadsheet),
            "json" | "jsonl" | "ndjson" => Some(InputFormat::StructuredJson),
            _ => None,
        }
    }
}

/// Estrategia de ejecución pedida por el caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[serde(alias = "sync")]
    Synchronous,
    #[default]
    #[serde(alias = "async")]
    Asynchronous,
    #[serde(alias = "batch")]
    ChunkedBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    /// Transiciones permitidas de la máquina de estados.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }
}

/// Contadores de avance de una operación.
/// Invariante: processed == successful + failed y processed <= total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub processed: u32,
    pub successful: u32,
    pub failed: u32,
}

impl Progress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = self.processed as f64 / self.total as f64 * 100.0;
        pct.min(100.0)
    }
}

/// Opciones por operación; lo que no venga se toma de la configuración del servicio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
}

/// Fila durable de una operación de carga masiva.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkOperation {
    pub id: OperationId,
    pub fpo_org_id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub input_format: InputFormat,
    pub processing_mode: ProcessingMode,
    pub status: OperationStatus,
    pub progress: Progress,

    /// Operación original cuando esta fue creada por un reintento.
    pub parent_operation_id: Option<OperationId>,

    #[serde(default)]
    pub options: OperationOptions,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Motivo de la falla a nivel operación (formato, autorización, interrupción).
    pub error: Option<String>,
}

impl BulkOperation {
    pub fn new(
        fpo_org_id: impl Into<String>,
        requested_by: impl Into<String>,
        input_format: InputFormat,
        processing_mode: ProcessingMode,
        options: OperationOptions,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            fpo_org_id: fpo_org_id.into(),
            requested_by: requested_by.into(),
            requested_at: Utc::now(),
            input_format,
            processing_mode,
            status: OperationStatus::Pending,
            progress: Progress::default(),
            parent_operation_id: None,
            options,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Aplica una transición de estado. Devuelve false si no es válida
    /// (por ejemplo, si la operación ya está en un estado terminal).
    pub fn advance(&mut self, next: OperationStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        match next {
            OperationStatus::Processing => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        true
    }

    pub fn status_url(&self) -> String {
        format!("/api/v1/farmers/bulk/{}/status", self.id)
    }
}
