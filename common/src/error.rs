use thiserror::Error;

use crate::operation::{OperationId, OperationStatus};

/// Error de formato: el payload completo no se puede interpretar.
/// Es de nivel operación y no se reintenta sin volver a subir el archivo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("el payload está vacío")]
    Empty,

    #[error("el payload no contiene registros")]
    NoRecords,

    #[error("el archivo no tiene encabezados")]
    MissingHeader,

    #[error("el payload no es UTF-8 válido")]
    NotUtf8,

    #[error("texto delimitado inválido en la línea {line}: {reason}")]
    Delimited { line: u64, reason: String },

    #[error("JSON inválido: {0}")]
    Json(String),

    #[error("el elemento {index} no es un objeto JSON")]
    NotAnObject { index: usize },

    #[error("demasiados registros: {found} (máximo {max})")]
    TooManyRecords { found: usize, max: usize },
}

/// Errores del almacenamiento durable de operaciones y resultados.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("operación {0} no encontrada")]
    NotFound(OperationId),

    #[error("la operación {0} ya existe")]
    AlreadyExists(OperationId),

    #[error("la operación {0} está en estado terminal y no se puede modificar")]
    Immutable(OperationId),

    #[error("la operación {operation_id} está en {found:?}, se esperaba {expected:?}")]
    Conflict {
        operation_id: OperationId,
        expected: OperationStatus,
        found: OperationStatus,
    },

    #[error("el resultado del registro {index} de la operación {operation_id} ya fue escrito")]
    OutcomeExists {
        operation_id: OperationId,
        index: usize,
    },

    #[error("error de IO en el almacenamiento: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización en el almacenamiento: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Error del colaborador de autorización (no confundir con una denegación).
#[derive(Debug, Clone, Error)]
#[error("servicio de autorización no disponible: {0}")]
pub struct AuthzError(pub String);

/// Error devuelto por la creación de un agricultor en el servicio externo.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateError {
    /// Falla de una dependencia (timeout, indisponibilidad). Se reintenta.
    #[error("falla transitoria: {0}")]
    Transient(String),

    /// El agricultor ya existe; no cambia al reintentar.
    #[error("agricultor duplicado: {0}")]
    Duplicate(String),

    /// El servicio rechazó el registro por otra razón no recuperable.
    #[error("registro rechazado: {0}")]
    Rejected(String),
}

impl CreateError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CreateError::Transient(_))
    }
}

/// Errores de nivel operación que se devuelven de forma síncrona al caller.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("formato de entrada inválido: {source}")]
    Format {
        operation_id: Option<OperationId>,
        #[source]
        source: FormatError,
    },

    #[error("permiso denegado para carga masiva en la organización {fpo_org_id}")]
    Forbidden {
        operation_id: Option<OperationId>,
        fpo_org_id: String,
    },

    #[error("no se pudo verificar la autorización: {reason}")]
    AuthorizationUnavailable {
        operation_id: Option<OperationId>,
        reason: String,
    },

    #[error("operación {0} no encontrada")]
    NotFound(OperationId),

    #[error("la operación {0} ya terminó")]
    AlreadyComplete(OperationId),

    #[error("la operación {id} no se puede reintentar: {reason}")]
    NotRetryable { id: OperationId, reason: String },

    #[error("solicitud inválida: {0}")]
    InvalidRequest(String),

    #[error("no se pudo generar el export: {0}")]
    Export(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OperationError {
    /// Id de la operación que quedó registrada (en FAILED) para este error, si existe.
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            OperationError::Format { operation_id, .. }
            | OperationError::Forbidden { operation_id, .. }
            | OperationError::AuthorizationUnavailable { operation_id, .. } => {
                operation_id.as_deref()
            }
            OperationError::NotFound(id)
            | OperationError::AlreadyComplete(id)
            | OperationError::NotRetryable { id, .. } => Some(id),
            OperationError::InvalidRequest(_)
            | OperationError::Export(_)
            | OperationError::Store(_) => None,
        }
    }

    /// Asocia el error a la operación que quedó en FAILED por su causa.
    pub fn with_operation_id(self, id: &str) -> Self {
        let id = Some(id.to_string());
        match self {
            OperationError::Format { source, .. } => OperationError::Format {
                operation_id: id,
                source,
            },
            OperationError::Forbidden { fpo_org_id, .. } => OperationError::Forbidden {
                operation_id: id,
                fpo_org_id,
            },
            OperationError::AuthorizationUnavailable { reason, .. } => {
                OperationError::AuthorizationUnavailable {
                    operation_id: id,
                    reason,
                }
            }
            other => other,
        }
    }
}

impl From<FormatError> for OperationError {
    fn from(source: FormatError) -> Self {
        OperationError::Format {
            operation_id: None,
            source,
        }
    }
}
