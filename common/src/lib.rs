//! Núcleo del pipeline de carga masiva de agricultores: parseo, validación,
//! autorización, orquestación, pool de workers, avance y almacenamiento de resultados.

pub mod authz;
pub mod config;
pub mod error;
pub mod export;
pub mod farmer;
pub mod operation;
pub mod orchestrator;
pub mod parser;
pub mod pool;
pub mod progress;
pub mod record;
pub mod requests;
pub mod store;
pub mod validator;

#[cfg(test)]
mod testing;

pub use authz::{Caller, PermissionChecker, PermissionRequest, StaticPermissionChecker};
pub use config::PipelineConfig;
pub use error::{AuthzError, CreateError, FormatError, OperationError, StoreError, StoreResult};
pub use farmer::{FarmerCreator, InMemoryFarmerRegistry};
pub use operation::{
    BulkOperation, InputFormat, OperationId, OperationOptions, OperationStatus, ProcessingMode,
    Progress,
};
pub use orchestrator::Orchestrator;
pub use record::{ErrorKind, FarmerInput, OutcomeStatus, ParsedRecord, RecordOutcome};
pub use requests::{
    CancelResponse, ExportFormat, ExportQuery, OperationDescriptor, RetryRequest,
    StartOperationRequest, StatusView, ValidateRequest,
};
pub use store::{MemoryStore, OperationStore};
pub use validator::{ValidationIssue, ValidationReport};
