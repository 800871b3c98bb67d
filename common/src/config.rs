use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(200);
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Parámetros del pipeline de carga masiva.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Workers concurrentes por operación (si la solicitud no indica otro valor).
    pub max_concurrency: usize,
    /// Tamaño de cada sub-lote en modo chunked_batch.
    pub chunk_size: usize,
    /// Intentos máximos por registro ante fallas transitorias.
    pub max_attempts: u32,
    /// Espera base entre intentos; se duplica en cada reintento.
    pub retry_backoff: Duration,
    /// Tiempo máximo de un intento de creación.
    pub record_timeout: Duration,
    /// Registros máximos aceptados en una sola operación.
    pub max_records: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            record_timeout: DEFAULT_RECORD_TIMEOUT,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }
}
