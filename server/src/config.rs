use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use common::PipelineConfig;
use tracing::warn;

/// Configuración del servicio, leída una sola vez al arrancar.
///
/// - En Docker: AUTHZ_URL=http://authz:8080, FARMER_SERVICE_URL=http://farmers:8080
/// - Local: sin URLs se usan el checker fijo y el registro en memoria
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub authz_url: Option<String>,
    pub authz_allow_all: bool,
    pub farmer_service_url: Option<String>,
    pub collaborator_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = PipelineConfig::default();

        let pipeline = PipelineConfig {
            max_concurrency: parse_var("BULK_MAX_CONCURRENCY", defaults.max_concurrency),
            chunk_size: parse_var("BULK_CHUNK_SIZE", defaults.chunk_size),
            max_attempts: parse_var("BULK_MAX_ATTEMPTS", defaults.max_attempts),
            retry_backoff: Duration::from_millis(parse_var(
                "BULK_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )),
            record_timeout: Duration::from_secs(parse_var(
                "BULK_RECORD_TIMEOUT_SECS",
                defaults.record_timeout.as_secs(),
            )),
            max_records: parse_var("BULK_MAX_RECORDS", defaults.max_records),
        };

        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "/data/bulk".to_string())),
            authz_url: optional_var("AUTHZ_URL"),
            authz_allow_all: parse_var("AUTHZ_ALLOW_ALL", false),
            farmer_service_url: optional_var("FARMER_SERVICE_URL"),
            collaborator_timeout: Duration::from_secs(parse_var("COLLABORATOR_TIMEOUT_SECS", 10)),
            pipeline,
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// valor inválido -> default, con aviso en el log
fn parse_var<T: FromStr + Copy + std::fmt::Debug>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{}={:?} no es válido, se usa {:?}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
