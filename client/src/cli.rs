use std::path::PathBuf;

use clap::{Parser, Subcommand};
use common::{ExportFormat, InputFormat, ProcessingMode};
use serde::de::DeserializeOwned;

/// Acepta los mismos nombres (y alias) que la API: csv, excel, json, sync, batch...
fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_lowercase()))
        .map_err(|_| format!("valor no reconocido: {raw}"))
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para cargas masivas de agricultores")]
pub struct Cli {
    /// Usuario que hace la solicitud
    #[arg(long, env = "BULK_USER", global = true, default_value = "cli")]
    pub user: String,

    /// Organización del usuario
    #[arg(long, env = "BULK_ORG", global = true, default_value = "")]
    pub org: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sube un archivo y crea la operación
    Submit {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        /// Organización FPO destino
        #[arg(long)]
        fpo: String,
        /// Formato (por defecto se deduce de la extensión)
        #[arg(long, value_parser = parse_enum::<InputFormat>)]
        format: Option<InputFormat>,
        /// sync, async o batch
        #[arg(long, value_parser = parse_enum::<ProcessingMode>, default_value = "async")]
        mode: ProcessingMode,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Consulta el estado de una operación
    Status {
        #[arg(value_name = "OPERATION_ID")]
        id: String,
        /// Repite la consulta hasta que la operación termine
        #[arg(long)]
        watch: bool,
    },
    /// Pide la cancelación de una operación en curso
    Cancel {
        #[arg(value_name = "OPERATION_ID")]
        id: String,
    },
    /// Crea una operación nueva con los registros fallidos
    Retry {
        #[arg(value_name = "OPERATION_ID")]
        id: String,
        /// Sólo estos índices (separados por coma); sin esto, todos los fallidos
        #[arg(long, value_delimiter = ',')]
        indices: Vec<usize>,
        #[arg(long, value_parser = parse_enum::<ProcessingMode>)]
        mode: Option<ProcessingMode>,
    },
    /// Descarga los resultados de una operación
    Export {
        #[arg(value_name = "OPERATION_ID")]
        id: String,
        #[arg(long, value_parser = parse_enum::<ExportFormat>, default_value = "csv")]
        format: ExportFormat,
        /// Incluye también los registros exitosos
        #[arg(long)]
        all: bool,
        /// Archivo destino (por defecto, salida estándar)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Valida un archivo sin crear operación
    Validate {
        #[arg(value_name = "ARCHIVO")]
        file: PathBuf,
        #[arg(long)]
        fpo: String,
        #[arg(long, value_parser = parse_enum::<InputFormat>)]
        format: Option<InputFormat>,
        /// Valida localmente, sin llamar al servicio
        #[arg(long)]
        offline: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_de_formato_y_modo() {
        assert_eq!(parse_enum::<InputFormat>("CSV"), Ok(InputFormat::DelimitedText));
        assert_eq!(parse_enum::<ProcessingMode>("batch"), Ok(ProcessingMode::ChunkedBatch));
        assert!(parse_enum::<ProcessingMode>("rapido").is_err());
    }

    #[test]
    fn retry_con_indices() {
        let cli = Cli::parse_from(["client", "--user", "u1", "retry", "op-1", "--indices", "3,1"]);
        match cli.command {
            Commands::Retry { id, indices, mode } => {
                assert_eq!(id, "op-1");
                assert_eq!(indices, vec![3, 1]);
                assert!(mode.is_none());
            }
            _ => panic!("se esperaba retry"),
        }
        assert_eq!(cli.user, "u1");
    }
}
