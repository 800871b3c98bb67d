mod cli;

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use common::{
    parser, validator, CancelResponse, InputFormat, OperationDescriptor, OperationOptions,
    PipelineConfig, RetryRequest, StartOperationRequest, StatusView, ValidateRequest,
    ValidationReport,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::cli::{Cli, Commands};

/// - En Docker: SERVICE_URL=http://bulk:8080
/// - Local: default http://localhost:8080
fn service_base_url() -> String {
    env::var("SERVICE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

struct Api {
    client: Client,
    base_url: String,
    user: String,
    org: String,
}

impl Api {
    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-User-Id", &self.user)
            .header("X-Org-Id", &self.org)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/farmers/bulk{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.request(self.client.get(self.url(path))).send().await?;
        read_json(resp).await
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .request(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }
}

// Errores del servicio: {"error": "..."}
async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: serde_json::Value = resp.json().await.unwrap_or_default();
    let message = body["error"].as_str().unwrap_or("sin detalle");
    match body["operation_id"].as_str() {
        Some(id) => bail!("{} ({}), operación {}", message, status, id),
        None => bail!("{} ({})", message, status),
    }
}

fn read_input(file: &Path, format: Option<InputFormat>) -> Result<(InputFormat, String)> {
    let format = match format {
        Some(f) => f,
        None => file
            .extension()
            .and_then(|e| e.to_str())
            .and_then(InputFormat::from_extension)
            .ok_or_else(|| anyhow!("no se puede deducir el formato de {}; usar --format", file.display()))?,
    };
    let data = fs::read_to_string(file)
        .with_context(|| format!("no se pudo leer {}", file.display()))?;
    Ok((format, data))
}

fn print_descriptor(desc: &OperationDescriptor) {
    println!("Operación:");
    println!("  id: {}", desc.id);
    println!("  estado: {:?}", desc.status);
    println!("  consultar en: {}", desc.status_url);
    if let Some(parent) = &desc.parent_operation_id {
        println!("  reintento de: {}", parent);
    }
    println!(
        "  registros: {} total, {} exitosos, {} fallidos",
        desc.progress.total, desc.progress.successful, desc.progress.failed
    );
    if let Some(outcomes) = &desc.outcomes {
        for o in outcomes.iter().filter(|o| !o.is_success()) {
            println!(
                "    [{}] {} {}",
                o.record_index,
                o.error_kind.map(|k| k.as_str()).unwrap_or("-"),
                o.error_detail.as_deref().unwrap_or("")
            );
        }
    }
}

fn print_status(status: &StatusView) {
    println!(
        "{} {:?}: {}/{} ({:.1}%), {} exitosos, {} fallidos{}",
        status.id,
        status.status,
        status.progress.processed,
        status.progress.total,
        status.percentage,
        status.progress.successful,
        status.progress.failed,
        if status.cancel_requested && !status.status.is_terminal() {
            " (cancelación pedida)"
        } else {
            ""
        }
    );
    if let Some(error) = &status.error {
        println!("  error: {}", error);
    }
}

fn print_report(report: &ValidationReport) {
    println!(
        "Validación: {} registros, {} válidos, {} inválidos",
        report.total_records, report.valid_records, report.invalid_records
    );
    for (index, issues) in &report.errors {
        for issue in issues {
            println!("  [{}] {}", index, issue);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = Api {
        client: Client::new(),
        base_url: service_base_url(),
        user: cli.user,
        org: cli.org,
    };

    match cli.command {
        Commands::Submit {
            file,
            fpo,
            format,
            mode,
            concurrency,
            chunk_size,
        } => {
            let (format, data) = read_input(&file, format)?;
            let req = StartOperationRequest {
                fpo_org_id: fpo,
                input_format: Some(format),
                processing_mode: mode,
                data: Some(data),
                farmers: None,
                options: OperationOptions {
                    max_concurrency: concurrency,
                    chunk_size,
                },
            };
            let desc: OperationDescriptor = api.post("", &req).await?;
            print_descriptor(&desc);
        }
        Commands::Status { id, watch } => loop {
            let status: StatusView = api.get(&format!("/{id}/status")).await?;
            print_status(&status);
            if !watch || status.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        },
        Commands::Cancel { id } => {
            let resp: CancelResponse = api
                .post(&format!("/{id}/cancel"), &serde_json::json!({}))
                .await?;
            println!("Cancelación pedida para {} (estado {:?})", resp.id, resp.status);
        }
        Commands::Retry { id, indices, mode } => {
            let req = RetryRequest {
                retry_all: indices.is_empty(),
                record_indices: (!indices.is_empty()).then_some(indices),
                processing_mode: mode,
                options: None,
            };
            let desc: OperationDescriptor = api.post(&format!("/{id}/retry"), &req).await?;
            print_descriptor(&desc);
        }
        Commands::Export {
            id,
            format,
            all,
            output,
        } => {
            let url = api.url(&format!(
                "/{id}/results?format={}&include_all={all}",
                format.extension()
            ));
            let resp = api.request(api.client.get(url)).send().await?;
            if !resp.status().is_success() {
                read_json::<serde_json::Value>(resp).await?;
                return Ok(());
            }
            let bytes = resp.bytes().await?;
            match output {
                Some(path) => {
                    fs::write(&path, &bytes)
                        .with_context(|| format!("no se pudo escribir {}", path.display()))?;
                    println!("Resultados guardados en {}", path.display());
                }
                None => print!("{}", String::from_utf8_lossy(&bytes)),
            }
        }
        Commands::Validate {
            file,
            fpo,
            format,
            offline,
        } => {
            let (format, data) = read_input(&file, format)?;
            let report = if offline {
                let records =
                    parser::parse_all(data.as_bytes(), format, PipelineConfig::default().max_records)?;
                validator::validate_batch(&records).report
            } else {
                let req = ValidateRequest {
                    fpo_org_id: fpo,
                    input_format: Some(format),
                    data: Some(data),
                    farmers: None,
                };
                api.post("/validate", &req).await?
            };
            print_report(&report);
        }
    }

    Ok(())
}
