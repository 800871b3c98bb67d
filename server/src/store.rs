use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use common::store::apply_transition;
use common::{
    BulkOperation, OperationId, OperationStatus, OperationStore, ParsedRecord, RecordOutcome,
    StoreError, StoreResult,
};
use glob::glob;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Almacenamiento en disco bajo DATA_DIR:
///
/// - `operations/<id>.json`: fila de la operación, reescrita de forma atómica
/// - `inputs/<id>.jsonl`: registros parseados, uno por línea
/// - `outcomes/<id>.jsonl`: resultados por registro, sólo se agregan líneas
pub struct FileStore {
    root: PathBuf,
    // serializa escrituras para que los chequeos de inmutabilidad sean atómicos
    write_lock: Mutex<()>,
    // índices con resultado ya escrito, por operación (se carga del disco al primer uso)
    written: Mutex<HashMap<OperationId, HashSet<usize>>>,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for dir in ["operations", "inputs", "outcomes"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        debug!("store en disco abierto en {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            written: Mutex::new(HashMap::new()),
        })
    }

    fn operation_path(&self, id: &str) -> PathBuf {
        self.root.join("operations").join(format!("{id}.json"))
    }

    fn input_path(&self, id: &str) -> PathBuf {
        self.root.join("inputs").join(format!("{id}.jsonl"))
    }

    fn outcomes_path(&self, id: &str) -> PathBuf {
        self.root.join("outcomes").join(format!("{id}.jsonl"))
    }

    async fn read_operation(&self, id: &str) -> StoreResult<Option<BulkOperation>> {
        match fs::read(self.operation_path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // tmp + rename: un lector nunca ve un archivo a medio escribir
    async fn write_operation(&self, op: &BulkOperation) -> StoreResult<()> {
        let path = self.operation_path(&op.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(op)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

async fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> StoreResult<()> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    Ok(())
}

/// Lee un archivo JSON Lines. Una línea ilegible (escritura cortada por un
/// reinicio) se descarta con aviso.
async fn read_lines<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<Vec<T>>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => out.push(item),
            Err(e) => warn!("{}: línea {} descartada: {}", path.display(), n + 1, e),
        }
    }
    Ok(Some(out))
}

#[async_trait]
impl OperationStore for FileStore {
    async fn create_operation(&self, op: &BulkOperation) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.operation_path(&op.id)).await? {
            return Err(StoreError::AlreadyExists(op.id.clone()));
        }
        self.write_operation(op).await
    }

    async fn get_operation(&self, id: &str) -> StoreResult<Option<BulkOperation>> {
        self.read_operation(id).await
    }

    async fn update_operation(&self, op: &BulkOperation) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .read_operation(&op.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(op.id.clone()))?;
        if current.status.is_terminal() {
            return Err(StoreError::Immutable(op.id.clone()));
        }
        self.write_operation(op).await
    }

    async fn transition(
        &self,
        id: &str,
        expected: OperationStatus,
        next: OperationStatus,
    ) -> StoreResult<BulkOperation> {
        let _guard = self.write_lock.lock().await;
        let mut current = self
            .read_operation(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_transition(&mut current, expected, next)?;
        self.write_operation(&current).await?;
        Ok(current)
    }

    async fn list_operations(&self) -> StoreResult<Vec<BulkOperation>> {
        let pattern = self.root.join("operations").join("*.json");
        let pattern = pattern.to_string_lossy().to_string();

        let mut ops = Vec::new();
        let entries = glob(&pattern).map_err(|e| {
            StoreError::Io(std::io::Error::new(IoErrorKind::InvalidInput, e.to_string()))
        })?;
        for entry in entries.flatten() {
            match fs::read(&entry).await {
                Ok(bytes) => match serde_json::from_slice::<BulkOperation>(&bytes) {
                    Ok(op) => ops.push(op),
                    Err(e) => warn!("{}: operación ilegible: {}", entry.display(), e),
                },
                Err(e) => warn!("{}: no se pudo leer: {}", entry.display(), e),
            }
        }
        ops.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(ops)
    }

    async fn save_input(&self, id: &str, records: &[ParsedRecord]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.input_path(id);
        // se escribe completo una sola vez por operación
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        append_lines(&path, records).await
    }

    async fn load_input(&self, id: &str) -> StoreResult<Vec<ParsedRecord>> {
        read_lines(&self.input_path(id))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn append_outcome(&self, id: &str, outcome: &RecordOutcome) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut written = self.written.lock().await;

        if !written.contains_key(id) {
            let existing: Vec<RecordOutcome> = read_lines(&self.outcomes_path(id))
                .await?
                .unwrap_or_default();
            written.insert(
                id.to_string(),
                existing.iter().map(|o| o.record_index).collect(),
            );
        }
        let indices = written.entry(id.to_string()).or_default();

        if indices.contains(&outcome.record_index) {
            return Err(StoreError::OutcomeExists {
                operation_id: id.to_string(),
                index: outcome.record_index,
            });
        }
        append_lines(&self.outcomes_path(id), std::slice::from_ref(outcome)).await?;
        indices.insert(outcome.record_index);
        Ok(())
    }

    async fn list_outcomes(&self, id: &str) -> StoreResult<Vec<RecordOutcome>> {
        let lines: Vec<RecordOutcome> = read_lines(&self.outcomes_path(id))
            .await?
            .unwrap_or_default();
        // si una línea quedó repetida, gana la primera
        let mut by_index = BTreeMap::new();
        for o in lines {
            by_index.entry(o.record_index).or_insert(o);
        }
        Ok(by_index.into_values().collect())
    }
}
