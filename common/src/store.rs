use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::operation::{BulkOperation, OperationId, OperationStatus};
use crate::record::{ParsedRecord, RecordOutcome};

/// Almacenamiento durable de operaciones, entradas y resultados por registro.
///
/// Reglas que toda implementación respeta:
/// - una operación en estado terminal no se vuelve a actualizar;
/// - cada (operation_id, record_index) tiene a lo sumo un resultado;
/// - `transition` compara el estado actual antes de cambiarlo.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create_operation(&self, op: &BulkOperation) -> StoreResult<()>;
    async fn get_operation(&self, id: &str) -> StoreResult<Option<BulkOperation>>;
    async fn update_operation(&self, op: &BulkOperation) -> StoreResult<()>;
    async fn list_operations(&self) -> StoreResult<Vec<BulkOperation>>;

    /// Cambia sólo el estado, y sólo si la fila sigue en `expected`.
    /// Devuelve la fila ya actualizada.
    async fn transition(
        &self,
        id: &str,
        expected: OperationStatus,
        next: OperationStatus,
    ) -> StoreResult<BulkOperation>;

    /// Guarda los registros parseados de la operación (para reintentos y exportes).
    async fn save_input(&self, id: &str, records: &[ParsedRecord]) -> StoreResult<()>;
    async fn load_input(&self, id: &str) -> StoreResult<Vec<ParsedRecord>>;

    async fn append_outcome(&self, id: &str, outcome: &RecordOutcome) -> StoreResult<()>;
    /// Resultados ordenados por record_index.
    async fn list_outcomes(&self, id: &str) -> StoreResult<Vec<RecordOutcome>>;
}

/// Implementación en memoria (pruebas y desarrollo).
#[derive(Debug, Default)]
pub struct MemoryStore {
    operations: Mutex<HashMap<OperationId, BulkOperation>>,
    inputs: Mutex<HashMap<OperationId, Vec<ParsedRecord>>>,
    outcomes: Mutex<HashMap<OperationId, BTreeMap<usize, RecordOutcome>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Regla común de `transition` para cualquier implementación.
pub fn apply_transition(
    op: &mut BulkOperation,
    expected: OperationStatus,
    next: OperationStatus,
) -> StoreResult<()> {
    if op.status.is_terminal() {
        return Err(StoreError::Immutable(op.id.clone()));
    }
    if op.status != expected || !op.advance(next) {
        return Err(StoreError::Conflict {
            operation_id: op.id.clone(),
            expected,
            found: op.status,
        });
    }
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl OperationStore for MemoryStore {
    async fn create_operation(&self, op: &BulkOperation) -> StoreResult<()> {
        let mut ops = lock(&self.operations);
        if ops.contains_key(&op.id) {
            return Err(StoreError::AlreadyExists(op.id.clone()));
        }
        ops.insert(op.id.clone(), op.clone());
        Ok(())
    }

    async fn get_operation(&self, id: &str) -> StoreResult<Option<BulkOperation>> {
        Ok(lock(&self.operations).get(id).cloned())
    }

    async fn update_operation(&self, op: &BulkOperation) -> StoreResult<()> {
        let mut ops = lock(&self.operations);
        let current = ops
            .get_mut(&op.id)
            .ok_or_else(|| StoreError::NotFound(op.id.clone()))?;
        if current.status.is_terminal() {
            return Err(StoreError::Immutable(op.id.clone()));
        }
        *current = op.clone();
        Ok(())
    }

    async fn transition(
        &self,
        id: &str,
        expected: OperationStatus,
        next: OperationStatus,
    ) -> StoreResult<BulkOperation> {
        let mut ops = lock(&self.operations);
        let current = ops
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_transition(current, expected, next)?;
        Ok(current.clone())
    }

    async fn list_operations(&self) -> StoreResult<Vec<BulkOperation>> {
        let mut ops: Vec<BulkOperation> = lock(&self.operations).values().cloned().collect();
        ops.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        Ok(ops)
    }

    async fn save_input(&self, id: &str, records: &[ParsedRecord]) -> StoreResult<()> {
        lock(&self.inputs).insert(id.to_string(), records.to_vec());
        Ok(())
    }

    async fn load_input(&self, id: &str) -> StoreResult<Vec<ParsedRecord>> {
        lock(&self.inputs)
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn append_outcome(&self, id: &str, outcome: &RecordOutcome) -> StoreResult<()> {
        let mut all = lock(&self.outcomes);
        let per_op = all.entry(id.to_string()).or_default();
        if per_op.contains_key(&outcome.record_index) {
            return Err(StoreError::OutcomeExists {
                operation_id: id.to_string(),
                index: outcome.record_index,
            });
        }
        per_op.insert(outcome.record_index, outcome.clone());
        Ok(())
    }

    async fn list_outcomes(&self, id: &str) -> StoreResult<Vec<RecordOutcome>> {
        Ok(lock(&self.outcomes)
            .get(id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{InputFormat, OperationOptions, ProcessingMode};
    use crate::record::ErrorKind;

    fn op() -> BulkOperation {
        BulkOperation::new(
            "fpo-1",
            "user-1",
            InputFormat::StructuredJson,
            ProcessingMode::Asynchronous,
            OperationOptions::default(),
        )
    }

    #[tokio::test]
    async fn operacion_terminal_es_inmutable() {
        let store = MemoryStore::new();
        let mut op = op();
        store.create_operation(&op).await.unwrap();

        op.advance(OperationStatus::Processing);
        op.progress.total = 3;
        store.update_operation(&op).await.unwrap();

        op.advance(OperationStatus::Completed);
        store.update_operation(&op).await.unwrap();

        let mut tarde = op.clone();
        tarde.progress.processed = 99;
        let err = store.update_operation(&tarde).await.unwrap_err();
        assert!(matches!(err, StoreError::Immutable(_)));

        let guardada = store.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(guardada.progress.processed, 0);
        assert_eq!(guardada.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn resultados_de_escritura_unica_y_ordenados() {
        let store = MemoryStore::new();
        store
            .append_outcome("op", &RecordOutcome::success(2, "b".into(), 1))
            .await
            .unwrap();
        store
            .append_outcome("op", &RecordOutcome::failure(0, ErrorKind::Validation, "x", 0))
            .await
            .unwrap();

        let dup = store
            .append_outcome("op", &RecordOutcome::success(2, "c".into(), 1))
            .await
            .unwrap_err();
        assert!(matches!(dup, StoreError::OutcomeExists { index: 2, .. }));

        let idx: Vec<usize> = store
            .list_outcomes("op")
            .await
            .unwrap()
            .iter()
            .map(|o| o.record_index)
            .collect();
        assert_eq!(idx, vec![0, 2]);
    }

    #[tokio::test]
    async fn crear_dos_veces_falla() {
        let store = MemoryStore::new();
        let op = op();
        store.create_operation(&op).await.unwrap();
        assert!(matches!(
            store.create_operation(&op).await.unwrap_err(),
            StoreError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn transicion_compara_el_estado_actual() {
        let store = MemoryStore::new();
        let mut op = op();
        op.progress.total = 7;
        store.create_operation(&op).await.unwrap();

        let cancelled = store
            .transition(&op.id, OperationStatus::Pending, OperationStatus::Cancelled)
            .await
            .unwrap();
        // sólo cambia el estado, el resto de la fila se conserva
        assert_eq!(cancelled.status, OperationStatus::Cancelled);
        assert_eq!(cancelled.progress.total, 7);
        assert!(cancelled.finished_at.is_some());

        assert!(matches!(
            store
                .transition(&op.id, OperationStatus::Pending, OperationStatus::Processing)
                .await,
            Err(StoreError::Immutable(_))
        ));

        let other = self::op();
        store.create_operation(&other).await.unwrap();
        store
            .transition(&other.id, OperationStatus::Pending, OperationStatus::Processing)
            .await
            .unwrap();
        assert!(matches!(
            store
                .transition(&other.id, OperationStatus::Pending, OperationStatus::Cancelled)
                .await,
            Err(StoreError::Conflict {
                found: OperationStatus::Processing,
                ..
            })
        ));
    }
}
