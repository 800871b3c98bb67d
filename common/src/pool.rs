use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::CreateError;
use crate::farmer::FarmerCreator;
use crate::progress::OperationContext;
use crate::record::{ErrorKind, FarmerInput, RecordOutcome};
use crate::store::OperationStore;

/// Parámetros efectivos de una corrida del pool.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub record_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &PipelineConfig, max_concurrency: Option<usize>) -> Self {
        Self {
            max_concurrency: max_concurrency.unwrap_or(config.max_concurrency).max(1),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: config.retry_backoff,
            record_timeout: config.record_timeout,
        }
    }
}

/// Resumen de una corrida.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolRun {
    pub dispatched: usize,
    /// registros que no se despacharon por cancelación
    pub skipped: usize,
}

/// Pool de workers: ejecuta la creación de cada registro en su propia tarea,
/// con un máximo de `max_concurrency` en vuelo. La falla de un registro no
/// afecta a los demás.
#[derive(Clone)]
pub struct WorkerPool {
    settings: PoolSettings,
    creator: Arc<dyn FarmerCreator>,
    store: Arc<dyn OperationStore>,
}

impl WorkerPool {
    pub fn new(
        settings: PoolSettings,
        creator: Arc<dyn FarmerCreator>,
        store: Arc<dyn OperationStore>,
    ) -> Self {
        Self {
            settings,
            creator,
            store,
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Ejecuta los registros y espera a que terminen todos los despachados.
    /// La cancelación se revisa antes de despachar cada registro.
    pub async fn run(
        &self,
        ctx: &Arc<OperationContext>,
        fpo_org_id: &str,
        records: Vec<(usize, FarmerInput)>,
    ) -> PoolRun {
        let sem = Arc::new(Semaphore::new(self.settings.max_concurrency));
        let mut tasks = JoinSet::new();
        let mut index_by_task = HashMap::new();
        let total = records.len();
        let mut dispatched = 0usize;

        for (index, farmer) in records {
            if ctx.is_cancelled() {
                break;
            }
            // Esperamos un slot libre
            let permit = match sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            // La cancelación pudo llegar mientras esperábamos el slot
            if ctx.is_cancelled() {
                drop(permit);
                break;
            }

            let ctx_cloned = ctx.clone();
            let creator = self.creator.clone();
            let store = self.store.clone();
            let settings = self.settings.clone();
            let fpo = fpo_org_id.to_string();

            let handle = tasks.spawn(async move {
                let outcome = execute_record(creator.as_ref(), &settings, &fpo, index, &farmer).await;
                commit_outcome(&ctx_cloned, store.as_ref(), outcome).await;
                // liberar el slot de concurrencia al terminar
                drop(permit);
            });
            index_by_task.insert(handle.id(), index);
            dispatched += 1;
        }

        let skipped = total - dispatched;
        if skipped > 0 {
            info!(
                "operación {}: cancelada, {} registros no se despacharon",
                ctx.operation_id(),
                skipped
            );
        }

        // Esperar a los que están en vuelo; un panic sólo afecta a su registro
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                let Some(&index) = index_by_task.get(&e.id()) else {
                    warn!("tarea sin índice terminó con error: {:?}", e);
                    continue;
                };
                warn!(
                    "operación {}: panic o join error en registro {}: {:?}",
                    ctx.operation_id(),
                    index,
                    e
                );
                let outcome = RecordOutcome::failure(
                    index,
                    ErrorKind::Permanent,
                    "error interno procesando el registro",
                    1,
                );
                commit_outcome(ctx, self.store.as_ref(), outcome).await;
            }
        }

        PoolRun {
            dispatched,
            skipped,
        }
    }
}

/// Registra el resultado en el contexto (contadores) y lo persiste una sola vez.
pub async fn commit_outcome(ctx: &OperationContext, store: &dyn OperationStore, outcome: RecordOutcome) {
    if !ctx.record(outcome.clone()) {
        debug!(
            "operación {}: el registro {} ya tenía resultado, se ignora",
            ctx.operation_id(),
            outcome.record_index
        );
        return;
    }
    if let Err(e) = store.append_outcome(ctx.operation_id(), &outcome).await {
        warn!(
            "operación {}: no se pudo persistir el resultado del registro {}: {}",
            ctx.operation_id(),
            outcome.record_index,
            e
        );
    }
}

/// Intenta crear un agricultor, reintentando fallas transitorias con backoff exponencial.
async fn execute_record(
    creator: &dyn FarmerCreator,
    settings: &PoolSettings,
    fpo_org_id: &str,
    index: usize,
    farmer: &FarmerInput,
) -> RecordOutcome {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = match timeout(settings.record_timeout, creator.create_farmer(fpo_org_id, farmer)).await {
            Ok(r) => r,
            Err(_) => Err(CreateError::Transient(format!(
                "timeout tras {:?}",
                settings.record_timeout
            ))),
        };

        match result {
            Ok(farmer_id) => {
                debug!("registro {} creado como {} (attempt={})", index, farmer_id, attempt);
                return RecordOutcome::success(index, farmer_id, attempt);
            }
            Err(e) if e.is_transient() && attempt < settings.max_attempts => {
                let backoff = settings.retry_backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "registro {}: {} (attempt={}), reintentando en {:?}",
                    index, e, attempt, backoff
                );
                sleep(backoff).await;
            }
            Err(e) => {
                let kind = if e.is_transient() {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                };
                warn!("registro {} falló: {} (attempt={})", index, e, attempt);
                return RecordOutcome::failure(index, kind, e.to_string(), attempt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::OutcomeStatus;
    use crate::store::MemoryStore;
    use crate::testing::{farmer, Behavior, ScriptedCreator};

    fn settings(max_concurrency: usize) -> PoolSettings {
        PoolSettings {
            max_concurrency,
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            record_timeout: Duration::from_millis(200),
        }
    }

    fn records(n: usize) -> Vec<(usize, FarmerInput)> {
        (0..n).map(|i| (i, farmer(i))).collect()
    }

    #[tokio::test]
    async fn fallas_aisladas_por_registro() {
        let creator = Arc::new(
            ScriptedCreator::new()
                .with(1, Behavior::Duplicate)
                .with(2, Behavior::TransientTimes(2))
                .with(3, Behavior::Panic)
                .with(4, Behavior::AlwaysTransient),
        );
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(settings(2), creator.clone(), store.clone());
        let ctx = Arc::new(OperationContext::new("op", &[0, 1, 2, 3, 4, 5]));

        let run = pool.run(&ctx, "fpo", records(6)).await;
        assert_eq!(run, PoolRun { dispatched: 6, skipped: 0 });

        let p = ctx.snapshot();
        assert_eq!((p.processed, p.successful, p.failed), (6, 3, 3));

        let outcomes = store.list_outcomes("op").await.unwrap();
        assert_eq!(outcomes.len(), 6);

        assert_eq!(outcomes[1].error_kind, Some(ErrorKind::Permanent));
        assert_eq!(outcomes[1].attempts, 1);

        assert_eq!(outcomes[2].status, OutcomeStatus::Success);
        assert_eq!(outcomes[2].attempts, 3);

        assert_eq!(outcomes[3].error_kind, Some(ErrorKind::Permanent));

        assert_eq!(outcomes[4].error_kind, Some(ErrorKind::Transient));
        assert_eq!(outcomes[4].attempts, 3);
        assert_eq!(creator.calls_for(4), 3);

        assert!(outcomes[0].is_success() && outcomes[5].is_success());
    }

    #[tokio::test]
    async fn respeta_el_limite_de_concurrencia() {
        let creator = Arc::new(ScriptedCreator::new().with_default(Behavior::Sleep(Duration::from_millis(10))));
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(settings(3), creator.clone(), store);
        let indices: Vec<usize> = (0..20).collect();
        let ctx = Arc::new(OperationContext::new("op", &indices));

        pool.run(&ctx, "fpo", records(20)).await;

        assert_eq!(ctx.snapshot().successful, 20);
        assert!(creator.max_in_flight() <= 3);
        assert!(creator.max_in_flight() >= 2);
    }

    #[tokio::test]
    async fn un_registro_trabado_no_frena_a_los_demas() {
        let creator = Arc::new(ScriptedCreator::new().with(0, Behavior::Sleep(Duration::from_secs(5))));
        let store = Arc::new(MemoryStore::new());
        let mut s = settings(2);
        s.max_attempts = 1;
        s.record_timeout = Duration::from_millis(50);
        let pool = WorkerPool::new(s, creator, store.clone());
        let indices: Vec<usize> = (0..10).collect();
        let ctx = Arc::new(OperationContext::new("op", &indices));

        pool.run(&ctx, "fpo", records(10)).await;

        let outcomes = store.list_outcomes("op").await.unwrap();
        assert_eq!(outcomes[0].error_kind, Some(ErrorKind::Transient));
        assert!(outcomes[0].error_detail.as_deref().unwrap().contains("timeout"));
        assert_eq!(ctx.snapshot().successful, 9);
    }

    #[tokio::test]
    async fn cancelado_antes_de_empezar_no_despacha_nada() {
        let creator = Arc::new(ScriptedCreator::new());
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(settings(2), creator.clone(), store.clone());
        let ctx = Arc::new(OperationContext::new("op", &[0, 1, 2]));
        ctx.cancel();

        let run = pool.run(&ctx, "fpo", records(3)).await;

        assert_eq!(run, PoolRun { dispatched: 0, skipped: 3 });
        assert_eq!(ctx.snapshot().processed, 0);
        assert_eq!(creator.total_calls(), 0);
        assert!(store.list_outcomes("op").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelar_a_mitad_termina_los_que_estan_en_vuelo() {
        let creator = Arc::new(ScriptedCreator::new().with_default(Behavior::Sleep(Duration::from_millis(5))));
        let store = Arc::new(MemoryStore::new());
        let pool = WorkerPool::new(settings(2), creator.clone(), store.clone());
        let indices: Vec<usize> = (0..40).collect();
        let ctx = Arc::new(OperationContext::new("op", &indices));

        let canceller = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while ctx.snapshot().processed < 10 {
                    sleep(Duration::from_millis(1)).await;
                }
                ctx.cancel();
                ctx.snapshot().processed
            })
        };

        let run = pool.run(&ctx, "fpo", records(40)).await;
        let seen_at_cancel = canceller.await.unwrap();

        let p = ctx.snapshot();
        assert!(run.skipped > 0);
        // todo lo despachado terminó y quedó contado
        assert_eq!(p.processed as usize, run.dispatched);
        assert_eq!(creator.total_calls(), run.dispatched);
        assert!(p.processed >= seen_at_cancel);
        // a lo sumo los que estaban en vuelo al cancelar
        assert!(run.dispatched <= seen_at_cancel as usize + 2);
    }
}
