use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use crate::authz::{self, Caller, PermissionChecker};
use crate::config::PipelineConfig;
use crate::error::{OperationError, StoreError};
use crate::export;
use crate::farmer::FarmerCreator;
use crate::operation::{BulkOperation, OperationId, OperationStatus, ProcessingMode};
use crate::parser;
use crate::pool::{commit_outcome, PoolSettings, WorkerPool};
use crate::progress::OperationContext;
use crate::record::{ErrorKind, ParsedRecord, RecordOutcome};
use crate::requests::{
    resolve_payload, CancelResponse, ExportFormat, OperationDescriptor, RetryRequest,
    StartOperationRequest, StatusView, ValidateRequest,
};
use crate::store::OperationStore;
use crate::validator::{self, ValidationReport};

/// Estrategia de ejecución, resuelta una sola vez por operación.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecutionPlan {
    /// el caller espera hasta el estado terminal
    Inline,
    /// tarea en segundo plano, todo el lote en un solo pool
    Background,
    /// tarea en segundo plano, sub-lotes secuenciales
    Chunked { chunk_size: usize },
}

impl ExecutionPlan {
    fn resolve(op: &BulkOperation, config: &PipelineConfig) -> Self {
        match op.processing_mode {
            ProcessingMode::Synchronous => ExecutionPlan::Inline,
            ProcessingMode::Asynchronous => ExecutionPlan::Background,
            ProcessingMode::ChunkedBatch => ExecutionPlan::Chunked {
                chunk_size: op.options.chunk_size.unwrap_or(config.chunk_size).max(1),
            },
        }
    }
}

/// Coordinador de las operaciones de carga masiva. Es el único componente que
/// cambia el estado de una operación.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn OperationStore>,
    authz: Arc<dyn PermissionChecker>,
    creator: Arc<dyn FarmerCreator>,
    config: PipelineConfig,
    // operaciones en ejecución en este proceso
    active: Arc<Mutex<HashMap<OperationId, Arc<OperationContext>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn OperationStore>,
        authz: Arc<dyn PermissionChecker>,
        creator: Arc<dyn FarmerCreator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            authz,
            creator,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /* ---------------- inicio ---------------- */

    /// Crea la operación (PENDING, persistida), parsea, autoriza y la pone a correr
    /// según el modo pedido. Los errores de formato y autorización se devuelven aquí.
    pub async fn start(
        &self,
        caller: &Caller,
        req: StartOperationRequest,
    ) -> Result<OperationDescriptor, OperationError> {
        if req.fpo_org_id.trim().is_empty() {
            return Err(OperationError::InvalidRequest(
                "fpo_org_id es obligatorio".to_string(),
            ));
        }
        let (format, payload) = resolve_payload(req.input_format, req.data, req.farmers)?;

        let mut op = BulkOperation::new(
            req.fpo_org_id,
            caller.subject.clone(),
            format,
            req.processing_mode,
            req.options,
        );
        self.store.create_operation(&op).await?;
        info!(
            "operación {} creada (fpo={}, formato={:?}, modo={:?}, por={})",
            op.id, op.fpo_org_id, op.input_format, op.processing_mode, op.requested_by
        );

        let records = match parser::parse_all(&payload, format, self.config.max_records) {
            Ok(records) => records,
            Err(e) => {
                warn!("operación {}: entrada no parseable: {}", op.id, e);
                self.fail(&mut op, e.to_string()).await;
                return Err(OperationError::from(e).with_operation_id(&op.id));
            }
        };

        op.progress.total = records.len() as u32;
        match self.persist_input(&op, &records).await {
            Ok(()) => {}
            Err(StoreError::Immutable(_)) => {
                let current = self.load(&op.id).await?;
                return Ok(OperationDescriptor::from_operation(&current, None));
            }
            Err(e) => {
                self.fail(&mut op, format!("no se pudo guardar la entrada: {e}")).await;
                return Err(e.into());
            }
        }

        self.admit(caller, op, records).await
    }

    /// Autoriza y despacha una operación ya parseada (nueva o de reintento).
    async fn admit(
        &self,
        caller: &Caller,
        mut op: BulkOperation,
        records: Vec<ParsedRecord>,
    ) -> Result<OperationDescriptor, OperationError> {
        if let Err(e) = authz::authorize_bulk_create(self.authz.as_ref(), caller, &op.fpo_org_id).await {
            self.fail(&mut op, e.to_string()).await;
            return Err(e.with_operation_id(&op.id));
        }

        let indices: Vec<usize> = records.iter().map(|r| r.index).collect();
        let ctx = Arc::new(OperationContext::new(op.id.clone(), &indices));

        // el contexto queda visible antes de que la fila pase a PROCESSING:
        // una cancelación que vea PROCESSING siempre encuentra la bandera
        self.register(ctx.clone());
        let op = match self
            .store
            .transition(&op.id, OperationStatus::Pending, OperationStatus::Processing)
            .await
        {
            Ok(op) => op,
            Err(StoreError::Immutable(_)) | Err(StoreError::Conflict { .. }) => {
                // cancelada mientras estaba en PENDING: no se ejecuta nada
                self.unregister(&op.id);
                info!("operación {} cancelada antes de empezar", op.id);
                let current = self.load(&op.id).await?;
                return Ok(OperationDescriptor::from_operation(&current, None));
            }
            Err(e) => {
                self.unregister(&op.id);
                self.fail(&mut op, format!("no se pudo iniciar: {e}")).await;
                return Err(e.into());
            }
        };

        let plan = ExecutionPlan::resolve(&op, &self.config);
        info!(
            "operación {} en PROCESSING: {} registros, plan {:?}",
            op.id,
            ctx.total(),
            plan
        );

        match plan {
            ExecutionPlan::Inline => {
                let id = op.id.clone();
                let finished = self.run_guarded(op, records, ctx, plan).await;
                let finished = match finished {
                    Some(op) => op,
                    None => self.load(&id).await?,
                };
                let outcomes = self.store.list_outcomes(&id).await?;
                Ok(OperationDescriptor::from_operation(&finished, Some(outcomes)))
            }
            ExecutionPlan::Background | ExecutionPlan::Chunked { .. } => {
                let mut descriptor = OperationDescriptor::from_operation(&op, None);
                descriptor.progress = ctx.snapshot();
                self.spawn_execution(op, records, ctx, plan);
                Ok(descriptor)
            }
        }
    }

    fn spawn_execution(
        &self,
        op: BulkOperation,
        records: Vec<ParsedRecord>,
        ctx: Arc<OperationContext>,
        plan: ExecutionPlan,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            this.run_guarded(op, records, ctx, plan).await;
        });
    }

    /// Ejecuta en su propia tarea para que un panic del motor deje la operación
    /// en FAILED en vez de colgarla en PROCESSING.
    async fn run_guarded(
        &self,
        op: BulkOperation,
        records: Vec<ParsedRecord>,
        ctx: Arc<OperationContext>,
        plan: ExecutionPlan,
    ) -> Option<BulkOperation> {
        let id = op.id.clone();
        let this = self.clone();
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { this.execute(op, records, task_ctx, plan).await });

        match handle.await {
            Ok(op) => Some(op),
            Err(e) => {
                error!("operación {}: la ejecución terminó con error: {:?}", id, e);
                self.abort(&id, &ctx, "falla interna durante la ejecución").await;
                None
            }
        }
    }

    /// Valida, pre-clasifica los inválidos y ejecuta los válidos en el pool.
    async fn execute(
        &self,
        mut op: BulkOperation,
        records: Vec<ParsedRecord>,
        ctx: Arc<OperationContext>,
        plan: ExecutionPlan,
    ) -> BulkOperation {
        let batch = validator::validate_batch(&records);
        info!(
            "operación {}: validación {} válidos / {} inválidos",
            op.id, batch.report.valid_records, batch.report.invalid_records
        );

        for index in batch.report.errors.keys() {
            if ctx.is_recorded(*index) {
                continue;
            }
            let detail = batch.report.detail(*index).unwrap_or_default();
            let outcome = RecordOutcome::failure(*index, ErrorKind::Validation, detail, 0);
            commit_outcome(&ctx, self.store.as_ref(), outcome).await;
        }

        // al reanudar, lo que ya tiene resultado no se vuelve a crear
        let eligible: Vec<_> = batch
            .eligible
            .into_iter()
            .filter(|(idx, _)| !ctx.is_recorded(*idx))
            .collect();

        let pool = WorkerPool::new(
            PoolSettings::from_config(&self.config, op.options.max_concurrency),
            self.creator.clone(),
            self.store.clone(),
        );

        match plan {
            ExecutionPlan::Inline | ExecutionPlan::Background => {
                pool.run(&ctx, &op.fpo_org_id, eligible).await;
            }
            ExecutionPlan::Chunked { chunk_size } => {
                let mut rest = eligible.into_iter();
                let mut chunk_no = 0usize;
                loop {
                    let chunk: Vec<_> = rest.by_ref().take(chunk_size).collect();
                    if chunk.is_empty() || ctx.is_cancelled() {
                        break;
                    }
                    chunk_no += 1;
                    pool.run(&ctx, &op.fpo_org_id, chunk).await;

                    // avance persistido entre sub-lotes
                    op.progress = ctx.snapshot();
                    if let Err(e) = self.store.update_operation(&op).await {
                        warn!("operación {}: no se pudo guardar el avance: {}", op.id, e);
                    }
                    info!(
                        "operación {}: sub-lote {} terminado ({}/{})",
                        op.id, chunk_no, op.progress.processed, op.progress.total
                    );
                }
            }
        }

        self.finish(op, &ctx).await
    }

    async fn finish(&self, mut op: BulkOperation, ctx: &OperationContext) -> BulkOperation {
        op.progress = ctx.snapshot();
        let next = if ctx.is_cancelled() {
            OperationStatus::Cancelled
        } else {
            if op.progress.processed < op.progress.total {
                warn!(
                    "operación {} termina con {}/{} registros procesados",
                    op.id, op.progress.processed, op.progress.total
                );
            }
            OperationStatus::Completed
        };

        if op.advance(next) {
            if let Err(e) = self.store.update_operation(&op).await {
                error!("operación {}: no se pudo guardar el estado final: {}", op.id, e);
            }
        }
        self.unregister(&op.id);

        info!(
            "operación {} terminó en {:?}: total={}, ok={}, fallidos={}",
            op.id, op.status, op.progress.total, op.progress.successful, op.progress.failed
        );
        op
    }

    /// Falla de nivel operación (formato, autorización, store). No hay resultados por registro.
    async fn fail(&self, op: &mut BulkOperation, reason: String) {
        op.error = Some(reason);
        if !op.advance(OperationStatus::Failed) {
            return;
        }
        if let Err(e) = self.store.update_operation(op).await {
            error!("operación {}: no se pudo marcar FAILED: {}", op.id, e);
        }
    }

    async fn abort(&self, id: &str, ctx: &OperationContext, reason: &str) {
        self.unregister(id);
        match self.store.get_operation(id).await {
            Ok(Some(mut op)) if !op.status.is_terminal() => {
                op.progress = ctx.snapshot();
                self.fail(&mut op, reason.to_string()).await;
            }
            Ok(_) => {}
            Err(e) => error!("operación {}: no se pudo leer para abortar: {}", id, e),
        }
    }

    async fn persist_input(&self, op: &BulkOperation, records: &[ParsedRecord]) -> Result<(), StoreError> {
        self.store.save_input(&op.id, records).await?;
        self.store.update_operation(op).await
    }

    /* ---------------- consultas ---------------- */

    async fn load(&self, id: &str) -> Result<BulkOperation, OperationError> {
        self.store
            .get_operation(id)
            .await?
            .ok_or_else(|| OperationError::NotFound(id.to_string()))
    }

    /// Fila completa con el avance vivo si la operación está corriendo aquí.
    pub async fn get_operation(&self, id: &str) -> Result<BulkOperation, OperationError> {
        let mut op = self.load(id).await?;
        if !op.status.is_terminal() {
            if let Some(ctx) = self.active_context(id) {
                op.progress = ctx.snapshot();
            }
        }
        Ok(op)
    }

    pub async fn get_status(&self, id: &str) -> Result<StatusView, OperationError> {
        let mut op = self.load(id).await?;
        let mut cancel_requested = op.status == OperationStatus::Cancelled;
        if !op.status.is_terminal() {
            if let Some(ctx) = self.active_context(id) {
                op.progress = ctx.snapshot();
                cancel_requested = ctx.is_cancelled();
            }
        }

        Ok(StatusView {
            id: op.id,
            status: op.status,
            percentage: op.progress.percentage(),
            progress: op.progress,
            cancel_requested,
            started_at: op.started_at,
            finished_at: op.finished_at,
            error: op.error,
        })
    }

    pub async fn outcomes(&self, id: &str) -> Result<Vec<RecordOutcome>, OperationError> {
        self.load(id).await?;
        Ok(self.store.list_outcomes(id).await?)
    }

    /* ---------------- cancelación ---------------- */

    pub async fn cancel(&self, id: &str) -> Result<CancelResponse, OperationError> {
        let op = self.load(id).await?;
        if op.status.is_terminal() {
            return Err(OperationError::AlreadyComplete(id.to_string()));
        }

        if let Some(ctx) = self.active_context(id) {
            if ctx.cancel() {
                info!(
                    "operación {}: cancelación solicitada con {}/{} procesados",
                    id,
                    ctx.snapshot().processed,
                    ctx.total()
                );
            }
            return Ok(CancelResponse {
                id: op.id,
                status: op.status,
                cancel_requested: true,
            });
        }

        // sin ejecución en curso (todavía en PENDING): se cancela directo,
        // sólo si la fila sigue en PENDING
        match self
            .store
            .transition(id, OperationStatus::Pending, OperationStatus::Cancelled)
            .await
        {
            Ok(op) => {
                info!("operación {} cancelada sin ejecución en curso", id);
                Ok(CancelResponse {
                    id: op.id,
                    status: op.status,
                    cancel_requested: true,
                })
            }
            Err(StoreError::Immutable(_)) => Err(OperationError::AlreadyComplete(id.to_string())),
            Err(StoreError::Conflict { found, .. }) => {
                // empezó a ejecutarse entre la lectura y la escritura
                match self.active_context(id) {
                    Some(ctx) => {
                        ctx.cancel();
                        info!("operación {}: cancelación solicitada al iniciar", id);
                        Ok(CancelResponse {
                            id: id.to_string(),
                            status: found,
                            cancel_requested: true,
                        })
                    }
                    None => Err(OperationError::AlreadyComplete(id.to_string())),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /* ---------------- reintento ---------------- */

    /// Crea una operación nueva con los registros fallidos (todos o un subconjunto).
    /// La operación original no se modifica.
    pub async fn retry_failed(
        &self,
        caller: &Caller,
        id: &str,
        req: RetryRequest,
    ) -> Result<OperationDescriptor, OperationError> {
        let parent = self.load(id).await?;
        if !parent.status.is_terminal() {
            return Err(OperationError::NotRetryable {
                id: id.to_string(),
                reason: "la operación todavía está en ejecución".to_string(),
            });
        }

        let failed: BTreeSet<usize> = self
            .store
            .list_outcomes(id)
            .await?
            .into_iter()
            .filter(|o| !o.is_success())
            .map(|o| o.record_index)
            .collect();

        let targets = match req.selection()? {
            None => failed,
            Some(wanted) => {
                let not_failed: Vec<String> = wanted
                    .difference(&failed)
                    .map(|i| i.to_string())
                    .collect();
                if !not_failed.is_empty() {
                    return Err(OperationError::InvalidRequest(format!(
                        "los registros {} no fallaron en la operación {}",
                        not_failed.join(", "),
                        id
                    )));
                }
                wanted
            }
        };
        if targets.is_empty() {
            return Err(OperationError::NotRetryable {
                id: id.to_string(),
                reason: "no hay registros fallidos".to_string(),
            });
        }

        let records: Vec<ParsedRecord> = self
            .store
            .load_input(id)
            .await?
            .into_iter()
            .filter(|r| targets.contains(&r.index))
            .collect();

        let mut op = BulkOperation::new(
            parent.fpo_org_id.clone(),
            caller.subject.clone(),
            parent.input_format,
            req.processing_mode.unwrap_or(parent.processing_mode),
            req.options.unwrap_or_else(|| parent.options.clone()),
        );
        op.parent_operation_id = Some(parent.id.clone());
        op.progress.total = records.len() as u32;

        self.store.create_operation(&op).await?;
        self.store.save_input(&op.id, &records).await?;
        info!(
            "operación {} creada como reintento de {} con {} registros",
            op.id,
            parent.id,
            records.len()
        );

        self.admit(caller, op, records).await
    }

    /* ---------------- export y validación ---------------- */

    pub async fn export(
        &self,
        id: &str,
        format: ExportFormat,
        include_all: bool,
    ) -> Result<Vec<u8>, OperationError> {
        self.load(id).await?;
        let outcomes = self.store.list_outcomes(id).await?;
        let input = match self.store.load_input(id).await {
            Ok(input) => input,
            // operaciones que fallaron al parsear no tienen entrada guardada
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        export::export_outcomes(&outcomes, &input, format, include_all)
    }

    /// Parsea y valida sin crear operación ni ejecutar nada.
    pub async fn validate_only(
        &self,
        caller: &Caller,
        req: ValidateRequest,
    ) -> Result<ValidationReport, OperationError> {
        let (format, payload) = resolve_payload(req.input_format, req.data, req.farmers)?;
        authz::authorize_bulk_create(self.authz.as_ref(), caller, &req.fpo_org_id).await?;
        let records = parser::parse_all(&payload, format, self.config.max_records)?;
        Ok(validator::validate_batch(&records).report)
    }

    /* ---------------- recuperación ---------------- */

    /// Revisa las operaciones que quedaron sin terminar tras un reinicio:
    /// las PENDING pasan a FAILED y las PROCESSING se reanudan en segundo plano
    /// saltando los registros que ya tienen resultado.
    pub async fn recover(&self) -> Result<usize, OperationError> {
        let mut resumed = 0usize;

        for mut op in self.store.list_operations().await? {
            match op.status {
                OperationStatus::Pending => {
                    warn!("operación {} quedó en PENDING tras reinicio, se marca FAILED", op.id);
                    self.fail(&mut op, "interrumpida antes de iniciar la ejecución".to_string())
                        .await;
                }
                OperationStatus::Processing => {
                    if self.active_context(&op.id).is_some() {
                        continue;
                    }
                    let records = match self.store.load_input(&op.id).await {
                        Ok(records) => records,
                        Err(e) => {
                            warn!("operación {}: sin entrada para reanudar: {}", op.id, e);
                            self.fail(&mut op, "entrada no disponible para reanudar".to_string())
                                .await;
                            continue;
                        }
                    };

                    let indices: Vec<usize> = records.iter().map(|r| r.index).collect();
                    let ctx = Arc::new(OperationContext::new(op.id.clone(), &indices));
                    for outcome in self.store.list_outcomes(&op.id).await? {
                        ctx.record(outcome);
                    }

                    let plan = match ExecutionPlan::resolve(&op, &self.config) {
                        // el caller síncrono ya no está esperando
                        ExecutionPlan::Inline => ExecutionPlan::Background,
                        other => other,
                    };
                    info!(
                        "reanudando operación {} desde {}/{}",
                        op.id,
                        ctx.snapshot().processed,
                        ctx.total()
                    );
                    self.register(ctx.clone());
                    self.spawn_execution(op, records, ctx, plan);
                    resumed += 1;
                }
                _ => {}
            }
        }

        Ok(resumed)
    }

    /* ---------------- contextos activos ---------------- */

    fn lock_active(&self) -> MutexGuard<'_, HashMap<OperationId, Arc<OperationContext>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, ctx: Arc<OperationContext>) {
        self.lock_active()
            .insert(ctx.operation_id().to_string(), ctx);
    }

    fn unregister(&self, id: &str) {
        self.lock_active().remove(id);
    }

    fn active_context(&self, id: &str) -> Option<Arc<OperationContext>> {
        self.lock_active().get(id).cloned()
    }

    /// Cantidad de operaciones ejecutándose en este proceso.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }
}
