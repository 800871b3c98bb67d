use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::operation::{OperationId, Progress};
use crate::record::RecordOutcome;

const SUCCESS_UNIT: u64 = 1 << 32;
const FAILED_MASK: u64 = 0xFFFF_FFFF;

/// Contexto vivo de una operación en ejecución. Se comparte (Arc) con cada worker.
///
/// - `slots`: arena de resultados, uno por registro, de escritura única.
/// - `counters`: exitosos (32 bits altos) y fallidos (32 bits bajos) en una sola
///   palabra atómica, así cualquier lectura ve processed == successful + failed.
/// - `cancelled`: bandera cooperativa que el pool revisa antes de despachar.
#[derive(Debug)]
pub struct OperationContext {
    operation_id: OperationId,
    slots: Vec<OnceLock<RecordOutcome>>,
    // record_index -> posición en slots
    positions: HashMap<usize, usize>,
    counters: AtomicU64,
    cancelled: AtomicBool,
}

impl OperationContext {
    /// Crea el contexto con un slot por cada índice de registro de la entrada.
    pub fn new(operation_id: impl Into<OperationId>, record_indices: &[usize]) -> Self {
        let positions = record_indices
            .iter()
            .enumerate()
            .map(|(slot, idx)| (*idx, slot))
            .collect();

        Self {
            operation_id: operation_id.into(),
            slots: (0..record_indices.len()).map(|_| OnceLock::new()).collect(),
            positions,
            counters: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn total(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Registra el resultado de un registro. Devuelve false si el índice no
    /// pertenece a la operación o si ya tenía resultado (no se sobrescribe).
    pub fn record(&self, outcome: RecordOutcome) -> bool {
        let Some(&slot) = self.positions.get(&outcome.record_index) else {
            return false;
        };
        let unit = if outcome.is_success() { SUCCESS_UNIT } else { 1 };
        if self.slots[slot].set(outcome).is_err() {
            return false;
        }
        self.counters.fetch_add(unit, Ordering::AcqRel);
        true
    }

    pub fn is_recorded(&self, record_index: usize) -> bool {
        self.positions
            .get(&record_index)
            .map(|&slot| self.slots[slot].get().is_some())
            .unwrap_or(false)
    }

    /// Foto consistente de los contadores, sin bloquear a los workers.
    pub fn snapshot(&self) -> Progress {
        let packed = self.counters.load(Ordering::Acquire);
        let successful = (packed >> 32) as u32;
        let failed = (packed & FAILED_MASK) as u32;
        Progress {
            total: self.total(),
            processed: successful + failed,
            successful,
            failed,
        }
    }

    /// Pide la cancelación. Devuelve true sólo la primera vez.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resultados escritos hasta ahora, en el orden de la entrada.
    pub fn outcomes(&self) -> Vec<RecordOutcome> {
        self.slots.iter().filter_map(|s| s.get().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ErrorKind;
    use std::sync::Arc;

    #[test]
    fn cuenta_exitos_y_fallos() {
        let ctx = OperationContext::new("op", &[0, 1, 2, 3]);
        assert!(ctx.record(RecordOutcome::success(0, "f-0".into(), 1)));
        assert!(ctx.record(RecordOutcome::failure(2, ErrorKind::Validation, "x", 0)));

        let p = ctx.snapshot();
        assert_eq!(p.total, 4);
        assert_eq!(p.processed, 2);
        assert_eq!(p.successful, 1);
        assert_eq!(p.failed, 1);
        assert!(ctx.is_recorded(0));
        assert!(!ctx.is_recorded(1));
    }

    #[test]
    fn un_slot_no_se_escribe_dos_veces() {
        let ctx = OperationContext::new("op", &[5]);
        assert!(ctx.record(RecordOutcome::success(5, "a".into(), 1)));
        assert!(!ctx.record(RecordOutcome::failure(5, ErrorKind::Permanent, "dup", 1)));
        // índice ajeno a la operación
        assert!(!ctx.record(RecordOutcome::success(6, "b".into(), 1)));

        let p = ctx.snapshot();
        assert_eq!((p.processed, p.successful, p.failed), (1, 1, 0));
        assert_eq!(ctx.outcomes()[0].created_farmer_id.as_deref(), Some("a"));
    }

    #[test]
    fn indices_no_contiguos_de_un_reintento() {
        let ctx = OperationContext::new("retry", &[3, 7, 11]);
        assert_eq!(ctx.total(), 3);
        assert!(ctx.record(RecordOutcome::success(11, "x".into(), 1)));
        assert!(ctx.record(RecordOutcome::success(3, "y".into(), 1)));

        let idx: Vec<usize> = ctx.outcomes().iter().map(|o| o.record_index).collect();
        assert_eq!(idx, vec![3, 11]);
    }

    #[test]
    fn cancelar_es_idempotente() {
        let ctx = OperationContext::new("op", &[0]);
        assert!(!ctx.is_cancelled());
        assert!(ctx.cancel());
        assert!(!ctx.cancel());
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn lecturas_concurrentes_siempre_ven_invariantes() {
        let total = 2_000usize;
        let indices: Vec<usize> = (0..total).collect();
        let ctx = Arc::new(OperationContext::new("op", &indices));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    for i in (w..total).step_by(4) {
                        let outcome = if i % 3 == 0 {
                            RecordOutcome::failure(i, ErrorKind::Transient, "t", 3)
                        } else {
                            RecordOutcome::success(i, format!("f-{i}"), 1)
                        };
                        ctx.record(outcome);
                    }
                })
            })
            .collect();

        let reader = {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                loop {
                    let p = ctx.snapshot();
                    assert_eq!(p.processed, p.successful + p.failed);
                    assert!(p.processed <= p.total);
                    assert!(p.processed >= last, "el avance no puede retroceder");
                    last = p.processed;
                    if p.processed == p.total {
                        break;
                    }
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        let p = ctx.snapshot();
        assert_eq!(p.processed as usize, total);
        assert_eq!(p.failed as usize, (0..total).filter(|i| i % 3 == 0).count());
    }
}
