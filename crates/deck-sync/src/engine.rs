//! The synchronization engine: one instance table, its dirty guard and the
//! persisted root order, fed by snapshots from the poll loop.

use crate::dirty::{DirtyGuard, FieldEdit};
use crate::order::{self, OrderStore};
use crate::reconcile::{self, TableView};
use crate::scheduler::CycleOutcome;
use deck_core::{normalize_snapshot, Entity, GpuSet, NormalizeReport};
use deck_storage::StorageError;
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileSummary {
    pub plan: &'static str,
    pub outcome: CycleOutcome,
    pub report: NormalizeReport,
}

pub struct SyncEngine<S: OrderStore> {
    view: TableView,
    guard: DirtyGuard,
    order: S,
}

impl<S: OrderStore> SyncEngine<S> {
    pub fn new(order: S) -> Self {
        Self {
            view: TableView::default(),
            guard: DirtyGuard::new(),
            order,
        }
    }

    pub fn view(&self) -> &TableView {
        &self.view
    }

    pub fn guard(&self) -> &DirtyGuard {
        &self.guard
    }

    pub fn guard_mut(&mut self) -> &mut DirtyGuard {
        &mut self.guard
    }

    pub fn order_store(&self) -> &S {
        &self.order
    }

    /// The poll loop checks this before fetching.
    pub fn should_skip(&self) -> bool {
        self.guard.placeholder_focused()
    }

    /// Normalizes raw records and renders them. The plan is chosen from the
    /// guard as it is now, not as it was when the fetch started.
    pub fn reconcile(&mut self, records: Vec<Value>) -> ReconcileSummary {
        let (snapshot, report) = normalize_snapshot(records);
        let stored = self.order.load();
        let plan = reconcile::plan(&self.guard, &snapshot, &stored);
        let kind = plan.kind();
        let outcome = if matches!(plan, reconcile::RenderPlan::Skip) {
            CycleOutcome::Skipped
        } else {
            CycleOutcome::Reconciled {
                any_transitional: snapshot.any_transitional(),
            }
        };
        reconcile::apply(&mut self.view, &mut self.guard, plan);
        info!(
            event = "snapshot_reconciled",
            plan = kind,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            rows = self.view.rows().len()
        );
        ReconcileSummary {
            plan: kind,
            outcome,
            report,
        }
    }

    pub fn apply_input(&mut self, id: &str, edit: &FieldEdit) -> bool {
        self.guard.apply_input(id, edit)
    }

    /// Drops unsaved edits of one row.
    pub fn discard(&mut self, id: &str) {
        self.guard.clear_dirty(id);
        debug!(event = "row_edits_discarded", instance = id);
    }

    /// Adopts the server copy returned by a save.
    pub fn commit_saved(&mut self, entity: &Entity) {
        self.guard.commit(entity);
    }

    /// Opens the placeholder row with `gpus` preselected.
    pub fn open_placeholder(&mut self, gpus: GpuSet) -> bool {
        let opened = self.guard.open_placeholder(gpus);
        if opened {
            self.view.set_empty_notice(false);
        }
        opened
    }

    pub fn cancel_placeholder(&mut self) {
        if self.guard.cancel_placeholder().is_some() && self.view.rows().is_empty() {
            self.view.set_empty_notice(true);
        }
    }

    pub fn focus_placeholder(&mut self, focused: bool) {
        self.guard.set_placeholder_focus(focused);
    }

    /// Moves a root row and persists the resulting order. Returns whether
    /// anything moved.
    pub fn move_root(&mut self, id: &str, delta: isize) -> Result<bool, StorageError> {
        let current = order::merge_order(&self.order.load(), &self.view.root_ids());
        let Some(next) = order::move_root(&current, id, delta) else {
            return Ok(false);
        };
        self.order.save(&next)?;
        self.view.reorder_roots(&next);
        debug!(event = "root_moved", instance = id, delta);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::Field;
    use crate::order::MemoryOrderStore;
    use serde_json::json;

    fn records(value: Value) -> Vec<Value> {
        value.as_array().cloned().unwrap_or_default()
    }

    #[test]
    fn transitional_snapshot_reports_fast_outcome() {
        let mut engine = SyncEngine::new(MemoryOrderStore::default());
        let summary = engine.reconcile(records(json!([
            {"id": "a", "name": "a", "status": "installing"},
            "garbage"
        ])));
        assert_eq!(summary.plan, "full_rebuild");
        assert_eq!(
            summary.outcome,
            CycleOutcome::Reconciled {
                any_transitional: true
            }
        );
        assert_eq!(summary.report.accepted, 1);
        assert_eq!(summary.report.rejected.len(), 1);
    }

    #[test]
    fn focused_placeholder_skips_and_cancel_restores_empty_notice() {
        let mut engine = SyncEngine::new(MemoryOrderStore::default());
        engine.reconcile(Vec::new());
        assert!(engine.view().shows_empty_notice());

        assert!(engine.open_placeholder(GpuSet::from_csv("1")));
        assert!(!engine.view().shows_empty_notice());
        engine.focus_placeholder(true);
        assert!(engine.should_skip());
        assert_eq!(engine.reconcile(Vec::new()).outcome, CycleOutcome::Skipped);

        engine.cancel_placeholder();
        assert!(!engine.should_skip());
        assert!(engine.view().shows_empty_notice());
    }

    #[test]
    fn move_root_persists_and_reorders() {
        let store = MemoryOrderStore::default();
        let mut engine = SyncEngine::new(store.clone());
        engine.reconcile(records(json!([{"id": "a"}, {"id": "b"}, {"id": "c"}])));

        assert!(engine.move_root("c", -1).expect("saved"));
        assert_eq!(engine.view().root_ids(), vec!["a", "c", "b"]);
        assert_eq!(store.load(), vec!["a", "c", "b"]);
        assert!(!engine.move_root("a", -1).expect("no-op"));
        assert!(!engine.move_root("missing", 1).expect("unknown id"));
    }

    #[test]
    fn discard_makes_row_clean_again() {
        let mut engine = SyncEngine::new(MemoryOrderStore::default());
        engine.reconcile(records(json!([{"id": "a", "name": "alpha"}])));
        assert!(engine.apply_input("a", &FieldEdit::Text(Field::Name, "beta".into())));
        engine.discard("a");
        assert!(!engine.guard().any_dirty());
        assert_eq!(engine.guard().draft("a").map(|d| d.name.as_str()), Some("alpha"));
    }
}
