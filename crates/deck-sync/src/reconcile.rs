//! Chooses between rebuilding the instance table and patching it in place.

use crate::dirty::DirtyGuard;
use crate::hierarchy::{self, EntityNode};
use crate::order;
use deck_core::{ActionAvailability, Entity, InstanceStatus, Snapshot};

/// One rendered row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub id: String,
    /// 0 for roots, 1 for satellites.
    pub level: usize,
    pub status: InstanceStatus,
    pub display_port: Option<u16>,
    pub actions: ActionAvailability,
    /// Last accepted copy of the entity, source of every derived field.
    pub entity: Entity,
}

impl RowView {
    fn new(entity: &Entity, level: usize) -> Self {
        Self {
            id: entity.id.clone(),
            level,
            status: entity.status.clone(),
            display_port: entity.display_port(),
            actions: entity.actions(),
            entity: entity.clone(),
        }
    }

    pub fn is_satellite(&self) -> bool {
        self.level > 0
    }
}

/// Status-derived update for a row that must keep its editable values.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPatch {
    pub id: String,
    pub status: InstanceStatus,
    pub actions: ActionAvailability,
}

impl RowPatch {
    fn from_entity(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            status: entity.status.clone(),
            actions: entity.actions(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderPlan {
    FullRebuild(Vec<EntityNode>),
    PartialPatch(Vec<RowPatch>),
    Skip,
}

impl RenderPlan {
    pub fn kind(&self) -> &'static str {
        match self {
            RenderPlan::FullRebuild(_) => "full_rebuild",
            RenderPlan::PartialPatch(_) => "partial_patch",
            RenderPlan::Skip => "skip",
        }
    }
}

/// Rendered state of the instance table.
#[derive(Debug, Clone, Default)]
pub struct TableView {
    rows: Vec<RowView>,
    empty_notice: bool,
    rebuilds: u64,
}

impl TableView {
    pub fn rows(&self) -> &[RowView] {
        &self.rows
    }

    pub fn row(&self, id: &str) -> Option<&RowView> {
        self.rows.iter().find(|row| row.id == id)
    }

    /// True while the "no instances" row is shown.
    pub fn shows_empty_notice(&self) -> bool {
        self.empty_notice
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn root_ids(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter(|row| row.level == 0)
            .map(|row| row.id.clone())
            .collect()
    }

    /// Regroups rendered roots (with their satellites) into `order`.
    pub fn reorder_roots(&mut self, order: &[String]) {
        let mut groups: Vec<Vec<RowView>> = Vec::new();
        for row in self.rows.drain(..) {
            match groups.last_mut() {
                Some(group) if row.level > 0 => group.push(row),
                _ => groups.push(vec![row]),
            }
        }
        let rank = |group: &Vec<RowView>| {
            group
                .first()
                .and_then(|root| order.iter().position(|id| *id == root.id))
                .unwrap_or(usize::MAX)
        };
        groups.sort_by_key(|group| rank(group));
        self.rows = groups.into_iter().flatten().collect();
    }

    pub fn set_empty_notice(&mut self, shown: bool) {
        self.empty_notice = shown;
    }
}

/// Decides how the next snapshot reaches the table. Reads the guard at call
/// time, so call it after the fetch resolved.
pub fn plan(guard: &DirtyGuard, snapshot: &Snapshot, stored_order: &[String]) -> RenderPlan {
    if guard.placeholder_focused() {
        return RenderPlan::Skip;
    }
    if guard.any_dirty() {
        return RenderPlan::PartialPatch(
            snapshot
                .entities()
                .iter()
                .map(RowPatch::from_entity)
                .collect(),
        );
    }
    let tree = hierarchy::build(snapshot.entities());
    RenderPlan::FullRebuild(order::sort_roots(tree, stored_order))
}

/// Applies a plan. A partial patch only touches status and action enablement
/// of rows already on screen: it never inserts, removes, or reorders rows,
/// and leaves editable values such as the port alone.
pub fn apply(view: &mut TableView, guard: &mut DirtyGuard, plan: RenderPlan) {
    match plan {
        RenderPlan::Skip => {}
        RenderPlan::PartialPatch(patches) => {
            for patch in patches {
                let Some(row) = view.rows.iter_mut().find(|row| row.id == patch.id) else {
                    continue;
                };
                row.status = patch.status.clone();
                row.actions = patch.actions;
                row.entity.status = patch.status.clone();
                guard.observe_status(&patch.id, &patch.status);
            }
        }
        RenderPlan::FullRebuild(tree) => {
            let mut rows = Vec::new();
            let mut entities = Vec::new();
            for node in &tree {
                rows.push(RowView::new(&node.entity, 0));
                entities.push(node.entity.clone());
                for child in &node.children {
                    rows.push(RowView::new(child, 1));
                    entities.push(child.clone());
                }
            }
            guard.accept_snapshot(&entities);
            view.empty_notice = tree.is_empty() && guard.placeholder().is_none();
            view.rows = rows;
            view.rebuilds += 1;
        }
    }
}
