use crate::hierarchy::EntityNode;
use deck_storage::{PrefStore, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Persisted operator preference for the order of root rows.
pub trait OrderStore {
    /// Stored ids, most preferred first. Failures degrade to an empty order.
    fn load(&self) -> Vec<String>;
    fn save(&mut self, ids: &[String]) -> Result<(), StorageError>;
}

impl OrderStore for PrefStore {
    fn load(&self) -> Vec<String> {
        match self.display_order() {
            Ok(ids) => ids,
            Err(err) => {
                warn!(event = "display_order_load_failed", error = %err);
                Vec::new()
            }
        }
    }

    fn save(&mut self, ids: &[String]) -> Result<(), StorageError> {
        self.save_display_order(ids)
    }
}

/// Order store kept in memory; clones share the same list.
#[derive(Debug, Clone, Default)]
pub struct MemoryOrderStore {
    ids: Arc<Mutex<Vec<String>>>,
}

impl MemoryOrderStore {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids: Arc::new(Mutex::new(ids)),
        }
    }
}

impl OrderStore for MemoryOrderStore {
    fn load(&self) -> Vec<String> {
        self.ids.lock().map(|ids| ids.clone()).unwrap_or_default()
    }

    fn save(&mut self, ids: &[String]) -> Result<(), StorageError> {
        if let Ok(mut stored) = self.ids.lock() {
            *stored = ids.to_vec();
        }
        Ok(())
    }
}

/// Merges the stored order with the current root ids: stored ids that are
/// still present keep their stored order, new ids follow in their current
/// order, stale ids are dropped.
pub fn merge_order(stored: &[String], current: &[String]) -> Vec<String> {
    let present: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(current.len());
    let mut merged = Vec::with_capacity(current.len());

    for id in stored {
        if present.contains(id.as_str()) && seen.insert(id.as_str()) {
            merged.push(id.clone());
        }
    }
    for id in current {
        if seen.insert(id.as_str()) {
            merged.push(id.clone());
        }
    }
    merged
}

/// Sorts root nodes by the merged order. Every root gets a distinct rank.
pub fn sort_roots(mut roots: Vec<EntityNode>, stored: &[String]) -> Vec<EntityNode> {
    let current: Vec<String> = roots.iter().map(|node| node.entity.id.clone()).collect();
    let rank: HashMap<String, usize> = merge_order(stored, &current)
        .into_iter()
        .enumerate()
        .map(|(pos, id)| (id, pos))
        .collect();
    roots.sort_by_key(|node| rank.get(&node.entity.id).copied().unwrap_or(usize::MAX));
    roots
}

/// Moves `id` by `delta` positions inside `order`, clamped to the ends.
/// Returns `None` when the id is unknown or the move changes nothing.
pub fn move_root(order: &[String], id: &str, delta: isize) -> Option<Vec<String>> {
    let from = order.iter().position(|candidate| candidate == id)?;
    let last = order.len().saturating_sub(1) as isize;
    let to = (from as isize + delta).clamp(0, last) as usize;
    if to == from {
        return None;
    }
    let mut next = order.to_vec();
    let moved = next.remove(from);
    next.insert(to, moved);
    Some(next)
}
