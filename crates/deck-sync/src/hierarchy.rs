use deck_core::Entity;
use std::collections::HashMap;

/// A root row with its satellites, one level deep.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityNode {
    pub entity: Entity,
    pub children: Vec<Entity>,
}

impl EntityNode {
    pub fn id(&self) -> &str {
        &self.entity.id
    }

    /// Number of rows this node renders as.
    pub fn row_count(&self) -> usize {
        1 + self.children.len()
    }
}

/// Groups entities under their parents, keeping server order on both levels.
///
/// An entity is top level when it has no parent, names itself, or names an id
/// missing from `entities`. A satellite is attached only to a top-level
/// parent; anything deeper is rendered as a root of its own, so every entity
/// ends up in exactly one place.
pub fn build(entities: &[Entity]) -> Vec<EntityNode> {
    let by_id: HashMap<&str, &Entity> = entities
        .iter()
        .map(|entity| (entity.id.as_str(), entity))
        .collect();

    let mut roots: Vec<EntityNode> = Vec::new();
    let mut slot_of: HashMap<&str, usize> = HashMap::new();
    for entity in entities {
        if attach_to(entity, &by_id).is_none() {
            slot_of.insert(entity.id.as_str(), roots.len());
            roots.push(EntityNode {
                entity: entity.clone(),
                children: Vec::new(),
            });
        }
    }

    for entity in entities {
        if let Some(parent) = attach_to(entity, &by_id) {
            if let Some(slot) = slot_of.get(parent) {
                roots[*slot].children.push(entity.clone());
            }
        }
    }

    roots
}

fn is_top_level(entity: &Entity, by_id: &HashMap<&str, &Entity>) -> bool {
    match entity.parent_id.as_deref() {
        None => true,
        Some(parent) => parent == entity.id || !by_id.contains_key(parent),
    }
}

fn attach_to<'a>(entity: &'a Entity, by_id: &HashMap<&str, &Entity>) -> Option<&'a str> {
    let parent = entity.parent_id.as_deref()?;
    if parent == entity.id {
        return None;
    }
    let parent_entity = *by_id.get(parent)?;
    is_top_level(parent_entity, by_id).then_some(parent)
}
