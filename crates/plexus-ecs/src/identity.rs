//! Entity identifiers and the world's id table.
//!
//! An [`EntityId`] is a plain numeric handle that collaborator systems can
//! store, compare, and serialize into their own formats. Ids are assigned
//! *lazily* -- an entity gets one the first time somebody asks, not when it
//! enters the world -- and released the moment the entity leaves the world.
//! Released ids go back into a FIFO free list, so a later entity may receive
//! a previously used id; looking up a released id answers "absent", never a
//! stale entity.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::entity::EntityRef;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Numeric identifier for a world member.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Raw `u64` representation.
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Hands out ids, recycling released ones.
///
/// Free ids are kept in a FIFO queue so reuse is spread out over time rather
/// than concentrated on the most recently released id.
#[derive(Debug, Default)]
struct IdAllocator {
    next: u64,
    free: VecDeque<EntityId>,
}

impl IdAllocator {
    fn allocate(&mut self) -> EntityId {
        if let Some(id) = self.free.pop_front() {
            return id;
        }
        let id = EntityId(self.next);
        self.next += 1;
        id
    }

    fn release(&mut self, id: EntityId) {
        self.free.push_back(id);
    }
}

// ---------------------------------------------------------------------------
// IdMap
// ---------------------------------------------------------------------------

/// Bidirectional entity <-> id table with lazy assignment.
#[derive(Debug, Default)]
pub(crate) struct IdMap {
    allocator: IdAllocator,
    entity_to_id: HashMap<EntityRef, EntityId>,
    id_to_entity: HashMap<EntityId, EntityRef>,
}

impl IdMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The entity's id, assigning one on first request.
    pub(crate) fn id_of(&mut self, entity: &EntityRef) -> EntityId {
        if let Some(&id) = self.entity_to_id.get(entity) {
            return id;
        }
        let id = self.allocator.allocate();
        self.entity_to_id.insert(entity.clone(), id);
        self.id_to_entity.insert(id, entity.clone());
        id
    }

    /// The entity currently mapped to `id`, if any.
    pub(crate) fn lookup(&self, id: EntityId) -> Option<EntityRef> {
        self.id_to_entity.get(&id).cloned()
    }

    /// Forget the entity's mapping and recycle its id. No-op for entities
    /// that were never assigned one.
    pub(crate) fn release(&mut self, entity: &EntityRef) {
        if let Some(id) = self.entity_to_id.remove(entity) {
            self.id_to_entity.remove(&id);
            self.allocator.release(id);
        }
    }

    /// Number of entities that currently hold an id.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entity_to_id.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
