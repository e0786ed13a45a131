//! The [`Bucket`]: an ordered, identity-indexed entity container.
//!
//! A bucket stores entities in insertion order with an entity -> position
//! reverse index for O(1) membership tests and removal. Removal tombstones
//! the storage slot instead of shifting the sequence, which is what makes
//! iteration safe while listeners remove entities out from under it.
//!
//! Event ordering is part of the contract:
//!
//! - *added* fires after the entity is physically stored, so listeners can
//!   already find it in the bucket;
//! - *removed* fires before the slot is tombstoned, so listeners can still
//!   inspect the full entity state (and still find it in the bucket);
//! - *cleared* fires once, after a bulk [`clear`](Bucket::clear) has removed
//!   every member through the normal removal sequence.
//!
//! Buckets are also the roots of the view engine: every bucket owns the cache
//! of views derived from it (see [`derive`](Bucket::derive) and the
//! [`Queryable`](crate::query::Queryable) trait) and keeps connected views
//! up to date as its membership changes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::entity::EntityRef;
use crate::event::Event;
use crate::query::{Query, QueryConfig, Queryable, ViewRegistry};

/// Tombstone count below which compaction is never attempted.
const COMPACT_MIN_TOMBSTONES: usize = 32;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

struct BucketState {
    /// Insertion-ordered slots; `None` is a tombstone left by removal.
    slots: Vec<Option<EntityRef>>,
    /// Reverse index: entity -> slot position.
    positions: HashMap<EntityRef, usize>,
}

pub(crate) struct BucketCore {
    state: RefCell<BucketState>,
    views: RefCell<ViewRegistry>,
    /// Live iterator count; compaction must not move slots under an iterator.
    iterating: Cell<usize>,
    /// Entities whose removal sequence is currently on the stack.
    removing: RefCell<HashSet<EntityRef>>,
    on_added: Event<EntityRef>,
    on_removed: Event<EntityRef>,
    on_touched: Event<EntityRef>,
    on_cleared: Event<()>,
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// Ordered entity container with add/remove events and derived views.
///
/// `Bucket` is a cheap-to-clone handle; clones share the same storage,
/// events, and view cache. All state is single-threaded.
#[derive(Clone)]
pub struct Bucket {
    core: Rc<BucketCore>,
}

impl Bucket {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self {
            core: Rc::new(BucketCore {
                state: RefCell::new(BucketState {
                    slots: Vec::new(),
                    positions: HashMap::new(),
                }),
                views: RefCell::new(ViewRegistry::new()),
                iterating: Cell::new(0),
                removing: RefCell::new(HashSet::new()),
                on_added: Event::new(),
                on_removed: Event::new(),
                on_touched: Event::new(),
                on_cleared: Event::new(),
            }),
        }
    }

    /// Whether two handles share the same underlying container.
    pub fn ptr_eq(a: &Bucket, b: &Bucket) -> bool {
        Rc::ptr_eq(&a.core, &b.core)
    }

    // -- membership ---------------------------------------------------------

    /// Add an entity. Idempotent: re-adding a member changes nothing and
    /// fires no event. Connected views are updated, then *added* fires, all
    /// before this call returns. Returns the entity.
    pub fn add(&self, entity: EntityRef) -> EntityRef {
        {
            let mut state = self.core.state.borrow_mut();
            if state.positions.contains_key(&entity) {
                return entity;
            }
            state.slots.push(Some(entity.clone()));
            let position = state.slots.len() - 1;
            state.positions.insert(entity.clone(), position);
        }

        self.evaluate_connected_views(&entity, None);
        self.core.on_added.emit(&entity);
        entity
    }

    /// Remove an entity. A no-op if it is not a member, or if its removal
    /// sequence is already running further up the stack.
    ///
    /// Order: cached views drop the entity (firing their own *removed*
    /// events), this bucket's *removed* fires, and only then is the slot
    /// tombstoned -- listeners observe a bucket that still contains the
    /// entity.
    pub fn remove(&self, entity: &EntityRef) {
        if !self.has(entity) {
            return;
        }
        if !self.core.removing.borrow_mut().insert(entity.clone()) {
            return;
        }

        self.purge_from_views(entity);
        self.core.on_removed.emit(entity);

        {
            let mut state = self.core.state.borrow_mut();
            if let Some(position) = state.positions.remove(entity) {
                state.slots[position] = None;
            }
        }
        self.core.removing.borrow_mut().remove(entity);
        self.maybe_compact();
    }

    /// O(1) membership test.
    pub fn has(&self, entity: &EntityRef) -> bool {
        self.core.state.borrow().positions.contains_key(entity)
    }

    /// Whether the entity's removal sequence is currently on the stack. Such
    /// an entity still passes [`has`](Bucket::has) (its slot is intact for
    /// listeners) but is already on its way out.
    pub(crate) fn is_removing(&self, entity: &EntityRef) -> bool {
        self.core.removing.borrow().contains(entity)
    }

    /// Remove every member through the normal removal sequence, most recent
    /// first, then fire *cleared* once.
    pub fn clear(&self) {
        for entity in self.iter() {
            self.remove(&entity);
        }
        self.core.on_cleared.emit(&());
    }

    /// Signal that a member's component payloads changed without membership
    /// consequences. Fires *touched* if the entity is a member.
    pub fn touch(&self, entity: &EntityRef) {
        if self.has(entity) {
            self.core.on_touched.emit(entity);
        }
    }

    /// Number of live members.
    pub fn size(&self) -> usize {
        self.core.state.borrow().positions.len()
    }

    /// Whether the bucket has no members.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    // -- iteration ----------------------------------------------------------

    /// Iterate live members, most-recently-added first.
    ///
    /// Each call starts a fresh pass. Removing entities mid-pass (any member,
    /// including the one just yielded) neither skips nor duplicates entities;
    /// entities added mid-pass are not yielded.
    pub fn iter(&self) -> EntityIter {
        EntityIter::new(self.core.clone())
    }

    /// Snapshot the live members in iteration order.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.iter().collect()
    }

    // -- events -------------------------------------------------------------

    /// Fired after an entity is physically inserted.
    pub fn on_added(&self) -> &Event<EntityRef> {
        &self.core.on_added
    }

    /// Fired before an entity's slot is tombstoned.
    pub fn on_removed(&self) -> &Event<EntityRef> {
        &self.core.on_removed
    }

    /// Fired by [`touch`](Bucket::touch) for members.
    pub fn on_touched(&self) -> &Event<EntityRef> {
        &self.core.on_touched
    }

    /// Fired once after a [`clear`](Bucket::clear) completes.
    pub fn on_cleared(&self) -> &Event<()> {
        &self.core.on_cleared
    }

    // -- views --------------------------------------------------------------

    /// Derive an unfiltered child view that mirrors this bucket's membership.
    ///
    /// Equivalent to `self.query(QueryConfig::default())`. Use
    /// [`Queryable::with`]/[`Queryable::without`]/[`Queryable::filter`] for
    /// filtered views.
    pub fn derive(&self) -> Query {
        self.query(QueryConfig::default())
    }

    pub(crate) fn view_registry(&self) -> &RefCell<ViewRegistry> {
        &self.core.views
    }

    /// Re-evaluate every connected view against the entity's candidate shape
    /// (`masked` names the component treated as already deleted).
    pub(crate) fn evaluate_connected_views(&self, entity: &EntityRef, masked: Option<&str>) {
        // Snapshot first: listeners may derive new views or disconnect
        // existing ones while we walk the list.
        let connected = self.core.views.borrow().connected_snapshot();
        for view in connected {
            Query::evaluate(&view, entity, masked);
        }
    }

    /// Drop the entity from every cached view, connected or not, so no view
    /// storage can outlive the entity's membership here.
    fn purge_from_views(&self, entity: &EntityRef) {
        let cached = self.core.views.borrow().cached_snapshot();
        for view in cached {
            view.storage.remove(entity);
        }
    }

    // -- storage upkeep -----------------------------------------------------

    /// Rebuild the slot vector once tombstones outnumber live entries, unless
    /// an iterator is live (iterators hold raw slot positions).
    fn maybe_compact(&self) {
        if self.core.iterating.get() > 0 {
            return;
        }
        let mut state = self.core.state.borrow_mut();
        let live = state.positions.len();
        let dead = state.slots.len() - live;
        if dead < COMPACT_MIN_TOMBSTONES || dead <= live {
            return;
        }

        let BucketState { slots, positions } = &mut *state;
        slots.retain(Option::is_some);
        positions.clear();
        for (position, slot) in slots.iter().enumerate() {
            if let Some(entity) = slot {
                positions.insert(entity.clone(), position);
            }
        }
        tracing::trace!(live, reclaimed = dead, "compacted bucket storage");
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("size", &self.size())
            .field("views", &self.core.views.borrow().cached_count())
            .finish()
    }
}

impl<'a> IntoIterator for &'a Bucket {
    type Item = EntityRef;
    type IntoIter = EntityIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ---------------------------------------------------------------------------
// EntityIter
// ---------------------------------------------------------------------------

/// Lazy reverse-order iterator over a bucket's live members.
///
/// Holds no borrow between `next` calls, so listeners and loop bodies are
/// free to mutate the bucket mid-iteration.
pub struct EntityIter {
    core: Rc<BucketCore>,
    /// Upper bound of the not-yet-visited slot range.
    cursor: usize,
}

impl EntityIter {
    fn new(core: Rc<BucketCore>) -> Self {
        core.iterating.set(core.iterating.get() + 1);
        let cursor = core.state.borrow().slots.len();
        Self { core, cursor }
    }
}

impl Iterator for EntityIter {
    type Item = EntityRef;

    fn next(&mut self) -> Option<EntityRef> {
        loop {
            if self.cursor == 0 {
                return None;
            }
            self.cursor -= 1;
            let state = self.core.state.borrow();
            if let Some(Some(entity)) = state.slots.get(self.cursor) {
                return Some(entity.clone());
            }
        }
    }
}

impl Drop for EntityIter {
    fn drop(&mut self) {
        self.core.iterating.set(self.core.iterating.get() - 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use serde_json::json;
    use std::cell::Cell;

    fn entity(tag: u32) -> EntityRef {
        EntityRef::new(Entity::new().with("tag", json!(tag)))
    }

    #[test]
    fn add_is_idempotent() {
        let bucket = Bucket::new();
        let added = Rc::new(Cell::new(0));
        let count = added.clone();
        bucket.on_added().subscribe(move |_| count.set(count.get() + 1));

        let e = entity(1);
        bucket.add(e.clone());
        bucket.add(e.clone());

        assert_eq!(bucket.size(), 1);
        assert_eq!(added.get(), 1);
        assert_eq!(bucket.entities(), vec![e]);
    }

    #[test]
    fn remove_is_idempotent() {
        let bucket = Bucket::new();
        let removed = Rc::new(Cell::new(0));
        let count = removed.clone();
        bucket
            .on_removed()
            .subscribe(move |_| count.set(count.get() + 1));

        let e = entity(1);
        bucket.remove(&e); // never a member
        bucket.add(e.clone());
        bucket.remove(&e);
        bucket.remove(&e);

        assert_eq!(bucket.size(), 0);
        assert_eq!(removed.get(), 1);
    }

    #[test]
    fn iteration_is_reverse_insertion_order() {
        let bucket = Bucket::new();
        let a = bucket.add(entity(1));
        let b = bucket.add(entity(2));
        let c = bucket.add(entity(3));

        assert_eq!(bucket.entities(), vec![c, b, a]);
    }

    #[test]
    fn removal_during_iteration_is_safe() {
        let bucket = Bucket::new();
        let a = bucket.add(entity(1));
        let b = bucket.add(entity(2));
        let c = bucket.add(entity(3));

        let mut visited = Vec::new();
        for e in bucket.iter() {
            visited.push(e.clone());
            bucket.remove(&e);
        }

        assert_eq!(visited, vec![c, b, a]);
        assert!(bucket.is_empty());
    }

    #[test]
    fn removing_an_earlier_entity_mid_iteration_does_not_skip_or_repeat() {
        let bucket = Bucket::new();
        let a = bucket.add(entity(1));
        let b = bucket.add(entity(2));
        let c = bucket.add(entity(3));

        // While visiting c (first), remove a (last-to-be-visited).
        let mut visited = Vec::new();
        for e in bucket.iter() {
            if e == c {
                bucket.remove(&a);
            }
            visited.push(e);
        }

        assert_eq!(visited, vec![c, b]);
        assert_eq!(bucket.size(), 2);
    }

    #[test]
    fn entities_added_mid_iteration_are_not_yielded() {
        let bucket = Bucket::new();
        bucket.add(entity(1));
        bucket.add(entity(2));

        let mut visited = 0;
        for _ in bucket.iter() {
            bucket.add(entity(99));
            visited += 1;
        }

        assert_eq!(visited, 2);
        assert_eq!(bucket.size(), 4);
    }

    #[test]
    fn removed_fires_while_entity_is_still_a_member() {
        let bucket = Bucket::new();
        let e = bucket.add(entity(1));

        let seen_as_member = Rc::new(Cell::new(false));
        let inner_bucket = bucket.clone();
        let seen = seen_as_member.clone();
        bucket
            .on_removed()
            .subscribe(move |entity| seen.set(inner_bucket.has(entity)));

        bucket.remove(&e);
        assert!(seen_as_member.get());
        assert!(!bucket.has(&e));
    }

    #[test]
    fn listener_removing_the_in_flight_entity_does_not_recurse() {
        let bucket = Bucket::new();
        let e = bucket.add(entity(1));

        let removed = Rc::new(Cell::new(0));
        let inner_bucket = bucket.clone();
        let count = removed.clone();
        bucket.on_removed().subscribe(move |entity| {
            count.set(count.get() + 1);
            inner_bucket.remove(entity);
        });

        bucket.remove(&e);
        assert_eq!(removed.get(), 1);
        assert!(bucket.is_empty());
    }

    #[test]
    fn clear_removes_in_reverse_order_then_fires_cleared_once() {
        let bucket = Bucket::new();
        let a = bucket.add(entity(1));
        let b = bucket.add(entity(2));

        let removed = Rc::new(RefCell::new(Vec::new()));
        let order = removed.clone();
        bucket
            .on_removed()
            .subscribe(move |e| order.borrow_mut().push(e.clone()));

        let cleared = Rc::new(Cell::new(0));
        let count = cleared.clone();
        bucket
            .on_cleared()
            .subscribe(move |_| count.set(count.get() + 1));

        bucket.clear();

        assert_eq!(*removed.borrow(), vec![b, a]);
        assert_eq!(cleared.get(), 1);
        assert!(bucket.is_empty());
    }

    #[test]
    fn touch_fires_for_members_only() {
        let bucket = Bucket::new();
        let touched = Rc::new(Cell::new(0));
        let count = touched.clone();
        bucket
            .on_touched()
            .subscribe(move |_| count.set(count.get() + 1));

        let outsider = entity(1);
        bucket.touch(&outsider);
        assert_eq!(touched.get(), 0);

        let member = bucket.add(entity(2));
        bucket.touch(&member);
        assert_eq!(touched.get(), 1);
    }

    #[test]
    fn compaction_preserves_iteration_order() {
        let bucket = Bucket::new();
        let keep: Vec<_> = (0..10).map(|i| bucket.add(entity(i))).collect();
        let churn: Vec<_> = (100..200).map(|i| bucket.add(entity(i))).collect();

        for e in &churn {
            bucket.remove(e);
        }

        // All churn entities are gone, keepers still iterate newest-first.
        let expected: Vec<_> = keep.iter().rev().cloned().collect();
        assert_eq!(bucket.entities(), expected);
        assert_eq!(bucket.size(), 10);
    }
}
