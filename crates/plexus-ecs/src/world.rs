//! The [`World`]: an entity bucket that also owns identity and the component
//! mutation protocol.
//!
//! Collaborator systems route membership-affecting component changes through
//! the world so that every connected view stays a true filtered subset of the
//! world's members. The protocol's central ordering property lives in
//! [`remove_component`](World::remove_component): views are evaluated against
//! the entity's *future* shape while the live entity is still intact, so a
//! view's *removed* event always fires with the doomed component still
//! readable, and no observer ever sees stale membership once the data is
//! gone.
//!
//! Worlds are explicitly constructed values. Build one per application (or
//! one per test) and pass handles around; nothing in this crate maintains a
//! hidden shared instance.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::bucket::{Bucket, EntityIter};
use crate::entity::{self, Entity, EntityRef};
use crate::event::Event;
use crate::identity::{EntityId, IdMap};
use crate::query::{Query, QueryConfig, Queryable};
use crate::EcsError;

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

struct WorldInner {
    bucket: Bucket,
    ids: RefCell<IdMap>,
}

/// Root container for entities, views, and entity identity.
///
/// `World` is a cheap-to-clone handle; clones share the same state. All
/// state is single-threaded.
#[derive(Clone)]
pub struct World {
    inner: Rc<WorldInner>,
}

impl World {
    /// Create an empty world.
    pub fn new() -> Self {
        let inner = Rc::new(WorldInner {
            bucket: Bucket::new(),
            ids: RefCell::new(IdMap::new()),
        });

        // Release ids inside the removal event chain, ahead of collaborator
        // listeners: by the time they observe the removal, the id already
        // answers "absent".
        let weak = Rc::downgrade(&inner);
        inner.bucket.on_removed().subscribe(move |removed| {
            if let Some(world) = weak.upgrade() {
                world.ids.borrow_mut().release(removed);
            }
        });

        Self { inner }
    }

    // -- membership ---------------------------------------------------------

    /// Wrap an entity record in a fresh handle and add it to the world.
    pub fn spawn(&self, entity: Entity) -> EntityRef {
        self.add(EntityRef::new(entity))
    }

    /// Add an entity. Idempotent; connected views update and *added* fires
    /// before this returns. Returns the entity.
    pub fn add(&self, entity: EntityRef) -> EntityRef {
        self.inner.bucket.add(entity)
    }

    /// Remove an entity. All views forget it, its id is released, *removed*
    /// fires, and only then is it dropped from storage. No-op for
    /// non-members.
    pub fn remove(&self, entity: &EntityRef) {
        self.inner.bucket.remove(entity);
    }

    /// O(1) membership test.
    pub fn has(&self, entity: &EntityRef) -> bool {
        self.inner.bucket.has(entity)
    }

    /// Remove every member, most recent first, then fire *cleared* once.
    pub fn clear(&self) {
        self.inner.bucket.clear();
    }

    /// Number of members.
    pub fn size(&self) -> usize {
        self.inner.bucket.size()
    }

    /// Whether the world has no members.
    pub fn is_empty(&self) -> bool {
        self.inner.bucket.is_empty()
    }

    /// Iterate members, most-recently-added first; safe under removal.
    pub fn iter(&self) -> EntityIter {
        self.inner.bucket.iter()
    }

    /// Snapshot the members in iteration order.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.inner.bucket.entities()
    }

    /// Signal a payload-only change on a member; fires *touched*.
    pub fn touch(&self, entity: &EntityRef) {
        self.inner.bucket.touch(entity);
    }

    // -- events -------------------------------------------------------------

    /// Fired after an entity is added to the world.
    pub fn on_added(&self) -> &Event<EntityRef> {
        self.inner.bucket.on_added()
    }

    /// Fired before an entity is dropped from world storage. Views have
    /// already forgotten the entity and its id is already released.
    pub fn on_removed(&self) -> &Event<EntityRef> {
        self.inner.bucket.on_removed()
    }

    /// Fired when a member's payload is rebound via
    /// [`set_component`](World::set_component) or [`touch`](World::touch).
    pub fn on_touched(&self) -> &Event<EntityRef> {
        self.inner.bucket.on_touched()
    }

    /// Fired once after [`clear`](World::clear) completes.
    pub fn on_cleared(&self) -> &Event<()> {
        self.inner.bucket.on_cleared()
    }

    // -- component mutation protocol ----------------------------------------

    /// Add a component to an entity. A no-op if the component is already
    /// present -- adding never overwrites.
    ///
    /// If the entity is a world member, every connected view is re-evaluated
    /// against the new shape before this returns; otherwise the entity data
    /// is mutated and nothing else happens.
    ///
    /// # Errors
    ///
    /// [`EcsError::ReservedComponent`] if `name` starts with `__`.
    pub fn add_component(
        &self,
        entity: &EntityRef,
        name: &str,
        value: Value,
    ) -> Result<(), EcsError> {
        ensure_unreserved(name)?;
        {
            let mut record = entity.borrow_mut();
            if record.has(name) {
                return Ok(());
            }
            record.insert(name, value);
        }

        if self.indexable(entity) {
            tracing::trace!(component = name, "re-evaluating views after component add");
            self.inner.bucket.evaluate_connected_views(entity, None);
        }
        Ok(())
    }

    /// Remove a component from an entity. A no-op if the component is
    /// absent.
    ///
    /// If the entity is a world member, every connected view is evaluated
    /// against the *future* shape (the entity minus `name`) first. Views
    /// that stop matching fire their *removed* events while the component is
    /// still readable on the entity; only after every view has been notified
    /// is the component physically deleted.
    ///
    /// # Errors
    ///
    /// [`EcsError::ReservedComponent`] if `name` starts with `__`.
    pub fn remove_component(&self, entity: &EntityRef, name: &str) -> Result<(), EcsError> {
        ensure_unreserved(name)?;
        if !entity.borrow().has(name) {
            return Ok(());
        }

        if self.indexable(entity) {
            tracing::trace!(
                component = name,
                "re-evaluating views against future shape"
            );
            self.inner
                .bucket
                .evaluate_connected_views(entity, Some(name));
        }

        entity.borrow_mut().remove(name);
        Ok(())
    }

    /// Rebind the payload of a component that is already present. A no-op if
    /// the component is absent -- rebinding is a distinct operation from
    /// adding.
    ///
    /// Membership rarely changes (the shape is the same), but value-sensitive
    /// predicate views are re-evaluated, and *touched* fires on the world so
    /// consumers can re-render.
    ///
    /// # Errors
    ///
    /// [`EcsError::ReservedComponent`] if `name` starts with `__`.
    pub fn set_component(
        &self,
        entity: &EntityRef,
        name: &str,
        value: Value,
    ) -> Result<(), EcsError> {
        ensure_unreserved(name)?;
        {
            let mut record = entity.borrow_mut();
            if !record.has(name) {
                return Ok(());
            }
            record.insert(name, value);
        }

        if self.indexable(entity) {
            self.inner.bucket.evaluate_connected_views(entity, None);
            self.inner.bucket.touch(entity);
        }
        Ok(())
    }

    // -- identity -----------------------------------------------------------

    /// The entity's id, assigned lazily on first request. `None` for
    /// non-members -- including entities that have been removed (whose ids
    /// are released and may be reused) and entities whose removal event
    /// chain is currently running.
    pub fn id(&self, entity: &EntityRef) -> Option<EntityId> {
        if !self.indexable(entity) {
            return None;
        }
        Some(self.inner.ids.borrow_mut().id_of(entity))
    }

    /// The member currently known by `id`, if any.
    pub fn entity(&self, id: EntityId) -> Option<EntityRef> {
        self.inner.ids.borrow().lookup(id)
    }

    /// Membership gate for the mutation protocol and id assignment: a member
    /// whose removal chain is already running must not be re-indexed into
    /// views or handed a fresh id by a removal listener.
    fn indexable(&self, entity: &EntityRef) -> bool {
        self.has(entity) && !self.inner.bucket.is_removing(entity)
    }
}

impl Queryable for World {
    fn query(&self, config: QueryConfig) -> Query {
        self.inner.bucket.query(config)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.size())
            .finish()
    }
}

fn ensure_unreserved(name: &str) -> Result<(), EcsError> {
    if entity::is_reserved(name) {
        tracing::warn!(component = name, "rejecting reserved component name");
        return Err(EcsError::ReservedComponent {
            name: name.to_owned(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
