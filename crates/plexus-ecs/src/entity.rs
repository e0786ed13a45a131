//! Entities: open records of named component values.
//!
//! An [`Entity`] has no fixed schema. It maps component names to
//! [`serde_json::Value`] payloads; a component is *present* when its name has
//! an entry (a `null` payload is present, not absent), and presence is the
//! unit of query matching. Payloads are opaque to the index.
//!
//! Entities are shared through [`EntityRef`], a single-threaded handle whose
//! equality and hashing are *identity-based*: two handles are equal only if
//! they point at the same entity, never because their components compare
//! equal. Containers key all bookkeeping on that identity.
//!
//! Component names starting with `__` are reserved for internal bookkeeping
//! and rejected by the world's mutation protocol.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use serde_json::Value;

/// Component names with this prefix are reserved for internal bookkeeping.
pub(crate) const RESERVED_PREFIX: &str = "__";

/// Whether `name` collides with the reserved internal namespace.
pub(crate) fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An open-ended record of named component values.
///
/// Mutating an entity directly (via [`EntityRef::borrow_mut`]) is expected
/// for changes that do not affect view membership, e.g. rewriting a position
/// payload every frame. Changes that add or remove components on an entity
/// that lives in a [`World`](crate::world::World) should go through the
/// world's mutation protocol so connected views stay consistent.
#[derive(Debug, Default, Clone)]
pub struct Entity {
    components: HashMap<String, Value>,
}

impl Entity {
    /// Create an entity with no components.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion, for spawning:
    ///
    /// ```
    /// use plexus_ecs::entity::Entity;
    /// use serde_json::json;
    ///
    /// let e = Entity::new()
    ///     .with("position", json!({ "x": 0.0, "y": 0.0 }))
    ///     .with("health", json!(100));
    /// assert!(e.has("health"));
    /// ```
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.components.insert(name.into(), value);
        self
    }

    /// Whether the named component is present.
    pub fn has(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    /// The named component's payload, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.components.get(name)
    }

    /// Mutable access to the named component's payload, if present.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.components.get_mut(name)
    }

    /// Set a component directly, returning the previous payload if any.
    ///
    /// This bypasses view re-evaluation; see the type-level docs.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.components.insert(name.into(), value)
    }

    /// Delete a component directly, returning its payload if it was present.
    ///
    /// This bypasses view re-evaluation; see the type-level docs.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.components.remove(name)
    }

    /// Iterate the names of all present components, in no particular order.
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(|k| k.as_str())
    }

    /// Number of present components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the entity has no components at all.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Whether every one of `names` is present on `entity`.
///
/// Convenience guard for collaborators that read several components at once.
pub fn has_components(entity: &Entity, names: &[&str]) -> bool {
    names.iter().all(|name| entity.has(name))
}

// ---------------------------------------------------------------------------
// EntityRef
// ---------------------------------------------------------------------------

/// Shared, identity-bearing handle to an [`Entity`].
///
/// Cloning the handle does not clone the entity. Equality and hashing compare
/// the pointed-at entity's identity, so handles can key hash maps (position
/// indices, id maps, collaborator-side mirrors) without ever inspecting
/// component data.
#[derive(Clone)]
pub struct EntityRef(Rc<RefCell<Entity>>);

impl EntityRef {
    /// Wrap an entity record in a fresh shared handle with its own identity.
    pub fn new(entity: Entity) -> Self {
        Self(Rc::new(RefCell::new(entity)))
    }

    /// Immutably borrow the entity.
    ///
    /// # Panics
    ///
    /// Panics if the entity is currently mutably borrowed. Do not hold
    /// borrows across calls into container mutation.
    pub fn borrow(&self) -> Ref<'_, Entity> {
        self.0.borrow()
    }

    /// Mutably borrow the entity, e.g. to rewrite a component payload.
    ///
    /// # Panics
    ///
    /// Panics if the entity is currently borrowed. Do not hold borrows
    /// across calls into container mutation.
    pub fn borrow_mut(&self) -> RefMut<'_, Entity> {
        self.0.borrow_mut()
    }

    /// Whether two handles refer to the same entity.
    pub fn ptr_eq(a: &EntityRef, b: &EntityRef) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Stable address of the underlying allocation, used for hashing.
    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        EntityRef::ptr_eq(self, other)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(entity) => f.debug_tuple("EntityRef").field(&*entity).finish(),
            Err(_) => f.write_str("EntityRef(<borrowed>)"),
        }
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::new(entity)
    }
}

// ---------------------------------------------------------------------------
// Shape -- the candidate shape views match against
// ---------------------------------------------------------------------------

/// A view of an entity's component shape, with at most one component masked
/// out.
///
/// Views never match against an entity directly; they match against a
/// `Shape`. The live shape is the entity as it is. A *future* shape masks the
/// component that is about to be deleted, which lets the world evaluate
/// post-mutation membership while the live entity is still fully intact --
/// observers of the resulting removal events can still read the doomed
/// component's payload.
#[derive(Clone, Copy)]
pub struct Shape<'a> {
    entity: &'a Entity,
    masked: Option<&'a str>,
}

impl<'a> Shape<'a> {
    /// The entity's shape as it currently is.
    pub fn live(entity: &'a Entity) -> Self {
        Self {
            entity,
            masked: None,
        }
    }

    /// The entity's shape as it will be once `masked` is deleted.
    pub fn without(entity: &'a Entity, masked: &'a str) -> Self {
        Self {
            entity,
            masked: Some(masked),
        }
    }

    /// Build a shape with an optional masked component.
    pub(crate) fn new(entity: &'a Entity, masked: Option<&'a str>) -> Self {
        Self { entity, masked }
    }

    /// Whether the named component is present in this shape.
    pub fn has(&self, name: &str) -> bool {
        self.masked != Some(name) && self.entity.has(name)
    }

    /// The named component's payload, if present in this shape.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        if self.masked == Some(name) {
            None
        } else {
            self.entity.get(name)
        }
    }
}

impl fmt::Debug for Shape<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shape")
            .field("entity", self.entity)
            .field("masked", &self.masked)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
