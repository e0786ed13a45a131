//! Derived views over a bucket, maintained incrementally.
//!
//! A [`Query`] is a bucket whose membership is fully determined by a
//! predicate over entity shape: a set of required component names, a set of
//! forbidden component names, and an optional custom [`Predicate`].
//!
//! Configurations are normalized (name sets sorted, deduplicated,
//! order-independent) and cached by the source bucket: requesting a
//! structurally equal configuration returns the *identical* view object,
//! which is what makes subscriptions idempotent and keeps bookkeeping from
//! silently duplicating. Custom predicates compare by identity -- cloning a
//! `Predicate` shares a view, constructing a new one (even from an
//! identical closure) names a different view.
//!
//! Views are lazy: a freshly derived view holds nothing and costs nothing
//! until something reads its membership or subscribes to its events, at
//! which point it *connects* -- enrolling with its source for live updates
//! and sweeping in every member that currently matches.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::bucket::{Bucket, EntityIter};
use crate::entity::{EntityRef, Shape};
use crate::event::Event;

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// A custom matching predicate over an entity [`Shape`].
///
/// Equality is identity-based: two `Predicate` values are equal only if one
/// is a clone of the other. Behaviorally identical closures wrapped
/// separately are distinct, and deliberately so -- a view cache keyed on
/// behavior would have to prove function equivalence.
#[derive(Clone)]
pub struct Predicate(Rc<dyn Fn(Shape<'_>) -> bool>);

impl Predicate {
    /// Wrap a closure. Each call produces a new predicate identity.
    pub fn new(f: impl Fn(Shape<'_>) -> bool + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub(crate) fn test(&self, shape: Shape<'_>) -> bool {
        (self.0)(shape)
    }

    pub(crate) fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Predicate {}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({:#x})", self.addr())
    }
}

// ---------------------------------------------------------------------------
// QueryConfig
// ---------------------------------------------------------------------------

/// The full configuration of a view: required names, forbidden names, and an
/// optional custom predicate.
#[derive(Clone, Default)]
pub struct QueryConfig {
    with: Vec<String>,
    without: Vec<String>,
    predicate: Option<Predicate>,
}

impl QueryConfig {
    /// An empty configuration (matches every entity).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require the named components to be present.
    pub fn with<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with.extend(names.into_iter().map(Into::into));
        self
    }

    /// Require the named components to be absent.
    pub fn without<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.without.extend(names.into_iter().map(Into::into));
        self
    }

    /// Require the predicate to hold. Composes by conjunction with any
    /// predicate already set; evaluation short-circuits.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = match self.predicate.take() {
            Some(existing) => Some(Predicate::new(move |shape| {
                existing.test(shape) && predicate.test(shape)
            })),
            None => Some(predicate),
        };
        self
    }

    /// Merge a refinement on top of this configuration.
    pub(crate) fn compose(&self, refinement: QueryConfig) -> QueryConfig {
        let mut merged = self.clone();
        merged.with.extend(refinement.with);
        merged.without.extend(refinement.without);
        if let Some(predicate) = refinement.predicate {
            merged = merged.filter(predicate);
        }
        merged
    }

    /// Sort, deduplicate, and drop empty names so that structurally equal
    /// configurations produce equal cache keys.
    pub(crate) fn normalize(&mut self) {
        normalize_names(&mut self.with);
        normalize_names(&mut self.without);
    }

    pub(crate) fn key(&self) -> QueryKey {
        QueryKey {
            with: self.with.clone(),
            without: self.without.clone(),
            predicate: self.predicate.as_ref().map(Predicate::addr),
        }
    }

    /// The matching rule: every required name present, every forbidden name
    /// absent, and the custom predicate (if any) satisfied.
    pub(crate) fn matches(&self, shape: Shape<'_>) -> bool {
        self.with.iter().all(|name| shape.has(name))
            && self.without.iter().all(|name| !shape.has(name))
            && self.predicate.as_ref().is_none_or(|p| p.test(shape))
    }
}

impl fmt::Debug for QueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryConfig")
            .field("with", &self.with)
            .field("without", &self.without)
            .field("predicate", &self.predicate)
            .finish()
    }
}

fn normalize_names(names: &mut Vec<String>) {
    names.retain(|name| !name.is_empty());
    names.sort();
    names.dedup();
}

/// Canonical cache key for a normalized configuration. The predicate
/// contributes its identity (address), never its behavior.
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct QueryKey {
    with: Vec<String>,
    without: Vec<String>,
    predicate: Option<usize>,
}

// ---------------------------------------------------------------------------
// ViewRegistry -- per-bucket view cache and connection list
// ---------------------------------------------------------------------------

/// Owned by every bucket: the cache of views derived from it and the subset
/// currently connected. Both lists preserve insertion order so that view
/// updates happen in a deterministic order.
pub(crate) struct ViewRegistry {
    cached: Vec<Rc<QueryInner>>,
    connected: Vec<Rc<QueryInner>>,
}

impl ViewRegistry {
    pub(crate) fn new() -> Self {
        Self {
            cached: Vec::new(),
            connected: Vec::new(),
        }
    }

    fn lookup(&self, key: &QueryKey) -> Option<Rc<QueryInner>> {
        self.cached.iter().find(|q| q.key == *key).cloned()
    }

    fn insert(&mut self, view: Rc<QueryInner>) {
        self.cached.push(view);
    }

    fn connect(&mut self, view: &Rc<QueryInner>) {
        if !self.connected.iter().any(|q| Rc::ptr_eq(q, view)) {
            self.connected.push(view.clone());
        }
    }

    fn disconnect(&mut self, view: &Rc<QueryInner>) {
        self.connected.retain(|q| !Rc::ptr_eq(q, view));
    }

    pub(crate) fn connected_snapshot(&self) -> Vec<Rc<QueryInner>> {
        self.connected.clone()
    }

    pub(crate) fn cached_snapshot(&self) -> Vec<Rc<QueryInner>> {
        self.cached.clone()
    }

    pub(crate) fn cached_count(&self) -> usize {
        self.cached.len()
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

pub(crate) struct QueryInner {
    /// The view's own membership storage; its events are the view's events.
    pub(crate) storage: Bucket,
    config: QueryConfig,
    pub(crate) key: QueryKey,
    connected: Cell<bool>,
}

/// A derived view: an auto-maintained, predicate-filtered subset of a source
/// bucket.
///
/// `Query` is a cheap-to-clone handle. Handles resolved from structurally
/// equal configurations share the same underlying view (see
/// [`Query::ptr_eq`]); `PartialEq` compares that identity.
#[derive(Clone)]
pub struct Query {
    inner: Rc<QueryInner>,
    source: Bucket,
}

impl Query {
    /// Resolve a view through `source`'s cache, creating it on first request.
    pub(crate) fn resolve(source: &Bucket, mut config: QueryConfig) -> Query {
        config.normalize();
        let key = config.key();

        if let Some(inner) = source.view_registry().borrow().lookup(&key) {
            return Query {
                inner,
                source: source.clone(),
            };
        }

        let inner = Rc::new(QueryInner {
            storage: Bucket::new(),
            config,
            key,
            connected: Cell::new(false),
        });
        source.view_registry().borrow_mut().insert(inner.clone());
        Query {
            inner,
            source: source.clone(),
        }
    }

    /// Whether two handles name the same underlying view.
    pub fn ptr_eq(a: &Query, b: &Query) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    // -- connection lifecycle -----------------------------------------------

    /// Whether the view is currently receiving live updates.
    pub fn connected(&self) -> bool {
        self.inner.connected.get()
    }

    /// Begin live maintenance. Called implicitly by every membership read and
    /// event subscription; explicit calls are idempotent.
    ///
    /// Connecting resynchronizes the view: members that stopped matching
    /// while the view was disconnected are dropped, and every currently
    /// matching source member is present afterwards.
    pub fn connect(&self) -> &Self {
        if self.inner.connected.get() {
            return self;
        }
        self.inner.connected.set(true);
        self.source
            .view_registry()
            .borrow_mut()
            .connect(&self.inner);
        tracing::debug!(view = ?self.inner.key, "connecting view");

        // Drop members that went stale while disconnected.
        for entity in self.inner.storage.iter() {
            let keep = self.source.has(&entity) && {
                let borrowed = entity.borrow();
                self.inner.config.matches(Shape::live(&borrowed))
            };
            if !keep {
                self.inner.storage.remove(&entity);
            }
        }

        // Sweep in everything that currently matches.
        for entity in self.source.iter() {
            let wanted = {
                let borrowed = entity.borrow();
                self.inner.config.matches(Shape::live(&borrowed))
            };
            if wanted {
                self.inner.storage.add(entity);
            }
        }
        self
    }

    /// Stop live maintenance. The view keeps its storage (reads still see
    /// the last known membership) but no longer tracks source changes;
    /// reconnecting resynchronizes.
    pub fn disconnect(&self) -> &Self {
        if !self.inner.connected.get() {
            return self;
        }
        self.inner.connected.set(false);
        self.source
            .view_registry()
            .borrow_mut()
            .disconnect(&self.inner);
        tracing::debug!(view = ?self.inner.key, "disconnecting view");
        self
    }

    // -- membership ---------------------------------------------------------

    /// Iterate members, most-recently-indexed first. Connects.
    pub fn iter(&self) -> EntityIter {
        self.connect();
        self.inner.storage.iter()
    }

    /// Snapshot the members in iteration order. Connects.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.connect();
        self.inner.storage.entities()
    }

    /// Number of members. Connects.
    pub fn size(&self) -> usize {
        self.connect();
        self.inner.storage.size()
    }

    /// Whether the view has no members. Connects.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// O(1) membership test. Connects.
    pub fn has(&self, entity: &EntityRef) -> bool {
        self.connect();
        self.inner.storage.has(entity)
    }

    // -- events -------------------------------------------------------------

    /// Fired when an entity enters the view. Connects.
    pub fn on_added(&self) -> &Event<EntityRef> {
        self.connect();
        self.inner.storage.on_added()
    }

    /// Fired when an entity leaves the view, before the mutation that evicted
    /// it is physically applied. Connects.
    pub fn on_removed(&self) -> &Event<EntityRef> {
        self.connect();
        self.inner.storage.on_removed()
    }

    // -- incremental maintenance -------------------------------------------

    /// Re-evaluate one entity against the view's predicate, adding or
    /// removing it from the view as needed. `masked` names a component to
    /// treat as already deleted (the future shape).
    pub(crate) fn evaluate(inner: &Rc<QueryInner>, entity: &EntityRef, masked: Option<&str>) {
        let wanted = {
            let borrowed = entity.borrow();
            inner.config.matches(Shape::new(&borrowed, masked))
        };
        let held = inner.storage.has(entity);

        if wanted && !held {
            inner.storage.add(entity.clone());
        } else if !wanted && held {
            inner.storage.remove(entity);
        }
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        Query::ptr_eq(self, other)
    }
}

impl Eq for Query {}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.inner.key)
            .field("connected", &self.inner.connected.get())
            .finish()
    }
}

impl<'a> IntoIterator for &'a Query {
    type Item = EntityRef;
    type IntoIter = EntityIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ---------------------------------------------------------------------------
// Queryable -- cache-checked view construction
// ---------------------------------------------------------------------------

/// Anything views can be derived from: buckets, worlds, and views themselves
/// (chained refinement).
pub trait Queryable {
    /// Resolve a view for `config` through this source's cache. Structurally
    /// equal configurations resolve to the identical view.
    fn query(&self, config: QueryConfig) -> Query;

    /// A view requiring the named components.
    fn with<I, S>(&self, names: I) -> Query
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        Self: Sized,
    {
        self.query(QueryConfig::new().with(names))
    }

    /// A view forbidding the named components.
    fn without<I, S>(&self, names: I) -> Query
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        Self: Sized,
    {
        self.query(QueryConfig::new().without(names))
    }

    /// A view requiring a custom predicate. Pass clones of one [`Predicate`]
    /// to share a view across call sites.
    fn filter(&self, predicate: Predicate) -> Query
    where
        Self: Sized,
    {
        self.query(QueryConfig::new().filter(predicate))
    }
}

impl Queryable for Bucket {
    fn query(&self, config: QueryConfig) -> Query {
        Query::resolve(self, config)
    }
}

impl Queryable for Query {
    /// Chained refinement: the given configuration composes with this view's
    /// own, and the composed view is resolved through the *source's* cache.
    /// `bucket.with(["a"]).with(["b"])` is the same view as
    /// `bucket.with(["a", "b"])`.
    fn query(&self, config: QueryConfig) -> Query {
        Query::resolve(&self.source, self.inner.config.compose(config))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
