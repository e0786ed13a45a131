//! Plexus ECS -- a reactive entity-component index.
//!
//! Entities are open records of named, loosely-typed components. Derived
//! views (queries) stay consistent automatically as components are added and
//! removed and entities enter and leave the world -- no caller ever re-runs
//! a full scan. Views with structurally equal configurations are the same
//! object, membership changes surface as synchronous add/remove events, and
//! the world's mutation protocol guarantees observers never see a removal
//! after the data is already gone.
//!
//! The whole container graph is single-threaded and re-entrant: every
//! mutation finishes all of its bookkeeping and event delivery before
//! returning, and listeners are free to mutate the containers that are
//! notifying them.
//!
//! # Quick Start
//!
//! ```
//! use plexus_ecs::prelude::*;
//! use serde_json::json;
//!
//! let world = World::new();
//!
//! let player = world.spawn(
//!     Entity::new()
//!         .with("position", json!({ "x": 0.0, "y": 0.0 }))
//!         .with("velocity", json!({ "dx": 1.0, "dy": 0.0 })),
//! );
//!
//! let moving = world.with(["position", "velocity"]);
//! assert!(moving.has(&player));
//!
//! world.remove_component(&player, "velocity")?;
//! assert!(!moving.has(&player));
//! # Ok::<(), plexus_ecs::EcsError>(())
//! ```

#![deny(unsafe_code)]

pub mod bucket;
pub mod entity;
pub mod event;
pub mod identity;
pub mod query;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the index.
///
/// The surface is deliberately narrow: operations with unmet preconditions
/// (component already present on add, absent on remove/set, id requested for
/// a non-member) are defined as no-ops or `None`, because idempotent
/// re-application of declarative state is a first-class use case. Only
/// structural contract violations fail hard.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The component name collides with the reserved `__` internal
    /// bookkeeping namespace.
    #[error("component name '{name}' is reserved for internal bookkeeping")]
    ReservedComponent {
        /// The rejected name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bucket::{Bucket, EntityIter};
    pub use crate::entity::{has_components, Entity, EntityRef, Shape};
    pub use crate::event::{Event, ListenerId};
    pub use crate::identity::EntityId;
    pub use crate::query::{Predicate, Query, QueryConfig, Queryable};
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
