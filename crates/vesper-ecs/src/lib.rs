//! Vesper ECS -- Reactive entity-component-system runtime.
//!
//! This crate is the core of the Vesper Engine: a [`World`](world::World)
//! that owns entities, their components, the systems operating on them, and
//! the reactive plumbing that notifies systems when components change. The
//! host application owns the main loop and calls the world's phase methods;
//! this crate owns everything in between:
//!
//! - The **entity/component store** with lifecycle (add / replace / remove /
//!   destroy / activate / deactivate), a parent-child hierarchy, and an
//!   in-frame message channel.
//! - The **context engine**: canonical entity subsets per filter expression,
//!   shared across systems that declare identical filters.
//! - The **watcher engine**: per-component observers that coalesce
//!   add/remove/modify/enable/disable events within a frame and dispatch
//!   them to reactive systems in a defined order, draining cascades to a
//!   fixpoint.
//!
//! # Quick Start
//!
//! ```
//! use vesper_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! struct MovementSystem;
//!
//! impl System for MovementSystem {
//!     fn update(&mut self, world: &mut World, context: &ContextView) {
//!         for entity in context.iter() {
//!             let velocity = world.component::<Velocity>(entity).clone();
//!             let position = world.component::<Position>(entity).clone();
//!             world.replace_component(
//!                 entity,
//!                 Position { x: position.x + velocity.dx, y: position.y + velocity.dy },
//!                 false,
//!             );
//!         }
//!     }
//! }
//!
//! let mut world = World::builder()
//!     .register_component::<Position>(ComponentDecl::new())
//!     .register_component::<Velocity>(ComponentDecl::new())
//!     .with_system(
//!         MovementSystem,
//!         SystemMeta::new(Capabilities::UPDATE)
//!             .with_filter(FilterDecl::all_of(vec![target::<Position>(), target::<Velocity>()])),
//!         true,
//!     )
//!     .build();
//!
//! let entity = world.add_entity(
//!     ComponentBundle::new()
//!         .with(Position { x: 0.0, y: 0.0 })
//!         .with(Velocity { dx: 1.0, dy: 0.0 }),
//! );
//!
//! world.update();
//! assert_eq!(world.component::<Position>(entity).x, 1.0);
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod context;
pub mod entity;
pub mod event;
pub mod system;
pub mod watcher;
pub mod world;

use entity::EntityId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world operations.
///
/// Most lifecycle operations deliberately do not error: per the engine's
/// policy, duplicate adds and absent replaces warn and no-op, and mutating a
/// destroyed entity is silently ignored. The variants here surface where a
/// caller can meaningfully react -- or, for the fatal ones, form the panic
/// message.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// `component::<T>()` on an entity without `T`.
    #[error("entity {entity} has no component '{component}'")]
    MissingComponent {
        entity: EntityId,
        component: &'static str,
    },

    /// The entity does not exist in this world.
    #[error("entity {0} does not exist in this world")]
    NoSuchEntity(EntityId),

    /// An explicit-id spawn collided with an existing entity.
    #[error("entity id {0} is already in use")]
    EntityIdInUse(EntityId),

    /// More than one live entity carries a unique component
    /// (diagnostics mode only).
    #[error("component '{component}' is unique but {count} live entities carry it")]
    UniquenessViolation { component: String, count: usize },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{
        Component, ComponentDecl, ComponentId, ComponentIndex, Interface, TargetType,
    };
    pub use crate::context::{
        target, AccessKind, Context, ContextId, FilterDecl, FilterKind, FilterTarget,
    };
    pub use crate::entity::{Entity, EntityId};
    pub use crate::event::{EventChannel, SubscriptionToken};
    pub use crate::system::{Capabilities, ContextView, System, SystemId, SystemMeta};
    pub use crate::watcher::{ComponentWatcher, MessageWatcher, NotificationKind, WatcherId};
    pub use crate::world::{ComponentBundle, World, WorldBuilder, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
