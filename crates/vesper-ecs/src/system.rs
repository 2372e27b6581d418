//! Systems: the capability trait, registration metadata, and context views.
//!
//! A system implements whichever subset of the [`System`] trait's methods its
//! declared [`Capabilities`] name; the rest default to no-ops. Capabilities
//! are resolved once at registration -- the world never asks "does this
//! system implement X" on the hot path, it iterates per-phase cached lists.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentId, TargetType};
use crate::context::{ContextId, FilterDecl, FilterTarget};
use crate::entity::EntityId;
use crate::world::World;

// ---------------------------------------------------------------------------
// SystemId
// ---------------------------------------------------------------------------

/// Stable system identifier: the system's declaration index at world
/// construction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemId(pub(crate) u32);

impl SystemId {
    /// Raw declaration index.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

bitflags::bitflags! {
    /// The set of capability operations a system implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u16 {
        const EARLY_STARTUP       = 1 << 0;
        const STARTUP             = 1 << 1;
        const EXIT                = 1 << 2;
        const UPDATE              = 1 << 3;
        const LATE_UPDATE         = 1 << 4;
        const FIXED_UPDATE        = 1 << 5;
        /// Marks a render-path system; excluded from the pause policy.
        /// This crate has no render phase of its own.
        const RENDER              = 1 << 6;
        const REACTIVE            = 1 << 7;
        const MESSAGER            = 1 << 8;
        const ACTIVATION_LISTENER = 1 << 9;
    }
}

impl Capabilities {
    /// The capabilities subject to pausing, before the flag overrides.
    pub(crate) const PAUSABLE_KINDS: Capabilities = Capabilities::UPDATE
        .union(Capabilities::LATE_UPDATE)
        .union(Capabilities::FIXED_UPDATE);
}

// ---------------------------------------------------------------------------
// SystemMeta
// ---------------------------------------------------------------------------

/// Plain-data registration record for one system.
#[derive(Debug, Clone, Default)]
pub struct SystemMeta {
    /// Which capability operations the system implements.
    pub capabilities: Capabilities,
    /// Filters defining the system's context. Empty means an inert context
    /// (the system iterates no entities).
    pub filters: Vec<FilterDecl>,
    /// Component types a reactive system watches. Required when
    /// [`Capabilities::REACTIVE`] is declared.
    pub watch: Vec<FilterTarget>,
    /// Message types a messager system receives. Required when
    /// [`Capabilities::MESSAGER`] is declared.
    pub messages: Vec<TargetType>,
    /// Keep running while the world is paused.
    pub do_not_pause: bool,
    /// Force inclusion in the pause set even when `do_not_pause` or render
    /// status would exempt the system.
    pub include_on_pause: bool,
    /// Play-on-pause: inactive until the world pauses, active while paused.
    pub on_pause: bool,
}

impl SystemMeta {
    /// A metadata record with the given capabilities and no filters.
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Append a filter declaration.
    pub fn with_filter(mut self, filter: FilterDecl) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append a watched component type.
    pub fn watching(mut self, target: FilterTarget) -> Self {
        self.watch.push(target);
        self
    }

    /// Append a received message type.
    pub fn messaging<T: Component>(mut self) -> Self {
        self.messages.push(TargetType::of::<T>());
        self
    }
}

// ---------------------------------------------------------------------------
// ContextView
// ---------------------------------------------------------------------------

/// A system's view of its context for one invocation: the context id plus a
/// snapshot of the active members taken when the system was invoked.
///
/// The snapshot keeps iteration stable while the system mutates the world;
/// entities destroyed mid-iteration are still listed, so systems should
/// re-check liveness through the world when it matters.
#[derive(Debug, Clone)]
pub struct ContextView {
    id: ContextId,
    entities: Vec<EntityId>,
}

impl ContextView {
    pub(crate) fn new(id: ContextId, entities: Vec<EntityId>) -> Self {
        Self { id, entities }
    }

    /// The underlying context's id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The active members at invocation time, in first-match order.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Number of entities in the snapshot.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Iterate the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.iter().copied()
    }
}

// ---------------------------------------------------------------------------
// System trait
// ---------------------------------------------------------------------------

/// A code unit invoked by the world on phase events.
///
/// Implement the methods matching the capabilities declared in the system's
/// [`SystemMeta`]; everything else defaults to a no-op. The world only calls
/// methods whose capability was declared.
#[allow(unused_variables)]
pub trait System: 'static {
    /// [`Capabilities::EARLY_STARTUP`]: before regular startup.
    fn early_start(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::STARTUP`].
    fn start(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::UPDATE`].
    fn update(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::LATE_UPDATE`].
    fn late_update(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::FIXED_UPDATE`].
    fn fixed_update(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::EXIT`]: one-shot shutdown.
    fn exit(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::REACTIVE`]: a watched component appeared on these
    /// entities this frame.
    fn on_added(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::REACTIVE`]: a watched component was removed.
    fn on_removed(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::REACTIVE`]: a watched component was replaced.
    fn on_modified(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::REACTIVE`]: watched entities were activated.
    fn on_activated(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::REACTIVE`]: watched entities were deactivated.
    fn on_deactivated(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::REACTIVE`]: synchronous, before a watched component is
    /// removed.
    fn on_before_removing(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::REACTIVE`]: synchronous, before a watched component is
    /// replaced.
    fn on_before_modifying(&mut self, world: &mut World, entities: &[EntityId]) {}

    /// [`Capabilities::MESSAGER`]: a declared message was sent to an entity
    /// in the system's context. Dispatched synchronously at send time.
    fn on_message(
        &mut self,
        world: &mut World,
        entity: EntityId,
        message_id: ComponentId,
        message: &dyn Component,
    ) {
    }

    /// [`Capabilities::ACTIVATION_LISTENER`]: this system became active.
    fn on_system_activated(&mut self, world: &mut World, context: &ContextView) {}

    /// [`Capabilities::ACTIVATION_LISTENER`]: this system became inactive.
    fn on_system_deactivated(&mut self, world: &mut World, context: &ContextView) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
