//! The [`World`]: entities, contexts, watchers, systems, and the phase loop.
//!
//! The world owns every table in the engine and is the only place mutations
//! enter. Each mutating operation follows the same shape: adjust the entity's
//! plain data, re-offer the entity to the contexts whose membership could
//! have changed, then emit on the entity's channels. Channel handlers push
//! [`Delivery`] records into a queue which the world routes afterwards --
//! contexts re-emit member events to watchers, watchers coalesce
//! notifications, and message watchers dispatch synchronously. Nothing is
//! borrowed re-entrantly.
//!
//! Phase methods (`early_start`, `start`, `update`, `late_update`,
//! `fixed_update`, `exit`) run their cached system lists in registration
//! order. After the phase body the world drains the reactive queue to a
//! fixpoint, destroys pending entities, applies pending system activation
//! changes, and (for `update` only) clears the frame's messages.

use std::any::{type_name, TypeId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use tracing::{debug, warn};

use crate::component::{
    Component, ComponentDecl, ComponentId, ComponentIndex, ComponentIndexBuilder, Interface,
};
use crate::context::{
    compute_context_id, resolve_filters, AccessTable, Context, ContextId, FilterDecl, FilterTarget,
    FilterTargets,
};
use crate::entity::{Entity, EntityEvent, EntityId};
use crate::system::{Capabilities, ContextView, System, SystemId, SystemMeta};
use crate::watcher::{
    component_watcher_id, ComponentWatcher, MessageWatcher, NotificationKind, WatcherAction,
    WatcherId,
};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Delivery routing
// ---------------------------------------------------------------------------

/// One record pushed by a channel handler, routed by the world.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Delivery {
    /// An entity event for a context that subscribed to the entity.
    Context {
        context: ContextId,
        event: EntityEvent,
    },
    /// A member event re-emitted by a context for a component watcher.
    Watcher {
        watcher: WatcherId,
        event: EntityEvent,
    },
    /// A member message re-emitted by a context for a message watcher.
    MessageWatcher {
        watcher: WatcherId,
        event: EntityEvent,
    },
}

/// FIFO queue of pending deliveries; the sink type of every engine channel.
#[derive(Debug, Default)]
pub(crate) struct Deliveries {
    queue: VecDeque<Delivery>,
}

impl Deliveries {
    pub(crate) fn push(&mut self, delivery: Delivery) {
        self.queue.push_back(delivery);
    }

    fn pop(&mut self) -> Option<Delivery> {
        self.queue.pop_front()
    }
}

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// World construction options.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Enables the uniqueness assertion on unique lookups and the `requires`
    /// check on component adds.
    pub diagnostics: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            diagnostics: cfg!(debug_assertions),
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of component values to spawn an entity with.
///
/// ```
/// use vesper_ecs::prelude::*;
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Position { x: f32, y: f32 }
///
/// let mut world = World::builder()
///     .register_component::<Position>(ComponentDecl::new())
///     .build();
/// let entity = world.add_entity(ComponentBundle::new().with(Position { x: 0.0, y: 0.0 }));
/// assert!(world.has_component::<Position>(entity));
/// ```
#[derive(Default)]
pub struct ComponentBundle {
    entries: Vec<(TypeId, &'static str, Box<dyn Component>)>,
}

impl ComponentBundle {
    /// An empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component value.
    pub fn add<T: Component>(&mut self, component: T) {
        self.entries
            .push((TypeId::of::<T>(), type_name::<T>(), Box::new(component)));
    }

    /// Add a component value, builder-style.
    pub fn with<T: Component>(mut self, component: T) -> Self {
        self.add(component);
        self
    }

    /// Number of components in the bundle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle holds no components.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ComponentBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentBundle")
            .field("components", &self.entries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// System registry
// ---------------------------------------------------------------------------

struct SystemEntry {
    name: &'static str,
    type_id: TypeId,
    meta: SystemMeta,
    /// Taken out of the slot while the system runs, so the system can
    /// receive `&mut World`. A system never observes itself in the registry
    /// mid-call.
    runtime: Option<Box<dyn System>>,
    context: ContextId,
    active: bool,
}

#[derive(Debug, Default)]
struct PhaseLists {
    early_start: Vec<SystemId>,
    start: Vec<SystemId>,
    update: Vec<SystemId>,
    late_update: Vec<SystemId>,
    fixed_update: Vec<SystemId>,
    exit: Vec<SystemId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    EarlyStart,
    Start,
    Update,
    LateUpdate,
    FixedUpdate,
}

#[derive(Debug, Clone, Copy)]
enum BeforeKind {
    Removing,
    Modifying,
}

// ---------------------------------------------------------------------------
// WorldBuilder
// ---------------------------------------------------------------------------

struct PendingSystem {
    name: &'static str,
    type_id: TypeId,
    runtime: Box<dyn System>,
    meta: SystemMeta,
    active: bool,
}

/// Collects component registrations and systems, then builds the [`World`].
///
/// Systems are registered in declaration order; their [`SystemId`] is the
/// declaration index.
#[derive(Default)]
pub struct WorldBuilder {
    config: WorldConfig,
    index: ComponentIndexBuilder,
    systems: Vec<PendingSystem>,
}

impl WorldBuilder {
    /// Start an empty builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the world configuration.
    pub fn with_config(mut self, config: WorldConfig) -> Self {
        self.config = config;
        self
    }

    /// Register `T` as a tracked component type.
    pub fn register_component<T: Component>(mut self, decl: ComponentDecl) -> Self {
        self.index.component::<T>(decl);
        self
    }

    /// Register `T` as a tracked message type.
    pub fn register_message<T: Component>(mut self) -> Self {
        self.index.message::<T>();
        self
    }

    /// Register `T` as resolving to `interface`'s reserved component id.
    pub fn register_under_interface<T: Component>(mut self, interface: Interface) -> Self {
        self.index.under_interface::<T>(interface);
        self
    }

    /// Register a system with its metadata and initial activation state.
    ///
    /// Play-on-pause systems (`meta.on_pause`) always start inactive; they
    /// activate when the world pauses.
    pub fn with_system<S: System>(mut self, system: S, meta: SystemMeta, active: bool) -> Self {
        self.systems.push(PendingSystem {
            name: type_name::<S>(),
            type_id: TypeId::of::<S>(),
            runtime: Box::new(system),
            meta,
            active,
        });
        self
    }

    /// Build the world: lay out the component index, resolve every system's
    /// context, and wire up watchers.
    ///
    /// # Panics
    ///
    /// Panics if a system declares [`Capabilities::REACTIVE`] without watch
    /// targets, or [`Capabilities::MESSAGER`] without message targets.
    pub fn build(self) -> World {
        let mut world = World {
            config: self.config,
            index: self.index.build(),
            entities: HashMap::new(),
            deactivated_entities: HashMap::new(),
            next_entity_id: 0,
            contexts: HashMap::new(),
            context_order: Vec::new(),
            watchers: HashMap::new(),
            message_watchers: HashMap::new(),
            systems: Vec::new(),
            phase_lists: PhaseLists::default(),
            watchers_triggered: Vec::new(),
            pending_destroy: Vec::new(),
            pending_activate: Vec::new(),
            pending_deactivate: Vec::new(),
            systems_to_resume: Vec::new(),
            entities_with_messages: Vec::new(),
            paused: false,
            exiting: false,
        };

        for (i, pending) in self.systems.into_iter().enumerate() {
            let id = SystemId(i as u32);
            let meta = pending.meta;
            let capabilities = meta.capabilities;

            assert!(
                !capabilities.contains(Capabilities::REACTIVE) || !meta.watch.is_empty(),
                "system '{}' declares Reactive but watches no component types",
                pending.name,
            );
            assert!(
                !capabilities.contains(Capabilities::MESSAGER) || !meta.messages.is_empty(),
                "system '{}' declares Messager but receives no message types",
                pending.name,
            );

            let (targets, access) = resolve_filters(&meta.filters, &mut world.index);
            let context = world.ensure_context(targets, access);

            if capabilities.contains(Capabilities::REACTIVE) {
                let mut watched = Vec::new();
                for target in &meta.watch {
                    match target {
                        FilterTarget::Type(t) => {
                            watched.push(world.index.id_of_raw(t.type_id, t.name))
                        }
                        FilterTarget::Interface(interface) => {
                            watched.push(interface.id());
                            watched.extend(
                                world
                                    .index
                                    .all_under_interface(*interface)
                                    .into_iter()
                                    .map(|(_, comp)| comp),
                            );
                        }
                    }
                }
                watched.sort();
                watched.dedup();
                for comp in watched {
                    world.ensure_component_watcher(context, comp, id);
                }
            }

            if capabilities.contains(Capabilities::MESSAGER) {
                let message_ids: Vec<ComponentId> = meta
                    .messages
                    .iter()
                    .map(|t| world.index.id_of_raw(t.type_id, t.name))
                    .collect();
                world.ensure_message_watcher(context, message_ids, id);
            }

            if capabilities.contains(Capabilities::EARLY_STARTUP) {
                world.phase_lists.early_start.push(id);
            }
            if capabilities.contains(Capabilities::STARTUP) {
                world.phase_lists.start.push(id);
            }
            if capabilities.contains(Capabilities::UPDATE) {
                world.phase_lists.update.push(id);
            }
            if capabilities.contains(Capabilities::LATE_UPDATE) {
                world.phase_lists.late_update.push(id);
            }
            if capabilities.contains(Capabilities::FIXED_UPDATE) {
                world.phase_lists.fixed_update.push(id);
            }
            if capabilities.contains(Capabilities::EXIT) {
                world.phase_lists.exit.push(id);
            }

            let active = if meta.on_pause { false } else { pending.active };
            world.systems.push(SystemEntry {
                name: pending.name,
                type_id: pending.type_id,
                meta,
                runtime: Some(pending.runtime),
                context,
                active,
            });
        }

        debug!(
            systems = world.systems.len(),
            contexts = world.contexts.len(),
            "world built"
        );
        world
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The orchestrator owning all entities, contexts, watchers, and systems.
pub struct World {
    config: WorldConfig,
    index: ComponentIndex,
    /// Active (and pending-destroy) entities.
    entities: HashMap<EntityId, Entity>,
    /// Deactivated entities; still owned and reachable until destroyed.
    deactivated_entities: HashMap<EntityId, Entity>,
    next_entity_id: u64,
    contexts: HashMap<ContextId, Context>,
    /// Contexts in creation order; membership offers iterate this.
    context_order: Vec<ContextId>,
    watchers: HashMap<WatcherId, ComponentWatcher>,
    message_watchers: HashMap<WatcherId, MessageWatcher>,
    systems: Vec<SystemEntry>,
    phase_lists: PhaseLists,
    /// Watchers with pending notifications this frame, in trigger order.
    watchers_triggered: Vec<WatcherId>,
    pending_destroy: Vec<EntityId>,
    pending_activate: Vec<SystemId>,
    pending_deactivate: Vec<SystemId>,
    /// Systems deactivated by `pause`, to reactivate on `resume`.
    systems_to_resume: Vec<SystemId>,
    /// Entities with messages to clear at the end of `update`.
    entities_with_messages: Vec<EntityId>,
    paused: bool,
    exiting: bool,
}

impl World {
    /// Start building a world.
    pub fn builder() -> WorldBuilder {
        WorldBuilder::new()
    }

    /// The active configuration.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// The component index.
    pub fn component_index(&self) -> &ComponentIndex {
        &self.index
    }

    // -- internal entity access ---------------------------------------------

    fn entity_ref_any(&self, id: EntityId) -> Option<&Entity> {
        self.entities
            .get(&id)
            .or_else(|| self.deactivated_entities.get(&id))
    }

    fn entity_mut_any(&mut self, id: EntityId) -> Option<&mut Entity> {
        if self.entities.contains_key(&id) {
            self.entities.get_mut(&id)
        } else {
            self.deactivated_entities.get_mut(&id)
        }
    }

    fn entity_destroyed_or_missing(&self, id: EntityId) -> bool {
        self.entity_ref_any(id).is_none_or(|e| e.is_destroyed())
    }

    // -- entity lifecycle ---------------------------------------------------

    fn allocate_entity_id(&mut self) -> EntityId {
        // Scan past ids taken by explicit-id spawns; ids are never recycled
        // within a session.
        loop {
            let id = EntityId(self.next_entity_id);
            self.next_entity_id += 1;
            if !self.entities.contains_key(&id) && !self.deactivated_entities.contains_key(&id) {
                return id;
            }
        }
    }

    /// Spawn an entity with the bundle's components. Returns its fresh id.
    pub fn add_entity(&mut self, bundle: ComponentBundle) -> EntityId {
        let id = self.allocate_entity_id();
        self.spawn(id, bundle);
        id
    }

    /// Spawn an entity under a caller-chosen id.
    ///
    /// # Errors
    ///
    /// [`EcsError::EntityIdInUse`] if an entity with `id` already exists.
    pub fn add_entity_with_id(
        &mut self,
        id: EntityId,
        bundle: ComponentBundle,
    ) -> Result<EntityId, EcsError> {
        if self.entities.contains_key(&id) || self.deactivated_entities.contains_key(&id) {
            return Err(EcsError::EntityIdInUse(id));
        }
        self.spawn(id, bundle);
        Ok(id)
    }

    fn spawn(&mut self, id: EntityId, bundle: ComponentBundle) {
        let mut entity = Entity::new(id);
        let mut component_ids = Vec::new();
        for (type_id, name, value) in bundle.entries {
            let comp = self.index.id_of_raw(type_id, name);
            entity.insert_raw(comp, value);
            component_ids.push(comp);
        }
        component_ids.sort();
        component_ids.dedup();
        self.entities.insert(id, entity);

        // Contexts subscribe before the add events fire, so watchers observe
        // the spawn through the ordinary component-added path.
        self.refilter_entity(id);
        for comp in component_ids {
            if self.config.diagnostics {
                self.check_requires(id, comp);
            }
            self.emit_entity_event(
                id,
                EntityEvent::ComponentAdded {
                    entity: id,
                    component: comp,
                },
            );
        }
    }

    /// Schedule `id` for destruction: emits removal events for each present
    /// component, marks the entity destroyed, and cascades to children.
    /// Storage is reclaimed at the end of the phase.
    pub fn destroy_entity(&mut self, id: EntityId) {
        let (component_ids, children) = {
            let Some(entity) = self.entity_ref_any(id) else {
                return;
            };
            if entity.is_destroyed() || self.pending_destroy.contains(&id) {
                return;
            }
            (entity.component_ids(), entity.children())
        };
        self.pending_destroy.push(id);

        // Removal events go out before the destroyed flag flips, so watchers
        // still record the removals.
        for comp in &component_ids {
            self.emit_entity_event(
                id,
                EntityEvent::ComponentBeforeRemoving {
                    entity: id,
                    component: *comp,
                    caused_by_destroy: true,
                },
            );
            self.emit_entity_event(
                id,
                EntityEvent::ComponentRemoved {
                    entity: id,
                    component: *comp,
                    caused_by_destroy: true,
                },
            );
        }
        if let Some(entity) = self.entity_mut_any(id) {
            entity.mark_destroyed();
        }
        self.emit_entity_event(id, EntityEvent::EntityDestroyed { entity: id });

        for child in children {
            self.destroy_entity(child);
        }
    }

    /// Deactivate `id` and its active descendants. Idempotent.
    pub fn deactivate_entity(&mut self, id: EntityId) {
        self.deactivate_entity_inner(id, false);
    }

    fn deactivate_entity_inner(&mut self, id: EntityId, from_parent: bool) {
        {
            let Some(entity) = self.entity_mut_any(id) else {
                return;
            };
            if entity.is_destroyed() || entity.is_deactivated() {
                return;
            }
            entity.set_deactivated(true, from_parent);
        }
        if let Some(entity) = self.entities.remove(&id) {
            self.deactivated_entities.insert(id, entity);
        }
        self.emit_entity_event(id, EntityEvent::EntityDeactivated { entity: id });

        let children = self
            .entity_ref_any(id)
            .map(|e| e.children())
            .unwrap_or_default();
        for child in children {
            self.deactivate_entity_inner(child, true);
        }
    }

    /// Reactivate `id` and the descendants whose deactivation it caused.
    /// Idempotent; children deactivated independently stay deactivated.
    pub fn activate_entity(&mut self, id: EntityId) {
        self.activate_entity_inner(id, false);
    }

    fn activate_entity_inner(&mut self, id: EntityId, from_parent: bool) {
        {
            let Some(entity) = self.entity_mut_any(id) else {
                return;
            };
            if entity.is_destroyed() || !entity.is_deactivated() {
                return;
            }
            if from_parent && !entity.deactivated_from_parent() {
                return;
            }
            entity.set_deactivated(false, false);
        }
        if let Some(entity) = self.deactivated_entities.remove(&id) {
            self.entities.insert(id, entity);
        }
        self.emit_entity_event(id, EntityEvent::EntityActivated { entity: id });

        let children = self
            .entity_ref_any(id)
            .map(|e| e.children())
            .unwrap_or_default();
        for child in children {
            self.activate_entity_inner(child, true);
        }
    }

    // -- component operations -----------------------------------------------

    /// Add a component to an entity.
    ///
    /// Adding a component that is already present logs a warning and does
    /// nothing; use [`replace_component`](Self::replace_component). Mutating
    /// a destroyed entity is a silent no-op.
    pub fn add_component<T: Component>(&mut self, id: EntityId, component: T) {
        let comp = self.index.id_of::<T>();
        self.add_component_boxed(id, comp, Box::new(component));
    }

    fn add_component_boxed(&mut self, id: EntityId, comp: ComponentId, value: Box<dyn Component>) {
        {
            let Some(entity) = self.entity_ref_any(id) else {
                return;
            };
            if entity.is_destroyed() {
                return;
            }
            if entity.has_component(comp) {
                warn!(
                    entity = %id,
                    component = self.index.name_of(comp),
                    "add_component: already present, use replace_component",
                );
                return;
            }
        }
        if let Some(entity) = self.entity_mut_any(id) {
            entity.insert_raw(comp, value);
        }
        if self.config.diagnostics {
            self.check_requires(id, comp);
        }
        self.refilter_entity(id);
        self.emit_entity_event(
            id,
            EntityEvent::ComponentAdded {
                entity: id,
                component: comp,
            },
        );
    }

    /// Replace a present component's value.
    ///
    /// Replacing an absent component logs a warning and does nothing; use
    /// [`add_component`](Self::add_component). When `force` is false and the
    /// new value compares structurally equal to the old one, the replacement
    /// short-circuits and no events fire.
    pub fn replace_component<T: Component>(&mut self, id: EntityId, component: T, force: bool) {
        let comp = self.index.id_of::<T>();
        self.replace_component_boxed(id, comp, Box::new(component), force);
    }

    fn replace_component_boxed(
        &mut self,
        id: EntityId,
        comp: ComponentId,
        value: Box<dyn Component>,
        force: bool,
    ) {
        {
            let Some(entity) = self.entity_ref_any(id) else {
                return;
            };
            if entity.is_destroyed() {
                return;
            }
            if !entity.has_component(comp) {
                warn!(
                    entity = %id,
                    component = self.index.name_of(comp),
                    "replace_component: absent, use add_component",
                );
                return;
            }
            if !force
                && entity
                    .get(comp)
                    .is_some_and(|old| old.value_eq(value.as_ref()))
            {
                return;
            }
        }
        self.emit_entity_event(
            id,
            EntityEvent::ComponentBeforeModifying {
                entity: id,
                component: comp,
            },
        );
        {
            // A before handler may have destroyed the entity meanwhile.
            let Some(entity) = self.entity_mut_any(id) else {
                return;
            };
            if entity.is_destroyed() {
                return;
            }
            entity.insert_raw(comp, value);
        }
        self.emit_entity_event(
            id,
            EntityEvent::ComponentModified {
                entity: id,
                component: comp,
            },
        );
    }

    /// Add the component if absent, replace it otherwise.
    pub fn add_or_replace_component<T: Component>(&mut self, id: EntityId, component: T) {
        let comp = self.index.id_of::<T>();
        let present = self
            .entity_ref_any(id)
            .is_some_and(|e| e.has_component(comp));
        if present {
            self.replace_component_boxed(id, comp, Box::new(component), false);
        } else {
            self.add_component_boxed(id, comp, Box::new(component));
        }
    }

    /// Remove a component by type. Removing an absent component is a no-op;
    /// removing the last component destroys the entity.
    pub fn remove_component<T: Component>(&mut self, id: EntityId) {
        let Some(comp) = self.index.lookup::<T>() else {
            return;
        };
        self.remove_component_id(id, comp);
    }

    /// Remove a component by id.
    pub fn remove_component_id(&mut self, id: EntityId, comp: ComponentId) {
        self.remove_component_inner(id, comp, true);
    }

    fn remove_component_inner(&mut self, id: EntityId, comp: ComponentId, allow_destroy: bool) {
        let will_destroy = {
            let Some(entity) = self.entity_ref_any(id) else {
                return;
            };
            if entity.is_destroyed() || !entity.has_component(comp) {
                return;
            }
            allow_destroy && entity.component_count() == 1
        };
        self.emit_entity_event(
            id,
            EntityEvent::ComponentBeforeRemoving {
                entity: id,
                component: comp,
                caused_by_destroy: will_destroy,
            },
        );
        let removed = {
            let Some(entity) = self.entity_mut_any(id) else {
                return;
            };
            if entity.is_destroyed() {
                return;
            }
            entity.remove_raw(comp).is_some()
        };
        if !removed {
            return;
        }
        self.emit_entity_event(
            id,
            EntityEvent::ComponentRemoved {
                entity: id,
                component: comp,
                caused_by_destroy: will_destroy,
            },
        );
        self.refilter_entity(id);

        let now_empty = self
            .entity_ref_any(id)
            .is_some_and(|e| e.component_count() == 0 && !e.is_destroyed());
        if allow_destroy && now_empty {
            self.destroy_entity(id);
        }
    }

    /// Replace an entity's component set wholesale.
    ///
    /// With `wipe`, components absent from the bundle are removed first,
    /// except those declared `keep_on_replace`; the entity survives even if
    /// every component is momentarily gone. Children stay attached either
    /// way. Incoming components are then added or replaced one by one.
    pub fn replace_entity(&mut self, id: EntityId, bundle: ComponentBundle, wipe: bool) {
        if self.entity_destroyed_or_missing(id) {
            return;
        }
        let incoming: Vec<(ComponentId, Box<dyn Component>)> = bundle
            .entries
            .into_iter()
            .map(|(type_id, name, value)| (self.index.id_of_raw(type_id, name), value))
            .collect();

        if wipe {
            let incoming_ids: Vec<ComponentId> = incoming.iter().map(|(c, _)| *c).collect();
            let present = self
                .entity_ref_any(id)
                .map(|e| e.component_ids())
                .unwrap_or_default();
            for comp in present {
                if incoming_ids.contains(&comp) {
                    continue;
                }
                if self.index.decl(comp).is_some_and(|d| d.keep_on_replace) {
                    continue;
                }
                self.remove_component_inner(id, comp, false);
            }
        }

        for (comp, value) in incoming {
            let present = self
                .entity_ref_any(id)
                .is_some_and(|e| e.has_component(comp));
            if present {
                self.replace_component_boxed(id, comp, value, false);
            } else {
                self.add_component_boxed(id, comp, value);
            }
        }
    }

    fn check_requires(&self, id: EntityId, comp: ComponentId) {
        let Some(decl) = self.index.decl(comp) else {
            return;
        };
        let Some(entity) = self.entity_ref_any(id) else {
            return;
        };
        for required in &decl.requires {
            let present = self
                .index
                .lookup_type_id(required.type_id)
                .is_some_and(|req| entity.has_component(req));
            if !present {
                warn!(
                    entity = %id,
                    component = self.index.name_of(comp),
                    requires = required.name(),
                    "missing required component",
                );
            }
        }
    }

    // -- component access ---------------------------------------------------

    /// Whether the entity currently carries `T`.
    pub fn has_component<T: Component>(&self, id: EntityId) -> bool {
        self.index.lookup::<T>().is_some_and(|comp| {
            self.entity_ref_any(id)
                .is_some_and(|e| e.has_component(comp))
        })
    }

    /// The entity's `T` component, if present.
    pub fn try_component<T: Component>(&self, id: EntityId) -> Option<&T> {
        let comp = self.index.lookup::<T>()?;
        self.entity_ref_any(id)?.get_as::<T>(comp)
    }

    /// The entity's `T` component.
    ///
    /// # Panics
    ///
    /// Panics when the component is absent; asking for a component that may
    /// be missing is [`try_component`](Self::try_component)'s job.
    pub fn component<T: Component>(&self, id: EntityId) -> &T {
        self.try_component::<T>(id).unwrap_or_else(|| {
            panic!(
                "{}",
                EcsError::MissingComponent {
                    entity: id,
                    component: type_name::<T>(),
                }
            )
        })
    }

    /// The message of type `T` sent to the entity this frame, if any.
    pub fn try_message<T: Component>(&self, id: EntityId) -> Option<&T> {
        let comp = self.index.lookup::<T>()?;
        self.entity_ref_any(id)?
            .message(comp)
            .and_then(|m| m.as_any().downcast_ref::<T>())
    }

    // -- messages -----------------------------------------------------------

    /// Send a message to an entity: stored for the rest of the frame,
    /// dispatched synchronously to interested messager systems, cleared at
    /// the end of `update`.
    ///
    /// # Panics
    ///
    /// Panics if `T` was registered as a component type.
    pub fn send_message<T: Component>(&mut self, id: EntityId, message: T) {
        let comp = self.index.id_of::<T>();
        assert!(
            self.index.usable_as_message(comp),
            "type '{}' is registered as a component and cannot be sent as a message",
            type_name::<T>(),
        );
        {
            let Some(entity) = self.entity_mut_any(id) else {
                return;
            };
            if entity.is_destroyed() {
                return;
            }
            entity.set_message(comp, Box::new(message));
        }
        if !self.entities_with_messages.contains(&id) {
            self.entities_with_messages.push(id);
        }
        self.refilter_entity(id);
        self.emit_entity_event(
            id,
            EntityEvent::MessageSent {
                entity: id,
                component: comp,
            },
        );
    }

    fn clear_frame_messages(&mut self) {
        let ids = std::mem::take(&mut self.entities_with_messages);
        for id in ids {
            let cleared = self
                .entity_mut_any(id)
                .is_some_and(|entity| entity.clear_messages());
            if cleared {
                self.refilter_entity(id);
            }
        }
    }

    // -- hierarchy ----------------------------------------------------------

    /// Attach `child` under `new_parent`, detaching it from any current
    /// parent first. Reparenting onto a destroyed or missing parent destroys
    /// the child; a deactivated parent deactivates it.
    pub fn reparent(&mut self, child: EntityId, new_parent: Option<EntityId>) {
        if new_parent == Some(child) {
            warn!(entity = %child, "reparent: entity cannot be its own parent");
            return;
        }
        let old_parent = {
            let Some(entity) = self.entity_ref_any(child) else {
                return;
            };
            entity.parent()
        };
        if let Some(old) = old_parent {
            if let Some(parent) = self.entity_mut_any(old) {
                parent.detach_child(child);
            }
        }
        if let Some(entity) = self.entity_mut_any(child) {
            entity.set_parent(None);
        }

        let Some(parent_id) = new_parent else {
            return;
        };
        let parent_state = self
            .entity_ref_any(parent_id)
            .map(|p| (p.is_destroyed(), p.is_deactivated()));
        match parent_state {
            None | Some((true, _)) => self.destroy_entity(child),
            Some((false, parent_deactivated)) => {
                if let Some(parent) = self.entity_mut_any(parent_id) {
                    parent.attach_child(child, None);
                }
                if let Some(entity) = self.entity_mut_any(child) {
                    entity.set_parent(Some(parent_id));
                }
                if parent_deactivated {
                    self.deactivate_entity_inner(child, true);
                }
            }
        }
    }

    /// Detach `child` from its parent, if any.
    pub fn unparent(&mut self, child: EntityId) {
        self.reparent(child, None);
    }

    /// Attach `child` under `parent`, optionally registering it by name.
    pub fn add_child(&mut self, parent: EntityId, child: EntityId, name: Option<&str>) {
        self.reparent(child, Some(parent));
        if let Some(name) = name {
            if let Some(parent_entity) = self.entity_mut_any(parent) {
                if parent_entity.has_child(child) {
                    parent_entity.attach_child(child, Some(name.to_owned()));
                }
            }
        }
    }

    /// Detach `child` from `parent`. No-op if `child` is not a child of
    /// `parent`.
    pub fn remove_child(&mut self, parent: EntityId, child: EntityId) {
        let is_child = self
            .entity_ref_any(parent)
            .is_some_and(|p| p.has_child(child));
        if is_child {
            self.reparent(child, None);
        }
    }

    /// Detach the child registered under `name` from `parent`.
    pub fn remove_child_by_name(&mut self, parent: EntityId, name: &str) {
        let child = self
            .entity_ref_any(parent)
            .and_then(|p| p.child_by_name(name));
        if let Some(child) = child {
            self.reparent(child, None);
        }
    }

    // -- entity queries -----------------------------------------------------

    /// The entity under `id`, active or deactivated.
    ///
    /// # Panics
    ///
    /// Panics when no such entity exists.
    pub fn get_entity(&self, id: EntityId) -> &Entity {
        self.try_get_entity(id)
            .unwrap_or_else(|| panic!("{}", EcsError::NoSuchEntity(id)))
    }

    /// The entity under `id`, if it exists (active or deactivated).
    pub fn try_get_entity(&self, id: EntityId) -> Option<&Entity> {
        self.entity_ref_any(id)
    }

    /// Ids of all active entities, sorted.
    pub fn get_all_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of active entities.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of deactivated entities.
    pub fn deactivated_entity_count(&self) -> usize {
        self.deactivated_entities.len()
    }

    /// Active entities carrying every one of `targets`, through the shared
    /// `all_of` context for that set.
    pub fn get_entities_with(&mut self, targets: &[FilterTarget]) -> Vec<EntityId> {
        let context = self.ensure_context_from_decls(&[FilterDecl::all_of(targets.to_vec())]);
        self.contexts
            .get(&context)
            .map(|c| c.entities().to_vec())
            .unwrap_or_default()
    }

    /// The single entity carrying the unique component `T`, if one exists.
    /// Prefers an active entity over a deactivated one.
    ///
    /// # Panics
    ///
    /// With diagnostics on, panics when more than one live entity carries
    /// `T`.
    pub fn try_get_unique_entity<T: Component>(&mut self) -> Option<EntityId> {
        let comp = self.index.id_of::<T>();
        let context = self.ensure_context(
            FilterTargets {
                any_of: vec![comp],
                ..FilterTargets::default()
            },
            AccessTable::default(),
        );
        let ctx = self.contexts.get(&context)?;
        let active = ctx.entities().first().copied();
        let deactivated = ctx.deactivated_entities();
        if self.config.diagnostics {
            let count = ctx.len() + deactivated.len();
            if count > 1 {
                panic!(
                    "{}",
                    EcsError::UniquenessViolation {
                        component: type_name::<T>().to_owned(),
                        count,
                    }
                );
            }
        }
        active.or_else(|| deactivated.first().copied())
    }

    /// The single entity carrying the unique component `T`.
    ///
    /// # Panics
    ///
    /// Panics when no entity carries `T`, or (with diagnostics on) when more
    /// than one does.
    pub fn get_unique_entity<T: Component>(&mut self) -> EntityId {
        self.try_get_unique_entity::<T>().unwrap_or_else(|| {
            panic!(
                "no entity carries unique component '{}'",
                type_name::<T>()
            )
        })
    }

    /// The unique component `T` itself.
    ///
    /// # Panics
    ///
    /// As [`get_unique_entity`](Self::get_unique_entity).
    pub fn get_unique<T: Component>(&mut self) -> &T {
        let entity = self.get_unique_entity::<T>();
        self.component::<T>(entity)
    }

    // -- contexts -----------------------------------------------------------

    /// The context under `id`, if it exists.
    pub fn context(&self, id: ContextId) -> Option<&Context> {
        self.contexts.get(&id)
    }

    /// Number of contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// A snapshot view of a context's active members.
    pub fn context_view(&self, id: ContextId) -> ContextView {
        ContextView::new(
            id,
            self.contexts
                .get(&id)
                .map(|c| c.entities().to_vec())
                .unwrap_or_default(),
        )
    }

    /// The context a system was registered with.
    pub fn context_of<S: System>(&self) -> Option<ContextId> {
        self.system_id_of::<S>()
            .map(|id| self.systems[id.0 as usize].context)
    }

    fn ensure_context_from_decls(&mut self, decls: &[FilterDecl]) -> ContextId {
        let (targets, access) = resolve_filters(decls, &mut self.index);
        self.ensure_context(targets, access)
    }

    fn ensure_context(&mut self, targets: FilterTargets, access: AccessTable) -> ContextId {
        let id = compute_context_id(&targets);
        if !self.contexts.contains_key(&id) {
            let mut context = Context::new(targets, access);
            let mut ids: Vec<EntityId> = self
                .entities
                .keys()
                .chain(self.deactivated_entities.keys())
                .copied()
                .collect();
            ids.sort();
            for entity_id in ids {
                if let Some(entity) = self.entity_mut_any(entity_id) {
                    context.refilter(entity);
                }
            }
            self.contexts.insert(id, context);
            self.context_order.push(id);
        }
        id
    }

    fn refilter_entity(&mut self, id: EntityId) {
        let order = self.context_order.clone();
        for context_id in order {
            let Some(mut context) = self.contexts.remove(&context_id) else {
                continue;
            };
            if let Some(entity) = self.entity_mut_any(id) {
                context.refilter(entity);
            }
            self.contexts.insert(context_id, context);
        }
    }

    // -- watchers -----------------------------------------------------------

    fn forward_watcher(id: WatcherId) -> Box<dyn FnMut(&mut Deliveries, &EntityEvent)> {
        Box::new(move |sink, event| {
            sink.push(Delivery::Watcher {
                watcher: id,
                event: *event,
            })
        })
    }

    fn ensure_component_watcher(
        &mut self,
        context: ContextId,
        target: ComponentId,
        system: SystemId,
    ) -> WatcherId {
        let id = component_watcher_id(context, target);
        if !self.watchers.contains_key(&id) {
            if let Some(ctx) = self.contexts.get_mut(&context) {
                let ch = &mut ctx.channels;
                ch.component_added.subscribe(Self::forward_watcher(id));
                ch.component_before_modifying
                    .subscribe(Self::forward_watcher(id));
                ch.component_modified.subscribe(Self::forward_watcher(id));
                ch.component_before_removing
                    .subscribe(Self::forward_watcher(id));
                ch.component_removed.subscribe(Self::forward_watcher(id));
                ch.entity_activated.subscribe(Self::forward_watcher(id));
                ch.entity_deactivated.subscribe(Self::forward_watcher(id));
            }
            self.watchers.insert(id, ComponentWatcher::new(context, target));
        }
        if let Some(watcher) = self.watchers.get_mut(&id) {
            watcher.subscribe_system(system);
        }
        id
    }

    fn ensure_message_watcher(
        &mut self,
        context: ContextId,
        targets: Vec<ComponentId>,
        system: SystemId,
    ) -> WatcherId {
        let watcher = MessageWatcher::new(context, targets);
        let id = watcher.id();
        if !self.message_watchers.contains_key(&id) {
            if let Some(ctx) = self.contexts.get_mut(&context) {
                ctx.channels.message_sent.subscribe(Box::new(move |sink, event| {
                    sink.push(Delivery::MessageWatcher {
                        watcher: id,
                        event: *event,
                    })
                }));
            }
            self.message_watchers.insert(id, watcher);
        }
        if let Some(watcher) = self.message_watchers.get_mut(&id) {
            watcher.subscribe_system(system);
        }
        id
    }

    /// The component watcher under `id`, if it exists.
    pub fn watcher(&self, id: WatcherId) -> Option<&ComponentWatcher> {
        self.watchers.get(&id)
    }

    /// Whether no watcher holds pending notifications.
    pub fn watchers_idle(&self) -> bool {
        self.watchers_triggered.is_empty() && self.watchers.values().all(|w| !w.has_pending())
    }

    // -- event emission and routing -----------------------------------------

    fn emit_entity_event(&mut self, id: EntityId, event: EntityEvent) {
        let mut sink = Deliveries::default();
        if let Some(entity) = self.entity_mut_any(id) {
            let channels = &mut entity.channels;
            let channel = match event {
                EntityEvent::ComponentAdded { .. } => &mut channels.component_added,
                EntityEvent::ComponentBeforeModifying { .. } => {
                    &mut channels.component_before_modifying
                }
                EntityEvent::ComponentModified { .. } => &mut channels.component_modified,
                EntityEvent::ComponentBeforeRemoving { .. } => {
                    &mut channels.component_before_removing
                }
                EntityEvent::ComponentRemoved { .. } => &mut channels.component_removed,
                EntityEvent::EntityActivated { .. } => &mut channels.entity_activated,
                EntityEvent::EntityDeactivated { .. } => &mut channels.entity_deactivated,
                EntityEvent::EntityDestroyed { .. } => &mut channels.entity_destroyed,
                EntityEvent::MessageSent { .. } => &mut channels.message_sent,
            };
            channel.emit(&mut sink, &event);
        }
        self.flush(sink);
    }

    fn flush(&mut self, mut sink: Deliveries) {
        while let Some(delivery) = sink.pop() {
            match delivery {
                Delivery::Context { context, event } => {
                    self.deliver_to_context(context, event, &mut sink)
                }
                Delivery::Watcher { watcher, event } => self.deliver_to_watcher(watcher, event),
                Delivery::MessageWatcher { watcher, event } => {
                    self.deliver_message(watcher, event)
                }
            }
        }
    }

    fn deliver_to_context(&mut self, context: ContextId, event: EntityEvent, sink: &mut Deliveries) {
        let Some(mut ctx) = self.contexts.remove(&context) else {
            return;
        };
        match event {
            EntityEvent::ComponentAdded { .. } => ctx.channels.component_added.emit(sink, &event),
            EntityEvent::ComponentBeforeModifying { .. } => {
                ctx.channels.component_before_modifying.emit(sink, &event)
            }
            EntityEvent::ComponentModified { .. } => {
                ctx.channels.component_modified.emit(sink, &event)
            }
            EntityEvent::ComponentBeforeRemoving { .. } => {
                ctx.channels.component_before_removing.emit(sink, &event)
            }
            EntityEvent::ComponentRemoved { .. } => {
                ctx.channels.component_removed.emit(sink, &event)
            }
            EntityEvent::EntityActivated { entity } => {
                ctx.note_member_activated(entity);
                ctx.channels.entity_activated.emit(sink, &event);
            }
            EntityEvent::EntityDeactivated { entity } => {
                ctx.note_member_deactivated(entity);
                ctx.channels.entity_deactivated.emit(sink, &event);
            }
            EntityEvent::EntityDestroyed { entity } => {
                if let Some(e) = self.entity_mut_any(entity) {
                    ctx.remove_member(e);
                }
            }
            EntityEvent::MessageSent { .. } => ctx.channels.message_sent.emit(sink, &event),
        }
        self.contexts.insert(context, ctx);
    }

    fn deliver_to_watcher(&mut self, watcher: WatcherId, event: EntityEvent) {
        let destroyed = self.entity_destroyed_or_missing(event.entity());
        let action = {
            let Some(w) = self.watchers.get_mut(&watcher) else {
                return;
            };
            w.handle(event, destroyed)
        };
        match action {
            WatcherAction::None => {}
            WatcherAction::NotifyWorld => self.queue_watcher_notification(watcher),
            WatcherAction::BeforeRemoving(entity) => {
                self.dispatch_before(watcher, BeforeKind::Removing, entity)
            }
            WatcherAction::BeforeModifying(entity) => {
                self.dispatch_before(watcher, BeforeKind::Modifying, entity)
            }
        }
    }

    fn queue_watcher_notification(&mut self, watcher: WatcherId) {
        self.watchers_triggered.push(watcher);
    }

    fn dispatch_before(&mut self, watcher: WatcherId, kind: BeforeKind, entity: EntityId) {
        let subscribers = match self.watchers.get(&watcher) {
            Some(w) => w.subscribers().to_vec(),
            None => return,
        };
        for system in subscribers {
            if !self.system_active(system) {
                continue;
            }
            self.with_system(system, |world, runtime| match kind {
                BeforeKind::Removing => runtime.on_before_removing(world, &[entity]),
                BeforeKind::Modifying => runtime.on_before_modifying(world, &[entity]),
            });
        }
    }

    fn deliver_message(&mut self, watcher: WatcherId, event: EntityEvent) {
        let EntityEvent::MessageSent { entity, component } = event else {
            return;
        };
        let subscribers = match self.message_watchers.get(&watcher) {
            Some(w) if w.wants(component) => w.subscribers().to_vec(),
            _ => return,
        };
        let Some(message) = self
            .entity_ref_any(entity)
            .and_then(|e| e.message(component))
            .map(|m| m.clone_value())
        else {
            return;
        };
        for system in subscribers {
            if !self.system_active(system) {
                continue;
            }
            self.with_system(system, |world, runtime| {
                runtime.on_message(world, entity, component, message.as_ref())
            });
        }
    }

    // -- system invocation --------------------------------------------------

    fn with_system(&mut self, id: SystemId, f: impl FnOnce(&mut World, &mut dyn System)) {
        let Some(entry) = self.systems.get_mut(id.0 as usize) else {
            return;
        };
        // A system already mid-call has an empty slot; its nested
        // notifications are skipped rather than re-entered.
        let Some(mut runtime) = entry.runtime.take() else {
            return;
        };
        f(self, runtime.as_mut());
        if let Some(entry) = self.systems.get_mut(id.0 as usize) {
            entry.runtime = Some(runtime);
        }
    }

    fn system_active(&self, id: SystemId) -> bool {
        self.systems.get(id.0 as usize).is_some_and(|e| e.active)
    }

    /// Number of registered systems.
    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// The names of all registered systems, in declaration order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|e| e.name).collect()
    }

    /// The declaration-index id of system type `S`, if registered.
    pub fn system_id_of<S: System>(&self) -> Option<SystemId> {
        let type_id = TypeId::of::<S>();
        self.systems
            .iter()
            .position(|e| e.type_id == type_id)
            .map(|i| SystemId(i as u32))
    }

    /// Whether system `S` is currently active.
    pub fn is_system_active<S: System>(&self) -> bool {
        self.system_id_of::<S>()
            .is_some_and(|id| self.system_active(id))
    }

    // -- system activation --------------------------------------------------

    /// Activate system `S`. With `immediate` the change applies now,
    /// otherwise at the end of the phase. Returns `false` for unknown or
    /// already-active systems.
    pub fn activate_system<S: System>(&mut self, immediate: bool) -> bool {
        match self.system_id_of::<S>() {
            Some(id) => self.activate_system_by_id(id, immediate),
            None => false,
        }
    }

    /// Deactivate system `S`. With `immediate` the change applies now,
    /// otherwise at the end of the phase. Returns `false` for unknown or
    /// already-inactive systems.
    pub fn deactivate_system<S: System>(&mut self, immediate: bool) -> bool {
        match self.system_id_of::<S>() {
            Some(id) => self.deactivate_system_by_id(id, immediate),
            None => false,
        }
    }

    fn activate_system_by_id(&mut self, id: SystemId, immediate: bool) -> bool {
        let Some(entry) = self.systems.get(id.0 as usize) else {
            return false;
        };
        if entry.active || self.pending_activate.contains(&id) {
            return false;
        }
        if immediate {
            self.set_system_active(id, true);
        } else {
            self.pending_deactivate.retain(|s| *s != id);
            self.pending_activate.push(id);
        }
        true
    }

    fn deactivate_system_by_id(&mut self, id: SystemId, immediate: bool) -> bool {
        let Some(entry) = self.systems.get(id.0 as usize) else {
            return false;
        };
        if !entry.active || self.pending_deactivate.contains(&id) {
            return false;
        }
        if immediate {
            self.set_system_active(id, false);
        } else {
            self.pending_activate.retain(|s| *s != id);
            self.pending_deactivate.push(id);
        }
        true
    }

    /// Immediately activate every registered system.
    pub fn activate_all_systems(&mut self) {
        for i in 0..self.systems.len() {
            self.activate_system_by_id(SystemId(i as u32), true);
        }
    }

    /// Immediately deactivate every system except those whose type is in
    /// `skip`.
    pub fn deactivate_all_systems(&mut self, skip: &[TypeId]) {
        for i in 0..self.systems.len() {
            if skip.contains(&self.systems[i].type_id) {
                continue;
            }
            self.deactivate_system_by_id(SystemId(i as u32), true);
        }
    }

    fn set_system_active(&mut self, id: SystemId, active: bool) {
        let Some(entry) = self.systems.get_mut(id.0 as usize) else {
            return;
        };
        if entry.active == active {
            return;
        }
        entry.active = active;
        let notify = entry
            .meta
            .capabilities
            .contains(Capabilities::ACTIVATION_LISTENER);
        let context = entry.context;
        if notify {
            let view = self.context_view(context);
            self.with_system(id, |world, runtime| {
                if active {
                    runtime.on_system_activated(world, &view);
                } else {
                    runtime.on_system_deactivated(world, &view);
                }
            });
        }
    }

    fn apply_pending_system_changes(&mut self) {
        let deactivate = std::mem::take(&mut self.pending_deactivate);
        for id in deactivate {
            self.set_system_active(id, false);
        }
        let activate = std::mem::take(&mut self.pending_activate);
        for id in activate {
            self.set_system_active(id, true);
        }
    }

    // -- pause --------------------------------------------------------------

    /// Whether pausing deactivates this system. Precedence:
    /// `include_on_pause` forces inclusion, render systems are exempt, then
    /// `do_not_pause`, then the update-kind check.
    fn is_pausable(meta: &SystemMeta) -> bool {
        if meta.include_on_pause {
            return true;
        }
        if meta.capabilities.contains(Capabilities::RENDER) {
            return false;
        }
        if meta.do_not_pause {
            return false;
        }
        meta.capabilities.intersects(Capabilities::PAUSABLE_KINDS)
    }

    /// Pause: deactivate pausable active systems (remembering them) and
    /// activate play-on-pause systems. Idempotent.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        for i in 0..self.systems.len() {
            let id = SystemId(i as u32);
            let (active, pausable) = {
                let entry = &self.systems[i];
                (entry.active, Self::is_pausable(&entry.meta))
            };
            if active && pausable {
                self.systems_to_resume.push(id);
                self.set_system_active(id, false);
            }
        }
        for i in 0..self.systems.len() {
            let id = SystemId(i as u32);
            if self.systems[i].meta.on_pause && !self.systems[i].active {
                self.set_system_active(id, true);
            }
        }
    }

    /// Resume: deactivate play-on-pause systems and reactivate the systems
    /// that `pause` deactivated. Idempotent.
    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        for i in 0..self.systems.len() {
            let id = SystemId(i as u32);
            if self.systems[i].meta.on_pause && self.systems[i].active {
                self.set_system_active(id, false);
            }
        }
        let resume = std::mem::take(&mut self.systems_to_resume);
        for id in resume {
            self.set_system_active(id, true);
        }
    }

    /// Whether the world is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    // -- phases -------------------------------------------------------------

    /// Run early-startup systems, then the end-of-phase steps.
    pub fn early_start(&mut self) {
        self.run_phase(Phase::EarlyStart);
    }

    /// Run startup systems, then the end-of-phase steps.
    pub fn start(&mut self) {
        self.run_phase(Phase::Start);
    }

    /// Run update systems; afterwards drain reactive notifications, destroy
    /// pending entities, apply pending system changes, and clear this frame's
    /// messages.
    pub fn update(&mut self) {
        self.run_phase(Phase::Update);
    }

    /// Run late-update systems, then the end-of-phase steps.
    pub fn late_update(&mut self) {
        self.run_phase(Phase::LateUpdate);
    }

    /// Run fixed-update systems, then the end-of-phase steps.
    pub fn fixed_update(&mut self) {
        self.run_phase(Phase::FixedUpdate);
    }

    fn run_phase(&mut self, phase: Phase) {
        if self.exiting {
            return;
        }
        let list = match phase {
            Phase::EarlyStart => self.phase_lists.early_start.clone(),
            Phase::Start => self.phase_lists.start.clone(),
            Phase::Update => self.phase_lists.update.clone(),
            Phase::LateUpdate => self.phase_lists.late_update.clone(),
            Phase::FixedUpdate => self.phase_lists.fixed_update.clone(),
        };
        for id in list {
            if !self.system_active(id) {
                continue;
            }
            let context = self.systems[id.0 as usize].context;
            let view = self.context_view(context);
            self.with_system(id, |world, runtime| match phase {
                Phase::EarlyStart => runtime.early_start(world, &view),
                Phase::Start => runtime.start(world, &view),
                Phase::Update => runtime.update(world, &view),
                Phase::LateUpdate => runtime.late_update(world, &view),
                Phase::FixedUpdate => runtime.fixed_update(world, &view),
            });
        }
        self.after_phase(phase == Phase::Update);
    }

    fn after_phase(&mut self, clear_messages: bool) {
        self.drain_reactive();
        self.destroy_pending_entities();
        self.apply_pending_system_changes();
        if clear_messages {
            self.clear_frame_messages();
        }
    }

    // -- reactive drain -----------------------------------------------------

    /// Drain the reactive queue to a fixpoint: pop every triggered watcher,
    /// merge notifications per subscribing system, dispatch in system
    /// registration order with kinds in the fixed order removed, added,
    /// modified, enabled, disabled -- and repeat while dispatch produced new
    /// pending notifications.
    fn drain_reactive(&mut self) {
        loop {
            let triggered = std::mem::take(&mut self.watchers_triggered);
            if triggered.is_empty() {
                break;
            }

            let mut buckets: BTreeMap<SystemId, HashMap<NotificationKind, Vec<EntityId>>> =
                BTreeMap::new();
            for watcher_id in triggered {
                let (notifications, subscribers) = {
                    let Some(watcher) = self.watchers.get_mut(&watcher_id) else {
                        continue;
                    };
                    (watcher.pop_notifications(), watcher.subscribers().to_vec())
                };
                for (kind, entities) in notifications {
                    // A destroy between enqueue and pop drops the entity,
                    // except from removal notifications.
                    let kept: Vec<EntityId> = entities
                        .into_iter()
                        .filter(|e| {
                            kind == NotificationKind::Removed
                                || !self.entity_destroyed_or_missing(*e)
                        })
                        .collect();
                    if kept.is_empty() {
                        continue;
                    }
                    for system in &subscribers {
                        let slot = buckets.entry(*system).or_default().entry(kind).or_default();
                        for entity in &kept {
                            if !slot.contains(entity) {
                                slot.push(*entity);
                            }
                        }
                    }
                }
            }

            for (system, kinds) in buckets {
                if !self.system_active(system) {
                    continue;
                }
                for kind in NotificationKind::DISPATCH_ORDER {
                    let Some(entities) = kinds.get(&kind) else {
                        continue;
                    };
                    if entities.is_empty() {
                        continue;
                    }
                    let entities = entities.clone();
                    self.with_system(system, |world, runtime| match kind {
                        NotificationKind::Removed => runtime.on_removed(world, &entities),
                        NotificationKind::Added => runtime.on_added(world, &entities),
                        NotificationKind::Modified => runtime.on_modified(world, &entities),
                        NotificationKind::Enabled => runtime.on_activated(world, &entities),
                        NotificationKind::Disabled => runtime.on_deactivated(world, &entities),
                    });
                }
            }
        }
    }

    fn destroy_pending_entities(&mut self) {
        let pending = std::mem::take(&mut self.pending_destroy);
        for id in pending {
            let parent = self.entity_ref_any(id).and_then(|e| e.parent());
            if let Some(parent_id) = parent {
                if let Some(parent) = self.entity_mut_any(parent_id) {
                    parent.detach_child(id);
                }
            }
            if let Some(mut entity) = self
                .entities
                .remove(&id)
                .or_else(|| self.deactivated_entities.remove(&id))
            {
                entity.dispose();
            }
        }
    }

    // -- shutdown -----------------------------------------------------------

    /// One-shot shutdown: run every registered exit system (active or not),
    /// then dispose every entity and context. Later phase calls are no-ops.
    pub fn exit(&mut self) {
        if self.exiting {
            return;
        }
        self.exiting = true;
        let list = self.phase_lists.exit.clone();
        for id in list {
            let context = self.systems[id.0 as usize].context;
            let view = self.context_view(context);
            self.with_system(id, |world, runtime| runtime.exit(world, &view));
        }
        self.teardown();
        debug!("world exited");
    }

    /// Whether `exit` (or `dispose`) ran.
    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// Tear everything down without running exit systems. Idempotent.
    pub fn dispose(&mut self) {
        self.exiting = true;
        self.teardown();
    }

    fn teardown(&mut self) {
        for entity in self.entities.values_mut() {
            entity.dispose();
        }
        for entity in self.deactivated_entities.values_mut() {
            entity.dispose();
        }
        self.entities.clear();
        self.deactivated_entities.clear();
        self.contexts.clear();
        self.context_order.clear();
        self.watchers.clear();
        self.message_watchers.clear();
        self.watchers_triggered.clear();
        self.pending_destroy.clear();
        self.pending_activate.clear();
        self.pending_deactivate.clear();
        self.systems_to_resume.clear();
        self.entities_with_messages.clear();
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entities.len())
            .field("deactivated", &self.deactivated_entities.len())
            .field("contexts", &self.contexts.len())
            .field("systems", &self.systems.len())
            .field("paused", &self.paused)
            .field("exiting", &self.exiting)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::target;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: i32,
        y: i32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Marker;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    fn empty_world() -> World {
        World::builder()
            .register_component::<Position>(ComponentDecl::new())
            .register_component::<Health>(ComponentDecl::new())
            .register_component::<Marker>(ComponentDecl::new().unique())
            .register_message::<Ping>()
            .build()
    }

    // -- 1. entity and component basics -------------------------------------

    #[test]
    fn spawn_and_read_components() {
        let mut world = empty_world();
        let e = world.add_entity(
            ComponentBundle::new()
                .with(Position { x: 1, y: 2 })
                .with(Health(10)),
        );
        assert!(world.has_component::<Position>(e));
        assert_eq!(world.component::<Position>(e), &Position { x: 1, y: 2 });
        assert_eq!(world.try_component::<Marker>(e), None);
        assert_eq!(world.entity_count(), 1);
    }

    #[test]
    #[should_panic(expected = "has no component")]
    fn component_on_absent_slot_panics() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        let _ = world.component::<Position>(e);
    }

    #[test]
    fn duplicate_add_is_a_warned_no_op() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.add_component(e, Health(99));
        assert_eq!(world.component::<Health>(e), &Health(1));
    }

    #[test]
    fn replace_absent_is_a_warned_no_op() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.replace_component(e, Position { x: 5, y: 5 }, false);
        assert!(!world.has_component::<Position>(e));
    }

    #[test]
    fn add_or_replace_dispatches_on_presence() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.add_or_replace_component(e, Health(2));
        assert_eq!(world.component::<Health>(e), &Health(2));
        world.add_or_replace_component(e, Position { x: 3, y: 4 });
        assert_eq!(world.component::<Position>(e), &Position { x: 3, y: 4 });
    }

    #[test]
    fn removing_the_last_component_destroys_the_entity() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.remove_component::<Health>(e);
        assert!(world.get_entity(e).is_destroyed());

        // Storage is reclaimed at the end of the phase.
        world.update();
        assert!(world.try_get_entity(e).is_none());
    }

    #[test]
    fn mutating_a_destroyed_entity_is_a_silent_no_op() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.destroy_entity(e);
        world.add_component(e, Position { x: 1, y: 1 });
        world.remove_component::<Health>(e);
        world.destroy_entity(e);
        assert!(world.get_entity(e).is_destroyed());
        assert!(world.get_entity(e).has_component(
            world.component_index().lookup::<Health>().unwrap()
        ));
    }

    // -- 2. entity id allocation --------------------------------------------

    #[test]
    fn entity_ids_are_monotonic_and_never_recycled() {
        let mut world = empty_world();
        let a = world.add_entity(ComponentBundle::new().with(Health(1)));
        let b = world.add_entity(ComponentBundle::new().with(Health(1)));
        assert!(b > a);

        world.destroy_entity(a);
        world.update();
        let c = world.add_entity(ComponentBundle::new().with(Health(1)));
        assert!(c > b, "destroyed ids are not reused");
    }

    #[test]
    fn explicit_ids_collide_and_are_scanned_past() {
        let mut world = empty_world();
        let chosen = EntityId(0);
        world
            .add_entity_with_id(chosen, ComponentBundle::new().with(Health(1)))
            .unwrap();
        assert!(matches!(
            world.add_entity_with_id(chosen, ComponentBundle::new()),
            Err(EcsError::EntityIdInUse(_))
        ));

        // The allocator skips the taken id.
        let next = world.add_entity(ComponentBundle::new().with(Health(2)));
        assert_ne!(next, chosen);
    }

    // -- 3. activation ------------------------------------------------------

    #[test]
    fn deactivate_and_activate_roundtrip() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.deactivate_entity(e);
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.deactivated_entity_count(), 1);
        assert!(world.get_entity(e).is_deactivated());

        // Idempotent.
        world.deactivate_entity(e);
        assert_eq!(world.deactivated_entity_count(), 1);

        world.activate_entity(e);
        assert_eq!(world.entity_count(), 1);
        assert!(!world.get_entity(e).is_deactivated());
    }

    // -- 4. unique lookups --------------------------------------------------

    #[test]
    fn unique_lookup_finds_the_single_holder() {
        let mut world = empty_world();
        assert_eq!(world.try_get_unique_entity::<Marker>(), None);

        let e = world.add_entity(ComponentBundle::new().with(Marker));
        assert_eq!(world.try_get_unique_entity::<Marker>(), Some(e));
        assert_eq!(world.get_unique::<Marker>(), &Marker);

        // A deactivated holder is still found.
        world.deactivate_entity(e);
        assert_eq!(world.try_get_unique_entity::<Marker>(), Some(e));
    }

    #[test]
    #[should_panic(expected = "unique")]
    fn uniqueness_violation_asserts_in_diagnostics() {
        let mut world = World::builder()
            .with_config(WorldConfig { diagnostics: true })
            .register_component::<Marker>(ComponentDecl::new().unique())
            .build();
        world.add_entity(ComponentBundle::new().with(Marker));
        world.add_entity(ComponentBundle::new().with(Marker));
        let _ = world.try_get_unique_entity::<Marker>();
    }

    // -- 5. contexts --------------------------------------------------------

    #[test]
    fn get_entities_with_uses_a_shared_context() {
        let mut world = empty_world();
        let a = world.add_entity(
            ComponentBundle::new()
                .with(Position { x: 0, y: 0 })
                .with(Health(1)),
        );
        let _b = world.add_entity(ComponentBundle::new().with(Health(1)));

        let contexts_before = world.context_count();
        let found = world.get_entities_with(&[target::<Position>(), target::<Health>()]);
        assert_eq!(found, vec![a]);
        assert_eq!(world.context_count(), contexts_before + 1);

        // The second query reuses the context.
        let _ = world.get_entities_with(&[target::<Health>(), target::<Position>()]);
        assert_eq!(world.context_count(), contexts_before + 1);
    }

    #[test]
    fn new_contexts_seed_from_existing_entities() {
        let mut world = empty_world();
        let a = world.add_entity(ComponentBundle::new().with(Health(1)));
        let b = world.add_entity(ComponentBundle::new().with(Health(2)));
        world.deactivate_entity(b);

        let found = world.get_entities_with(&[target::<Health>()]);
        assert_eq!(found, vec![a]);

        // The deactivated entity sits in the deactivated member set.
        world.activate_entity(b);
        let found = world.get_entities_with(&[target::<Health>()]);
        assert_eq!(found.len(), 2);
    }

    // -- 6. system activation -----------------------------------------------

    struct CountingSystem {
        updates: std::rc::Rc<std::cell::Cell<u32>>,
    }

    impl System for CountingSystem {
        fn update(&mut self, _world: &mut World, _context: &ContextView) {
            self.updates.set(self.updates.get() + 1);
        }
    }

    struct UnregisteredSystem;
    impl System for UnregisteredSystem {}

    fn counting_world() -> (World, std::rc::Rc<std::cell::Cell<u32>>) {
        let updates = std::rc::Rc::new(std::cell::Cell::new(0));
        let world = World::builder()
            .register_component::<Health>(ComponentDecl::new())
            .with_system(
                CountingSystem {
                    updates: updates.clone(),
                },
                SystemMeta::new(Capabilities::UPDATE),
                true,
            )
            .build();
        (world, updates)
    }

    #[test]
    fn unknown_system_activation_returns_false() {
        let (mut world, _) = counting_world();
        assert!(!world.activate_system::<UnregisteredSystem>(true));
        assert!(!world.deactivate_system::<UnregisteredSystem>(true));
    }

    #[test]
    fn deferred_deactivation_applies_after_the_phase() {
        let (mut world, updates) = counting_world();
        assert!(world.deactivate_system::<CountingSystem>(false));
        assert!(world.is_system_active::<CountingSystem>());

        // The system still runs this frame; the change lands afterwards.
        world.update();
        assert_eq!(updates.get(), 1);
        assert!(!world.is_system_active::<CountingSystem>());

        world.update();
        assert_eq!(updates.get(), 1);

        assert!(world.activate_system::<CountingSystem>(true));
        world.update();
        assert_eq!(updates.get(), 2);
    }

    #[test]
    fn activating_an_active_system_returns_false() {
        let (mut world, _) = counting_world();
        assert!(!world.activate_system::<CountingSystem>(true));
        assert!(world.deactivate_system::<CountingSystem>(true));
        assert!(!world.deactivate_system::<CountingSystem>(true));
    }

    // -- 7. pause policy ----------------------------------------------------

    struct PlainUpdate;
    impl System for PlainUpdate {}

    struct Renderish;
    impl System for Renderish {}

    struct Stubborn;
    impl System for Stubborn {}

    struct ForcedIn;
    impl System for ForcedIn {}

    struct PauseMenu;
    impl System for PauseMenu {}

    fn pause_world() -> World {
        World::builder()
            .register_component::<Health>(ComponentDecl::new())
            .with_system(PlainUpdate, SystemMeta::new(Capabilities::UPDATE), true)
            .with_system(
                Renderish,
                SystemMeta::new(Capabilities::UPDATE | Capabilities::RENDER),
                true,
            )
            .with_system(
                Stubborn,
                SystemMeta {
                    capabilities: Capabilities::UPDATE,
                    do_not_pause: true,
                    ..SystemMeta::default()
                },
                true,
            )
            .with_system(
                ForcedIn,
                SystemMeta {
                    capabilities: Capabilities::UPDATE | Capabilities::RENDER,
                    do_not_pause: true,
                    include_on_pause: true,
                    ..SystemMeta::default()
                },
                true,
            )
            .with_system(
                PauseMenu,
                SystemMeta {
                    capabilities: Capabilities::UPDATE,
                    on_pause: true,
                    ..SystemMeta::default()
                },
                true,
            )
            .build()
    }

    #[test]
    fn pause_precedence_chain() {
        let mut world = pause_world();

        // Play-on-pause systems start inactive even when declared active.
        assert!(!world.is_system_active::<PauseMenu>());

        world.pause();
        assert!(world.is_paused());
        assert!(!world.is_system_active::<PlainUpdate>(), "plain update pauses");
        assert!(world.is_system_active::<Renderish>(), "render systems are exempt");
        assert!(world.is_system_active::<Stubborn>(), "do_not_pause exempts");
        assert!(
            !world.is_system_active::<ForcedIn>(),
            "include_on_pause overrides both render status and do_not_pause"
        );
        assert!(world.is_system_active::<PauseMenu>(), "play-on-pause activates");

        world.resume();
        assert!(!world.is_paused());
        assert!(world.is_system_active::<PlainUpdate>());
        assert!(world.is_system_active::<ForcedIn>());
        assert!(!world.is_system_active::<PauseMenu>());
    }

    // -- 8. messages --------------------------------------------------------

    #[test]
    fn messages_clear_at_end_of_update() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.send_message(e, Ping(7));
        assert_eq!(world.try_message::<Ping>(e), Some(&Ping(7)));

        world.update();
        assert_eq!(world.try_message::<Ping>(e), None);
    }

    #[test]
    #[should_panic(expected = "cannot be sent as a message")]
    fn sending_a_component_type_as_message_panics() {
        let mut world = empty_world();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        world.send_message(e, Position { x: 0, y: 0 });
    }

    // -- 9. metadata validation ---------------------------------------------

    #[test]
    #[should_panic(expected = "declares Reactive but watches no component types")]
    fn reactive_without_watch_targets_is_fatal() {
        struct BadReactive;
        impl System for BadReactive {}

        let _ = World::builder()
            .with_system(BadReactive, SystemMeta::new(Capabilities::REACTIVE), true)
            .build();
    }

    #[test]
    #[should_panic(expected = "declares Messager but receives no message types")]
    fn messager_without_message_targets_is_fatal() {
        struct BadMessager;
        impl System for BadMessager {}

        let _ = World::builder()
            .with_system(BadMessager, SystemMeta::new(Capabilities::MESSAGER), true)
            .build();
    }

    // -- 10. interfaces and activation listeners -----------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct Door;

    #[derive(Debug, Clone, PartialEq)]
    struct Lever;

    #[test]
    fn interface_filters_match_marker_registered_types() {
        let mut world = World::builder()
            .register_component::<Health>(ComponentDecl::new())
            .register_under_interface::<Door>(Interface::Interactive)
            .register_under_interface::<Lever>(Interface::Interactive)
            .build();

        let door = world.add_entity(ComponentBundle::new().with(Door));
        let lever = world.add_entity(ComponentBundle::new().with(Lever));
        let _plain = world.add_entity(ComponentBundle::new().with(Health(1)));

        // Both marker types resolve to the Interactive id, so one interface
        // filter finds them all.
        let interactive =
            world.get_entities_with(&[FilterTarget::Interface(Interface::Interactive)]);
        assert_eq!(interactive.len(), 2);
        assert!(interactive.contains(&door));
        assert!(interactive.contains(&lever));
    }

    struct Listener {
        transitions: std::rc::Rc<std::cell::RefCell<Vec<bool>>>,
    }

    impl System for Listener {
        fn on_system_activated(&mut self, _world: &mut World, _context: &ContextView) {
            self.transitions.borrow_mut().push(true);
        }

        fn on_system_deactivated(&mut self, _world: &mut World, _context: &ContextView) {
            self.transitions.borrow_mut().push(false);
        }
    }

    #[test]
    fn activation_listeners_hear_transitions() {
        let transitions = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut world = World::builder()
            .with_system(
                Listener {
                    transitions: transitions.clone(),
                },
                SystemMeta::new(Capabilities::UPDATE | Capabilities::ACTIVATION_LISTENER),
                true,
            )
            .build();

        // Registration itself is not a transition.
        assert!(transitions.borrow().is_empty());

        world.deactivate_system::<Listener>(true);
        world.activate_system::<Listener>(true);
        assert_eq!(*transitions.borrow(), vec![false, true]);

        // Pause-driven transitions go through the same path.
        world.pause();
        assert_eq!(*transitions.borrow(), vec![false, true, false]);
        world.resume();
        assert_eq!(*transitions.borrow(), vec![false, true, false, true]);
    }

    // -- 11. exit -----------------------------------------------------------

    struct ExitProbe {
        fired: std::rc::Rc<std::cell::Cell<bool>>,
    }

    impl System for ExitProbe {
        fn exit(&mut self, _world: &mut World, _context: &ContextView) {
            self.fired.set(true);
        }
    }

    #[test]
    fn exit_runs_exit_systems_even_when_inactive_and_disposes() {
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let mut world = World::builder()
            .register_component::<Health>(ComponentDecl::new())
            .with_system(
                ExitProbe {
                    fired: fired.clone(),
                },
                SystemMeta::new(Capabilities::EXIT),
                false,
            )
            .build();
        let e = world.add_entity(ComponentBundle::new().with(Health(1)));
        let d = world.add_entity(ComponentBundle::new().with(Health(2)));
        world.deactivate_entity(d);

        world.exit();
        assert!(fired.get());
        assert!(world.is_exiting());
        assert!(world.try_get_entity(e).is_none());
        assert!(world.try_get_entity(d).is_none());
        assert_eq!(world.context_count(), 0);

        // Subsequent phases are no-ops.
        world.update();
        assert!(world.is_exiting());
    }
}
