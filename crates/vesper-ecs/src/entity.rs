//! Entity storage: components, messages, hierarchy links, and event channels.
//!
//! An [`Entity`] is a bag of component values keyed by [`ComponentId`], plus
//! this frame's messages, a weak link to its parent, its named children, and
//! the lifecycle flags. Entities are owned by the world; every mutation that
//! has observable semantics (events, context membership, cascades) goes
//! through [`World`](crate::world::World) methods, which drive the plain data
//! operations defined here and emit on the entity's channels.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentId};
use crate::event::EventChannel;
use crate::world::Deliveries;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A non-negative entity identifier, unique and never recycled within a
/// world.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub(crate) u64);

impl EntityId {
    /// Raw `u64` representation.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
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
// EntityEvent
// ---------------------------------------------------------------------------

/// One event on an entity channel. A single argument type is shared by all
/// channels so that context and watcher handlers can forward events without
/// repackaging them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntityEvent {
    ComponentAdded {
        entity: EntityId,
        component: ComponentId,
    },
    ComponentBeforeModifying {
        entity: EntityId,
        component: ComponentId,
    },
    ComponentModified {
        entity: EntityId,
        component: ComponentId,
    },
    ComponentBeforeRemoving {
        entity: EntityId,
        component: ComponentId,
        caused_by_destroy: bool,
    },
    ComponentRemoved {
        entity: EntityId,
        component: ComponentId,
        caused_by_destroy: bool,
    },
    EntityActivated {
        entity: EntityId,
    },
    EntityDeactivated {
        entity: EntityId,
    },
    EntityDestroyed {
        entity: EntityId,
    },
    MessageSent {
        entity: EntityId,
        component: ComponentId,
    },
}

impl EntityEvent {
    /// The entity the event is about.
    pub(crate) fn entity(&self) -> EntityId {
        match *self {
            EntityEvent::ComponentAdded { entity, .. }
            | EntityEvent::ComponentBeforeModifying { entity, .. }
            | EntityEvent::ComponentModified { entity, .. }
            | EntityEvent::ComponentBeforeRemoving { entity, .. }
            | EntityEvent::ComponentRemoved { entity, .. }
            | EntityEvent::EntityActivated { entity }
            | EntityEvent::EntityDeactivated { entity }
            | EntityEvent::EntityDestroyed { entity }
            | EntityEvent::MessageSent { entity, .. } => entity,
        }
    }
}

// ---------------------------------------------------------------------------
// EntityChannels
// ---------------------------------------------------------------------------

/// The nine multicast channels of one entity, emitted in this order by the
/// world's lifecycle operations. Contexts subscribe to all of them while the
/// entity is one of their members.
#[derive(Debug, Default)]
pub(crate) struct EntityChannels {
    pub component_added: EventChannel<Deliveries, EntityEvent>,
    pub component_before_modifying: EventChannel<Deliveries, EntityEvent>,
    pub component_modified: EventChannel<Deliveries, EntityEvent>,
    pub component_before_removing: EventChannel<Deliveries, EntityEvent>,
    pub component_removed: EventChannel<Deliveries, EntityEvent>,
    pub entity_activated: EventChannel<Deliveries, EntityEvent>,
    pub entity_deactivated: EventChannel<Deliveries, EntityEvent>,
    pub entity_destroyed: EventChannel<Deliveries, EntityEvent>,
    pub message_sent: EventChannel<Deliveries, EntityEvent>,
}

impl EntityChannels {
    /// Drop every subscription on every channel.
    pub fn clear_all(&mut self) {
        self.component_added.clear();
        self.component_before_modifying.clear();
        self.component_modified.clear();
        self.component_before_removing.clear();
        self.component_removed.clear();
        self.entity_activated.clear();
        self.entity_deactivated.clear();
        self.entity_destroyed.clear();
        self.message_sent.clear();
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// One child link: the child's id and its optional name under this parent.
#[derive(Debug, Clone)]
struct ChildSlot {
    id: EntityId,
    name: Option<String>,
}

/// An identified container of components owned by the world.
pub struct Entity {
    id: EntityId,
    components: HashMap<ComponentId, Box<dyn Component>>,
    messages: HashMap<ComponentId, Box<dyn Component>>,
    parent: Option<EntityId>,
    /// Children in attachment order; order is what makes cascades
    /// deterministic.
    children: Vec<ChildSlot>,
    destroyed: bool,
    deactivated: bool,
    deactivated_from_parent: bool,
    pub(crate) channels: EntityChannels,
}

impl Entity {
    pub(crate) fn new(id: EntityId) -> Self {
        Self {
            id,
            components: HashMap::new(),
            messages: HashMap::new(),
            parent: None,
            children: Vec::new(),
            destroyed: false,
            deactivated: false,
            deactivated_from_parent: false,
            channels: EntityChannels::default(),
        }
    }

    /// This entity's id.
    pub fn id(&self) -> EntityId {
        self.id
    }

    // -- components ---------------------------------------------------------

    /// Whether the component slot `id` is currently present.
    pub fn has_component(&self, id: ComponentId) -> bool {
        self.components.contains_key(&id)
    }

    /// The erased component value under `id`, if present.
    pub fn get(&self, id: ComponentId) -> Option<&dyn Component> {
        self.components.get(&id).map(|c| c.as_ref())
    }

    /// Downcast the component under `id` to `T`.
    pub fn get_as<T: Component>(&self, id: ComponentId) -> Option<&T> {
        self.get(id).and_then(|c| c.as_any().downcast_ref::<T>())
    }

    /// Present component ids, sorted.
    pub fn component_ids(&self) -> Vec<ComponentId> {
        let mut ids: Vec<_> = self.components.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of present components.
    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub(crate) fn insert_raw(&mut self, id: ComponentId, value: Box<dyn Component>) {
        self.components.insert(id, value);
    }

    pub(crate) fn remove_raw(&mut self, id: ComponentId) -> Option<Box<dyn Component>> {
        self.components.remove(&id)
    }

    // -- messages -----------------------------------------------------------

    /// Whether a message under `id` was sent to this entity this frame.
    pub fn has_message(&self, id: ComponentId) -> bool {
        self.messages.contains_key(&id)
    }

    /// The message value under `id`, if one was sent this frame.
    pub fn message(&self, id: ComponentId) -> Option<&dyn Component> {
        self.messages.get(&id).map(|m| m.as_ref())
    }

    /// Component presence as seen by filters: present component or pending
    /// message.
    pub fn has_component_or_message(&self, id: ComponentId) -> bool {
        self.has_component(id) || self.has_message(id)
    }

    pub(crate) fn set_message(&mut self, id: ComponentId, value: Box<dyn Component>) {
        self.messages.insert(id, value);
    }

    pub(crate) fn clear_messages(&mut self) -> bool {
        let had = !self.messages.is_empty();
        self.messages.clear();
        had
    }

    // -- hierarchy ----------------------------------------------------------

    /// The parent entity, if any.
    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    /// Child ids in attachment order.
    pub fn children(&self) -> Vec<EntityId> {
        self.children.iter().map(|c| c.id).collect()
    }

    /// Whether `id` is a direct child.
    pub fn has_child(&self, id: EntityId) -> bool {
        self.children.iter().any(|c| c.id == id)
    }

    /// The child registered under `name`, if any.
    pub fn child_by_name(&self, name: &str) -> Option<EntityId> {
        self.children
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
            .map(|c| c.id)
    }

    /// The name a child was registered under, if it has one.
    pub fn child_name(&self, id: EntityId) -> Option<&str> {
        self.children
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.name.as_deref())
    }

    pub(crate) fn set_parent(&mut self, parent: Option<EntityId>) {
        self.parent = parent;
    }

    pub(crate) fn attach_child(&mut self, id: EntityId, name: Option<String>) {
        if let Some(slot) = self.children.iter_mut().find(|c| c.id == id) {
            slot.name = name;
        } else {
            self.children.push(ChildSlot { id, name });
        }
    }

    pub(crate) fn detach_child(&mut self, id: EntityId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| c.id != id);
        self.children.len() != before
    }

    // -- flags --------------------------------------------------------------

    /// Whether the entity was destroyed. Destroyed entities accept no further
    /// mutation.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Whether the entity is deactivated (by the host or through a parent).
    pub fn is_deactivated(&self) -> bool {
        self.deactivated
    }

    /// Whether the current deactivation was caused by a parent cascade.
    pub fn deactivated_from_parent(&self) -> bool {
        self.deactivated_from_parent
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    pub(crate) fn set_deactivated(&mut self, deactivated: bool, from_parent: bool) {
        self.deactivated = deactivated;
        self.deactivated_from_parent = deactivated && from_parent;
    }

    // -- teardown -----------------------------------------------------------

    /// Strip remaining storage and subscriptions. Called by the world at the
    /// end of the phase that destroyed the entity; notifications were already
    /// emitted by the destroy operation itself.
    pub(crate) fn dispose(&mut self) {
        self.components.clear();
        self.messages.clear();
        self.children.clear();
        self.parent = None;
        self.channels.clear_all();
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("components", &self.component_ids())
            .field("parent", &self.parent)
            .field("children", &self.children())
            .field("destroyed", &self.destroyed)
            .field("deactivated", &self.deactivated)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Poison(u32);

    const HEALTH: ComponentId = ComponentId(3);
    const POISON: ComponentId = ComponentId(4);

    #[test]
    fn component_storage_roundtrip() {
        let mut entity = Entity::new(EntityId(0));
        assert!(!entity.has_component(HEALTH));

        entity.insert_raw(HEALTH, Box::new(Health(10)));
        assert!(entity.has_component(HEALTH));
        assert_eq!(entity.get_as::<Health>(HEALTH), Some(&Health(10)));
        assert_eq!(entity.get_as::<Poison>(HEALTH), None);

        let removed = entity.remove_raw(HEALTH);
        assert!(removed.is_some());
        assert!(!entity.has_component(HEALTH));
    }

    #[test]
    fn component_ids_are_sorted() {
        let mut entity = Entity::new(EntityId(0));
        entity.insert_raw(POISON, Box::new(Poison(1)));
        entity.insert_raw(HEALTH, Box::new(Health(2)));
        assert_eq!(entity.component_ids(), vec![HEALTH, POISON]);
    }

    #[test]
    fn messages_count_toward_filter_presence() {
        let mut entity = Entity::new(EntityId(0));
        entity.set_message(POISON, Box::new(Poison(3)));

        assert!(!entity.has_component(POISON));
        assert!(entity.has_message(POISON));
        assert!(entity.has_component_or_message(POISON));

        assert!(entity.clear_messages());
        assert!(!entity.has_component_or_message(POISON));
        assert!(!entity.clear_messages(), "second clear reports nothing to do");
    }

    #[test]
    fn children_keep_attachment_order_and_names() {
        let mut entity = Entity::new(EntityId(0));
        entity.attach_child(EntityId(1), Some("arm".to_owned()));
        entity.attach_child(EntityId(2), None);
        entity.attach_child(EntityId(3), Some("leg".to_owned()));

        assert_eq!(
            entity.children(),
            vec![EntityId(1), EntityId(2), EntityId(3)]
        );
        assert_eq!(entity.child_by_name("arm"), Some(EntityId(1)));
        assert_eq!(entity.child_by_name("leg"), Some(EntityId(3)));
        assert_eq!(entity.child_name(EntityId(2)), None);
        assert!(entity.has_child(EntityId(2)));

        assert!(entity.detach_child(EntityId(2)));
        assert!(!entity.has_child(EntityId(2)));
        assert!(!entity.detach_child(EntityId(2)));
    }

    #[test]
    fn reattaching_a_child_renames_it() {
        let mut entity = Entity::new(EntityId(0));
        entity.attach_child(EntityId(1), Some("old".to_owned()));
        entity.attach_child(EntityId(1), Some("new".to_owned()));

        assert_eq!(entity.children().len(), 1);
        assert_eq!(entity.child_by_name("old"), None);
        assert_eq!(entity.child_by_name("new"), Some(EntityId(1)));
    }

    #[test]
    fn dispose_strips_everything() {
        let mut entity = Entity::new(EntityId(0));
        entity.insert_raw(HEALTH, Box::new(Health(1)));
        entity.set_message(POISON, Box::new(Poison(2)));
        entity.attach_child(EntityId(1), None);
        entity.set_parent(Some(EntityId(9)));

        entity.dispose();
        assert_eq!(entity.component_count(), 0);
        assert!(!entity.has_message(POISON));
        assert!(entity.children().is_empty());
        assert_eq!(entity.parent(), None);
    }
}
