//! Reactive watchers.
//!
//! A [`ComponentWatcher`] observes one component id within one context and
//! coalesces events into at most one notification per kind per entity per
//! frame. Buffers are popped by the world's reactive drain after the phase
//! body. A [`MessageWatcher`] observes a context's message channel and is
//! dispatched synchronously at send time, with no coalescing.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::component::ComponentId;
use crate::context::ContextId;
use crate::entity::{EntityEvent, EntityId};
use crate::system::SystemId;

// ---------------------------------------------------------------------------
// NotificationKind
// ---------------------------------------------------------------------------

/// The coalesced notification categories delivered to reactive systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Added,
    Removed,
    Modified,
    Enabled,
    Disabled,
}

impl NotificationKind {
    /// Dispatch order within one system's batch: a component removed and
    /// re-added in the same frame fires remove, then add.
    pub const DISPATCH_ORDER: [NotificationKind; 5] = [
        NotificationKind::Removed,
        NotificationKind::Added,
        NotificationKind::Modified,
        NotificationKind::Enabled,
        NotificationKind::Disabled,
    ];
}

// ---------------------------------------------------------------------------
// WatcherId
// ---------------------------------------------------------------------------

/// Identifier of a watcher: a hash of its context and target ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatcherId(pub(crate) u64);

impl fmt::Debug for WatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatcherId({:#x})", self.0)
    }
}

pub(crate) fn component_watcher_id(context: ContextId, target: ComponentId) -> WatcherId {
    let mut hasher = DefaultHasher::new();
    context.0.hash(&mut hasher);
    0u8.hash(&mut hasher);
    target.raw().hash(&mut hasher);
    WatcherId(hasher.finish())
}

/// `targets` must already be sorted so that declaration order cannot produce
/// distinct ids.
pub(crate) fn message_watcher_id(context: ContextId, targets: &[ComponentId]) -> WatcherId {
    let mut hasher = DefaultHasher::new();
    context.0.hash(&mut hasher);
    1u8.hash(&mut hasher);
    for id in targets {
        id.raw().hash(&mut hasher);
    }
    WatcherId(hasher.finish())
}

// ---------------------------------------------------------------------------
// WatcherAction
// ---------------------------------------------------------------------------

/// What the world must do after a watcher handled one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatcherAction {
    /// Nothing further.
    None,
    /// First notification enqueued this frame; the world records the watcher
    /// as triggered.
    NotifyWorld,
    /// `before_removing` callbacks must run synchronously, outside the
    /// coalescing buffer.
    BeforeRemoving(EntityId),
    /// `before_modifying` callbacks must run synchronously.
    BeforeModifying(EntityId),
}

// ---------------------------------------------------------------------------
// ComponentWatcher
// ---------------------------------------------------------------------------

/// Per-(context, component id) observer feeding reactive systems.
pub struct ComponentWatcher {
    id: WatcherId,
    context: ContextId,
    target: ComponentId,
    subscribers: Vec<SystemId>,
    /// Entities to notify, one entry per (kind, entity) per frame, in enqueue
    /// order.
    pending: HashMap<NotificationKind, Vec<EntityId>>,
    /// Whether the world was already told about pending work this frame.
    notified: bool,
}

impl ComponentWatcher {
    pub(crate) fn new(context: ContextId, target: ComponentId) -> Self {
        Self {
            id: component_watcher_id(context, target),
            context,
            target,
            subscribers: Vec::new(),
            pending: HashMap::new(),
            notified: false,
        }
    }

    /// This watcher's id.
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// The context this watcher observes.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The component id this watcher filters for.
    pub fn target(&self) -> ComponentId {
        self.target
    }

    /// Systems receiving this watcher's notifications, in registration order.
    pub fn subscribers(&self) -> &[SystemId] {
        &self.subscribers
    }

    pub(crate) fn subscribe_system(&mut self, system: SystemId) {
        if !self.subscribers.contains(&system) {
            self.subscribers.push(system);
        }
    }

    /// Whether any notification is buffered.
    pub fn has_pending(&self) -> bool {
        self.pending.values().any(|v| !v.is_empty())
    }

    fn enqueue(&mut self, kind: NotificationKind, entity: EntityId) -> WatcherAction {
        let slot = self.pending.entry(kind).or_default();
        if !slot.contains(&entity) {
            slot.push(entity);
        }
        if self.notified {
            WatcherAction::None
        } else {
            self.notified = true;
            WatcherAction::NotifyWorld
        }
    }

    fn cancel(&mut self, kind: NotificationKind, entity: EntityId) -> bool {
        if let Some(slot) = self.pending.get_mut(&kind) {
            let before = slot.len();
            slot.retain(|e| *e != entity);
            return slot.len() != before;
        }
        false
    }

    /// Apply one context event to the coalescing buffer.
    ///
    /// `entity_destroyed` is the destroyed flag of the event's entity at
    /// delivery time; events emitted by a destroy operation itself arrive
    /// before the flag is set, so a removal still records.
    pub(crate) fn handle(&mut self, event: EntityEvent, entity_destroyed: bool) -> WatcherAction {
        match event {
            EntityEvent::ComponentAdded { entity, component }
                if component == self.target && !entity_destroyed =>
            {
                self.enqueue(NotificationKind::Added, entity)
            }
            EntityEvent::ComponentRemoved {
                entity, component, ..
            } if component == self.target && !entity_destroyed => {
                // An add and a remove in the same frame cancel the add; the
                // remove is still signalled because the component did exist
                // mid-frame.
                self.cancel(NotificationKind::Added, entity);
                self.enqueue(NotificationKind::Removed, entity)
            }
            EntityEvent::ComponentModified { entity, component } if component == self.target => {
                self.enqueue(NotificationKind::Modified, entity)
            }
            EntityEvent::EntityActivated { entity } => {
                self.enqueue(NotificationKind::Enabled, entity)
            }
            EntityEvent::EntityDeactivated { entity } => {
                // An entity added and deactivated in the same frame was never
                // born: the queued add is dropped and no disable records.
                if self.cancel(NotificationKind::Added, entity) {
                    WatcherAction::None
                } else {
                    self.enqueue(NotificationKind::Disabled, entity)
                }
            }
            EntityEvent::ComponentBeforeRemoving {
                entity, component, ..
            } if component == self.target => WatcherAction::BeforeRemoving(entity),
            EntityEvent::ComponentBeforeModifying { entity, component }
                if component == self.target =>
            {
                WatcherAction::BeforeModifying(entity)
            }
            _ => WatcherAction::None,
        }
    }

    /// Return and clear the buffer, resetting the per-frame notify latch.
    ///
    /// The caller (the world) filters out entities destroyed since enqueue,
    /// except under [`NotificationKind::Removed`].
    pub(crate) fn pop_notifications(&mut self) -> HashMap<NotificationKind, Vec<EntityId>> {
        self.notified = false;
        std::mem::take(&mut self.pending)
    }
}

impl fmt::Debug for ComponentWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentWatcher")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("target", &self.target)
            .field("subscribers", &self.subscribers)
            .field("pending", &self.has_pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MessageWatcher
// ---------------------------------------------------------------------------

/// Per-(context, message set) observer dispatching messages synchronously.
pub struct MessageWatcher {
    id: WatcherId,
    context: ContextId,
    /// Sorted message ids this watcher forwards.
    targets: Vec<ComponentId>,
    subscribers: Vec<SystemId>,
}

impl MessageWatcher {
    /// `targets` is sorted and deduped here so equal sets share an id.
    pub(crate) fn new(context: ContextId, mut targets: Vec<ComponentId>) -> Self {
        targets.sort();
        targets.dedup();
        Self {
            id: message_watcher_id(context, &targets),
            context,
            targets,
            subscribers: Vec::new(),
        }
    }

    /// This watcher's id.
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// The context this watcher observes.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Sorted message ids this watcher forwards.
    pub fn targets(&self) -> &[ComponentId] {
        &self.targets
    }

    /// Systems receiving forwarded messages, in registration order.
    pub fn subscribers(&self) -> &[SystemId] {
        &self.subscribers
    }

    pub(crate) fn subscribe_system(&mut self, system: SystemId) {
        if !self.subscribers.contains(&system) {
            self.subscribers.push(system);
        }
    }

    /// Whether this watcher forwards messages under `id`.
    pub(crate) fn wants(&self, id: ComponentId) -> bool {
        self.targets.binary_search(&id).is_ok()
    }
}

impl fmt::Debug for MessageWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageWatcher")
            .field("id", &self.id)
            .field("context", &self.context)
            .field("targets", &self.targets)
            .field("subscribers", &self.subscribers)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
