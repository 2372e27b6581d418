//! Filters and contexts.
//!
//! A [`Context`] is the canonical subset of entities matching a filter
//! expression. Systems declaring byte-equal filters (in any order) share one
//! context object: the [`ContextId`] is a hash of the canonical form of the
//! filter -- sorted component ids per kind, kinds in ascending order, with
//! kind markers so ids and kinds cannot be confused. The exact hash function
//! is not load-bearing; the canonical form is.
//!
//! Contexts subscribe to the channels of their member entities and re-emit
//! member events on their own channels, which is where watchers listen.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentId, ComponentIndex, Interface, TargetType};
use crate::entity::{Entity, EntityEvent, EntityId};
use crate::event::{EventChannel, SubscriptionToken};
use crate::world::{Deliveries, Delivery};

// ---------------------------------------------------------------------------
// Filter declarations
// ---------------------------------------------------------------------------

/// How a filter's component list constrains membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FilterKind {
    /// Every listed component must be present.
    AllOf,
    /// At least one listed component must be present.
    AnyOf,
    /// No listed component may be present.
    NoneOf,
    /// Match nothing. Declared by systems that want reactive subscription
    /// without iterating entities.
    None,
}

/// Declared access to the filtered components. Metadata for a future
/// parallel scheduler; execution in this crate is sequential and does not
/// consult it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    /// Collapses to [`AccessKind::Write`] when the filter is resolved.
    ReadWrite,
}

/// One component reference in a filter: a concrete type or an interface that
/// expands to its reserved id plus every tracked type registered under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    Type(TargetType),
    Interface(Interface),
}

/// Reference the component type `T` in a filter or watch list.
pub fn target<T: Component>() -> FilterTarget {
    FilterTarget::Type(TargetType::of::<T>())
}

/// One filter declared by a system.
#[derive(Debug, Clone)]
pub struct FilterDecl {
    pub kind: FilterKind,
    pub access: AccessKind,
    pub targets: Vec<FilterTarget>,
}

impl FilterDecl {
    /// The default filter shape: `all_of` with `read_write` access.
    pub fn new(targets: Vec<FilterTarget>) -> Self {
        Self {
            kind: FilterKind::AllOf,
            access: AccessKind::ReadWrite,
            targets,
        }
    }

    /// An `all_of` filter.
    pub fn all_of(targets: Vec<FilterTarget>) -> Self {
        Self::new(targets)
    }

    /// An `any_of` filter.
    pub fn any_of(targets: Vec<FilterTarget>) -> Self {
        Self {
            kind: FilterKind::AnyOf,
            ..Self::new(targets)
        }
    }

    /// A `none_of` filter.
    pub fn none_of(targets: Vec<FilterTarget>) -> Self {
        Self {
            kind: FilterKind::NoneOf,
            ..Self::new(targets)
        }
    }

    /// The inert filter: the context matches nothing.
    pub fn none() -> Self {
        Self {
            kind: FilterKind::None,
            ..Self::new(Vec::new())
        }
    }

    /// Override the declared access.
    pub fn with_access(mut self, access: AccessKind) -> Self {
        self.access = access;
        self
    }
}

// ---------------------------------------------------------------------------
// Resolved filter targets
// ---------------------------------------------------------------------------

/// The canonical, id-resolved form of a filter expression: sorted, deduped
/// ids per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct FilterTargets {
    pub all_of: Vec<ComponentId>,
    pub any_of: Vec<ComponentId>,
    pub none_of: Vec<ComponentId>,
    /// Set when the declaration list is empty or contains a
    /// [`FilterKind::None`] filter; the context then matches nothing.
    pub inert: bool,
}

/// Resolved access declarations: sorted, deduped ids per access kind, with
/// `read_write` collapsed into `write`.
#[derive(Debug, Clone, Default)]
pub(crate) struct AccessTable {
    pub read: Vec<ComponentId>,
    pub write: Vec<ComponentId>,
}

fn sort_dedup(ids: &mut Vec<ComponentId>) {
    ids.sort();
    ids.dedup();
}

/// Resolve filter declarations against the component index, expanding
/// interface targets and assigning ids to unseen types.
pub(crate) fn resolve_filters(
    decls: &[FilterDecl],
    index: &mut ComponentIndex,
) -> (FilterTargets, AccessTable) {
    let mut targets = FilterTargets::default();
    let mut access = AccessTable::default();

    if decls.is_empty() {
        targets.inert = true;
        return (targets, access);
    }

    for decl in decls {
        if decl.kind == FilterKind::None {
            targets.inert = true;
            continue;
        }

        let mut ids = Vec::new();
        for target in &decl.targets {
            match target {
                FilterTarget::Type(t) => ids.push(index.id_of_raw(t.type_id, t.name)),
                FilterTarget::Interface(interface) => {
                    ids.push(interface.id());
                    ids.extend(
                        index
                            .all_under_interface(*interface)
                            .into_iter()
                            .map(|(_, id)| id),
                    );
                }
            }
        }

        match decl.kind {
            FilterKind::AllOf => targets.all_of.extend(&ids),
            FilterKind::AnyOf => targets.any_of.extend(&ids),
            FilterKind::NoneOf => targets.none_of.extend(&ids),
            FilterKind::None => unreachable!("handled above"),
        }
        match decl.access {
            AccessKind::Read => access.read.extend(&ids),
            AccessKind::Write | AccessKind::ReadWrite => access.write.extend(&ids),
        }
    }

    sort_dedup(&mut targets.all_of);
    sort_dedup(&mut targets.any_of);
    sort_dedup(&mut targets.none_of);
    sort_dedup(&mut access.read);
    sort_dedup(&mut access.write);
    (targets, access)
}

// ---------------------------------------------------------------------------
// ContextId
// ---------------------------------------------------------------------------

/// Identifier of a context: a hash of its canonical filter form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub(crate) u64);

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextId({:#x})", self.0)
    }
}

/// Hash the canonical filter form. Negative kind markers keep ids and kinds
/// from colliding; ids are offset by one so id 0 contributes to the hash.
pub(crate) fn compute_context_id(targets: &FilterTargets) -> ContextId {
    let mut hasher = DefaultHasher::new();
    for (marker, ids) in [
        (1i64, &targets.all_of),
        (2, &targets.any_of),
        (3, &targets.none_of),
    ] {
        if ids.is_empty() {
            continue;
        }
        (-marker).hash(&mut hasher);
        for id in ids {
            (i64::from(id.raw()) + 1).hash(&mut hasher);
        }
    }
    if targets.inert {
        (-4i64).hash(&mut hasher);
    }
    ContextId(hasher.finish())
}

// ---------------------------------------------------------------------------
// ContextChannels
// ---------------------------------------------------------------------------

/// Member-scoped re-emissions of entity events. Watchers subscribe here.
#[derive(Debug, Default)]
pub(crate) struct ContextChannels {
    pub component_added: EventChannel<Deliveries, EntityEvent>,
    pub component_before_modifying: EventChannel<Deliveries, EntityEvent>,
    pub component_modified: EventChannel<Deliveries, EntityEvent>,
    pub component_before_removing: EventChannel<Deliveries, EntityEvent>,
    pub component_removed: EventChannel<Deliveries, EntityEvent>,
    pub entity_activated: EventChannel<Deliveries, EntityEvent>,
    pub entity_deactivated: EventChannel<Deliveries, EntityEvent>,
    pub message_sent: EventChannel<Deliveries, EntityEvent>,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Tokens for one member entity's nine channel subscriptions, in the fixed
/// channel order used by `subscribe_to` / `unsubscribe_from`.
struct EntitySubscription {
    tokens: [SubscriptionToken; 9],
}

/// The shared, canonical subset of entities matching a filter expression.
pub struct Context {
    id: ContextId,
    targets: FilterTargets,
    access: AccessTable,
    /// Active members in the order they first matched.
    entities: Vec<EntityId>,
    entity_set: HashSet<EntityId>,
    /// Members that still match the filter but are deactivated.
    deactivated: HashSet<EntityId>,
    subscriptions: HashMap<EntityId, EntitySubscription>,
    pub(crate) channels: ContextChannels,
}

impl Context {
    pub(crate) fn new(targets: FilterTargets, access: AccessTable) -> Self {
        let id = compute_context_id(&targets);
        Self {
            id,
            targets,
            access,
            entities: Vec::new(),
            entity_set: HashSet::new(),
            deactivated: HashSet::new(),
            subscriptions: HashMap::new(),
            channels: ContextChannels::default(),
        }
    }

    /// This context's canonical id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Active members, in the order they first matched.
    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    /// Whether `entity` is an active member.
    pub fn contains(&self, entity: EntityId) -> bool {
        self.entity_set.contains(&entity)
    }

    /// Matching but deactivated members, sorted by id.
    pub fn deactivated_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.deactivated.iter().copied().collect();
        ids.sort();
        ids
    }

    /// Whether `entity` sits in the deactivated member set.
    pub fn contains_deactivated(&self, entity: EntityId) -> bool {
        self.deactivated.contains(&entity)
    }

    /// Number of active members.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the context has no active members.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Whether this context can never match an entity.
    pub fn is_inert(&self) -> bool {
        self.targets.inert
    }

    /// Required component ids (`all_of`).
    pub fn all_of(&self) -> &[ComponentId] {
        &self.targets.all_of
    }

    /// Alternative component ids (`any_of`).
    pub fn any_of(&self) -> &[ComponentId] {
        &self.targets.any_of
    }

    /// Excluded component ids (`none_of`).
    pub fn none_of(&self) -> &[ComponentId] {
        &self.targets.none_of
    }

    /// Component ids declared with read access.
    pub fn read_components(&self) -> &[ComponentId] {
        &self.access.read
    }

    /// Component ids declared with write access (includes `read_write`).
    pub fn write_components(&self) -> &[ComponentId] {
        &self.access.write
    }

    // -- filtering ----------------------------------------------------------

    /// Evaluate the filter predicate against an entity's current components
    /// and pending messages.
    pub(crate) fn matches(&self, entity: &Entity) -> bool {
        if self.targets.inert {
            return false;
        }
        if self
            .targets
            .none_of
            .iter()
            .any(|c| entity.has_component_or_message(*c))
        {
            return false;
        }
        if !self
            .targets
            .all_of
            .iter()
            .all(|c| entity.has_component_or_message(*c))
        {
            return false;
        }
        if !self.targets.any_of.is_empty()
            && !self
                .targets
                .any_of
                .iter()
                .any(|c| entity.has_component_or_message(*c))
        {
            return false;
        }
        true
    }

    /// Re-evaluate one entity's membership, adjusting the member sets and the
    /// channel subscription. Emits nothing; the world controls event order
    /// around this call.
    pub(crate) fn refilter(&mut self, entity: &mut Entity) {
        let id = entity.id();
        if !entity.is_destroyed() && self.matches(entity) {
            if entity.is_deactivated() {
                if self.entity_set.remove(&id) {
                    self.entities.retain(|e| *e != id);
                }
                self.deactivated.insert(id);
            } else {
                self.deactivated.remove(&id);
                if self.entity_set.insert(id) {
                    self.entities.push(id);
                }
            }
            if !self.subscriptions.contains_key(&id) {
                self.subscribe_to(entity);
            }
        } else {
            let was_active = self.entity_set.remove(&id);
            if was_active {
                self.entities.retain(|e| *e != id);
            }
            let was_deactivated = self.deactivated.remove(&id);
            if was_active || was_deactivated {
                self.unsubscribe_from(entity);
            }
        }
    }

    /// Move a member from the deactivated set back to the active set.
    pub(crate) fn note_member_activated(&mut self, id: EntityId) {
        if self.deactivated.remove(&id) && self.entity_set.insert(id) {
            self.entities.push(id);
        }
    }

    /// Move a member from the active set to the deactivated set.
    pub(crate) fn note_member_deactivated(&mut self, id: EntityId) {
        if self.entity_set.remove(&id) {
            self.entities.retain(|e| *e != id);
            self.deactivated.insert(id);
        }
    }

    /// Drop a member from both sets and release its subscription.
    pub(crate) fn remove_member(&mut self, entity: &mut Entity) {
        let id = entity.id();
        if self.entity_set.remove(&id) {
            self.entities.retain(|e| *e != id);
        }
        self.deactivated.remove(&id);
        self.unsubscribe_from(entity);
    }

    // -- entity channel wiring ----------------------------------------------

    fn forward(id: ContextId) -> Box<dyn FnMut(&mut Deliveries, &EntityEvent)> {
        Box::new(move |sink, event| {
            sink.push(Delivery::Context {
                context: id,
                event: *event,
            })
        })
    }

    fn subscribe_to(&mut self, entity: &mut Entity) {
        let id = self.id;
        let ch = &mut entity.channels;
        let tokens = [
            ch.component_added.subscribe(Self::forward(id)),
            ch.component_before_modifying.subscribe(Self::forward(id)),
            ch.component_modified.subscribe(Self::forward(id)),
            ch.component_before_removing.subscribe(Self::forward(id)),
            ch.component_removed.subscribe(Self::forward(id)),
            ch.entity_activated.subscribe(Self::forward(id)),
            ch.entity_deactivated.subscribe(Self::forward(id)),
            ch.entity_destroyed.subscribe(Self::forward(id)),
            ch.message_sent.subscribe(Self::forward(id)),
        ];
        self.subscriptions
            .insert(entity.id(), EntitySubscription { tokens });
    }

    fn unsubscribe_from(&mut self, entity: &mut Entity) {
        let Some(sub) = self.subscriptions.remove(&entity.id()) else {
            return;
        };
        let ch = &mut entity.channels;
        ch.component_added.unsubscribe(sub.tokens[0]);
        ch.component_before_modifying.unsubscribe(sub.tokens[1]);
        ch.component_modified.unsubscribe(sub.tokens[2]);
        ch.component_before_removing.unsubscribe(sub.tokens[3]);
        ch.component_removed.unsubscribe(sub.tokens[4]);
        ch.entity_activated.unsubscribe(sub.tokens[5]);
        ch.entity_deactivated.unsubscribe(sub.tokens[6]);
        ch.entity_destroyed.unsubscribe(sub.tokens[7]);
        ch.message_sent.unsubscribe(sub.tokens[8]);
    }

    /// Whether the context currently holds a subscription on `entity`.
    pub(crate) fn is_subscribed(&self, entity: EntityId) -> bool {
        self.subscriptions.contains_key(&entity)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("all_of", &self.targets.all_of)
            .field("any_of", &self.targets.any_of)
            .field("none_of", &self.targets.none_of)
            .field("inert", &self.targets.inert)
            .field("entities", &self.entities)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentDecl, ComponentIndexBuilder};

    #[derive(Debug, Clone, PartialEq)]
    struct A;

    #[derive(Debug, Clone, PartialEq)]
    struct B;

    #[derive(Debug, Clone, PartialEq)]
    struct C;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping;

    fn index() -> ComponentIndex {
        let mut builder = ComponentIndexBuilder::new();
        builder
            .component::<A>(ComponentDecl::new())
            .component::<B>(ComponentDecl::new().interface(Interface::Transform))
            .component::<C>(ComponentDecl::new())
            .message::<Ping>();
        builder.build()
    }

    fn context_for(decls: &[FilterDecl], index: &mut ComponentIndex) -> Context {
        let (targets, access) = resolve_filters(decls, index);
        Context::new(targets, access)
    }

    #[test]
    fn declaration_order_does_not_change_the_id() {
        let mut index = index();
        let ab = context_for(&[FilterDecl::all_of(vec![target::<A>(), target::<B>()])], &mut index);
        let ba = context_for(&[FilterDecl::all_of(vec![target::<B>(), target::<A>()])], &mut index);
        let split = context_for(
            &[
                FilterDecl::all_of(vec![target::<B>()]),
                FilterDecl::all_of(vec![target::<A>()]),
            ],
            &mut index,
        );
        assert_eq!(ab.id(), ba.id());
        assert_eq!(ab.id(), split.id());
    }

    #[test]
    fn different_kinds_produce_different_ids() {
        let mut index = index();
        let all = context_for(&[FilterDecl::all_of(vec![target::<A>()])], &mut index);
        let any = context_for(&[FilterDecl::any_of(vec![target::<A>()])], &mut index);
        let none = context_for(&[FilterDecl::none_of(vec![target::<A>()])], &mut index);
        assert_ne!(all.id(), any.id());
        assert_ne!(all.id(), none.id());
        assert_ne!(any.id(), none.id());
    }

    #[test]
    fn read_write_collapses_to_write() {
        let mut index = index();
        let ctx = context_for(
            &[
                FilterDecl::all_of(vec![target::<A>()]).with_access(AccessKind::ReadWrite),
                FilterDecl::any_of(vec![target::<B>()]).with_access(AccessKind::Read),
            ],
            &mut index,
        );
        let a = index.lookup::<A>().unwrap();
        let b = index.lookup::<B>().unwrap();
        assert_eq!(ctx.write_components(), &[a]);
        assert_eq!(ctx.read_components(), &[b]);
    }

    #[test]
    fn predicate_honours_all_any_none() {
        let mut index = index();
        let ctx = context_for(
            &[
                FilterDecl::all_of(vec![target::<A>()]),
                FilterDecl::any_of(vec![target::<B>(), target::<C>()]),
                FilterDecl::none_of(vec![target::<Ping>()]),
            ],
            &mut index,
        );
        let a = index.lookup::<A>().unwrap();
        let b = index.lookup::<B>().unwrap();
        let ping = index.lookup::<Ping>().unwrap();

        let mut entity = Entity::new(EntityId(0));
        assert!(!ctx.matches(&entity), "missing all_of");

        entity.insert_raw(a, Box::new(A));
        assert!(!ctx.matches(&entity), "missing any_of");

        entity.insert_raw(b, Box::new(B));
        assert!(ctx.matches(&entity));

        entity.set_message(ping, Box::new(Ping));
        assert!(!ctx.matches(&entity), "none_of sees pending messages");
    }

    #[test]
    fn message_presence_satisfies_filters() {
        let mut index = index();
        let ctx = context_for(&[FilterDecl::all_of(vec![target::<Ping>()])], &mut index);
        let ping = index.lookup::<Ping>().unwrap();

        let mut entity = Entity::new(EntityId(0));
        assert!(!ctx.matches(&entity));
        entity.set_message(ping, Box::new(Ping));
        assert!(ctx.matches(&entity));
    }

    #[test]
    fn inert_context_matches_nothing() {
        let mut index = index();
        let empty = context_for(&[], &mut index);
        let none = context_for(&[FilterDecl::none()], &mut index);
        assert_eq!(empty.id(), none.id());

        let a = index.lookup::<A>().unwrap();
        let mut entity = Entity::new(EntityId(0));
        entity.insert_raw(a, Box::new(A));
        assert!(!empty.matches(&entity));
    }

    #[test]
    fn interface_targets_expand_to_tracked_members() {
        let mut index = index();
        let ctx = context_for(
            &[FilterDecl::any_of(vec![FilterTarget::Interface(
                Interface::Transform,
            )])],
            &mut index,
        );
        let b = index.lookup::<B>().unwrap();
        assert!(ctx.any_of().contains(&Interface::Transform.id()));
        assert!(ctx.any_of().contains(&b));
    }

    #[test]
    fn refilter_tracks_membership_and_subscription() {
        let mut index = index();
        let mut ctx = context_for(&[FilterDecl::all_of(vec![target::<A>()])], &mut index);
        let a = index.lookup::<A>().unwrap();

        let mut entity = Entity::new(EntityId(7));
        entity.insert_raw(a, Box::new(A));

        ctx.refilter(&mut entity);
        assert!(ctx.contains(EntityId(7)));
        assert!(ctx.is_subscribed(EntityId(7)));
        assert_eq!(entity.channels.component_added.len(), 1);

        // Deactivated members move to the deactivated set but stay
        // subscribed.
        entity.set_deactivated(true, false);
        ctx.refilter(&mut entity);
        assert!(!ctx.contains(EntityId(7)));
        assert!(ctx.contains_deactivated(EntityId(7)));
        assert!(ctx.is_subscribed(EntityId(7)));

        // Losing the component releases membership and the subscription.
        entity.set_deactivated(false, false);
        entity.remove_raw(a);
        ctx.refilter(&mut entity);
        assert!(!ctx.contains(EntityId(7)));
        assert!(!ctx.contains_deactivated(EntityId(7)));
        assert!(!ctx.is_subscribed(EntityId(7)));
        assert_eq!(entity.channels.component_added.len(), 0);
    }

    #[test]
    fn members_keep_first_match_order() {
        let mut index = index();
        let mut ctx = context_for(&[FilterDecl::all_of(vec![target::<A>()])], &mut index);
        let a = index.lookup::<A>().unwrap();

        for raw in [4u64, 2, 9] {
            let mut entity = Entity::new(EntityId(raw));
            entity.insert_raw(a, Box::new(A));
            ctx.refilter(&mut entity);
        }
        assert_eq!(
            ctx.entities(),
            &[EntityId(4), EntityId(2), EntityId(9)]
        );
    }
}
