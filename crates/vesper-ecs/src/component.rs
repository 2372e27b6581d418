//! Component values, type registration, and the component index.
//!
//! Every component and message type used by a [`World`](crate::world::World)
//! maps to a stable [`ComponentId`] assigned by the [`ComponentIndex`].
//! Tracked ids are laid out at construction time: the reserved interface ids
//! first, then registered component types, then registered message types.
//! Types that were never registered receive *untracked* ids above both
//! ranges, lazily, on first lookup. Once assigned, an id never changes for
//! the life of the index.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ComponentId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a component or message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentId(pub(crate) u32);

impl ComponentId {
    /// Raw `u32` representation.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A component (or message) value.
///
/// Implemented automatically for every `'static` value type that is
/// `Debug + Clone + PartialEq + Send + Sync` -- plain data structs qualify
/// without any manual impl. The trait provides the type-erased operations the
/// engine needs: cloning into a box, structural comparison (used by
/// [`replace_component`](crate::world::World::replace_component) to
/// short-circuit no-op replacements), and downcasting.
pub trait Component: Any + fmt::Debug + Send + Sync {
    /// Clone this value into a fresh box.
    fn clone_value(&self) -> Box<dyn Component>;

    /// Structural equality against another erased value. `false` whenever the
    /// concrete types differ.
    fn value_eq(&self, other: &dyn Component) -> bool;

    /// Upcast for downcasting via [`Any`].
    fn as_any(&self) -> &dyn Any;
}

impl<T> Component for T
where
    T: Any + fmt::Debug + Clone + PartialEq + Send + Sync,
{
    fn clone_value(&self) -> Box<dyn Component> {
        Box::new(self.clone())
    }

    fn value_eq(&self, other: &dyn Component) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Clone for Box<dyn Component> {
    fn clone(&self) -> Self {
        (**self).clone_value()
    }
}

// ---------------------------------------------------------------------------
// Interface markers
// ---------------------------------------------------------------------------

/// Component interfaces with ids reserved at index construction.
///
/// Filters may target an interface; the target expands to the interface's own
/// reserved id plus every tracked concrete type registered under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interface {
    /// State-machine component category (reserved id 0).
    StateMachine,
    /// Interactive component category (reserved id 1).
    Interactive,
    /// Transform component category (reserved id 2).
    Transform,
}

impl Interface {
    /// Number of reserved interface ids.
    pub(crate) const COUNT: u32 = 3;

    /// The reserved [`ComponentId`] of this interface.
    pub const fn id(self) -> ComponentId {
        match self {
            Interface::StateMachine => ComponentId(0),
            Interface::Interactive => ComponentId(1),
            Interface::Transform => ComponentId(2),
        }
    }

    /// Human-readable name, for diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Interface::StateMachine => "StateMachine",
            Interface::Interactive => "Interactive",
            Interface::Transform => "Transform",
        }
    }
}

// ---------------------------------------------------------------------------
// TargetType
// ---------------------------------------------------------------------------

/// A component type referenced by metadata: its Rust [`TypeId`] plus the type
/// name for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetType {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
}

impl TargetType {
    /// Reference the component type `T`.
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The referenced type's name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ---------------------------------------------------------------------------
// ComponentDecl
// ---------------------------------------------------------------------------

/// Registration metadata for a component type.
#[derive(Debug, Clone, Default)]
pub struct ComponentDecl {
    /// At most one live entity in the world may carry this component.
    /// Checked only by the unique lookups when diagnostics are on.
    pub unique: bool,
    /// Survives a wholesale entity replace with `wipe = true`.
    pub keep_on_replace: bool,
    /// Component types this one expects alongside it. Diagnostics-only:
    /// a warning is logged when they are missing, nothing is auto-added.
    pub requires: Vec<TargetType>,
    /// Interface categories this concrete type belongs to.
    pub interfaces: Vec<Interface>,
}

impl ComponentDecl {
    /// An empty declaration (no flags, no interfaces).
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the component unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark the component as surviving a wiping replace.
    pub fn keep_on_replace(mut self) -> Self {
        self.keep_on_replace = true;
        self
    }

    /// Declare that entities carrying this component should also carry `T`.
    pub fn requires<T: 'static>(mut self) -> Self {
        self.requires.push(TargetType::of::<T>());
        self
    }

    /// Declare membership in an interface category.
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }
}

// ---------------------------------------------------------------------------
// Index entries
// ---------------------------------------------------------------------------

/// What kind of type an id was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// A reserved interface marker id.
    Interface(Interface),
    /// A tracked component type.
    Component,
    /// A tracked message type.
    Message,
    /// A lazily assigned id for a type never registered up front.
    Untracked,
}

#[derive(Debug)]
struct IndexEntry {
    name: String,
    kind: EntryKind,
    decl: ComponentDecl,
    type_id: Option<TypeId>,
}

// ---------------------------------------------------------------------------
// ComponentIndexBuilder
// ---------------------------------------------------------------------------

/// Collects type registrations so the [`ComponentIndex`] can lay out its
/// tracked id ranges in one pass: interfaces, then components, then messages.
#[derive(Debug, Default)]
pub struct ComponentIndexBuilder {
    components: Vec<(TargetType, ComponentDecl)>,
    messages: Vec<TargetType>,
    under_interface: Vec<(TargetType, Interface)>,
}

impl ComponentIndexBuilder {
    /// Start an empty registration set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` as a tracked component type.
    pub fn component<T: Component>(&mut self, decl: ComponentDecl) -> &mut Self {
        self.components.push((TargetType::of::<T>(), decl));
        self
    }

    /// Register `T` as a tracked message type.
    pub fn message<T: Component>(&mut self) -> &mut Self {
        self.messages.push(TargetType::of::<T>());
        self
    }

    /// Register `T` as resolving directly to `interface`'s reserved id.
    ///
    /// Every type registered this way shares the interface's id, so filters
    /// and storage treat all of them as one component slot. This is how a
    /// family of marker implementations (e.g. interactive behaviours) is
    /// expressed without reflection.
    pub fn under_interface<T: Component>(&mut self, interface: Interface) -> &mut Self {
        self.under_interface.push((TargetType::of::<T>(), interface));
        self
    }

    /// Assign the tracked id layout and produce the index.
    ///
    /// # Panics
    ///
    /// Panics if a type is registered twice, or as both a component and a
    /// message.
    pub fn build(self) -> ComponentIndex {
        let mut index = ComponentIndex {
            ids: HashMap::new(),
            entries: Vec::new(),
            component_count: self.components.len() as u32,
            message_count: self.messages.len() as u32,
        };

        for interface in [
            Interface::StateMachine,
            Interface::Interactive,
            Interface::Transform,
        ] {
            index.entries.push(IndexEntry {
                name: interface.name().to_owned(),
                kind: EntryKind::Interface(interface),
                decl: ComponentDecl::default(),
                type_id: None,
            });
        }

        for (target, decl) in self.components {
            index.insert_tracked(target, EntryKind::Component, decl);
        }
        for target in self.messages {
            index.insert_tracked(target, EntryKind::Message, ComponentDecl::default());
        }
        for (target, interface) in self.under_interface {
            let previous = index.ids.insert(target.type_id, interface.id());
            assert!(
                previous.is_none(),
                "type '{}' is already registered; it cannot also resolve to interface {}",
                target.name,
                interface.name(),
            );
        }

        index
    }
}

// ---------------------------------------------------------------------------
// ComponentIndex
// ---------------------------------------------------------------------------

/// Per-world mapping from Rust types to [`ComponentId`]s.
///
/// Tracked ids occupy `0..total_tracked` in the order interface markers,
/// component types, message types. Untracked ids are appended after that and
/// are stable once assigned.
#[derive(Debug)]
pub struct ComponentIndex {
    /// TypeId -> assigned id, including under-interface aliases.
    ids: HashMap<TypeId, ComponentId>,
    /// Entry per id, indexed by `ComponentId.0`.
    entries: Vec<IndexEntry>,
    component_count: u32,
    message_count: u32,
}

impl ComponentIndex {
    fn insert_tracked(&mut self, target: TargetType, kind: EntryKind, decl: ComponentDecl) {
        let id = ComponentId(self.entries.len() as u32);
        let previous = self.ids.insert(target.type_id, id);
        assert!(
            previous.is_none(),
            "type '{}' registered more than once",
            target.name,
        );
        self.entries.push(IndexEntry {
            name: target.name.to_owned(),
            kind,
            decl,
            type_id: Some(target.type_id),
        });
    }

    /// The canonical id of `T`, assigning an untracked id if `T` was never
    /// registered. Types registered under an interface resolve to the
    /// interface's reserved id.
    pub fn id_of<T: 'static>(&mut self) -> ComponentId {
        self.id_of_raw(TypeId::of::<T>(), type_name::<T>())
    }

    pub(crate) fn id_of_raw(&mut self, type_id: TypeId, name: &'static str) -> ComponentId {
        if let Some(&id) = self.ids.get(&type_id) {
            return id;
        }
        let id = ComponentId(self.entries.len() as u32);
        self.ids.insert(type_id, id);
        self.entries.push(IndexEntry {
            name: name.to_owned(),
            kind: EntryKind::Untracked,
            decl: ComponentDecl::default(),
            type_id: Some(type_id),
        });
        id
    }

    /// The id of `T` if one was ever assigned. Never assigns.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentId> {
        self.lookup_type_id(TypeId::of::<T>())
    }

    pub(crate) fn lookup_type_id(&self, type_id: TypeId) -> Option<ComponentId> {
        self.ids.get(&type_id).copied()
    }

    /// Tracked concrete component types registered under `interface`, as
    /// `(TypeId, ComponentId)` pairs in id order.
    pub fn all_under_interface(&self, interface: Interface) -> Vec<(TypeId, ComponentId)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.kind == EntryKind::Component && entry.decl.interfaces.contains(&interface)
            })
            .filter_map(|(i, entry)| entry.type_id.map(|t| (t, ComponentId(i as u32))))
            .collect()
    }

    /// Total number of assigned ids, tracked and untracked.
    pub fn total_indices(&self) -> usize {
        self.entries.len()
    }

    /// Whether `id` was assigned to a tracked message type.
    pub fn is_message(&self, id: ComponentId) -> bool {
        self.kind(id) == Some(EntryKind::Message)
    }

    /// Whether `id` belongs to a type usable as a message: a tracked message
    /// type or a lazily assigned one.
    pub(crate) fn usable_as_message(&self, id: ComponentId) -> bool {
        matches!(
            self.kind(id),
            Some(EntryKind::Message) | Some(EntryKind::Untracked)
        )
    }

    pub(crate) fn kind(&self, id: ComponentId) -> Option<EntryKind> {
        self.entries.get(id.0 as usize).map(|e| e.kind)
    }

    /// The declaration recorded for `id`, if any.
    pub fn decl(&self, id: ComponentId) -> Option<&ComponentDecl> {
        self.entries.get(id.0 as usize).map(|e| &e.decl)
    }

    /// The registered name of `id`, for diagnostics.
    pub fn name_of(&self, id: ComponentId) -> &str {
        self.entries
            .get(id.0 as usize)
            .map(|e| e.name.as_str())
            .unwrap_or("<unassigned>")
    }

    /// Number of tracked component types (excluding interfaces and messages).
    pub fn component_count(&self) -> usize {
        self.component_count as usize
    }

    /// Number of tracked message types.
    pub fn message_count(&self) -> usize {
        self.message_count as usize
    }

    /// First id past the tracked ranges; untracked assignment starts here.
    pub(crate) fn first_untracked(&self) -> u32 {
        Interface::COUNT + self.component_count + self.message_count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
