//! Replicated object tree.
//!
//! A [`NetObject`] is one node: a closed type tag, a replicate flag fixed at
//! construction, network/owner identities, gameplay state and the replicated
//! properties bound into that state. [`ObjectTree`] arranges nodes in an
//! arena with generational keys so stale keys never alias a reused slot.

use crate::{
    ids::{ClientId, NetworkId},
    math::Vec2,
    property::{NetProperty, ReplicatedProperty},
    wire::{DecodeError, WireReader, WireWriter},
};

/// Closed, versionable set of object types. The discriminant is the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    GameObject = 0,
    SceneRoot = 1,
    Player = 2,
}

impl ObjectKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        match tag {
            0 => Ok(ObjectKind::GameObject),
            1 => Ok(ObjectKind::SceneRoot),
            2 => Ok(ObjectKind::Player),
            other => Err(DecodeError::UnknownObjectType(other)),
        }
    }

    /// Whether a freshly constructed object of this kind is network-visible.
    pub fn replicates_by_default(self) -> bool {
        match self {
            ObjectKind::GameObject => false,
            ObjectKind::SceneRoot | ObjectKind::Player => true,
        }
    }

    fn initial_state(self) -> ObjectState {
        match self {
            ObjectKind::Player => ObjectState {
                speed: PLAYER_SPEED,
                ..ObjectState::default()
            },
            _ => ObjectState::default(),
        }
    }

    fn bind_properties(self, state: &ObjectState) -> Vec<Box<dyn NetProperty<ObjectState>>> {
        let mut props: Vec<Box<dyn NetProperty<ObjectState>>> = Vec::new();
        if self == ObjectKind::SceneRoot {
            return props;
        }

        props.push(Box::new(ReplicatedProperty::new(
            "Position",
            state,
            |s: &ObjectState| s.position,
            |s, v| s.position = v,
        )));
        props.push(Box::new(ReplicatedProperty::new(
            "Direction",
            state,
            |s: &ObjectState| s.direction,
            |s, v| s.direction = v,
        )));
        props.push(Box::new(ReplicatedProperty::new(
            "Speed",
            state,
            |s: &ObjectState| s.speed,
            |s, v| s.speed = v,
        )));
        props.push(Box::new(ReplicatedProperty::new(
            "Visible",
            state,
            |s: &ObjectState| s.visible,
            |s, v| s.visible = v,
        )));

        if self == ObjectKind::Player {
            props.push(Box::new(ReplicatedProperty::new(
                "Name",
                state,
                |s: &ObjectState| s.name.clone(),
                |s, v| s.name = v,
            )));
            props.push(Box::new(ReplicatedProperty::new(
                "Score",
                state,
                |s: &ObjectState| s.score,
                |s, v| s.score = v,
            )));
        }
        props
    }
}

/// Movement speed of a freshly spawned player, in units per second.
pub const PLAYER_SPEED: f32 = 100.0;

/// Gameplay fields of an object. Only fields bound to a registered property
/// of the object's kind travel over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectState {
    pub position: Vec2,
    pub direction: Vec2,
    pub speed: f32,
    pub name: String,
    pub score: i32,
    pub visible: bool,
}

impl Default for ObjectState {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            direction: Vec2::ZERO,
            speed: 0.0,
            name: String::new(),
            score: 0,
            visible: true,
        }
    }
}

/// One node of the object tree.
#[derive(Debug, Clone)]
pub struct NetObject {
    kind: ObjectKind,
    replicate: bool,
    pub network_id: NetworkId,
    pub owner: ClientId,
    pub state: ObjectState,
    properties: Vec<Box<dyn NetProperty<ObjectState>>>,
}

impl NetObject {
    /// Creates an object with its kind's default replication.
    pub fn new(kind: ObjectKind) -> Self {
        Self::with_replication(kind, kind.replicates_by_default())
    }

    pub fn with_replication(kind: ObjectKind, replicate: bool) -> Self {
        Self::with_state(kind, replicate, kind.initial_state())
    }

    /// Creates an object and samples its properties from `state`.
    pub fn with_state(kind: ObjectKind, replicate: bool, state: ObjectState) -> Self {
        let properties = kind.bind_properties(&state);
        Self {
            kind,
            replicate,
            network_id: NetworkId::UNASSIGNED,
            owner: ClientId::SERVER,
            state,
            properties,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_replicated(&self) -> bool {
        self.replicate
    }

    pub fn property_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.properties.iter().map(|p| p.name())
    }

    pub fn is_dirty(&self) -> bool {
        self.properties.iter().any(|p| p.is_dirty())
    }

    pub fn dirty_properties(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.properties
            .iter()
            .filter(|p| p.is_dirty())
            .map(|p| p.name())
    }

    pub fn update_dirty_flags(&mut self) {
        let state = &self.state;
        for p in &mut self.properties {
            p.update_dirty(state);
        }
    }

    pub fn clear_dirty_flags(&mut self) {
        for p in &mut self.properties {
            p.clear_dirty();
        }
    }

    /// Writes `count, (name, value)*` for all or only dirty properties.
    pub fn encode_properties(&self, w: &mut WireWriter, only_dirty: bool) {
        let selected: Vec<_> = self
            .properties
            .iter()
            .filter(|p| !only_dirty || p.is_dirty())
            .collect();

        w.put_len(selected.len());
        for p in selected {
            w.put_str(p.name());
            p.encode(&self.state, w);
        }
    }

    /// Reads a property list produced by [`NetObject::encode_properties`].
    /// A name this kind does not register is a decode error because its
    /// value cannot be skipped without knowing its type.
    pub fn decode_properties(&mut self, r: &mut WireReader<'_>) -> Result<(), DecodeError> {
        // Smallest entry: empty name (4) plus a bool (1).
        let count = r.count(5)?;
        for _ in 0..count {
            let name = r.string()?;
            let kind = self.kind.as_u8();
            let state = &mut self.state;
            let prop = self
                .properties
                .iter_mut()
                .find(|p| p.name() == name)
                .ok_or(DecodeError::UnknownProperty { kind, name })?;
            prop.decode(state, r)?;
        }
        Ok(())
    }

    /// Copies every replicated property value of `source` through the wire
    /// contract, so undeclared fields never move.
    pub fn copy_properties_from(&mut self, source: &NetObject) -> Result<(), DecodeError> {
        let mut w = WireWriter::new();
        source.encode_properties(&mut w, false);
        let bytes = w.finish();
        let mut r = WireReader::new(&bytes);
        self.decode_properties(&mut r)?;
        r.finish()
    }

    /// Advances movement by one simulation step.
    pub fn step(&mut self, dt: f32) {
        let s = &mut self.state;
        s.position += s.direction * (s.speed * dt);
    }
}

/// Generational handle into an [`ObjectTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Node {
    object: NetObject,
    parent: Option<ObjectKey>,
    children: Vec<ObjectKey>,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena-backed object hierarchy with a fixed root.
#[derive(Debug, Clone)]
pub struct ObjectTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ObjectKey,
    len: usize,
}

impl ObjectTree {
    pub fn new(root: NetObject) -> Self {
        let root_key = ObjectKey {
            index: 0,
            generation: 0,
        };
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(Node {
                    object: root,
                    parent: None,
                    children: Vec::new(),
                }),
            }],
            free: Vec::new(),
            root: root_key,
            len: 1,
        }
    }

    pub fn root(&self) -> ObjectKey {
        self.root
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, key: ObjectKey) -> Option<&Node> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, key: ObjectKey) -> Option<&mut Node> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.node(key).is_some()
    }

    pub fn get(&self, key: ObjectKey) -> Option<&NetObject> {
        self.node(key).map(|n| &n.object)
    }

    pub fn get_mut(&mut self, key: ObjectKey) -> Option<&mut NetObject> {
        self.node_mut(key).map(|n| &mut n.object)
    }

    pub fn parent(&self, key: ObjectKey) -> Option<ObjectKey> {
        self.node(key).and_then(|n| n.parent)
    }

    pub fn children(&self, key: ObjectKey) -> &[ObjectKey] {
        self.node(key).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Attaches `object` as the last child of `parent`.
    pub fn add_child(&mut self, parent: ObjectKey, object: NetObject) -> Option<ObjectKey> {
        if !self.contains(parent) {
            return None;
        }

        let node = Node {
            object,
            parent: Some(parent),
            children: Vec::new(),
        };
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                ObjectKey {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                ObjectKey {
                    index,
                    generation: 0,
                }
            }
        };

        self.node_mut(parent)?.children.push(key);
        self.len += 1;
        Some(key)
    }

    /// Removes `key` and its whole subtree, returning the removed object.
    /// The root is never removed.
    pub fn remove(&mut self, key: ObjectKey) -> Option<NetObject> {
        if key == self.root || !self.contains(key) {
            return None;
        }

        self.detach(key);
        let subtree = self.descendants(key);
        let mut removed = None;
        for k in subtree {
            let slot = &mut self.slots[k.index as usize];
            let node = slot.node.take();
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(k.index);
            self.len -= 1;
            if k == key {
                removed = node.map(|n| n.object);
            }
        }
        removed
    }

    fn detach(&mut self, key: ObjectKey) {
        if let Some(parent) = self.parent(key) {
            if let Some(p) = self.node_mut(parent) {
                p.children.retain(|c| *c != key);
            }
        }
        if let Some(n) = self.node_mut(key) {
            n.parent = None;
        }
    }

    /// Moves `key` under `new_parent`. Refuses to move the root or to create
    /// a cycle.
    pub fn reparent(&mut self, key: ObjectKey, new_parent: ObjectKey) -> bool {
        if key == self.root
            || !self.contains(key)
            || !self.contains(new_parent)
            || self.is_ancestor_or_self(key, new_parent)
        {
            return false;
        }

        self.detach(key);
        if let Some(n) = self.node_mut(key) {
            n.parent = Some(new_parent);
        }
        if let Some(p) = self.node_mut(new_parent) {
            p.children.push(key);
        }
        true
    }

    /// Whether `ancestor` is `key` or lies on its parent chain.
    pub fn is_ancestor_or_self(&self, ancestor: ObjectKey, key: ObjectKey) -> bool {
        let mut cursor = Some(key);
        while let Some(k) = cursor {
            if k == ancestor {
                return true;
            }
            cursor = self.parent(k);
        }
        false
    }

    /// Pre-order keys of the subtree rooted at `key`, `key` first.
    pub fn descendants(&self, key: ObjectKey) -> Vec<ObjectKey> {
        let mut out = Vec::new();
        if !self.contains(key) {
            return out;
        }
        let mut stack = vec![key];
        while let Some(k) = stack.pop() {
            out.push(k);
            stack.extend(self.children(k).iter().rev().copied());
        }
        out
    }

    /// Pre-order keys of the whole tree.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.descendants(self.root)
    }

    /// Pre-order iteration over the whole tree.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectKey, &NetObject)> + '_ {
        self.keys()
            .into_iter()
            .filter_map(move |k| self.get(k).map(|o| (k, o)))
    }

    pub fn find_by_network_id(&self, id: NetworkId) -> Option<ObjectKey> {
        if !id.is_assigned() {
            return None;
        }
        self.iter()
            .find(|(_, o)| o.is_replicated() && o.network_id == id)
            .map(|(k, _)| k)
    }

    /// First object in pre-order owned by `owner`.
    pub fn find_owned_by(&self, owner: ClientId) -> Option<ObjectKey> {
        self.iter().find(|(_, o)| o.owner == owner).map(|(k, _)| k)
    }

    pub fn owned_by(&self, owner: ClientId) -> Vec<ObjectKey> {
        self.iter()
            .filter(|(_, o)| o.owner == owner)
            .map(|(k, _)| k)
            .collect()
    }

    /// Applies `f` to every object, in pre-order.
    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut NetObject)) {
        for k in self.keys() {
            if let Some(o) = self.get_mut(k) {
                f(o);
            }
        }
    }
}
