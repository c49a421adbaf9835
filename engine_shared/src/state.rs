//! Game state: the active scene, tick counter, scene epoch and network id
//! allocator.

use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{
    ids::{ClientId, NetworkId},
    object::{NetObject, ObjectKey, ObjectTree},
    scene::{Scene, SceneFactory},
};

/// Authoritative or predicted simulation state.
pub struct GameState {
    scenes: Arc<dyn SceneFactory>,
    scene: Scene,
    /// Simulation tick, starting at 1 and wrapping.
    pub tick: u32,
    /// Bumped by the authority on every scene transition, adopted by clients.
    pub scene_epoch: i32,
    next_network_id: i32,
}

impl fmt::Debug for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameState")
            .field("scene", &self.scene.key())
            .field("tick", &self.tick)
            .field("scene_epoch", &self.scene_epoch)
            .field("objects", &self.scene.world.len())
            .finish()
    }
}

impl GameState {
    pub fn new(scenes: Arc<dyn SceneFactory>, scene_key: &str) -> anyhow::Result<Self> {
        let scene = scenes.create(scene_key)?;
        Ok(Self {
            scenes,
            scene,
            tick: 1,
            scene_epoch: 0,
            next_network_id: 1,
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn scene_key(&self) -> &str {
        self.scene.key()
    }

    pub fn world(&self) -> &ObjectTree {
        &self.scene.world
    }

    pub fn world_mut(&mut self) -> &mut ObjectTree {
        &mut self.scene.world
    }

    /// Replaces the active scene. The epoch is left to the caller.
    pub fn switch_scene(&mut self, key: &str) -> anyhow::Result<()> {
        let scene = self.scenes.create(key)?;
        debug!(from = self.scene.key(), to = key, "Switching scene");
        self.scene = scene;
        Ok(())
    }

    /// Assigns network ids to every replicated object already in the world
    /// that has none yet, and resets their owner to the server.
    pub fn register_existing_objects(&mut self) {
        for key in self.scene.world.keys() {
            let Some(current) = self
                .scene
                .world
                .get(key)
                .filter(|o| o.is_replicated())
                .map(|o| o.network_id)
            else {
                continue;
            };
            let id = self.allocate(current);
            if let Some(obj) = self.scene.world.get_mut(key) {
                obj.network_id = id;
                obj.owner = ClientId::SERVER;
            }
        }
    }

    fn allocate(&mut self, current: NetworkId) -> NetworkId {
        if current.is_assigned() {
            return current;
        }
        let id = NetworkId(self.next_network_id);
        self.next_network_id += 1;
        id
    }

    /// Key of the first object owned by `client`.
    pub fn pawn(&self, client: ClientId) -> Option<ObjectKey> {
        self.scene.world.find_owned_by(client)
    }

    pub fn pawn_mut(&mut self, client: ClientId) -> Option<&mut NetObject> {
        let key = self.pawn(client)?;
        self.scene.world.get_mut(key)
    }

    /// Adds `obj` under `parent` (the world root when `None`). Replicated
    /// objects get a network id if they lack one, plus `owner`.
    pub fn add_object(
        &mut self,
        mut obj: NetObject,
        parent: Option<ObjectKey>,
        owner: ClientId,
    ) -> Option<ObjectKey> {
        if obj.is_replicated() {
            obj.network_id = self.allocate(obj.network_id);
            obj.owner = owner;
        }
        let parent = parent.unwrap_or_else(|| self.scene.world.root());
        self.scene.world.add_child(parent, obj)
    }

    /// Removes every replicated object owned by `owner`, returning how many
    /// subtrees were detached.
    pub fn remove_client_objects(&mut self, owner: ClientId) -> usize {
        let world = &mut self.scene.world;
        let owned: Vec<_> = world
            .owned_by(owner)
            .into_iter()
            .filter(|k| world.get(*k).is_some_and(NetObject::is_replicated))
            .collect();

        owned
            .into_iter()
            .filter(|k| world.remove(*k).is_some())
            .count()
    }

    pub fn update_dirty_flags(&mut self) {
        self.scene.world.for_each_mut(NetObject::update_dirty_flags);
    }

    pub fn clear_dirty_flags(&mut self) {
        self.scene.world.for_each_mut(NetObject::clear_dirty_flags);
    }

    /// Advances every world object by `dt` seconds, then the tick.
    pub fn update(&mut self, dt: f32) {
        self.scene.world.for_each_mut(|obj| obj.step(dt));
        self.tick = self.tick.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{math::Vec2, object::ObjectKind, scene::SceneRegistry};

    fn state(key: &str) -> GameState {
        GameState::new(Arc::new(SceneRegistry::standard()), key).unwrap()
    }

    #[test]
    fn new_state_starts_at_tick_one_epoch_zero() {
        let s = state("arena");
        assert_eq!(s.tick, 1);
        assert_eq!(s.scene_epoch, 0);
        assert_eq!(s.scene_key(), "arena");
    }

    #[test]
    fn register_existing_assigns_unique_ids_to_replicated_only() {
        let mut s = state("garden");
        s.register_existing_objects();

        let ids: Vec<_> = s
            .world()
            .iter()
            .filter(|(_, o)| o.is_replicated())
            .map(|(_, o)| o.network_id)
            .collect();
        assert_eq!(ids, vec![NetworkId(1)]);
        assert!(s
            .world()
            .iter()
            .filter(|(_, o)| !o.is_replicated())
            .all(|(_, o)| !o.network_id.is_assigned()));
    }

    #[test]
    fn add_object_assigns_id_and_owner() {
        let mut s = state("arena");
        s.register_existing_objects();
        let key = s
            .add_object(NetObject::new(ObjectKind::Player), None, ClientId(3))
            .unwrap();
        let obj = s.world().get(key).unwrap();
        assert_eq!(obj.network_id, NetworkId(2));
        assert_eq!(obj.owner, ClientId(3));
        assert_eq!(s.pawn(ClientId(3)), Some(key));
        assert_eq!(s.pawn(ClientId(4)), None);
    }

    #[test]
    fn remove_client_objects_leaves_others() {
        let mut s = state("arena");
        s.add_object(NetObject::new(ObjectKind::Player), None, ClientId(1));
        s.add_object(NetObject::new(ObjectKind::Player), None, ClientId(2));
        assert_eq!(s.remove_client_objects(ClientId(1)), 1);
        assert!(s.pawn(ClientId(1)).is_none());
        assert!(s.pawn(ClientId(2)).is_some());
    }

    #[test]
    fn update_moves_objects_and_wraps_tick() {
        let mut s = state("arena");
        let key = s
            .add_object(NetObject::new(ObjectKind::Player), None, ClientId(1))
            .unwrap();
        s.world_mut().get_mut(key).unwrap().state.direction = Vec2::new(0.0, 1.0);
        s.tick = u32::MAX;
        s.update(0.1);
        assert_eq!(s.tick, 0);
        let pos = s.world().get(key).unwrap().state.position;
        assert!((pos.y - 10.0).abs() < 1e-4);
    }

    #[test]
    fn switch_scene_to_unknown_key_keeps_current() {
        let mut s = state("arena");
        assert!(s.switch_scene("missing").is_err());
        assert_eq!(s.scene_key(), "arena");
        s.switch_scene("loading").unwrap();
        assert_eq!(s.scene_key(), "loading");
    }
}
