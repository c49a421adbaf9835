//! Scenes and the scene registry.
//!
//! A scene owns one replicated world root and a separate non-replicated UI
//! root. Scenes are built by key through a [`SceneFactory`]; the standard
//! [`SceneRegistry`] is a table built once and read-only afterwards.

use std::{collections::HashMap, fmt};

use anyhow::anyhow;
use rand::Rng;

use crate::{
    math::Vec2,
    object::{NetObject, ObjectKind, ObjectTree},
};

/// One loaded scene.
#[derive(Debug, Clone)]
pub struct Scene {
    key: String,
    pub world: ObjectTree,
    pub ui: ObjectTree,
}

impl Scene {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            world: ObjectTree::new(NetObject::new(ObjectKind::SceneRoot)),
            ui: ObjectTree::new(NetObject::with_replication(ObjectKind::SceneRoot, false)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Builds scenes by key.
pub trait SceneFactory: Send + Sync {
    fn create(&self, key: &str) -> anyhow::Result<Scene>;

    fn contains(&self, key: &str) -> bool;
}

pub type SceneCtor = fn(&str) -> Scene;

/// Table of scene constructors.
#[derive(Clone, Default)]
pub struct SceneRegistry {
    ctors: HashMap<String, SceneCtor>,
}

impl fmt::Debug for SceneRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ctors.keys()).finish()
    }
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in scenes: `loading`, `arena` and `garden`.
    pub fn standard() -> Self {
        Self::new()
            .with("loading", |key| Scene::new(key))
            .with("arena", |key| Scene::new(key))
            .with("garden", garden)
    }

    pub fn with(mut self, key: &str, ctor: SceneCtor) -> Self {
        self.ctors.insert(key.to_string(), ctor);
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.ctors.keys().map(String::as_str)
    }
}

impl SceneFactory for SceneRegistry {
    fn create(&self, key: &str) -> anyhow::Result<Scene> {
        let ctor = self
            .ctors
            .get(key)
            .ok_or_else(|| anyhow!("unknown scene {key:?}"))?;
        Ok(ctor(key))
    }

    fn contains(&self, key: &str) -> bool {
        self.ctors.contains_key(key)
    }
}

const GARDEN_DECORATIONS: usize = 3;

/// Scene with local-only decorations scattered at random.
fn garden(key: &str) -> Scene {
    let mut scene = Scene::new(key);
    let mut rng = rand::thread_rng();
    let root = scene.world.root();
    for _ in 0..GARDEN_DECORATIONS {
        let mut deco = NetObject::new(ObjectKind::GameObject);
        let v = rng.gen_range(0.0..250.0);
        deco.state.position = Vec2::new(v, v);
        scene.world.add_child(root, deco);
    }
    scene
}
