//! Scene storage: a dense, index-linked node arena per scene.
//!
//! Nodes never hold pointers to each other; `parent_index`,
//! `first_child_index` and `next_sibling_index` are indices into the
//! scene's node array and `-1` encodes "none", so reloads can swap whole
//! scenes without dangling references.

use glam::{Mat4, Quat, Vec3};

use hearth_containers::{Handle, HandlePool};

use crate::assets::AssetHandle;

pub const NO_NODE: i32 = -1;
pub const MAX_SCENE_COUNT: u32 = 64;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LightKind {
    Directional,
    Point,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Light {
    pub kind: LightKind,
    pub color: Vec3,
    pub intensity: f32,
    /// Direction for directional lights, position handled by the node's
    /// transform for point lights.
    pub direction: Vec3,
    pub radius: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            kind: LightKind::Directional,
            color: Vec3::ONE,
            intensity: 1.0,
            direction: Vec3::NEG_Y,
            radius: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshComponent {
    pub static_mesh: AssetHandle,
    pub materials: Vec<AssetHandle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    Transform(Transform),
    Mesh(MeshComponent),
    Light(Light),
}

#[derive(Debug, Clone)]
pub struct SceneNode {
    pub name: String,
    pub parent_index: i32,
    pub first_child_index: i32,
    pub next_sibling_index: i32,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub name: String,
    pub ambient_color: Vec3,
    pub skybox_material: AssetHandle,
    nodes: Vec<SceneNode>,
    /// Assets this scene took references on at load, released on unload.
    pub referenced_assets: Vec<AssetHandle>,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Append a node under `parent_index` (`NO_NODE` for a root) and link
    /// it into the sibling chain. Parents must be added before children.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        parent_index: i32,
        components: Vec<Component>,
    ) -> i32 {
        debug_assert!(parent_index == NO_NODE || (parent_index as usize) < self.nodes.len());
        let index = self.nodes.len() as i32;
        self.nodes.push(SceneNode {
            name: name.into(),
            parent_index,
            first_child_index: NO_NODE,
            next_sibling_index: NO_NODE,
            components,
        });
        if parent_index != NO_NODE {
            let mut link = self.nodes[parent_index as usize].first_child_index;
            if link == NO_NODE {
                self.nodes[parent_index as usize].first_child_index = index;
            } else {
                while self.nodes[link as usize].next_sibling_index != NO_NODE {
                    link = self.nodes[link as usize].next_sibling_index;
                }
                self.nodes[link as usize].next_sibling_index = index;
            }
        }
        index
    }

    pub fn node(&self, index: i32) -> Option<&SceneNode> {
        if index < 0 {
            return None;
        }
        self.nodes.get(index as usize)
    }

    pub fn nodes(&self) -> &[SceneNode] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Children of `index`, walking the sibling chain.
    pub fn children(&self, index: i32) -> Vec<i32> {
        let mut children = Vec::new();
        let Some(node) = self.node(index) else {
            return children;
        };
        let mut link = node.first_child_index;
        while link != NO_NODE {
            children.push(link);
            link = self.nodes[link as usize].next_sibling_index;
        }
        children
    }

    /// World transform composed down the parent chain.
    pub fn world_transform(&self, index: i32) -> Mat4 {
        let mut matrix = Mat4::IDENTITY;
        let mut current = index;
        while current != NO_NODE {
            let node = &self.nodes[current as usize];
            let local = node
                .components
                .iter()
                .find_map(|component| match component {
                    Component::Transform(transform) => Some(transform.to_matrix()),
                    _ => None,
                })
                .unwrap_or(Mat4::IDENTITY);
            matrix = local * matrix;
            current = node.parent_index;
        }
        matrix
    }
}

pub type SceneHandle = Handle<Scene>;

/// Pool of live scenes; the pool's lock doubles as the nodes mutex.
#[derive(Debug)]
pub struct SceneStore {
    scenes: HandlePool<Scene>,
}

impl Default for SceneStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneStore {
    pub fn new() -> Self {
        Self {
            scenes: HandlePool::new(MAX_SCENE_COUNT),
        }
    }

    pub fn create_scene(&self, scene: Scene) -> Result<SceneHandle, hearth_containers::PoolError> {
        self.scenes.acquire(scene)
    }

    /// Remove the scene, handing back its node array and reference list for
    /// the caller's release accounting.
    pub fn destroy_scene(&self, handle: SceneHandle) -> Option<Scene> {
        self.scenes.release(handle).ok()
    }

    pub fn is_valid(&self, handle: &SceneHandle) -> bool {
        self.scenes.is_valid(handle)
    }

    pub fn with_scene<R>(
        &self,
        handle: &SceneHandle,
        f: impl FnOnce(&Scene) -> R,
    ) -> Option<R> {
        self.scenes.with(handle, f).ok()
    }

    pub fn with_scene_mut<R>(
        &self,
        handle: &SceneHandle,
        f: impl FnOnce(&mut Scene) -> R,
    ) -> Option<R> {
        self.scenes.with_mut(handle, f).ok()
    }

    pub fn scene_count(&self) -> u32 {
        self.scenes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_chain_links_in_add_order() {
        let mut scene = Scene::new("test");
        let root = scene.add_node("root", NO_NODE, vec![]);
        let a = scene.add_node("a", root, vec![]);
        let b = scene.add_node("b", root, vec![]);
        let c = scene.add_node("c", root, vec![]);

        assert_eq!(scene.node(root).unwrap().first_child_index, a);
        assert_eq!(scene.children(root), vec![a, b, c]);
        assert_eq!(scene.node(a).unwrap().next_sibling_index, b);
        assert_eq!(scene.node(c).unwrap().next_sibling_index, NO_NODE);
    }

    #[test]
    fn world_transform_composes_down_the_chain() {
        let mut scene = Scene::new("test");
        let root = scene.add_node(
            "root",
            NO_NODE,
            vec![Component::Transform(Transform {
                position: Vec3::new(1.0, 0.0, 0.0),
                ..Default::default()
            })],
        );
        let child = scene.add_node(
            "child",
            root,
            vec![Component::Transform(Transform {
                position: Vec3::new(0.0, 2.0, 0.0),
                ..Default::default()
            })],
        );
        let world = scene.world_transform(child);
        let translation = world.w_axis.truncate();
        assert_eq!(translation, Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn store_round_trip() {
        let store = SceneStore::new();
        let mut scene = Scene::new("level");
        scene.add_node("root", NO_NODE, vec![]);
        let handle = store.create_scene(scene).unwrap();
        assert!(store.is_valid(&handle));
        assert_eq!(store.with_scene(&handle, |scene| scene.node_count()), Some(1));
        let scene = store.destroy_scene(handle).unwrap();
        assert_eq!(scene.name, "level");
        assert!(!store.is_valid(&handle));
    }
}
