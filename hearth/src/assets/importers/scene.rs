//! Scene import: the line-oriented `hascene` format.
//!
//! `version`, `ambient_color`, `skybox_material_asset`, `node_count`, then
//! per node a length-prefixed name, the parent index (earlier nodes only),
//! and typed component blocks. Loading builds the node arena in the scene
//! store and takes one reference on every asset the scene mentions; those
//! references drop when the scene unloads.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use glam::{Quat, Vec3};

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};
use crate::scene::{Component, Light, LightKind, MeshComponent, Scene, Transform, NO_NODE};

use super::TextCursor;

pub fn parse_scene(name: &str, text: &str) -> anyhow::Result<Scene> {
    let mut cursor = TextCursor::new(text);
    let _version = cursor.parse_value_of::<u32>("version")?;

    cursor.expect("ambient_color")?;
    let ambient_color = Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?);
    let skybox_material = AssetHandle(cursor.parse_value_of::<u64>("skybox_material_asset")?);
    let node_count: usize = cursor.parse_value_of("node_count")?;

    let mut scene = Scene::new(name);
    scene.ambient_color = ambient_color;
    scene.skybox_material = skybox_material;

    for node_index in 0..node_count {
        cursor.expect("node_name")?;
        let name_length: usize = cursor.parse()?;
        let node_name = cursor.take_bytes(name_length)?.to_string();
        let parent: i32 = cursor.parse_value_of("parent")?;
        anyhow::ensure!(
            parent == NO_NODE || (parent >= 0 && (parent as usize) < node_index),
            "node {node_index} references parent {parent}, which is not an earlier node"
        );

        let component_count: usize = cursor.parse_value_of("component_count")?;
        let mut components = Vec::with_capacity(component_count);
        for _ in 0..component_count {
            let kind = cursor.value_of("component")?;
            let component = match kind {
                "transform" => {
                    cursor.expect("position")?;
                    let position = Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?);
                    cursor.expect("rotation")?;
                    let rotation = Quat::from_xyzw(
                        cursor.parse()?,
                        cursor.parse()?,
                        cursor.parse()?,
                        cursor.parse()?,
                    );
                    cursor.expect("scale")?;
                    let scale = Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?);
                    Component::Transform(Transform {
                        position,
                        rotation,
                        scale,
                    })
                }
                "mesh" => {
                    let static_mesh = AssetHandle(cursor.parse_value_of::<u64>("static_mesh_asset")?);
                    let material_count: usize = cursor.parse_value_of("material_count")?;
                    let mut materials = Vec::with_capacity(material_count);
                    for _ in 0..material_count {
                        materials.push(AssetHandle(cursor.parse_value_of::<u64>("material_asset")?));
                    }
                    Component::Mesh(MeshComponent {
                        static_mesh,
                        materials,
                    })
                }
                "light" => {
                    let kind = match cursor.value_of("light_type")? {
                        "directional" => LightKind::Directional,
                        "point" => LightKind::Point,
                        other => anyhow::bail!("unsupported light type `{other}`"),
                    };
                    cursor.expect("color")?;
                    let color = Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?);
                    let intensity: f32 = cursor.parse_value_of("intensity")?;
                    cursor.expect("direction")?;
                    let direction = Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?);
                    let radius: f32 = cursor.parse_value_of("radius")?;
                    Component::Light(Light {
                        kind,
                        color,
                        intensity,
                        direction,
                        radius,
                    })
                }
                other => anyhow::bail!("unsupported component type `{other}`"),
            };
            components.push(component);
        }
        scene.add_node(node_name, parent, components);
    }
    Ok(scene)
}

pub fn write_scene(scene: &Scene) -> String {
    let mut out = String::new();
    out.push_str("version 1\n");
    out.push_str(&format!(
        "ambient_color {} {} {}\n",
        scene.ambient_color.x, scene.ambient_color.y, scene.ambient_color.z
    ));
    out.push_str(&format!("skybox_material_asset {}\n", scene.skybox_material.0));
    out.push_str(&format!("node_count {}\n", scene.node_count()));
    for node in scene.nodes() {
        out.push_str(&format!("node_name {} {}\n", node.name.len(), node.name));
        out.push_str(&format!("parent {}\n", node.parent_index));
        out.push_str(&format!("component_count {}\n", node.components.len()));
        for component in &node.components {
            match component {
                Component::Transform(transform) => {
                    out.push_str("component transform\n");
                    out.push_str(&format!(
                        "position {} {} {}\n",
                        transform.position.x, transform.position.y, transform.position.z
                    ));
                    out.push_str(&format!(
                        "rotation {} {} {} {}\n",
                        transform.rotation.x,
                        transform.rotation.y,
                        transform.rotation.z,
                        transform.rotation.w
                    ));
                    out.push_str(&format!(
                        "scale {} {} {}\n",
                        transform.scale.x, transform.scale.y, transform.scale.z
                    ));
                }
                Component::Mesh(mesh) => {
                    out.push_str("component mesh\n");
                    out.push_str(&format!("static_mesh_asset {}\n", mesh.static_mesh.0));
                    out.push_str(&format!("material_count {}\n", mesh.materials.len()));
                    for material in &mesh.materials {
                        out.push_str(&format!("material_asset {}\n", material.0));
                    }
                }
                Component::Light(light) => {
                    out.push_str("component light\n");
                    out.push_str(&format!(
                        "light_type {}\n",
                        match light.kind {
                            LightKind::Directional => "directional",
                            LightKind::Point => "point",
                        }
                    ));
                    out.push_str(&format!(
                        "color {} {} {}\n",
                        light.color.x, light.color.y, light.color.z
                    ));
                    out.push_str(&format!("intensity {}\n", light.intensity));
                    out.push_str(&format!(
                        "direction {} {} {}\n",
                        light.direction.x, light.direction.y, light.direction.z
                    ));
                    out.push_str(&format!("radius {}\n", light.radius));
                }
            }
        }
    }
    out
}

pub fn load_scene(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name(&absolute_path.to_string_lossy()).to_string();
    let text = std::fs::read_to_string(absolute_path)
        .with_context(|| format!("failed to read scene {}", absolute_path.display()))?;
    let mut scene = parse_scene(&name, &text)?;

    // one reference per mention; released when the scene unloads
    let mut referenced = Vec::new();
    for node in scene.nodes() {
        for component in &node.components {
            if let Component::Mesh(mesh) = component {
                if !mesh.static_mesh.is_none() {
                    referenced.push(mesh.static_mesh);
                }
                for material in &mesh.materials {
                    if !material.is_none() {
                        referenced.push(*material);
                    }
                }
            }
        }
    }
    if !scene.skybox_material.is_none() {
        referenced.push(scene.skybox_material);
    }
    for asset in &referenced {
        manager.acquire_asset(*asset);
        manager.record_child_ref(handle, *asset);
    }
    scene.referenced_assets = referenced;

    let scene_handle = manager
        .scenes()
        .create_scene(scene)
        .map_err(|err| anyhow::anyhow!("scene store: {err}"))?;
    Ok(LoadResult::gpu(scene_handle))
}

pub fn unload_scene(manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    let scene = result.gpu_handle::<Scene>();
    if !scene.is_invalid() {
        // nodes die here; the references the load took are released by the
        // manager's unload bookkeeping
        let _ = manager.scenes().destroy_scene(scene);
    }
}
