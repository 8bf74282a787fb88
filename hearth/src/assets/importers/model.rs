//! Model import through the `gltf` crate.
//!
//! Importing a model registers its materials and meshes as embedded assets
//! (`@<model-uuid>-<index>/material_<index>.hamaterial`, ...). Loading the
//! model itself yields a CPU description; loading an embedded child routes
//! back through this importer with the child's `data_id` selecting the
//! sub-resource inside the glTF file.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use glam::{Vec2, Vec3, Vec4};
use tracing::warn;

use hgal::types::StaticMeshDescriptor;

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};

use super::material::{
    build_material, MaterialProperty, MaterialPropertyValue, MaterialType, ParsedMaterial,
};

/// CPU-side result of loading a whole model.
#[derive(Debug, Clone)]
pub struct ModelData {
    pub name: String,
    pub materials: Vec<AssetHandle>,
    pub meshes: Vec<AssetHandle>,
}

/// Register every material and mesh of the glTF as an embedded child of the
/// model asset.
pub fn on_import_model(manager: &Arc<AssetManager>, handle: AssetHandle) {
    let Some(entry) = manager.entry(handle) else {
        return;
    };
    let absolute = manager.asset_root().join(&entry.path);
    let document = match gltf::Gltf::open(&absolute) {
        Ok(gltf) => gltf.document,
        Err(err) => {
            warn!(path = entry.path, "model import: failed to open gltf: {err}");
            return;
        }
    };
    for (index, _material) in document.materials().enumerate() {
        let embedded = path::format_embedded(
            handle,
            index as u64,
            &format!("material_{index}.hamaterial"),
        );
        manager.import_asset(&embedded);
    }
    for (index, _mesh) in document.meshes().enumerate() {
        let embedded = path::format_embedded(
            handle,
            index as u64,
            &format!("static_mesh_{index}.hastaticmesh"),
        );
        manager.import_asset(&embedded);
    }
}

pub fn load_model(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
    embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    match embedded {
        None => load_whole_model(manager, handle, absolute_path),
        Some(params) => match params.type_name.as_str() {
            "material" => load_embedded_material(manager, absolute_path, params),
            "static_mesh" => load_embedded_mesh(manager, absolute_path, params),
            other => anyhow::bail!("model cannot embed `{other}` assets"),
        },
    }
}

fn load_whole_model(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
) -> anyhow::Result<LoadResult> {
    let name = path::name(&absolute_path.to_string_lossy()).to_string();
    // structure only; embedded children carry the heavy data
    let document = gltf::Gltf::open(absolute_path)
        .with_context(|| format!("failed to open gltf {}", absolute_path.display()))?
        .document;

    let mut materials = Vec::new();
    let mut meshes = Vec::new();
    for child in manager.get_embedded_assets(handle) {
        match manager.asset_type_name(child).as_deref() {
            Some("material") => materials.push(child),
            Some("static_mesh") => meshes.push(child),
            _ => {}
        }
    }
    anyhow::ensure!(
        materials.len() == document.materials().len()
            && meshes.len() == document.meshes().len(),
        "embedded children of {name} are out of sync with the gltf"
    );
    Ok(LoadResult::cpu(ModelData {
        name,
        materials,
        meshes,
    }))
}

fn load_embedded_material(
    manager: &Arc<AssetManager>,
    absolute_path: &Path,
    params: &EmbeddedParams,
) -> anyhow::Result<LoadResult> {
    let document = gltf::Gltf::open(absolute_path)
        .with_context(|| format!("failed to open gltf {}", absolute_path.display()))?
        .document;
    let material = document
        .materials()
        .nth(params.data_id as usize)
        .with_context(|| format!("gltf has no material {}", params.data_id))?;

    let shader = manager.default_material_shader();
    anyhow::ensure!(
        manager.renderer().shaders.is_valid(&shader),
        "no default material shader is installed for gltf materials"
    );

    let pbr = material.pbr_metallic_roughness();
    let parsed = ParsedMaterial {
        version: 1,
        material_type: MaterialType::Opaque,
        shader: AssetHandle::NONE,
        cull_mode: hgal::types::CullMode::Back,
        front_face: hgal::types::FrontFace::CounterClockwise,
        depth_stencil: Default::default(),
        properties: vec![
            MaterialProperty {
                name: "albedo_color".into(),
                value: MaterialPropertyValue::V4F(Vec4::from_array(pbr.base_color_factor())),
            },
            MaterialProperty {
                name: "metallic_factor".into(),
                value: MaterialPropertyValue::F32(pbr.metallic_factor()),
            },
            MaterialProperty {
                name: "roughness_factor".into(),
                value: MaterialPropertyValue::F32(pbr.roughness_factor()),
            },
        ],
    };
    build_material(manager, &params.name, &parsed, shader)
}

fn load_embedded_mesh(
    manager: &Arc<AssetManager>,
    absolute_path: &Path,
    params: &EmbeddedParams,
) -> anyhow::Result<LoadResult> {
    let (document, buffers, _images) = gltf::import(absolute_path)
        .with_context(|| format!("failed to import gltf {}", absolute_path.display()))?;
    let mesh = document
        .meshes()
        .nth(params.data_id as usize)
        .with_context(|| format!("gltf has no mesh {}", params.data_id))?;

    // primitives concatenate into one vertex/index stream
    let mut positions: Vec<Vec3> = Vec::new();
    let mut normals: Vec<Vec3> = Vec::new();
    let mut uvs: Vec<Vec2> = Vec::new();
    let mut tangents: Vec<Vec4> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();

    for primitive in mesh.primitives() {
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|data| data.0.as_slice()));
        let base_vertex = positions.len() as u32;

        let primitive_positions: Vec<Vec3> = reader
            .read_positions()
            .context("gltf primitive has no positions")?
            .map(Vec3::from_array)
            .collect();
        let vertex_count = primitive_positions.len();
        positions.extend(primitive_positions);

        match reader.read_normals() {
            Some(primitive_normals) => normals.extend(primitive_normals.map(Vec3::from_array)),
            None => normals.extend(std::iter::repeat(Vec3::Z).take(vertex_count)),
        }
        match reader.read_tex_coords(0) {
            Some(coords) => uvs.extend(coords.into_f32().map(Vec2::from_array)),
            None => uvs.extend(std::iter::repeat(Vec2::ZERO).take(vertex_count)),
        }
        match reader.read_tangents() {
            Some(primitive_tangents) => {
                tangents.extend(primitive_tangents.map(Vec4::from_array))
            }
            None => tangents.extend(std::iter::repeat(Vec4::X).take(vertex_count)),
        }
        match reader.read_indices() {
            Some(primitive_indices) => {
                indices.extend(primitive_indices.into_u32().map(|index| index + base_vertex))
            }
            None => indices.extend(base_vertex..base_vertex + vertex_count as u32),
        }
    }

    let renderer = manager.renderer();
    let mesh = renderer.create_static_mesh(StaticMeshDescriptor {
        name: params.name.clone(),
        positions,
        normals,
        uvs,
        tangents,
        indices,
    })?;
    renderer.submit_allocation_group(&params.name, params.data_id)?;
    Ok(LoadResult::gpu(mesh))
}

pub fn unload_model(_manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    // the model's own result is CPU-resident structure; embedded children
    // unload through their own type's unload
    drop(result);
}
