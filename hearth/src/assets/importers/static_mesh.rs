//! Standalone static mesh import: the line-oriented `hastaticmesh` format.
//!
//! `version`, `material_asset <uuid>`, `vertex_count`, `index_count`, then
//! per-vertex `position`/`normal`/`uv`/`tangent` records and an `indices`
//! list. Meshes baked out of models live as embedded assets instead and
//! load through the model importer.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use glam::{Vec2, Vec3, Vec4};

use hgal::types::{StaticMesh, StaticMeshDescriptor};

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};

use super::TextCursor;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedStaticMesh {
    pub version: u32,
    pub material_asset: AssetHandle,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub tangents: Vec<Vec4>,
    pub indices: Vec<u32>,
}

pub fn parse_static_mesh(text: &str) -> anyhow::Result<ParsedStaticMesh> {
    let mut cursor = TextCursor::new(text);
    let version = cursor.parse_value_of::<u32>("version")?;
    let material_asset = AssetHandle(cursor.parse_value_of::<u64>("material_asset")?);
    let vertex_count: usize = cursor.parse_value_of("vertex_count")?;
    let index_count: usize = cursor.parse_value_of("index_count")?;

    let mut mesh = ParsedStaticMesh {
        version,
        material_asset,
        ..Default::default()
    };
    for _ in 0..vertex_count {
        cursor.expect("position")?;
        mesh.positions
            .push(Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?));
        cursor.expect("normal")?;
        mesh.normals
            .push(Vec3::new(cursor.parse()?, cursor.parse()?, cursor.parse()?));
        cursor.expect("uv")?;
        mesh.uvs.push(Vec2::new(cursor.parse()?, cursor.parse()?));
        cursor.expect("tangent")?;
        mesh.tangents.push(Vec4::new(
            cursor.parse()?,
            cursor.parse()?,
            cursor.parse()?,
            cursor.parse()?,
        ));
    }
    cursor.expect("indices")?;
    for _ in 0..index_count {
        mesh.indices.push(cursor.parse()?);
    }
    for &index in &mesh.indices {
        anyhow::ensure!(
            (index as usize) < vertex_count,
            "index {index} out of range for {vertex_count} vertices"
        );
    }
    Ok(mesh)
}

pub fn write_static_mesh(mesh: &ParsedStaticMesh) -> String {
    let mut out = String::new();
    out.push_str(&format!("version {}\n", mesh.version));
    out.push_str(&format!("material_asset {}\n", mesh.material_asset.0));
    out.push_str(&format!("vertex_count {}\n", mesh.positions.len()));
    out.push_str(&format!("index_count {}\n", mesh.indices.len()));
    for vertex in 0..mesh.positions.len() {
        let position = mesh.positions[vertex];
        let normal = mesh.normals.get(vertex).copied().unwrap_or(Vec3::Z);
        let uv = mesh.uvs.get(vertex).copied().unwrap_or(Vec2::ZERO);
        let tangent = mesh.tangents.get(vertex).copied().unwrap_or(Vec4::X);
        out.push_str(&format!("position {} {} {}\n", position.x, position.y, position.z));
        out.push_str(&format!("normal {} {} {}\n", normal.x, normal.y, normal.z));
        out.push_str(&format!("uv {} {}\n", uv.x, uv.y));
        out.push_str(&format!(
            "tangent {} {} {} {}\n",
            tangent.x, tangent.y, tangent.z, tangent.w
        ));
    }
    out.push_str("indices");
    for index in &mesh.indices {
        out.push_str(&format!(" {index}"));
    }
    out.push('\n');
    out
}

pub fn load_static_mesh(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name_with_extension(&absolute_path.to_string_lossy()).to_string();
    let text = std::fs::read_to_string(absolute_path)
        .with_context(|| format!("failed to read static mesh {}", absolute_path.display()))?;
    let parsed = parse_static_mesh(&text)?;

    let renderer = manager.renderer();
    let mesh = renderer.create_static_mesh(StaticMeshDescriptor {
        name: name.clone(),
        positions: parsed.positions,
        normals: parsed.normals,
        uvs: parsed.uvs,
        tangents: parsed.tangents,
        indices: parsed.indices,
    })?;
    renderer.submit_allocation_group(&name, handle.0)?;
    Ok(LoadResult::gpu(mesh))
}

pub fn unload_static_mesh(manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    let mesh = result.gpu_handle::<StaticMesh>();
    if !mesh.is_invalid() {
        let _ = manager.renderer().destroy_static_mesh(mesh, false);
    }
}
