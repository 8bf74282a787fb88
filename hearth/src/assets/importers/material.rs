//! Material import: the line-oriented `hamaterial` format.
//!
//! Fixed field order: `version`, `type`, `shader`, the rasterizer and
//! depth/stencil settings, `property_count`, then `property_count`
//! `(name, type, value...)` triples. A `u32` property whose name ends with
//! `texture` or `cubemap` carries a texture-asset UUID.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use glam::{Vec2, Vec3, Vec4};
use tracing::warn;

use hgal::types::{
    AttachmentInfo, AttachmentOperation, CompareOperation, CullMode, DepthStencilState, FrontFace,
    Material, MaterialDescriptor, PipelineStateDescriptor, RenderPassDescriptor, RenderPassHandle,
    Shader, StencilOperation, Texture, TextureFormat,
};

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};

use super::TextCursor;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaterialType {
    Opaque,
    Transparent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MaterialPropertyValue {
    U32(u32),
    /// `u32` property named `*texture` / `*cubemap`: a texture-asset UUID.
    TextureAsset(u64),
    F32(f32),
    V2F(Vec2),
    V3F(Vec3),
    V4F(Vec4),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialProperty {
    pub name: String,
    pub value: MaterialPropertyValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMaterial {
    pub version: u32,
    pub material_type: MaterialType,
    pub shader: AssetHandle,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_stencil: DepthStencilState,
    pub properties: Vec<MaterialProperty>,
}

fn is_texture_asset_property(name: &str) -> bool {
    name.ends_with("texture") || name.ends_with("cubemap")
}

fn parse_cull_mode(token: &str) -> anyhow::Result<CullMode> {
    Ok(match token {
        "none" => CullMode::None,
        "front" => CullMode::Front,
        "back" => CullMode::Back,
        other => anyhow::bail!("unsupported cull mode `{other}`"),
    })
}

fn cull_mode_str(mode: CullMode) -> &'static str {
    match mode {
        CullMode::None => "none",
        CullMode::Front => "front",
        CullMode::Back => "back",
    }
}

fn parse_front_face(token: &str) -> anyhow::Result<FrontFace> {
    Ok(match token {
        "clockwise" => FrontFace::Clockwise,
        "counter_clockwise" => FrontFace::CounterClockwise,
        other => anyhow::bail!("unsupported front face `{other}`"),
    })
}

fn front_face_str(face: FrontFace) -> &'static str {
    match face {
        FrontFace::Clockwise => "clockwise",
        FrontFace::CounterClockwise => "counter_clockwise",
    }
}

const COMPARE_OPS: [(&str, CompareOperation); 8] = [
    ("never", CompareOperation::Never),
    ("less", CompareOperation::Less),
    ("equal", CompareOperation::Equal),
    ("less_or_equal", CompareOperation::LessOrEqual),
    ("greater", CompareOperation::Greater),
    ("not_equal", CompareOperation::NotEqual),
    ("greater_or_equal", CompareOperation::GreaterOrEqual),
    ("always", CompareOperation::Always),
];

fn parse_compare_op(token: &str) -> anyhow::Result<CompareOperation> {
    COMPARE_OPS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, op)| *op)
        .ok_or_else(|| anyhow::anyhow!("unsupported compare op `{token}`"))
}

fn compare_op_str(op: CompareOperation) -> &'static str {
    COMPARE_OPS
        .iter()
        .find(|(_, candidate)| *candidate == op)
        .map(|(name, _)| *name)
        .unwrap_or("always")
}

const STENCIL_OPS: [(&str, StencilOperation); 8] = [
    ("keep", StencilOperation::Keep),
    ("zero", StencilOperation::Zero),
    ("replace", StencilOperation::Replace),
    ("increment_and_clamp", StencilOperation::IncrementAndClamp),
    ("decrement_and_clamp", StencilOperation::DecrementAndClamp),
    ("invert", StencilOperation::Invert),
    ("increment_and_wrap", StencilOperation::IncrementAndWrap),
    ("decrement_and_wrap", StencilOperation::DecrementAndWrap),
];

fn parse_stencil_op(token: &str) -> anyhow::Result<StencilOperation> {
    STENCIL_OPS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, op)| *op)
        .ok_or_else(|| anyhow::anyhow!("unsupported stencil op `{token}`"))
}

fn stencil_op_str(op: StencilOperation) -> &'static str {
    STENCIL_OPS
        .iter()
        .find(|(_, candidate)| *candidate == op)
        .map(|(name, _)| *name)
        .unwrap_or("keep")
}

fn parse_bool(token: &str) -> anyhow::Result<bool> {
    Ok(match token {
        "true" => true,
        "false" => false,
        other => anyhow::bail!("expected bool, found `{other}`"),
    })
}

pub fn parse_material(text: &str) -> anyhow::Result<ParsedMaterial> {
    let mut cursor = TextCursor::new(text);
    let version = cursor.parse_value_of::<u32>("version")?;
    let material_type = match cursor.value_of("type")? {
        "opaque" => MaterialType::Opaque,
        "transparent" => MaterialType::Transparent,
        other => anyhow::bail!("unsupported material type `{other}`"),
    };
    let shader = AssetHandle(cursor.parse_value_of::<u64>("shader")?);
    let cull_mode = parse_cull_mode(cursor.value_of("cull_mode")?)?;
    let front_face = parse_front_face(cursor.value_of("front_face")?)?;

    let mut depth_stencil = DepthStencilState::default();
    depth_stencil.depth_operation = parse_compare_op(cursor.value_of("depth_operation")?)?;
    depth_stencil.depth_testing = parse_bool(cursor.value_of("depth_testing")?)?;
    depth_stencil.depth_writing = parse_bool(cursor.value_of("depth_writing")?)?;
    depth_stencil.stencil_operation = parse_compare_op(cursor.value_of("stencil_operation")?)?;
    depth_stencil.stencil_testing = parse_bool(cursor.value_of("stencil_testing")?)?;
    depth_stencil.stencil_pass = parse_stencil_op(cursor.value_of("stencil_pass")?)?;
    depth_stencil.stencil_fail = parse_stencil_op(cursor.value_of("stencil_fail")?)?;
    depth_stencil.depth_fail = parse_stencil_op(cursor.value_of("depth_fail")?)?;
    depth_stencil.stencil_compare_mask = cursor.parse_value_of("stencil_compare_mask")?;
    depth_stencil.stencil_write_mask = cursor.parse_value_of("stencil_write_mask")?;
    depth_stencil.stencil_reference_value = cursor.parse_value_of("stencil_reference_value")?;

    let property_count: u32 = cursor.parse_value_of("property_count")?;
    let mut properties = Vec::with_capacity(property_count as usize);
    for _ in 0..property_count {
        let name = cursor.token()?.to_string();
        let type_token = cursor.token()?;
        let value = match type_token {
            "u32" if is_texture_asset_property(&name) => {
                MaterialPropertyValue::TextureAsset(cursor.parse()?)
            }
            "u32" => MaterialPropertyValue::U32(cursor.parse()?),
            "f32" => MaterialPropertyValue::F32(cursor.parse()?),
            "v2f" => MaterialPropertyValue::V2F(Vec2::new(cursor.parse()?, cursor.parse()?)),
            "v3f" => MaterialPropertyValue::V3F(Vec3::new(
                cursor.parse()?,
                cursor.parse()?,
                cursor.parse()?,
            )),
            "v4f" => MaterialPropertyValue::V4F(Vec4::new(
                cursor.parse()?,
                cursor.parse()?,
                cursor.parse()?,
                cursor.parse()?,
            )),
            other => anyhow::bail!("unsupported property type `{other}`"),
        };
        properties.push(MaterialProperty { name, value });
    }

    Ok(ParsedMaterial {
        version,
        material_type,
        shader,
        cull_mode,
        front_face,
        depth_stencil,
        properties,
    })
}

pub fn write_material(material: &ParsedMaterial) -> String {
    let mut out = String::new();
    out.push_str(&format!("version {}\n", material.version));
    out.push_str(&format!(
        "type {}\n",
        match material.material_type {
            MaterialType::Opaque => "opaque",
            MaterialType::Transparent => "transparent",
        }
    ));
    out.push_str(&format!("shader {}\n", material.shader.0));
    out.push_str(&format!("cull_mode {}\n", cull_mode_str(material.cull_mode)));
    out.push_str(&format!("front_face {}\n", front_face_str(material.front_face)));
    let ds = &material.depth_stencil;
    out.push_str(&format!("depth_operation {}\n", compare_op_str(ds.depth_operation)));
    out.push_str(&format!("depth_testing {}\n", ds.depth_testing));
    out.push_str(&format!("depth_writing {}\n", ds.depth_writing));
    out.push_str(&format!("stencil_operation {}\n", compare_op_str(ds.stencil_operation)));
    out.push_str(&format!("stencil_testing {}\n", ds.stencil_testing));
    out.push_str(&format!("stencil_pass {}\n", stencil_op_str(ds.stencil_pass)));
    out.push_str(&format!("stencil_fail {}\n", stencil_op_str(ds.stencil_fail)));
    out.push_str(&format!("depth_fail {}\n", stencil_op_str(ds.depth_fail)));
    out.push_str(&format!("stencil_compare_mask {}\n", ds.stencil_compare_mask));
    out.push_str(&format!("stencil_write_mask {}\n", ds.stencil_write_mask));
    out.push_str(&format!("stencil_reference_value {}\n", ds.stencil_reference_value));
    out.push_str(&format!("property_count {}\n", material.properties.len()));
    for property in &material.properties {
        match &property.value {
            MaterialPropertyValue::U32(value) => {
                out.push_str(&format!("{} u32 {}\n", property.name, value));
            }
            MaterialPropertyValue::TextureAsset(uuid) => {
                out.push_str(&format!("{} u32 {}\n", property.name, uuid));
            }
            MaterialPropertyValue::F32(value) => {
                out.push_str(&format!("{} f32 {}\n", property.name, value));
            }
            MaterialPropertyValue::V2F(value) => {
                out.push_str(&format!("{} v2f {} {}\n", property.name, value.x, value.y));
            }
            MaterialPropertyValue::V3F(value) => {
                out.push_str(&format!(
                    "{} v3f {} {} {}\n",
                    property.name, value.x, value.y, value.z
                ));
            }
            MaterialPropertyValue::V4F(value) => {
                out.push_str(&format!(
                    "{} v4f {} {} {} {}\n",
                    property.name, value.x, value.y, value.z, value.w
                ));
            }
        }
    }
    out
}

/// Parent the material to its shader so acquiring the material loads the
/// shader first (the load job depends on the parent's job).
pub fn on_import_material(manager: &Arc<AssetManager>, handle: AssetHandle) {
    let Some(entry) = manager.entry(handle) else {
        return;
    };
    let absolute = manager.asset_root().join(&entry.path);
    let Ok(text) = std::fs::read_to_string(&absolute) else {
        return;
    };
    match parse_material(&text) {
        Ok(parsed) if !parsed.shader.is_none() => manager.set_parent(handle, parsed.shader),
        Ok(_) => {}
        Err(err) => warn!(path = entry.path, "material parse during import failed: {err:#}"),
    }
}

/// The render pass materials target; created on first use when the host
/// has not installed one from its render graph.
pub(crate) fn resolve_material_render_pass(
    manager: &Arc<AssetManager>,
) -> anyhow::Result<RenderPassHandle> {
    let existing = manager.material_render_pass();
    let renderer = manager.renderer();
    if renderer.render_passes.is_valid(&existing) {
        return Ok(existing);
    }
    let render_pass = renderer.create_render_pass(RenderPassDescriptor {
        name: "forward".into(),
        color_attachments: vec![AttachmentInfo {
            format: TextureFormat::R8G8B8A8Srgb,
            sample_count: 1,
            operation: AttachmentOperation::Clear,
        }],
        depth_stencil_attachments: vec![AttachmentInfo {
            format: TextureFormat::DepthF32StencilU8,
            sample_count: 1,
            operation: AttachmentOperation::Clear,
        }],
        ..Default::default()
    })?;
    manager.set_material_render_pass(render_pass);
    Ok(render_pass)
}

pub(crate) fn build_material(
    manager: &Arc<AssetManager>,
    name: &str,
    parsed: &ParsedMaterial,
    shader: hearth_containers::Handle<Shader>,
) -> anyhow::Result<LoadResult> {
    let renderer = manager.renderer();
    let render_pass = resolve_material_render_pass(manager)?;
    let pipeline = renderer.create_pipeline_state(PipelineStateDescriptor {
        name: name.to_string(),
        shader,
        render_pass,
        cull_mode: parsed.cull_mode,
        front_face: parsed.front_face,
        depth_stencil: parsed.depth_stencil,
        sample_count: 1,
        alpha_blending: parsed.material_type == MaterialType::Transparent,
    })?;
    let material = renderer.create_material(MaterialDescriptor {
        name: name.to_string(),
        pipeline_state: pipeline,
    })?;

    for property in &parsed.properties {
        let applied = match &property.value {
            MaterialPropertyValue::U32(value) => {
                renderer.set_material_property_u32(material, &property.name, *value)
            }
            MaterialPropertyValue::TextureAsset(uuid) => {
                // resolve to the texture's bindless descriptor index;
                // unloaded references read as the invalid index 0
                let texture = manager.get_asset(AssetHandle(*uuid)).gpu_handle::<Texture>();
                let index = if manager.renderer().textures.is_valid(&texture) {
                    texture.index() as u32
                } else {
                    0
                };
                renderer.set_material_property_u32(material, &property.name, index)
            }
            MaterialPropertyValue::F32(value) => {
                renderer.set_material_property_f32(material, &property.name, *value)
            }
            MaterialPropertyValue::V2F(value) => renderer.set_material_property(
                material,
                &property.name,
                bytemuck::cast_slice(&value.to_array()),
            ),
            MaterialPropertyValue::V3F(value) => renderer.set_material_property(
                material,
                &property.name,
                bytemuck::cast_slice(&value.to_array()),
            ),
            MaterialPropertyValue::V4F(value) => {
                renderer.set_material_property_vec4(material, &property.name, *value)
            }
        };
        if let Err(err) = applied {
            warn!(property = property.name, "material property skipped: {err}");
        }
    }

    Ok(LoadResult::gpu(material))
}

pub fn load_material(
    manager: &Arc<AssetManager>,
    _handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name_with_extension(&absolute_path.to_string_lossy()).to_string();
    let text = std::fs::read_to_string(absolute_path)
        .with_context(|| format!("failed to read material {}", absolute_path.display()))?;
    let parsed = parse_material(&text)?;

    // the shader loaded ahead of us through the parent dependency
    let shader_result = manager.get_asset(parsed.shader);
    anyhow::ensure!(
        shader_result.success,
        "material shader {} is not loaded",
        parsed.shader.0
    );
    build_material(manager, &name, &parsed, shader_result.gpu_handle::<Shader>())
}

pub fn unload_material(manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    let material = result.gpu_handle::<Material>();
    let renderer = manager.renderer();
    if !material.is_invalid() {
        let pipeline = renderer
            .materials
            .with(&material, |material| material.pipeline_state)
            .unwrap_or_default();
        let _ = renderer.destroy_material(material, false);
        if !pipeline.is_invalid() {
            let _ = renderer.destroy_pipeline_state(pipeline, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParsedMaterial {
        ParsedMaterial {
            version: 1,
            material_type: MaterialType::Opaque,
            shader: AssetHandle(12345),
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_stencil: DepthStencilState::default(),
            properties: vec![
                MaterialProperty {
                    name: "albedo_color".into(),
                    value: MaterialPropertyValue::V4F(Vec4::new(1.0, 1.0, 1.0, 1.0)),
                },
                MaterialProperty {
                    name: "albedo_texture".into(),
                    value: MaterialPropertyValue::TextureAsset(987654321),
                },
                MaterialProperty {
                    name: "roughness_factor".into(),
                    value: MaterialPropertyValue::F32(0.5),
                },
            ],
        }
    }

    #[test]
    fn material_round_trip() {
        let material = sample();
        let text = write_material(&material);
        let parsed = parse_material(&text).unwrap();
        assert_eq!(parsed, material);
    }

    #[test]
    fn texture_suffix_selects_uuid_parsing() {
        let text = write_material(&sample());
        let parsed = parse_material(&text).unwrap();
        assert_eq!(
            parsed.properties[1].value,
            MaterialPropertyValue::TextureAsset(987654321)
        );
        assert_eq!(
            parsed.properties[2].value,
            MaterialPropertyValue::F32(0.5)
        );
    }

    #[test]
    fn malformed_material_is_rejected() {
        assert!(parse_material("version 1\nshader 2\n").is_err());
        assert!(parse_material("").is_err());
        let mut text = write_material(&sample());
        text = text.replace("cull_mode back", "cull_mode sideways");
        assert!(parse_material(&text).is_err());
    }
}
