//! Skybox import: six face textures assembled into one cubemap.
//!
//! `haskybox` is `version` followed by six `face_name <uuid>` lines in a
//! fixed face order; each UUID names a texture asset whose source file
//! supplies one cube face.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use hgal::types::{Texture, TextureDescriptor, TextureFormat};

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};

use super::TextCursor;

pub const SKYBOX_FACE_NAMES: [&str; 6] = ["right", "left", "top", "bottom", "front", "back"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSkybox {
    pub version: u32,
    pub faces: [AssetHandle; 6],
}

pub fn parse_skybox(text: &str) -> anyhow::Result<ParsedSkybox> {
    let mut cursor = TextCursor::new(text);
    let version = cursor.parse_value_of::<u32>("version")?;
    let mut faces = [AssetHandle::NONE; 6];
    for (face, name) in SKYBOX_FACE_NAMES.iter().enumerate() {
        faces[face] = AssetHandle(cursor.parse_value_of::<u64>(name)?);
    }
    Ok(ParsedSkybox { version, faces })
}

pub fn write_skybox(skybox: &ParsedSkybox) -> String {
    let mut out = format!("version {}\n", skybox.version);
    for (face, name) in SKYBOX_FACE_NAMES.iter().enumerate() {
        out.push_str(&format!("{name} {}\n", skybox.faces[face].0));
    }
    out
}

pub fn load_skybox(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name_with_extension(&absolute_path.to_string_lossy()).to_string();
    let text = std::fs::read_to_string(absolute_path)
        .with_context(|| format!("failed to read skybox {}", absolute_path.display()))?;
    let parsed = parse_skybox(&text)?;

    // decode every face from its texture asset's source file
    let mut width = 0;
    let mut height = 0;
    let mut layers = Vec::with_capacity(6);
    for (face, face_uuid) in parsed.faces.iter().enumerate() {
        let entry = manager
            .entry(*face_uuid)
            .with_context(|| format!("skybox face `{}` asset {} is unknown", SKYBOX_FACE_NAMES[face], face_uuid.0))?;
        let face_path = manager.asset_root().join(&entry.path);
        let image = image::open(&face_path)
            .with_context(|| format!("failed to decode cube face {}", face_path.display()))?
            .to_rgba8();
        if face == 0 {
            width = image.width();
            height = image.height();
        } else {
            anyhow::ensure!(
                image.width() == width && image.height() == height,
                "cube face {} is {}x{}, expected {width}x{height}",
                SKYBOX_FACE_NAMES[face],
                image.width(),
                image.height()
            );
        }
        layers.push(image.into_raw());
    }

    let renderer = manager.renderer();
    let cubemap = renderer.create_texture(TextureDescriptor {
        name: name.clone(),
        width,
        height,
        format: TextureFormat::R8G8B8A8Srgb,
        layer_count: 6,
        is_cubemap: true,
        data: layers,
        ..Default::default()
    })?;
    renderer.submit_allocation_group(&name, handle.0)?;
    Ok(LoadResult::gpu(cubemap))
}

pub fn unload_skybox(manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    let cubemap = result.gpu_handle::<Texture>();
    if !cubemap.is_invalid() {
        let _ = manager.renderer().destroy_texture(cubemap, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skybox_round_trip() {
        let skybox = ParsedSkybox {
            version: 1,
            faces: [
                AssetHandle(1),
                AssetHandle(2),
                AssetHandle(3),
                AssetHandle(4),
                AssetHandle(5),
                AssetHandle(6),
            ],
        };
        let text = write_skybox(&skybox);
        assert_eq!(parse_skybox(&text).unwrap(), skybox);
    }

    #[test]
    fn face_order_is_fixed() {
        let text = "version 1\nleft 2\nright 1\ntop 3\nbottom 4\nfront 5\nback 6\n";
        assert!(parse_skybox(text).is_err());
    }
}
