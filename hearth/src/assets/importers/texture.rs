//! Texture and environment map import through the `image` crate.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use hgal::types::{Texture, TextureDescriptor, TextureFormat};

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};

pub fn load_texture(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name_with_extension(&absolute_path.to_string_lossy()).to_string();
    let image = image::open(absolute_path)
        .with_context(|| format!("failed to decode image {}", absolute_path.display()))?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();

    let renderer = manager.renderer();
    let texture = renderer.create_texture(TextureDescriptor {
        name: name.clone(),
        width,
        height,
        format: TextureFormat::R8G8B8A8Srgb,
        mipmapping: true,
        data: vec![rgba.into_raw()],
        ..Default::default()
    })?;
    renderer.submit_allocation_group(&name, handle.0)?;
    Ok(LoadResult::gpu(texture))
}

/// HDR equirectangular source decoded to a float texture; the cubemap
/// convolution runs on the GPU later.
pub fn load_environment_map(
    manager: &Arc<AssetManager>,
    handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name_with_extension(&absolute_path.to_string_lossy()).to_string();
    let image = image::open(absolute_path)
        .with_context(|| format!("failed to decode hdr {}", absolute_path.display()))?;
    let rgba = image.to_rgba32f();
    let (width, height) = rgba.dimensions();
    let texels: Vec<u8> = bytemuck::cast_slice(rgba.as_raw()).to_vec();

    let renderer = manager.renderer();
    let texture = renderer.create_texture(TextureDescriptor {
        name: name.clone(),
        width,
        height,
        format: TextureFormat::R32G32B32A32Sfloat,
        data: vec![texels],
        ..Default::default()
    })?;
    renderer.submit_allocation_group(&name, handle.0)?;
    Ok(LoadResult::gpu(texture))
}

pub fn unload_texture(manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    let texture = result.gpu_handle::<Texture>();
    if !texture.is_invalid() {
        let _ = manager.renderer().destroy_texture(texture, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetState;
    use crate::jobs::JobPool;
    use crate::scene::SceneStore;
    use hgal::driver::NullDriver;
    use hgal::renderer::Renderer;

    fn write_png(path: &Path, width: u32, height: u32) {
        let mut buffer = image::RgbaImage::new(width, height);
        for pixel in buffer.pixels_mut() {
            *pixel = image::Rgba([200, 160, 120, 255]);
        }
        buffer.save(path).unwrap();
    }

    #[test]
    fn fresh_import_acquire_release_cycle() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("wood.png"), 32, 32);

        let jobs = JobPool::new(2);
        let renderer = Arc::new(Renderer::new(Arc::new(NullDriver::default())).unwrap());
        let scenes = Arc::new(SceneStore::new());
        let manager = AssetManager::new(dir.path(), jobs.clone(), renderer.clone(), scenes).unwrap();

        let handle = manager.import_asset("wood.png");
        assert!(!handle.is_none());
        let entry = manager.entry(handle).unwrap();
        assert_eq!(entry.path, "wood.png");
        assert_eq!(entry.state, AssetState::Unloaded);
        assert_eq!(entry.ref_count, 0);
        assert_eq!(manager.asset_type_name(handle).unwrap(), "texture");

        let job = manager.acquire_asset(handle);
        manager.wait_for_asset(job);
        let entry = manager.entry(handle).unwrap();
        assert_eq!(entry.state, AssetState::Loaded);
        assert_eq!(entry.ref_count, 1);
        let result = manager.get_asset(handle);
        assert!(result.success);
        let texture = result.gpu_handle::<Texture>();
        assert!(renderer.textures.is_valid(&texture));

        manager.release_asset(handle);
        let entry = manager.entry(handle).unwrap();
        assert_eq!(entry.state, AssetState::Unloaded);
        assert_eq!(entry.ref_count, 0);
        assert!(!manager.get_asset(handle).success);
        jobs.shutdown();
    }

    #[test]
    fn broken_image_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();

        let jobs = JobPool::new(2);
        let renderer = Arc::new(Renderer::new(Arc::new(NullDriver::default())).unwrap());
        let scenes = Arc::new(SceneStore::new());
        let manager = AssetManager::new(dir.path(), jobs.clone(), renderer, scenes).unwrap();

        let handle = manager.import_asset("broken.png");
        let job = manager.acquire_asset(handle);
        manager.wait_for_asset(job);
        let entry = manager.entry(handle).unwrap();
        assert_eq!(entry.state, AssetState::FailedToLoad);
        // the reference is still held; get_asset reports no success
        assert_eq!(entry.ref_count, 1);
        assert!(!manager.get_asset(handle).success);
        jobs.shutdown();
    }
}
