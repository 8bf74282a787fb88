//! Shader import: compiled bytecode plus driver-side reflection.
//!
//! The GLSL front end lives with the platform tooling; by the time a shader
//! reaches the registry its file holds bytecode the driver can ingest, and
//! creation hands back the reflected set layouts, vertex inputs and struct
//! metadata.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use hgal::types::{Shader, ShaderDescriptor};

use crate::assets::registry::AssetManager;
use crate::assets::{path, AssetHandle, EmbeddedParams, LoadResult};

pub fn load_shader(
    manager: &Arc<AssetManager>,
    _handle: AssetHandle,
    absolute_path: &Path,
    _embedded: Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult> {
    let name = path::name_with_extension(&absolute_path.to_string_lossy()).to_string();
    let bytecode = std::fs::read(absolute_path)
        .with_context(|| format!("failed to read shader {}", absolute_path.display()))?;
    let shader = manager
        .renderer()
        .create_shader(ShaderDescriptor { name, bytecode })?;
    Ok(LoadResult::gpu(shader))
}

pub fn unload_shader(manager: &Arc<AssetManager>, _handle: AssetHandle, result: LoadResult) {
    let shader = result.gpu_handle::<Shader>();
    if !shader.is_invalid() {
        let _ = manager.renderer().destroy_shader(shader, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetState;
    use crate::jobs::JobPool;
    use crate::scene::SceneStore;
    use hgal::driver::null::encode_shader_bytecode;
    use hgal::driver::NullDriver;
    use hgal::reflection::ShaderReflection;
    use hgal::renderer::Renderer;

    #[test]
    fn shader_reflection_reaches_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let reflection = ShaderReflection {
            sets: vec![Some(Default::default())],
            ..Default::default()
        };
        std::fs::write(dir.path().join("lit.glsl"), encode_shader_bytecode(&reflection)).unwrap();

        let jobs = JobPool::new(2);
        let renderer = Arc::new(Renderer::new(Arc::new(NullDriver::default())).unwrap());
        let scenes = Arc::new(SceneStore::new());
        let manager =
            AssetManager::new(dir.path(), jobs.clone(), renderer.clone(), scenes).unwrap();

        let handle = manager.import_asset("lit.glsl");
        let job = manager.acquire_asset(handle);
        manager.wait_for_asset(job);
        assert_eq!(manager.entry(handle).unwrap().state, AssetState::Loaded);

        let shader = manager.get_asset(handle).gpu_handle::<Shader>();
        let sets = renderer
            .shaders
            .with(&shader, |shader| shader.reflection.sets.len())
            .unwrap();
        assert_eq!(sets, 1);
        jobs.shutdown();
    }
}
