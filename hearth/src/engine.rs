//! Engine context: wires the job pool, renderer, scene store and asset
//! manager together and drives the per-frame asset work.

use std::sync::{Arc, Mutex};

use tracing::{info, trace};

use hgal::driver::Driver;
use hgal::renderer::Renderer;

use crate::assets::path::sanitize_path;
use crate::assets::{AssetManager, PollingWatcher};
use crate::config::EngineConfig;
use crate::jobs::JobPool;
use crate::scene::SceneStore;

pub struct Engine {
    pub config: EngineConfig,
    pub jobs: Arc<JobPool>,
    pub renderer: Arc<Renderer>,
    pub scenes: Arc<SceneStore>,
    pub assets: Arc<AssetManager>,
    watcher: Mutex<PollingWatcher>,
}

impl Engine {
    pub fn new(config: EngineConfig, driver: Arc<dyn Driver>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (1..=hgal::MAX_FRAMES_IN_FLIGHT).contains(&config.frames_in_flight),
            "frames_in_flight must be within 1..={}",
            hgal::MAX_FRAMES_IN_FLIGHT
        );
        // load jobs may block on a dependency's job, so two workers minimum
        let jobs = JobPool::new(config.worker_count().max(2));
        let renderer = Arc::new(Renderer::new(driver)?);
        renderer.load_pipeline_cache(&config.asset_root);
        let scenes = Arc::new(SceneStore::new());
        let assets = AssetManager::new(
            &config.asset_root,
            jobs.clone(),
            renderer.clone(),
            scenes.clone(),
        )?;

        let engine = Self {
            watcher: Mutex::new(PollingWatcher::new(&config.asset_root)),
            config,
            jobs,
            renderer,
            scenes,
            assets,
        };
        engine.import_existing_sources();
        info!(root = %engine.config.asset_root.display(), "asset manager initialized");
        Ok(engine)
    }

    /// Import every source file already under the asset root whose
    /// extension is registered; files the registry already knows keep their
    /// UUIDs.
    fn import_existing_sources(&self) {
        let mut directories = vec![self.config.asset_root.clone()];
        while let Some(directory) = directories.pop() {
            let Ok(entries) = std::fs::read_dir(&directory) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    directories.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.config.asset_root) else {
                    continue;
                };
                let relative = sanitize_path(&relative.to_string_lossy());
                let ext = crate::assets::path::extension(&relative);
                if ext.is_empty() || self.assets.type_info_from_extension(ext).is_none() {
                    continue;
                }
                self.assets.import_asset(&relative);
            }
        }
    }

    /// Drain the file watcher and apply its events to the registry.
    pub fn pump_file_events(&self) {
        let events: Vec<_> = {
            let mut watcher = self
                .watcher
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            watcher.poll();
            watcher.events().try_iter().collect()
        };
        for event in events {
            self.assets.process_file_event(event);
        }
    }

    /// Frame-boundary asset work: fire queued reloads and retire finished
    /// upload batches.
    pub fn begin_frame_assets(&self) {
        self.assets.reload_pending();
        if let Ok(finished) = self.renderer.poll_allocation_groups() {
            for group in finished {
                trace!(name = group.name, uuid = group.tag, "upload batch ready");
            }
        }
    }

    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.jobs.wait_for_all_jobs_to_finish();
        self.assets.serialize_registry()?;
        self.renderer.save_pipeline_cache(&self.config.asset_root)?;
        self.jobs.shutdown();
        self.renderer.wait_idle_and_drain()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hgal::driver::NullDriver;

    #[test]
    fn init_imports_existing_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut png = image::RgbaImage::new(4, 4);
        png.pixels_mut().for_each(|pixel| *pixel = image::Rgba([255; 4]));
        png.save(dir.path().join("wood.png")).unwrap();

        let engine = Engine::new(
            EngineConfig::new(dir.path()),
            Arc::new(NullDriver::default()),
        )
        .unwrap();
        let handle = engine.assets.get_asset_handle("wood.png");
        assert!(!handle.is_none());
        assert_eq!(engine.assets.asset_type_name(handle).unwrap(), "texture");
        engine.shutdown().unwrap();
    }

    #[test]
    fn watcher_events_flow_into_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(
            EngineConfig::new(dir.path()),
            Arc::new(NullDriver::default()),
        )
        .unwrap();

        let mut png = image::RgbaImage::new(2, 2);
        png.pixels_mut().for_each(|pixel| *pixel = image::Rgba([1; 4]));
        png.save(dir.path().join("late.png")).unwrap();

        engine.pump_file_events();
        engine.jobs.wait_for_all_jobs_to_finish();
        let handle = engine.assets.get_asset_handle("late.png");
        assert!(!handle.is_none());
        engine.shutdown().unwrap();
    }
}
