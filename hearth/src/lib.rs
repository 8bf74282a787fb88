//! Hearth engine runtime: asset management and job orchestration over the
//! `hgal` rendering layer.
//!
//! The asset manager keeps a content-addressed registry of source files
//! (stable 64-bit UUIDs, parent/child and embedded relations, hot reload),
//! schedules asynchronous loads on the job system with parent-before-child
//! ordering, and materializes GPU resources through the renderer.

pub mod assets;
pub mod config;
pub mod engine;
pub mod jobs;
pub mod scene;

pub use assets::{AssetError, AssetHandle, AssetManager, AssetState, LoadResult};
pub use config::EngineConfig;
pub use engine::Engine;
pub use jobs::{JobPool, JobResult};

pub mod prelude {
    pub use crate::assets::{AssetHandle, AssetManager, AssetState, LoadResult};
    pub use crate::config::EngineConfig;
    pub use crate::engine::Engine;
    pub use crate::jobs::{JobHandle, JobPool, JobResult};
    pub use crate::scene::SceneStore;
}
