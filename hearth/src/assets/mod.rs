//! Asset management: registry, loader, importers and the file watcher glue.

pub mod importers;
pub mod loader;
pub mod path;
pub mod registry;
pub mod watcher;

pub use registry::{AssetEntry, AssetManager};
pub use watcher::{FileEvent, FileEventKind, PollingWatcher};

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use hearth_containers::Handle;
use thiserror::Error;

pub const ASSET_REGISTRY_FILE_NAME: &str = "asset_registry.haregistry";

/// Why an import produced "no asset". None of these are fatal; the watcher
/// or a later import may retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("invalid path `{0}`")]
    InvalidPath(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("embedder {embedder} of `{path}` is not a valid asset")]
    InvalidEmbedder { path: String, embedder: u64 },

    #[error("extension `{0}` is not registered with any asset type")]
    UnknownAssetType(String),
}

/// Stable identity of an asset: a nonzero 64-bit UUID. Zero means
/// "none/invalid".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct AssetHandle(pub u64);

impl AssetHandle {
    pub const NONE: AssetHandle = AssetHandle(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssetState {
    Unloaded,
    Pending,
    Loaded,
    FailedToLoad,
}

/// The opaque outcome of loading an asset: either a CPU-resident object or
/// a typed GPU resource handle flattened to `{index, generation}`.
#[derive(Clone, Default)]
pub enum LoadPayload {
    #[default]
    None,
    Cpu(Arc<dyn Any + Send + Sync>),
    Gpu {
        index: i32,
        generation: u32,
    },
}

impl std::fmt::Debug for LoadPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadPayload::None => write!(f, "None"),
            LoadPayload::Cpu(_) => write!(f, "Cpu(..)"),
            LoadPayload::Gpu { index, generation } => {
                write!(f, "Gpu {{ index: {index}, generation: {generation} }}")
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    pub success: bool,
    pub payload: LoadPayload,
}

impl LoadResult {
    pub fn failed() -> Self {
        Self::default()
    }

    pub fn cpu<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            success: true,
            payload: LoadPayload::Cpu(Arc::new(value)),
        }
    }

    pub fn gpu<T>(handle: Handle<T>) -> Self {
        Self {
            success: true,
            payload: LoadPayload::Gpu {
                index: handle.index(),
                generation: handle.generation(),
            },
        }
    }

    /// Reconstruct the typed handle a GPU payload was flattened from.
    pub fn gpu_handle<T>(&self) -> Handle<T> {
        match self.payload {
            LoadPayload::Gpu { index, generation } => Handle::new(index, generation),
            _ => Handle::INVALID,
        }
    }

    pub fn cpu_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match &self.payload {
            LoadPayload::Cpu(value) => value.clone().downcast::<T>().ok(),
            _ => None,
        }
    }
}

/// Parameters handed to an embedder's load when resolving an embedded asset.
#[derive(Debug, Clone)]
pub struct EmbeddedParams {
    /// Name component of the embedded path, extension included.
    pub name: String,
    /// Registered type name of the embedded entry.
    pub type_name: String,
    /// Sub-resource selector inside the embedder (material index, mesh
    /// index, ...).
    pub data_id: u64,
}

pub type LoadFn = fn(
    &Arc<AssetManager>,
    AssetHandle,
    &Path,
    Option<&EmbeddedParams>,
) -> anyhow::Result<LoadResult>;

pub type UnloadFn = fn(&Arc<AssetManager>, AssetHandle, LoadResult);

pub type OnImportFn = fn(&Arc<AssetManager>, AssetHandle);

/// Behavior record for one registered asset type.
#[derive(Clone)]
pub struct AssetTypeInfo {
    pub name: String,
    pub extensions: Vec<String>,
    pub load: LoadFn,
    pub unload: UnloadFn,
    pub on_import: Option<OnImportFn>,
}

impl std::fmt::Debug for AssetTypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetTypeInfo")
            .field("name", &self.name)
            .field("extensions", &self.extensions)
            .finish()
    }
}

