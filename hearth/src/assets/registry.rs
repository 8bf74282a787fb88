//! The asset registry: canonical `uuid -> entry` map, path index, embedded
//! and dependency indices, file-watcher event application, cascading reload
//! and registry persistence.
//!
//! A single `asset_mutex` (the `inner` field) guards all registry mutation.
//! Public functions lock it; `_locked` internals assume the caller holds it.
//! Load and reload jobs take the mutex only to publish state transitions,
//! never across file I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::UNIX_EPOCH;

use rand::Rng;
use tracing::{error, trace, warn};

use hgal::renderer::Renderer;
use hgal::types::{RenderPassHandle, ShaderHandle};

use crate::jobs::{JobData, JobHandle, JobPool};
use crate::scene::SceneStore;

use super::path::{extension, is_embedded, name_with_extension, parse_embedded, sanitize_path};
use super::{
    loader, AssetError, AssetHandle, AssetState, AssetTypeInfo, LoadFn, LoadResult, OnImportFn,
    UnloadFn, ASSET_REGISTRY_FILE_NAME,
};

#[derive(Debug, Clone)]
pub struct AssetEntry {
    pub path: String,
    pub type_index: u16,
    pub parent: AssetHandle,
    pub last_write_time: u64,
    pub ref_count: u32,
    pub state: AssetState,
    pub job: JobHandle,
    pub is_deleted: bool,
}

impl AssetEntry {
    fn new(path: String, type_index: u16) -> Self {
        Self {
            path,
            type_index,
            parent: AssetHandle::NONE,
            last_write_time: 0,
            ref_count: 0,
            state: AssetState::Unloaded,
            job: JobHandle::INVALID,
            is_deleted: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    pub registry: HashMap<u64, AssetEntry>,
    pub path_index: HashMap<String, u64>,
    /// embedder uuid -> embedded children
    pub embedded_index: HashMap<u64, Vec<u64>>,
    /// parent uuid -> children, kept in parallel with `parent` fields
    pub dependency_index: HashMap<u64, Vec<u64>>,
    pub cache: HashMap<u64, LoadResult>,
    pub pending_reload: Vec<AssetHandle>,
    /// assets acquired by an asset's load, released when it unloads
    pub child_refs: HashMap<u64, Vec<u64>>,
}

pub struct AssetManager {
    asset_root: PathBuf,
    registry_path: PathBuf,
    type_infos: RwLock<Vec<AssetTypeInfo>>,
    pub(crate) inner: Mutex<RegistryInner>,
    jobs: Arc<JobPool>,
    renderer: Arc<Renderer>,
    scenes: Arc<SceneStore>,
    /// Pass opaque/transparent materials target; installed by the host once
    /// the render graph is compiled.
    material_render_pass: RwLock<RenderPassHandle>,
    default_material_shader: RwLock<ShaderHandle>,
}

impl std::fmt::Debug for AssetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetManager")
            .field("asset_root", &self.asset_root)
            .finish()
    }
}

fn generate_uuid(taken: &HashMap<u64, AssetEntry>) -> u64 {
    let mut rng = rand::rng();
    loop {
        let uuid: u64 = rng.random_range(1..=u64::MAX);
        if !taken.contains_key(&uuid) {
            return uuid;
        }
    }
}

fn file_last_write_time(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}

impl AssetManager {
    pub fn new(
        asset_root: impl Into<PathBuf>,
        jobs: Arc<JobPool>,
        renderer: Arc<Renderer>,
        scenes: Arc<SceneStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let asset_root = asset_root.into();
        anyhow::ensure!(
            asset_root.is_dir(),
            "asset root {} does not exist",
            asset_root.display()
        );
        let registry_path = asset_root.join(ASSET_REGISTRY_FILE_NAME);
        let manager = Arc::new(Self {
            asset_root,
            registry_path,
            type_infos: RwLock::new(Vec::new()),
            inner: Mutex::new(RegistryInner::default()),
            jobs,
            renderer,
            scenes,
            material_render_pass: RwLock::new(RenderPassHandle::INVALID),
            default_material_shader: RwLock::new(ShaderHandle::INVALID),
        });
        super::importers::register_builtin_types(&manager);
        if manager.registry_path.exists() {
            manager.deserialize_registry()?;
        }
        Ok(manager)
    }

    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn scenes(&self) -> &Arc<SceneStore> {
        &self.scenes
    }

    pub fn jobs(&self) -> &Arc<JobPool> {
        &self.jobs
    }

    pub fn material_render_pass(&self) -> RenderPassHandle {
        *self
            .material_render_pass
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn set_material_render_pass(&self, render_pass: RenderPassHandle) {
        *self
            .material_render_pass
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = render_pass;
    }

    pub fn default_material_shader(&self) -> ShaderHandle {
        *self
            .default_material_shader
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn set_default_material_shader(&self, shader: ShaderHandle) {
        *self
            .default_material_shader
            .write()
            .unwrap_or_else(|poison| poison.into_inner()) = shader;
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    //
    // Type registration
    //

    pub fn register_asset(
        &self,
        name: &str,
        extensions: &[&str],
        load: LoadFn,
        unload: UnloadFn,
        on_import: Option<OnImportFn>,
    ) -> bool {
        let mut type_infos = self
            .type_infos
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        if type_infos.iter().any(|info| info.name == name) {
            trace!(name, "asset type already registered");
            return false;
        }
        type_infos.push(AssetTypeInfo {
            name: name.to_string(),
            extensions: extensions.iter().map(|ext| ext.to_string()).collect(),
            load,
            unload,
            on_import,
        });
        true
    }

    pub fn get_asset_info(&self, name: &str) -> Option<AssetTypeInfo> {
        self.type_infos
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .find(|info| info.name == name)
            .cloned()
    }

    pub fn type_info_by_index(&self, type_index: u16) -> Option<AssetTypeInfo> {
        self.type_infos
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(type_index as usize)
            .cloned()
    }

    pub fn type_info_from_extension(&self, ext: &str) -> Option<(u16, AssetTypeInfo)> {
        self.type_infos
            .read()
            .unwrap_or_else(|poison| poison.into_inner())
            .iter()
            .enumerate()
            .find(|(_, info)| info.extensions.iter().any(|candidate| candidate == ext))
            .map(|(index, info)| (index as u16, info.clone()))
    }

    pub fn asset_type_name(&self, handle: AssetHandle) -> Option<String> {
        let type_index = {
            let inner = self.lock_inner();
            inner.registry.get(&handle.0)?.type_index
        };
        self.type_info_by_index(type_index).map(|info| info.name)
    }

    //
    // Queries
    //

    pub fn is_asset_handle_valid(&self, handle: AssetHandle) -> bool {
        if handle.is_none() {
            return false;
        }
        let inner = self.lock_inner();
        Self::is_valid_locked(&inner, handle)
    }

    pub(crate) fn is_valid_locked(inner: &RegistryInner, handle: AssetHandle) -> bool {
        inner
            .registry
            .get(&handle.0)
            .map(|entry| !entry.is_deleted)
            .unwrap_or(false)
    }

    pub fn is_asset_loaded(&self, handle: AssetHandle) -> bool {
        let inner = self.lock_inner();
        inner
            .cache
            .get(&handle.0)
            .map(|result| result.success)
            .unwrap_or(false)
    }

    /// O(1) lookup through the path index; deleted entries are not indexed.
    pub fn get_asset_handle(&self, path: &str) -> AssetHandle {
        let path = sanitize_path(path);
        let inner = self.lock_inner();
        inner
            .path_index
            .get(&path)
            .copied()
            .map(AssetHandle)
            .unwrap_or(AssetHandle::NONE)
    }

    /// Snapshot of one entry's bookkeeping.
    pub fn entry(&self, handle: AssetHandle) -> Option<AssetEntry> {
        let inner = self.lock_inner();
        inner.registry.get(&handle.0).cloned()
    }

    pub fn is_asset_embedded(&self, handle: AssetHandle) -> bool {
        self.entry(handle)
            .map(|entry| is_embedded(&entry.path))
            .unwrap_or(false)
    }

    pub fn get_embedded_assets(&self, handle: AssetHandle) -> Vec<AssetHandle> {
        let inner = self.lock_inner();
        inner
            .embedded_index
            .get(&handle.0)
            .map(|children| children.iter().copied().map(AssetHandle).collect())
            .unwrap_or_default()
    }

    pub fn dependency_children(&self, handle: AssetHandle) -> Vec<AssetHandle> {
        let inner = self.lock_inner();
        inner
            .dependency_index
            .get(&handle.0)
            .map(|children| children.iter().copied().map(AssetHandle).collect())
            .unwrap_or_default()
    }

    /// On-disk path for an entry; embedded assets resolve through their
    /// embedder's file.
    pub(crate) fn absolute_path_locked(&self, inner: &RegistryInner, uuid: u64) -> PathBuf {
        let Some(entry) = inner.registry.get(&uuid) else {
            return self.asset_root.clone();
        };
        if let Some(embedded) = parse_embedded(&entry.path) {
            if let Some(embedder) = inner.registry.get(&embedded.embedder.0) {
                return self.asset_root.join(&embedder.path);
            }
        }
        self.asset_root.join(&entry.path)
    }

    //
    // Import
    //

    /// Non-fatal wrapper around [`Self::try_import_asset`]: failures log and
    /// yield "no asset".
    pub fn import_asset(self: &Arc<Self>, path: &str) -> AssetHandle {
        match self.try_import_asset(path) {
            Ok(handle) => handle,
            Err(err) => {
                warn!("import_asset: {err}");
                AssetHandle::NONE
            }
        }
    }

    pub fn try_import_asset(self: &Arc<Self>, path: &str) -> Result<AssetHandle, AssetError> {
        if path.is_empty() {
            return Err(AssetError::InvalidPath(String::new()));
        }
        let path = sanitize_path(path);

        let mut pending_on_import: Option<(OnImportFn, AssetHandle)> = None;
        let handle = {
            let mut inner = self.lock_inner();

            // a deleted entry with the same file name gets its UUID back
            let wanted_name = name_with_extension(&path).to_string();
            let tombstone = inner
                .registry
                .iter()
                .find(|(_, entry)| {
                    entry.is_deleted && name_with_extension(&entry.path) == wanted_name
                })
                .map(|(&uuid, _)| uuid);
            if let Some(uuid) = tombstone {
                let entry = inner.registry.get_mut(&uuid).expect("tombstone entry");
                entry.path = path.clone();
                entry.is_deleted = false;
                inner.path_index.insert(path.clone(), uuid);
                trace!(path, uuid, "import reused tombstoned uuid");
                return Ok(AssetHandle(uuid));
            }

            if let Some(&uuid) = inner.path_index.get(&path) {
                return Ok(AssetHandle(uuid));
            }
            // a deleted entry under the exact path yields "no asset"
            if inner
                .registry
                .values()
                .any(|entry| entry.is_deleted && entry.path == path)
            {
                return Ok(AssetHandle::NONE);
            }

            let embedded = parse_embedded(&path);
            if let Some(embedded) = &embedded {
                if !Self::is_valid_locked(&inner, embedded.embedder) {
                    return Err(AssetError::InvalidEmbedder {
                        path,
                        embedder: embedded.embedder.0,
                    });
                }
            } else if !self.asset_root.join(&path).is_file() {
                return Err(AssetError::NotFound(path));
            }

            let ext = extension(&path);
            let Some((type_index, info)) = self.type_info_from_extension(ext) else {
                return Err(AssetError::UnknownAssetType(ext.to_string()));
            };

            let uuid = generate_uuid(&inner.registry);
            let mut entry = AssetEntry::new(path.clone(), type_index);
            if let Some(embedded) = &embedded {
                entry.parent = embedded.embedder;
            }
            inner.registry.insert(uuid, entry);
            inner.path_index.insert(path.clone(), uuid);

            if let Some(embedded) = &embedded {
                Self::add_embedded_locked(&mut inner, embedded.embedder.0, uuid);
                Self::add_dependency_locked(&mut inner, embedded.embedder.0, uuid);
            }

            if let Some(on_import) = info.on_import {
                pending_on_import = Some((on_import, AssetHandle(uuid)));
            }
            trace!(path, uuid, "imported asset");
            AssetHandle(uuid)
        };

        // on_import may import further assets; it runs without the registry
        // lock held
        if let Some((on_import, imported)) = pending_on_import {
            on_import(self, imported);
        }
        Ok(handle)
    }

    fn add_embedded_locked(inner: &mut RegistryInner, embedder: u64, child: u64) {
        let children = inner.embedded_index.entry(embedder).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    fn add_dependency_locked(inner: &mut RegistryInner, parent: u64, child: u64) {
        let children = inner.dependency_index.entry(parent).or_default();
        if !children.contains(&child) {
            children.push(child);
        }
    }

    pub fn set_parent(&self, asset: AssetHandle, parent: AssetHandle) {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.registry.get(&asset.0) else {
            return;
        };
        let old_parent = entry.parent;
        if !old_parent.is_none() {
            if let Some(children) = inner.dependency_index.get_mut(&old_parent.0) {
                children.retain(|&child| child != asset.0);
            }
        }
        let parent_exists = inner.registry.contains_key(&parent.0);
        if parent_exists {
            Self::add_dependency_locked(&mut inner, parent.0, asset.0);
        }
        if parent.is_none() || parent_exists {
            if let Some(entry) = inner.registry.get_mut(&asset.0) {
                entry.parent = parent;
            }
        } else {
            error!(asset = asset.0, parent = parent.0, "set_parent: parent asset is invalid");
        }
    }

    //
    // Watcher & reload
    //

    pub fn process_file_event(self: &Arc<Self>, event: super::FileEvent) {
        let path = sanitize_path(&event.path);
        // directory events carry no extension
        if extension(&path).is_empty() {
            return;
        }
        match event.kind {
            super::FileEventKind::Added => {
                trace!(path, "[import]");
                let handle = self.import_asset(&path);
                if !handle.is_none() {
                    self.reload_asset(handle);
                }
                if let Err(err) = self.serialize_registry() {
                    error!("failed to persist registry: {err}");
                }
            }
            super::FileEventKind::Modified => {
                trace!(path, "[modified]");
                let handle = self.get_asset_handle(&path);
                if !handle.is_none() {
                    self.lock_inner().pending_reload.push(handle);
                }
            }
            super::FileEventKind::Renamed { new_path } => {
                let new_path = sanitize_path(&new_path);
                trace!(path, new_path, "[rename]");
                {
                    let mut inner = self.lock_inner();
                    let Some(&uuid) = inner.path_index.get(&path) else {
                        return;
                    };
                    inner.path_index.remove(&path);
                    inner.path_index.insert(new_path.clone(), uuid);
                    if let Some(entry) = inner.registry.get_mut(&uuid) {
                        entry.path = new_path;
                    }
                }
                if let Err(err) = self.serialize_registry() {
                    error!("failed to persist registry: {err}");
                }
            }
            super::FileEventKind::Deleted => {
                trace!(path, "[deleted]");
                {
                    let mut inner = self.lock_inner();
                    let Some(&uuid) = inner.path_index.get(&path) else {
                        return;
                    };
                    inner.path_index.remove(&path);
                    if let Some(entry) = inner.registry.get_mut(&uuid) {
                        // tombstone: the uuid survives the file
                        entry.is_deleted = true;
                    }
                }
                if let Err(err) = self.serialize_registry() {
                    error!("failed to persist registry: {err}");
                }
            }
        }
    }

    /// Drain the modified-file queue; called at a safe point, typically the
    /// frame boundary.
    pub fn reload_pending(self: &Arc<Self>) {
        let pending = std::mem::take(&mut self.lock_inner().pending_reload);
        for handle in pending {
            self.reload_asset(handle);
        }
    }

    pub fn reload_asset(self: &Arc<Self>, handle: AssetHandle) {
        self.reload_asset_with(handle, false);
    }

    pub fn reload_asset_with(self: &Arc<Self>, handle: AssetHandle, force: bool) {
        let mut deferred_releases = Vec::new();
        {
            let mut inner = self.lock_inner();
            self.reload_locked(&mut inner, handle, JobHandle::INVALID, force, &mut deferred_releases);
        }
        for uuid in deferred_releases {
            loader::release_asset(self, AssetHandle(uuid));
        }
    }

    /// Reload one asset and cascade to its dependency children, threading
    /// each freshly submitted job as the children's parent dependency so
    /// parents reload strictly before children.
    fn reload_locked(
        self: &Arc<Self>,
        inner: &mut RegistryInner,
        handle: AssetHandle,
        parent_job: JobHandle,
        force: bool,
        deferred_releases: &mut Vec<u64>,
    ) {
        if !Self::is_valid_locked(inner, handle) {
            return;
        }
        let (state, previous_job, type_index) = {
            let entry = inner.registry.get(&handle.0).expect("validity checked");
            (entry.state, entry.job, entry.type_index)
        };
        if state == AssetState::Unloaded {
            return;
        }

        let absolute = self.absolute_path_locked(inner, handle.0);
        let last_write_time = file_last_write_time(&absolute);
        if inner
            .registry
            .get(&handle.0)
            .map(|entry| entry.last_write_time == last_write_time)
            .unwrap_or(false)
            && !force
        {
            return;
        }

        inner.cache.entry(handle.0).or_default();

        if state == AssetState::Loaded {
            if let Some(info) = self.type_info_by_index(type_index) {
                let result = std::mem::take(inner.cache.get_mut(&handle.0).expect("cache row"));
                // unload touches only renderer/scene state; asset refs the
                // load acquired are released by the caller after unlock
                (info.unload)(self, handle, result);
            }
            if let Some(children) = inner.child_refs.remove(&handle.0) {
                deferred_releases.extend(children);
            }
        }

        {
            let entry = inner.registry.get_mut(&handle.0).expect("validity checked");
            entry.last_write_time = last_write_time;
            entry.state = AssetState::Pending;
        }

        let manager = self.clone();
        let job = self.jobs.execute_job(
            JobData::new(move |_| loader::reload_asset_job(&manager, handle)),
            &[previous_job, parent_job],
        );
        if let Some(entry) = inner.registry.get_mut(&handle.0) {
            entry.job = job;
        }

        let children: Vec<u64> = inner
            .dependency_index
            .get(&handle.0)
            .cloned()
            .unwrap_or_default();
        for child in children {
            self.reload_locked(inner, AssetHandle(child), job, true, deferred_releases);
        }
    }

    //
    // Persistence
    //

    /// Text registry: sorted by `(has_parent + is_embedded, uuid)` so
    /// parents and embedders serialize before their children.
    pub fn serialize_registry(&self) -> anyhow::Result<()> {
        let contents = {
            let inner = self.lock_inner();
            let mut handles: Vec<u64> = inner.registry.keys().copied().collect();
            handles.sort_by_key(|uuid| {
                let entry = &inner.registry[uuid];
                let mut relation_count = 0u32;
                if !entry.parent.is_none() {
                    relation_count += 1;
                }
                if is_embedded(&entry.path) {
                    relation_count += 1;
                }
                (relation_count, *uuid)
            });

            let mut out = String::new();
            out.push_str("version 1\n");
            out.push_str(&format!("entry_count {}\n", handles.len()));
            for uuid in handles {
                let entry = &inner.registry[&uuid];
                out.push_str(&format!("\nasset {uuid}\n"));
                out.push_str(&format!("parent {}\n", entry.parent.0));
                out.push_str(&format!("path {} {}\n", entry.path.len(), entry.path));
            }
            out
        };
        std::fs::write(&self.registry_path, contents)?;
        trace!("serialized asset registry");
        Ok(())
    }

    pub fn deserialize_registry(&self) -> anyhow::Result<()> {
        let contents = std::fs::read_to_string(&self.registry_path)?;
        let mut lines = contents.lines().filter(|line| !line.trim().is_empty());

        let version = parse_name_value(lines.next(), "version")?;
        anyhow::ensure!(version == "1", "unsupported registry version {version}");
        let entry_count: usize = parse_name_value(lines.next(), "entry_count")?.parse()?;

        let mut inner = self.lock_inner();
        for entry_index in 0..entry_count {
            let uuid: u64 = parse_name_value(lines.next(), "asset")
                .map_err(|err| anyhow::anyhow!("entry {entry_index}: {err}"))?
                .parse()?;
            let parent: u64 = parse_name_value(lines.next(), "parent")
                .map_err(|err| anyhow::anyhow!("entry {entry_index}: {err}"))?
                .parse()?;
            let path_line = lines
                .next()
                .ok_or_else(|| anyhow::anyhow!("entry {entry_index}: missing path"))?;
            let rest = path_line
                .strip_prefix("path ")
                .ok_or_else(|| anyhow::anyhow!("entry {entry_index}: malformed path line"))?;
            let (length, path_text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow::anyhow!("entry {entry_index}: malformed path line"))?;
            let length: usize = length.parse()?;
            anyhow::ensure!(
                path_text.len() >= length && path_text.is_char_boundary(length),
                "entry {entry_index}: path shorter than its recorded length"
            );
            let path = sanitize_path(&path_text[..length]);

            let ext = extension(&path);
            let Some((type_index, _)) = self.type_info_from_extension(ext) else {
                anyhow::bail!("entry {entry_index}: extension `{ext}` is not registered");
            };

            let mut entry = AssetEntry::new(path.clone(), type_index);
            entry.parent = AssetHandle(parent);

            // tombstone entries are the ones whose backing file vanished
            let embedded = parse_embedded(&path);
            let absolute = match &embedded {
                Some(embedded) => inner
                    .registry
                    .get(&embedded.embedder.0)
                    .map(|embedder| self.asset_root.join(&embedder.path)),
                None => Some(self.asset_root.join(&path)),
            };
            entry.is_deleted = absolute.map(|path| !path.is_file()).unwrap_or(false);

            let is_deleted = entry.is_deleted;
            inner.registry.insert(uuid, entry);
            if !is_deleted {
                inner.path_index.insert(path.clone(), uuid);
            }

            if let Some(embedded) = embedded {
                if Self::is_valid_locked(&inner, embedded.embedder) {
                    Self::add_embedded_locked(&mut inner, embedded.embedder.0, uuid);
                    Self::add_dependency_locked(&mut inner, embedded.embedder.0, uuid);
                }
            }
            if parent != 0 && inner.registry.contains_key(&parent) {
                Self::add_dependency_locked(&mut inner, parent, uuid);
            }
        }
        trace!(entries = entry_count, "deserialized asset registry");
        Ok(())
    }
}

fn parse_name_value<'a>(line: Option<&'a str>, name: &str) -> anyhow::Result<&'a str> {
    let line = line.ok_or_else(|| anyhow::anyhow!("missing `{name}` line"))?;
    line.strip_prefix(name)
        .map(str::trim)
        .ok_or_else(|| anyhow::anyhow!("expected `{name}`, found `{line}`"))
}
