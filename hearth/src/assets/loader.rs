//! Lifecycle dispatch: acquire/release with reference counts, load and
//! reload jobs, and typed access to cached load results.
//!
//! The loader knows no file formats; it routes through the registered
//! type's function pointers. Embedded assets load through their embedder's
//! loader with the embedded parameters resolved from the path.

use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::jobs::{JobData, JobHandle, JobResult};

use super::path::parse_embedded;
use super::registry::{AssetManager, RegistryInner};
use super::{AssetHandle, AssetState, EmbeddedParams, LoadResult};

impl AssetManager {
    /// Take a reference on the asset, scheduling a load if it was unloaded.
    /// Returns the entry's in-flight job, [`JobHandle::INVALID`] when
    /// nothing needed loading.
    pub fn acquire_asset(self: &Arc<Self>, handle: AssetHandle) -> JobHandle {
        let mut inner = self.lock_inner();
        acquire_locked(self, &mut inner, handle)
    }

    /// The cached load result; unsuccessful when the asset is not loaded.
    pub fn get_asset(&self, handle: AssetHandle) -> LoadResult {
        let inner = self.lock_inner();
        inner.cache.get(&handle.0).cloned().unwrap_or_default()
    }

    /// Drop a reference; the last release unloads the asset and erases its
    /// cache row.
    pub fn release_asset(self: &Arc<Self>, handle: AssetHandle) {
        release_asset(self, handle);
    }

    /// Block until the asset's load job has finished.
    pub fn wait_for_asset(&self, job: JobHandle) -> JobResult {
        self.jobs().wait_for_job(job)
    }

    /// Remember that `owner`'s load took a reference on `child`, to be
    /// released when `owner` unloads.
    pub fn record_child_ref(&self, owner: AssetHandle, child: AssetHandle) {
        let mut inner = self.lock_inner();
        inner.child_refs.entry(owner.0).or_default().push(child.0);
    }
}

fn acquire_locked(
    manager: &Arc<AssetManager>,
    inner: &mut RegistryInner,
    handle: AssetHandle,
) -> JobHandle {
    let (state, parent) = match inner.registry.get_mut(&handle.0) {
        Some(entry) => {
            entry.ref_count += 1;
            (entry.state, entry.parent)
        }
        None => {
            warn!(uuid = handle.0, "acquire_asset: unknown asset");
            return JobHandle::INVALID;
        }
    };

    if state == AssetState::Unloaded {
        if let Some(entry) = inner.registry.get_mut(&handle.0) {
            entry.state = AssetState::Pending;
        }
        // the parent's job becomes this load's dependency, giving strict
        // parent-before-child load ordering
        let parent_job = if AssetManager::is_valid_locked(inner, parent) {
            acquire_locked(manager, inner, parent)
        } else {
            JobHandle::INVALID
        };

        let job_manager = manager.clone();
        let job = manager.jobs().execute_job(
            JobData::new(move |_| load_asset_job(&job_manager, handle)),
            &[parent_job],
        );
        if let Some(entry) = inner.registry.get_mut(&handle.0) {
            entry.job = job;
        }
    }

    inner
        .registry
        .get(&handle.0)
        .map(|entry| entry.job)
        .unwrap_or(JobHandle::INVALID)
}

pub(crate) fn release_asset(manager: &Arc<AssetManager>, handle: AssetHandle) {
    let mut worklist = vec![handle];
    while let Some(handle) = worklist.pop() {
        let unload = {
            let mut inner = manager.lock_inner();
            let Some(entry) = inner.registry.get_mut(&handle.0) else {
                continue;
            };
            if entry.ref_count == 0 {
                warn!(uuid = handle.0, "release_asset: reference count is already zero");
                continue;
            }
            entry.ref_count -= 1;
            if entry.ref_count != 0 {
                None
            } else {
                let type_index = entry.type_index;
                entry.state = AssetState::Unloaded;
                entry.job = JobHandle::INVALID;
                let path = entry.path.clone();
                let result = inner.cache.remove(&handle.0);
                let children = inner.child_refs.remove(&handle.0).unwrap_or_default();
                Some((type_index, path, result, children))
            }
        };

        let Some((type_index, path, result, children)) = unload else {
            continue;
        };
        if let Some(result) = result {
            if result.success {
                if let Some(info) = manager.type_info_by_index(type_index) {
                    (info.unload)(manager, handle, result);
                }
            }
        }
        trace!(path, "unloaded asset");
        worklist.extend(children.into_iter().map(AssetHandle));
    }
}

/// Snapshot the entry, run the type's load outside the lock, publish the
/// transition back under it.
pub(crate) fn load_asset_job(manager: &Arc<AssetManager>, handle: AssetHandle) -> JobResult {
    let Some(plan) = load_plan(manager, handle) else {
        return JobResult::Failed;
    };

    let result = (plan.load)(manager, handle, &plan.absolute_path, plan.embedded.as_ref());

    let mut inner = manager.lock_inner();
    let Some(entry) = inner.registry.get_mut(&handle.0) else {
        return JobResult::Failed;
    };
    match result {
        Ok(result) if result.success => {
            entry.state = AssetState::Loaded;
            inner.cache.insert(handle.0, result);
            trace!(path = plan.path, "loaded asset");
            JobResult::Succeeded
        }
        Ok(_) => {
            entry.state = AssetState::FailedToLoad;
            error!(path = plan.path, "failed to load asset");
            JobResult::Failed
        }
        Err(err) => {
            entry.state = AssetState::FailedToLoad;
            error!(path = plan.path, "failed to load asset: {err:#}");
            JobResult::Failed
        }
    }
}

/// Reload variant: the cache row already exists and is replaced in place,
/// so the caller's UUID stays valid across the swap.
pub(crate) fn reload_asset_job(manager: &Arc<AssetManager>, handle: AssetHandle) -> JobResult {
    let Some(plan) = load_plan(manager, handle) else {
        return JobResult::Failed;
    };

    let result = (plan.load)(manager, handle, &plan.absolute_path, plan.embedded.as_ref());

    let mut inner = manager.lock_inner();
    let Some(entry) = inner.registry.get_mut(&handle.0) else {
        return JobResult::Failed;
    };
    match result {
        Ok(result) if result.success => {
            entry.state = AssetState::Loaded;
            inner.cache.insert(handle.0, result);
            trace!(path = plan.path, "reloaded asset");
            JobResult::Succeeded
        }
        other => {
            entry.state = AssetState::FailedToLoad;
            inner.cache.insert(handle.0, LoadResult::default());
            match other {
                Err(err) => error!(path = plan.path, "failed to reload asset: {err:#}"),
                _ => error!(path = plan.path, "failed to reload asset"),
            }
            JobResult::Failed
        }
    }
}

struct LoadPlan {
    path: String,
    absolute_path: std::path::PathBuf,
    load: super::LoadFn,
    embedded: Option<EmbeddedParams>,
}

fn load_plan(manager: &Arc<AssetManager>, handle: AssetHandle) -> Option<LoadPlan> {
    let inner = manager.lock_inner();
    let entry = inner.registry.get(&handle.0)?;
    let embedded = parse_embedded(&entry.path);

    // embedded assets load through the embedder's loader against the
    // embedder's file
    let (loader_type_index, relative_path) = match &embedded {
        Some(embedded) => {
            let embedder = inner.registry.get(&embedded.embedder.0)?;
            (embedder.type_index, embedder.path.clone())
        }
        None => (entry.type_index, entry.path.clone()),
    };
    let info = manager.type_info_by_index(loader_type_index)?;
    let own_type_name = manager
        .type_info_by_index(entry.type_index)
        .map(|info| info.name)
        .unwrap_or_default();

    Some(LoadPlan {
        path: entry.path.clone(),
        absolute_path: manager.asset_root().join(relative_path),
        load: info.load,
        embedded: embedded.map(|embedded| EmbeddedParams {
            name: embedded.name,
            type_name: own_type_name,
            data_id: embedded.data_id,
        }),
    })
}
