use std::path::PathBuf;

/// Startup configuration. The asset root is the single external input; the
/// rest defaults to the hardware.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub asset_root: PathBuf,
    pub frames_in_flight: usize,
    /// Worker pool size; `None` means `available_parallelism - 1`.
    pub worker_threads: Option<usize>,
}

impl EngineConfig {
    pub fn new(asset_root: impl Into<PathBuf>) -> Self {
        Self {
            asset_root: asset_root.into(),
            frames_in_flight: hgal::MAX_FRAMES_IN_FLIGHT,
            worker_threads: None,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|threads| threads.get().saturating_sub(1))
                .unwrap_or(1)
                .max(1)
        })
    }
}
