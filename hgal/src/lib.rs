//! Hearth graphics abstraction layer.
//!
//! A narrow typed rendering API over an abstract GPU driver: pooled
//! generational handles for every resource kind, a per-frame descriptor
//! allocator, timeline-semaphore upload sequencing, a declarative render
//! graph with transient texture aliasing, and the frame driver that ties a
//! frame together. The concrete GPU API lives behind [`driver::Driver`];
//! [`driver::NullDriver`] is the in-tree headless implementation.

pub mod descriptor;
pub mod driver;
pub mod error;
pub mod frame;
pub mod graph;
pub mod reflection;
pub mod renderer;
pub mod types;

pub use error::HgalError;
pub use renderer::Renderer;

/// Frames the engine may record/submit concurrently.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Descriptor set slots a shader may use.
pub const MAX_BIND_GROUP_INDEX_COUNT: usize = 4;

/// Attachments a render pass may carry across color + resolve + depth.
pub const MAX_ATTACHMENT_COUNT: usize = 8;

/// Upper bound on bindless sampled-image descriptor indices.
pub const MAX_BINDLESS_RESOURCE_DESCRIPTOR_COUNT: u32 = u16::MAX as u32;

/// On-disk pipeline cache location, relative to the working directory.
pub const PIPELINE_CACHE_FILE_PATH: &str = "shaders/bin/pipeline.cache";

pub mod prelude {
    pub use crate::descriptor::DescriptorPoolAllocator;
    pub use crate::driver::{Driver, NullDriver};
    pub use crate::error::HgalError;
    pub use crate::frame::FrameDriver;
    pub use crate::graph::{RenderGraph, RenderTargetInfo};
    pub use crate::renderer::Renderer;
    pub use crate::types::*;
    pub use crate::{MAX_BIND_GROUP_INDEX_COUNT, MAX_FRAMES_IN_FLIGHT};
}
