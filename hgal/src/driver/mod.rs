//! The function-table seam between the typed renderer API and a concrete GPU
//! API. A Vulkan/Metal/DX12 backend implements [`Driver`]; the in-tree
//! [`NullDriver`] is a headless device for tests and tooling.

pub mod null;

pub use null::NullDriver;

use crate::error::HgalError;
use crate::types::{BufferDescriptor, ClearValue, RenderPassDescriptor, SamplerDescriptor, TextureDescriptor};
use crate::reflection::ShaderReflection;

macro_rules! raw_id {
    ($name:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: $name = $name(0);

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::NULL
            }
        }
    };
}

raw_id!(RawBuffer);
raw_id!(RawTexture);
raw_id!(RawSampler);
raw_id!(RawShader);
raw_id!(RawPipeline);
raw_id!(RawRenderPass);
raw_id!(RawFramebuffer);
raw_id!(RawDescriptorPool);
raw_id!(RawDescriptorSet);
raw_id!(RawSemaphore);
raw_id!(RawCommandPool);
raw_id!(RawCommandBuffer);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Transfer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    TopOfPipe,
    Transfer,
    ColorAttachmentOutput,
    Compute,
}

/// A semaphore wait or signal attached to a submission. `value` is ignored
/// for binary semaphores.
#[derive(Debug, Copy, Clone)]
pub struct SemaphoreOp {
    pub semaphore: RawSemaphore,
    pub value: u64,
    pub stage: PipelineStage,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderRead,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

/// Commands recorded into a command buffer through the driver.
#[derive(Debug, Clone)]
pub enum Command {
    BeginRenderPass {
        render_pass: RawRenderPass,
        framebuffer: RawFramebuffer,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    SetViewport {
        width: u32,
        height: u32,
    },
    BindPipeline {
        pipeline: RawPipeline,
    },
    BindVertexBuffers {
        buffers: Vec<RawBuffer>,
        offsets: Vec<u64>,
    },
    BindIndexBuffer {
        buffer: RawBuffer,
        offset: u64,
    },
    BindDescriptorSets {
        first_index: u32,
        sets: Vec<RawDescriptorSet>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    CopyBufferToBuffer {
        src: RawBuffer,
        dst: RawBuffer,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: RawBuffer,
        dst: RawTexture,
        layer: u32,
        width: u32,
        height: u32,
    },
    CopyTexture {
        src: RawTexture,
        dst: RawTexture,
        width: u32,
        height: u32,
    },
    TransitionTexture {
        texture: RawTexture,
        from: ImageLayout,
        to: ImageLayout,
    },
    /// One step of the mip chain blit loop.
    BlitMip {
        texture: RawTexture,
        src_mip: u32,
        dst_mip: u32,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcquireStatus {
    Success { image_index: u32 },
    Suboptimal { image_index: u32 },
    OutOfDate,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PresentStatus {
    Success,
    Suboptimal,
    OutOfDate,
}

/// Descriptor set allocation failures the pool allocator recovers from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorAllocError {
    OutOfPoolMemory,
    FragmentedPool,
}

/// The GPU driver function table.
///
/// Object lifetimes are the caller's problem: the renderer owns the typed
/// pools and calls `destroy_*` when a handle is released or retired. All
/// methods are safe to call from any thread; command buffers are externally
/// synchronized per pool, which the renderer guarantees by keying pools by
/// thread id.
pub trait Driver: Send + Sync + 'static {
    fn device_id(&self) -> u32;
    fn vendor_id(&self) -> u32;

    // Buffers
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<RawBuffer, HgalError>;
    fn destroy_buffer(&self, raw: RawBuffer);
    /// Write through the persistent mapping. Fails on device-local buffers.
    fn write_buffer(&self, raw: RawBuffer, offset: u64, data: &[u8]) -> Result<(), HgalError>;
    fn read_buffer(&self, raw: RawBuffer, offset: u64, out: &mut [u8]) -> Result<(), HgalError>;

    // Textures
    fn texture_memory_requirements(&self, descriptor: &TextureDescriptor) -> MemoryRequirements;
    /// `alias` binds the new texture onto an existing texture's allocation.
    fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
        alias: Option<RawTexture>,
    ) -> Result<RawTexture, HgalError>;
    fn destroy_texture(&self, raw: RawTexture);
    /// Identity of the device allocation backing the texture; aliased
    /// textures share one.
    fn texture_allocation_id(&self, raw: RawTexture) -> u64;

    // Samplers
    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<RawSampler, HgalError>;
    fn destroy_sampler(&self, raw: RawSampler);

    // Shaders
    fn create_shader(&self, bytecode: &[u8]) -> Result<(RawShader, ShaderReflection), HgalError>;
    fn destroy_shader(&self, raw: RawShader);

    // Pipelines
    fn create_pipeline(
        &self,
        shader: RawShader,
        render_pass: RawRenderPass,
        sample_count: u32,
    ) -> Result<RawPipeline, HgalError>;
    fn destroy_pipeline(&self, raw: RawPipeline);
    fn pipeline_cache_data(&self) -> Vec<u8>;
    fn load_pipeline_cache(&self, data: &[u8]);

    // Render passes / framebuffers
    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> Result<RawRenderPass, HgalError>;
    fn destroy_render_pass(&self, raw: RawRenderPass);
    fn create_framebuffer(
        &self,
        width: u32,
        height: u32,
        attachments: &[RawTexture],
        render_pass: RawRenderPass,
    ) -> Result<RawFramebuffer, HgalError>;
    fn destroy_framebuffer(&self, raw: RawFramebuffer);

    // Descriptors
    fn create_descriptor_pool(&self, set_count: u32) -> Result<RawDescriptorPool, HgalError>;
    fn destroy_descriptor_pool(&self, raw: RawDescriptorPool);
    fn reset_descriptor_pool(&self, raw: RawDescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        shader: RawShader,
        group_index: u32,
    ) -> Result<RawDescriptorSet, DescriptorAllocError>;
    fn update_descriptor_set(&self, set: RawDescriptorSet, writes: &[DescriptorWrite]);

    // Synchronization
    fn create_semaphore(&self, timeline: bool, initial_value: u64) -> Result<RawSemaphore, HgalError>;
    fn destroy_semaphore(&self, raw: RawSemaphore);
    fn semaphore_value(&self, raw: RawSemaphore) -> u64;
    fn signal_semaphore(&self, raw: RawSemaphore, value: u64);
    fn wait_semaphore(
        &self,
        raw: RawSemaphore,
        value: u64,
        timeout: std::time::Duration,
    ) -> Result<(), HgalError>;

    // Commands
    fn create_command_pool(&self, queue: QueueKind) -> Result<RawCommandPool, HgalError>;
    fn destroy_command_pool(&self, raw: RawCommandPool);
    fn allocate_command_buffer(&self, pool: RawCommandPool) -> Result<RawCommandBuffer, HgalError>;
    fn begin_command_buffer(&self, command_buffer: RawCommandBuffer);
    fn end_command_buffer(&self, command_buffer: RawCommandBuffer);
    fn reset_command_buffer(&self, command_buffer: RawCommandBuffer);
    fn record(&self, command_buffer: RawCommandBuffer, command: Command);
    fn submit(
        &self,
        queue: QueueKind,
        command_buffers: &[RawCommandBuffer],
        waits: &[SemaphoreOp],
        signals: &[SemaphoreOp],
    ) -> Result<(), HgalError>;
    fn wait_idle(&self);

    // Swapchain
    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<(), HgalError>;
    fn swapchain_extent(&self) -> (u32, u32);
    fn swapchain_image(&self, image_index: u32) -> RawTexture;
    fn acquire_next_image(&self, signal: RawSemaphore) -> Result<AcquireStatus, HgalError>;
    fn present(&self, wait: RawSemaphore, image_index: u32) -> Result<PresentStatus, HgalError>;
}

/// One descriptor write inside `update_descriptor_set`, already resolved to
/// raw objects.
#[derive(Debug, Clone)]
pub enum DescriptorWrite {
    UniformBuffer {
        binding: u32,
        element: u32,
        buffers: Vec<RawBuffer>,
    },
    StorageBuffer {
        binding: u32,
        element: u32,
        buffers: Vec<RawBuffer>,
    },
    CombinedImageSampler {
        binding: u32,
        element: u32,
        textures: Vec<RawTexture>,
        samplers: Vec<RawSampler>,
    },
}
