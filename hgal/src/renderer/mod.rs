//! The renderer core: typed pooled GPU resources over the driver boundary.
//!
//! One handle pool per resource kind; a narrow create/destroy surface with
//! deferred retirement; bind group allocation from the per-frame descriptor
//! allocators; upload sequencing on the transfer queue (see `upload`); and
//! command recording into the current frame's primary command buffer.

mod materials;
mod retire;
mod upload;

pub use retire::DeferredDestroy;
pub use upload::{AllocationGroup, FinishedAllocationGroup};

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use dashmap::DashMap;
use tracing::{error, trace, warn};

use hearth_containers::{Handle, HandlePool};

use crate::descriptor::{DescriptorPoolAllocator, INITIAL_SET_COUNT_PER_POOL};
use crate::driver::{
    Command, DescriptorWrite, Driver, QueueKind, RawCommandBuffer, RawCommandPool, RawSemaphore,
    RawTexture, SemaphoreOp,
};
use crate::error::HgalError;
use crate::reflection::BindingType;
use crate::types::*;
use crate::MAX_FRAMES_IN_FLIGHT;

use retire::RetireRing;

pub const MAX_BUFFER_COUNT: u32 = 4096;
pub const MAX_TEXTURE_COUNT: u32 = 4096;
pub const MAX_SAMPLER_COUNT: u32 = 256;
pub const MAX_SHADER_COUNT: u32 = 512;
pub const MAX_PIPELINE_STATE_COUNT: u32 = 1024;
pub const MAX_BIND_GROUP_COUNT: u32 = 4096;
pub const MAX_RENDER_PASS_COUNT: u32 = 256;
pub const MAX_FRAME_BUFFER_COUNT: u32 = 512;
pub const MAX_SEMAPHORE_COUNT: u32 = 256;
pub const MAX_UPLOAD_REQUEST_COUNT: u32 = 1024;
pub const MAX_STATIC_MESH_COUNT: u32 = 4096;
pub const MAX_MATERIAL_COUNT: u32 = 2048;

#[derive(Debug, Copy, Clone)]
struct ThreadCommandPools {
    graphics: RawCommandPool,
    transfer: RawCommandPool,
}

pub struct Renderer {
    driver: Arc<dyn Driver>,

    pub buffers: HandlePool<Buffer>,
    pub textures: HandlePool<Texture>,
    pub samplers: HandlePool<Sampler>,
    pub shaders: HandlePool<Shader>,
    pub pipeline_states: HandlePool<PipelineState>,
    pub bind_groups: HandlePool<BindGroup>,
    pub render_passes: HandlePool<RenderPass>,
    pub frame_buffers: HandlePool<FrameBuffer>,
    pub semaphores: HandlePool<Semaphore>,
    pub upload_requests: HandlePool<UploadRequest>,
    pub static_meshes: HandlePool<StaticMesh>,
    pub materials: HandlePool<Material>,

    graphics_timeline: RawSemaphore,
    pub(crate) transfer_timeline: RawSemaphore,
    /// CPU-side frame counter; the frame in flight signals `value + 1`.
    timeline_value: AtomicU64,
    /// Last reserved transfer-queue target value.
    pub(crate) transfer_cursor: AtomicU64,

    /// OS-thread-id -> lazily created graphics/transfer command pools.
    thread_command_pools: DashMap<ThreadId, ThreadCommandPools>,
    frame_command_buffers: Mutex<Vec<Option<RawCommandBuffer>>>,
    active_command_buffer: Mutex<Option<RawCommandBuffer>>,

    /// Serializes queue submissions issued from worker threads.
    render_commands_mutex: Mutex<()>,

    retire_ring: Mutex<RetireRing>,
    pub(crate) allocation_groups: Mutex<Vec<AllocationGroup>>,
    descriptor_allocators: Vec<Mutex<DescriptorPoolAllocator>>,

    current_frame_index: AtomicUsize,
    frames_in_flight: usize,
    viewport: Mutex<(u32, u32)>,
    msaa_sample_count: AtomicU32,
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("timeline_value", &self.timeline_value.load(Ordering::Relaxed))
            .field("current_frame_index", &self.current_frame_index.load(Ordering::Relaxed))
            .finish()
    }
}

impl Renderer {
    pub fn new(driver: Arc<dyn Driver>) -> Result<Self, HgalError> {
        let graphics_timeline = driver.create_semaphore(true, 0)?;
        let transfer_timeline = driver.create_semaphore(true, 0)?;
        let (width, height) = driver.swapchain_extent();

        let mut descriptor_allocators = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            descriptor_allocators.push(Mutex::new(DescriptorPoolAllocator::new(
                driver.clone(),
                INITIAL_SET_COUNT_PER_POOL,
            )?));
        }

        Ok(Self {
            buffers: HandlePool::new(MAX_BUFFER_COUNT),
            textures: HandlePool::new(MAX_TEXTURE_COUNT),
            samplers: HandlePool::new(MAX_SAMPLER_COUNT),
            shaders: HandlePool::new(MAX_SHADER_COUNT),
            pipeline_states: HandlePool::new(MAX_PIPELINE_STATE_COUNT),
            bind_groups: HandlePool::new(MAX_BIND_GROUP_COUNT),
            render_passes: HandlePool::new(MAX_RENDER_PASS_COUNT),
            frame_buffers: HandlePool::new(MAX_FRAME_BUFFER_COUNT),
            semaphores: HandlePool::new(MAX_SEMAPHORE_COUNT),
            upload_requests: HandlePool::new(MAX_UPLOAD_REQUEST_COUNT),
            static_meshes: HandlePool::new(MAX_STATIC_MESH_COUNT),
            materials: HandlePool::new(MAX_MATERIAL_COUNT),
            graphics_timeline,
            transfer_timeline,
            timeline_value: AtomicU64::new(0),
            transfer_cursor: AtomicU64::new(0),
            thread_command_pools: DashMap::new(),
            frame_command_buffers: Mutex::new(vec![None; MAX_FRAMES_IN_FLIGHT]),
            active_command_buffer: Mutex::new(None),
            render_commands_mutex: Mutex::new(()),
            retire_ring: Mutex::new(RetireRing::new(MAX_FRAMES_IN_FLIGHT)),
            allocation_groups: Mutex::new(Vec::new()),
            descriptor_allocators,
            current_frame_index: AtomicUsize::new(0),
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            viewport: Mutex::new((width, height)),
            msaa_sample_count: AtomicU32::new(1),
            driver,
        })
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn current_frame_index(&self) -> usize {
        self.current_frame_index.load(Ordering::Acquire)
    }

    pub fn timeline_value(&self) -> u64 {
        self.timeline_value.load(Ordering::Acquire)
    }

    pub fn observed_timeline_value(&self) -> u64 {
        self.driver.semaphore_value(self.graphics_timeline)
    }

    pub fn viewport_extent(&self) -> (u32, u32) {
        *self.viewport.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn set_viewport_extent(&self, width: u32, height: u32) {
        *self.viewport.lock().unwrap_or_else(|poison| poison.into_inner()) = (width, height);
    }

    pub fn msaa_sample_count(&self) -> u32 {
        self.msaa_sample_count.load(Ordering::Relaxed)
    }

    pub fn set_msaa_sample_count(&self, sample_count: u32) {
        self.msaa_sample_count.store(sample_count, Ordering::Relaxed);
    }

    fn thread_pools(&self) -> Result<ThreadCommandPools, HgalError> {
        let thread_id = std::thread::current().id();
        if let Some(pools) = self.thread_command_pools.get(&thread_id) {
            return Ok(*pools);
        }
        let pools = ThreadCommandPools {
            graphics: self.driver.create_command_pool(QueueKind::Graphics)?,
            transfer: self.driver.create_command_pool(QueueKind::Transfer)?,
        };
        self.thread_command_pools.insert(thread_id, pools);
        Ok(pools)
    }

    pub(crate) fn transfer_command_buffer(&self) -> Result<RawCommandBuffer, HgalError> {
        let pools = self.thread_pools()?;
        self.driver.allocate_command_buffer(pools.transfer)
    }

    pub(crate) fn render_commands_mutex(&self) -> &Mutex<()> {
        &self.render_commands_mutex
    }

    //
    // Frame plumbing
    //

    /// Step 1 of the frame: bound the pipeline to N frames in flight.
    pub fn wait_for_frame_slot(&self) -> Result<(), HgalError> {
        let value = self.timeline_value();
        let lag = (self.frames_in_flight - 1) as u64;
        if value > lag {
            self.driver.wait_semaphore(
                self.graphics_timeline,
                value - lag,
                std::time::Duration::from_secs(2),
            )?;
        }
        Ok(())
    }

    pub fn reset_frame_descriptors(&self, frame_index: usize) -> Result<(), HgalError> {
        self.descriptor_allocators[frame_index]
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .reset_frame()
    }

    pub fn begin_command_recording(&self) -> Result<RawCommandBuffer, HgalError> {
        let frame_index = self.current_frame_index();
        let pools = self.thread_pools()?;
        let mut frame_buffers = self.frame_command_buffers.lock()?;
        let command_buffer = match frame_buffers[frame_index] {
            Some(command_buffer) => {
                self.driver.reset_command_buffer(command_buffer);
                command_buffer
            }
            None => {
                let command_buffer = self.driver.allocate_command_buffer(pools.graphics)?;
                frame_buffers[frame_index] = Some(command_buffer);
                command_buffer
            }
        };
        self.driver.begin_command_buffer(command_buffer);
        *self.active_command_buffer.lock()? = Some(command_buffer);
        Ok(command_buffer)
    }

    pub(crate) fn active_command_buffer(&self) -> Result<RawCommandBuffer, HgalError> {
        let guard = self.active_command_buffer.lock()?;
        (*guard).ok_or(HgalError::NoActiveCommandBuffer)
    }

    /// End recording and submit, signaling the graphics timeline at
    /// `timeline_value + 1`; also seals the retire slot at that value.
    pub fn submit_frame(
        &self,
        command_buffer: RawCommandBuffer,
        waits: &[SemaphoreOp],
        signals: &[SemaphoreOp],
    ) -> Result<u64, HgalError> {
        self.driver.end_command_buffer(command_buffer);
        *self.active_command_buffer.lock()? = None;

        let signal_value = self.timeline_value() + 1;
        let mut all_signals = signals.to_vec();
        all_signals.push(SemaphoreOp {
            semaphore: self.graphics_timeline,
            value: signal_value,
            stage: crate::driver::PipelineStage::ColorAttachmentOutput,
        });

        let mut all_waits = waits.to_vec();
        let lag = (self.frames_in_flight - 1) as u64;
        all_waits.push(SemaphoreOp {
            semaphore: self.graphics_timeline,
            value: self.timeline_value().saturating_sub(lag),
            stage: crate::driver::PipelineStage::TopOfPipe,
        });

        {
            let _guard = self.render_commands_mutex.lock()?;
            self.driver
                .submit(QueueKind::Graphics, &[command_buffer], &all_waits, &all_signals)?;
        }

        let mut ring = self.retire_ring.lock()?;
        ring.seal_current(signal_value);
        ring.advance();
        Ok(signal_value)
    }

    pub fn advance_frame(&self) {
        self.timeline_value.fetch_add(1, Ordering::AcqRel);
        let next = (self.current_frame_index() + 1) % self.frames_in_flight;
        self.current_frame_index.store(next, Ordering::Release);
    }

    pub fn graphics_timeline(&self) -> RawSemaphore {
        self.graphics_timeline
    }

    /// Destroy everything whose retire slot the timeline has passed.
    pub fn drain_retired(&self) -> Result<(), HgalError> {
        let observed = self.observed_timeline_value();
        let drained = self.retire_ring.lock()?.drain_reached(observed);
        for deferred in drained {
            self.process_deferred(deferred);
        }
        Ok(())
    }

    pub fn wait_idle_and_drain(&self) -> Result<(), HgalError> {
        self.driver.wait_idle();
        let drained = self.retire_ring.lock()?.drain_all();
        for deferred in drained {
            self.process_deferred(deferred);
        }
        Ok(())
    }

    pub fn pending_retires(&self) -> usize {
        self.retire_ring
            .lock()
            .map(|ring| ring.pending())
            .unwrap_or(0)
    }

    fn defer(&self, deferred: DeferredDestroy) {
        match self.retire_ring.lock() {
            Ok(mut ring) => ring.push(deferred),
            Err(poison) => poison.into_inner().push(deferred),
        }
    }

    fn process_deferred(&self, deferred: DeferredDestroy) {
        let result = match deferred {
            DeferredDestroy::Buffer(handle) => self.destroy_buffer_now(handle),
            DeferredDestroy::Texture(handle) => self.destroy_texture_now(handle),
            DeferredDestroy::Sampler(handle) => self.destroy_sampler_now(handle),
            DeferredDestroy::Shader(handle) => self.destroy_shader_now(handle),
            DeferredDestroy::PipelineState(handle) => self.destroy_pipeline_state_now(handle),
            DeferredDestroy::RenderPass(handle) => self.destroy_render_pass_now(handle),
            DeferredDestroy::FrameBuffer(handle) => self.destroy_frame_buffer_now(handle),
            DeferredDestroy::BindGroup(handle) => self.destroy_bind_group_now(handle),
            DeferredDestroy::StaticMesh(handle) => self.destroy_static_mesh_now(handle),
            DeferredDestroy::Material(handle) => self.destroy_material_now(handle),
            DeferredDestroy::UploadRequest(handle) => self.destroy_upload_request(handle),
        };
        if let Err(err) = result {
            warn!("deferred destroy skipped a stale handle: {err}");
        }
    }

    //
    // Buffers
    //

    pub fn create_buffer(&self, descriptor: BufferDescriptor) -> Result<BufferHandle, HgalError> {
        let raw = self.driver.create_buffer(&descriptor)?;
        let handle = self
            .buffers
            .acquire(Buffer {
                name: descriptor.name,
                usage: descriptor.usage,
                size: descriptor.size,
                device_local: descriptor.device_local,
                raw,
            })
            .map_err(|_| HgalError::PoolExhausted("buffer"))?;
        Ok(handle)
    }

    pub fn destroy_buffer(&self, handle: BufferHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_buffer_now(handle)
        } else {
            self.defer(DeferredDestroy::Buffer(handle));
            Ok(())
        }
    }

    fn destroy_buffer_now(&self, handle: BufferHandle) -> Result<(), HgalError> {
        let buffer = self.buffers.release(handle)?;
        self.driver.destroy_buffer(buffer.raw);
        Ok(())
    }

    pub fn write_buffer(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), HgalError> {
        let raw = self.buffers.with(&handle, |buffer| buffer.raw)?;
        self.driver.write_buffer(raw, offset, data)
    }

    pub fn read_buffer(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), HgalError> {
        let raw = self.buffers.with(&handle, |buffer| buffer.raw)?;
        self.driver.read_buffer(raw, offset, out)
    }

    //
    // Textures
    //

    pub fn get_texture_memory_requirements(
        &self,
        descriptor: &TextureDescriptor,
    ) -> crate::driver::MemoryRequirements {
        self.driver.texture_memory_requirements(descriptor)
    }

    pub fn create_texture(&self, descriptor: TextureDescriptor) -> Result<TextureHandle, HgalError> {
        let texture = self.build_texture(&descriptor)?;
        let handle = self
            .textures
            .acquire(texture)
            .map_err(|_| HgalError::PoolExhausted("texture"))?;
        if !descriptor.data.is_empty() {
            let upload = self.stage_texture_upload(handle, &descriptor)?;
            self.textures
                .with_mut(&handle, |texture| texture.upload_request = upload)?;
        }
        Ok(handle)
    }

    /// Recreate the device texture behind an existing handle (render graph
    /// invalidation). Outstanding handles stay valid.
    pub fn create_texture_into(
        &self,
        handle: TextureHandle,
        descriptor: TextureDescriptor,
    ) -> Result<(), HgalError> {
        let texture = self.build_texture(&descriptor)?;
        let previous = self.textures.replace(&handle, texture)?;
        self.driver.destroy_texture(previous.raw);
        Ok(())
    }

    fn build_texture(&self, descriptor: &TextureDescriptor) -> Result<Texture, HgalError> {
        let alias_raw = if descriptor.alias.is_invalid() {
            None
        } else {
            Some(self.textures.with(&descriptor.alias, |texture| texture.raw)?)
        };
        let requirements = self.driver.texture_memory_requirements(descriptor);
        let raw = self.driver.create_texture(descriptor, alias_raw)?;
        let mip_levels = if descriptor.mipmapping {
            32 - descriptor.width.max(descriptor.height).max(1).leading_zeros()
        } else {
            1
        };
        Ok(Texture {
            name: descriptor.name.clone(),
            width: descriptor.width,
            height: descriptor.height,
            format: descriptor.format,
            sample_count: descriptor.sample_count,
            layer_count: descriptor.layer_count.max(1),
            mip_levels,
            is_attachment: descriptor.is_attachment,
            is_cubemap: descriptor.is_cubemap,
            size: requirements.size,
            alignment: requirements.alignment,
            raw,
            upload_request: Handle::INVALID,
        })
    }

    pub fn destroy_texture(&self, handle: TextureHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_texture_now(handle)
        } else {
            self.defer(DeferredDestroy::Texture(handle));
            Ok(())
        }
    }

    fn destroy_texture_now(&self, handle: TextureHandle) -> Result<(), HgalError> {
        let texture = self.textures.release(handle)?;
        if !texture.upload_request.is_invalid() {
            // upload request may already have been retired with its group
            let _ = self.destroy_upload_request(texture.upload_request);
        }
        self.driver.destroy_texture(texture.raw);
        Ok(())
    }

    pub fn texture_allocation_id(&self, handle: TextureHandle) -> Result<u64, HgalError> {
        let raw = self.textures.with(&handle, |texture| texture.raw)?;
        Ok(self.driver.texture_allocation_id(raw))
    }

    //
    // Semaphores
    //

    pub fn create_semaphore(
        &self,
        timeline: bool,
        initial_value: u64,
    ) -> Result<SemaphoreHandle, HgalError> {
        let raw = self.driver.create_semaphore(timeline, initial_value)?;
        self.semaphores
            .acquire(Semaphore { raw, timeline })
            .map_err(|_| HgalError::PoolExhausted("semaphore"))
    }

    pub fn destroy_semaphore(&self, handle: SemaphoreHandle) -> Result<(), HgalError> {
        let semaphore = self.semaphores.release(handle)?;
        self.driver.destroy_semaphore(semaphore.raw);
        Ok(())
    }

    pub fn semaphore_raw(&self, handle: &SemaphoreHandle) -> Result<RawSemaphore, HgalError> {
        Ok(self.semaphores.with(handle, |semaphore| semaphore.raw)?)
    }

    pub fn semaphore_value(&self, handle: &SemaphoreHandle) -> Result<u64, HgalError> {
        let raw = self.semaphore_raw(handle)?;
        Ok(self.driver.semaphore_value(raw))
    }

    //
    // Samplers
    //

    pub fn create_sampler(&self, descriptor: SamplerDescriptor) -> Result<SamplerHandle, HgalError> {
        let raw = self.driver.create_sampler(&descriptor)?;
        self.samplers
            .acquire(Sampler { descriptor, raw })
            .map_err(|_| HgalError::PoolExhausted("sampler"))
    }

    pub fn destroy_sampler(&self, handle: SamplerHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_sampler_now(handle)
        } else {
            self.defer(DeferredDestroy::Sampler(handle));
            Ok(())
        }
    }

    fn destroy_sampler_now(&self, handle: SamplerHandle) -> Result<(), HgalError> {
        let sampler = self.samplers.release(handle)?;
        self.driver.destroy_sampler(sampler.raw);
        Ok(())
    }

    //
    // Shaders
    //

    pub fn create_shader(&self, descriptor: ShaderDescriptor) -> Result<ShaderHandle, HgalError> {
        let (raw, reflection) = self.driver.create_shader(&descriptor.bytecode)?;
        trace!(name = %descriptor.name, sets = reflection.sets.len(), "created shader");
        self.shaders
            .acquire(Shader {
                name: descriptor.name,
                reflection,
                raw,
            })
            .map_err(|_| HgalError::PoolExhausted("shader"))
    }

    pub fn destroy_shader(&self, handle: ShaderHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_shader_now(handle)
        } else {
            self.defer(DeferredDestroy::Shader(handle));
            Ok(())
        }
    }

    fn destroy_shader_now(&self, handle: ShaderHandle) -> Result<(), HgalError> {
        let shader = self.shaders.release(handle)?;
        self.driver.destroy_shader(shader.raw);
        Ok(())
    }

    //
    // Pipeline states
    //

    pub fn create_pipeline_state(
        &self,
        descriptor: PipelineStateDescriptor,
    ) -> Result<PipelineStateHandle, HgalError> {
        let raw = self.build_pipeline(&descriptor)?;
        self.pipeline_states
            .acquire(PipelineState { descriptor, raw })
            .map_err(|_| HgalError::PoolExhausted("pipeline state"))
    }

    /// Rebuild the pipeline behind an existing handle (sample count change).
    pub fn create_pipeline_state_into(
        &self,
        handle: PipelineStateHandle,
        descriptor: PipelineStateDescriptor,
    ) -> Result<(), HgalError> {
        let raw = self.build_pipeline(&descriptor)?;
        let previous = self.pipeline_states.replace(&handle, PipelineState { descriptor, raw })?;
        self.driver.destroy_pipeline(previous.raw);
        Ok(())
    }

    fn build_pipeline(
        &self,
        descriptor: &PipelineStateDescriptor,
    ) -> Result<crate::driver::RawPipeline, HgalError> {
        let shader_raw = self.shaders.with(&descriptor.shader, |shader| shader.raw)?;
        let pass_raw = self
            .render_passes
            .with(&descriptor.render_pass, |render_pass| render_pass.raw)?;
        self.driver
            .create_pipeline(shader_raw, pass_raw, descriptor.sample_count)
    }

    pub fn destroy_pipeline_state(
        &self,
        handle: PipelineStateHandle,
        immediate: bool,
    ) -> Result<(), HgalError> {
        if immediate {
            self.destroy_pipeline_state_now(handle)
        } else {
            self.defer(DeferredDestroy::PipelineState(handle));
            Ok(())
        }
    }

    fn destroy_pipeline_state_now(&self, handle: PipelineStateHandle) -> Result<(), HgalError> {
        let pipeline = self.pipeline_states.release(handle)?;
        self.driver.destroy_pipeline(pipeline.raw);
        Ok(())
    }

    //
    // Render passes & frame buffers
    //

    pub fn create_render_pass(
        &self,
        descriptor: RenderPassDescriptor,
    ) -> Result<RenderPassHandle, HgalError> {
        let raw = self.driver.create_render_pass(&descriptor)?;
        self.render_passes
            .acquire(RenderPass {
                name: descriptor.name.clone(),
                descriptor,
                raw,
            })
            .map_err(|_| HgalError::PoolExhausted("render pass"))
    }

    pub fn create_render_pass_into(
        &self,
        handle: RenderPassHandle,
        descriptor: RenderPassDescriptor,
    ) -> Result<(), HgalError> {
        let raw = self.driver.create_render_pass(&descriptor)?;
        let previous = self.render_passes.replace(
            &handle,
            RenderPass {
                name: descriptor.name.clone(),
                descriptor,
                raw,
            },
        )?;
        self.driver.destroy_render_pass(previous.raw);
        Ok(())
    }

    pub fn destroy_render_pass(&self, handle: RenderPassHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_render_pass_now(handle)
        } else {
            self.defer(DeferredDestroy::RenderPass(handle));
            Ok(())
        }
    }

    fn destroy_render_pass_now(&self, handle: RenderPassHandle) -> Result<(), HgalError> {
        let render_pass = self.render_passes.release(handle)?;
        self.driver.destroy_render_pass(render_pass.raw);
        Ok(())
    }

    pub fn create_frame_buffer(
        &self,
        descriptor: FrameBufferDescriptor,
    ) -> Result<FrameBufferHandle, HgalError> {
        let frame_buffer = self.build_frame_buffer(&descriptor)?;
        self.frame_buffers
            .acquire(frame_buffer)
            .map_err(|_| HgalError::PoolExhausted("frame buffer"))
    }

    pub fn create_frame_buffer_into(
        &self,
        handle: FrameBufferHandle,
        descriptor: FrameBufferDescriptor,
    ) -> Result<(), HgalError> {
        let frame_buffer = self.build_frame_buffer(&descriptor)?;
        let previous = self.frame_buffers.replace(&handle, frame_buffer)?;
        self.driver.destroy_framebuffer(previous.raw);
        Ok(())
    }

    fn build_frame_buffer(&self, descriptor: &FrameBufferDescriptor) -> Result<FrameBuffer, HgalError> {
        let mut raw_attachments = Vec::with_capacity(descriptor.attachments.len());
        for attachment in &descriptor.attachments {
            raw_attachments.push(self.textures.with(attachment, |texture| texture.raw)?);
        }
        let pass_raw = self
            .render_passes
            .with(&descriptor.render_pass, |render_pass| render_pass.raw)?;
        let raw = self.driver.create_framebuffer(
            descriptor.width,
            descriptor.height,
            &raw_attachments,
            pass_raw,
        )?;
        Ok(FrameBuffer {
            width: descriptor.width,
            height: descriptor.height,
            attachments: descriptor.attachments.clone(),
            render_pass: descriptor.render_pass,
            raw,
        })
    }

    pub fn destroy_frame_buffer(&self, handle: FrameBufferHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_frame_buffer_now(handle)
        } else {
            self.defer(DeferredDestroy::FrameBuffer(handle));
            Ok(())
        }
    }

    fn destroy_frame_buffer_now(&self, handle: FrameBufferHandle) -> Result<(), HgalError> {
        let frame_buffer = self.frame_buffers.release(handle)?;
        self.driver.destroy_framebuffer(frame_buffer.raw);
        Ok(())
    }

    //
    // Bind groups
    //

    pub fn create_bind_group(&self, descriptor: BindGroupDescriptor) -> Result<BindGroupHandle, HgalError> {
        let has_layout = self.shaders.with(&descriptor.shader, |shader| {
            shader.reflection.set_layout(descriptor.group_index).is_some()
        })?;
        if !has_layout {
            return Err(HgalError::NoBindGroupLayout(descriptor.group_index));
        }
        self.bind_groups
            .acquire(BindGroup {
                shader: descriptor.shader,
                group_index: descriptor.group_index,
                raw: None,
            })
            .map_err(|_| HgalError::PoolExhausted("bind group"))
    }

    pub fn destroy_bind_group(&self, handle: BindGroupHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_bind_group_now(handle)
        } else {
            self.defer(DeferredDestroy::BindGroup(handle));
            Ok(())
        }
    }

    fn destroy_bind_group_now(&self, handle: BindGroupHandle) -> Result<(), HgalError> {
        // descriptor sets die with their frame pool; only the slot is freed
        self.bind_groups.release(handle)?;
        Ok(())
    }

    /// Allocate a fresh descriptor set for the bind group from the current
    /// frame's allocator and write `updates` into it.
    pub fn update_bind_group(
        &self,
        handle: BindGroupHandle,
        updates: &[UpdateBindingDescriptor],
    ) -> Result<(), HgalError> {
        let (shader_handle, group_index) = self
            .bind_groups
            .with(&handle, |bind_group| (bind_group.shader, bind_group.group_index))?;
        let (shader_raw, bindings) = self.shaders.with(&shader_handle, |shader| {
            (
                shader.raw,
                shader
                    .reflection
                    .set_layout(group_index)
                    .map(|layout| layout.bindings.clone()),
            )
        })?;
        let bindings = bindings.ok_or(HgalError::NoBindGroupLayout(group_index))?;

        let frame_index = self.current_frame_index();
        let set = self.descriptor_allocators[frame_index]
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .allocate(shader_raw, group_index)?;

        let mut writes = Vec::with_capacity(updates.len());
        for update in updates {
            let binding_type = bindings
                .iter()
                .find(|binding| binding.number == update.binding_number)
                .map(|binding| binding.binding_type);
            let write = match binding_type {
                Some(BindingType::UniformBuffer) | Some(BindingType::StorageBuffer) => {
                    let mut raws = Vec::with_capacity(update.buffers.len());
                    for buffer in &update.buffers {
                        raws.push(self.buffers.with(buffer, |buffer| buffer.raw)?);
                    }
                    if binding_type == Some(BindingType::UniformBuffer) {
                        DescriptorWrite::UniformBuffer {
                            binding: update.binding_number,
                            element: update.element_index,
                            buffers: raws,
                        }
                    } else {
                        DescriptorWrite::StorageBuffer {
                            binding: update.binding_number,
                            element: update.element_index,
                            buffers: raws,
                        }
                    }
                }
                Some(BindingType::CombinedImageSampler) => {
                    let mut texture_raws = Vec::with_capacity(update.textures.len());
                    for texture in &update.textures {
                        texture_raws.push(self.textures.with(texture, |texture| texture.raw)?);
                    }
                    let mut sampler_raws = Vec::with_capacity(update.samplers.len());
                    for sampler in &update.samplers {
                        sampler_raws.push(self.samplers.with(sampler, |sampler| sampler.raw)?);
                    }
                    DescriptorWrite::CombinedImageSampler {
                        binding: update.binding_number,
                        element: update.element_index,
                        textures: texture_raws,
                        samplers: sampler_raws,
                    }
                }
                None => {
                    warn!(
                        binding = update.binding_number,
                        "update_bind_group: binding not present in shader layout"
                    );
                    continue;
                }
            };
            writes.push(write);
        }
        self.driver.update_descriptor_set(set, &writes);
        self.bind_groups
            .with_mut(&handle, |bind_group| bind_group.raw = Some(set))?;
        Ok(())
    }

    /// Record a bind of `groups` starting at set `first_index` into the
    /// current command buffer. All groups must belong to one shader.
    pub fn set_bind_groups(
        &self,
        first_index: u32,
        groups: &[BindGroupHandle],
    ) -> Result<(), HgalError> {
        let mut shader: Option<ShaderHandle> = None;
        let mut sets = Vec::with_capacity(groups.len());
        for group in groups {
            let (group_shader, raw) = self
                .bind_groups
                .with(group, |bind_group| (bind_group.shader, bind_group.raw))?;
            match shader {
                None => shader = Some(group_shader),
                Some(existing) if existing == group_shader => {}
                Some(_) => return Err(HgalError::MismatchedBindGroups),
            }
            sets.push(raw.ok_or_else(|| {
                HgalError::Driver("bind group was never updated this frame".into())
            })?);
        }
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::BindDescriptorSets {
                first_index,
                sets,
            },
        );
        Ok(())
    }

    //
    // Command recording
    //

    pub fn set_viewport(&self, width: u32, height: u32) -> Result<(), HgalError> {
        let command_buffer = self.active_command_buffer()?;
        self.driver
            .record(command_buffer, Command::SetViewport { width, height });
        Ok(())
    }

    pub fn begin_render_pass(
        &self,
        render_pass: RenderPassHandle,
        frame_buffer: FrameBufferHandle,
        clear_values: Vec<ClearValue>,
    ) -> Result<(), HgalError> {
        let pass_raw = self.render_passes.with(&render_pass, |pass| pass.raw)?;
        let frame_buffer_raw = self.frame_buffers.with(&frame_buffer, |fb| fb.raw)?;
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::BeginRenderPass {
                render_pass: pass_raw,
                framebuffer: frame_buffer_raw,
                clear_values,
            },
        );
        Ok(())
    }

    pub fn end_render_pass(&self) -> Result<(), HgalError> {
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(command_buffer, Command::EndRenderPass);
        Ok(())
    }

    pub fn set_pipeline_state(&self, handle: PipelineStateHandle) -> Result<(), HgalError> {
        let raw = self.pipeline_states.with(&handle, |pipeline| pipeline.raw)?;
        let command_buffer = self.active_command_buffer()?;
        self.driver
            .record(command_buffer, Command::BindPipeline { pipeline: raw });
        Ok(())
    }

    pub fn set_vertex_buffers(
        &self,
        handles: &[BufferHandle],
        offsets: &[u64],
    ) -> Result<(), HgalError> {
        debug_assert_eq!(handles.len(), offsets.len());
        let mut raws = Vec::with_capacity(handles.len());
        for handle in handles {
            raws.push(self.buffers.with(handle, |buffer| buffer.raw)?);
        }
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::BindVertexBuffers {
                buffers: raws,
                offsets: offsets.to_vec(),
            },
        );
        Ok(())
    }

    pub fn set_index_buffer(&self, handle: BufferHandle, offset: u64) -> Result<(), HgalError> {
        let raw = self.buffers.with(&handle, |buffer| buffer.raw)?;
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::BindIndexBuffer {
                buffer: raw,
                offset,
            },
        );
        Ok(())
    }

    pub fn draw(&self, vertex_count: u32, instance_count: u32) -> Result<(), HgalError> {
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex: 0,
                first_instance: 0,
            },
        );
        Ok(())
    }

    pub fn draw_indexed(&self, index_count: u32, instance_count: u32) -> Result<(), HgalError> {
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index: 0,
                vertex_offset: 0,
                first_instance: 0,
            },
        );
        Ok(())
    }

    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> Result<(), HgalError> {
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::Dispatch {
                group_count_x: x,
                group_count_y: y,
                group_count_z: z,
            },
        );
        Ok(())
    }

    pub fn copy_texture_to_swapchain(
        &self,
        source: TextureHandle,
        swapchain_image: RawTexture,
        width: u32,
        height: u32,
    ) -> Result<(), HgalError> {
        use crate::driver::ImageLayout;
        let source_raw = self.textures.with(&source, |texture| texture.raw)?;
        let command_buffer = self.active_command_buffer()?;
        self.driver.record(
            command_buffer,
            Command::TransitionTexture {
                texture: swapchain_image,
                from: ImageLayout::Undefined,
                to: ImageLayout::TransferDst,
            },
        );
        self.driver.record(
            command_buffer,
            Command::TransitionTexture {
                texture: source_raw,
                from: ImageLayout::ColorAttachment,
                to: ImageLayout::TransferSrc,
            },
        );
        self.driver.record(
            command_buffer,
            Command::CopyTexture {
                src: source_raw,
                dst: swapchain_image,
                width,
                height,
            },
        );
        self.driver.record(
            command_buffer,
            Command::TransitionTexture {
                texture: swapchain_image,
                from: ImageLayout::TransferDst,
                to: ImageLayout::PresentSrc,
            },
        );
        Ok(())
    }

    //
    // Pipeline cache persistence
    //

    pub fn save_pipeline_cache(&self, root: &Path) -> Result<(), HgalError> {
        let path = root.join(crate::PIPELINE_CACHE_FILE_PATH);
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!("failed to create pipeline cache directory: {err}");
                return Ok(());
            }
        }
        let mut blob = Vec::new();
        blob.extend_from_slice(&self.driver.device_id().to_le_bytes());
        blob.extend_from_slice(&self.driver.vendor_id().to_le_bytes());
        blob.extend_from_slice(&self.driver.pipeline_cache_data());
        if let Err(err) = std::fs::write(&path, blob) {
            error!("failed to write pipeline cache: {err}");
        }
        Ok(())
    }

    pub fn load_pipeline_cache(&self, root: &Path) {
        let path = root.join(crate::PIPELINE_CACHE_FILE_PATH);
        let Ok(blob) = std::fs::read(&path) else {
            return;
        };
        if blob.len() < 8 {
            return;
        }
        let device_id = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]);
        let vendor_id = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        if device_id != self.driver.device_id() || vendor_id != self.driver.vendor_id() {
            trace!("pipeline cache belongs to another device, ignoring");
            return;
        }
        self.driver.load_pipeline_cache(&blob[8..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NullDriver;

    fn renderer() -> Renderer {
        Renderer::new(Arc::new(NullDriver::default())).unwrap()
    }

    #[test]
    fn buffer_round_trip() {
        let renderer = renderer();
        let handle = renderer
            .create_buffer(BufferDescriptor {
                name: "staging".into(),
                size: 64,
                usage: BufferUsage::TRANSFER,
                device_local: false,
            })
            .unwrap();
        renderer.write_buffer(handle, 0, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        renderer.read_buffer(handle, 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        renderer.destroy_buffer(handle, true).unwrap();
        assert!(!renderer.buffers.is_valid(&handle));
    }

    #[test]
    fn device_local_buffer_rejects_writes() {
        let renderer = renderer();
        let handle = renderer
            .create_buffer(BufferDescriptor {
                name: "gpu only".into(),
                size: 64,
                usage: BufferUsage::STORAGE,
                device_local: true,
            })
            .unwrap();
        assert_eq!(
            renderer.write_buffer(handle, 0, &[0]),
            Err(HgalError::NoMappedPointer)
        );
    }

    #[test]
    fn deferred_destroy_waits_for_timeline() {
        let renderer = renderer();
        let handle = renderer
            .create_buffer(BufferDescriptor {
                name: String::new(),
                size: 4,
                usage: BufferUsage::UNIFORM,
                device_local: false,
            })
            .unwrap();
        renderer.destroy_buffer(handle, false).unwrap();
        assert_eq!(renderer.pending_retires(), 1);
        // handle is still valid until the frame retires
        assert!(renderer.buffers.is_valid(&handle));

        let command_buffer = renderer.begin_command_recording().unwrap();
        renderer.submit_frame(command_buffer, &[], &[]).unwrap();
        renderer.advance_frame();
        renderer.drain_retired().unwrap();
        assert_eq!(renderer.pending_retires(), 0);
        assert!(!renderer.buffers.is_valid(&handle));
    }

    #[test]
    fn texture_into_keeps_handle() {
        let renderer = renderer();
        let handle = renderer
            .create_texture(TextureDescriptor {
                name: "attachment".into(),
                width: 128,
                height: 128,
                is_attachment: true,
                ..Default::default()
            })
            .unwrap();
        let raw_before = renderer.textures.with(&handle, |texture| texture.raw).unwrap();
        renderer
            .create_texture_into(
                handle,
                TextureDescriptor {
                    name: "attachment".into(),
                    width: 256,
                    height: 256,
                    is_attachment: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(renderer.textures.is_valid(&handle));
        let (raw_after, width) = renderer
            .textures
            .with(&handle, |texture| (texture.raw, texture.width))
            .unwrap();
        assert_ne!(raw_before, raw_after);
        assert_eq!(width, 256);
    }

    #[test]
    fn pipeline_cache_round_trips_on_matching_device() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer();
        renderer.save_pipeline_cache(dir.path()).unwrap();
        assert!(dir.path().join(crate::PIPELINE_CACHE_FILE_PATH).is_file());
        // same device/vendor id: the blob is accepted
        renderer.load_pipeline_cache(dir.path());

        // a blob from another device is ignored without error
        let foreign = dir.path().join(crate::PIPELINE_CACHE_FILE_PATH);
        std::fs::write(&foreign, [0xffu8; 16]).unwrap();
        renderer.load_pipeline_cache(dir.path());
    }

    #[test]
    fn bind_group_requires_layout() {
        let renderer = renderer();
        let reflection = crate::reflection::ShaderReflection {
            sets: vec![Some(Default::default()), None],
            ..Default::default()
        };
        let shader = renderer
            .create_shader(ShaderDescriptor {
                name: "test".into(),
                bytecode: crate::driver::null::encode_shader_bytecode(&reflection),
            })
            .unwrap();
        assert!(renderer
            .create_bind_group(BindGroupDescriptor {
                name: String::new(),
                shader,
                group_index: 0,
            })
            .is_ok());
        assert_eq!(
            renderer
                .create_bind_group(BindGroupDescriptor {
                    name: String::new(),
                    shader,
                    group_index: 1,
                })
                .unwrap_err(),
            HgalError::NoBindGroupLayout(1)
        );
    }
}
