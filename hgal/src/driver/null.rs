//! Headless driver.
//!
//! Models the device-side state the renderer and the tests care about:
//! object identity, texture allocations and aliasing, descriptor pool
//! budgets, timeline semaphore values, swapchain acquire/present and a
//! retained command stream. Submissions complete instantly; signal operations
//! take effect at submit time, which preserves every ordering the renderer
//! relies on without a real GPU.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::HgalError;
use crate::reflection::{
    BindGroupLayoutDescriptor, Binding, BindingType, ShaderDataType, ShaderReflection, ShaderStruct,
    ShaderStructMember, VertexAttribute, VertexBinding,
};
use crate::types::{BufferDescriptor, RenderPassDescriptor, SamplerDescriptor, TextureDescriptor};

use super::{
    AcquireStatus, Command, DescriptorAllocError, DescriptorWrite, Driver, MemoryRequirements,
    PresentStatus, QueueKind, RawBuffer, RawCommandBuffer, RawCommandPool, RawDescriptorPool,
    RawDescriptorSet, RawFramebuffer, RawPipeline, RawRenderPass, RawSampler, RawSemaphore,
    RawShader, RawTexture, SemaphoreOp,
};

const TEXTURE_ALLOCATION_ALIGNMENT: u64 = 256;
const SWAPCHAIN_IMAGE_COUNT: u32 = 3;

#[derive(Debug)]
struct NullBuffer {
    size: u64,
    device_local: bool,
    storage: Vec<u8>,
}

#[derive(Debug)]
struct NullTexture {
    width: u32,
    height: u32,
    layer_count: u32,
    allocation_id: u64,
    layers: HashMap<u32, Vec<u8>>,
}

#[derive(Debug)]
struct NullDescriptorPool {
    capacity: u32,
    allocated: u32,
}

#[derive(Debug)]
struct NullSemaphore {
    timeline: bool,
    value: u64,
}

#[derive(Debug, Default)]
struct NullCommandBuffer {
    recording: bool,
    commands: Vec<Command>,
}

#[derive(Debug, Default)]
struct NullState {
    buffers: HashMap<u64, NullBuffer>,
    textures: HashMap<u64, NullTexture>,
    samplers: HashMap<u64, SamplerDescriptor>,
    shaders: HashMap<u64, ShaderReflection>,
    pipelines: HashMap<u64, (u64, u64, u32)>,
    render_passes: HashMap<u64, RenderPassDescriptor>,
    framebuffers: HashMap<u64, Vec<u64>>,
    descriptor_pools: HashMap<u64, NullDescriptorPool>,
    descriptor_sets: HashMap<u64, Vec<DescriptorWrite>>,
    semaphores: HashMap<u64, NullSemaphore>,
    command_pools: HashMap<u64, QueueKind>,
    command_buffers: HashMap<u64, NullCommandBuffer>,
    executed: Vec<Command>,
    submit_count_per_queue: HashMap<QueueKind, u64>,
    swapchain_extent: (u32, u32),
    swapchain_images: Vec<u64>,
    next_swapchain_image: u32,
    forced_acquire: VecDeque<AcquireStatus>,
    forced_present: VecDeque<PresentStatus>,
    device_lost: bool,
    pipeline_cache: Vec<u8>,
}

pub struct NullDriver {
    next_id: AtomicU64,
    state: Mutex<NullState>,
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl NullDriver {
    pub fn new(width: u32, height: u32) -> Self {
        let driver = Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(NullState {
                swapchain_extent: (width, height),
                ..Default::default()
            }),
        };
        {
            let mut state = driver.lock();
            for _ in 0..SWAPCHAIN_IMAGE_COUNT {
                let id = driver.allocate_id();
                state.textures.insert(
                    id,
                    NullTexture {
                        width,
                        height,
                        layer_count: 1,
                        allocation_id: id,
                        layers: HashMap::new(),
                    },
                );
                state.swapchain_images.push(id);
            }
        }
        driver
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NullState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Commands executed by completed submissions, in submission order.
    pub fn drain_executed_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.lock().executed)
    }

    pub fn submit_count(&self, queue: QueueKind) -> u64 {
        *self.lock().submit_count_per_queue.get(&queue).unwrap_or(&0)
    }

    /// Queue a forced result for the next `acquire_next_image`.
    pub fn force_acquire_status(&self, status: AcquireStatus) {
        self.lock().forced_acquire.push_back(status);
    }

    /// Queue a forced result for the next `present`.
    pub fn force_present_status(&self, status: PresentStatus) {
        self.lock().forced_present.push_back(status);
    }

    pub fn set_device_lost(&self, lost: bool) {
        self.lock().device_lost = lost;
    }

    pub fn texture_layer_data(&self, raw: RawTexture, layer: u32) -> Option<Vec<u8>> {
        self.lock()
            .textures
            .get(&raw.0)
            .and_then(|texture| texture.layers.get(&layer).cloned())
    }

    fn texture_footprint(descriptor: &TextureDescriptor) -> u64 {
        let mut size = descriptor.width as u64
            * descriptor.height as u64
            * descriptor.format.texel_size()
            * descriptor.sample_count as u64
            * descriptor.layer_count.max(1) as u64;
        if descriptor.mipmapping {
            // full mip chain is at most 1/3 extra
            size += size / 3;
        }
        size.next_multiple_of(TEXTURE_ALLOCATION_ALIGNMENT)
    }

    fn execute(state: &mut NullState, command: Command) {
        if let Command::CopyBufferToTexture {
            src,
            dst,
            layer,
            width: _,
            height: _,
        } = &command
        {
            if let Some(data) = state.buffers.get(&src.0).map(|buffer| buffer.storage.clone()) {
                if let Some(texture) = state.textures.get_mut(&dst.0) {
                    texture.layers.insert(*layer, data);
                }
            }
        }
        if let Command::CopyBufferToBuffer {
            src,
            dst,
            src_offset,
            dst_offset,
            size,
        } = &command
        {
            let chunk = state.buffers.get(&src.0).map(|buffer| {
                let start = *src_offset as usize;
                let end = (start + *size as usize).min(buffer.storage.len());
                buffer.storage[start.min(end)..end].to_vec()
            });
            if let (Some(chunk), Some(dst)) = (chunk, state.buffers.get_mut(&dst.0)) {
                let start = *dst_offset as usize;
                let end = (start + chunk.len()).min(dst.storage.len());
                dst.storage[start..end].copy_from_slice(&chunk[..end - start]);
            }
        }
        state.executed.push(command);
    }
}

impl Driver for NullDriver {
    fn device_id(&self) -> u32 {
        0x0
    }

    fn vendor_id(&self) -> u32 {
        0x1ea7
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<RawBuffer, HgalError> {
        let id = self.allocate_id();
        self.lock().buffers.insert(
            id,
            NullBuffer {
                size: descriptor.size,
                device_local: descriptor.device_local,
                storage: vec![0; descriptor.size as usize],
            },
        );
        Ok(RawBuffer(id))
    }

    fn destroy_buffer(&self, raw: RawBuffer) {
        self.lock().buffers.remove(&raw.0);
    }

    fn write_buffer(&self, raw: RawBuffer, offset: u64, data: &[u8]) -> Result<(), HgalError> {
        let mut state = self.lock();
        let buffer = state
            .buffers
            .get_mut(&raw.0)
            .ok_or(HgalError::InvalidHandle("buffer"))?;
        if buffer.device_local {
            return Err(HgalError::NoMappedPointer);
        }
        if offset + data.len() as u64 > buffer.size {
            return Err(HgalError::BufferOutOfBounds {
                offset,
                size: data.len() as u64,
                buffer_size: buffer.size,
            });
        }
        buffer.storage[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, raw: RawBuffer, offset: u64, out: &mut [u8]) -> Result<(), HgalError> {
        let state = self.lock();
        let buffer = state
            .buffers
            .get(&raw.0)
            .ok_or(HgalError::InvalidHandle("buffer"))?;
        if offset + out.len() as u64 > buffer.size {
            return Err(HgalError::BufferOutOfBounds {
                offset,
                size: out.len() as u64,
                buffer_size: buffer.size,
            });
        }
        out.copy_from_slice(&buffer.storage[offset as usize..offset as usize + out.len()]);
        Ok(())
    }

    fn texture_memory_requirements(&self, descriptor: &TextureDescriptor) -> MemoryRequirements {
        MemoryRequirements {
            size: Self::texture_footprint(descriptor),
            alignment: TEXTURE_ALLOCATION_ALIGNMENT,
        }
    }

    fn create_texture(
        &self,
        descriptor: &TextureDescriptor,
        alias: Option<RawTexture>,
    ) -> Result<RawTexture, HgalError> {
        let id = self.allocate_id();
        let mut state = self.lock();
        let allocation_id = match alias {
            Some(alias) => {
                state
                    .textures
                    .get(&alias.0)
                    .ok_or(HgalError::InvalidHandle("alias texture"))?
                    .allocation_id
            }
            None => id,
        };
        state.textures.insert(
            id,
            NullTexture {
                width: descriptor.width,
                height: descriptor.height,
                layer_count: descriptor.layer_count.max(1),
                allocation_id,
                layers: HashMap::new(),
            },
        );
        Ok(RawTexture(id))
    }

    fn destroy_texture(&self, raw: RawTexture) {
        self.lock().textures.remove(&raw.0);
    }

    fn texture_allocation_id(&self, raw: RawTexture) -> u64 {
        self.lock()
            .textures
            .get(&raw.0)
            .map(|texture| texture.allocation_id)
            .unwrap_or(0)
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<RawSampler, HgalError> {
        let id = self.allocate_id();
        self.lock().samplers.insert(id, descriptor.clone());
        Ok(RawSampler(id))
    }

    fn destroy_sampler(&self, raw: RawSampler) {
        self.lock().samplers.remove(&raw.0);
    }

    fn create_shader(&self, bytecode: &[u8]) -> Result<(RawShader, ShaderReflection), HgalError> {
        let reflection = decode_shader_bytecode(bytecode)?;
        let id = self.allocate_id();
        self.lock().shaders.insert(id, reflection.clone());
        Ok((RawShader(id), reflection))
    }

    fn destroy_shader(&self, raw: RawShader) {
        self.lock().shaders.remove(&raw.0);
    }

    fn create_pipeline(
        &self,
        shader: RawShader,
        render_pass: RawRenderPass,
        sample_count: u32,
    ) -> Result<RawPipeline, HgalError> {
        let id = self.allocate_id();
        self.lock()
            .pipelines
            .insert(id, (shader.0, render_pass.0, sample_count));
        Ok(RawPipeline(id))
    }

    fn destroy_pipeline(&self, raw: RawPipeline) {
        self.lock().pipelines.remove(&raw.0);
    }

    fn pipeline_cache_data(&self) -> Vec<u8> {
        let state = self.lock();
        if state.pipeline_cache.is_empty() {
            // deterministic marker blob so persistence round-trips
            b"hgal-null-pipeline-cache".to_vec()
        } else {
            state.pipeline_cache.clone()
        }
    }

    fn load_pipeline_cache(&self, data: &[u8]) {
        self.lock().pipeline_cache = data.to_vec();
    }

    fn create_render_pass(&self, descriptor: &RenderPassDescriptor) -> Result<RawRenderPass, HgalError> {
        let id = self.allocate_id();
        self.lock().render_passes.insert(id, descriptor.clone());
        Ok(RawRenderPass(id))
    }

    fn destroy_render_pass(&self, raw: RawRenderPass) {
        self.lock().render_passes.remove(&raw.0);
    }

    fn create_framebuffer(
        &self,
        _width: u32,
        _height: u32,
        attachments: &[RawTexture],
        _render_pass: RawRenderPass,
    ) -> Result<RawFramebuffer, HgalError> {
        let id = self.allocate_id();
        self.lock()
            .framebuffers
            .insert(id, attachments.iter().map(|texture| texture.0).collect());
        Ok(RawFramebuffer(id))
    }

    fn destroy_framebuffer(&self, raw: RawFramebuffer) {
        self.lock().framebuffers.remove(&raw.0);
    }

    fn create_descriptor_pool(&self, set_count: u32) -> Result<RawDescriptorPool, HgalError> {
        let id = self.allocate_id();
        self.lock().descriptor_pools.insert(
            id,
            NullDescriptorPool {
                capacity: set_count,
                allocated: 0,
            },
        );
        Ok(RawDescriptorPool(id))
    }

    fn destroy_descriptor_pool(&self, raw: RawDescriptorPool) {
        self.lock().descriptor_pools.remove(&raw.0);
    }

    fn reset_descriptor_pool(&self, raw: RawDescriptorPool) {
        if let Some(pool) = self.lock().descriptor_pools.get_mut(&raw.0) {
            pool.allocated = 0;
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        _shader: RawShader,
        _group_index: u32,
    ) -> Result<RawDescriptorSet, DescriptorAllocError> {
        let id = self.allocate_id();
        let mut state = self.lock();
        let pool = match state.descriptor_pools.get_mut(&pool.0) {
            Some(pool) => pool,
            None => return Err(DescriptorAllocError::OutOfPoolMemory),
        };
        if pool.allocated >= pool.capacity {
            return Err(DescriptorAllocError::OutOfPoolMemory);
        }
        pool.allocated += 1;
        state.descriptor_sets.insert(id, Vec::new());
        Ok(RawDescriptorSet(id))
    }

    fn update_descriptor_set(&self, set: RawDescriptorSet, writes: &[DescriptorWrite]) {
        if let Some(stored) = self.lock().descriptor_sets.get_mut(&set.0) {
            stored.extend_from_slice(writes);
        }
    }

    fn create_semaphore(&self, timeline: bool, initial_value: u64) -> Result<RawSemaphore, HgalError> {
        let id = self.allocate_id();
        self.lock().semaphores.insert(
            id,
            NullSemaphore {
                timeline,
                value: initial_value,
            },
        );
        Ok(RawSemaphore(id))
    }

    fn destroy_semaphore(&self, raw: RawSemaphore) {
        self.lock().semaphores.remove(&raw.0);
    }

    fn semaphore_value(&self, raw: RawSemaphore) -> u64 {
        self.lock()
            .semaphores
            .get(&raw.0)
            .map(|semaphore| semaphore.value)
            .unwrap_or(0)
    }

    fn signal_semaphore(&self, raw: RawSemaphore, value: u64) {
        if let Some(semaphore) = self.lock().semaphores.get_mut(&raw.0) {
            semaphore.value = semaphore.value.max(value);
        }
    }

    fn wait_semaphore(
        &self,
        raw: RawSemaphore,
        value: u64,
        _timeout: std::time::Duration,
    ) -> Result<(), HgalError> {
        // Submissions complete at submit time, so an unsatisfied wait can
        // never become satisfied later.
        if self.semaphore_value(raw) >= value {
            Ok(())
        } else {
            Err(HgalError::UploadTimeout {
                queue: "timeline",
                value,
            })
        }
    }

    fn create_command_pool(&self, queue: QueueKind) -> Result<RawCommandPool, HgalError> {
        let id = self.allocate_id();
        self.lock().command_pools.insert(id, queue);
        Ok(RawCommandPool(id))
    }

    fn destroy_command_pool(&self, raw: RawCommandPool) {
        self.lock().command_pools.remove(&raw.0);
    }

    fn allocate_command_buffer(&self, _pool: RawCommandPool) -> Result<RawCommandBuffer, HgalError> {
        let id = self.allocate_id();
        self.lock()
            .command_buffers
            .insert(id, NullCommandBuffer::default());
        Ok(RawCommandBuffer(id))
    }

    fn begin_command_buffer(&self, command_buffer: RawCommandBuffer) {
        if let Some(buffer) = self.lock().command_buffers.get_mut(&command_buffer.0) {
            buffer.recording = true;
        }
    }

    fn end_command_buffer(&self, command_buffer: RawCommandBuffer) {
        if let Some(buffer) = self.lock().command_buffers.get_mut(&command_buffer.0) {
            buffer.recording = false;
        }
    }

    fn reset_command_buffer(&self, command_buffer: RawCommandBuffer) {
        if let Some(buffer) = self.lock().command_buffers.get_mut(&command_buffer.0) {
            buffer.commands.clear();
            buffer.recording = false;
        }
    }

    fn record(&self, command_buffer: RawCommandBuffer, command: Command) {
        if let Some(buffer) = self.lock().command_buffers.get_mut(&command_buffer.0) {
            buffer.commands.push(command);
        }
    }

    fn submit(
        &self,
        queue: QueueKind,
        command_buffers: &[RawCommandBuffer],
        _waits: &[SemaphoreOp],
        signals: &[SemaphoreOp],
    ) -> Result<(), HgalError> {
        let mut state = self.lock();
        if state.device_lost {
            return Err(HgalError::DeviceLost);
        }
        for command_buffer in command_buffers {
            let commands = state
                .command_buffers
                .get_mut(&command_buffer.0)
                .map(|buffer| std::mem::take(&mut buffer.commands))
                .unwrap_or_default();
            for command in commands {
                Self::execute(&mut state, command);
            }
        }
        for signal in signals {
            if let Some(semaphore) = state.semaphores.get_mut(&signal.semaphore.0) {
                if semaphore.timeline {
                    semaphore.value = semaphore.value.max(signal.value);
                } else {
                    semaphore.value = 1;
                }
            }
        }
        *state.submit_count_per_queue.entry(queue).or_insert(0) += 1;
        Ok(())
    }

    fn wait_idle(&self) {}

    fn recreate_swapchain(&self, width: u32, height: u32) -> Result<(), HgalError> {
        let ids: Vec<u64> = (0..SWAPCHAIN_IMAGE_COUNT).map(|_| self.allocate_id()).collect();
        let mut state = self.lock();
        state.swapchain_extent = (width, height);
        let old = std::mem::take(&mut state.swapchain_images);
        for id in old {
            state.textures.remove(&id);
        }
        for id in ids {
            state.textures.insert(
                id,
                NullTexture {
                    width,
                    height,
                    layer_count: 1,
                    allocation_id: id,
                    layers: HashMap::new(),
                },
            );
            state.swapchain_images.push(id);
        }
        state.next_swapchain_image = 0;
        Ok(())
    }

    fn swapchain_extent(&self) -> (u32, u32) {
        self.lock().swapchain_extent
    }

    fn swapchain_image(&self, image_index: u32) -> RawTexture {
        RawTexture(
            self.lock()
                .swapchain_images
                .get(image_index as usize)
                .copied()
                .unwrap_or(0),
        )
    }

    fn acquire_next_image(&self, signal: RawSemaphore) -> Result<AcquireStatus, HgalError> {
        let mut state = self.lock();
        if let Some(forced) = state.forced_acquire.pop_front() {
            return Ok(forced);
        }
        let image_index = state.next_swapchain_image;
        state.next_swapchain_image = (state.next_swapchain_image + 1) % SWAPCHAIN_IMAGE_COUNT;
        if let Some(semaphore) = state.semaphores.get_mut(&signal.0) {
            semaphore.value = 1;
        }
        Ok(AcquireStatus::Success { image_index })
    }

    fn present(&self, wait: RawSemaphore, _image_index: u32) -> Result<PresentStatus, HgalError> {
        let mut state = self.lock();
        if let Some(semaphore) = state.semaphores.get_mut(&wait.0) {
            semaphore.value = 0;
        }
        if let Some(forced) = state.forced_present.pop_front() {
            return Ok(forced);
        }
        Ok(PresentStatus::Success)
    }
}

//
// Bytecode encoding
//
// The null driver "reflects" shaders out of its own byte format. Frontends
// that target it (the shader importer under test, fixture shaders) build the
// blob with `encode_shader_bytecode`.
//

const SHADER_MAGIC: &[u8; 4] = b"HGSB";

pub fn encode_shader_bytecode(reflection: &ShaderReflection) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(SHADER_MAGIC);
    write_u32(&mut out, reflection.sets.len() as u32);
    for set in &reflection.sets {
        match set {
            None => out.push(0),
            Some(layout) => {
                out.push(1);
                write_u32(&mut out, layout.bindings.len() as u32);
                for binding in &layout.bindings {
                    out.push(match binding.binding_type {
                        BindingType::UniformBuffer => 0,
                        BindingType::StorageBuffer => 1,
                        BindingType::CombinedImageSampler => 2,
                    });
                    write_u32(&mut out, binding.number);
                    write_u32(&mut out, binding.count);
                    write_u32(&mut out, binding.stage_flags);
                }
            }
        }
    }
    write_u32(&mut out, reflection.vertex_bindings.len() as u32);
    for binding in &reflection.vertex_bindings {
        write_u32(&mut out, binding.binding);
        write_u32(&mut out, binding.stride);
    }
    write_u32(&mut out, reflection.vertex_attributes.len() as u32);
    for attribute in &reflection.vertex_attributes {
        write_str(&mut out, &attribute.name);
        write_u32(&mut out, attribute.location);
        write_u32(&mut out, attribute.binding);
        out.push(data_type_tag(attribute.data_type));
        write_u32(&mut out, attribute.offset);
    }
    write_u32(&mut out, reflection.structs.len() as u32);
    for shader_struct in &reflection.structs {
        write_str(&mut out, &shader_struct.name);
        write_u32(&mut out, shader_struct.size);
        write_u32(&mut out, shader_struct.members.len() as u32);
        for member in &shader_struct.members {
            write_str(&mut out, &member.name);
            out.push(data_type_tag(member.data_type));
            write_u32(&mut out, member.offset);
            out.push(member.is_array as u8);
            write_u32(&mut out, member.array_element_count as u32);
        }
    }
    out
}

pub fn decode_shader_bytecode(bytecode: &[u8]) -> Result<ShaderReflection, HgalError> {
    let mut cursor = Cursor::new(bytecode);
    let magic = cursor.take(4)?;
    if magic != SHADER_MAGIC {
        return Err(HgalError::MalformedShader("bad magic".into()));
    }
    let set_count = cursor.read_u32()? as usize;
    if set_count > crate::MAX_BIND_GROUP_INDEX_COUNT {
        return Err(HgalError::MalformedShader("too many descriptor sets".into()));
    }
    let mut sets = Vec::with_capacity(set_count);
    for _ in 0..set_count {
        if cursor.read_u8()? == 0 {
            sets.push(None);
            continue;
        }
        let binding_count = cursor.read_u32()? as usize;
        let mut bindings = Vec::with_capacity(binding_count);
        for _ in 0..binding_count {
            let binding_type = match cursor.read_u8()? {
                0 => BindingType::UniformBuffer,
                1 => BindingType::StorageBuffer,
                2 => BindingType::CombinedImageSampler,
                other => {
                    return Err(HgalError::MalformedShader(format!(
                        "unknown binding type {other}"
                    )))
                }
            };
            bindings.push(Binding {
                binding_type,
                number: cursor.read_u32()?,
                count: cursor.read_u32()?,
                stage_flags: cursor.read_u32()?,
            });
        }
        sets.push(Some(BindGroupLayoutDescriptor { bindings }));
    }
    let vertex_binding_count = cursor.read_u32()? as usize;
    let mut vertex_bindings = Vec::with_capacity(vertex_binding_count);
    for _ in 0..vertex_binding_count {
        vertex_bindings.push(VertexBinding {
            binding: cursor.read_u32()?,
            stride: cursor.read_u32()?,
        });
    }
    let attribute_count = cursor.read_u32()? as usize;
    let mut vertex_attributes = Vec::with_capacity(attribute_count);
    for _ in 0..attribute_count {
        vertex_attributes.push(VertexAttribute {
            name: cursor.read_string()?,
            location: cursor.read_u32()?,
            binding: cursor.read_u32()?,
            data_type: data_type_from_tag(cursor.read_u8()?)?,
            offset: cursor.read_u32()?,
        });
    }
    let struct_count = cursor.read_u32()? as usize;
    let mut structs = Vec::with_capacity(struct_count);
    for _ in 0..struct_count {
        let name = cursor.read_string()?;
        let size = cursor.read_u32()?;
        let member_count = cursor.read_u32()? as usize;
        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            members.push(ShaderStructMember {
                name: cursor.read_string()?,
                data_type: data_type_from_tag(cursor.read_u8()?)?,
                offset: cursor.read_u32()?,
                is_array: cursor.read_u8()? != 0,
                array_element_count: cursor.read_u32()? as i32,
            });
        }
        structs.push(ShaderStruct {
            name,
            size,
            members,
        });
    }
    Ok(ShaderReflection {
        sets,
        vertex_bindings,
        vertex_attributes,
        structs,
    })
}

fn data_type_tag(data_type: ShaderDataType) -> u8 {
    match data_type {
        ShaderDataType::Bool => 0,
        ShaderDataType::S32 => 1,
        ShaderDataType::U32 => 2,
        ShaderDataType::U64 => 3,
        ShaderDataType::F32 => 4,
        ShaderDataType::Vector2F => 5,
        ShaderDataType::Vector3F => 6,
        ShaderDataType::Vector4F => 7,
        ShaderDataType::Matrix3F => 8,
        ShaderDataType::Matrix4F => 9,
        ShaderDataType::CombinedImageSampler => 10,
        ShaderDataType::Struct => 11,
    }
}

fn data_type_from_tag(tag: u8) -> Result<ShaderDataType, HgalError> {
    Ok(match tag {
        0 => ShaderDataType::Bool,
        1 => ShaderDataType::S32,
        2 => ShaderDataType::U32,
        3 => ShaderDataType::U64,
        4 => ShaderDataType::F32,
        5 => ShaderDataType::Vector2F,
        6 => ShaderDataType::Vector3F,
        7 => ShaderDataType::Vector4F,
        8 => ShaderDataType::Matrix3F,
        9 => ShaderDataType::Matrix4F,
        10 => ShaderDataType::CombinedImageSampler,
        11 => ShaderDataType::Struct,
        other => {
            return Err(HgalError::MalformedShader(format!(
                "unknown data type tag {other}"
            )))
        }
    })
}

fn write_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_str(out: &mut Vec<u8>, value: &str) {
    write_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], HgalError> {
        if self.offset + count > self.bytes.len() {
            return Err(HgalError::MalformedShader("unexpected end of bytecode".into()));
        }
        let slice = &self.bytes[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, HgalError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, HgalError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_string(&mut self) -> Result<String, HgalError> {
        let length = self.read_u32()? as usize;
        let bytes = self.take(length)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| HgalError::MalformedShader("string is not utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PipelineStage;

    fn sample_reflection() -> ShaderReflection {
        ShaderReflection {
            sets: vec![
                Some(BindGroupLayoutDescriptor {
                    bindings: vec![Binding {
                        binding_type: BindingType::UniformBuffer,
                        number: 0,
                        count: 1,
                        stage_flags: 0b11,
                    }],
                }),
                None,
                Some(BindGroupLayoutDescriptor {
                    bindings: vec![Binding {
                        binding_type: BindingType::CombinedImageSampler,
                        number: 1,
                        count: 4,
                        stage_flags: 0b10,
                    }],
                }),
            ],
            vertex_bindings: vec![VertexBinding {
                binding: 0,
                stride: 32,
            }],
            vertex_attributes: vec![VertexAttribute {
                name: "position".into(),
                location: 0,
                binding: 0,
                data_type: ShaderDataType::Vector3F,
                offset: 0,
            }],
            structs: vec![ShaderStruct {
                name: "Material_Properties".into(),
                size: 16,
                members: vec![ShaderStructMember {
                    name: "albedo_color".into(),
                    data_type: ShaderDataType::Vector4F,
                    offset: 0,
                    is_array: false,
                    array_element_count: -1,
                }],
            }],
        }
    }

    #[test]
    fn bytecode_round_trip() {
        let reflection = sample_reflection();
        let blob = encode_shader_bytecode(&reflection);
        let decoded = decode_shader_bytecode(&blob).unwrap();
        assert_eq!(decoded, reflection);
    }

    #[test]
    fn malformed_bytecode_is_rejected() {
        assert!(decode_shader_bytecode(b"nope").is_err());
        assert!(decode_shader_bytecode(&[]).is_err());
    }

    #[test]
    fn texture_aliasing_shares_allocation() {
        let driver = NullDriver::default();
        let descriptor = TextureDescriptor {
            width: 64,
            height: 64,
            ..Default::default()
        };
        let a = driver.create_texture(&descriptor, None).unwrap();
        let b = driver.create_texture(&descriptor, Some(a)).unwrap();
        let c = driver.create_texture(&descriptor, None).unwrap();
        assert_eq!(driver.texture_allocation_id(a), driver.texture_allocation_id(b));
        assert_ne!(driver.texture_allocation_id(a), driver.texture_allocation_id(c));
    }

    #[test]
    fn descriptor_pool_budget() {
        let driver = NullDriver::default();
        let pool = driver.create_descriptor_pool(2).unwrap();
        let shader = RawShader(1);
        assert!(driver.allocate_descriptor_set(pool, shader, 0).is_ok());
        assert!(driver.allocate_descriptor_set(pool, shader, 0).is_ok());
        assert_eq!(
            driver.allocate_descriptor_set(pool, shader, 0),
            Err(DescriptorAllocError::OutOfPoolMemory)
        );
        driver.reset_descriptor_pool(pool);
        assert!(driver.allocate_descriptor_set(pool, shader, 0).is_ok());
    }

    #[test]
    fn submit_signals_timeline() {
        let driver = NullDriver::default();
        let timeline = driver.create_semaphore(true, 0).unwrap();
        driver
            .submit(
                QueueKind::Graphics,
                &[],
                &[],
                &[SemaphoreOp {
                    semaphore: timeline,
                    value: 7,
                    stage: PipelineStage::ColorAttachmentOutput,
                }],
            )
            .unwrap();
        assert_eq!(driver.semaphore_value(timeline), 7);
        assert!(driver
            .wait_semaphore(timeline, 7, std::time::Duration::from_millis(1))
            .is_ok());
        assert!(driver
            .wait_semaphore(timeline, 8, std::time::Duration::from_millis(1))
            .is_err());
    }
}
