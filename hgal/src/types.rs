//! Typed resource descriptions shared between the renderer, the render graph
//! and the driver boundary.

use bitflags::bitflags;
use hearth_containers::Handle;

use crate::driver::{RawBuffer, RawDescriptorSet, RawFramebuffer, RawPipeline, RawRenderPass, RawSampler, RawSemaphore, RawShader, RawTexture};
use crate::reflection::ShaderReflection;

//
// Buffer
//

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER = 1 << 0;
        const VERTEX = 1 << 1;
        const INDEX = 1 << 2;
        const UNIFORM = 1 << 3;
        const STORAGE = 1 << 4;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub name: String,
    pub size: u64,
    pub usage: BufferUsage,
    /// Device-local buffers have no mapped memory; everything else is
    /// persistently mapped for the buffer's lifetime.
    pub device_local: bool,
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            size: 0,
            usage: BufferUsage::STORAGE,
            device_local: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub name: String,
    pub usage: BufferUsage,
    pub size: u64,
    pub device_local: bool,
    pub raw: RawBuffer,
}

pub type BufferHandle = Handle<Buffer>;

//
// Texture
//

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
    R32G32B32A32Sfloat,
    R32G32B32Sfloat,
    R32Sint,
    R32Uint,
    DepthF32StencilU8,
}

impl TextureFormat {
    pub fn texel_size(&self) -> u64 {
        match self {
            TextureFormat::R8G8B8A8Unorm
            | TextureFormat::R8G8B8A8Srgb
            | TextureFormat::B8G8R8A8Unorm
            | TextureFormat::B8G8R8A8Srgb
            | TextureFormat::R32Sint
            | TextureFormat::R32Uint => 4,
            TextureFormat::R32G32B32Sfloat => 12,
            TextureFormat::R32G32B32A32Sfloat => 16,
            // packed depth + stencil
            TextureFormat::DepthF32StencilU8 => 5,
        }
    }

    pub fn is_depth_stencil(&self) -> bool {
        matches!(self, TextureFormat::DepthF32StencilU8)
    }
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub sample_count: u32,
    pub layer_count: u32,
    pub is_cubemap: bool,
    pub mipmapping: bool,
    pub is_attachment: bool,
    /// Initial texel data, one entry per layer. Non-empty data routes the
    /// texture through the transfer queue and attaches an upload request.
    pub data: Vec<Vec<u8>>,
    /// Alias the new texture onto this texture's device allocation.
    pub alias: TextureHandle,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            width: 0,
            height: 0,
            format: TextureFormat::R8G8B8A8Srgb,
            sample_count: 1,
            layer_count: 1,
            is_cubemap: false,
            mipmapping: false,
            is_attachment: false,
            data: Vec::new(),
            alias: Handle::INVALID,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub sample_count: u32,
    pub layer_count: u32,
    pub mip_levels: u32,
    pub is_attachment: bool,
    pub is_cubemap: bool,
    /// Device allocation footprint, for transient aliasing decisions.
    pub size: u64,
    pub alignment: u64,
    pub raw: RawTexture,
    /// Pending upload gating first shader read, if any.
    pub upload_request: UploadRequestHandle,
}

pub type TextureHandle = Handle<Texture>;

//
// Sampler
//

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Repeat,
    Clamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerDescriptor {
    pub name: String,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub anisotropic_filtering: bool,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            min_filter: Filter::Nearest,
            mag_filter: Filter::Nearest,
            mip_filter: Filter::Nearest,
            anisotropic_filtering: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sampler {
    pub descriptor: SamplerDescriptor,
    pub raw: RawSampler,
}

pub type SamplerHandle = Handle<Sampler>;

//
// Shader
//

#[derive(Debug, Clone)]
pub struct ShaderDescriptor {
    pub name: String,
    /// Compiled bytecode; the driver reflects set layouts, vertex inputs and
    /// struct metadata out of it at creation.
    pub bytecode: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Shader {
    pub name: String,
    pub reflection: ShaderReflection,
    pub raw: RawShader,
}

pub type ShaderHandle = Handle<Shader>;

//
// Pipeline state
//

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompareOperation {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub depth_testing: bool,
    pub depth_writing: bool,
    pub depth_operation: CompareOperation,
    pub stencil_testing: bool,
    pub stencil_operation: CompareOperation,
    pub stencil_pass: StencilOperation,
    pub stencil_fail: StencilOperation,
    pub depth_fail: StencilOperation,
    pub stencil_compare_mask: u32,
    pub stencil_write_mask: u32,
    pub stencil_reference_value: u32,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_testing: true,
            depth_writing: true,
            depth_operation: CompareOperation::Less,
            stencil_testing: false,
            stencil_operation: CompareOperation::Always,
            stencil_pass: StencilOperation::Keep,
            stencil_fail: StencilOperation::Keep,
            depth_fail: StencilOperation::Keep,
            stencil_compare_mask: 0xff,
            stencil_write_mask: 0xff,
            stencil_reference_value: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStateDescriptor {
    pub name: String,
    pub shader: ShaderHandle,
    pub render_pass: RenderPassHandle,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_stencil: DepthStencilState,
    pub sample_count: u32,
    pub alpha_blending: bool,
}

impl Default for PipelineStateDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            shader: Handle::INVALID,
            render_pass: Handle::INVALID,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_stencil: DepthStencilState::default(),
            sample_count: 1,
            alpha_blending: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    pub descriptor: PipelineStateDescriptor,
    pub raw: RawPipeline,
}

pub type PipelineStateHandle = Handle<PipelineState>;

//
// Render pass / frame buffer
//

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AttachmentOperation {
    DontCare,
    Load,
    Clear,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ClearValue {
    pub color: glam::Vec4,
    pub depth: f32,
    pub stencil: u8,
}

impl Default for ClearValue {
    fn default() -> Self {
        Self {
            color: glam::Vec4::ZERO,
            depth: 1.0,
            stencil: 0,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AttachmentInfo {
    pub format: TextureFormat,
    pub sample_count: u32,
    pub operation: AttachmentOperation,
}

#[derive(Debug, Clone, Default)]
pub struct RenderPassDescriptor {
    pub name: String,
    pub color_attachments: Vec<AttachmentInfo>,
    pub resolve_attachments: Vec<AttachmentInfo>,
    pub depth_stencil_attachments: Vec<AttachmentInfo>,
}

#[derive(Debug, Clone)]
pub struct RenderPass {
    pub name: String,
    pub descriptor: RenderPassDescriptor,
    pub raw: RawRenderPass,
}

pub type RenderPassHandle = Handle<RenderPass>;

#[derive(Debug, Clone, Default)]
pub struct FrameBufferDescriptor {
    pub width: u32,
    pub height: u32,
    pub attachments: Vec<TextureHandle>,
    pub render_pass: RenderPassHandle,
}

#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub attachments: Vec<TextureHandle>,
    pub render_pass: RenderPassHandle,
    pub raw: RawFramebuffer,
}

pub type FrameBufferHandle = Handle<FrameBuffer>;

//
// Bind group
//

#[derive(Debug, Clone)]
pub struct BindGroupDescriptor {
    pub name: String,
    pub shader: ShaderHandle,
    pub group_index: u32,
}

#[derive(Debug, Clone)]
pub struct BindGroup {
    pub shader: ShaderHandle,
    pub group_index: u32,
    /// Reallocated from the per-frame descriptor allocator on every
    /// `update_bind_group`.
    pub raw: Option<RawDescriptorSet>,
}

pub type BindGroupHandle = Handle<BindGroup>;

/// One binding write inside `update_bind_group`.
#[derive(Debug, Clone, Default)]
pub struct UpdateBindingDescriptor {
    pub binding_number: u32,
    pub element_index: u32,
    pub buffers: Vec<BufferHandle>,
    pub textures: Vec<TextureHandle>,
    pub samplers: Vec<SamplerHandle>,
}

//
// Synchronization
//

#[derive(Debug, Clone)]
pub struct Semaphore {
    pub raw: RawSemaphore,
    pub timeline: bool,
}

pub type SemaphoreHandle = Handle<Semaphore>;

/// Records the transfer-queue timeline value at which a staged resource
/// becomes safe to read.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub semaphore: RawSemaphore,
    pub target_value: u64,
    /// Staging memory reclaimed when the request is destroyed.
    pub staging: BufferHandle,
}

pub type UploadRequestHandle = Handle<UploadRequest>;

//
// Static mesh & material (GPU-side aggregates)
//

#[derive(Debug, Clone, Default)]
pub struct StaticMeshDescriptor {
    pub name: String,
    pub positions: Vec<glam::Vec3>,
    pub normals: Vec<glam::Vec3>,
    pub uvs: Vec<glam::Vec2>,
    pub tangents: Vec<glam::Vec4>,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct StaticMesh {
    pub name: String,
    pub vertex_count: u32,
    pub index_count: u32,
    pub position_buffer: BufferHandle,
    pub normal_buffer: BufferHandle,
    pub uv_buffer: BufferHandle,
    pub tangent_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub upload_request: UploadRequestHandle,
}

pub type StaticMeshHandle = Handle<StaticMesh>;

#[derive(Debug, Clone)]
pub struct MaterialDescriptor {
    pub name: String,
    pub pipeline_state: PipelineStateHandle,
}

/// GPU material: a pipeline plus a property block mirrored into one uniform
/// buffer and bind group per frame in flight.
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub pipeline_state: PipelineStateHandle,
    pub data: Vec<u8>,
    pub properties: crate::reflection::ShaderStruct,
    pub buffers: [BufferHandle; crate::MAX_FRAMES_IN_FLIGHT],
    pub bind_groups: [BindGroupHandle; crate::MAX_FRAMES_IN_FLIGHT],
    /// Frames whose uniform buffer still holds stale property data.
    pub dirty_count: u32,
}

pub type MaterialHandle = Handle<Material>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes() {
        assert_eq!(TextureFormat::R8G8B8A8Srgb.texel_size(), 4);
        assert_eq!(TextureFormat::R32G32B32A32Sfloat.texel_size(), 16);
        assert!(TextureFormat::DepthF32StencilU8.is_depth_stencil());
        assert!(!TextureFormat::B8G8R8A8Unorm.is_depth_stencil());
    }

    #[test]
    fn buffer_usage_flags_combine() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER;
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::UNIFORM));
    }
}
