//! Declarative render graph.
//!
//! Nodes are added by name with an execute closure, then populated with
//! named resource outputs and inputs. The first node to reference a name is
//! the resource's producer; unique names enforce a single producer.
//! `compile` derives producer->consumer edges, topologically sorts the nodes,
//! materializes transient textures with memory aliasing, and builds each
//! node's render pass and per-frame framebuffers. `render` walks the sorted
//! order each frame; `invalidate` rebuilds everything that depends on the
//! viewport or MSAA setting.

mod compile;

use std::collections::HashMap;

use hearth_containers::Handle;

use crate::error::HgalError;
use crate::renderer::Renderer;
use crate::types::*;
use crate::MAX_FRAMES_IN_FLIGHT;

pub type NodeHandle = i32;
pub type ResourceHandle = i32;

pub const INVALID_NODE: NodeHandle = -1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Graphics,
    Compute,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResourceUsage {
    RenderTarget,
    SampledTexture,
    StorageTexture,
    StorageBuffer,
}

/// Sizing and format of a graph-owned texture.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RenderTargetInfo {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Resizable targets derive their extent from the viewport.
    pub resizable: bool,
    pub scale_x: f32,
    pub scale_y: f32,
    pub sample_count: u32,
    /// Tracks the renderer's MSAA setting on invalidate.
    pub resizable_sample_count: bool,
}

impl Default for RenderTargetInfo {
    fn default() -> Self {
        Self {
            format: TextureFormat::R8G8B8A8Srgb,
            width: 0,
            height: 0,
            resizable: true,
            scale_x: 1.0,
            scale_y: 1.0,
            sample_count: 1,
            resizable_sample_count: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GraphBufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub resizable: bool,
}

impl Default for GraphBufferInfo {
    fn default() -> Self {
        Self {
            size: 1,
            usage: BufferUsage::STORAGE,
            resizable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ResourceData {
    Texture {
        info: RenderTargetInfo,
        /// Extent/sample count after viewport resolution at compile time.
        resolved_width: u32,
        resolved_height: u32,
        resolved_sample_count: u32,
        textures: [TextureHandle; MAX_FRAMES_IN_FLIGHT],
    },
    Buffer {
        info: GraphBufferInfo,
        buffers: [BufferHandle; MAX_FRAMES_IN_FLIGHT],
    },
}

#[derive(Debug, Clone)]
pub struct GraphResource {
    pub name: String,
    pub(crate) data: ResourceData,
    /// The node that writes this resource.
    pub producer: NodeHandle,
    /// Remaining consumer references during compilation.
    pub(crate) ref_count: u32,
}

impl GraphResource {
    pub fn texture(&self, frame_index: usize) -> TextureHandle {
        match &self.data {
            ResourceData::Texture { textures, .. } => textures[frame_index],
            ResourceData::Buffer { .. } => Handle::INVALID,
        }
    }

    pub fn buffer(&self, frame_index: usize) -> BufferHandle {
        match &self.data {
            ResourceData::Buffer { buffers, .. } => buffers[frame_index],
            ResourceData::Texture { .. } => Handle::INVALID,
        }
    }

    pub fn is_texture(&self) -> bool {
        matches!(self.data, ResourceData::Texture { .. })
    }
}

#[derive(Debug, Copy, Clone)]
pub struct NodeReference {
    pub resource: ResourceHandle,
    pub usage: ResourceUsage,
    pub operation: AttachmentOperation,
    pub clear_value: ClearValue,
}

pub type ExecuteNodeFn = Box<dyn FnMut(&Renderer) -> Result<(), HgalError> + Send>;

pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub enabled: bool,
    pub inputs: Vec<NodeReference>,
    pub outputs: Vec<NodeReference>,
    /// Attachment-order list driving pass/framebuffer creation: render
    /// target outputs and loaded render target inputs, in add order.
    pub(crate) attachments: Vec<NodeReference>,
    pub clear_values: Vec<ClearValue>,
    pub edges: Vec<NodeHandle>,
    pub shader: ShaderHandle,
    pub bind_group: BindGroupHandle,
    pub bind_group_index: u32,
    pub render_pass: RenderPassHandle,
    pub frame_buffers: [FrameBufferHandle; MAX_FRAMES_IN_FLIGHT],
    pub(crate) execute: ExecuteNodeFn,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("edges", &self.edges)
            .finish()
    }
}

#[derive(Default)]
pub struct RenderGraph {
    pub(crate) nodes: Vec<Node>,
    node_cache: HashMap<String, NodeHandle>,
    pub(crate) resources: Vec<GraphResource>,
    resource_cache: HashMap<String, ResourceHandle>,
    pub(crate) sorted_nodes: Vec<NodeHandle>,
    presentable: Option<ResourceHandle>,
}

impl std::fmt::Debug for RenderGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderGraph")
            .field("nodes", &self.nodes.len())
            .field("resources", &self.resources.len())
            .field("sorted_nodes", &self.sorted_nodes)
            .finish()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&mut self, name: &str, kind: NodeKind, execute: ExecuteNodeFn) -> Result<NodeHandle, HgalError> {
        if self.node_cache.contains_key(name) {
            return Err(HgalError::Graph(format!("node `{name}` already exists")));
        }
        let handle = self.nodes.len() as NodeHandle;
        self.nodes.push(Node {
            name: name.to_string(),
            kind,
            enabled: true,
            inputs: Vec::new(),
            outputs: Vec::new(),
            attachments: Vec::new(),
            clear_values: Vec::new(),
            edges: Vec::new(),
            shader: Handle::INVALID,
            bind_group: Handle::INVALID,
            bind_group_index: 2,
            render_pass: Handle::INVALID,
            frame_buffers: [Handle::INVALID; MAX_FRAMES_IN_FLIGHT],
            execute,
        });
        self.node_cache.insert(name.to_string(), handle);
        Ok(handle)
    }

    pub fn add_graphics_node(
        &mut self,
        name: &str,
        execute: ExecuteNodeFn,
    ) -> Result<NodeHandle, HgalError> {
        self.add_node(name, NodeKind::Graphics, execute)
    }

    pub fn add_compute_node(
        &mut self,
        name: &str,
        execute: ExecuteNodeFn,
    ) -> Result<NodeHandle, HgalError> {
        self.add_node(name, NodeKind::Compute, execute)
    }

    pub fn set_shader(&mut self, node: NodeHandle, shader: ShaderHandle, bind_group_index: u32) {
        let node = &mut self.nodes[node as usize];
        node.shader = shader;
        node.bind_group_index = bind_group_index;
    }

    pub fn set_node_enabled(&mut self, node: NodeHandle, enabled: bool) {
        self.nodes[node as usize].enabled = enabled;
    }

    fn produce_texture(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        info: RenderTargetInfo,
    ) -> Result<ResourceHandle, HgalError> {
        if self.resource_cache.contains_key(resource_name) {
            return Err(HgalError::Graph(format!(
                "resource `{resource_name}` already has a producer"
            )));
        }
        let handle = self.resources.len() as ResourceHandle;
        self.resources.push(GraphResource {
            name: resource_name.to_string(),
            data: ResourceData::Texture {
                info,
                resolved_width: info.width,
                resolved_height: info.height,
                resolved_sample_count: info.sample_count,
                textures: [Handle::INVALID; MAX_FRAMES_IN_FLIGHT],
            },
            producer: node,
            ref_count: 0,
        });
        self.resource_cache.insert(resource_name.to_string(), handle);
        Ok(handle)
    }

    fn consume(&self, resource_name: &str) -> Result<ResourceHandle, HgalError> {
        self.resource_cache
            .get(resource_name)
            .copied()
            .ok_or_else(|| HgalError::Graph(format!("resource `{resource_name}` has no producer")))
    }

    /// Output: a color render target produced by `node`.
    pub fn add_render_target(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        info: RenderTargetInfo,
        operation: AttachmentOperation,
        clear_value: ClearValue,
    ) -> Result<(), HgalError> {
        let resource = self.produce_texture(node, resource_name, info)?;
        let reference = NodeReference {
            resource,
            usage: ResourceUsage::RenderTarget,
            operation,
            clear_value,
        };
        let node = &mut self.nodes[node as usize];
        node.outputs.push(reference);
        node.attachments.push(reference);
        node.clear_values.push(clear_value);
        Ok(())
    }

    /// Output: the depth-stencil target produced by `node`.
    pub fn add_depth_stencil_target(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        mut info: RenderTargetInfo,
        operation: AttachmentOperation,
        clear_value: ClearValue,
    ) -> Result<(), HgalError> {
        info.format = TextureFormat::DepthF32StencilU8;
        self.add_render_target(node, resource_name, info, operation, clear_value)
    }

    /// Output: a storage texture written by a compute node.
    pub fn add_storage_texture(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        info: RenderTargetInfo,
        clear_value: ClearValue,
    ) -> Result<(), HgalError> {
        let resource = self.produce_texture(node, resource_name, info)?;
        let reference = NodeReference {
            resource,
            usage: ResourceUsage::StorageTexture,
            operation: AttachmentOperation::DontCare,
            clear_value,
        };
        let node = &mut self.nodes[node as usize];
        node.outputs.push(reference);
        Ok(())
    }

    /// Output: a storage buffer written by `node`.
    pub fn add_storage_buffer(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        info: GraphBufferInfo,
    ) -> Result<(), HgalError> {
        if self.resource_cache.contains_key(resource_name) {
            return Err(HgalError::Graph(format!(
                "resource `{resource_name}` already has a producer"
            )));
        }
        let handle = self.resources.len() as ResourceHandle;
        self.resources.push(GraphResource {
            name: resource_name.to_string(),
            data: ResourceData::Buffer {
                info,
                buffers: [Handle::INVALID; MAX_FRAMES_IN_FLIGHT],
            },
            producer: node,
            ref_count: 0,
        });
        self.resource_cache.insert(resource_name.to_string(), handle);
        let reference = NodeReference {
            resource: handle,
            usage: ResourceUsage::StorageBuffer,
            operation: AttachmentOperation::DontCare,
            clear_value: ClearValue::default(),
        };
        self.nodes[node as usize].outputs.push(reference);
        Ok(())
    }

    /// Input: load an existing render target as an attachment of `node`.
    pub fn add_render_target_input(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        operation: AttachmentOperation,
        clear_value: ClearValue,
    ) -> Result<(), HgalError> {
        let resource = self.consume(resource_name)?;
        let reference = NodeReference {
            resource,
            usage: ResourceUsage::RenderTarget,
            operation,
            clear_value,
        };
        let node = &mut self.nodes[node as usize];
        node.inputs.push(reference);
        node.attachments.push(reference);
        node.clear_values.push(clear_value);
        Ok(())
    }

    /// Input: sample a texture produced elsewhere.
    pub fn add_texture_input(&mut self, node: NodeHandle, resource_name: &str) -> Result<(), HgalError> {
        let resource = self.consume(resource_name)?;
        self.nodes[node as usize].inputs.push(NodeReference {
            resource,
            usage: ResourceUsage::SampledTexture,
            operation: AttachmentOperation::DontCare,
            clear_value: ClearValue::default(),
        });
        Ok(())
    }

    pub fn add_storage_texture_input(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
    ) -> Result<(), HgalError> {
        let resource = self.consume(resource_name)?;
        self.nodes[node as usize].inputs.push(NodeReference {
            resource,
            usage: ResourceUsage::StorageTexture,
            operation: AttachmentOperation::DontCare,
            clear_value: ClearValue::default(),
        });
        Ok(())
    }

    pub fn add_storage_buffer_input(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
    ) -> Result<(), HgalError> {
        let resource = self.consume(resource_name)?;
        self.nodes[node as usize].inputs.push(NodeReference {
            resource,
            usage: ResourceUsage::StorageBuffer,
            operation: AttachmentOperation::DontCare,
            clear_value: ClearValue::default(),
        });
        Ok(())
    }

    /// Input: reuse a depth-stencil target produced by an earlier node.
    pub fn set_depth_stencil_target(
        &mut self,
        node: NodeHandle,
        resource_name: &str,
        operation: AttachmentOperation,
        clear_value: ClearValue,
    ) -> Result<(), HgalError> {
        self.add_render_target_input(node, resource_name, operation, clear_value)
    }

    pub fn set_presentable_attachment(&mut self, resource_name: &str) -> Result<(), HgalError> {
        self.presentable = Some(self.consume(resource_name)?);
        Ok(())
    }

    //
    // Lookups
    //

    pub fn get_node(&self, name: &str) -> NodeHandle {
        self.node_cache.get(name).copied().unwrap_or(INVALID_NODE)
    }

    pub fn node(&self, handle: NodeHandle) -> &Node {
        &self.nodes[handle as usize]
    }

    pub fn get_resource(&self, name: &str) -> Option<&GraphResource> {
        self.resource_cache
            .get(name)
            .map(|&handle| &self.resources[handle as usize])
    }

    pub fn get_texture_resource(&self, name: &str, frame_index: usize) -> TextureHandle {
        self.get_resource(name)
            .map(|resource| resource.texture(frame_index))
            .unwrap_or(Handle::INVALID)
    }

    pub fn get_render_pass(&self, name: &str) -> RenderPassHandle {
        let handle = self.get_node(name);
        if handle == INVALID_NODE {
            return Handle::INVALID;
        }
        self.nodes[handle as usize].render_pass
    }

    pub fn presentable_attachment(&self, frame_index: usize) -> TextureHandle {
        self.presentable
            .map(|handle| self.resources[handle as usize].texture(frame_index))
            .unwrap_or(Handle::INVALID)
    }

    pub fn sorted_order(&self) -> &[NodeHandle] {
        &self.sorted_nodes
    }

    //
    // Execute
    //

    /// Walk the compiled order: viewport, render pass, node execute.
    pub fn render(&mut self, renderer: &Renderer) -> Result<(), HgalError> {
        let frame_index = renderer.current_frame_index();
        let sorted = self.sorted_nodes.clone();
        for node_handle in sorted {
            let node = &mut self.nodes[node_handle as usize];
            if !node.enabled {
                continue;
            }
            let has_pass = !node.render_pass.is_invalid();
            if has_pass {
                let frame_buffer = node.frame_buffers[frame_index];
                let (width, height) = renderer
                    .frame_buffers
                    .with(&frame_buffer, |fb| (fb.width, fb.height))?;
                renderer.set_viewport(width, height)?;
                renderer.begin_render_pass(node.render_pass, frame_buffer, node.clear_values.clone())?;
                (node.execute)(renderer)?;
                renderer.end_render_pass()?;
            } else {
                (node.execute)(renderer)?;
            }
        }
        Ok(())
    }
}
