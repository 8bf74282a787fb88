//! Graph compilation: edge derivation, topological sort, transient texture
//! aliasing, render pass and framebuffer creation, and invalidation on
//! viewport or MSAA changes.

use petgraph::graph::{DiGraph, NodeIndex};
use tracing::trace;

use hearth_containers::Handle;

use crate::error::HgalError;
use crate::renderer::Renderer;
use crate::types::*;
use crate::MAX_FRAMES_IN_FLIGHT;

use super::{NodeHandle, RenderGraph, ResourceData};

impl RenderGraph {
    /// Compile the graph: derive edges, sort, materialize transient
    /// resources with aliasing, create passes and framebuffers.
    pub fn compile(&mut self, renderer: &Renderer) -> Result<(), HgalError> {
        self.build_edges();
        self.toposort()?;
        self.resolve_extents(renderer);
        self.materialize_resources(renderer)?;
        self.create_passes(renderer)?;
        trace!(order = ?self.sorted_nodes, "compiled render graph");
        Ok(())
    }

    /// Producer -> consumer edges, one per (producer, consumer) pair.
    fn build_edges(&mut self) {
        for node in &mut self.nodes {
            node.edges.clear();
        }
        let mut edges: Vec<(NodeHandle, NodeHandle)> = Vec::new();
        for (consumer_index, node) in self.nodes.iter().enumerate() {
            let consumer = consumer_index as NodeHandle;
            for input in &node.inputs {
                let producer = self.resources[input.resource as usize].producer;
                if producer != consumer && !edges.contains(&(producer, consumer)) {
                    edges.push((producer, consumer));
                }
            }
        }
        for (producer, consumer) in edges {
            self.nodes[producer as usize].edges.push(consumer);
        }
    }

    /// Iterative DFS with three-state marking; reversed post-order puts
    /// producers before consumers.
    fn toposort(&mut self) -> Result<(), HgalError> {
        let mut graph: DiGraph<NodeHandle, ()> = DiGraph::with_capacity(self.nodes.len(), 0);
        let indices: Vec<NodeIndex> = (0..self.nodes.len())
            .map(|handle| graph.add_node(handle as NodeHandle))
            .collect();
        for (producer, node) in self.nodes.iter().enumerate() {
            for &consumer in &node.edges {
                graph.add_edge(indices[producer], indices[consumer as usize], ());
            }
        }

        const UNVISITED: u8 = 0;
        const ON_STACK: u8 = 1;
        const DONE: u8 = 2;

        let mut visited = vec![UNVISITED; self.nodes.len()];
        let mut stack: Vec<NodeHandle> = Vec::with_capacity(self.nodes.len());
        let mut post_order: Vec<NodeHandle> = Vec::with_capacity(self.nodes.len());

        for start in 0..self.nodes.len() as NodeHandle {
            stack.push(start);
            while let Some(&current) = stack.last() {
                match visited[current as usize] {
                    DONE => {
                        stack.pop();
                    }
                    ON_STACK => {
                        visited[current as usize] = DONE;
                        post_order.push(current);
                        stack.pop();
                    }
                    _ => {
                        visited[current as usize] = ON_STACK;
                        for neighbor in graph.neighbors(indices[current as usize]) {
                            let child = graph[neighbor];
                            match visited[child as usize] {
                                UNVISITED => stack.push(child),
                                ON_STACK => {
                                    return Err(HgalError::Graph(format!(
                                        "cycle through node `{}`",
                                        self.nodes[child as usize].name
                                    )))
                                }
                                _ => {}
                            }
                        }
                    }
                }
            }
        }

        post_order.reverse();
        self.sorted_nodes = post_order;
        Ok(())
    }

    fn resolve_extents(&mut self, renderer: &Renderer) {
        let (viewport_width, viewport_height) = renderer.viewport_extent();
        let msaa = renderer.msaa_sample_count();
        for resource in &mut self.resources {
            if let ResourceData::Texture {
                info,
                resolved_width,
                resolved_height,
                resolved_sample_count,
                ..
            } = &mut resource.data
            {
                if info.resizable {
                    *resolved_width = (info.scale_x * viewport_width as f32) as u32;
                    *resolved_height = (info.scale_y * viewport_height as f32) as u32;
                } else {
                    *resolved_width = info.width;
                    *resolved_height = info.height;
                }
                *resolved_sample_count = if info.resizable_sample_count {
                    msaa
                } else {
                    info.sample_count
                };
            }
        }
    }

    fn texture_descriptor(&self, resource_index: usize) -> Option<TextureDescriptor> {
        let resource = &self.resources[resource_index];
        match &resource.data {
            ResourceData::Texture {
                info,
                resolved_width,
                resolved_height,
                resolved_sample_count,
                ..
            } => Some(TextureDescriptor {
                name: resource.name.clone(),
                width: *resolved_width,
                height: *resolved_height,
                format: info.format,
                sample_count: *resolved_sample_count,
                is_attachment: true,
                ..Default::default()
            }),
            ResourceData::Buffer { .. } => None,
        }
    }

    /// Walk the sorted order, creating per-frame textures and buffers.
    /// Inputs whose last consumer is the current node release their textures
    /// to the free list before the node's own outputs allocate, so a
    /// just-released attachment is immediately reusable.
    fn materialize_resources(&mut self, renderer: &Renderer) -> Result<(), HgalError> {
        // transient consumer counts
        for resource in &mut self.resources {
            resource.ref_count = 0;
        }
        for &node_handle in &self.sorted_nodes {
            let node = &self.nodes[node_handle as usize];
            for reference in node.inputs.iter().chain(node.outputs.iter()) {
                self.resources[reference.resource as usize].ref_count += 1;
            }
        }

        // recompiles drop previously materialized resources first
        for resource in &mut self.resources {
            match &mut resource.data {
                ResourceData::Texture { textures, .. } => {
                    for texture in textures.iter_mut() {
                        if !texture.is_invalid() && renderer.textures.is_valid(texture) {
                            renderer.destroy_texture(*texture, true)?;
                        }
                        *texture = Handle::INVALID;
                    }
                }
                ResourceData::Buffer { buffers, .. } => {
                    for buffer in buffers.iter_mut() {
                        if !buffer.is_invalid() && renderer.buffers.is_valid(buffer) {
                            renderer.destroy_buffer(*buffer, true)?;
                        }
                        *buffer = Handle::INVALID;
                    }
                }
            }
        }

        let mut free_list: Vec<TextureHandle> = Vec::new();
        let sorted = self.sorted_nodes.clone();

        for node_handle in sorted {
            let inputs = self.nodes[node_handle as usize].inputs.clone();
            let outputs = self.nodes[node_handle as usize].outputs.clone();

            for input in &inputs {
                let resource = &mut self.resources[input.resource as usize];
                resource.ref_count -= 1;
                if resource.ref_count == 0 {
                    if let ResourceData::Texture { textures, .. } = &resource.data {
                        for texture in textures {
                            if !texture.is_invalid() {
                                free_list.push(*texture);
                            }
                        }
                    }
                }
            }

            for output in &outputs {
                let is_texture = self.resources[output.resource as usize].is_texture();
                if is_texture {
                    {
                        let descriptor = self
                            .texture_descriptor(output.resource as usize)
                            .expect("texture resource");
                        let requirements = renderer.get_texture_memory_requirements(&descriptor);
                        let mut frame_textures = [Handle::INVALID; MAX_FRAMES_IN_FLIGHT];
                        for frame_texture in frame_textures.iter_mut() {
                            let mut exact: Option<usize> = None;
                            let mut best_fit: Option<usize> = None;
                            let mut best_size = u64::MAX;
                            for (index, candidate) in free_list.iter().enumerate() {
                                let (width, height, sample_count, format, size, alignment) =
                                    renderer.textures.with(candidate, |texture| {
                                        (
                                            texture.width,
                                            texture.height,
                                            texture.sample_count,
                                            texture.format,
                                            texture.size,
                                            texture.alignment,
                                        )
                                    })?;
                                if width == descriptor.width
                                    && height == descriptor.height
                                    && sample_count == descriptor.sample_count
                                    && format == descriptor.format
                                {
                                    exact = Some(index);
                                    break;
                                } else if size >= requirements.size
                                    && alignment >= requirements.alignment
                                    && size < best_size
                                {
                                    best_size = size;
                                    best_fit = Some(index);
                                }
                            }

                            *frame_texture = if let Some(index) = exact {
                                free_list.swap_remove(index)
                            } else if let Some(index) = best_fit {
                                let alias = free_list.swap_remove(index);
                                let mut aliased = descriptor.clone();
                                aliased.alias = alias;
                                renderer.create_texture(aliased)?
                            } else {
                                renderer.create_texture(descriptor.clone())?
                            };
                        }
                        if let ResourceData::Texture { textures, .. } =
                            &mut self.resources[output.resource as usize].data
                        {
                            *textures = frame_textures;
                        }
                    }
                } else {
                    let name = self.resources[output.resource as usize].name.clone();
                    let info = match &self.resources[output.resource as usize].data {
                        ResourceData::Buffer { info, .. } => *info,
                        ResourceData::Texture { .. } => unreachable!(),
                    };
                    let mut frame_buffers = [Handle::INVALID; MAX_FRAMES_IN_FLIGHT];
                    for frame_buffer in frame_buffers.iter_mut() {
                        *frame_buffer = renderer.create_buffer(BufferDescriptor {
                            name: name.clone(),
                            size: info.size,
                            usage: info.usage,
                            device_local: true,
                        })?;
                    }
                    if let ResourceData::Buffer { buffers, .. } =
                        &mut self.resources[output.resource as usize].data
                    {
                        *buffers = frame_buffers;
                    }
                }
            }

            for output in &outputs {
                let resource = &mut self.resources[output.resource as usize];
                resource.ref_count -= 1;
                if resource.ref_count == 0 {
                    if let ResourceData::Texture { textures, .. } = &resource.data {
                        for texture in textures {
                            if !texture.is_invalid() {
                                free_list.push(*texture);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn pass_descriptor(&self, node_handle: NodeHandle) -> (RenderPassDescriptor, u32, u32) {
        let node = &self.nodes[node_handle as usize];
        let mut descriptor = RenderPassDescriptor {
            name: node.name.clone(),
            ..Default::default()
        };
        let mut width = 0;
        let mut height = 0;
        for attachment in &node.attachments {
            let resource = &self.resources[attachment.resource as usize];
            let ResourceData::Texture {
                info,
                resolved_width,
                resolved_height,
                resolved_sample_count,
                ..
            } = &resource.data
            else {
                continue;
            };
            let attachment_info = AttachmentInfo {
                format: info.format,
                sample_count: *resolved_sample_count,
                operation: attachment.operation,
            };
            width = *resolved_width;
            height = *resolved_height;
            if attachment_info.format == TextureFormat::DepthF32StencilU8 {
                descriptor.depth_stencil_attachments.push(attachment_info);
            } else if descriptor.color_attachments.is_empty()
                || attachment_info.sample_count == descriptor.color_attachments[0].sample_count
            {
                descriptor.color_attachments.push(attachment_info);
            } else {
                descriptor.resolve_attachments.push(attachment_info);
            }
        }
        (descriptor, width, height)
    }

    fn frame_buffer_descriptor(
        &self,
        node_handle: NodeHandle,
        frame_index: usize,
        width: u32,
        height: u32,
        render_pass: RenderPassHandle,
    ) -> FrameBufferDescriptor {
        let node = &self.nodes[node_handle as usize];
        FrameBufferDescriptor {
            width,
            height,
            attachments: node
                .attachments
                .iter()
                .map(|attachment| {
                    self.resources[attachment.resource as usize].texture(frame_index)
                })
                .collect(),
            render_pass,
        }
    }

    fn create_passes(&mut self, renderer: &Renderer) -> Result<(), HgalError> {
        let sorted = self.sorted_nodes.clone();
        for node_handle in sorted {
            if self.nodes[node_handle as usize].attachments.is_empty() {
                continue;
            }
            let (descriptor, width, height) = self.pass_descriptor(node_handle);
            let existing = self.nodes[node_handle as usize].render_pass;
            let render_pass = if !existing.is_invalid() && renderer.render_passes.is_valid(&existing) {
                renderer.create_render_pass_into(existing, descriptor)?;
                existing
            } else {
                renderer.create_render_pass(descriptor)?
            };
            self.nodes[node_handle as usize].render_pass = render_pass;

            for frame_index in 0..MAX_FRAMES_IN_FLIGHT {
                let fb_descriptor =
                    self.frame_buffer_descriptor(node_handle, frame_index, width, height, render_pass);
                let existing = self.nodes[node_handle as usize].frame_buffers[frame_index];
                let frame_buffer = if !existing.is_invalid() && renderer.frame_buffers.is_valid(&existing)
                {
                    renderer.create_frame_buffer_into(existing, fb_descriptor)?;
                    existing
                } else {
                    renderer.create_frame_buffer(fb_descriptor)?
                };
                self.nodes[node_handle as usize].frame_buffers[frame_index] = frame_buffer;
            }
        }
        Ok(())
    }

    /// Viewport resize or MSAA change: recreate every affected texture,
    /// pass, framebuffer and, when the sample count changed, every pipeline
    /// state targeting an affected pass.
    pub fn invalidate(
        &mut self,
        renderer: &Renderer,
        width: u32,
        height: u32,
    ) -> Result<(), HgalError> {
        renderer.driver().wait_idle();
        renderer.set_viewport_extent(width, height);
        self.resolve_extents(renderer);

        for resource_index in 0..self.resources.len() {
            let Some(descriptor) = self.texture_descriptor(resource_index) else {
                continue;
            };
            let ResourceData::Texture { info, textures, .. } =
                &self.resources[resource_index].data
            else {
                continue;
            };
            if !info.resizable && !info.resizable_sample_count {
                continue;
            }
            for texture in textures {
                if !texture.is_invalid() && renderer.textures.is_valid(texture) {
                    renderer.create_texture_into(*texture, descriptor.clone())?;
                }
            }
        }

        let sorted = self.sorted_nodes.clone();
        for node_handle in sorted {
            let node = &self.nodes[node_handle as usize];
            if node.attachments.is_empty() {
                continue;
            }
            let affected = node.attachments.iter().any(|attachment| {
                match &self.resources[attachment.resource as usize].data {
                    ResourceData::Texture { info, .. } => {
                        info.resizable || info.resizable_sample_count
                    }
                    ResourceData::Buffer { .. } => false,
                }
            });
            if !affected {
                continue;
            }
            let sample_changed = node.attachments.iter().any(|attachment| {
                matches!(
                    &self.resources[attachment.resource as usize].data,
                    ResourceData::Texture { info, .. } if info.resizable_sample_count
                )
            });

            let (descriptor, pass_width, pass_height) = self.pass_descriptor(node_handle);
            let new_sample_count = descriptor
                .color_attachments
                .first()
                .map(|attachment| attachment.sample_count)
                .unwrap_or(1);
            let render_pass = self.nodes[node_handle as usize].render_pass;
            if renderer.render_passes.is_valid(&render_pass) {
                renderer.create_render_pass_into(render_pass, descriptor)?;
            }
            for frame_index in 0..MAX_FRAMES_IN_FLIGHT {
                let frame_buffer = self.nodes[node_handle as usize].frame_buffers[frame_index];
                if renderer.frame_buffers.is_valid(&frame_buffer) {
                    let fb_descriptor = self.frame_buffer_descriptor(
                        node_handle,
                        frame_index,
                        pass_width,
                        pass_height,
                        render_pass,
                    );
                    renderer.create_frame_buffer_into(frame_buffer, fb_descriptor)?;
                }
            }

            if sample_changed {
                for pipeline_handle in renderer.pipeline_states.iter_handles() {
                    let descriptor = renderer
                        .pipeline_states
                        .with(&pipeline_handle, |pipeline| pipeline.descriptor.clone())?;
                    if descriptor.render_pass == render_pass {
                        let mut updated = descriptor;
                        updated.sample_count = new_sample_count;
                        renderer.create_pipeline_state_into(pipeline_handle, updated)?;
                    }
                }
            }
        }
        Ok(())
    }
}
