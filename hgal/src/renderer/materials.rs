//! GPU-side material and static mesh aggregates.
//!
//! A material owns one uniform buffer and one bind group per frame in
//! flight, laid out by the shader's reflected `Material_Properties` struct.
//! A static mesh owns device-local vertex streams and an index buffer,
//! staged through the transfer queue.

use bytemuck::cast_slice;
use tracing::trace;

use hearth_containers::Handle;

use crate::error::HgalError;
use crate::types::*;
use crate::MAX_FRAMES_IN_FLIGHT;

use super::Renderer;

/// Set index material bind groups live at, after globals and per-object data.
pub const MATERIAL_BIND_GROUP_INDEX: u32 = 2;

impl Renderer {
    //
    // Materials
    //

    pub fn create_material(&self, descriptor: MaterialDescriptor) -> Result<MaterialHandle, HgalError> {
        let shader = self
            .pipeline_states
            .with(&descriptor.pipeline_state, |pipeline| pipeline.descriptor.shader)?;
        let properties = self
            .shaders
            .with(&shader, |shader| shader.reflection.material_properties().cloned())?
            .unwrap_or_default();

        let mut buffers = [Handle::INVALID; MAX_FRAMES_IN_FLIGHT];
        let mut bind_groups = [Handle::INVALID; MAX_FRAMES_IN_FLIGHT];
        let size = properties.size.max(4) as u64;
        for frame_index in 0..MAX_FRAMES_IN_FLIGHT {
            buffers[frame_index] = self.create_buffer(BufferDescriptor {
                name: format!("{} properties {frame_index}", descriptor.name),
                size,
                usage: BufferUsage::UNIFORM,
                device_local: false,
            })?;
            bind_groups[frame_index] = self.create_bind_group(BindGroupDescriptor {
                name: format!("{} bind group {frame_index}", descriptor.name),
                shader,
                group_index: MATERIAL_BIND_GROUP_INDEX,
            })?;
        }

        trace!(name = %descriptor.name, size, "created material");
        self.materials
            .acquire(Material {
                name: descriptor.name,
                pipeline_state: descriptor.pipeline_state,
                data: vec![0; properties.size as usize],
                properties,
                buffers,
                bind_groups,
                dirty_count: MAX_FRAMES_IN_FLIGHT as u32,
            })
            .map_err(|_| HgalError::PoolExhausted("material"))
    }

    pub fn destroy_material(&self, handle: MaterialHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_material_now(handle)
        } else {
            self.defer(super::DeferredDestroy::Material(handle));
            Ok(())
        }
    }

    pub(super) fn destroy_material_now(&self, handle: MaterialHandle) -> Result<(), HgalError> {
        let material = self.materials.release(handle)?;
        for buffer in material.buffers {
            if !buffer.is_invalid() {
                self.destroy_buffer(buffer, true)?;
            }
        }
        for bind_group in material.bind_groups {
            if !bind_group.is_invalid() {
                self.destroy_bind_group(bind_group, true)?;
            }
        }
        Ok(())
    }

    /// Write `bytes` into the property named `name`, validated against the
    /// reflected member layout. The change reaches each frame's uniform
    /// buffer through `flush_material`.
    pub fn set_material_property(
        &self,
        handle: MaterialHandle,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), HgalError> {
        self.materials.with_mut(&handle, |material| {
            let member = material
                .properties
                .member(name)
                .ok_or_else(|| HgalError::Driver(format!("material has no property `{name}`")))?;
            let offset = member.offset as usize;
            let size = member.data_type.size() as usize;
            if bytes.len() != size || offset + size > material.data.len() {
                return Err(HgalError::Driver(format!(
                    "property `{name}` expects {size} bytes, got {}",
                    bytes.len()
                )));
            }
            material.data[offset..offset + size].copy_from_slice(bytes);
            material.dirty_count = MAX_FRAMES_IN_FLIGHT as u32;
            Ok(())
        })?
    }

    pub fn set_material_property_f32(
        &self,
        handle: MaterialHandle,
        name: &str,
        value: f32,
    ) -> Result<(), HgalError> {
        self.set_material_property(handle, name, &value.to_le_bytes())
    }

    pub fn set_material_property_u32(
        &self,
        handle: MaterialHandle,
        name: &str,
        value: u32,
    ) -> Result<(), HgalError> {
        self.set_material_property(handle, name, &value.to_le_bytes())
    }

    pub fn set_material_property_vec4(
        &self,
        handle: MaterialHandle,
        name: &str,
        value: glam::Vec4,
    ) -> Result<(), HgalError> {
        self.set_material_property(handle, name, cast_slice(&value.to_array()))
    }

    pub fn material_property_bytes(
        &self,
        handle: MaterialHandle,
        name: &str,
    ) -> Result<Vec<u8>, HgalError> {
        self.materials.with(&handle, |material| {
            material.properties.member(name).map(|member| {
                let offset = member.offset as usize;
                let size = member.data_type.size() as usize;
                material.data[offset..offset + size].to_vec()
            })
        })?
        .ok_or_else(|| HgalError::Driver(format!("material has no property `{name}`")))
    }

    /// Push dirty property data into this frame's uniform buffer.
    pub fn flush_material(&self, handle: MaterialHandle, frame_index: usize) -> Result<(), HgalError> {
        let (dirty, buffer, data) = self.materials.with_mut(&handle, |material| {
            let dirty = material.dirty_count > 0;
            if dirty {
                material.dirty_count -= 1;
            }
            (dirty, material.buffers[frame_index], material.data.clone())
        })?;
        if dirty && !buffer.is_invalid() && !data.is_empty() {
            self.write_buffer(buffer, 0, &data)?;
        }
        Ok(())
    }

    //
    // Static meshes
    //

    pub fn create_static_mesh(
        &self,
        descriptor: StaticMeshDescriptor,
    ) -> Result<StaticMeshHandle, HgalError> {
        let vertex_count = descriptor.positions.len() as u32;
        let index_count = descriptor.indices.len() as u32;

        let position_buffer = self.create_vertex_stream(
            &descriptor.name,
            "positions",
            cast_slice(&descriptor.positions),
        )?;
        let normal_buffer =
            self.create_vertex_stream(&descriptor.name, "normals", cast_slice(&descriptor.normals))?;
        let uv_buffer = self.create_vertex_stream(&descriptor.name, "uvs", cast_slice(&descriptor.uvs))?;
        let tangent_buffer = self.create_vertex_stream(
            &descriptor.name,
            "tangents",
            cast_slice(&descriptor.tangents),
        )?;

        let index_bytes: &[u8] = cast_slice(&descriptor.indices);
        let index_buffer = self.create_buffer(BufferDescriptor {
            name: format!("{} indices", descriptor.name),
            size: index_bytes.len().max(4) as u64,
            usage: BufferUsage::INDEX | BufferUsage::TRANSFER,
            device_local: true,
        })?;
        let upload_request =
            self.stage_buffer_upload(&descriptor.name, index_buffer, index_bytes)?;

        trace!(name = %descriptor.name, vertex_count, index_count, "created static mesh");
        self.static_meshes
            .acquire(StaticMesh {
                name: descriptor.name,
                vertex_count,
                index_count,
                position_buffer,
                normal_buffer,
                uv_buffer,
                tangent_buffer,
                index_buffer,
                upload_request,
            })
            .map_err(|_| HgalError::PoolExhausted("static mesh"))
    }

    fn create_vertex_stream(
        &self,
        mesh_name: &str,
        stream: &str,
        bytes: &[u8],
    ) -> Result<BufferHandle, HgalError> {
        let buffer = self.create_buffer(BufferDescriptor {
            name: format!("{mesh_name} {stream}"),
            size: bytes.len().max(4) as u64,
            usage: BufferUsage::VERTEX | BufferUsage::TRANSFER,
            device_local: true,
        })?;
        if !bytes.is_empty() {
            let request = self.stage_buffer_upload(mesh_name, buffer, bytes)?;
            // vertex streams share the mesh's gating value; the per-stream
            // request only owns its staging memory
            self.destroy_upload_request(request)?;
        }
        Ok(buffer)
    }

    pub fn destroy_static_mesh(&self, handle: StaticMeshHandle, immediate: bool) -> Result<(), HgalError> {
        if immediate {
            self.destroy_static_mesh_now(handle)
        } else {
            self.defer(super::DeferredDestroy::StaticMesh(handle));
            Ok(())
        }
    }

    pub(super) fn destroy_static_mesh_now(&self, handle: StaticMeshHandle) -> Result<(), HgalError> {
        let mesh = self.static_meshes.release(handle)?;
        for buffer in [
            mesh.position_buffer,
            mesh.normal_buffer,
            mesh.uv_buffer,
            mesh.tangent_buffer,
            mesh.index_buffer,
        ] {
            if !buffer.is_invalid() {
                self.destroy_buffer(buffer, true)?;
            }
        }
        if !mesh.upload_request.is_invalid() {
            let _ = self.destroy_upload_request(mesh.upload_request);
        }
        Ok(())
    }
}
