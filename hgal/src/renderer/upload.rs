//! Transfer-queue upload sequencing.
//!
//! Initial resource data is staged into a host-visible buffer, copied on the
//! dedicated transfer queue, and gated by the transfer timeline: the
//! resource is not safe to read until the timeline reaches the upload's
//! target value. Resources staged during one load are grouped into an
//! allocation group; the frame driver polls groups at frame begin and the
//! owner commits results only for finished groups.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::driver::{Command, ImageLayout, PipelineStage, QueueKind, SemaphoreOp};
use crate::error::HgalError;
use crate::types::*;

use super::Renderer;

/// A batch of staged resources gated by one transfer timeline value.
#[derive(Debug, Clone)]
pub struct AllocationGroup {
    pub name: String,
    /// Caller-side correlation key (the asset UUID, for the engine).
    pub tag: u64,
    pub target_value: u64,
}

#[derive(Debug, Clone)]
pub struct FinishedAllocationGroup {
    pub name: String,
    pub tag: u64,
}

impl Renderer {
    /// Reserve the next transfer-timeline value for a submission.
    fn reserve_transfer_value(&self) -> u64 {
        self.transfer_cursor.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn stage_texture_upload(
        &self,
        handle: TextureHandle,
        descriptor: &TextureDescriptor,
    ) -> Result<UploadRequestHandle, HgalError> {
        let total_size: u64 = descriptor.data.iter().map(|layer| layer.len() as u64).sum();
        let staging = self.create_buffer(BufferDescriptor {
            name: format!("{} staging", descriptor.name),
            size: total_size,
            usage: BufferUsage::TRANSFER,
            device_local: false,
        })?;

        let mut offset = 0u64;
        for layer in &descriptor.data {
            self.write_buffer(staging, offset, layer)?;
            offset += layer.len() as u64;
        }

        let staging_raw = self.buffers.with(&staging, |buffer| buffer.raw)?;
        let texture_raw = self.textures.with(&handle, |texture| texture.raw)?;
        let mip_levels = self.textures.with(&handle, |texture| texture.mip_levels)?;

        let command_buffer = self.transfer_command_buffer()?;
        self.driver().begin_command_buffer(command_buffer);
        self.driver().record(
            command_buffer,
            Command::TransitionTexture {
                texture: texture_raw,
                from: ImageLayout::Undefined,
                to: ImageLayout::TransferDst,
            },
        );
        for (layer, _) in descriptor.data.iter().enumerate() {
            self.driver().record(
                command_buffer,
                Command::CopyBufferToTexture {
                    src: staging_raw,
                    dst: texture_raw,
                    layer: layer as u32,
                    width: descriptor.width,
                    height: descriptor.height,
                },
            );
        }
        if descriptor.mipmapping && mip_levels > 1 {
            // chained blit down the mip chain
            for mip in 1..mip_levels {
                self.driver().record(
                    command_buffer,
                    Command::BlitMip {
                        texture: texture_raw,
                        src_mip: mip - 1,
                        dst_mip: mip,
                    },
                );
            }
        }
        self.driver().record(
            command_buffer,
            Command::TransitionTexture {
                texture: texture_raw,
                from: ImageLayout::TransferDst,
                to: ImageLayout::ShaderRead,
            },
        );
        self.driver().end_command_buffer(command_buffer);

        let target_value = self.submit_transfer(command_buffer)?;
        trace!(name = %descriptor.name, target_value, "staged texture upload");

        self.upload_requests
            .acquire(UploadRequest {
                name: descriptor.name.clone(),
                semaphore: self.transfer_timeline,
                target_value,
                staging,
            })
            .map_err(|_| HgalError::PoolExhausted("upload request"))
    }

    pub(crate) fn stage_buffer_upload(
        &self,
        name: &str,
        destination: BufferHandle,
        data: &[u8],
    ) -> Result<UploadRequestHandle, HgalError> {
        let staging = self.create_buffer(BufferDescriptor {
            name: format!("{name} staging"),
            size: data.len() as u64,
            usage: BufferUsage::TRANSFER,
            device_local: false,
        })?;
        self.write_buffer(staging, 0, data)?;

        let staging_raw = self.buffers.with(&staging, |buffer| buffer.raw)?;
        let destination_raw = self.buffers.with(&destination, |buffer| buffer.raw)?;

        let command_buffer = self.transfer_command_buffer()?;
        self.driver().begin_command_buffer(command_buffer);
        self.driver().record(
            command_buffer,
            Command::CopyBufferToBuffer {
                src: staging_raw,
                dst: destination_raw,
                src_offset: 0,
                dst_offset: 0,
                size: data.len() as u64,
            },
        );
        self.driver().end_command_buffer(command_buffer);

        let target_value = self.submit_transfer(command_buffer)?;
        self.upload_requests
            .acquire(UploadRequest {
                name: name.to_string(),
                semaphore: self.transfer_timeline,
                target_value,
                staging,
            })
            .map_err(|_| HgalError::PoolExhausted("upload request"))
    }

    fn submit_transfer(&self, command_buffer: crate::driver::RawCommandBuffer) -> Result<u64, HgalError> {
        let target_value = self.reserve_transfer_value();
        let _guard = self
            .render_commands_mutex()
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        self.driver().submit(
            QueueKind::Transfer,
            &[command_buffer],
            &[],
            &[SemaphoreOp {
                semaphore: self.transfer_timeline,
                value: target_value,
                stage: PipelineStage::Transfer,
            }],
        )?;
        Ok(target_value)
    }

    pub fn destroy_upload_request(&self, handle: UploadRequestHandle) -> Result<(), HgalError> {
        let request = self.upload_requests.release(handle)?;
        if !request.staging.is_invalid() {
            let buffer = self.buffers.release(request.staging)?;
            self.driver().destroy_buffer(buffer.raw);
        }
        Ok(())
    }

    /// True once the upload's transfer timeline target has been reached.
    pub fn is_upload_finished(&self, handle: UploadRequestHandle) -> Result<bool, HgalError> {
        let (semaphore, target_value) = self
            .upload_requests
            .with(&handle, |request| (request.semaphore, request.target_value))?;
        Ok(self.driver().semaphore_value(semaphore) >= target_value)
    }

    /// Open an allocation group covering every upload staged so far: its
    /// target is the current transfer cursor.
    pub fn submit_allocation_group(&self, name: &str, tag: u64) -> Result<(), HgalError> {
        let target_value = self.transfer_cursor.load(Ordering::Acquire);
        self.allocation_groups.lock()?.push(AllocationGroup {
            name: name.to_string(),
            tag,
            target_value,
        });
        Ok(())
    }

    /// Remove and return every group whose timeline target has been reached.
    /// Polled by the frame driver at frame begin.
    pub fn poll_allocation_groups(&self) -> Result<Vec<FinishedAllocationGroup>, HgalError> {
        let observed = self.driver().semaphore_value(self.transfer_timeline);
        let mut groups = self.allocation_groups.lock()?;
        let mut finished = Vec::new();
        groups.retain(|group| {
            if observed >= group.target_value {
                finished.push(FinishedAllocationGroup {
                    name: group.name.clone(),
                    tag: group.tag,
                });
                false
            } else {
                true
            }
        });
        Ok(finished)
    }

    pub fn pending_allocation_groups(&self) -> usize {
        self.allocation_groups.lock().map(|groups| groups.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NullDriver;
    use std::sync::Arc;

    fn renderer_with_driver() -> (Renderer, Arc<NullDriver>) {
        let driver = Arc::new(NullDriver::default());
        (Renderer::new(driver.clone()).unwrap(), driver)
    }

    #[test]
    fn texture_with_data_gets_an_upload_request() {
        let (renderer, driver) = renderer_with_driver();
        let pixels = vec![255u8; 4 * 4 * 4];
        let handle = renderer
            .create_texture(TextureDescriptor {
                name: "wood".into(),
                width: 4,
                height: 4,
                data: vec![pixels.clone()],
                ..Default::default()
            })
            .unwrap();
        let upload = renderer
            .textures
            .with(&handle, |texture| texture.upload_request)
            .unwrap();
        assert!(!upload.is_invalid());
        assert!(renderer.is_upload_finished(upload).unwrap());

        // the copy actually landed in the texture
        let raw = renderer.textures.with(&handle, |texture| texture.raw).unwrap();
        assert_eq!(driver.texture_layer_data(raw, 0).unwrap(), pixels);
    }

    #[test]
    fn allocation_group_finishes_with_timeline() {
        let (renderer, _driver) = renderer_with_driver();
        let handle = renderer
            .create_texture(TextureDescriptor {
                name: "albedo".into(),
                width: 2,
                height: 2,
                data: vec![vec![0u8; 16]],
                ..Default::default()
            })
            .unwrap();
        renderer.submit_allocation_group("albedo", 42).unwrap();
        let finished = renderer.poll_allocation_groups().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].tag, 42);
        assert_eq!(renderer.pending_allocation_groups(), 0);
        drop(handle);
    }

    #[test]
    fn destroy_upload_request_reclaims_staging() {
        let (renderer, _) = renderer_with_driver();
        let buffers_before = renderer.buffers.len();
        let handle = renderer
            .create_texture(TextureDescriptor {
                name: "t".into(),
                width: 2,
                height: 2,
                data: vec![vec![0u8; 16]],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(renderer.buffers.len(), buffers_before + 1);
        let upload = renderer
            .textures
            .with(&handle, |texture| texture.upload_request)
            .unwrap();
        renderer.destroy_upload_request(upload).unwrap();
        assert_eq!(renderer.buffers.len(), buffers_before);
        // texture destruction must not try to free the request twice
        renderer
            .textures
            .with_mut(&handle, |texture| texture.upload_request = hearth_containers::Handle::INVALID)
            .unwrap();
        renderer.destroy_texture(handle, true).unwrap();
    }
}
