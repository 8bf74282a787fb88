//! Frame driver: ties the timeline wait, descriptor reset, swapchain
//! acquire, render graph execution, presentation copy, submission and
//! present into one per-frame sequence, bounded to
//! [`crate::MAX_FRAMES_IN_FLIGHT`] concurrent frames.

use std::sync::Arc;

use tracing::warn;

use crate::driver::{AcquireStatus, PipelineStage, PresentStatus, RawCommandBuffer, SemaphoreOp};
use crate::error::HgalError;
use crate::graph::RenderGraph;
use crate::renderer::{FinishedAllocationGroup, Renderer};
use crate::types::SemaphoreHandle;
use crate::MAX_FRAMES_IN_FLIGHT;

pub struct FrameDriver {
    renderer: Arc<Renderer>,
    image_available: [SemaphoreHandle; MAX_FRAMES_IN_FLIGHT],
    rendering_finished: [SemaphoreHandle; MAX_FRAMES_IN_FLIGHT],
    current_image_index: u32,
    command_buffer: Option<RawCommandBuffer>,
    tracy: tracy_client::Client,
}

impl std::fmt::Debug for FrameDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDriver")
            .field("current_image_index", &self.current_image_index)
            .finish()
    }
}

/// What `begin_frame` hands back to the engine: the uploads that finished
/// since last frame, keyed by the tag the engine supplied.
#[derive(Debug, Default)]
pub struct FrameBegin {
    pub finished_allocation_groups: Vec<FinishedAllocationGroup>,
}

impl FrameDriver {
    pub fn new(renderer: Arc<Renderer>) -> Result<Self, HgalError> {
        let mut image_available = [SemaphoreHandle::INVALID; MAX_FRAMES_IN_FLIGHT];
        let mut rendering_finished = [SemaphoreHandle::INVALID; MAX_FRAMES_IN_FLIGHT];
        for frame_index in 0..MAX_FRAMES_IN_FLIGHT {
            image_available[frame_index] = renderer.create_semaphore(false, 0)?;
            rendering_finished[frame_index] = renderer.create_semaphore(false, 0)?;
        }
        Ok(Self {
            renderer,
            image_available,
            rendering_finished,
            current_image_index: 0,
            command_buffer: None,
            tracy: tracy_client::Client::start(),
        })
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    /// Steps 1-4 of the frame: timeline wait, retire drain, descriptor
    /// reset, allocation group poll, swapchain acquire, command begin.
    pub fn begin_frame(&mut self) -> Result<FrameBegin, HgalError> {
        self.renderer.wait_for_frame_slot()?;
        self.renderer.drain_retired()?;

        let frame_index = self.renderer.current_frame_index();
        self.renderer.reset_frame_descriptors(frame_index)?;

        let finished_allocation_groups = self.renderer.poll_allocation_groups()?;

        let driver = self.renderer.driver().clone();
        let image_available = self.renderer.semaphore_raw(&self.image_available[frame_index])?;
        self.current_image_index = match driver.acquire_next_image(image_available)? {
            AcquireStatus::Success { image_index } | AcquireStatus::Suboptimal { image_index } => {
                image_index
            }
            AcquireStatus::OutOfDate => {
                self.recreate_swapchain(None)?;
                match driver.acquire_next_image(image_available)? {
                    AcquireStatus::Success { image_index }
                    | AcquireStatus::Suboptimal { image_index } => image_index,
                    AcquireStatus::OutOfDate => return Err(HgalError::SwapchainOutOfDate),
                }
            }
        };

        self.command_buffer = Some(self.renderer.begin_command_recording()?);
        Ok(FrameBegin {
            finished_allocation_groups,
        })
    }

    /// Step 5: execute the compiled render graph.
    pub fn render(&mut self, graph: &mut RenderGraph) -> Result<(), HgalError> {
        graph.render(&self.renderer)
    }

    /// Steps 6-9: copy the presentable attachment into the swapchain image,
    /// submit, present, advance the timeline and frame index.
    pub fn end_frame(&mut self, graph: &RenderGraph) -> Result<(), HgalError> {
        let frame_index = self.renderer.current_frame_index();
        let driver = self.renderer.driver().clone();
        let command_buffer = self.command_buffer.take().ok_or(HgalError::NoActiveCommandBuffer)?;

        let presentable = graph.presentable_attachment(frame_index);
        let (width, height) = driver.swapchain_extent();
        if !presentable.is_invalid() {
            let swapchain_image = driver.swapchain_image(self.current_image_index);
            self.renderer
                .copy_texture_to_swapchain(presentable, swapchain_image, width, height)?;
        }

        let image_available = self.renderer.semaphore_raw(&self.image_available[frame_index])?;
        let rendering_finished = self.renderer.semaphore_raw(&self.rendering_finished[frame_index])?;
        self.renderer.submit_frame(
            command_buffer,
            &[SemaphoreOp {
                semaphore: image_available,
                value: 0,
                stage: PipelineStage::ColorAttachmentOutput,
            }],
            &[SemaphoreOp {
                semaphore: rendering_finished,
                value: 0,
                stage: PipelineStage::ColorAttachmentOutput,
            }],
        )?;

        match driver.present(rendering_finished, self.current_image_index)? {
            PresentStatus::Success => {}
            PresentStatus::OutOfDate | PresentStatus::Suboptimal => {
                if width != 0 && height != 0 {
                    warn!("swapchain out of date at present, recreating");
                    self.recreate_swapchain(Some((width, height)))?;
                }
            }
        }

        self.renderer.advance_frame();
        self.tracy.frame_mark();
        Ok(())
    }

    /// Convenience wrapper: one whole frame.
    pub fn run_frame(&mut self, graph: &mut RenderGraph) -> Result<FrameBegin, HgalError> {
        let begin = self.begin_frame()?;
        self.render(graph)?;
        self.end_frame(graph)?;
        Ok(begin)
    }

    fn recreate_swapchain(&self, extent: Option<(u32, u32)>) -> Result<(), HgalError> {
        let driver = self.renderer.driver();
        driver.wait_idle();
        let (width, height) = extent.unwrap_or_else(|| driver.swapchain_extent());
        driver.recreate_swapchain(width, height)
    }

    /// Viewport resize: flush the device, recreate the swapchain, then
    /// invalidate the graph's resizable resources.
    pub fn resize(
        &mut self,
        graph: &mut RenderGraph,
        width: u32,
        height: u32,
    ) -> Result<(), HgalError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let driver = self.renderer.driver();
        driver.wait_idle();
        driver.recreate_swapchain(width, height)?;
        graph.invalidate(&self.renderer, width, height)
    }

    /// Shutdown: wait idle, drain every retire slot, release the frame
    /// semaphores.
    pub fn shutdown(&mut self) -> Result<(), HgalError> {
        self.renderer.wait_idle_and_drain()?;
        for semaphore in self
            .image_available
            .iter_mut()
            .chain(self.rendering_finished.iter_mut())
        {
            let handle = std::mem::replace(semaphore, SemaphoreHandle::INVALID);
            if !handle.is_invalid() {
                let _ = self.renderer.destroy_semaphore(handle);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::NullDriver;
    use crate::graph::RenderTargetInfo;
    use crate::types::{AttachmentOperation, ClearValue};

    fn frame_driver() -> (FrameDriver, Arc<NullDriver>, Arc<Renderer>) {
        let driver = Arc::new(NullDriver::new(640, 480));
        let renderer = Arc::new(Renderer::new(driver.clone()).unwrap());
        (FrameDriver::new(renderer.clone()).unwrap(), driver, renderer)
    }

    fn presentable_graph(renderer: &Renderer) -> RenderGraph {
        let mut graph = RenderGraph::new();
        let node = graph.add_graphics_node("scene", Box::new(|_| Ok(()))).unwrap();
        graph
            .add_render_target(
                node,
                "scene_color",
                RenderTargetInfo::default(),
                AttachmentOperation::Clear,
                ClearValue::default(),
            )
            .unwrap();
        graph.set_presentable_attachment("scene_color").unwrap();
        graph.compile(renderer).unwrap();
        graph
    }

    #[test]
    fn timeline_advances_once_per_frame() {
        let (mut frame_driver, _, renderer) = frame_driver();
        let mut graph = presentable_graph(&renderer);
        let initial = renderer.timeline_value();
        for _ in 0..1000 {
            frame_driver.run_frame(&mut graph).unwrap();
        }
        assert_eq!(renderer.timeline_value(), initial + 1000);
        assert_eq!(renderer.observed_timeline_value(), initial + 1000);
    }

    #[test]
    fn frame_index_cycles_through_frames_in_flight() {
        let (mut frame_driver, _, renderer) = frame_driver();
        let mut graph = presentable_graph(&renderer);
        let mut seen = Vec::new();
        for _ in 0..MAX_FRAMES_IN_FLIGHT * 2 {
            seen.push(renderer.current_frame_index());
            frame_driver.run_frame(&mut graph).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn out_of_date_acquire_recreates_swapchain() {
        let (mut frame_driver, driver, renderer) = frame_driver();
        let mut graph = presentable_graph(&renderer);
        driver.force_acquire_status(AcquireStatus::OutOfDate);
        frame_driver.run_frame(&mut graph).unwrap();
        assert_eq!(renderer.timeline_value(), 1);
    }

    #[test]
    fn out_of_date_present_recreates_swapchain() {
        let (mut frame_driver, driver, renderer) = frame_driver();
        let mut graph = presentable_graph(&renderer);
        driver.force_present_status(PresentStatus::OutOfDate);
        frame_driver.run_frame(&mut graph).unwrap();
        frame_driver.run_frame(&mut graph).unwrap();
        assert_eq!(renderer.timeline_value(), 2);
    }

    #[test]
    fn presentable_copy_is_recorded() {
        use crate::driver::Command;
        let (mut frame_driver, driver, renderer) = frame_driver();
        let mut graph = presentable_graph(&renderer);
        driver.drain_executed_commands();
        frame_driver.run_frame(&mut graph).unwrap();
        let commands = driver.drain_executed_commands();
        assert!(commands
            .iter()
            .any(|command| matches!(command, Command::CopyTexture { .. })));
        assert!(commands
            .iter()
            .any(|command| matches!(command, Command::BeginRenderPass { .. })));
    }

    #[test]
    fn device_lost_is_fatal() {
        let (mut frame_driver, driver, renderer) = frame_driver();
        let mut graph = presentable_graph(&renderer);
        driver.set_device_lost(true);
        assert_eq!(
            frame_driver.run_frame(&mut graph).unwrap_err(),
            HgalError::DeviceLost
        );
    }
}
