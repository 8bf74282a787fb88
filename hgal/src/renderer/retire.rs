//! Deferred destruction, keyed to the graphics timeline.
//!
//! A ring of [`crate::MAX_FRAMES_IN_FLIGHT`] slots. Non-immediate destroys
//! land in the slot of the frame that may still reference them; the queue
//! drains once the timeline passes the value that frame signaled.

use crate::types::{
    BindGroup, Buffer, FrameBuffer, Material, PipelineState, RenderPass, Sampler, Shader,
    StaticMesh, Texture, UploadRequest,
};
use hearth_containers::Handle;

#[derive(Debug, Clone)]
pub enum DeferredDestroy {
    Buffer(Handle<Buffer>),
    Texture(Handle<Texture>),
    Sampler(Handle<Sampler>),
    Shader(Handle<Shader>),
    PipelineState(Handle<PipelineState>),
    RenderPass(Handle<RenderPass>),
    FrameBuffer(Handle<FrameBuffer>),
    BindGroup(Handle<BindGroup>),
    StaticMesh(Handle<StaticMesh>),
    Material(Handle<Material>),
    UploadRequest(Handle<UploadRequest>),
}

#[derive(Debug, Default)]
struct RetireSlot {
    /// Timeline value signaled by the frame that last used this slot.
    signal_value: u64,
    queue: Vec<DeferredDestroy>,
}

#[derive(Debug)]
pub struct RetireRing {
    slots: Vec<RetireSlot>,
    current: usize,
}

impl RetireRing {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: (0..frames_in_flight).map(|_| RetireSlot::default()).collect(),
            current: 0,
        }
    }

    pub fn push(&mut self, deferred: DeferredDestroy) {
        self.slots[self.current].queue.push(deferred);
    }

    /// Called at submit: the current slot's work retires when the timeline
    /// reaches `signal_value`.
    pub fn seal_current(&mut self, signal_value: u64) {
        self.slots[self.current].signal_value = signal_value;
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Drain every slot whose signal value the timeline has passed.
    pub fn drain_reached(&mut self, timeline_value: u64) -> Vec<DeferredDestroy> {
        let mut drained = Vec::new();
        for slot in &mut self.slots {
            if !slot.queue.is_empty() && timeline_value >= slot.signal_value {
                drained.append(&mut slot.queue);
            }
        }
        drained
    }

    /// Shutdown path: everything, regardless of timeline progress.
    pub fn drain_all(&mut self) -> Vec<DeferredDestroy> {
        let mut drained = Vec::new();
        for slot in &mut self.slots {
            drained.append(&mut slot.queue);
        }
        drained
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().map(|slot| slot.queue.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_after_timeline_reaches_signal() {
        let mut ring = RetireRing::new(3);
        ring.push(DeferredDestroy::Buffer(Handle::INVALID));
        ring.seal_current(5);
        ring.advance();

        assert!(ring.drain_reached(4).is_empty());
        assert_eq!(ring.drain_reached(5).len(), 1);
        assert_eq!(ring.pending(), 0);
    }

    #[test]
    fn slots_retire_independently() {
        let mut ring = RetireRing::new(2);
        ring.push(DeferredDestroy::Buffer(Handle::INVALID));
        ring.seal_current(1);
        ring.advance();
        ring.push(DeferredDestroy::Texture(Handle::INVALID));
        ring.seal_current(2);
        ring.advance();

        assert_eq!(ring.drain_reached(1).len(), 1);
        assert_eq!(ring.drain_reached(1).len(), 0);
        assert_eq!(ring.drain_reached(2).len(), 1);
    }
}
