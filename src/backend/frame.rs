// Frame synchronizer - the per-frame recording and submission loop
//
// Frame flow:
//   begin_frame  -> wait slot fence, acquire image
//   begin_batch  -> start render pass (clear on batch 0, load afterwards)
//   ...draws...
//   end_batch    -> submit, chained on the previous batch's semaphore
//   end_frame    -> hand the slot fence to the queue
//   present      -> queue the image, advance to the next slot

use ash::vk;
use std::sync::Arc;

use super::buffer::AllocatedBuffer;
use super::context::GraphicsContext;
use super::descriptors::{ResourceBindingTable, TextureId};
use super::pipeline::{PipelineDesc, PipelineId, PipelineTable};
use super::swapchain::{AcquireOutcome, SurfaceSwapchain};
use super::sync::{BatchChain, FrameSlot, FrameState, FrameStateMachine, SlotRing};
use super::LogicalDevice;
use crate::config::GraphicsConfig;
use crate::error::{GraphicsError, Result};

/// Handed back by `begin_frame` when there is an image to draw into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub slot: usize,
    pub image_index: u32,
    pub extent: vk::Extent2D,
    pub frame_number: u64,
}

/// What `begin_frame` does with an acquire result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireAction {
    /// Draw into the image. `rebuild_next` schedules a rebuild before the
    /// following frame.
    Draw { image_index: u32, rebuild_next: bool },
    /// Nothing was acquired; rebuild now and skip the frame.
    RebuildAndSkip,
}

fn on_acquire(outcome: AcquireOutcome) -> AcquireAction {
    match outcome {
        AcquireOutcome::Acquired { index, suboptimal } => AcquireAction::Draw {
            image_index: index,
            rebuild_next: suboptimal,
        },
        AcquireOutcome::OutOfDate => AcquireAction::RebuildAndSkip,
    }
}

fn needs_rebuild(resize_pending: bool, stale: bool) -> bool {
    resize_pending || stale
}

/// Whether `end_frame` hands the slot fence to the queue.
fn fences_at_end_frame(batches: usize) -> bool {
    batches > 0
}

/// Per-batch recording state.
#[derive(Debug, Default)]
struct BatchRecording {
    pipeline: Option<PipelineId>,
    // Texture list written into the batch's set at its first draw.
    committed: Option<Vec<TextureId>>,
}

pub struct FrameSynchronizer {
    state: FrameStateMachine,
    chain: Option<BatchChain>,
    batch: BatchRecording,
    ring: SlotRing,
    window_extent: vk::Extent2D,
    resize_pending: bool,
    frame_number: u64,

    // Drop order: everything that references the device or the swapchain's
    // render passes goes first. `Drop` waits for the GPU before any of it.
    slots: Vec<FrameSlot>,
    pipelines: PipelineTable,
    bindings: ResourceBindingTable,
    swapchain: SurfaceSwapchain,
    device: Arc<LogicalDevice>,
}

impl FrameSynchronizer {
    pub fn new(
        context: &GraphicsContext,
        config: &GraphicsConfig,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let device = context.device().clone();
        let frames = config.frames_in_flight;

        let swapchain =
            SurfaceSwapchain::create(context, window_extent, config.swapchain_preferences())?;
        let bindings = ResourceBindingTable::new(&device, config)?;
        let pipelines = PipelineTable::new(&device);
        let slots = (0..frames)
            .map(|_| FrameSlot::new(&device))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Frame synchronizer ready: {} frames in flight", frames);

        Ok(Self {
            state: FrameStateMachine::default(),
            chain: None,
            batch: BatchRecording::default(),
            ring: SlotRing::new(frames),
            window_extent,
            resize_pending: false,
            frame_number: 0,
            slots,
            pipelines,
            bindings,
            swapchain,
            device,
        })
    }

    // ========================================================================
    // Frame lifecycle
    // ========================================================================

    /// Waits for the current slot and acquires an image.
    ///
    /// `Ok(None)` means there is nothing to draw into this time (minimized
    /// window or a swapchain that had to be rebuilt); skip the frame.
    pub fn begin_frame(&mut self) -> Result<Option<FrameInfo>> {
        if self.state.state() != FrameState::Idle {
            return Err(GraphicsError::InvalidFrameState {
                op: "begin_frame",
                state: self.state.state().name(),
            });
        }

        if needs_rebuild(self.resize_pending, self.swapchain.is_stale()) {
            self.swapchain.recreate(self.window_extent)?;
            self.resize_pending = false;
            if self.swapchain.is_stale() {
                return Ok(None);
            }
        }

        let slot = self.ring.current();
        let frame = &self.slots[slot];

        // ─── Wait until the GPU is done with this slot ─────────────────
        unsafe {
            self.device
                .device
                .wait_for_fences(&[frame.in_flight.raw()], true, u64::MAX)
        }
        .map_err(|e| GraphicsError::frame(e, GraphicsError::WaitingForFence))?;
        self.ring.retire(slot);

        // ─── Acquire ───────────────────────────────────────────────────
        let outcome = self
            .swapchain
            .acquire_next_image(frame.image_available.raw())?;
        let image_index = match on_acquire(outcome) {
            AcquireAction::Draw {
                image_index,
                rebuild_next,
            } => {
                if rebuild_next {
                    self.resize_pending = true;
                    self.swapchain.invalidate();
                }
                image_index
            }
            AcquireAction::RebuildAndSkip => {
                // The fence was not reset, so the slot stays reusable.
                log::debug!("Swapchain out of date on acquire, rebuilding");
                self.swapchain.invalidate();
                self.swapchain.recreate(self.window_extent)?;
                return Ok(None);
            }
        };

        self.state.begin_frame(image_index)?;
        self.chain = Some(BatchChain::new(
            frame.image_available.raw(),
            frame.render_finished.raw(),
        ));
        self.bindings.open_slot(slot);

        Ok(Some(FrameInfo {
            slot,
            image_index,
            extent: self.swapchain.extent(),
            frame_number: self.frame_number,
        }))
    }

    /// Opens a render pass over the acquired image.
    ///
    /// The frame state only moves to `Recording` once the command buffer
    /// is begun, so a failure here leaves the frame where it was.
    pub fn begin_batch(&mut self) -> Result<()> {
        let (image_index, batch) = self.state.next_batch()?;
        self.bindings.descriptor_set(self.ring.current(), batch)?;
        self.begin_pass(image_index, batch)?;
        self.state.begin_batch()?;
        self.batch = BatchRecording::default();
        Ok(())
    }

    /// Resets and begins batch `batch`'s command buffer inside a render pass
    /// over `image_index`: clear on batch 0, load afterwards.
    fn begin_pass(&mut self, image_index: u32, batch: usize) -> Result<vk::CommandBuffer> {
        let cmd = self.slots[self.ring.current()].command_buffer(&self.device, batch)?;

        let extent = self.swapchain.extent();
        let (render_pass, clear_values) = if batch == 0 {
            let clear = vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.swapchain.clear_color(),
                },
            };
            (self.swapchain.clear_pass(), vec![clear])
        } else {
            (self.swapchain.load_pass(), Vec::new())
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(self.swapchain.framebuffer(image_index))
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| GraphicsError::frame(e, GraphicsError::ResettingCommandBuffer))?;
            self.device
                .device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| GraphicsError::frame(e, GraphicsError::BeginningCommandBuffer))?;
            self.device.device.cmd_begin_render_pass(
                cmd,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            self.device.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
        Ok(cmd)
    }

    /// Closes the batch's render pass and submits it.
    pub fn end_batch(&mut self) -> Result<()> {
        let (_, batch) = self.recording("end_batch")?;
        let cmd = self.slots[self.ring.current()].command_buffer(&self.device, batch)?;
        self.state.end_batch()?;
        self.submit_pass(cmd, "end_batch")
    }

    /// Ends `cmd`'s render pass and submits it as the chain's next link.
    fn submit_pass(&mut self, cmd: vk::CommandBuffer, op: &'static str) -> Result<()> {
        let submit = self
            .chain
            .as_mut()
            .ok_or(GraphicsError::InvalidFrameState { op, state: "Idle" })?
            .next();

        unsafe {
            self.device.device.cmd_end_render_pass(cmd);
            self.device
                .device
                .end_command_buffer(cmd)
                .map_err(|e| GraphicsError::frame(e, GraphicsError::EndingCommandBuffer))?;
        }

        let wait_semaphores = [submit.wait];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [submit.signal];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                vk::Fence::null(),
            )
        }
        .map_err(|e| GraphicsError::frame(e, GraphicsError::SubmittingDrawCommand))?;
        Ok(())
    }

    /// Hands the slot fence to the queue behind every batch of the frame.
    pub fn end_frame(&mut self) -> Result<()> {
        let batches = self.state.end_frame()?;
        if !fences_at_end_frame(batches) {
            // Nothing submitted; the fence stays signaled.
            return Ok(());
        }
        self.fence_slot()
    }

    /// Resets the slot fence and signals it once all earlier work on the
    /// queue has completed.
    fn fence_slot(&mut self) -> Result<()> {
        let slot = self.ring.current();
        let fence = self.slots[slot].in_flight.raw();
        unsafe {
            self.device
                .device
                .reset_fences(&[fence])
                .map_err(|e| GraphicsError::frame(e, GraphicsError::ResettingFence))?;
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[], fence)
                .map_err(|e| GraphicsError::frame(e, GraphicsError::SubmittingDrawCommand))?;
        }
        self.ring.submit(slot);
        Ok(())
    }

    /// Queues the image for display and moves to the next slot.
    ///
    /// A frame that recorded no batch still gets a clear-only pass here, so
    /// the image reaches the present layout and presentation waits on a
    /// fenced submission rather than directly on acquisition.
    pub fn present(&mut self) -> Result<()> {
        let image_index = match self.state.state() {
            FrameState::Submitted { image_index, .. } => image_index,
            other => {
                return Err(GraphicsError::InvalidFrameState {
                    op: "present",
                    state: other.name(),
                })
            }
        };
        let needs_clear = self
            .chain
            .as_ref()
            .is_some_and(|chain| chain.needs_clear_pass());
        if needs_clear {
            let cmd = self.begin_pass(image_index, 0)?;
            self.submit_pass(cmd, "present")?;
            self.fence_slot()?;
        }

        self.state.present()?;
        self.bindings.close_slot();
        let wait = self
            .chain
            .take()
            .map(|chain| chain.present_wait())
            .ok_or(GraphicsError::InvalidFrameState {
                op: "present",
                state: "Idle",
            })?;

        let outcome = self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[wait],
        )?;
        if outcome.wants_recreate() {
            log::debug!("Present reported {:?}, rebuilding next frame", outcome);
            self.swapchain.invalidate();
        }

        self.ring.advance();
        self.frame_number += 1;
        Ok(())
    }

    /// Records the new window size; the swapchain follows at the next frame.
    pub fn notify_resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.resize_pending = true;
    }

    // ========================================================================
    // Recording
    // ========================================================================

    fn recording(&self, op: &'static str) -> Result<(u32, usize)> {
        self.state
            .recording()
            .ok_or(GraphicsError::InvalidFrameState {
                op,
                state: self.state.state().name(),
            })
    }

    fn current_command_buffer(&mut self, op: &'static str) -> Result<vk::CommandBuffer> {
        let (_, batch) = self.recording(op)?;
        let slot = self.ring.current();
        self.slots[slot].command_buffer(&self.device, batch)
    }

    pub fn bind_pipeline(&mut self, id: PipelineId) -> Result<()> {
        let cmd = self.current_command_buffer("bind_pipeline")?;
        let pipeline = self.pipelines.get(id)?;
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.raw())
        };
        self.batch.pipeline = Some(id);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, buffer: &AllocatedBuffer) -> Result<()> {
        let cmd = self.current_command_buffer("bind_vertex_buffer")?;
        unsafe {
            self.device
                .device
                .cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer], &[0])
        };
        Ok(())
    }

    pub fn bind_index_buffer(&mut self, buffer: &AllocatedBuffer, index_type: vk::IndexType) -> Result<()> {
        let cmd = self.current_command_buffer("bind_index_buffer")?;
        unsafe {
            self.device
                .device
                .cmd_bind_index_buffer(cmd, buffer.buffer, 0, index_type)
        };
        Ok(())
    }

    pub fn push_constants(&mut self, data: &[u8]) -> Result<()> {
        let cmd = self.current_command_buffer("push_constants")?;
        let id = self.batch.pipeline.ok_or(GraphicsError::NoPipelineBound)?;
        let pipeline = self.pipelines.get(id)?;
        pipeline.check_push_constants(data)?;
        unsafe {
            self.device.device.cmd_push_constants(
                cmd,
                pipeline.layout(),
                pipeline.push_constant_stages(),
                0,
                data,
            )
        };
        Ok(())
    }

    /// Draws with the bound pipeline, uniform and texture list.
    ///
    /// The batch's descriptor set is written and bound at its first draw.
    /// Later draws in the same batch must see the same texture list; bind
    /// every texture a batch needs before drawing it.
    pub fn draw_indexed(&mut self, index_count: u32) -> Result<()> {
        let cmd = self.current_command_buffer("draw_indexed")?;
        let (_, batch) = self.recording("draw_indexed")?;
        let slot = self.ring.current();
        let id = self.batch.pipeline.ok_or(GraphicsError::NoPipelineBound)?;
        let layout = self.pipelines.get(id)?.layout();

        if self.batch.committed.is_none() {
            self.bindings.commit_texture_bind(slot, batch)?;
            self.batch.committed = Some(self.bindings.bound_textures().to_vec());
        } else if self.batch.committed.as_deref() != Some(self.bindings.bound_textures()) {
            return Err(GraphicsError::TexturesChangedMidBatch);
        }

        // Bound per draw: a pipeline switch may have changed the layout.
        let set = self.bindings.descriptor_set(slot, batch)?;
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[set],
                &[],
            );
            self.device
                .device
                .cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
        }
        Ok(())
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Builds a pipeline compatible with every batch's render pass.
    pub fn push_pipeline(&mut self, desc: &PipelineDesc) -> Result<PipelineId> {
        self.pipelines
            .push(desc, self.swapchain.clear_pass(), self.bindings.layout())
    }

    pub fn pop_pipeline(&mut self, id: PipelineId) -> Result<()> {
        if self.batch.pipeline == Some(id) {
            self.batch.pipeline = None;
        }
        self.pipelines.pop(id)
    }

    pub fn pipelines(&self) -> &PipelineTable {
        &self.pipelines
    }

    pub fn bindings(&self) -> &ResourceBindingTable {
        &self.bindings
    }

    pub fn bindings_mut(&mut self) -> &mut ResourceBindingTable {
        &mut self.bindings
    }

    pub fn swapchain(&self) -> &SurfaceSwapchain {
        &self.swapchain
    }

    pub fn state(&self) -> FrameState {
        self.state.state()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.ring.count()
    }

    /// Slots whose fence is still pending on the GPU.
    pub fn pending_frames(&self) -> usize {
        self.ring.in_flight()
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        log::info!("Shutting down frame synchronizer...");
        if let Err(e) = self.device.wait_idle() {
            log::warn!("wait_idle during shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::swapchain::{choose_extent, plan_recreate, Recreate};

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn resize_rebuilds_at_the_new_extent() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(1, 1),
            max_image_extent: extent(4096, 4096),
            ..Default::default()
        };
        // notify_resize(1920, 1080) on an 800x600 swapchain.
        assert!(needs_rebuild(true, false));
        let resolved = choose_extent(&caps, extent(1920, 1080));
        assert_eq!(resolved, extent(1920, 1080));
        assert_eq!(plan_recreate(extent(800, 600), resolved, false), Recreate::Rebuild);
    }

    #[test]
    fn up_to_date_swapchain_is_left_alone() {
        assert!(!needs_rebuild(false, false));
        assert!(needs_rebuild(false, true));
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        assert_eq!(on_acquire(AcquireOutcome::OutOfDate), AcquireAction::RebuildAndSkip);
    }

    #[test]
    fn suboptimal_acquire_draws_and_rebuilds_later() {
        assert_eq!(
            on_acquire(AcquireOutcome::Acquired {
                index: 2,
                suboptimal: true
            }),
            AcquireAction::Draw {
                image_index: 2,
                rebuild_next: true
            }
        );
        assert_eq!(
            on_acquire(AcquireOutcome::Acquired {
                index: 0,
                suboptimal: false
            }),
            AcquireAction::Draw {
                image_index: 0,
                rebuild_next: false
            }
        );
    }

    #[test]
    fn minimized_window_defers_the_rebuild() {
        assert_eq!(
            plan_recreate(extent(800, 600), extent(0, 0), true),
            Recreate::Deferred
        );
        assert_eq!(
            plan_recreate(extent(800, 600), extent(1024, 0), false),
            Recreate::Deferred
        );
    }

    #[test]
    fn end_frame_fences_only_recorded_work() {
        assert!(!fences_at_end_frame(0));
        assert!(fences_at_end_frame(1));
        assert!(fences_at_end_frame(3));
    }
}
