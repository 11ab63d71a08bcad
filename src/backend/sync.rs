// Synchronization primitives
//
// Fences and semaphores per frame slot, plus the bookkeeping that decides
// which semaphore each submission waits on and signals. The bookkeeping is
// kept free of driver calls so the ordering rules can be tested directly.

use ash::vk;
use std::sync::Arc;

use super::handle::{self, OwnedFence, OwnedSemaphore};
use super::LogicalDevice;
use crate::error::{GraphicsError, Result};

/// Frame synchronization - one per frame in flight
pub struct FrameSlot {
    pub image_available: OwnedSemaphore,
    pub render_finished: OwnedSemaphore,
    /// Created signaled so the first wait on a fresh slot returns at once.
    pub in_flight: OwnedFence,
    // Index = batch number within the frame. Freed with the command pool.
    command_buffers: Vec<vk::CommandBuffer>,
}

impl FrameSlot {
    pub fn new(device: &Arc<LogicalDevice>) -> Result<Self> {
        let command_buffers = device.allocate_command_buffers(1)?;
        Ok(Self {
            image_available: handle::create_semaphore(device)
                .map_err(GraphicsError::CreatingSyncObjects)?,
            render_finished: handle::create_semaphore(device)
                .map_err(GraphicsError::CreatingSyncObjects)?,
            in_flight: handle::create_fence(device, true)
                .map_err(GraphicsError::CreatingSyncObjects)?,
            command_buffers,
        })
    }

    /// Command buffer for `batch`, allocated the first time a frame reaches
    /// that many batches and reused afterwards.
    pub fn command_buffer(&mut self, device: &LogicalDevice, batch: usize) -> Result<vk::CommandBuffer> {
        while self.command_buffers.len() <= batch {
            let extra = device.allocate_command_buffers(1)?;
            self.command_buffers.extend(extra);
        }
        Ok(self.command_buffers[batch])
    }
}

/// Wait/signal pair of one batch submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSubmit {
    pub wait: vk::Semaphore,
    pub signal: vk::Semaphore,
}

/// Semaphore plan for the batches of one frame.
///
/// Batch 0 waits on image acquisition; every later batch waits on the
/// previous batch's signal, so batches run strictly in order on the GPU.
#[derive(Debug, Clone, Copy)]
pub struct BatchChain {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    submitted: usize,
}

impl BatchChain {
    pub fn new(image_available: vk::Semaphore, render_finished: vk::Semaphore) -> Self {
        Self {
            image_available,
            render_finished,
            submitted: 0,
        }
    }

    pub fn next(&mut self) -> BatchSubmit {
        let wait = if self.submitted == 0 {
            self.image_available
        } else {
            self.render_finished
        };
        self.submitted += 1;
        BatchSubmit {
            wait,
            signal: self.render_finished,
        }
    }

    /// True until the first submission; such a frame still needs one
    /// clear-only pass before it can be presented.
    pub fn needs_clear_pass(&self) -> bool {
        self.submitted == 0
    }

    /// What presentation waits on: the last signal of the chain.
    pub fn present_wait(&self) -> vk::Semaphore {
        if self.submitted == 0 {
            self.image_available
        } else {
            self.render_finished
        }
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquired { image_index: u32 },
    Recording { image_index: u32, batch: usize },
    /// Between batches: `batches` have been submitted so far.
    Batched { image_index: u32, batches: usize },
    /// `end_frame` done; waiting for `present`.
    Submitted { image_index: u32, batches: usize },
}

impl FrameState {
    pub fn name(&self) -> &'static str {
        match self {
            FrameState::Idle => "Idle",
            FrameState::Acquired { .. } => "Acquired",
            FrameState::Recording { .. } => "Recording",
            FrameState::Batched { .. } => "Batched",
            FrameState::Submitted { .. } => "Submitted",
        }
    }
}

/// Legal transitions of the per-frame state machine.
#[derive(Debug)]
pub struct FrameStateMachine {
    state: FrameState,
}

impl Default for FrameStateMachine {
    fn default() -> Self {
        Self {
            state: FrameState::Idle,
        }
    }
}

impl FrameStateMachine {
    pub fn state(&self) -> FrameState {
        self.state
    }

    fn invalid(&self, op: &'static str) -> GraphicsError {
        GraphicsError::InvalidFrameState {
            op,
            state: self.state.name(),
        }
    }

    pub fn begin_frame(&mut self, image_index: u32) -> Result<()> {
        match self.state {
            FrameState::Idle => {
                self.state = FrameState::Acquired { image_index };
                Ok(())
            }
            _ => Err(self.invalid("begin_frame")),
        }
    }

    /// The (image index, batch number) `begin_batch` would open, without
    /// changing state.
    pub fn next_batch(&self) -> Result<(u32, usize)> {
        match self.state {
            FrameState::Acquired { image_index } => Ok((image_index, 0)),
            FrameState::Batched { image_index, batches } => Ok((image_index, batches)),
            _ => Err(self.invalid("begin_batch")),
        }
    }

    /// Returns (image index, batch number).
    pub fn begin_batch(&mut self) -> Result<(u32, usize)> {
        let (image_index, batch) = self.next_batch()?;
        self.state = FrameState::Recording { image_index, batch };
        Ok((image_index, batch))
    }

    /// Returns the batch number that just ended.
    pub fn end_batch(&mut self) -> Result<usize> {
        match self.state {
            FrameState::Recording { image_index, batch } => {
                self.state = FrameState::Batched {
                    image_index,
                    batches: batch + 1,
                };
                Ok(batch)
            }
            _ => Err(self.invalid("end_batch")),
        }
    }

    /// Returns how many batches the frame recorded.
    pub fn end_frame(&mut self) -> Result<usize> {
        let (image_index, batches) = match self.state {
            FrameState::Acquired { image_index } => (image_index, 0),
            FrameState::Batched { image_index, batches } => (image_index, batches),
            _ => return Err(self.invalid("end_frame")),
        };
        self.state = FrameState::Submitted { image_index, batches };
        Ok(batches)
    }

    /// Returns the image to present.
    pub fn present(&mut self) -> Result<u32> {
        match self.state {
            FrameState::Submitted { image_index, .. } => {
                self.state = FrameState::Idle;
                Ok(image_index)
            }
            _ => Err(self.invalid("present")),
        }
    }

    pub fn recording(&self) -> Option<(u32, usize)> {
        match self.state {
            FrameState::Recording { image_index, batch } => Some((image_index, batch)),
            _ => None,
        }
    }
}

/// Round-robin over the frame slots, tracking which slots still have GPU
/// work outstanding (fence unsignaled).
#[derive(Debug)]
pub struct SlotRing {
    current: usize,
    pending: Vec<bool>,
}

impl SlotRing {
    pub fn new(count: usize) -> Self {
        Self {
            current: 0,
            pending: vec![false; count],
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn count(&self) -> usize {
        self.pending.len()
    }

    /// The slot's fence was waited on.
    pub fn retire(&mut self, slot: usize) {
        self.pending[slot] = false;
    }

    /// The slot's fence was submitted.
    pub fn submit(&mut self, slot: usize) {
        self.pending[slot] = true;
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.pending.len();
    }

    pub fn in_flight(&self) -> usize {
        self.pending.iter().filter(|&&pending| pending).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn sem(raw: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(raw)
    }

    #[test]
    fn batches_chain_on_previous_signal() {
        let image_available = sem(1);
        let render_finished = sem(2);
        let mut chain = BatchChain::new(image_available, render_finished);

        let submits: Vec<_> = (0..4).map(|_| chain.next()).collect();

        assert_eq!(submits[0].wait, image_available);
        for i in 1..submits.len() {
            assert_eq!(submits[i].wait, submits[i - 1].signal);
        }
        assert_eq!(chain.present_wait(), submits[3].signal);
        assert_eq!(chain.submitted(), 4);
    }

    #[test]
    fn empty_frame_presents_behind_its_clear_pass() {
        let mut chain = BatchChain::new(sem(10), sem(20));
        assert!(chain.needs_clear_pass());

        let clear = chain.next();
        assert_eq!(clear.wait, sem(10));
        assert_eq!(clear.signal, sem(20));
        assert!(!chain.needs_clear_pass());
        assert_eq!(chain.present_wait(), sem(20));
    }

    #[test]
    fn next_batch_leaves_the_state_untouched() {
        let mut frame = FrameStateMachine::default();
        assert!(frame.next_batch().is_err());

        frame.begin_frame(1).unwrap();
        assert_eq!(frame.next_batch().unwrap(), (1, 0));
        // Work between the peek and begin_batch failed: the frame can still end.
        assert_eq!(frame.state(), FrameState::Acquired { image_index: 1 });
        assert_eq!(frame.end_frame().unwrap(), 0);

        let mut frame = FrameStateMachine::default();
        frame.begin_frame(0).unwrap();
        frame.begin_batch().unwrap();
        frame.end_batch().unwrap();
        assert_eq!(frame.next_batch().unwrap(), (0, 1));
        assert_eq!(frame.state(), FrameState::Batched { image_index: 0, batches: 1 });
        assert_eq!(frame.begin_batch().unwrap(), (0, 1));
    }

    #[test]
    fn full_frame_walks_the_states() {
        let mut frame = FrameStateMachine::default();
        frame.begin_frame(2).unwrap();
        assert_eq!(frame.begin_batch().unwrap(), (2, 0));
        assert_eq!(frame.recording(), Some((2, 0)));
        assert_eq!(frame.end_batch().unwrap(), 0);
        assert_eq!(frame.begin_batch().unwrap(), (2, 1));
        assert_eq!(frame.end_batch().unwrap(), 1);
        assert_eq!(frame.end_frame().unwrap(), 2);
        assert_eq!(frame.present().unwrap(), 2);
        assert_eq!(frame.state(), FrameState::Idle);
    }

    #[test]
    fn frame_without_batches_still_presents() {
        let mut frame = FrameStateMachine::default();
        frame.begin_frame(0).unwrap();
        assert_eq!(frame.end_frame().unwrap(), 0);
        assert_eq!(frame.present().unwrap(), 0);
    }

    #[test]
    fn out_of_order_calls_are_rejected() {
        let mut frame = FrameStateMachine::default();
        assert!(matches!(
            frame.begin_batch(),
            Err(GraphicsError::InvalidFrameState { op: "begin_batch", state: "Idle" })
        ));
        assert!(frame.present().is_err());

        frame.begin_frame(0).unwrap();
        assert!(frame.begin_frame(1).is_err());
        frame.begin_batch().unwrap();
        // Cannot end the frame with a batch still open.
        assert!(matches!(
            frame.end_frame(),
            Err(GraphicsError::InvalidFrameState { op: "end_frame", state: "Recording" })
        ));
        assert!(frame.begin_batch().is_err());
    }

    #[test]
    fn in_flight_frames_never_exceed_slot_count() {
        for slots in 2..=4 {
            let mut ring = SlotRing::new(slots);
            for _frame in 0..50 {
                let slot = ring.current();
                // begin_frame: wait on this slot's fence
                ring.retire(slot);
                assert!(ring.in_flight() < slots);
                // end_frame: fence handed to the queue
                ring.submit(slot);
                assert!(ring.in_flight() <= slots);
                ring.advance();
            }
            assert_eq!(ring.in_flight(), slots);
        }
    }

    #[test]
    fn ring_wraps_modulo_count() {
        let mut ring = SlotRing::new(3);
        let order: Vec<_> = (0..7)
            .map(|_| {
                let slot = ring.current();
                ring.advance();
                slot
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }
}
