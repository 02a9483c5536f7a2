//! Frame presentation loop.
//!
//! The loop owns the acquire → submit → present sequencing and the
//! recreate-and-retry policy, but talks to the swapchain only through
//! [`FrameTarget`]. That keeps the state machine free of device handles,
//! so resize recovery is tested with a scripted target instead of a GPU.

use crate::error::Result;
use crate::swapchain::{Acquired, SwapchainStatus};

/// What the loop does each frame, driven by [`SwapchainStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented.
    Presented,
    /// The swapchain was recreated and every image refilled; nothing was
    /// submitted this iteration.
    Recreated,
    /// The surface is unusable; the loop must stop.
    Invalid,
}

/// Everything a presentable surface must provide to the frame loop.
pub trait FrameTarget {
    /// Wait for the current frame slot and acquire the next image.
    fn acquire(&mut self) -> Result<Acquired>;

    /// Number of swapchain images currently alive.
    fn image_count(&self) -> usize;

    /// Re-record the command buffer for one image. Called once per image
    /// after a recreate, and for the acquired image when its contents are
    /// stale.
    fn refill(&mut self, image_index: u32) -> Result<()>;

    /// Submit the frame's work and present `image_index`.
    fn submit_present(&mut self, image_index: u32) -> Result<SwapchainStatus>;

    /// Tear down and rebuild everything sized like the swapchain.
    fn recreate(&mut self) -> Result<SwapchainStatus>;
}

/// Drives a [`FrameTarget`] one frame at a time.
#[derive(Default)]
pub struct FrameLoop {
    frame_index: u64,
}

impl FrameLoop {
    /// Create a loop starting at frame zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames presented so far.
    pub const fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Recreate the target and refill every image exactly once.
    fn recover(target: &mut impl FrameTarget) -> Result<FrameOutcome> {
        match target.recreate()? {
            SwapchainStatus::Invalid => return Ok(FrameOutcome::Invalid),
            SwapchainStatus::Ok | SwapchainStatus::NeedRecreate => {}
        }
        for image in 0..target.image_count() as u32 {
            target.refill(image)?;
        }
        Ok(FrameOutcome::Recreated)
    }

    /// Run one frame: acquire, submit, present.
    ///
    /// A resize seen at acquire skips submission entirely; the frame is
    /// spent recreating and refilling. A resize seen at present still
    /// counts as presented, and recovery happens before returning.
    pub fn run_frame(&mut self, target: &mut impl FrameTarget) -> Result<FrameOutcome> {
        let Acquired {
            image_index,
            status,
        } = target.acquire()?;

        match status {
            SwapchainStatus::Invalid => return Ok(FrameOutcome::Invalid),
            SwapchainStatus::NeedRecreate => return Self::recover(target),
            SwapchainStatus::Ok => {}
        }

        let presented = target.submit_present(image_index)?;
        self.frame_index += 1;

        match presented {
            SwapchainStatus::Invalid => Ok(FrameOutcome::Invalid),
            SwapchainStatus::NeedRecreate => {
                Self::recover(target)?;
                Ok(FrameOutcome::Presented)
            }
            SwapchainStatus::Ok => Ok(FrameOutcome::Presented),
        }
    }

    /// Run until `frames` have been presented or the surface goes away.
    pub fn run(&mut self, target: &mut impl FrameTarget, frames: u64) -> Result<()> {
        let end = self.frame_index + frames;
        while self.frame_index < end {
            if self.run_frame(target)? == FrameOutcome::Invalid {
                tracing::warn!("surface invalid, stopping frame loop");
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted target: acquire statuses pop off a queue, everything else
    /// counts calls.
    struct MockTarget {
        acquire_script: VecDeque<SwapchainStatus>,
        present_script: VecDeque<SwapchainStatus>,
        image_count: usize,
        next_image: u32,
        recreates: usize,
        refills: Vec<u32>,
        submits: Vec<u32>,
        recreate_result: SwapchainStatus,
    }

    impl MockTarget {
        fn new(image_count: usize) -> Self {
            Self {
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                image_count,
                next_image: 0,
                recreates: 0,
                refills: Vec::new(),
                submits: Vec::new(),
                recreate_result: SwapchainStatus::Ok,
            }
        }
    }

    impl FrameTarget for MockTarget {
        fn acquire(&mut self) -> Result<Acquired> {
            let status = self
                .acquire_script
                .pop_front()
                .unwrap_or(SwapchainStatus::Ok);
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count as u32;
            Ok(Acquired {
                image_index,
                status,
            })
        }

        fn image_count(&self) -> usize {
            self.image_count
        }

        fn refill(&mut self, image_index: u32) -> Result<()> {
            self.refills.push(image_index);
            Ok(())
        }

        fn submit_present(&mut self, image_index: u32) -> Result<SwapchainStatus> {
            self.submits.push(image_index);
            Ok(self
                .present_script
                .pop_front()
                .unwrap_or(SwapchainStatus::Ok))
        }

        fn recreate(&mut self) -> Result<SwapchainStatus> {
            self.recreates += 1;
            self.next_image = 0;
            Ok(self.recreate_result)
        }
    }

    #[test]
    fn steady_state_presents_every_frame() {
        let mut target = MockTarget::new(3);
        let mut frame_loop = FrameLoop::new();

        frame_loop.run(&mut target, 6).unwrap();

        assert_eq!(frame_loop.frame_index(), 6);
        assert_eq!(target.submits, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(target.recreates, 0);
        assert!(target.refills.is_empty());
    }

    #[test]
    fn resize_at_acquire_recreates_once_and_skips_submit() {
        let mut target = MockTarget::new(3);
        target.acquire_script.push_back(SwapchainStatus::NeedRecreate);
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.run_frame(&mut target).unwrap();

        // One recreate, one refill per image, nothing submitted.
        assert_eq!(outcome, FrameOutcome::Recreated);
        assert_eq!(target.recreates, 1);
        assert_eq!(target.refills, vec![0, 1, 2]);
        assert!(target.submits.is_empty());
        assert_eq!(frame_loop.frame_index(), 0);

        // The next frame proceeds normally on the fresh swapchain.
        let outcome = frame_loop.run_frame(&mut target).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(target.recreates, 1);
        assert_eq!(target.submits, vec![0]);
    }

    #[test]
    fn resize_at_present_still_counts_the_frame() {
        let mut target = MockTarget::new(2);
        target.present_script.push_back(SwapchainStatus::NeedRecreate);
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.run_frame(&mut target).unwrap();

        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(frame_loop.frame_index(), 1);
        assert_eq!(target.recreates, 1);
        assert_eq!(target.refills, vec![0, 1]);
    }

    #[test]
    fn invalid_surface_stops_the_loop() {
        let mut target = MockTarget::new(2);
        target.acquire_script.push_back(SwapchainStatus::Ok);
        target.acquire_script.push_back(SwapchainStatus::Invalid);
        let mut frame_loop = FrameLoop::new();

        frame_loop.run(&mut target, 10).unwrap();

        // One presented frame, then the invalid acquire halted everything.
        assert_eq!(frame_loop.frame_index(), 1);
        assert_eq!(target.recreates, 0);
    }

    #[test]
    fn invalid_recreate_propagates() {
        let mut target = MockTarget::new(2);
        target.acquire_script.push_back(SwapchainStatus::NeedRecreate);
        target.recreate_result = SwapchainStatus::Invalid;
        let mut frame_loop = FrameLoop::new();

        let outcome = frame_loop.run_frame(&mut target).unwrap();
        assert_eq!(outcome, FrameOutcome::Invalid);
        assert!(target.refills.is_empty());
    }
}
