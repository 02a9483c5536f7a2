//! Synchronization primitives.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns)? };
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Per-frame synchronization resources.
pub struct FrameSync {
    /// Semaphore signaled when the swapchain image is available.
    pub image_available: vk::Semaphore,
    /// Semaphore signaled when rendering is complete.
    pub render_finished: vk::Semaphore,
    /// Fence signaled when the frame's submission retires.
    pub in_flight: vk::Fence,
}

impl FrameSync {
    /// Create frame synchronization resources.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        unsafe {
            Ok(Self {
                image_available: create_semaphore(device)?,
                render_finished: create_semaphore(device)?,
                in_flight: create_fence(device, true)?,
            })
        }
    }

    /// Wait for this frame's previous submission to retire.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { wait_for_fence(device, self.in_flight, u64::MAX) }
    }

    /// Reset the fence for the next submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe { reset_fence(device, self.in_flight) }
    }

    /// Destroy synchronization resources.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// Device-free half of the per-image fence mirror: remembers which frame
/// slot last rendered into each swapchain image. The mirror holds no
/// fences of its own.
#[derive(Debug)]
struct FenceMirror {
    bindings: Vec<Option<usize>>,
}

impl FenceMirror {
    fn new(image_count: usize) -> Self {
        Self {
            bindings: vec![None; image_count],
        }
    }

    /// Bind `image` to `frame`, returning the frame slot whose fence must
    /// retire before the image is reused.
    fn rebind(&mut self, image: usize, frame: usize) -> Option<usize> {
        self.bindings[image].replace(frame)
    }

    /// Forget every binding; the images it referred to no longer exist.
    fn reset(&mut self, image_count: usize) {
        self.bindings.clear();
        self.bindings.resize(image_count, None);
    }
}

/// Synchronization for multiple frames in flight, plus a per-swapchain-image
/// fence mirror.
///
/// Frames in flight and swapchain images cycle at different rates, so each
/// image slot remembers the in-flight fence of the frame that last rendered
/// into it. Before a frame reuses an image it waits on that remembered
/// fence.
pub struct FrameSyncManager {
    frame_syncs: Vec<FrameSync>,
    mirror: FenceMirror,
    current_frame: usize,
}

impl FrameSyncManager {
    /// Create a sync manager for `frames_in_flight` frames cycling through
    /// `image_count` swapchain images.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        frames_in_flight: usize,
        image_count: usize,
    ) -> Result<Self> {
        let mut frame_syncs = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            frame_syncs.push(unsafe { FrameSync::new(device)? });
        }

        Ok(Self {
            frame_syncs,
            mirror: FenceMirror::new(image_count),
            current_frame: 0,
        })
    }

    /// Current frame's sync resources.
    pub fn current(&self) -> &FrameSync {
        &self.frame_syncs[self.current_frame]
    }

    /// Advance to the next frame slot.
    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.frame_syncs.len();
    }

    /// Current frame slot index.
    pub const fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Number of frame slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frame_syncs.len()
    }

    /// Wait for whichever frame last rendered into `image_index`, then
    /// mark the image as owned by the current frame.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_image_fence(&mut self, device: &ash::Device, image_index: u32) -> Result<()> {
        if let Some(slot) = self
            .mirror
            .rebind(image_index as usize, self.current_frame)
        {
            unsafe { wait_for_fence(device, self.frame_syncs[slot].in_flight, u64::MAX)? };
        }
        Ok(())
    }

    /// Forget all image-to-fence bindings. Call after the swapchain is
    /// recreated, when the old images no longer exist.
    pub fn reset_image_fences(&mut self, image_count: usize) {
        self.mirror.reset(image_count);
    }

    /// Replace every frame's semaphores and fences with fresh ones.
    ///
    /// An acquire that reported the swapchain stale has signaled the
    /// frame's `image_available` semaphore with no submit ever waiting on
    /// it; a binary semaphore must be unsignaled before the next acquire
    /// may use it, so the objects are rebuilt rather than reused.
    ///
    /// # Safety
    /// The device must be valid and idle.
    pub unsafe fn recreate_frames(&mut self, device: &ash::Device) -> Result<()> {
        let mut fresh = Vec::with_capacity(self.frame_syncs.len());
        for _ in 0..self.frame_syncs.len() {
            fresh.push(unsafe { FrameSync::new(device)? });
        }
        for sync in &self.frame_syncs {
            unsafe { sync.destroy(device) };
        }
        self.frame_syncs = fresh;
        self.current_frame = 0;
        Ok(())
    }

    /// Destroy all resources.
    ///
    /// # Safety
    /// The device must be valid and all resources must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for sync in &self.frame_syncs {
            unsafe { sync.destroy(device) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_rotation_two_frames_three_images() {
        // Two frame slots cycling through three images: the first lap
        // finds every image unowned, the second lap must wait on the slot
        // that wrote each image one lap earlier.
        let mut mirror = FenceMirror::new(3);

        assert_eq!(mirror.rebind(0, 0), None);
        assert_eq!(mirror.rebind(1, 1), None);
        assert_eq!(mirror.rebind(2, 0), None);

        assert_eq!(mirror.rebind(0, 1), Some(0));
        assert_eq!(mirror.rebind(1, 0), Some(1));
        assert_eq!(mirror.rebind(2, 1), Some(0));

        // Third lap sees the second lap's owners.
        assert_eq!(mirror.rebind(0, 0), Some(1));
    }

    #[test]
    fn mirror_same_image_reacquired_waits_last_writer() {
        let mut mirror = FenceMirror::new(1);
        assert_eq!(mirror.rebind(0, 0), None);
        assert_eq!(mirror.rebind(0, 1), Some(0));
        assert_eq!(mirror.rebind(0, 0), Some(1));
    }

    #[test]
    fn mirror_reset_forgets_bindings() {
        let mut mirror = FenceMirror::new(2);
        mirror.rebind(0, 0);
        mirror.rebind(1, 1);

        // Recreation can change the image count; no stale owner survives.
        mirror.reset(3);
        assert_eq!(mirror.rebind(0, 1), None);
        assert_eq!(mirror.rebind(2, 0), None);
    }
}
