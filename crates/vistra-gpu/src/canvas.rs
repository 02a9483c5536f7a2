//! Presentable canvas: swapchain, per-image command buffers, and frame
//! synchronization behind the [`FrameTarget`] seam.
//!
//! Command buffers are recorded once per image by the fill callback and
//! replayed every frame; they are only re-recorded after a swapchain
//! recreate or an explicit [`Canvas::request_refill`].

use crate::command::{self, CommandPool};
use crate::context::GpuContext;
use crate::error::Result;
use crate::frame::FrameTarget;
use crate::memory::GpuImage;
use crate::surface::SurfaceContext;
use crate::swapchain::{Acquired, Swapchain, SwapchainStatus};
use crate::sync::FrameSyncManager;
use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use vistra_core::{Lifecycle, ObjectStatus};

/// How many frames may be in flight at once.
pub const FRAMES_IN_FLIGHT: usize = 2;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Everything the fill callback needs to record one image's commands.
pub struct RenderFrame {
    /// Swapchain image index being recorded.
    pub image_index: u32,
    /// Swapchain image view, already bound as the color attachment.
    pub image_view: vk::ImageView,
    /// Current swapchain extent.
    pub extent: vk::Extent2D,
    /// Swapchain color format.
    pub format: vk::Format,
}

/// Callback recording draw commands inside an active dynamic-rendering
/// pass.
pub type FillCallback = Box<dyn FnMut(&ash::Device, vk::CommandBuffer, &RenderFrame) + Send>;

/// A window-backed render target.
pub struct Canvas {
    gpu: Arc<GpuContext>,
    surface: SurfaceContext,
    swapchain: Swapchain,
    depth_image: GpuImage,
    depth_view: vk::ImageView,
    sync: FrameSyncManager,
    cmd_pool: CommandPool,
    cmd_buffers: Vec<vk::CommandBuffer>,
    fill: FillCallback,
    clear_color: [f32; 4],
    desired_width: u32,
    desired_height: u32,
    vsync: bool,
    status: ObjectStatus,
}

impl Canvas {
    /// Create a canvas for a window surface and record every image once.
    ///
    /// # Safety
    /// The surface must belong to the context's instance and stay alive as
    /// long as the canvas.
    pub unsafe fn new(
        gpu: Arc<GpuContext>,
        surface: SurfaceContext,
        width: u32,
        height: u32,
        vsync: bool,
        fill: FillCallback,
    ) -> Result<Self> {
        let swapchain = unsafe { surface.create_swapchain(&gpu, width, height, vsync, None)? };
        let image_count = swapchain.image_count();
        let (depth_image, depth_view) = unsafe { create_depth(&gpu, swapchain.extent)? };

        let sync =
            unsafe { FrameSyncManager::new(gpu.device(), FRAMES_IN_FLIGHT, image_count)? };
        let cmd_pool = unsafe {
            CommandPool::new(
                gpu.device(),
                gpu.main_queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        let cmd_buffers = unsafe { cmd_pool.allocate(gpu.device(), image_count as u32)? };

        let mut canvas = Self {
            gpu,
            surface,
            swapchain,
            depth_image,
            depth_view,
            sync,
            cmd_pool,
            cmd_buffers,
            fill,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            desired_width: width,
            desired_height: height,
            vsync,
            status: ObjectStatus::Init,
        };

        for image in 0..canvas.swapchain.image_count() as u32 {
            canvas.refill(image)?;
        }
        canvas.mark_created();
        Ok(canvas)
    }

    /// Set the clear color applied before the fill callback runs. Takes
    /// effect at the next refill.
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
        self.set_status(ObjectStatus::NeedUpdate);
    }

    /// Note a new window size; the swapchain is recreated at the next
    /// acquire that reports it stale, or immediately via
    /// [`FrameTarget::recreate`].
    pub fn resize(&mut self, width: u32, height: u32) {
        self.desired_width = width;
        self.desired_height = height;
        self.set_status(ObjectStatus::NeedRecreate);
    }

    /// Re-record every image at the next opportunity.
    pub fn request_refill(&mut self) {
        self.set_status(ObjectStatus::NeedUpdate);
    }

    /// Current swapchain extent.
    pub const fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn record(&mut self, image_index: u32) -> Result<()> {
        let device = self.gpu.device();
        let cmd = self.cmd_buffers[image_index as usize];
        let image = self.swapchain.images[image_index as usize];
        let frame = RenderFrame {
            image_index,
            image_view: self.swapchain.image_views[image_index as usize],
            extent: self.swapchain.extent,
            format: self.swapchain.format,
        };

        let subresource = vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);

        unsafe {
            device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            command::begin(device, cmd, vk::CommandBufferUsageFlags::empty())?;

            let to_color = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .image(image)
                .subresource_range(subresource);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_color],
            );

            let to_depth = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
                .image(self.depth_image.image)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::DEPTH)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_depth],
            );

            let clear = vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            };
            let color_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(frame.image_view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(clear);
            let depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(self.depth_view)
                .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                });
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.swapchain.extent,
                })
                .layer_count(1)
                .color_attachments(std::slice::from_ref(&color_attachment))
                .depth_attachment(&depth_attachment);

            device.cmd_begin_rendering(cmd, &rendering_info);
            (self.fill)(device, cmd, &frame);
            device.cmd_end_rendering(cmd);

            let to_present = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .image(image)
                .subresource_range(subresource);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );

            command::end(device, cmd)?;
        }
        Ok(())
    }

    unsafe fn destroy_depth(&mut self) {
        unsafe {
            self.gpu.device().destroy_image_view(self.depth_view, None);
        }
        self.depth_view = vk::ImageView::null();
        if let Err(err) = self
            .gpu
            .allocator()
            .lock()
            .free_image(&mut self.depth_image)
        {
            tracing::warn!(%err, "failed to free depth image");
        }
    }

    /// Destroy the canvas and everything sized like its swapchain.
    ///
    /// # Safety
    /// No frame may be in flight.
    pub unsafe fn destroy(&mut self) {
        unsafe {
            let _ = self.gpu.device().device_wait_idle();
            self.destroy_depth();
            let device = self.gpu.device();
            self.sync.destroy(device);
            self.cmd_pool.destroy(device);
            self.swapchain.destroy(device, &self.surface.swapchain_loader);
            self.surface.destroy();
        }
        self.mark_destroyed();
    }
}

impl Lifecycle for Canvas {
    fn status(&self) -> ObjectStatus {
        self.status
    }

    fn set_status(&mut self, status: ObjectStatus) {
        self.status = status;
    }
}

impl FrameTarget for Canvas {
    fn acquire(&mut self) -> Result<Acquired> {
        unsafe {
            self.sync.current().wait(self.gpu.device())?;

            let acquired = self.swapchain.acquire(
                &self.surface.swapchain_loader,
                self.sync.current().image_available,
                u64::MAX,
            )?;

            if acquired.status == SwapchainStatus::Ok {
                if self.status() == ObjectStatus::NeedRecreate {
                    // A resize arrived through the window rather than the
                    // driver; treat the acquired image as stale.
                    return Ok(Acquired {
                        image_index: acquired.image_index,
                        status: SwapchainStatus::NeedRecreate,
                    });
                }
                self.sync
                    .wait_image_fence(self.gpu.device(), acquired.image_index)?;
            }
            Ok(acquired)
        }
    }

    fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    fn refill(&mut self, image_index: u32) -> Result<()> {
        self.record(image_index)
    }

    fn submit_present(&mut self, image_index: u32) -> Result<SwapchainStatus> {
        let device = self.gpu.device();
        let queue = self.gpu.main_queue();
        let frame = self.sync.current();

        unsafe {
            frame.reset(device)?;
            command::submit(
                device,
                queue,
                &[self.cmd_buffers[image_index as usize]],
                &[frame.image_available],
                &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                &[frame.render_finished],
                frame.in_flight,
            )?;

            let status = self.swapchain.present(
                &self.surface.swapchain_loader,
                queue,
                image_index,
                &[frame.render_finished],
            )?;

            self.sync.advance();
            Ok(status)
        }
    }

    fn recreate(&mut self) -> Result<SwapchainStatus> {
        if self.desired_width == 0 || self.desired_height == 0 {
            tracing::warn!("zero-sized surface, canvas invalid");
            self.set_status(ObjectStatus::Invalid);
            return Ok(SwapchainStatus::Invalid);
        }

        self.gpu.wait_idle()?;

        self.swapchain = unsafe {
            self.surface.recreate_swapchain(
                &self.gpu,
                &mut self.swapchain,
                self.desired_width,
                self.desired_height,
                self.vsync,
            )?
        };

        unsafe {
            self.destroy_depth();
            let (depth_image, depth_view) = create_depth(&self.gpu, self.swapchain.extent)?;
            self.depth_image = depth_image;
            self.depth_view = depth_view;
        }

        let image_count = self.swapchain.image_count();
        self.sync.reset_image_fences(image_count);
        // The acquire that triggered recreation signaled image_available
        // without a submit consuming it; rebuild the frame semaphores.
        unsafe { self.sync.recreate_frames(self.gpu.device())? };

        // Image count can change across recreation.
        if image_count != self.cmd_buffers.len() {
            unsafe {
                self.gpu
                    .device()
                    .free_command_buffers(self.cmd_pool.handle(), &self.cmd_buffers);
                self.cmd_buffers =
                    self.cmd_pool.allocate(self.gpu.device(), image_count as u32)?;
            }
        }

        tracing::debug!(extent = ?self.swapchain.extent, "canvas recreated");
        self.mark_created();
        Ok(SwapchainStatus::Ok)
    }
}

/// Create the depth attachment sized like the swapchain.
///
/// # Safety
/// The context must be valid.
unsafe fn create_depth(
    gpu: &GpuContext,
    extent: vk::Extent2D,
) -> Result<(GpuImage, vk::ImageView)> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = gpu
        .allocator()
        .lock()
        .create_image(&create_info, MemoryLocation::GpuOnly, "canvas.depth")?;

    let view_info = vk::ImageViewCreateInfo::default()
        .image(image.image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(DEPTH_FORMAT)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::DEPTH)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );
    let view = unsafe { gpu.device().create_image_view(&view_info, None)? };

    Ok((image, view))
}
