//! Vulkan execution of transfer tasks.
//!
//! Host-visible buffers are written through their permanent mapping;
//! device-local targets take a hop through the pool's staging buffer and a
//! one-off command buffer on the transfer queue. The render queue is
//! drained before each device-side copy so no in-flight frame reads the
//! region being rewritten.

use crate::command::{self, CommandPool};
use crate::error::Result;
use crate::memory::GpuAllocator;
use crate::pool::{BufferKind, BufferPool, RegionSet};
use crate::texture::{TextureHandle, TextureStore};
use crate::transfer::TransferBackend;
use ash::vk;

/// Borrows everything a transfer drain needs from the context.
///
/// Constructed per drain pass; the exclusive borrows guarantee the pool
/// cannot grow underneath a recorded copy.
pub struct VulkanTransfers<'a> {
    pub device: &'a ash::Device,
    pub allocator: &'a mut GpuAllocator,
    pub pool: &'a mut BufferPool,
    pub textures: &'a mut TextureStore,
    pub cmd_pool: &'a CommandPool,
    pub transfer_queue: vk::Queue,
    pub render_queue: vk::Queue,
}

impl VulkanTransfers<'_> {
    /// Wait until no frame is in flight on the render queue.
    fn quiesce_render(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.render_queue)? };
        Ok(())
    }

    fn stage_in(&mut self, data: &[u8]) -> Result<()> {
        self.pool.reserve_staging(self.allocator, data.len() as u64)?;
        self.pool.mapped(BufferKind::Staging)?.write_bytes(0, data)
    }
}

impl TransferBackend for VulkanTransfers<'_> {
    fn upload_buffer(&mut self, region: &RegionSet, offset: u64, data: &[u8]) -> Result<()> {
        if region.kind.host_visible() {
            // Mapped fast path: write every region copy directly.
            let buffer = self.pool.mapped(region.kind)?;
            for &base in &region.offsets {
                buffer.write_bytes(base + offset, data)?;
            }
            return Ok(());
        }

        self.stage_in(data)?;
        let src = self.pool.buffer(BufferKind::Staging);
        let dst = self.pool.buffer(region.kind);
        let copies: Vec<vk::BufferCopy> = region
            .offsets
            .iter()
            .map(|&base| {
                vk::BufferCopy::default()
                    .src_offset(0)
                    .dst_offset(base + offset)
                    .size(data.len() as u64)
            })
            .collect();

        self.quiesce_render()?;
        unsafe {
            command::one_time_submit(self.device, self.cmd_pool, self.transfer_queue, |cmd| {
                self.device.cmd_copy_buffer(cmd, src, dst, &copies);
            })
        }
    }

    fn download_buffer(
        &mut self,
        region: &RegionSet,
        offset: u64,
        size: u64,
        out: &mut [u8],
    ) -> Result<()> {
        // Downloads read one region; the first one by convention.
        let base = region.offsets[0];

        if region.kind.host_visible() {
            return self.pool.mapped(region.kind)?.read_bytes(base + offset, out);
        }

        self.pool.reserve_staging(self.allocator, size)?;
        let src = self.pool.buffer(region.kind);
        let staging = self.pool.buffer(BufferKind::Staging);
        let copy = vk::BufferCopy::default()
            .src_offset(base + offset)
            .dst_offset(0)
            .size(size);

        self.quiesce_render()?;
        unsafe {
            command::one_time_submit(self.device, self.cmd_pool, self.transfer_queue, |cmd| {
                self.device.cmd_copy_buffer(cmd, src, staging, &[copy]);
            })?;
        }
        self.pool.mapped(BufferKind::Staging)?.read_bytes(0, out)
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        data: &[u8],
    ) -> Result<()> {
        let (image, layout) = {
            let tex = self.textures.get(texture)?;
            tex.check_region(offset, shape, data.len() as u64)?;
            (tex.image.image, tex.layout)
        };

        self.stage_in(data)?;
        let staging = self.pool.buffer(BufferKind::Staging);
        let copy = buffer_image_copy(offset, shape);

        self.quiesce_render()?;
        unsafe {
            command::one_time_submit(self.device, self.cmd_pool, self.transfer_queue, |cmd| {
                image_barrier(
                    self.device,
                    cmd,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                );
                image_barrier(
                    self.device,
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    layout,
                );
            })
        }
    }

    fn download_texture(
        &mut self,
        texture: TextureHandle,
        offset: [u32; 3],
        shape: [u32; 3],
        size: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let (image, layout) = {
            let tex = self.textures.get(texture)?;
            tex.check_region(offset, shape, size)?;
            (tex.image.image, tex.layout)
        };

        self.pool.reserve_staging(self.allocator, size)?;
        let staging = self.pool.buffer(BufferKind::Staging);
        let copy = buffer_image_copy(offset, shape);

        self.quiesce_render()?;
        unsafe {
            command::one_time_submit(self.device, self.cmd_pool, self.transfer_queue, |cmd| {
                image_barrier(
                    self.device,
                    cmd,
                    image,
                    layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                self.device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    staging,
                    &[copy],
                );
                image_barrier(
                    self.device,
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    layout,
                );
            })?;
        }
        self.pool.mapped(BufferKind::Staging)?.read_bytes(0, out)
    }

    fn copy_buffer(
        &mut self,
        src: &RegionSet,
        src_offset: u64,
        dst: &RegionSet,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let src_buf = self.pool.buffer(src.kind);
        let dst_buf = self.pool.buffer(dst.kind);
        let copies: Vec<vk::BufferCopy> = src
            .offsets
            .iter()
            .zip(&dst.offsets)
            .map(|(&s, &d)| {
                vk::BufferCopy::default()
                    .src_offset(s + src_offset)
                    .dst_offset(d + dst_offset)
                    .size(size)
            })
            .collect();

        self.quiesce_render()?;
        unsafe {
            command::one_time_submit(self.device, self.cmd_pool, self.transfer_queue, |cmd| {
                self.device.cmd_copy_buffer(cmd, src_buf, dst_buf, &copies);
            })
        }
    }

    fn copy_texture(
        &mut self,
        src: TextureHandle,
        src_offset: [u32; 3],
        dst: TextureHandle,
        dst_offset: [u32; 3],
        shape: [u32; 3],
    ) -> Result<()> {
        let (src_image, src_layout, texel) = {
            let tex = self.textures.get(src)?;
            let size = tex.texel_size
                * u64::from(shape[0])
                * u64::from(shape[1])
                * u64::from(shape[2]);
            tex.check_region(src_offset, shape, size)?;
            (tex.image.image, tex.layout, tex.texel_size)
        };
        let (dst_image, dst_layout) = {
            let tex = self.textures.get(dst)?;
            let size =
                texel * u64::from(shape[0]) * u64::from(shape[1]) * u64::from(shape[2]);
            tex.check_region(dst_offset, shape, size)?;
            (tex.image.image, tex.layout)
        };

        let subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let copy = vk::ImageCopy::default()
            .src_subresource(subresource)
            .src_offset(image_offset(src_offset))
            .dst_subresource(subresource)
            .dst_offset(image_offset(dst_offset))
            .extent(vk::Extent3D {
                width: shape[0],
                height: shape[1],
                depth: shape[2],
            });

        self.quiesce_render()?;
        unsafe {
            command::one_time_submit(self.device, self.cmd_pool, self.transfer_queue, |cmd| {
                image_barrier(
                    self.device,
                    cmd,
                    src_image,
                    src_layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                image_barrier(
                    self.device,
                    cmd,
                    dst_image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                self.device.cmd_copy_image(
                    cmd,
                    src_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy],
                );
                image_barrier(
                    self.device,
                    cmd,
                    src_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_layout,
                );
                image_barrier(
                    self.device,
                    cmd,
                    dst_image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    dst_layout,
                );
            })
        }
    }
}

const fn image_offset(offset: [u32; 3]) -> vk::Offset3D {
    vk::Offset3D {
        x: offset[0] as i32,
        y: offset[1] as i32,
        z: offset[2] as i32,
    }
}

fn buffer_image_copy(offset: [u32; 3], shape: [u32; 3]) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(
            vk::ImageSubresourceLayers::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1),
        )
        .image_offset(image_offset(offset))
        .image_extent(vk::Extent3D {
            width: shape[0],
            height: shape[1],
            depth: shape[2],
        })
}

/// Full-subresource layout transition with a conservative all-commands
/// barrier. Transfers are not on the hot path, so precision is traded for
/// simplicity here.
unsafe fn image_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        )
        .src_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}
