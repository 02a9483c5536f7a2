//! Textures owned by the engine core.
//!
//! Textures live in a generational arena; the rest of the engine (and the
//! excluded scene layers) refer to them only through [`TextureHandle`]s,
//! so a handle kept past destruction resolves to an error instead of a
//! dangling image.

use crate::error::{GpuError, Result};
use crate::memory::{GpuAllocator, GpuImage};
use ash::vk;
use gpu_allocator::MemoryLocation;
use vistra_core::{Arena, Handle, Lifecycle, ObjectStatus};

/// Handle to a [`Texture`] in the store.
pub type TextureHandle = Handle<Texture>;

/// A device image with the metadata transfers need.
pub struct Texture {
    /// Backing image and allocation.
    pub image: GpuImage,
    /// Image layout the texture rests in between transfers.
    pub layout: vk::ImageLayout,
    /// Bytes per texel of the image format.
    pub texel_size: u64,
    status: ObjectStatus,
}

impl Texture {
    /// Extent of the full image.
    pub const fn extent(&self) -> vk::Extent3D {
        self.image.extent
    }

    /// Total byte size of the full image.
    pub const fn byte_size(&self) -> u64 {
        self.texel_size
            * self.image.extent.width as u64
            * self.image.extent.height as u64
            * self.image.extent.depth as u64
    }

    /// Validate that a region `offset + shape` lies inside the image and
    /// that `size` matches the region's byte count.
    pub fn check_region(&self, offset: [u32; 3], shape: [u32; 3], size: u64) -> Result<()> {
        let extent = [
            self.image.extent.width,
            self.image.extent.height,
            self.image.extent.depth,
        ];
        for axis in 0..3 {
            if shape[axis] == 0
                || u64::from(offset[axis]) + u64::from(shape[axis]) > u64::from(extent[axis])
            {
                return Err(GpuError::Validation(format!(
                    "texture region offset {offset:?} shape {shape:?} exceeds extent {extent:?}"
                )));
            }
        }
        let expected =
            self.texel_size * u64::from(shape[0]) * u64::from(shape[1]) * u64::from(shape[2]);
        if size != expected {
            return Err(GpuError::Validation(format!(
                "texture transfer size {size} does not match region byte count {expected}"
            )));
        }
        Ok(())
    }
}

impl Lifecycle for Texture {
    fn status(&self) -> ObjectStatus {
        self.status
    }

    fn set_status(&mut self, status: ObjectStatus) {
        self.status = status;
    }
}

/// Bytes per texel for the formats the engine creates textures in.
fn texel_size(format: vk::Format) -> Result<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT => Ok(1),
        vk::Format::R8G8_UNORM => Ok(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT => Ok(4),
        vk::Format::R32G32B32A32_SFLOAT => Ok(16),
        other => Err(GpuError::Validation(format!(
            "unsupported texture format {other:?}"
        ))),
    }
}

const fn image_type(extent: vk::Extent3D) -> vk::ImageType {
    if extent.depth > 1 {
        vk::ImageType::TYPE_3D
    } else if extent.height > 1 {
        vk::ImageType::TYPE_2D
    } else {
        vk::ImageType::TYPE_1D
    }
}

/// Arena of engine-owned textures.
#[derive(Default)]
pub struct TextureStore {
    textures: Arena<Texture>,
}

impl TextureStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a texture and return its handle.
    pub fn create(
        &mut self,
        allocator: &mut GpuAllocator,
        extent: vk::Extent3D,
        format: vk::Format,
    ) -> Result<TextureHandle> {
        let texel_size = texel_size(format)?;

        let create_info = vk::ImageCreateInfo::default()
            .image_type(image_type(extent))
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = allocator.create_image(&create_info, MemoryLocation::GpuOnly, "texture")?;

        let mut texture = Texture {
            image,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            texel_size,
            status: ObjectStatus::Init,
        };
        texture.mark_created();

        tracing::debug!(?extent, ?format, "created texture");
        Ok(self.textures.insert(texture))
    }

    /// Resolve a handle.
    pub fn get(&self, handle: TextureHandle) -> Result<&Texture> {
        self.textures
            .get(handle)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("texture {handle:?}")))
    }

    /// Resolve a handle mutably.
    pub fn get_mut(&mut self, handle: TextureHandle) -> Result<&mut Texture> {
        self.textures
            .get_mut(handle)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("texture {handle:?}")))
    }

    /// Destroy one texture; its handle (and all copies) become stale.
    pub fn destroy(&mut self, allocator: &mut GpuAllocator, handle: TextureHandle) -> Result<()> {
        let mut texture = self
            .textures
            .remove(handle)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("texture {handle:?}")))?;
        texture.mark_destroyed();
        allocator.free_image(&mut texture.image)
    }

    /// Destroy every texture.
    pub fn destroy_all(&mut self, allocator: &mut GpuAllocator) {
        for mut texture in self.textures.drain() {
            texture.mark_destroyed();
            if let Err(err) = allocator.free_image(&mut texture.image) {
                tracing::warn!(%err, "failed to free texture image");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8_UNORM).unwrap(), 1);
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM).unwrap(), 4);
        assert!(texel_size(vk::Format::D32_SFLOAT).is_err());
    }

    #[test]
    fn image_type_from_extent() {
        let e = |w, h, d| vk::Extent3D {
            width: w,
            height: h,
            depth: d,
        };
        assert_eq!(image_type(e(64, 1, 1)), vk::ImageType::TYPE_1D);
        assert_eq!(image_type(e(64, 64, 1)), vk::ImageType::TYPE_2D);
        assert_eq!(image_type(e(64, 64, 64)), vk::ImageType::TYPE_3D);
    }
}
