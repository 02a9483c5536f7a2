//! Vulkan rendering-engine core for Vistra.
//!
//! This crate provides:
//! - Vulkan instance and device management with role-based queue selection
//! - Memory allocation via gpu-allocator
//! - A growable, sub-allocating buffer pool
//! - A thread-safe transfer task queue with immediate and deferred modes
//! - Swapchain handling and a resize-aware frame presentation loop

pub mod canvas;
pub mod command;
pub mod context;
pub mod error;
pub mod fifo;
pub mod frame;
pub mod instance;
pub mod memory;
pub mod pool;
pub mod queues;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transfer;
pub mod transfer_backend;

pub use canvas::{Canvas, FillCallback, RenderFrame, FRAMES_IN_FLIGHT};
pub use context::{GpuContext, GpuContextBuilder};
pub use error::{GpuError, Result};
pub use fifo::Fifo;
pub use frame::{FrameLoop, FrameOutcome, FrameTarget};
pub use memory::{GpuAllocator, GpuBuffer, GpuImage};
pub use pool::{BufferKind, BufferPool, RegionSet};
pub use queues::{QueueAssignment, QueueFamilyCaps, QueueRole, QueueSelection};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Acquired, Swapchain, SwapchainStatus};
pub use sync::{create_fence, create_semaphore, FrameSync, FrameSyncManager};
pub use texture::{Texture, TextureHandle, TextureStore};
pub use transfer::{DownloadSlot, TransferBackend, TransferQueue, TransferTask};
pub use transfer_backend::VulkanTransfers;
