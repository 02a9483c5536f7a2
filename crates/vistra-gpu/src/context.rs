//! GPU context management.

use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use crate::queues::{QueueFamilyCaps, QueueRole, QueueSelection};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) allocator: Mutex<GpuAllocator>,

    pub(crate) selection: QueueSelection,
    pub(crate) main_queue: vk::Queue,
    // One resolved queue per role, through dedicated-then-fallback lookup.
    pub(crate) role_queues: [Option<vk::Queue>; QueueRole::ALL.len()],

    pub(crate) uniform_alignment: u64,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared device handle for subsystems that outlive a borrow.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Role to family mapping chosen for this device.
    pub const fn queues(&self) -> &QueueSelection {
        &self.selection
    }

    /// Resolved queue for a role, if any family can serve it.
    pub const fn queue(&self, role: QueueRole) -> Option<vk::Queue> {
        self.role_queues[role as usize]
    }

    /// The main (graphics + compute) queue.
    pub const fn main_queue(&self) -> vk::Queue {
        self.main_queue
    }

    /// Family index of the main queue, used for swapchain sharing.
    pub fn main_queue_family(&self) -> u32 {
        self.selection.main().family_index
    }

    /// The queue transfers run on. Falls back to main when no dedicated
    /// transfer family exists; graphics + compute implies transfer support.
    pub fn transfer_queue(&self) -> vk::Queue {
        self.queue(QueueRole::Transfer).unwrap_or_else(|| self.main_queue())
    }

    /// Family index of the transfer queue.
    pub fn transfer_queue_family(&self) -> u32 {
        self.selection
            .queue_from_role(QueueRole::Transfer)
            .map_or_else(|| self.main_queue_family(), |a| a.family_index)
    }

    /// Minimum alignment for uniform buffer sub-allocations.
    pub const fn uniform_alignment(&self) -> u64 {
        self.uniform_alignment
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Wait for the device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocator shuts down before the device it allocates from.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Vistra".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        tracing::info!("selected GPU: {device_name:?}");

        let families = unsafe { QueueFamilyCaps::probe(&instance, physical_device) };
        let selection = QueueSelection::assign(&families)?;

        let device = unsafe { create_device(&instance, physical_device, &selection)? };
        let device = Arc::new(device);

        let mut role_queues = [None; QueueRole::ALL.len()];
        for role in QueueRole::ALL {
            role_queues[role as usize] = selection.queue_from_role(role).map(|a| unsafe {
                device.get_device_queue(a.family_index, a.queue_index)
            });
        }
        let main = selection.main();
        let main_queue = unsafe { device.get_device_queue(main.family_index, main.queue_index) };

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            allocator: Mutex::new(allocator),
            selection,
            main_queue,
            role_queues,
            uniform_alignment: properties.limits.min_uniform_buffer_offset_alignment,
        })
    }
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device, requesting the queue counts the selection
/// needs from each family.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    selection: &QueueSelection,
) -> Result<ash::Device> {
    let family_counts = selection.family_queue_counts();

    let priorities: Vec<Vec<f32>> = family_counts
        .iter()
        .map(|&(_, count)| vec![1.0_f32; count as usize])
        .collect();
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = family_counts
        .iter()
        .zip(&priorities)
        .map(|(&(family, _), priorities)| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(priorities)
        })
        .collect();

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .runtime_descriptor_array(true);

    let mut features2 =
        vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default())
            .push_next(&mut vulkan_1_3_features)
            .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(GpuError::from)?
    };

    Ok(device)
}
