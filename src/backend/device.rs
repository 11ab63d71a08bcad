// Logical device - the selected GPU's queues, command pool and allocator
//
// Responsibilities:
// - Logical device + graphics/present queue creation
// - Command pool for the graphics family
// - Memory allocator shared by every buffer and image
// - One-shot command submission for uploads

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::handle;
use super::instance::Instance;
use super::selector::{DeviceFeature, PhysicalDeviceCapabilities};
use crate::error::{GraphicsError, Result};

pub struct LogicalDevice {
    // Freed in Drop before the device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub swapchain_loader: ash::extensions::khr::Swapchain,

    // Queue handles (may alias)
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    pub command_pool: vk::CommandPool,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Exactly the features switched on at creation.
    pub enabled_features: vk::PhysicalDeviceFeatures,

    instance: Arc<Instance>,
}

impl LogicalDevice {
    /// Create the logical device for a selected GPU.
    ///
    /// `required_features` are enabled on the device; selection already
    /// checked that they are supported.
    pub fn new(
        instance: &Arc<Instance>,
        caps: &PhysicalDeviceCapabilities,
        required_features: &[DeviceFeature],
    ) -> Result<Arc<Self>> {
        let (graphics_queue_family, present_queue_family) =
            match (caps.graphics_queue, caps.present_queue) {
                (Some(graphics), Some(present)) => (graphics, present),
                _ => return Err(GraphicsError::NoSuitableDevice),
            };

        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build()];
        if present_queue_family != graphics_queue_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(present_queue_family)
                    .queue_priorities(&queue_priorities)
                    .build(),
            );
        }

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];
        let features = DeviceFeature::enabled_set(required_features);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .instance
                .create_device(caps.physical_device, &create_info, None)
        }
        .map_err(|e| {
            log::error!("vkCreateDevice failed: {:?}", e);
            GraphicsError::CreatingLogicalDevice(e)
        })?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            // Frame command buffers are reset individually every use
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(GraphicsError::CreatingCommandPool(e));
            }
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device: caps.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_command_pool(command_pool, None);
                    device.destroy_device(None);
                }
                return Err(GraphicsError::CreatingAllocator(e));
            }
        };

        let swapchain_loader = ash::extensions::khr::Swapchain::new(&instance.instance, &device);

        log::info!(
            "Logical device ready: graphics family {}, present family {}",
            graphics_queue_family,
            present_queue_family
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(caps.properties.api_version),
            vk::api_version_minor(caps.properties.api_version),
            vk::api_version_patch(caps.properties.api_version)
        );

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            physical_device: caps.physical_device,
            swapchain_loader,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            command_pool,
            properties: caps.properties,
            memory_properties: caps.memory_properties,
            enabled_features: features,
            instance: instance.clone(),
        }))
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Wait for device to be idle (e.g., before destroying shared resources)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| GraphicsError::frame(e, GraphicsError::WaitingForIdle))
    }

    pub fn allocate(&self, desc: &AllocationCreateDesc) -> Result<Allocation> {
        self.allocator
            .lock()
            .allocate(desc)
            .map_err(GraphicsError::AllocatingMemory)
    }

    pub fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::warn!("Failed to free GPU allocation: {}", e);
        }
    }

    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(GraphicsError::CreatingCommandBuffer)
    }

    /// Record and run a command buffer once, blocking until the GPU is done.
    pub fn single_time_commands<F>(self: &Arc<Self>, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let command_buffers = self.allocate_command_buffers(1)?;
        let cmd = command_buffers[0];

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
                .map_err(GraphicsError::BeginningCommandBuffer)?;

            record(&self.device, cmd);

            unsafe { self.device.end_command_buffer(cmd) }
                .map_err(GraphicsError::EndingCommandBuffer)?;

            let fence = handle::create_fence(self, false).map_err(GraphicsError::CreatingSyncObjects)?;
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                self.device
                    .queue_submit(self.graphics_queue, &[submit_info.build()], fence.raw())
                    .map_err(|e| GraphicsError::frame(e, GraphicsError::SubmittingDrawCommand))?;
                self.device
                    .wait_for_fences(&[fence.raw()], true, u64::MAX)
                    .map_err(|e| GraphicsError::frame(e, GraphicsError::WaitingForFence))
            }
        })();

        unsafe { self.device.free_command_buffers(self.command_pool, &command_buffers) };
        result
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        log::info!("Destroying logical device...");

        if let Err(e) = self.wait_idle() {
            log::warn!("wait_idle during shutdown failed: {}", e);
        }

        unsafe {
            // Every allocation has been returned by now; the allocator itself
            // must go before the device it was created from.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
        }
    }
}
