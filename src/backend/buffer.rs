// GPU buffers backed by the shared allocator
//
// Host-visible buffers stay persistently mapped for their whole life; writes
// go straight through the mapped pointer.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::LogicalDevice;
use crate::error::{GraphicsError, Result};

pub struct AllocatedBuffer {
    device: Arc<LogicalDevice>,
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
}

impl std::fmt::Debug for AllocatedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl AllocatedBuffer {
    /// Helper to create a GPU buffer with specified usage and memory location
    pub fn new(
        device: &Arc<LogicalDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(GraphicsError::CreatingBuffer)?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            device.free(allocation);
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(GraphicsError::BindingMemory(e));
        }

        Ok(Self {
            device: device.clone(),
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Create a host-visible buffer and fill it with data
    pub fn with_data<T: Copy>(
        device: &Arc<LogicalDevice>,
        usage: vk::BufferUsageFlags,
        data: &[T],
        name: &str,
    ) -> Result<Self> {
        let bytes = unsafe {
            std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data))
        };
        let mut buffer = Self::new(
            device,
            bytes.len().max(1) as vk::DeviceSize,
            usage,
            MemoryLocation::CpuToGpu,
            name,
        )?;
        buffer.write_bytes(bytes)?;
        Ok(buffer)
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copies `data` to the start of a mapped buffer.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(GraphicsError::UniformTooLarge {
                data_bytes: data.len(),
                buffer_bytes: self.size,
            });
        }
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(GraphicsError::NotMapped)?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for AllocatedBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}
