// Owned Vulkan handles
//
// One wrapper type per object kind. The wrapper keeps the logical device
// alive and destroys the raw handle exactly once, in Drop. Nothing else in
// the crate calls vkDestroy* for these types.

use ash::vk;
use std::sync::Arc;

use super::LogicalDevice;

/// A raw handle type that is destroyed through the logical device.
pub trait DeviceObject: Copy + std::fmt::Debug {
    /// # Safety
    /// `self` must have been created from `device` and must no longer be
    /// referenced by pending GPU work.
    unsafe fn destroy(self, device: &ash::Device);
}

macro_rules! device_object {
    ($($ty:ty => $destroy:ident),* $(,)?) => {
        $(
            impl DeviceObject for $ty {
                unsafe fn destroy(self, device: &ash::Device) {
                    device.$destroy(self, None);
                }
            }
        )*
    };
}

device_object! {
    vk::Semaphore => destroy_semaphore,
    vk::Fence => destroy_fence,
    vk::ImageView => destroy_image_view,
    vk::Framebuffer => destroy_framebuffer,
    vk::RenderPass => destroy_render_pass,
    vk::Sampler => destroy_sampler,
    vk::DescriptorSetLayout => destroy_descriptor_set_layout,
    vk::DescriptorPool => destroy_descriptor_pool,
    vk::PipelineLayout => destroy_pipeline_layout,
    vk::Pipeline => destroy_pipeline,
    vk::ShaderModule => destroy_shader_module,
}

pub struct Owned<T: DeviceObject> {
    device: Arc<LogicalDevice>,
    raw: T,
}

impl<T: DeviceObject> Owned<T> {
    /// Takes ownership of `raw`, which must have been created from `device`.
    pub fn new(device: &Arc<LogicalDevice>, raw: T) -> Self {
        Self {
            device: device.clone(),
            raw,
        }
    }

    #[inline]
    pub fn raw(&self) -> T {
        self.raw
    }
}

impl<T: DeviceObject> std::fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Owned").field(&self.raw).finish()
    }
}

impl<T: DeviceObject> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: raw came from this device; owners wait for idle or for the
        // relevant fence before dropping.
        unsafe { self.raw.destroy(&self.device.device) }
    }
}

pub type OwnedSemaphore = Owned<vk::Semaphore>;
pub type OwnedFence = Owned<vk::Fence>;
pub type OwnedImageView = Owned<vk::ImageView>;
pub type OwnedFramebuffer = Owned<vk::Framebuffer>;
pub type OwnedRenderPass = Owned<vk::RenderPass>;
pub type OwnedSampler = Owned<vk::Sampler>;
pub type OwnedDescriptorSetLayout = Owned<vk::DescriptorSetLayout>;
pub type OwnedDescriptorPool = Owned<vk::DescriptorPool>;
pub type OwnedPipelineLayout = Owned<vk::PipelineLayout>;
pub type OwnedPipeline = Owned<vk::Pipeline>;
pub type OwnedShaderModule = Owned<vk::ShaderModule>;

/// A descriptor set that returns itself to its pool on drop.
///
/// Holds the pool alive, so sets can never outlive it. The pool must have
/// been created with `FREE_DESCRIPTOR_SET`.
pub struct OwnedDescriptorSet {
    pool: Arc<OwnedDescriptorPool>,
    raw: vk::DescriptorSet,
}

impl OwnedDescriptorSet {
    pub fn new(pool: &Arc<OwnedDescriptorPool>, raw: vk::DescriptorSet) -> Self {
        Self {
            pool: pool.clone(),
            raw,
        }
    }

    #[inline]
    pub fn raw(&self) -> vk::DescriptorSet {
        self.raw
    }
}

impl Drop for OwnedDescriptorSet {
    fn drop(&mut self) {
        let result = unsafe {
            self.pool
                .device
                .device
                .free_descriptor_sets(self.pool.raw(), &[self.raw])
        };
        if let Err(e) = result {
            log::warn!("Failed to free descriptor set {:?}: {}", self.raw, e);
        }
    }
}

/// Creates a semaphore wrapped for automatic destruction.
pub fn create_semaphore(device: &Arc<LogicalDevice>) -> Result<OwnedSemaphore, vk::Result> {
    let info = vk::SemaphoreCreateInfo::builder();
    let raw = unsafe { device.device.create_semaphore(&info, None) }?;
    Ok(Owned::new(device, raw))
}

/// Creates a fence, optionally already signaled.
pub fn create_fence(device: &Arc<LogicalDevice>, signaled: bool) -> Result<OwnedFence, vk::Result> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let info = vk::FenceCreateInfo::builder().flags(flags);
    let raw = unsafe { device.device.create_fence(&info, None) }?;
    Ok(Owned::new(device, raw))
}
