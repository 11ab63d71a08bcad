// Sampled textures
//
// Pixel data is staged through a host-visible buffer and copied into a
// device-local R8G8B8A8 image. RGB input is widened to RGBA on the CPU first.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::borrow::Cow;
use std::sync::Arc;

use super::buffer::AllocatedBuffer;
use super::handle::{Owned, OwnedImageView, OwnedSampler};
use super::LogicalDevice;
use crate::error::{GraphicsError, Result};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Maximum anisotropy for texture samplers, or `None` when the device was
/// created without the feature.
pub fn sampler_anisotropy(enabled: &vk::PhysicalDeviceFeatures, limits: &vk::PhysicalDeviceLimits) -> Option<f32> {
    (enabled.sampler_anisotropy == vk::TRUE).then_some(limits.max_sampler_anisotropy)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Rgba8,
    Rgb8,
}

impl PixelLayout {
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Rgba8 => 4,
            PixelLayout::Rgb8 => 3,
        }
    }
}

/// Checks the size of `data` and returns it as tightly packed RGBA8.
pub fn to_rgba8(width: u32, height: u32, layout: PixelLayout, data: &[u8]) -> Result<Cow<'_, [u8]>> {
    if width == 0 || height == 0 {
        return Err(GraphicsError::InvalidTextureData(format!(
            "zero-sized texture {}x{}",
            width, height
        )));
    }
    let expected = width as usize * height as usize * layout.channels();
    if data.len() != expected {
        return Err(GraphicsError::InvalidTextureData(format!(
            "{}x{} {:?} needs {} bytes, got {}",
            width,
            height,
            layout,
            expected,
            data.len()
        )));
    }

    Ok(match layout {
        PixelLayout::Rgba8 => Cow::Borrowed(data),
        PixelLayout::Rgb8 => Cow::Owned(
            data.chunks_exact(3)
                .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], u8::MAX])
                .collect(),
        ),
    })
}

pub struct AllocatedImage {
    device: Arc<LogicalDevice>,
    pub image: vk::Image,
    allocation: Option<Allocation>,
    pub extent: vk::Extent2D,
}

impl AllocatedImage {
    fn new(device: &Arc<LogicalDevice>, extent: vk::Extent2D, name: &str) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(TEXTURE_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(GraphicsError::CreatingImage)?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = match device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            device.free(allocation);
            unsafe { device.device.destroy_image(image, None) };
            return Err(GraphicsError::BindingMemory(e));
        }

        Ok(Self {
            device: device.clone(),
            image,
            allocation: Some(allocation),
            extent,
        })
    }
}

impl Drop for AllocatedImage {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image(self.image, None) };
        if let Some(allocation) = self.allocation.take() {
            self.device.free(allocation);
        }
    }
}

/// Image, view and sampler of one uploaded texture.
///
/// Field order is drop order: the sampler and view go before the image.
pub struct TextureImage {
    pub sampler: OwnedSampler,
    pub view: OwnedImageView,
    pub image: AllocatedImage,
}

impl TextureImage {
    pub fn upload(
        device: &Arc<LogicalDevice>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        data: &[u8],
    ) -> Result<Self> {
        let pixels = to_rgba8(width, height, layout, data)?;
        let extent = vk::Extent2D { width, height };

        let staging = AllocatedBuffer::with_data(
            device,
            vk::BufferUsageFlags::TRANSFER_SRC,
            &*pixels,
            "texture staging",
        )?;
        let image = AllocatedImage::new(device, extent, "texture")?;

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        device.single_time_commands(|vk_device, cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.image)
                .subresource_range(subresource_range)
                .build();
            vk_device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();
            vk_device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.image)
                .subresource_range(subresource_range)
                .build();
            vk_device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        })?;
        // Upload finished; the staging buffer can go.
        drop(staging);

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .subresource_range(subresource_range);
        let view = unsafe { device.device.create_image_view(&view_info, None) }
            .map_err(GraphicsError::CreatingImageView)?;
        let view = Owned::new(device, view);

        let anisotropy = sampler_anisotropy(&device.enabled_features, &device.properties.limits);
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .min_lod(0.0)
            .max_lod(0.0);
        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .map_err(GraphicsError::CreatingSampler)?;
        let sampler = Owned::new(device, sampler);

        log::debug!("Uploaded {}x{} texture", width, height);

        Ok(Self {
            sampler,
            view,
            image,
        })
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler.raw(),
            image_view: self.view.raw(),
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_passes_through_untouched() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let out = to_rgba8(2, 1, PixelLayout::Rgba8, &data).unwrap();
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &data);
    }

    #[test]
    fn rgb_gains_opaque_alpha() {
        let data = [10u8, 20, 30, 40, 50, 60];
        let out = to_rgba8(1, 2, PixelLayout::Rgb8, &data).unwrap();
        assert_eq!(&*out, &[10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = to_rgba8(2, 2, PixelLayout::Rgb8, &[0u8; 11]).unwrap_err();
        assert!(matches!(err, GraphicsError::InvalidTextureData(_)));
        assert!(err.to_string().contains("needs 12 bytes"));
    }

    #[test]
    fn anisotropy_follows_enabled_feature() {
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.max_sampler_anisotropy = 16.0;

        let mut enabled = vk::PhysicalDeviceFeatures::default();
        assert_eq!(sampler_anisotropy(&enabled, &limits), None);

        enabled.sampler_anisotropy = vk::TRUE;
        assert_eq!(sampler_anisotropy(&enabled, &limits), Some(16.0));
    }

    #[test]
    fn zero_extent_is_rejected() {
        assert!(to_rgba8(0, 4, PixelLayout::Rgba8, &[]).is_err());
    }
}
