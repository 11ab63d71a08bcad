// Swapchain - Window presentation
//
// Owns the presentable images together with their views and framebuffers,
// plus the render passes every framebuffer is compatible with. Recreation
// replaces the whole image set at once after the device went idle.

use ash::vk;
use std::sync::Arc;

use super::context::GraphicsContext;
use super::handle::{Owned, OwnedFramebuffer, OwnedImageView, OwnedRenderPass};
use super::instance::Surface;
use super::selector::SurfaceSupport;
use super::LogicalDevice;
use crate::error::{GraphicsError, Result};

/// Best-effort choices; each has a guaranteed fallback.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPreferences {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_mode: vk::PresentModeKHR::MAILBOX,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| formats.first().copied())
        .unwrap_or(preferred)
}

pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        // FIFO is always supported
        vk::PresentModeKHR::FIFO
    }
}

/// One more than the minimum, capped by the maximum (0 = no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recreate {
    /// Same extent and not stale: nothing to do.
    Unchanged,
    /// Zero-area surface (minimised): try again after the next resize.
    Deferred,
    Rebuild,
}

pub fn plan_recreate(current: vk::Extent2D, resolved: vk::Extent2D, stale: bool) -> Recreate {
    if resolved.width == 0 || resolved.height == 0 {
        Recreate::Deferred
    } else if !stale && resolved == current {
        Recreate::Unchanged
    } else {
        Recreate::Rebuild
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn wants_recreate(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

struct SwapchainImage {
    framebuffer: OwnedFramebuffer,
    _view: OwnedImageView,
    _image: vk::Image,
}

struct SwapchainHandle {
    device: Arc<LogicalDevice>,
    raw: vk::SwapchainKHR,
}

impl Drop for SwapchainHandle {
    fn drop(&mut self) {
        unsafe { self.device.swapchain_loader.destroy_swapchain(self.raw, None) };
    }
}

pub struct SurfaceSwapchain {
    // Views and framebuffers go before the swapchain that owns the images.
    images: Vec<SwapchainImage>,
    swapchain: Option<SwapchainHandle>,
    clear_pass: OwnedRenderPass,
    load_pass: OwnedRenderPass,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    support: SurfaceSupport,
    stale: bool,
    preferences: SwapchainPreferences,
    surface: Arc<Surface>,
    device: Arc<LogicalDevice>,
}

impl SurfaceSwapchain {
    pub fn create(
        context: &GraphicsContext,
        window_extent: vk::Extent2D,
        preferences: SwapchainPreferences,
    ) -> Result<Self> {
        let device = context.device().clone();
        let surface = context.surface().clone();

        let support = SurfaceSupport::query(&surface, device.physical_device)?;
        let format = choose_surface_format(&support.formats, preferences.surface_format);
        let (clear_pass, load_pass) = create_render_passes(&device, format.format)?;

        let mut swapchain = Self {
            images: Vec::new(),
            swapchain: None,
            clear_pass,
            load_pass,
            format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            support,
            stale: true,
            preferences,
            surface,
            device,
        };
        swapchain.build(window_extent)?;
        Ok(swapchain)
    }

    /// Rebuilds for a new window size. Returns whether anything was rebuilt.
    pub fn recreate(&mut self, window_extent: vk::Extent2D) -> Result<bool> {
        self.support = SurfaceSupport::query(&self.surface, self.device.physical_device)?;
        let resolved = choose_extent(&self.support.capabilities, window_extent);

        match plan_recreate(self.extent, resolved, self.stale) {
            Recreate::Unchanged => Ok(false),
            Recreate::Deferred => {
                log::debug!("Surface has zero area, deferring swapchain recreation");
                self.stale = true;
                Ok(false)
            }
            Recreate::Rebuild => {
                self.device.wait_idle()?;
                self.build(window_extent)?;
                Ok(true)
            }
        }
    }

    /// Forces the next `recreate` to rebuild even at the same extent.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    fn build(&mut self, window_extent: vk::Extent2D) -> Result<()> {
        let caps = self.support.capabilities;
        let extent = choose_extent(&caps, window_extent);
        if extent.width == 0 || extent.height == 0 {
            self.stale = true;
            return Ok(());
        }

        let format = choose_surface_format(&self.support.formats, self.preferences.surface_format);
        let present_mode = choose_present_mode(&self.support.present_modes, self.preferences.present_mode);
        let image_count = choose_image_count(&caps);

        // The surface can only have one swapchain at a time
        self.images.clear();
        self.swapchain = None;

        if format.format != self.format.format {
            log::warn!(
                "Surface format changed {:?} -> {:?}, rebuilding render passes",
                self.format.format,
                format.format
            );
            let (clear_pass, load_pass) = create_render_passes(&self.device, format.format)?;
            self.clear_pass = clear_pass;
            self.load_pass = load_pass;
        }

        let families = [
            self.device.graphics_queue_family,
            self.device.present_queue_family,
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        create_info = if families[0] != families[1] {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let raw = unsafe { self.device.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| {
                log::error!("vkCreateSwapchainKHR failed: {:?}", e);
                GraphicsError::CreatingSwapChain(e)
            })?;
        let handle = SwapchainHandle {
            device: self.device.clone(),
            raw,
        };

        let images = unsafe { self.device.swapchain_loader.get_swapchain_images(raw) }
            .map_err(GraphicsError::CreatingSwapChain)?;

        let mut triples = Vec::with_capacity(images.len());
        for image in images {
            let view = create_image_view(&self.device, image, format.format)?;
            let framebuffer =
                create_framebuffer(&self.device, self.clear_pass.raw(), view.raw(), extent)?;
            triples.push(SwapchainImage {
                framebuffer,
                _view: view,
                _image: image,
            });
        }

        log::info!(
            "Created swapchain {}x{} with {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            triples.len(),
            format.format,
            present_mode
        );

        self.images = triples;
        self.swapchain = Some(handle);
        self.format = format;
        self.present_mode = present_mode;
        self.extent = extent;
        self.stale = false;
        Ok(())
    }

    /// `None` while the surface has zero area.
    fn raw(&self) -> Option<vk::SwapchainKHR> {
        self.swapchain.as_ref().map(|handle| handle.raw)
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let Some(raw) = self.raw() else {
            return Ok(AcquireOutcome::OutOfDate);
        };

        let result = unsafe {
            self.device
                .swapchain_loader
                .acquire_next_image(raw, u64::MAX, semaphore, vk::Fence::null())
        };

        match result.map_err(|e| GraphicsError::frame(e, GraphicsError::AcquiringNextImage)) {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(GraphicsError::SwapchainOutOfDate) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => {
                log::error!("vkAcquireNextImageKHR failed: {}", e);
                Err(e)
            }
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let Some(raw) = self.raw() else {
            return Ok(PresentOutcome::OutOfDate);
        };
        let swapchains = [raw];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        match result.map_err(|e| GraphicsError::frame(e, GraphicsError::PresentingQueue)) {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(GraphicsError::SwapchainOutOfDate) => Ok(PresentOutcome::OutOfDate),
            Err(e) => {
                log::error!("vkQueuePresentKHR failed: {}", e);
                Err(e)
            }
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn support(&self) -> &SurfaceSupport {
        &self.support
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.images[image_index as usize].framebuffer.raw()
    }

    /// Clears the image; used by the first batch of a frame.
    pub fn clear_pass(&self) -> vk::RenderPass {
        self.clear_pass.raw()
    }

    /// Keeps earlier batches' output; used by every later batch.
    pub fn load_pass(&self) -> vk::RenderPass {
        self.load_pass.raw()
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.preferences.clear_color
    }
}

fn create_image_view(
    device: &Arc<LogicalDevice>,
    image: vk::Image,
    format: vk::Format,
) -> Result<OwnedImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    let view = unsafe { device.device.create_image_view(&create_info, None) }
        .map_err(GraphicsError::CreatingImageView)?;
    Ok(Owned::new(device, view))
}

fn create_framebuffer(
    device: &Arc<LogicalDevice>,
    render_pass: vk::RenderPass,
    view: vk::ImageView,
    extent: vk::Extent2D,
) -> Result<OwnedFramebuffer> {
    let attachments = [view];
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(&attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
        .map_err(GraphicsError::CreatingFramebuffer)?;
    Ok(Owned::new(device, framebuffer))
}

/// Clear pass and a compatible load pass sharing one colour attachment format.
fn create_render_passes(
    device: &Arc<LogicalDevice>,
    format: vk::Format,
) -> Result<(OwnedRenderPass, OwnedRenderPass)> {
    let clear = create_render_pass(
        device,
        format,
        vk::AttachmentLoadOp::CLEAR,
        vk::ImageLayout::UNDEFINED,
    )?;
    let load = create_render_pass(
        device,
        format,
        vk::AttachmentLoadOp::LOAD,
        vk::ImageLayout::PRESENT_SRC_KHR,
    )?;
    Ok((clear, load))
}

fn create_render_pass(
    device: &Arc<LogicalDevice>,
    format: vk::Format,
    load_op: vk::AttachmentLoadOp,
    initial_layout: vk::ImageLayout,
) -> Result<OwnedRenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(load_op)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(initial_layout)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = [color_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];
    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .map_err(GraphicsError::CreatingRenderPass)?;
    Ok(Owned::new(device, render_pass))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn uses_current_extent_when_defined() {
        let c = caps((800, 600), (1, 1), (4096, 4096));
        assert_eq!(choose_extent(&c, extent(1920, 1080)), extent(800, 600));
    }

    #[test]
    fn clamps_window_size_when_extent_undefined() {
        let c = caps((u32::MAX, u32::MAX), (64, 64), (2048, 1024));
        assert_eq!(choose_extent(&c, extent(1920, 1080)), extent(1920, 1024));
        assert_eq!(choose_extent(&c, extent(10, 10)), extent(64, 64));
    }

    #[test]
    fn prefers_configured_format_pair() {
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let other = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[other, preferred], preferred);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);

        // Same format, wrong colour space: falls back to the first entry.
        let hdr = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        };
        let chosen = choose_surface_format(&[other, hdr], preferred);
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_SRGB);
    }

    #[test]
    fn fifo_only_surface_selects_fifo() {
        let modes = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn preferred_mode_used_when_available() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        let mut c = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 2;
        assert_eq!(choose_image_count(&c), 2);
        c.max_image_count = 8;
        assert_eq!(choose_image_count(&c), 3);
    }

    #[test]
    fn recreate_at_same_extent_does_nothing() {
        let current = extent(800, 600);
        assert_eq!(plan_recreate(current, current, false), Recreate::Unchanged);
        assert_eq!(plan_recreate(current, current, false), Recreate::Unchanged);
    }

    #[test]
    fn resize_rebuilds() {
        assert_eq!(
            plan_recreate(extent(800, 600), extent(1920, 1080), false),
            Recreate::Rebuild
        );
    }

    #[test]
    fn stale_swapchain_rebuilds_at_same_extent() {
        let current = extent(800, 600);
        assert_eq!(plan_recreate(current, current, true), Recreate::Rebuild);
    }

    #[test]
    fn minimised_surface_defers() {
        assert_eq!(plan_recreate(extent(800, 600), extent(0, 600), false), Recreate::Deferred);
        assert_eq!(plan_recreate(extent(800, 600), extent(0, 0), true), Recreate::Deferred);
    }

    #[test]
    fn only_clean_presents_skip_recreation() {
        assert!(!PresentOutcome::Presented.wants_recreate());
        assert!(PresentOutcome::Suboptimal.wants_recreate());
        assert!(PresentOutcome::OutOfDate.wants_recreate());
    }
}
