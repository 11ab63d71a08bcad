// Physical device selection
//
// Every GPU is snapshotted into a PhysicalDeviceCapabilities value first. All
// scoring and queue decisions work on those snapshots only, so they can be
// exercised without a driver.

use ash::vk;
use serde::Deserialize;
use std::ffi::CStr;

use super::instance::{Instance, Surface};
use crate::error::{GraphicsError, Result};

/// Device features that can be required through configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFeature {
    SamplerAnisotropy,
    FillModeNonSolid,
    WideLines,
    LargePoints,
    GeometryShader,
    TessellationShader,
    IndependentBlend,
    MultiDrawIndirect,
    ShaderInt64,
}

impl DeviceFeature {
    fn field(self, features: &mut vk::PhysicalDeviceFeatures) -> &mut vk::Bool32 {
        match self {
            DeviceFeature::SamplerAnisotropy => &mut features.sampler_anisotropy,
            DeviceFeature::FillModeNonSolid => &mut features.fill_mode_non_solid,
            DeviceFeature::WideLines => &mut features.wide_lines,
            DeviceFeature::LargePoints => &mut features.large_points,
            DeviceFeature::GeometryShader => &mut features.geometry_shader,
            DeviceFeature::TessellationShader => &mut features.tessellation_shader,
            DeviceFeature::IndependentBlend => &mut features.independent_blend,
            DeviceFeature::MultiDrawIndirect => &mut features.multi_draw_indirect,
            DeviceFeature::ShaderInt64 => &mut features.shader_int64,
        }
    }

    pub fn is_supported(self, features: &vk::PhysicalDeviceFeatures) -> bool {
        let mut copy = *features;
        *self.field(&mut copy) == vk::TRUE
    }

    /// Feature struct with exactly `required` switched on.
    pub fn enabled_set(required: &[DeviceFeature]) -> vk::PhysicalDeviceFeatures {
        let mut features = vk::PhysicalDeviceFeatures::default();
        for feature in required {
            *feature.field(&mut features) = vk::TRUE;
        }
        features
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueFamily {
    pub index: u32,
    pub flags: vk::QueueFlags,
    pub queue_count: u32,
    /// Presentation support against the surface the snapshot was taken with.
    pub supports_present: bool,
}

/// Surface-dependent part of a device snapshot.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(surface: &Surface, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let loader = surface.loader();
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface.surface)
                    .map_err(GraphicsError::QueryingSurface)?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface.surface)
                    .map_err(GraphicsError::QueryingSurface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface.surface)
                    .map_err(GraphicsError::QueryingSurface)?,
            })
        }
    }
}

/// Immutable snapshot of one GPU as seen through one surface.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceCapabilities {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub queue_families: Vec<QueueFamily>,
    pub supports_swapchain: bool,
    pub surface: SurfaceSupport,
    pub graphics_queue: Option<u32>,
    pub present_queue: Option<u32>,
}

impl PhysicalDeviceCapabilities {
    pub fn query(
        instance: &Instance,
        surface: &Surface,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let vk_instance = &instance.instance;
        let (properties, features, memory_properties, family_properties) = unsafe {
            (
                vk_instance.get_physical_device_properties(physical_device),
                vk_instance.get_physical_device_features(physical_device),
                vk_instance.get_physical_device_memory_properties(physical_device),
                vk_instance.get_physical_device_queue_family_properties(physical_device),
            )
        };

        let mut queue_families = Vec::with_capacity(family_properties.len());
        for (index, family) in family_properties.iter().enumerate() {
            let index = index as u32;
            let supports_present = unsafe {
                surface.loader().get_physical_device_surface_support(
                    physical_device,
                    index,
                    surface.surface,
                )
            }
            .map_err(GraphicsError::QueryingSurface)?;
            queue_families.push(QueueFamily {
                index,
                flags: family.queue_flags,
                queue_count: family.queue_count,
                supports_present,
            });
        }

        let extensions = unsafe { vk_instance.enumerate_device_extension_properties(physical_device) }
            .map_err(GraphicsError::EnumeratingDevices)?;
        let swapchain_name = ash::extensions::khr::Swapchain::name();
        let supports_swapchain = extensions.iter().any(|ext| {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            name == swapchain_name
        });

        let surface_support = SurfaceSupport::query(surface, physical_device)?;
        let (graphics_queue, present_queue) = resolve_queues(&queue_families);

        Ok(Self {
            physical_device,
            properties,
            features,
            memory_properties,
            queue_families,
            supports_swapchain,
            surface: surface_support,
            graphics_queue,
            present_queue,
        })
    }

    /// Re-reads the surface-dependent fields after the surface changed.
    pub fn refresh_surface(&mut self, surface: &Surface) -> Result<()> {
        self.surface = SurfaceSupport::query(surface, self.physical_device)?;
        Ok(())
    }

    pub fn name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn is_presentable(&self) -> bool {
        self.present_queue.is_some() && self.supports_swapchain
    }
}

/// Picks (graphics, present) family indices in one pass.
///
/// A family that can do both wins outright. Otherwise the first graphics
/// family and the first present family are returned independently.
pub fn resolve_queues(families: &[QueueFamily]) -> (Option<u32>, Option<u32>) {
    let mut graphics = None;
    let mut present = None;

    for family in families {
        let has_graphics = family.queue_count > 0 && family.flags.contains(vk::QueueFlags::GRAPHICS);
        let has_present = family.queue_count > 0 && family.supports_present;

        if has_graphics && has_present {
            return (Some(family.index), Some(family.index));
        }
        if has_graphics && graphics.is_none() {
            graphics = Some(family.index);
        }
        if has_present && present.is_none() {
            present = Some(family.index);
        }
    }

    (graphics, present)
}

const DISCRETE_GPU_BONUS: u64 = 1000;

pub struct DeviceSelector {
    required_features: Vec<DeviceFeature>,
}

impl DeviceSelector {
    pub fn new(required_features: &[DeviceFeature]) -> Self {
        Self {
            required_features: required_features.to_vec(),
        }
    }

    /// 0 means disqualified.
    pub fn score(&self, caps: &PhysicalDeviceCapabilities) -> u64 {
        let features_ok = self
            .required_features
            .iter()
            .all(|feature| feature.is_supported(&caps.features));
        if !features_ok {
            return 0;
        }
        if caps.surface.formats.is_empty() || caps.surface.present_modes.is_empty() {
            return 0;
        }
        if caps.graphics_queue.is_none() {
            return 0;
        }

        let mut score = 0;
        if caps.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += DISCRETE_GPU_BONUS;
        }
        score + u64::from(caps.properties.limits.max_image_dimension2_d)
    }

    /// Snapshots every GPU against `surface`, highest score first.
    pub fn enumerate(
        &self,
        instance: &Instance,
        surface: &Surface,
    ) -> Result<Vec<PhysicalDeviceCapabilities>> {
        let devices = unsafe { instance.instance.enumerate_physical_devices() }
            .map_err(GraphicsError::EnumeratingDevices)?;

        let mut candidates = devices
            .into_iter()
            .map(|device| PhysicalDeviceCapabilities::query(instance, surface, device))
            .collect::<Result<Vec<_>>>()?;

        self.sort(&mut candidates);
        Ok(candidates)
    }

    fn sort(&self, candidates: &mut [PhysicalDeviceCapabilities]) {
        candidates.sort_by_key(|caps| std::cmp::Reverse(self.score(caps)));
    }

    /// Highest scoring presentable candidate.
    pub fn select(
        &self,
        mut candidates: Vec<PhysicalDeviceCapabilities>,
    ) -> Result<PhysicalDeviceCapabilities> {
        self.sort(&mut candidates);

        for caps in candidates {
            let score = self.score(&caps);
            if score == 0 {
                break;
            }
            if !caps.is_presentable() {
                log::warn!(
                    "Skipping {}: no present queue or no swapchain support",
                    caps.name()
                );
                continue;
            }
            log::info!("Selected GPU: {} (score {})", caps.name(), score);
            return Ok(caps);
        }

        log::error!("Device selection failed: no GPU scored above zero");
        Err(GraphicsError::NoSuitableDevice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn family(index: u32, flags: vk::QueueFlags, present: bool) -> QueueFamily {
        QueueFamily {
            index,
            flags,
            queue_count: 1,
            supports_present: present,
        }
    }

    fn caps(
        raw: u64,
        device_type: vk::PhysicalDeviceType,
        max_dimension: u32,
    ) -> PhysicalDeviceCapabilities {
        let mut properties = vk::PhysicalDeviceProperties::default();
        properties.device_type = device_type;
        properties.limits.max_image_dimension2_d = max_dimension;

        let families = vec![family(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, true)];
        let (graphics_queue, present_queue) = resolve_queues(&families);

        PhysicalDeviceCapabilities {
            physical_device: vk::PhysicalDevice::from_raw(raw),
            properties,
            features: DeviceFeature::enabled_set(&[DeviceFeature::SamplerAnisotropy]),
            memory_properties: vk::PhysicalDeviceMemoryProperties::default(),
            queue_families: families,
            supports_swapchain: true,
            surface: SurfaceSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            },
            graphics_queue,
            present_queue,
        }
    }

    fn selector() -> DeviceSelector {
        DeviceSelector::new(&[DeviceFeature::SamplerAnisotropy])
    }

    #[test]
    fn discrete_gpu_gets_bonus() {
        let s = selector();
        let discrete = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        let integrated = caps(2, vk::PhysicalDeviceType::INTEGRATED_GPU, 16384);
        assert_eq!(s.score(&discrete), 1000 + 16384);
        assert_eq!(s.score(&integrated), 16384);
    }

    #[test]
    fn empty_formats_or_modes_disqualify() {
        let s = selector();
        let mut no_formats = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_formats.surface.formats.clear();
        assert_eq!(s.score(&no_formats), 0);

        let mut no_modes = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        no_modes.surface.present_modes.clear();
        assert_eq!(s.score(&no_modes), 0);
    }

    #[test]
    fn unresolved_graphics_queue_zeroes_score() {
        let s = selector();
        let mut compute_only = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        compute_only.queue_families = vec![family(0, vk::QueueFlags::COMPUTE, true)];
        let (g, p) = resolve_queues(&compute_only.queue_families);
        compute_only.graphics_queue = g;
        compute_only.present_queue = p;
        assert_eq!(g, None);
        assert_eq!(s.score(&compute_only), 0);
    }

    #[test]
    fn required_features_come_from_config() {
        let mut device = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 8192);
        device.features = vk::PhysicalDeviceFeatures::default();

        assert_eq!(selector().score(&device), 0);
        // Nothing required: the same device qualifies.
        assert!(DeviceSelector::new(&[]).score(&device) > 0);

        device.features = DeviceFeature::enabled_set(&[
            DeviceFeature::SamplerAnisotropy,
            DeviceFeature::GeometryShader,
        ]);
        let strict = DeviceSelector::new(&[DeviceFeature::GeometryShader]);
        assert!(strict.score(&device) > 0);
        assert!(!DeviceFeature::WideLines.is_supported(&device.features));
    }

    #[test]
    fn score_is_zero_exactly_when_disqualified() {
        let s = selector();
        for formats_empty in [false, true] {
            for modes_empty in [false, true] {
                for graphics_missing in [false, true] {
                    let mut c = caps(7, vk::PhysicalDeviceType::INTEGRATED_GPU, 4096);
                    if formats_empty {
                        c.surface.formats.clear();
                    }
                    if modes_empty {
                        c.surface.present_modes.clear();
                    }
                    if graphics_missing {
                        c.graphics_queue = None;
                    }
                    let disqualified = formats_empty || modes_empty || graphics_missing;
                    assert_eq!(s.score(&c) == 0, disqualified);
                }
            }
        }
    }

    #[test]
    fn prefers_family_with_graphics_and_present() {
        let families = vec![
            family(0, vk::QueueFlags::GRAPHICS, false),
            family(1, vk::QueueFlags::TRANSFER, true),
            family(2, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
        ];
        assert_eq!(resolve_queues(&families), (Some(2), Some(2)));
    }

    #[test]
    fn resolves_present_separately_when_no_family_does_both() {
        let families = vec![
            family(0, vk::QueueFlags::GRAPHICS, false),
            family(1, vk::QueueFlags::TRANSFER, true),
        ];
        assert_eq!(resolve_queues(&families), (Some(0), Some(1)));
    }

    #[test]
    fn empty_families_are_ignored() {
        let mut empty = family(0, vk::QueueFlags::GRAPHICS, true);
        empty.queue_count = 0;
        let families = vec![empty, family(1, vk::QueueFlags::GRAPHICS, true)];
        assert_eq!(resolve_queues(&families), (Some(1), Some(1)));
    }

    #[test]
    fn selects_highest_score() {
        let chosen = selector()
            .select(vec![
                caps(1, vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
                caps(2, vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
                caps(3, vk::PhysicalDeviceType::CPU, 4096),
            ])
            .unwrap();
        assert_eq!(chosen.physical_device.as_raw(), 2);
    }

    #[test]
    fn larger_image_limit_can_outweigh_discrete_bonus() {
        // 16384 > 1000 + 8192
        let chosen = selector()
            .select(vec![
                caps(1, vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
                caps(2, vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            ])
            .unwrap();
        assert_eq!(chosen.physical_device.as_raw(), 1);
    }

    #[test]
    fn skips_devices_that_cannot_present() {
        let mut best = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        best.supports_swapchain = false;
        let fallback = caps(2, vk::PhysicalDeviceType::INTEGRATED_GPU, 4096);

        let chosen = selector().select(vec![best, fallback]).unwrap();
        assert_eq!(chosen.physical_device.as_raw(), 2);
    }

    #[test]
    fn no_suitable_device() {
        assert!(matches!(
            selector().select(Vec::new()),
            Err(GraphicsError::NoSuitableDevice)
        ));

        let mut unusable = caps(1, vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        unusable.surface.formats.clear();
        assert!(matches!(
            selector().select(vec![unusable]),
            Err(GraphicsError::NoSuitableDevice)
        ));
    }
}
