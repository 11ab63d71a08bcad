// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to defaults field by field, so a partial file is
// fine. Enum-like strings (formats, present modes) are resolved lazily and
// fall back with a warning instead of failing the load.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::selector::DeviceFeature;
use crate::backend::swapchain::SwapchainPreferences;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub demo: DemoConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vk-frames".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Fixed for the lifetime of the process. Must be at least 2.
    pub frames_in_flight: usize,
    pub preferred_format: String,
    pub preferred_color_space: String,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Device features a GPU must support to be selected. Enabled on the
    /// logical device as well.
    pub required_features: Vec<DeviceFeature>,
    /// Descriptor sets allocated per frame slot; one per batch.
    pub max_batches_per_frame: u32,
    pub single_image_pool_size: u32,
    pub ui_pool_size: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            preferred_format: "b8g8r8a8_unorm".to_string(),
            preferred_color_space: "srgb_nonlinear".to_string(),
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            required_features: vec![DeviceFeature::SamplerAnisotropy],
            max_batches_per_frame: 8,
            single_image_pool_size: 1000,
            ui_pool_size: 1000,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vk_frames.log".to_string(),
        }
    }
}

/// Demo binary settings. Without shaders the demo only clears the screen.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DemoConfig {
    pub vertex_shader: Option<String>,
    pub fragment_shader: Option<String>,
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let graphics = &self.graphics;
        if graphics.frames_in_flight < 2 {
            anyhow::bail!(
                "graphics.frames_in_flight must be at least 2 (got {})",
                graphics.frames_in_flight
            );
        }
        if graphics.max_batches_per_frame == 0 {
            anyhow::bail!("graphics.max_batches_per_frame must be at least 1");
        }
        Ok(())
    }
}

impl GraphicsConfig {
    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        let format = match self.preferred_format.to_lowercase().as_str() {
            "b8g8r8a8_unorm" => vk::Format::B8G8R8A8_UNORM,
            "b8g8r8a8_srgb" => vk::Format::B8G8R8A8_SRGB,
            "r8g8b8a8_unorm" => vk::Format::R8G8B8A8_UNORM,
            "r8g8b8a8_srgb" => vk::Format::R8G8B8A8_SRGB,
            "a2b10g10r10_unorm" => vk::Format::A2B10G10R10_UNORM_PACK32,
            _ => {
                log::warn!(
                    "Unknown surface format '{}', defaulting to B8G8R8A8_UNORM",
                    self.preferred_format
                );
                vk::Format::B8G8R8A8_UNORM
            }
        };
        let color_space = match self.preferred_color_space.to_lowercase().as_str() {
            "srgb_nonlinear" => vk::ColorSpaceKHR::SRGB_NONLINEAR,
            "extended_srgb_linear" => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            "hdr10_st2084" => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
            _ => {
                log::warn!(
                    "Unknown color space '{}', defaulting to SRGB_NONLINEAR",
                    self.preferred_color_space
                );
                vk::ColorSpaceKHR::SRGB_NONLINEAR
            }
        };
        vk::SurfaceFormatKHR { format, color_space }
    }

    pub fn swapchain_preferences(&self) -> SwapchainPreferences {
        SwapchainPreferences {
            surface_format: self.surface_format(),
            present_mode: self.present_mode(),
            clear_color: self.clear_color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.graphics.required_features, vec![DeviceFeature::SamplerAnisotropy]);
        assert_eq!(config.window.width, 1280);
        assert!(config.demo.vertex_shader.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            frames_in_flight = 3
            required_features = ["fill_mode_non_solid", "geometry_shader"]

            [window]
            title = "test"
            "#,
        )
        .unwrap();

        assert_eq!(config.graphics.frames_in_flight, 3);
        assert_eq!(
            config.graphics.required_features,
            vec![DeviceFeature::FillModeNonSolid, DeviceFeature::GeometryShader]
        );
        assert_eq!(config.graphics.present_mode, "mailbox");
        assert_eq!(config.window.title, "test");
        assert_eq!(config.window.height, 720);
    }

    #[test]
    fn single_frame_in_flight_is_rejected() {
        let err = Config::from_toml("[graphics]\nframes_in_flight = 1\n").unwrap_err();
        assert!(err.to_string().contains("frames_in_flight"));
    }

    #[test]
    fn unknown_feature_name_fails_to_parse() {
        assert!(Config::from_toml("[graphics]\nrequired_features = [\"warp_drive\"]\n").is_err());
    }

    #[test]
    fn enum_strings_resolve_and_fall_back() {
        let mut graphics = GraphicsConfig::default();
        assert_eq!(graphics.present_mode(), vk::PresentModeKHR::MAILBOX);

        graphics.present_mode = "FIFO".to_string();
        assert_eq!(graphics.present_mode(), vk::PresentModeKHR::FIFO);

        graphics.present_mode = "bogus".to_string();
        assert_eq!(graphics.present_mode(), vk::PresentModeKHR::MAILBOX);

        graphics.preferred_format = "r8g8b8a8_srgb".to_string();
        let format = graphics.surface_format();
        assert_eq!(format.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(format.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.graphics.max_batches_per_frame, 8);
    }
}
