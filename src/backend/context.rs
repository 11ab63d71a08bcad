// Graphics context
//
// Instance, surface and logical device bundled into one value that is passed
// explicitly to everything that needs GPU access.

use std::sync::Arc;

use super::instance::{Instance, Surface};
use super::selector::{DeviceSelector, PhysicalDeviceCapabilities};
use super::LogicalDevice;
use crate::config::GraphicsConfig;
use crate::error::Result;

pub struct GraphicsContext {
    capabilities: PhysicalDeviceCapabilities,
    device: Arc<LogicalDevice>,
    surface: Arc<Surface>,
    instance: Arc<Instance>,
}

impl GraphicsContext {
    /// Picks a GPU that can present to `surface` and creates its device.
    pub fn new(instance: &Arc<Instance>, surface: Surface, config: &GraphicsConfig) -> Result<Self> {
        log::info!("Selecting GPU...");

        let selector = DeviceSelector::new(&config.required_features);
        let candidates = selector.enumerate(instance, &surface)?;
        for caps in &candidates {
            log::debug!("  candidate {} (score {})", caps.name(), selector.score(caps));
        }
        let capabilities = selector.select(candidates)?;

        let device = LogicalDevice::new(instance, &capabilities, &config.required_features)?;

        Ok(Self {
            capabilities,
            device,
            surface: Arc::new(surface),
            instance: instance.clone(),
        })
    }

    pub fn device(&self) -> &Arc<LogicalDevice> {
        &self.device
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Snapshot taken at selection time. Surface data in it may be out of
    /// date after a resize; the swapchain re-queries its own copy.
    pub fn capabilities(&self) -> &PhysicalDeviceCapabilities {
        &self.capabilities
    }
}
