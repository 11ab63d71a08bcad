// vk-frames - frame submission and synchronization over Vulkan
//
// The library owns GPU selection, the swapchain, descriptor bookkeeping and
// the per-frame record/submit/present loop. Windowing stays with the caller:
// it creates the `Surface` and reports resizes.

pub mod backend;
pub mod config;
pub mod error;

pub use backend::{FrameInfo, FrameSynchronizer, GraphicsContext};
pub use config::Config;
pub use error::{ErrorClass, GraphicsError, Result};
