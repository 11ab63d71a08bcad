// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash. Every Vulkan object is owned by exactly
// one Rust value and destroyed in its Drop; the logical device is shared
// through an Arc and outlives everything created from it.

pub mod buffer;
pub mod context;
pub mod descriptors;
pub mod device;
pub mod frame;
pub mod handle;
pub mod instance;
pub mod pipeline;
pub mod selector;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::AllocatedBuffer;
pub use context::GraphicsContext;
pub use descriptors::{ResourceBindingTable, TextureId};
pub use device::LogicalDevice;
pub use frame::{FrameInfo, FrameSynchronizer};
pub use instance::{Instance, Surface};
pub use pipeline::{PipelineDesc, PipelineId, ShaderStage};
pub use selector::{DeviceFeature, DeviceSelector};
pub use swapchain::SurfaceSwapchain;
pub use texture::PixelLayout;
