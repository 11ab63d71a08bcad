// Error types for the frame-submission layer
//
// Every fallible Vulkan call maps to one variant that keeps the driver's
// result code. `class()` sorts variants into the three handling paths the
// frame loop distinguishes.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphicsError>;

/// How the caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Initialization cannot continue. Report upward, do not retry.
    SetupFatal,
    /// Swapchain went stale. Recreate and continue next frame.
    Recoverable,
    /// Driver or state corruption during a frame. End the session.
    SubmissionFatal,
}

#[derive(Debug, Error)]
pub enum GraphicsError {
    // ── setup ────────────────────────────────────────────────────────────
    #[error("Failed to load the Vulkan library: {0}")]
    LoadingLibrary(String),

    #[error("Vulkan error creating instance: {0}")]
    CreatingInstance(vk::Result),

    #[error("Vulkan error creating debug messenger: {0}")]
    CreatingDebugMessenger(vk::Result),

    #[error("Vulkan error creating surface: {0}")]
    CreatingSurface(vk::Result),

    #[error("Vulkan error enumerating physical devices: {0}")]
    EnumeratingDevices(vk::Result),

    #[error("Vulkan error querying surface support: {0}")]
    QueryingSurface(vk::Result),

    #[error("No suitable GPU found")]
    NoSuitableDevice,

    #[error("Vulkan error creating logical device: {0}")]
    CreatingLogicalDevice(vk::Result),

    #[error("Failed to create memory allocator: {0}")]
    CreatingAllocator(gpu_allocator::AllocationError),

    #[error("Vulkan error creating command pool: {0}")]
    CreatingCommandPool(vk::Result),

    #[error("Vulkan error creating swapchain: {0}")]
    CreatingSwapChain(vk::Result),

    #[error("Vulkan error creating image view: {0}")]
    CreatingImageView(vk::Result),

    #[error("Vulkan error creating render pass: {0}")]
    CreatingRenderPass(vk::Result),

    #[error("Vulkan error creating framebuffer: {0}")]
    CreatingFramebuffer(vk::Result),

    #[error("Vulkan error creating descriptor set layout: {0}")]
    CreatingDescriptorSetLayout(vk::Result),

    #[error("Vulkan error creating descriptor pool: {0}")]
    CreatingDescriptorPool(vk::Result),

    #[error("Vulkan error allocating descriptor set: {0}")]
    CreatingDescriptorSet(vk::Result),

    #[error("Descriptor pool '{pool}' exhausted ({capacity} sets)")]
    DescriptorPoolExhausted { pool: &'static str, capacity: u32 },

    #[error("Vulkan error creating shader module: {0}")]
    CreatingShaderModule(vk::Result),

    #[error("Invalid SPIR-V: {0}")]
    InvalidShaderCode(String),

    #[error("Vulkan error creating pipeline layout: {0}")]
    CreatingPipelineLayout(vk::Result),

    #[error("Vulkan error creating graphics pipeline: {0}")]
    CreatingPipeline(vk::Result),

    #[error("Vulkan error creating buffer: {0}")]
    CreatingBuffer(vk::Result),

    #[error("Vulkan error creating image: {0}")]
    CreatingImage(vk::Result),

    #[error("Vulkan error creating sampler: {0}")]
    CreatingSampler(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocatingMemory(gpu_allocator::AllocationError),

    #[error("Vulkan error binding memory: {0}")]
    BindingMemory(vk::Result),

    // ── per-frame ────────────────────────────────────────────────────────
    #[error("Vulkan error creating sync objects: {0}")]
    CreatingSyncObjects(vk::Result),

    #[error("Vulkan error allocating command buffer: {0}")]
    CreatingCommandBuffer(vk::Result),

    #[error("Vulkan error waiting for fence: {0}")]
    WaitingForFence(vk::Result),

    #[error("Vulkan error resetting fence: {0}")]
    ResettingFence(vk::Result),

    #[error("Vulkan error acquiring next image: {0}")]
    AcquiringNextImage(vk::Result),

    #[error("Vulkan error resetting command buffer: {0}")]
    ResettingCommandBuffer(vk::Result),

    #[error("Vulkan error beginning command buffer: {0}")]
    BeginningCommandBuffer(vk::Result),

    #[error("Vulkan error ending command buffer: {0}")]
    EndingCommandBuffer(vk::Result),

    #[error("Vulkan error submitting draw command: {0}")]
    SubmittingDrawCommand(vk::Result),

    #[error("Vulkan error presenting queue: {0}")]
    PresentingQueue(vk::Result),

    #[error("Vulkan error waiting for device idle: {0}")]
    WaitingForIdle(vk::Result),

    #[error("Device lost")]
    DeviceLost,

    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("'{op}' called in frame state {state}")]
    InvalidFrameState { op: &'static str, state: &'static str },

    #[error("No pipeline bound before draw")]
    NoPipelineBound,

    #[error("Texture list changed after the batch's first draw")]
    TexturesChangedMidBatch,

    // ── resources ────────────────────────────────────────────────────────
    #[error("Texture id is stale or was never registered")]
    StaleTexture,

    #[error("Pipeline id is stale or was never pushed")]
    StalePipeline,

    #[error("Texture has no image data yet")]
    TextureNotUploaded,

    #[error("Invalid texture data: {0}")]
    InvalidTextureData(String),

    #[error("Uniform buffer not registered")]
    UniformNotRegistered,

    #[error("Uniform data ({data_bytes} bytes) exceeds registered size ({buffer_bytes} bytes)")]
    UniformTooLarge { data_bytes: usize, buffer_bytes: u64 },

    #[error("Push constant data ({data_bytes} bytes) exceeds the pipeline's range ({range_bytes} bytes)")]
    PushConstantsTooLarge { data_bytes: usize, range_bytes: u32 },

    #[error("Allocation is not host-mapped")]
    NotMapped,
}

impl GraphicsError {
    pub fn class(&self) -> ErrorClass {
        use GraphicsError::*;
        match self {
            SwapchainOutOfDate => ErrorClass::Recoverable,
            CreatingSyncObjects(_)
            | CreatingCommandBuffer(_)
            | WaitingForFence(_)
            | ResettingFence(_)
            | AcquiringNextImage(_)
            | ResettingCommandBuffer(_)
            | BeginningCommandBuffer(_)
            | EndingCommandBuffer(_)
            | SubmittingDrawCommand(_)
            | PresentingQueue(_)
            | WaitingForIdle(_)
            | DeviceLost
            | InvalidFrameState { .. }
            | NoPipelineBound
            | TexturesChangedMidBatch
            | PushConstantsTooLarge { .. } => ErrorClass::SubmissionFatal,
            _ => ErrorClass::SetupFatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// Wraps a per-frame result code. Device loss and an out-of-date
    /// swapchain get their own variants.
    pub(crate) fn frame(code: vk::Result, wrap: fn(vk::Result) -> Self) -> Self {
        match code {
            vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => GraphicsError::SwapchainOutOfDate,
            code => wrap(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_date_is_the_only_recoverable_error() {
        assert!(GraphicsError::SwapchainOutOfDate.is_recoverable());
        assert!(!GraphicsError::NoSuitableDevice.is_recoverable());
        assert!(!GraphicsError::DeviceLost.is_recoverable());
    }

    #[test]
    fn classes_follow_the_failure_site() {
        assert_eq!(GraphicsError::NoSuitableDevice.class(), ErrorClass::SetupFatal);
        assert_eq!(
            GraphicsError::CreatingDescriptorPool(vk::Result::ERROR_OUT_OF_HOST_MEMORY).class(),
            ErrorClass::SetupFatal
        );
        assert_eq!(
            GraphicsError::DescriptorPoolExhausted { pool: "main", capacity: 4 }.class(),
            ErrorClass::SetupFatal
        );
        assert_eq!(
            GraphicsError::SubmittingDrawCommand(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).class(),
            ErrorClass::SubmissionFatal
        );
        assert_eq!(
            GraphicsError::CreatingSyncObjects(vk::Result::ERROR_OUT_OF_HOST_MEMORY).class(),
            ErrorClass::SubmissionFatal
        );
    }

    #[test]
    fn out_of_date_code_becomes_recoverable() {
        let err = GraphicsError::frame(
            vk::Result::ERROR_OUT_OF_DATE_KHR,
            GraphicsError::AcquiringNextImage,
        );
        assert!(matches!(err, GraphicsError::SwapchainOutOfDate));
        assert!(err.is_recoverable());
    }

    #[test]
    fn device_lost_is_folded_out_of_frame_codes() {
        let err = GraphicsError::frame(
            vk::Result::ERROR_DEVICE_LOST,
            GraphicsError::SubmittingDrawCommand,
        );
        assert!(matches!(err, GraphicsError::DeviceLost));

        let err = GraphicsError::frame(
            vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            GraphicsError::PresentingQueue,
        );
        assert!(matches!(
            err,
            GraphicsError::PresentingQueue(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
    }

    #[test]
    fn messages_name_the_failing_call() {
        let msg = GraphicsError::AcquiringNextImage(vk::Result::ERROR_SURFACE_LOST_KHR).to_string();
        assert!(msg.starts_with("Vulkan error acquiring next image: "));
        assert!(msg.len() > "Vulkan error acquiring next image: ".len());
    }
}
