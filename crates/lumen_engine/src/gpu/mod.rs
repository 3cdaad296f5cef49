//! Contracts with the graphics device, asset and presentation collaborators
//!
//! Nothing in this crate owns Vulkan objects. The traits here describe what
//! the scene core needs from outside:
//!
//! ```text
//! GraphicsDevice   frame slots, descriptor pools, temp buffers, wait idle
//! CommandContext   command recording for the current frame
//! Shader           keyword variants → reflection + pipelines
//! Presenter        acquire / present / rebuild swapchain
//! ```
//!
//! plus the pieces of logic that sit directly on those seams: descriptor
//! write batching ([`DescriptorBinder`]) and swapchain recovery
//! ([`FramePresenter`]). The [`recording`] module provides headless
//! implementations for tests and tools.

pub mod descriptor;
pub mod device;
pub mod present;
pub mod recording;
pub mod shader;

pub use descriptor::{upload_temp, BinderStats, DescriptorBinder};
pub use device::{
    BufferRange, CommandContext, DeviceId, GpuError, GpuResult, GraphicsDevice, PassType, RenderPass, RenderTarget,
};
pub use present::{AcquireOutcome, FramePresenter, PresentError, Presenter};
pub use shader::{
    DescriptorBinding, GraphicsShader, PipelineKey, Shader, ShaderLibrary, ShaderReflection, DEFAULT_RENDER_QUEUE,
    PER_CAMERA, PER_MATERIAL, PER_OBJECT,
};
