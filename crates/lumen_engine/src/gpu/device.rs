//! Graphics device and command recording contracts
//!
//! The scene core never talks to Vulkan directly. Buffers, descriptor pools,
//! pipelines and command buffers belong to the device collaborator, which the
//! core reaches through [`GraphicsDevice`] and [`CommandContext`]. Handles are
//! plain `ash::vk` handles so a Vulkan backend can implement both traits with
//! no translation layer.
//!
//! ## Frame slots
//!
//! The device owns `max_frames_in_flight()` rotating frame slots, each guarded
//! by its own fence. Everything the core keeps per frame (material descriptor
//! sets, light and shadow buffers) is indexed by `frame_slot()`, never by an
//! absolute frame number, so a slot's resources are only touched again once
//! the device has waited for that slot's previous use to finish.

use ash::vk;
use thiserror::Error;

/// Identity of a graphics device; keys every per-device cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

/// Kind of pass being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PassType {
    /// Color pass
    Main,
    /// Depth-only pass (shadow maps, depth prepass)
    Depth,
}

impl PassType {
    /// Index for per-pass arrays
    pub const fn index(self) -> usize {
        match self {
            Self::Main => 0,
            Self::Depth => 1,
        }
    }
}

/// A render pass created by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPass {
    /// Vulkan handle; null means the pass could not be created
    pub handle: vk::RenderPass,
    /// Owning device
    pub device: DeviceId,
    /// What the pass renders
    pub kind: PassType,
}

impl RenderPass {
    /// Whether the handle refers to a real render pass
    pub fn is_null(&self) -> bool {
        self.handle == vk::RenderPass::null()
    }
}

/// A framebuffer together with the pass it was created for
#[derive(Debug, Clone, Copy)]
pub struct RenderTarget {
    /// Compatible render pass
    pub render_pass: RenderPass,
    /// Framebuffer handle
    pub framebuffer: vk::Framebuffer,
    /// Size in pixels
    pub extent: vk::Extent2D,
    /// Sampled view of the depth attachment, if any
    pub depth_view: vk::ImageView,
}

impl RenderTarget {
    /// The whole target as a render area
    pub fn full_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}

/// A region of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Byte offset of the region
    pub offset: vk::DeviceSize,
    /// Byte size of the region
    pub size: vk::DeviceSize,
}

/// Device errors
#[derive(Error, Debug)]
pub enum GpuError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(#[from] vk::Result),

    /// No descriptor set could be allocated from the device's pools
    #[error("Descriptor pool exhausted while allocating {name}")]
    DescriptorPoolExhausted {
        /// Debug name of the requested set
        name: String,
    },

    /// Memory allocation failed
    #[error("Out of device memory: {requested} bytes")]
    OutOfMemory {
        /// Number of bytes that were requested
        requested: vk::DeviceSize,
    },

    /// The device was lost and must be recreated
    #[error("Device lost")]
    DeviceLost,
}

/// Result type for device operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Services the scene core consumes from a graphics device
pub trait GraphicsDevice {
    /// Device identity
    fn id(&self) -> DeviceId;

    /// Number of frame slots; fixed for the device's lifetime
    fn max_frames_in_flight(&self) -> usize;

    /// Slot of the frame currently being recorded
    fn frame_slot(&self) -> usize;

    /// Allocate a persistent descriptor set
    fn allocate_descriptor_set(&mut self, name: &str, layout: vk::DescriptorSetLayout) -> GpuResult<vk::DescriptorSet>;

    /// Return a persistent descriptor set; only called once its frames are done
    fn free_descriptor_set(&mut self, set: vk::DescriptorSet);

    /// Commit descriptor writes in one call
    fn update_descriptor_sets(&mut self, writes: &[vk::WriteDescriptorSet]);

    /// Descriptor set recycled automatically when the current frame slot comes around again
    fn temp_descriptor_set(&mut self, name: &str, layout: vk::DescriptorSetLayout) -> GpuResult<vk::DescriptorSet>;

    /// Host-visible buffer recycled automatically with the current frame slot
    fn temp_buffer(&mut self, name: &str, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> GpuResult<BufferRange>;

    /// Create a persistent host-visible buffer
    fn create_buffer(&mut self, name: &str, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> GpuResult<BufferRange>;

    /// Destroy a persistent buffer
    fn destroy_buffer(&mut self, buffer: BufferRange);

    /// Copy bytes into a host-visible buffer region
    fn write_buffer(&mut self, target: &BufferRange, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()>;

    /// Create a depth-only render target used as a shadow atlas
    fn create_shadow_atlas(&mut self, name: &str, resolution: u32) -> GpuResult<RenderTarget>;

    /// Destroy a render target created by this device
    fn destroy_render_target(&mut self, target: RenderTarget);

    /// Block until all submitted work has completed
    fn wait_idle(&mut self) -> GpuResult<()>;

    /// Attach a debug name to a Vulkan object
    fn set_object_name(&mut self, raw_handle: u64, object_type: vk::ObjectType, name: &str);
}

/// A command buffer being recorded for one frame
pub trait CommandContext {
    /// The device the commands are recorded for
    fn device(&mut self) -> &mut dyn GraphicsDevice;

    /// Begin a render pass over `area` of `target`
    fn begin_render_pass(&mut self, target: &RenderTarget, area: vk::Rect2D);

    /// End the current render pass
    fn end_render_pass(&mut self);

    /// Set viewport and scissor
    fn set_viewport(&mut self, viewport: vk::Viewport, scissor: vk::Rect2D);

    /// Bind a graphics pipeline
    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);

    /// Bind a descriptor set at `set_index`
    fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set_index: u32, set: vk::DescriptorSet);

    /// Record push constants
    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]);

    /// Bind a vertex buffer
    fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer, offset: vk::DeviceSize);

    /// Bind an index buffer
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);

    /// Non-indexed draw
    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);

    /// Indexed draw
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
}
