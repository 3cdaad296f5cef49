//! Headless device that records instead of rendering
//!
//! [`RecordingDevice`] and [`RecordingContext`] implement the device and
//! command contracts without a GPU: handles are synthesized, buffer writes are
//! kept in memory and every recorded command is appended to a list. They back
//! the crate's tests and let tools drive a full scene frame without a window.
//! [`StubShader`] plays the asset collaborator's part with configurable
//! reflection data.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use ash::vk::Handle;

use super::device::{
    BufferRange, CommandContext, DeviceId, GpuError, GpuResult, GraphicsDevice, PassType, RenderPass, RenderTarget,
};
use super::shader::{
    DescriptorBinding, GraphicsShader, PipelineKey, Shader, ShaderReflection, DEFAULT_RENDER_QUEUE, INSTANCES_BINDING,
    PER_OBJECT,
};

/// A descriptor write as seen by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Target set
    pub set: vk::DescriptorSet,
    /// Target binding
    pub binding: u32,
    /// First array element
    pub array_element: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
}

/// A command recorded into a [`RecordingContext`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// `begin_render_pass`
    BeginRenderPass {
        /// Kind of the pass
        pass: PassType,
        /// Framebuffer rendered to
        framebuffer: vk::Framebuffer,
    },
    /// `end_render_pass`
    EndRenderPass,
    /// `set_viewport`
    SetViewport {
        /// Viewport x, y, width, height
        rect: [f32; 4],
    },
    /// `bind_pipeline`
    BindPipeline(vk::Pipeline),
    /// `bind_descriptor_set`
    BindDescriptorSet {
        /// Set index
        set_index: u32,
        /// Bound set
        set: vk::DescriptorSet,
    },
    /// `push_constants`
    PushConstants {
        /// Byte offset
        offset: u32,
        /// Pushed bytes
        data: Vec<u8>,
    },
    /// `bind_vertex_buffer`
    BindVertexBuffer {
        /// Binding slot
        binding: u32,
        /// Buffer
        buffer: vk::Buffer,
    },
    /// `bind_index_buffer`
    BindIndexBuffer {
        /// Buffer
        buffer: vk::Buffer,
        /// Index width
        index_type: vk::IndexType,
    },
    /// `draw`
    Draw {
        /// Vertices per instance
        vertex_count: u32,
        /// Instances
        instance_count: u32,
        /// First instance index
        first_instance: u32,
    },
    /// `draw_indexed`
    DrawIndexed {
        /// Indices per instance
        index_count: u32,
        /// Instances
        instance_count: u32,
        /// First index
        first_index: u32,
        /// First instance index
        first_instance: u32,
    },
}

impl RecordedCommand {
    /// Whether the command issues a draw
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }

    /// Instance count of a draw command
    pub fn instance_count(&self) -> Option<u32> {
        match self {
            Self::Draw { instance_count, .. } | Self::DrawIndexed { instance_count, .. } => Some(*instance_count),
            _ => None,
        }
    }
}

/// In-memory graphics device
#[derive(Debug)]
pub struct RecordingDevice {
    id: DeviceId,
    max_frames_in_flight: usize,
    frame_slot: usize,
    next_handle: u64,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    descriptor_writes: Vec<RecordedWrite>,
    descriptor_update_calls: usize,
    allocated_sets: usize,
    freed_sets: usize,
    temp_sets: usize,
    temp_buffers: usize,
    descriptor_budget: Option<usize>,
    wait_idle_calls: usize,
    object_names: Vec<(u64, String)>,
}

impl RecordingDevice {
    /// Create a device with `max_frames_in_flight` frame slots
    pub fn new(max_frames_in_flight: usize) -> Self {
        Self {
            id: DeviceId(0),
            max_frames_in_flight: max_frames_in_flight.max(1),
            frame_slot: 0,
            next_handle: 0x1000,
            buffers: HashMap::new(),
            descriptor_writes: Vec::new(),
            descriptor_update_calls: 0,
            allocated_sets: 0,
            freed_sets: 0,
            temp_sets: 0,
            temp_buffers: 0,
            descriptor_budget: None,
            wait_idle_calls: 0,
            object_names: Vec::new(),
        }
    }

    /// Use a different device id
    pub fn with_id(mut self, id: u32) -> Self {
        self.id = DeviceId(id);
        self
    }

    /// Fail persistent descriptor allocations after `budget` successes
    pub fn with_descriptor_budget(mut self, budget: usize) -> Self {
        self.descriptor_budget = Some(budget);
        self
    }

    /// Move to the next frame slot
    pub fn advance_frame(&mut self) {
        self.frame_slot = (self.frame_slot + 1) % self.max_frames_in_flight;
    }

    /// A render pass handle owned by this device
    pub fn render_pass(&mut self, kind: PassType) -> RenderPass {
        RenderPass {
            handle: vk::RenderPass::from_raw(self.next_raw()),
            device: self.id,
            kind,
        }
    }

    /// A color render target (stands in for a swapchain backbuffer)
    pub fn render_target(&mut self, width: u32, height: u32) -> RenderTarget {
        RenderTarget {
            render_pass: self.render_pass(PassType::Main),
            framebuffer: vk::Framebuffer::from_raw(self.next_raw()),
            extent: vk::Extent2D { width, height },
            depth_view: vk::ImageView::from_raw(self.next_raw()),
        }
    }

    /// Every descriptor write committed so far
    pub fn descriptor_writes(&self) -> &[RecordedWrite] {
        &self.descriptor_writes
    }

    /// Number of `update_descriptor_sets` calls
    pub fn descriptor_update_calls(&self) -> usize {
        self.descriptor_update_calls
    }

    /// Persistent sets allocated and not freed
    pub fn live_descriptor_sets(&self) -> usize {
        self.allocated_sets - self.freed_sets
    }

    /// Temporary sets handed out
    pub fn temp_descriptor_sets(&self) -> usize {
        self.temp_sets
    }

    /// Temporary buffers handed out
    pub fn temp_buffers(&self) -> usize {
        self.temp_buffers
    }

    /// Number of `wait_idle` calls
    pub fn wait_idle_calls(&self) -> usize {
        self.wait_idle_calls
    }

    /// Bytes last written to `buffer`
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }

    /// Debug names assigned through `set_object_name`
    pub fn object_names(&self) -> &[(u64, String)] {
        &self.object_names
    }

    fn next_raw(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn new_buffer(&mut self, size: vk::DeviceSize) -> BufferRange {
        let buffer = vk::Buffer::from_raw(self.next_raw());
        self.buffers.insert(buffer, vec![0; usize::try_from(size).unwrap_or(0)]);
        BufferRange { buffer, offset: 0, size }
    }
}

impl GraphicsDevice for RecordingDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight
    }

    fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    fn allocate_descriptor_set(&mut self, name: &str, _layout: vk::DescriptorSetLayout) -> GpuResult<vk::DescriptorSet> {
        if let Some(budget) = self.descriptor_budget {
            if self.allocated_sets >= budget {
                return Err(GpuError::DescriptorPoolExhausted { name: name.to_string() });
            }
        }
        self.allocated_sets += 1;
        let set = vk::DescriptorSet::from_raw(self.next_raw());
        self.set_object_name(set.as_raw(), vk::ObjectType::DESCRIPTOR_SET, name);
        Ok(set)
    }

    fn free_descriptor_set(&mut self, _set: vk::DescriptorSet) {
        self.freed_sets += 1;
    }

    fn update_descriptor_sets(&mut self, writes: &[vk::WriteDescriptorSet]) {
        self.descriptor_update_calls += 1;
        self.descriptor_writes.extend(writes.iter().map(|write| RecordedWrite {
            set: write.dst_set,
            binding: write.dst_binding,
            array_element: write.dst_array_element,
            descriptor_type: write.descriptor_type,
        }));
    }

    fn temp_descriptor_set(&mut self, _name: &str, _layout: vk::DescriptorSetLayout) -> GpuResult<vk::DescriptorSet> {
        self.temp_sets += 1;
        Ok(vk::DescriptorSet::from_raw(self.next_raw()))
    }

    fn temp_buffer(&mut self, _name: &str, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> GpuResult<BufferRange> {
        self.temp_buffers += 1;
        Ok(self.new_buffer(size))
    }

    fn create_buffer(&mut self, name: &str, size: vk::DeviceSize, _usage: vk::BufferUsageFlags) -> GpuResult<BufferRange> {
        let range = self.new_buffer(size);
        self.set_object_name(range.buffer.as_raw(), vk::ObjectType::BUFFER, name);
        Ok(range)
    }

    fn destroy_buffer(&mut self, buffer: BufferRange) {
        self.buffers.remove(&buffer.buffer);
    }

    fn write_buffer(&mut self, target: &BufferRange, offset: vk::DeviceSize, data: &[u8]) -> GpuResult<()> {
        let contents = self
            .buffers
            .get_mut(&target.buffer)
            .ok_or(GpuError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        let start = usize::try_from(target.offset + offset).map_err(|_| GpuError::OutOfMemory { requested: offset })?;
        let end = start + data.len();
        if end > contents.len() {
            return Err(GpuError::OutOfMemory {
                requested: end as vk::DeviceSize,
            });
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_shadow_atlas(&mut self, name: &str, resolution: u32) -> GpuResult<RenderTarget> {
        let target = RenderTarget {
            render_pass: self.render_pass(PassType::Depth),
            framebuffer: vk::Framebuffer::from_raw(self.next_raw()),
            extent: vk::Extent2D {
                width: resolution,
                height: resolution,
            },
            depth_view: vk::ImageView::from_raw(self.next_raw()),
        };
        self.set_object_name(target.framebuffer.as_raw(), vk::ObjectType::FRAMEBUFFER, name);
        Ok(target)
    }

    fn destroy_render_target(&mut self, _target: RenderTarget) {}

    fn wait_idle(&mut self) -> GpuResult<()> {
        self.wait_idle_calls += 1;
        Ok(())
    }

    fn set_object_name(&mut self, raw_handle: u64, _object_type: vk::ObjectType, name: &str) {
        self.object_names.push((raw_handle, name.to_string()));
    }
}

/// Command context that appends to a list
#[derive(Debug)]
pub struct RecordingContext {
    device: RecordingDevice,
    commands: Vec<RecordedCommand>,
}

impl RecordingContext {
    /// Record against `device`
    pub fn new(device: RecordingDevice) -> Self {
        Self {
            device,
            commands: Vec::new(),
        }
    }

    /// The concrete device, for inspection
    pub fn recording_device(&self) -> &RecordingDevice {
        &self.device
    }

    /// The concrete device, for setup
    pub fn recording_device_mut(&mut self) -> &mut RecordingDevice {
        &mut self.device
    }

    /// Commands recorded so far
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    /// Draw commands recorded so far
    pub fn draws(&self) -> Vec<&RecordedCommand> {
        self.commands.iter().filter(|command| command.is_draw()).collect()
    }

    /// Forget recorded commands and move the device to its next frame slot
    pub fn next_frame(&mut self) {
        self.commands.clear();
        self.device.advance_frame();
    }
}

impl CommandContext for RecordingContext {
    fn device(&mut self) -> &mut dyn GraphicsDevice {
        &mut self.device
    }

    fn begin_render_pass(&mut self, target: &RenderTarget, _area: vk::Rect2D) {
        self.commands.push(RecordedCommand::BeginRenderPass {
            pass: target.render_pass.kind,
            framebuffer: target.framebuffer,
        });
    }

    fn end_render_pass(&mut self) {
        self.commands.push(RecordedCommand::EndRenderPass);
    }

    fn set_viewport(&mut self, viewport: vk::Viewport, _scissor: vk::Rect2D) {
        self.commands.push(RecordedCommand::SetViewport {
            rect: [viewport.x, viewport.y, viewport.width, viewport.height],
        });
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.commands.push(RecordedCommand::BindPipeline(pipeline));
    }

    fn bind_descriptor_set(&mut self, _layout: vk::PipelineLayout, set_index: u32, set: vk::DescriptorSet) {
        self.commands.push(RecordedCommand::BindDescriptorSet { set_index, set });
    }

    fn push_constants(&mut self, _layout: vk::PipelineLayout, _stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        self.commands.push(RecordedCommand::PushConstants {
            offset,
            data: data.to_vec(),
        });
    }

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: vk::Buffer, _offset: vk::DeviceSize) {
        self.commands.push(RecordedCommand::BindVertexBuffer { binding, buffer });
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, _offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.commands.push(RecordedCommand::BindIndexBuffer { buffer, index_type });
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, _first_vertex: u32, first_instance: u32) {
        self.commands.push(RecordedCommand::Draw {
            vertex_count,
            instance_count,
            first_instance,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        _vertex_offset: i32,
        first_instance: u32,
    ) {
        self.commands.push(RecordedCommand::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            first_instance,
        });
    }
}

struct StubVariant {
    reflection: ShaderReflection,
    pipeline: vk::Pipeline,
}

impl GraphicsShader for StubVariant {
    fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }

    fn pipeline(&self, _key: &PipelineKey<'_>) -> Option<vk::Pipeline> {
        (self.pipeline != vk::Pipeline::null()).then_some(self.pipeline)
    }
}

/// Shader whose variants all share one configurable reflection
pub struct StubShader {
    name: String,
    render_queue: u32,
    reflection: ShaderReflection,
    pipeline: vk::Pipeline,
    unresolvable: BTreeSet<String>,
    requests: Mutex<Vec<(PassType, BTreeSet<String>)>>,
}

impl StubShader {
    /// A shader with per-camera, per-material and per-object set layouts
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            render_queue: DEFAULT_RENDER_QUEUE,
            reflection: ShaderReflection {
                pipeline_layout: vk::PipelineLayout::from_raw(0x100),
                descriptor_set_layouts: vec![
                    vk::DescriptorSetLayout::from_raw(0x10),
                    vk::DescriptorSetLayout::from_raw(0x11),
                    vk::DescriptorSetLayout::from_raw(0x12),
                ],
                descriptor_bindings: HashMap::new(),
                push_constants: HashMap::new(),
            },
            pipeline: vk::Pipeline::from_raw(0x200),
            unresolvable: BTreeSet::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Declare a descriptor binding
    pub fn with_binding(mut self, name: &str, set: u32, binding: u32, descriptor_type: vk::DescriptorType) -> Self {
        self.reflection.descriptor_bindings.insert(
            name.to_string(),
            DescriptorBinding {
                set,
                binding,
                descriptor_type,
                stages: vk::ShaderStageFlags::ALL_GRAPHICS,
            },
        );
        self
    }

    /// Declare the per-instance transform buffer
    pub fn with_instancing(self) -> Self {
        self.with_binding(INSTANCES_BINDING, PER_OBJECT, 0, vk::DescriptorType::STORAGE_BUFFER)
    }

    /// Declare a push constant range
    pub fn with_push_constant(mut self, name: &str, offset: u32, size: u32) -> Self {
        self.reflection.push_constants.insert(
            name.to_string(),
            vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::ALL_GRAPHICS,
                offset,
                size,
            },
        );
        self
    }

    /// Declared render queue
    pub fn with_render_queue(mut self, render_queue: u32) -> Self {
        self.render_queue = render_queue;
        self
    }

    /// Variants requesting `keyword` fail to resolve
    pub fn with_unresolvable_keyword(mut self, keyword: &str) -> Self {
        self.unresolvable.insert(keyword.to_string());
        self
    }

    /// Pipelines fail to resolve
    pub fn without_pipelines(mut self) -> Self {
        self.pipeline = vk::Pipeline::null();
        self
    }

    /// Pipeline handle every variant returns
    pub fn pipeline_handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Every variant request made so far
    pub fn variant_requests(&self) -> Vec<(PassType, BTreeSet<String>)> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Shader for StubShader {
    fn name(&self) -> &str {
        &self.name
    }

    fn render_queue(&self) -> u32 {
        self.render_queue
    }

    fn variant(&self, _device: DeviceId, pass: PassType, keywords: &BTreeSet<String>) -> Option<Arc<dyn GraphicsShader>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((pass, keywords.clone()));
        if keywords.iter().any(|keyword| self.unresolvable.contains(keyword)) {
            return None;
        }
        Some(Arc::new(StubVariant {
            reflection: self.reflection.clone(),
            pipeline: self.pipeline,
        }))
    }
}
