//! Shader contracts consumed from the asset collaborator
//!
//! A [`Shader`] is what an asset loader hands out for a shader path. Given a
//! device, pass kind and keyword set it resolves a [`GraphicsShader`]
//! variant, which carries reflection data and can produce pipelines for a
//! render pass / vertex layout / topology / cull mode combination.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use ash::vk;

use super::device::{DeviceId, PassType, RenderPass};
use crate::resources::VertexLayout;

/// Descriptor set index for per-camera bindings
pub const PER_CAMERA: u32 = 0;
/// Descriptor set index for per-material bindings
pub const PER_MATERIAL: u32 = 1;
/// Descriptor set index for per-object bindings
pub const PER_OBJECT: u32 = 2;

/// Render queue used when nothing else specifies one
pub const DEFAULT_RENDER_QUEUE: u32 = 1000;

/// Keyword enabled on every variant resolved for a depth pass
pub const DEPTH_PASS_KEYWORD: &str = "DEPTH_PASS";

/// Storage buffer binding a shader declares to receive per-instance transforms
pub const INSTANCES_BINDING: &str = "Instances";
/// Storage buffer binding for the scene light list
pub const LIGHTS_BINDING: &str = "Lights";
/// Storage buffer binding for shadow records
pub const SHADOWS_BINDING: &str = "Shadows";
/// Sampled image binding for the shadow atlas
pub const SHADOW_ATLAS_BINDING: &str = "ShadowAtlas";
/// Uniform buffer binding for camera data
pub const CAMERA_BINDING: &str = "Camera";

/// Where a named resource lives in a variant's pipeline layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Descriptor set index
    pub set: u32,
    /// Binding within the set
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Stages that read the binding
    pub stages: vk::ShaderStageFlags,
}

/// Reflection data of a resolved shader variant
#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    /// Pipeline layout shared by every pipeline of the variant
    pub pipeline_layout: vk::PipelineLayout,
    /// Set layouts indexed by set number
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Named descriptor bindings
    pub descriptor_bindings: HashMap<String, DescriptorBinding>,
    /// Named push constant ranges
    pub push_constants: HashMap<String, vk::PushConstantRange>,
}

impl ShaderReflection {
    /// Layout of descriptor set `set`, if the variant declares it
    pub fn set_layout(&self, set: u32) -> Option<vk::DescriptorSetLayout> {
        self.descriptor_set_layouts
            .get(set as usize)
            .copied()
            .filter(|layout| *layout != vk::DescriptorSetLayout::null())
    }

    /// Binding declared under `name`
    pub fn binding(&self, name: &str) -> Option<&DescriptorBinding> {
        self.descriptor_bindings.get(name)
    }

    /// Push constant range declared under `name`
    pub fn push_constant(&self, name: &str) -> Option<&vk::PushConstantRange> {
        self.push_constants.get(name)
    }

    /// Whether the variant reads per-instance transforms
    pub fn supports_instancing(&self) -> bool {
        self.descriptor_bindings.contains_key(INSTANCES_BINDING)
    }
}

/// Fixed-function state a pipeline is resolved for
#[derive(Debug, Clone, Copy)]
pub struct PipelineKey<'a> {
    /// Render pass the pipeline is used in
    pub render_pass: &'a RenderPass,
    /// Vertex input, `None` for vertex-pulling shaders
    pub vertex_layout: Option<&'a VertexLayout>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Cull mode, `None` to use the shader's own
    pub cull_mode: Option<vk::CullModeFlags>,
}

/// A concrete shader variant on one device
pub trait GraphicsShader: Send + Sync {
    /// Reflection data
    fn reflection(&self) -> &ShaderReflection;

    /// Resolve (and cache) a pipeline; `None` if it cannot be built
    fn pipeline(&self, key: &PipelineKey<'_>) -> Option<vk::Pipeline>;
}

/// A loaded shader program with keyword variants
pub trait Shader: Send + Sync {
    /// Name of the shader, usually its path
    fn name(&self) -> &str;

    /// Render queue declared by the shader
    fn render_queue(&self) -> u32 {
        DEFAULT_RENDER_QUEUE
    }

    /// Resolve the variant for a keyword set; `None` if no variant matches
    fn variant(&self, device: DeviceId, pass: PassType, keywords: &BTreeSet<String>) -> Option<Arc<dyn GraphicsShader>>;
}

/// Shader-by-path lookup provided by the asset collaborator
pub trait ShaderLibrary {
    /// Load or fetch a shader
    fn load_shader(&self, path: &str) -> Option<Arc<dyn Shader>>;
}
