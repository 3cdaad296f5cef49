//! Materials: shader variant selection and parameter binding
//!
//! A [`Material`] pairs a shader with a keyword set, a cull mode and named
//! parameters. Binding it for a draw resolves the keyword variant for the
//! device and pass, keeps one per-material descriptor set per frame slot up
//! to date, and pushes numeric parameters as push constants.
//!
//! ## Frame slots
//!
//! Each device gets its own [`DescriptorBinder`] and, per pass kind, one
//! descriptor set per frame slot with a dirty bit. Changing a parameter marks
//! every slot of every device dirty; a slot is rewritten the next time it is
//! bound, which can only happen once the device has retired that slot's
//! previous frame.
//!
//! ## Bound materials are frozen
//!
//! The first successful [`Material::bind`] freezes the material: from then on
//! keywords, cull mode and parameters are read-only and mutators return
//! [`MaterialError::AlreadyBound`]. Create a second material for a second
//! configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use thiserror::Error;

use super::handle::{next_resource_id, ResourceHandle};
use super::mesh::VertexLayout;
use super::texture::{Sampler, Texture};
use crate::foundation::math::{Vec2, Vec3, Vec4};
use crate::gpu::shader::DEPTH_PASS_KEYWORD;
use crate::gpu::{
    CommandContext, DescriptorBinder, DeviceId, GraphicsDevice, GraphicsShader, PassType, PipelineKey, RenderPass, Shader,
    ShaderLibrary, ShaderReflection, PER_MATERIAL,
};

/// Identity of a material, used for sorting and batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u64);

/// Material errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterialError {
    /// The material has been bound and can no longer change
    #[error("Cannot change parameters of bound material '{name}'")]
    AlreadyBound {
        /// Material name
        name: String,
    },
}

/// Result type for material mutations
pub type MaterialResult<T> = Result<T, MaterialError>;

/// A named material parameter
#[derive(Debug, Clone)]
pub enum MaterialParameter {
    /// Sampled or storage image
    Texture(ResourceHandle<Texture>),
    /// Sampler
    Sampler(ResourceHandle<Sampler>),
    /// Scalar push constant
    Float(f32),
    /// 2-component push constant
    Vec2(Vec2),
    /// 3-component push constant
    Vec3(Vec3),
    /// 4-component push constant
    Vec4(Vec4),
}

impl MaterialParameter {
    /// Push constant payload for numeric parameters
    pub fn push_constant_bytes(&self) -> Option<Vec<u8>> {
        let values: &[f32] = match self {
            Self::Float(value) => std::slice::from_ref(value),
            Self::Vec2(value) => value.as_slice(),
            Self::Vec3(value) => value.as_slice(),
            Self::Vec4(value) => value.as_slice(),
            Self::Texture(_) | Self::Sampler(_) => return None,
        };
        Some(bytemuck::cast_slice(values).to_vec())
    }
}

/// Result of a successful [`Material::bind`]
#[derive(Clone)]
pub struct BoundMaterial {
    /// Bound pipeline
    pub pipeline: vk::Pipeline,
    /// Layout used for descriptor sets and push constants
    pub pipeline_layout: vk::PipelineLayout,
    variant: Arc<dyn GraphicsShader>,
}

impl BoundMaterial {
    /// Reflection of the bound variant
    pub fn reflection(&self) -> &ShaderReflection {
        self.variant.reflection()
    }

    /// Push `data` to the range named `name` if the variant declares one of
    /// exactly that size. Returns whether anything was pushed.
    pub fn push_constant(&self, ctx: &mut dyn CommandContext, name: &str, data: &[u8]) -> bool {
        match self.reflection().push_constant(name) {
            Some(range) if range.size as usize == data.len() => {
                ctx.push_constants(self.pipeline_layout, range.stage_flags, range.offset, data);
                true
            }
            Some(range) => {
                log::trace!(
                    "Skipping push constant {name}: range is {} bytes, value is {} bytes",
                    range.size,
                    data.len()
                );
                false
            }
            None => false,
        }
    }
}

impl fmt::Debug for BoundMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMaterial")
            .field("pipeline", &self.pipeline)
            .field("pipeline_layout", &self.pipeline_layout)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct PassData {
    variant: Option<Arc<dyn GraphicsShader>>,
    descriptor_sets: Vec<Option<vk::DescriptorSet>>,
    dirty: Vec<bool>,
}

struct DeviceData {
    passes: [PassData; 2],
    binder: DescriptorBinder,
}

impl DeviceData {
    fn new(frames_in_flight: usize) -> Self {
        let pass = || PassData {
            variant: None,
            descriptor_sets: vec![None; frames_in_flight],
            dirty: vec![true; frames_in_flight],
        };
        Self {
            passes: [pass(), pass()],
            binder: DescriptorBinder::new(),
        }
    }

    fn mark_dirty(&mut self) {
        for pass in &mut self.passes {
            pass.dirty.fill(true);
        }
    }
}

struct MaterialState {
    keywords: BTreeSet<String>,
    cull_mode: Option<vk::CullModeFlags>,
    parameters: BTreeMap<String, MaterialParameter>,
    devices: HashMap<DeviceId, DeviceData>,
    bound: bool,
}

/// A shader plus the state needed to draw with it
pub struct Material {
    id: MaterialId,
    name: String,
    shader: ResourceHandle<dyn Shader>,
    state: Mutex<MaterialState>,
}

impl fmt::Debug for Material {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Material")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("shader", &self.shader.name())
            .finish_non_exhaustive()
    }
}

impl Material {
    /// Create a material for `shader` with no keywords or parameters
    pub fn new(name: impl Into<String>, shader: ResourceHandle<dyn Shader>) -> Self {
        Self {
            id: MaterialId(next_resource_id()),
            name: name.into(),
            shader,
            state: Mutex::new(MaterialState {
                keywords: BTreeSet::new(),
                cull_mode: None,
                parameters: BTreeMap::new(),
                devices: HashMap::new(),
                bound: false,
            }),
        }
    }

    /// Create a material for the shader at `path`, if the library has it
    pub fn from_library(name: impl Into<String>, library: &dyn ShaderLibrary, path: &str) -> Option<Self> {
        let shader = library.load_shader(path)?;
        Some(Self::new(name, ResourceHandle::Shared(shader)))
    }

    /// Material identity
    pub fn id(&self) -> MaterialId {
        self.id
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The material's shader
    pub fn shader(&self) -> &dyn Shader {
        &*self.shader
    }

    /// Render queue declared by the shader
    pub fn render_queue(&self) -> u32 {
        self.shader.render_queue()
    }

    /// Whether the material has been bound and is frozen
    pub fn is_bound(&self) -> bool {
        self.lock().bound
    }

    /// Enable a shader keyword
    pub fn enable_keyword(&self, keyword: &str) -> MaterialResult<()> {
        let mut state = self.lock_mutable()?;
        if state.keywords.insert(keyword.to_string()) {
            Self::invalidate_variants(&mut state);
        }
        Ok(())
    }

    /// Disable a shader keyword
    pub fn disable_keyword(&self, keyword: &str) -> MaterialResult<()> {
        let mut state = self.lock_mutable()?;
        if state.keywords.remove(keyword) {
            Self::invalidate_variants(&mut state);
        }
        Ok(())
    }

    /// Whether `keyword` is enabled
    pub fn has_keyword(&self, keyword: &str) -> bool {
        self.lock().keywords.contains(keyword)
    }

    /// Override the shader's cull mode; `None` restores the shader's own
    pub fn set_cull_mode(&self, cull_mode: Option<vk::CullModeFlags>) -> MaterialResult<()> {
        self.lock_mutable()?.cull_mode = cull_mode;
        Ok(())
    }

    /// Current cull mode override
    pub fn cull_mode(&self) -> Option<vk::CullModeFlags> {
        self.lock().cull_mode
    }

    /// Set a named parameter and mark every frame slot of every device dirty
    pub fn set_parameter(&self, name: &str, value: MaterialParameter) -> MaterialResult<()> {
        let mut state = self.lock_mutable()?;
        state.parameters.insert(name.to_string(), value);
        for data in state.devices.values_mut() {
            data.mark_dirty();
        }
        Ok(())
    }

    /// A parameter's current value
    pub fn parameter(&self, name: &str) -> Option<MaterialParameter> {
        self.lock().parameters.get(name).cloned()
    }

    /// Dirty bit of a frame slot; `None` if the device is not registered
    pub fn is_slot_dirty(&self, device: DeviceId, pass: PassType, slot: usize) -> Option<bool> {
        let state = self.lock();
        state
            .devices
            .get(&device)
            .and_then(|data| data.passes[pass.index()].dirty.get(slot).copied())
    }

    /// Resolve the shader variant for a device and pass, registering the
    /// device on first use
    pub fn shader_variant(&self, device: &dyn GraphicsDevice, pass: PassType) -> Option<Arc<dyn GraphicsShader>> {
        let mut state = self.lock();
        self.resolve_variant(&mut state, device, pass)
    }

    /// Bind the material for drawing.
    ///
    /// Returns `None` (and binds nothing) when the render pass is null, no
    /// variant matches the keywords, the descriptor set cannot be allocated,
    /// or no pipeline can be built; the caller skips its draw.
    pub fn bind(
        &self,
        ctx: &mut dyn CommandContext,
        render_pass: &RenderPass,
        vertex_layout: Option<&VertexLayout>,
        topology: vk::PrimitiveTopology,
        cull_override: Option<vk::CullModeFlags>,
    ) -> Option<BoundMaterial> {
        if render_pass.is_null() {
            log::debug!("Material {}: null render pass, skipping", self.name);
            return None;
        }

        let mut state = self.lock();
        let (variant, material_set) = {
            let device = ctx.device();
            let variant = self.resolve_variant(&mut state, device, render_pass.kind)?;
            let material_set = self.update_material_set(&mut state, device, render_pass.kind, variant.reflection())?;
            (variant, material_set)
        };

        let reflection = variant.reflection();
        let key = PipelineKey {
            render_pass,
            vertex_layout,
            topology,
            cull_mode: cull_override.or(state.cull_mode),
        };
        let Some(pipeline) = variant.pipeline(&key) else {
            log::warn!("Material {}: no pipeline for {:?} pass", self.name, render_pass.kind);
            return None;
        };

        let bound = BoundMaterial {
            pipeline,
            pipeline_layout: reflection.pipeline_layout,
            variant: Arc::clone(&variant),
        };
        ctx.bind_pipeline(pipeline);
        if let Some(set) = material_set {
            ctx.bind_descriptor_set(bound.pipeline_layout, PER_MATERIAL, set);
        }
        for (name, parameter) in &state.parameters {
            if let Some(bytes) = parameter.push_constant_bytes() {
                bound.push_constant(ctx, name, &bytes);
            }
        }

        state.bound = true;
        Some(bound)
    }

    /// Free this material's descriptor sets on `device`. The device must
    /// have finished every frame that used them.
    pub fn release_device(&self, device: &mut dyn GraphicsDevice) {
        let mut state = self.lock();
        if let Some(data) = state.devices.remove(&device.id()) {
            for set in data.passes.iter().flat_map(|pass| pass.descriptor_sets.iter().flatten()) {
                device.free_descriptor_set(*set);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, MaterialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mutable(&self) -> MaterialResult<MutexGuard<'_, MaterialState>> {
        let state = self.lock();
        if state.bound {
            return Err(MaterialError::AlreadyBound {
                name: self.name.clone(),
            });
        }
        Ok(state)
    }

    fn invalidate_variants(state: &mut MaterialState) {
        for data in state.devices.values_mut() {
            for pass in &mut data.passes {
                pass.variant = None;
            }
            data.mark_dirty();
        }
    }

    fn resolve_variant(
        &self,
        state: &mut MaterialState,
        device: &dyn GraphicsDevice,
        pass: PassType,
    ) -> Option<Arc<dyn GraphicsShader>> {
        let MaterialState { keywords, devices, .. } = state;
        let data = devices
            .entry(device.id())
            .or_insert_with(|| DeviceData::new(device.max_frames_in_flight()));
        let pass_data = &mut data.passes[pass.index()];
        if pass_data.variant.is_none() {
            let variant = if pass == PassType::Depth {
                let mut keywords = keywords.clone();
                keywords.insert(DEPTH_PASS_KEYWORD.to_string());
                self.shader.variant(device.id(), pass, &keywords)
            } else {
                self.shader.variant(device.id(), pass, keywords)
            };
            if variant.is_none() {
                log::warn!(
                    "Material {}: shader {} has no variant for keywords {:?}",
                    self.name,
                    self.shader.name(),
                    keywords
                );
            }
            pass_data.variant = variant;
        }
        pass_data.variant.clone()
    }

    /// Returns `Some(None)` when the variant has no per-material set and
    /// `None` when the set is needed but could not be allocated.
    fn update_material_set(
        &self,
        state: &mut MaterialState,
        device: &mut dyn GraphicsDevice,
        pass: PassType,
        reflection: &ShaderReflection,
    ) -> Option<Option<vk::DescriptorSet>> {
        let Some(layout) = reflection.set_layout(PER_MATERIAL) else {
            return Some(None);
        };
        let slot = device.frame_slot();
        let MaterialState { parameters, devices, .. } = state;
        let data = devices.get_mut(&device.id())?;
        let pass_data = &mut data.passes[pass.index()];

        let set = match pass_data.descriptor_sets.get(slot).copied().flatten() {
            Some(set) => set,
            None => {
                let name = format!("{} PerMaterial", self.name);
                match device.allocate_descriptor_set(&name, layout) {
                    Ok(set) => {
                        if slot >= pass_data.descriptor_sets.len() {
                            pass_data.descriptor_sets.resize(slot + 1, None);
                            pass_data.dirty.resize(slot + 1, true);
                        }
                        pass_data.descriptor_sets[slot] = Some(set);
                        pass_data.dirty[slot] = true;
                        set
                    }
                    Err(error) => {
                        log::warn!("Material {}: {error}", self.name);
                        return None;
                    }
                }
            }
        };

        if pass_data.dirty[slot] {
            for (name, parameter) in parameters.iter() {
                let Some(binding) = reflection.binding(name).filter(|binding| binding.set == PER_MATERIAL) else {
                    continue;
                };
                match parameter {
                    MaterialParameter::Texture(texture) => {
                        if binding.descriptor_type == vk::DescriptorType::STORAGE_IMAGE {
                            data.binder.write_storage_texture(set, binding.binding, 0, texture.view);
                        } else {
                            data.binder
                                .write_sampled_texture(set, binding.binding, 0, texture.view, texture.layout);
                        }
                    }
                    MaterialParameter::Sampler(sampler) => data.binder.write_sampler(set, binding.binding, sampler.handle),
                    _ => {}
                }
            }
            data.binder.flush(device);
            pass_data.dirty[slot] = false;
        }
        Some(Some(set))
    }
}
