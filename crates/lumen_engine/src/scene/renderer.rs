//! Renderer contract
//!
//! Every drawable component implements [`Renderer`]. The scene asks it for
//! bounds and sort keys, then hands it a command context and [`DrawArgs`] to
//! record its draws. Renderers that share a mesh and material and whose
//! shader reads per-instance transforms can be merged into one instanced draw.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::camera::Camera;
use super::gizmos::Gizmos;
use crate::foundation::math::{Aabb, Mat4, Ray, Vec4};
use crate::gpu::shader::{CAMERA_BINDING, INSTANCES_BINDING, LIGHTS_BINDING, SHADOWS_BINDING, SHADOW_ATLAS_BINDING};
use crate::gpu::{
    BufferRange, CommandContext, DescriptorBinder, GraphicsDevice, PassType, RenderPass, DEFAULT_RENDER_QUEUE, PER_CAMERA,
    PER_OBJECT,
};
use crate::resources::{BoundMaterial, MaterialId, MeshId};

/// Kinds of renderer the engine knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendererKind {
    /// Static triangle mesh
    StaticMesh,
    /// Skinned triangle mesh
    SkinnedMesh,
    /// Simulated cloth
    Cloth,
    /// Heightmap terrain
    Terrain,
    /// Point cloud
    PointCloud,
    /// Text
    Text,
    /// Screen or world space UI
    Ui,
}

/// Identity used to decide whether two renderers can share a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    /// Mesh drawn
    pub mesh: MeshId,
    /// Material drawn with
    pub material: MaterialId,
}

/// Per-frame scene buffers shared by every draw
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneGlobals {
    /// Camera uniform buffer of the current pass
    pub camera: Option<BufferRange>,
    /// Light buffer of the current frame slot
    pub lights: Option<BufferRange>,
    /// Shadow record buffer of the current frame slot
    pub shadows: Option<BufferRange>,
    /// Sampled view of the shadow atlas
    pub shadow_atlas: vk::ImageView,
    /// Number of lights in the light buffer
    pub light_count: u32,
}

/// Everything a renderer needs to record one draw
#[derive(Debug, Clone, Copy)]
pub struct DrawArgs<'a> {
    /// Camera rendered from
    pub camera: &'a Camera,
    /// Render pass being recorded
    pub pass: &'a RenderPass,
    /// Frame slot of the device
    pub frame_slot: usize,
    /// Object to world transform of the renderer's object
    pub object_to_world: Mat4,
    /// World to object transform of the renderer's object
    pub world_to_object: Mat4,
    /// Scene buffers
    pub globals: &'a SceneGlobals,
}

/// Per-instance data in the instance buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct InstanceData {
    /// Object to world
    pub object_to_world: [[f32; 4]; 4],
    /// World to object
    pub world_to_object: [[f32; 4]; 4],
}

impl InstanceData {
    /// Instance record for one object
    pub fn new(object_to_world: &Mat4, world_to_object: &Mat4) -> Self {
        Self {
            object_to_world: (*object_to_world).into(),
            world_to_object: (*world_to_object).into(),
        }
    }
}

/// A drawable component
#[allow(unused_variables)]
pub trait Renderer: Send {
    /// What kind of renderer this is
    fn kind(&self) -> RendererKind;

    /// Object-space bounds
    fn local_bounds(&self) -> Aabb;

    /// Sort priority, usually from the material's shader
    fn render_queue(&self) -> u32 {
        DEFAULT_RENDER_QUEUE
    }

    /// Whether there is anything to draw
    fn visible(&self) -> bool {
        true
    }

    /// Whether the renderer draws into depth (shadow) passes
    fn casts_shadows(&self) -> bool {
        true
    }

    /// Mask tested by ray queries and culling
    fn collision_mask(&self) -> u32 {
        u32::MAX
    }

    /// Mesh and material identity, if the renderer has one
    fn batch_key(&self) -> Option<BatchKey> {
        None
    }

    /// Whether draws can be merged into [`Renderer::draw_instanced`] calls
    fn supports_instancing(&self, device: &dyn GraphicsDevice, pass: PassType) -> bool {
        false
    }

    /// Called once per frame before any pass is recorded
    fn pre_frame(&mut self, ctx: &mut dyn CommandContext) {}

    /// Called for each visible renderer before a pass is drawn
    fn pre_render(&mut self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) {}

    /// Record the renderer's draws
    fn draw(&mut self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>);

    /// Record `instance_count` instances whose transforms are in `instances`
    fn draw_instanced(
        &mut self,
        ctx: &mut dyn CommandContext,
        args: &DrawArgs<'_>,
        instance_count: u32,
        instances: &BufferRange,
    ) {
        self.draw(ctx, args);
    }

    /// Called for each visible renderer after a pass is drawn
    fn post_render(&mut self, ctx: &mut dyn CommandContext, pass: PassType) {}

    /// Add debug geometry
    fn draw_gizmos(&self, gizmos: &mut Gizmos, object_to_world: &Mat4) {
        gizmos.wire_box(&self.local_bounds(), object_to_world, Vec4::new(0.2, 0.8, 1.0, 1.0));
    }

    /// Distance along a world-space ray to the renderer, if hit
    fn intersect(&self, ray: &Ray, object_to_world: &Mat4) -> Option<f32> {
        self.local_bounds().transformed(object_to_world).intersect_ray(ray)
    }

    /// Free resources held for `device`; called once the device is idle
    fn release_device(&mut self, device: &mut dyn GraphicsDevice) {}
}

enum SceneResource {
    Uniform(BufferRange),
    Storage(BufferRange),
    Image(vk::ImageView),
}

/// Write and bind the camera, light, shadow and instance resources the bound
/// variant declares in its per-camera and per-object sets.
///
/// Returns `false` if a set could not be allocated; the caller skips its draw.
pub fn bind_scene_resources(
    ctx: &mut dyn CommandContext,
    binder: &mut DescriptorBinder,
    bound: &BoundMaterial,
    args: &DrawArgs<'_>,
    instances: Option<&BufferRange>,
) -> bool {
    let globals = args.globals;
    let atlas = (globals.shadow_atlas != vk::ImageView::null()).then_some(globals.shadow_atlas);
    let resources = [
        (CAMERA_BINDING, globals.camera.map(SceneResource::Uniform)),
        (INSTANCES_BINDING, instances.copied().map(SceneResource::Storage)),
        (LIGHTS_BINDING, globals.lights.map(SceneResource::Storage)),
        (SHADOWS_BINDING, globals.shadows.map(SceneResource::Storage)),
        (SHADOW_ATLAS_BINDING, atlas.map(SceneResource::Image)),
    ];

    let reflection = bound.reflection();
    for (set_index, set_name) in [(PER_CAMERA, "PerCamera"), (PER_OBJECT, "PerObject")] {
        let Some(layout) = reflection.set_layout(set_index) else {
            continue;
        };
        let writes: Vec<_> = resources
            .iter()
            .filter_map(|(name, resource)| {
                let binding = reflection.binding(name).filter(|binding| binding.set == set_index)?;
                Some((binding.binding, resource.as_ref()?))
            })
            .collect();
        if writes.is_empty() {
            continue;
        }

        let set = match ctx.device().temp_descriptor_set(set_name, layout) {
            Ok(set) => set,
            Err(error) => {
                log::warn!("Failed to allocate {set_name} descriptor set: {error}");
                return false;
            }
        };
        for (binding, resource) in writes {
            match resource {
                SceneResource::Uniform(range) => binder.write_uniform_buffer(set, binding, range),
                SceneResource::Storage(range) => binder.write_storage_buffer(set, binding, range),
                SceneResource::Image(view) => {
                    binder.write_sampled_texture(set, binding, 0, *view, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL);
                }
            }
        }
        binder.flush(ctx.device());
        ctx.bind_descriptor_set(bound.pipeline_layout, set_index, set);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::gpu::recording::{RecordedCommand, RecordingContext, RecordingDevice, StubShader};
    use crate::gpu::Shader;
    use crate::resources::{Material, ResourceHandle};
    use ash::vk::Handle;
    use std::sync::Arc;

    fn bound_material(ctx: &mut RecordingContext, shader: StubShader, pass: &RenderPass) -> BoundMaterial {
        let shader: Arc<dyn Shader> = Arc::new(shader);
        let material = Material::new("scene resources", ResourceHandle::Shared(shader));
        material
            .bind(ctx, pass, None, vk::PrimitiveTopology::TRIANGLE_LIST, None)
            .unwrap()
    }

    #[test]
    fn test_binds_only_declared_sets() {
        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let pass = ctx.recording_device_mut().render_pass(PassType::Main);
        let shader = StubShader::new("lit")
            .with_instancing()
            .with_binding(LIGHTS_BINDING, PER_OBJECT, 1, vk::DescriptorType::STORAGE_BUFFER);
        let bound = bound_material(&mut ctx, shader, &pass);

        let camera = Camera::perspective(1.0, 1.0, 0.1, 10.0);
        let buffer = BufferRange {
            buffer: vk::Buffer::from_raw(42),
            offset: 0,
            size: 64,
        };
        let globals = SceneGlobals {
            lights: Some(buffer),
            camera: Some(buffer),
            ..SceneGlobals::default()
        };
        let args = DrawArgs {
            camera: &camera,
            pass: &pass,
            frame_slot: 0,
            object_to_world: Mat4::identity(),
            world_to_object: Mat4::identity(),
            globals: &globals,
        };

        let mut binder = DescriptorBinder::new();
        assert!(bind_scene_resources(&mut ctx, &mut binder, &bound, &args, Some(&buffer)));
        // Camera is not declared by the shader, so only the per-object set is written
        assert_eq!(ctx.recording_device().temp_descriptor_sets(), 1);
        let writes = ctx.recording_device().descriptor_writes();
        assert_eq!(writes.len(), 2);
        assert!(ctx
            .commands()
            .iter()
            .any(|command| matches!(command, RecordedCommand::BindDescriptorSet { set_index: PER_OBJECT, .. })));
    }

    #[test]
    fn test_default_intersect_uses_world_bounds() {
        struct Unit;
        impl Renderer for Unit {
            fn kind(&self) -> RendererKind {
                RendererKind::PointCloud
            }
            fn local_bounds(&self) -> Aabb {
                Aabb::new(-Vec3::repeat(1.0), Vec3::repeat(1.0))
            }
            fn draw(&mut self, _ctx: &mut dyn CommandContext, _args: &DrawArgs<'_>) {}
        }

        let matrix = Mat4::new_translation(&Vec3::new(0.0, 0.0, 10.0));
        let ray = Ray::new(Vec3::zeros(), Vec3::z());
        let hit = Unit.intersect(&ray, &matrix).unwrap();
        approx::assert_relative_eq!(hit, 9.0, epsilon = 1e-5);
        assert!(Unit.intersect(&Ray::new(Vec3::zeros(), -Vec3::z()), &matrix).is_none());
    }
}
