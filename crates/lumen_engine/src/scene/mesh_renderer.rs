//! Static mesh renderer

use std::sync::Arc;

use ash::vk;

use super::renderer::{bind_scene_resources, BatchKey, DrawArgs, Renderer, RendererKind};
use crate::foundation::math::Aabb;
use crate::gpu::{BufferRange, CommandContext, DescriptorBinder, GraphicsDevice, PassType};
use crate::resources::{BoundMaterial, Material, Mesh};

/// Push constant range receiving the object to world matrix
pub const OBJECT_TO_WORLD_CONSTANT: &str = "ObjectToWorld";
/// Push constant range receiving the world to object matrix
pub const WORLD_TO_OBJECT_CONSTANT: &str = "WorldToObject";

/// Draws one mesh with one material
#[derive(Debug)]
pub struct MeshRenderer {
    mesh: Arc<Mesh>,
    material: Arc<Material>,
    casts_shadows: bool,
    visible: bool,
    collision_mask: u32,
    binder: DescriptorBinder,
}

impl MeshRenderer {
    /// Renderer for `mesh` drawn with `material`
    pub fn new(mesh: Arc<Mesh>, material: Arc<Material>) -> Self {
        Self {
            mesh,
            material,
            casts_shadows: true,
            visible: true,
            collision_mask: u32::MAX,
            binder: DescriptorBinder::new(),
        }
    }

    /// Builder: shadow casting
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    /// Builder: collision mask
    pub fn with_collision_mask(mut self, mask: u32) -> Self {
        self.collision_mask = mask;
        self
    }

    /// Show or hide the renderer
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// The mesh
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// The material
    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    fn bind(&self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) -> Option<BoundMaterial> {
        // Shadow maps need back faces too
        let cull = (args.pass.kind == PassType::Depth).then_some(vk::CullModeFlags::NONE);
        self.material.bind(
            ctx,
            args.pass,
            Some(self.mesh.vertex_layout()),
            self.mesh.topology(),
            cull,
        )
    }
}

impl Renderer for MeshRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::StaticMesh
    }

    fn local_bounds(&self) -> Aabb {
        self.mesh.bounds()
    }

    fn render_queue(&self) -> u32 {
        self.material.render_queue()
    }

    fn visible(&self) -> bool {
        self.visible && self.mesh.element_count() > 0
    }

    fn casts_shadows(&self) -> bool {
        self.casts_shadows
    }

    fn collision_mask(&self) -> u32 {
        self.collision_mask
    }

    fn batch_key(&self) -> Option<BatchKey> {
        Some(BatchKey {
            mesh: self.mesh.id(),
            material: self.material.id(),
        })
    }

    fn supports_instancing(&self, device: &dyn GraphicsDevice, pass: PassType) -> bool {
        self.material
            .shader_variant(device, pass)
            .is_some_and(|variant| variant.reflection().supports_instancing())
    }

    fn draw(&mut self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) {
        let Some(bound) = self.bind(ctx, args) else {
            return;
        };
        bound.push_constant(ctx, OBJECT_TO_WORLD_CONSTANT, bytemuck::cast_slice(args.object_to_world.as_slice()));
        bound.push_constant(ctx, WORLD_TO_OBJECT_CONSTANT, bytemuck::cast_slice(args.world_to_object.as_slice()));
        if !bind_scene_resources(ctx, &mut self.binder, &bound, args, None) {
            return;
        }
        self.mesh.draw(ctx, 1);
    }

    fn draw_instanced(
        &mut self,
        ctx: &mut dyn CommandContext,
        args: &DrawArgs<'_>,
        instance_count: u32,
        instances: &BufferRange,
    ) {
        let Some(bound) = self.bind(ctx, args) else {
            return;
        };
        if !bind_scene_resources(ctx, &mut self.binder, &bound, args, Some(instances)) {
            return;
        }
        self.mesh.draw(ctx, instance_count);
    }

    fn release_device(&mut self, device: &mut dyn GraphicsDevice) {
        self.material.release_device(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{Mat4, Vec3};
    use crate::gpu::recording::{RecordedCommand, RecordingContext, RecordingDevice, StubShader};
    use crate::gpu::Shader;
    use crate::resources::{ResourceHandle, VertexLayout};
    use crate::scene::camera::Camera;
    use crate::scene::renderer::SceneGlobals;
    use ash::vk::Handle;

    fn cube() -> Arc<Mesh> {
        let range = |raw| BufferRange {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
            size: 1024,
        };
        Arc::new(
            Mesh::new("cube", Aabb::new(-Vec3::repeat(0.5), Vec3::repeat(0.5)))
                .with_vertices(range(1), 24, VertexLayout::position_normal_uv())
                .with_indices(range(2), 36, vk::IndexType::UINT16),
        )
    }

    fn renderer(shader: StubShader) -> MeshRenderer {
        let shader: Arc<dyn Shader> = Arc::new(shader);
        MeshRenderer::new(cube(), Arc::new(Material::new("mesh", ResourceHandle::Shared(shader))))
    }

    fn draw_with(renderer: &mut MeshRenderer, kind: PassType, instanced: bool) -> Vec<RecordedCommand> {
        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let pass = ctx.recording_device_mut().render_pass(kind);
        let camera = Camera::perspective(1.0, 1.0, 0.1, 10.0);
        let globals = SceneGlobals::default();
        let args = DrawArgs {
            camera: &camera,
            pass: &pass,
            frame_slot: 0,
            object_to_world: Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0)),
            world_to_object: Mat4::new_translation(&Vec3::new(-1.0, -2.0, -3.0)),
            globals: &globals,
        };
        if instanced {
            let instances = BufferRange {
                buffer: vk::Buffer::from_raw(9),
                offset: 0,
                size: 128 * 3,
            };
            renderer.draw_instanced(&mut ctx, &args, 3, &instances);
        } else {
            renderer.draw(&mut ctx, &args);
        }
        ctx.commands().to_vec()
    }

    #[test]
    fn test_draw_pushes_object_matrices() {
        let mut renderer = renderer(
            StubShader::new("lit")
                .with_push_constant(OBJECT_TO_WORLD_CONSTANT, 0, 64)
                .with_push_constant(WORLD_TO_OBJECT_CONSTANT, 64, 64),
        );
        let commands = draw_with(&mut renderer, PassType::Main, false);
        let pushes = commands
            .iter()
            .filter(|command| matches!(command, RecordedCommand::PushConstants { data, .. } if data.len() == 64))
            .count();
        assert_eq!(pushes, 2);
        assert_eq!(commands.iter().filter_map(RecordedCommand::instance_count).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_instanced_draw_binds_instance_buffer() {
        let mut renderer = renderer(StubShader::new("instanced").with_instancing());
        let device = RecordingDevice::new(2);
        assert!(renderer.supports_instancing(&device, PassType::Main));

        let commands = draw_with(&mut renderer, PassType::Main, true);
        assert!(commands
            .iter()
            .any(|command| matches!(command, RecordedCommand::BindDescriptorSet { set_index: 2, .. })));
        assert_eq!(commands.iter().filter_map(RecordedCommand::instance_count).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_plain_shader_does_not_instance() {
        let renderer = renderer(StubShader::new("plain"));
        assert!(!renderer.supports_instancing(&RecordingDevice::new(2), PassType::Main));
        assert_eq!(renderer.kind(), RendererKind::StaticMesh);
        assert!(renderer.visible());
        assert!(renderer.batch_key().is_some());
    }

    #[test]
    fn test_unresolved_material_skips_draw() {
        let mut renderer = renderer(StubShader::new("broken").without_pipelines());
        assert!(draw_with(&mut renderer, PassType::Depth, false).is_empty());
    }
}
