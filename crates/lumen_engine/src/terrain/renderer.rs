//! Quadtree terrain renderer

use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::quadtree::{QuadNodeId, QuadTree};
use super::triangulation::TriangleFans;
use crate::config::TerrainConfig;
use crate::foundation::math::{Aabb, Mat4, Point3, Vec2, Vec3, Vec4};
use crate::gpu::{upload_temp, BufferRange, CommandContext, DescriptorBinder, DeviceId, GraphicsDevice, PassType};
use crate::resources::{BoundMaterial, Material};
use crate::scene::mesh_renderer::{OBJECT_TO_WORLD_CONSTANT, WORLD_TO_OBJECT_CONSTANT};
use crate::scene::renderer::bind_scene_resources;
use crate::scene::{DrawArgs, Gizmos, Renderer, RendererKind};

/// Push constant range receiving the terrain height
pub const TERRAIN_HEIGHT_CONSTANT: &str = "TerrainHeight";

/// Per-patch record read by the terrain vertex shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct TerrainPatch {
    /// Patch centre in object space, y unused
    pub center: [f32; 3],
    /// Edge length
    pub size: f32,
}

/// Leaves of one edge mask, contiguous in the patch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MaskGroup {
    mask: u8,
    first: u32,
    count: u32,
}

/// Draws a heightmap terrain as a set of quadtree patches
///
/// The quadtree is refined toward the camera of each main pass; depth passes
/// draw the patches chosen by the last main pass. Patches are sorted by edge
/// mask and drawn as one instanced indexed draw per mask.
#[derive(Debug)]
pub struct TerrainRenderer {
    config: TerrainConfig,
    material: Arc<Material>,
    tree: QuadTree,
    fans: TriangleFans,
    patches: Vec<TerrainPatch>,
    groups: Vec<MaskGroup>,
    index_buffers: HashMap<DeviceId, BufferRange>,
    binder: DescriptorBinder,
    casts_shadows: bool,
    visible: bool,
}

impl TerrainRenderer {
    /// Terrain described by `config`, drawn with `material`
    pub fn new(config: TerrainConfig, material: Arc<Material>) -> Self {
        let tree = QuadTree::new(&config);
        let fans = TriangleFans::new(config.patch_resolution);
        let mut renderer = Self {
            config,
            material,
            tree,
            fans,
            patches: Vec::new(),
            groups: Vec::new(),
            index_buffers: HashMap::new(),
            binder: DescriptorBinder::new(),
            casts_shadows: true,
            visible: true,
        };
        renderer.collect_patches();
        renderer
    }

    /// Builder: shadow casting
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    /// Show or hide the terrain
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// The quadtree
    pub fn tree(&self) -> &QuadTree {
        &self.tree
    }

    /// The material
    pub fn material(&self) -> &Arc<Material> {
        &self.material
    }

    /// Patches that will be drawn, sorted by edge mask
    pub fn patches(&self) -> &[TerrainPatch] {
        &self.patches
    }

    /// Refine the quadtree for a camera at `camera` in object space
    pub fn update(&mut self, camera: Vec3) {
        if self.tree.update(Vec2::new(camera.x, camera.z)) {
            log::trace!("Terrain refined to {} nodes", self.tree.len());
        }
        self.collect_patches();
    }

    fn collect_patches(&mut self) {
        let mut leaves: Vec<(u8, QuadNodeId)> = self
            .tree
            .leaves()
            .into_iter()
            .filter_map(|id| Some((self.tree.node(id)?.mask(), id)))
            .collect();
        leaves.sort_by_key(|(mask, _)| *mask);

        self.patches.clear();
        self.groups.clear();
        for (mask, id) in leaves {
            let Some(node) = self.tree.node(id) else {
                continue;
            };
            let center = node.center();
            self.patches.push(TerrainPatch {
                center: [center.x, 0.0, center.y],
                size: 2.0 * node.half_size(),
            });
            match self.groups.last_mut() {
                Some(group) if group.mask == mask => group.count += 1,
                _ => self.groups.push(MaskGroup {
                    mask,
                    first: self.patches.len() as u32 - 1,
                    count: 1,
                }),
            }
        }
    }

    fn index_buffer(&mut self, device: &mut dyn GraphicsDevice) -> Option<BufferRange> {
        if let Some(buffer) = self.index_buffers.get(&device.id()) {
            return Some(*buffer);
        }
        let bytes: &[u8] = bytemuck::cast_slice(self.fans.indices());
        let buffer = match device.create_buffer("Terrain Indices", bytes.len() as vk::DeviceSize, vk::BufferUsageFlags::INDEX_BUFFER) {
            Ok(buffer) => buffer,
            Err(error) => {
                log::warn!("Failed to create terrain index buffer: {error}");
                return None;
            }
        };
        if let Err(error) = device.write_buffer(&buffer, 0, bytes) {
            log::warn!("Failed to upload terrain indices: {error}");
            device.destroy_buffer(buffer);
            return None;
        }
        self.index_buffers.insert(device.id(), buffer);
        Some(buffer)
    }

    fn bind(&self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) -> Option<BoundMaterial> {
        let cull = (args.pass.kind == PassType::Depth).then_some(vk::CullModeFlags::NONE);
        self.material
            .bind(ctx, args.pass, None, vk::PrimitiveTopology::TRIANGLE_LIST, cull)
    }
}

impl Renderer for TerrainRenderer {
    fn kind(&self) -> RendererKind {
        RendererKind::Terrain
    }

    fn local_bounds(&self) -> Aabb {
        let half_height = self.config.height * 0.5;
        Aabb::from_center_extents(
            Vec3::new(0.0, half_height, 0.0),
            Vec3::new(self.config.size * 0.5, half_height, self.config.size * 0.5),
        )
    }

    fn render_queue(&self) -> u32 {
        self.material.render_queue()
    }

    fn visible(&self) -> bool {
        self.visible
    }

    fn casts_shadows(&self) -> bool {
        self.casts_shadows
    }

    fn pre_render(&mut self, _ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) {
        if args.pass.kind != PassType::Main {
            return;
        }
        let camera = args.world_to_object.transform_point(&Point3::from(args.camera.position()));
        self.update(camera.coords);
    }

    fn draw(&mut self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) {
        if self.patches.is_empty() {
            return;
        }
        let Some(indices) = self.index_buffer(ctx.device()) else {
            return;
        };
        let Some(bound) = self.bind(ctx, args) else {
            return;
        };
        bound.push_constant(ctx, OBJECT_TO_WORLD_CONSTANT, bytemuck::cast_slice(args.object_to_world.as_slice()));
        bound.push_constant(ctx, WORLD_TO_OBJECT_CONSTANT, bytemuck::cast_slice(args.world_to_object.as_slice()));
        bound.push_constant(ctx, TERRAIN_HEIGHT_CONSTANT, bytemuck::bytes_of(&self.config.height));

        let patches = match upload_temp(ctx.device(), "Terrain Patches", vk::BufferUsageFlags::STORAGE_BUFFER, &self.patches) {
            Ok(range) => range,
            Err(error) => {
                log::warn!("Failed to upload terrain patches: {error}");
                return;
            }
        };
        if !bind_scene_resources(ctx, &mut self.binder, &bound, args, Some(&patches)) {
            return;
        }

        ctx.bind_index_buffer(indices.buffer, indices.offset, vk::IndexType::UINT16);
        for group in &self.groups {
            let (first_index, index_count) = self.fans.range(group.mask);
            ctx.draw_indexed(index_count, group.count, first_index, 0, group.first);
        }
    }

    fn draw_gizmos(&self, gizmos: &mut Gizmos, object_to_world: &Mat4) {
        for patch in &self.patches {
            let half = patch.size * 0.5;
            let center = Vec3::from(patch.center);
            let outline = Aabb::new(center - Vec3::new(half, 0.0, half), center + Vec3::new(half, 0.0, half));
            gizmos.wire_box(&outline, object_to_world, Vec4::new(0.4, 1.0, 0.4, 1.0));
        }
    }

    fn release_device(&mut self, device: &mut dyn GraphicsDevice) {
        if let Some(buffer) = self.index_buffers.remove(&device.id()) {
            device.destroy_buffer(buffer);
        }
        self.material.release_device(device);
    }
}
