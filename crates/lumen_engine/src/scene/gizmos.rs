//! Debug line overlay
//!
//! Renderers and the scene push lines into [`Gizmos`] during the gizmo phase;
//! the lines are uploaded to a temporary vertex buffer and drawn as one line
//! list with the gizmo material.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::renderer::{bind_scene_resources, DrawArgs};
use crate::foundation::math::{Aabb, Mat4, Point3, Vec3, Vec4};
use crate::gpu::{upload_temp, CommandContext, DescriptorBinder, GraphicsDevice};
use crate::resources::{Material, VertexLayout};

/// One line endpoint
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct GizmoVertex {
    /// World-space position
    pub position: [f32; 3],
    /// RGBA color
    pub color: [f32; 4],
}

/// Collects debug lines for one frame
#[derive(Debug, Default)]
pub struct Gizmos {
    vertices: Vec<GizmoVertex>,
    material: Option<Arc<Material>>,
    binder: DescriptorBinder,
}

impl Gizmos {
    /// Empty collector without a material; lines are collected but not drawn
    pub fn new() -> Self {
        Self::default()
    }

    /// Material used to draw the lines
    pub fn set_material(&mut self, material: Option<Arc<Material>>) {
        self.material = material;
    }

    /// Free the gizmo material's descriptor sets for `device`
    pub fn release_device(&self, device: &mut dyn GraphicsDevice) {
        if let Some(material) = &self.material {
            material.release_device(device);
        }
    }

    /// Number of lines collected
    pub fn line_count(&self) -> usize {
        self.vertices.len() / 2
    }

    /// Collected endpoints
    pub fn vertices(&self) -> &[GizmoVertex] {
        &self.vertices
    }

    /// Drop all collected lines
    pub fn clear(&mut self) {
        self.vertices.clear();
    }

    /// Add a world-space line
    pub fn line(&mut self, from: Vec3, to: Vec3, color: Vec4) {
        let color = color.into();
        self.vertices.push(GizmoVertex {
            position: from.into(),
            color,
        });
        self.vertices.push(GizmoVertex {
            position: to.into(),
            color,
        });
    }

    /// Add the twelve edges of a box transformed by `matrix`
    pub fn wire_box(&mut self, aabb: &Aabb, matrix: &Mat4, color: Vec4) {
        if !aabb.is_valid() {
            return;
        }
        let corners = std::array::from_fn(|i| {
            let local = Point3::new(
                if i & 1 == 0 { aabb.min.x } else { aabb.max.x },
                if i & 2 == 0 { aabb.min.y } else { aabb.max.y },
                if i & 4 == 0 { aabb.min.z } else { aabb.max.z },
            );
            matrix.transform_point(&local).coords
        });
        self.wire_hexahedron(&corners, color);
    }

    /// Add the twelve edges of a six-sided volume, e.g. a view frustum.
    ///
    /// Corner `i` lies on the max side of the first, second and third axis
    /// where bit 0, 1 and 2 of `i` is set.
    pub fn wire_hexahedron(&mut self, corners: &[Vec3; 8], color: Vec4) {
        const EDGES: [(usize, usize); 12] = [
            (0, 1), (2, 3), (4, 5), (6, 7),
            (0, 2), (1, 3), (4, 6), (5, 7),
            (0, 4), (1, 5), (2, 6), (3, 7),
        ];
        for (a, b) in EDGES {
            self.line(corners[a], corners[b], color);
        }
    }

    /// Draw the collected lines and clear them
    pub fn draw(&mut self, ctx: &mut dyn CommandContext, args: &DrawArgs<'_>) {
        if self.vertices.is_empty() {
            return;
        }
        let Some(material) = self.material.clone() else {
            self.vertices.clear();
            return;
        };

        let layout = gizmo_vertex_layout();
        if let Some(bound) = material.bind(ctx, args.pass, Some(&layout), vk::PrimitiveTopology::LINE_LIST, None) {
            match upload_temp(ctx.device(), "Gizmo Vertices", vk::BufferUsageFlags::VERTEX_BUFFER, &self.vertices) {
                Ok(range) => {
                    if bind_scene_resources(ctx, &mut self.binder, &bound, args, None) {
                        ctx.bind_vertex_buffer(0, range.buffer, range.offset);
                        ctx.draw(u32::try_from(self.vertices.len()).unwrap_or(u32::MAX), 1, 0, 0);
                    }
                }
                Err(error) => log::warn!("Failed to upload gizmo vertices: {error}"),
            }
        }
        self.vertices.clear();
    }
}

fn gizmo_vertex_layout() -> VertexLayout {
    VertexLayout {
        bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<GizmoVertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        attributes: vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 12,
            },
        ],
    }
}
