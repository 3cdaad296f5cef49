//! Mesh and vertex layout descriptions
//!
//! Vertex and index data live in device buffers created by the asset
//! collaborator; a [`Mesh`] only records where they are and how to draw them.

use ash::vk;

use super::handle::next_resource_id;
use crate::foundation::math::Aabb;
use crate::gpu::{BufferRange, CommandContext};

/// Identity of a mesh, used for sorting and batching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u64);

/// Vertex input state for pipeline creation
#[derive(Debug, Clone, Default)]
pub struct VertexLayout {
    /// Vertex buffer bindings
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex attributes
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl VertexLayout {
    /// Interleaved position (vec3), normal (vec3) and uv (vec2) in binding 0
    pub fn position_normal_uv() -> Self {
        let attribute = |location: u32, format: vk::Format, offset: u32| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        };
        Self {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: 32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes: vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, 0),
                attribute(1, vk::Format::R32G32B32_SFLOAT, 12),
                attribute(2, vk::Format::R32G32_SFLOAT, 24),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IndexData {
    buffer: BufferRange,
    count: u32,
    index_type: vk::IndexType,
}

/// Drawable geometry
#[derive(Debug, Clone)]
pub struct Mesh {
    id: MeshId,
    name: String,
    vertex_buffer: Option<BufferRange>,
    vertex_count: u32,
    indices: Option<IndexData>,
    vertex_layout: VertexLayout,
    topology: vk::PrimitiveTopology,
    bounds: Aabb,
}

impl Mesh {
    /// A triangle-list mesh with no buffers yet
    pub fn new(name: impl Into<String>, bounds: Aabb) -> Self {
        Self {
            id: MeshId(next_resource_id()),
            name: name.into(),
            vertex_buffer: None,
            vertex_count: 0,
            indices: None,
            vertex_layout: VertexLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            bounds,
        }
    }

    /// Attach vertex data
    pub fn with_vertices(mut self, buffer: BufferRange, vertex_count: u32, layout: VertexLayout) -> Self {
        self.vertex_buffer = Some(buffer);
        self.vertex_count = vertex_count;
        self.vertex_layout = layout;
        self
    }

    /// Attach index data
    pub fn with_indices(mut self, buffer: BufferRange, index_count: u32, index_type: vk::IndexType) -> Self {
        self.indices = Some(IndexData {
            buffer,
            count: index_count,
            index_type,
        });
        self
    }

    /// Set the primitive topology
    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    /// Mesh identity
    pub fn id(&self) -> MeshId {
        self.id
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object-space bounds
    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// Vertex input layout
    pub fn vertex_layout(&self) -> &VertexLayout {
        &self.vertex_layout
    }

    /// Primitive topology
    pub fn topology(&self) -> vk::PrimitiveTopology {
        self.topology
    }

    /// Indices when indexed, vertices otherwise
    pub fn element_count(&self) -> u32 {
        self.indices.map_or(self.vertex_count, |indices| indices.count)
    }

    /// Bind the mesh buffers and draw `instance_count` instances
    pub fn draw(&self, ctx: &mut dyn CommandContext, instance_count: u32) {
        if let Some(vertices) = &self.vertex_buffer {
            ctx.bind_vertex_buffer(0, vertices.buffer, vertices.offset);
        }
        match &self.indices {
            Some(indices) => {
                ctx.bind_index_buffer(indices.buffer.buffer, indices.buffer.offset, indices.index_type);
                ctx.draw_indexed(indices.count, instance_count, 0, 0, 0);
            }
            None => ctx.draw(self.vertex_count, instance_count, 0, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;
    use crate::gpu::recording::{RecordedCommand, RecordingContext, RecordingDevice};
    use ash::vk::Handle;

    fn range(raw: u64) -> BufferRange {
        BufferRange {
            buffer: vk::Buffer::from_raw(raw),
            offset: 0,
            size: 1024,
        }
    }

    #[test]
    fn test_indexed_mesh_draws_indexed() {
        let mesh = Mesh::new("cube", Aabb::from_center_extents(Vec3::zeros(), Vec3::repeat(1.0)))
            .with_vertices(range(1), 24, VertexLayout::position_normal_uv())
            .with_indices(range(2), 36, vk::IndexType::UINT16);
        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        mesh.draw(&mut ctx, 5);

        assert_eq!(mesh.element_count(), 36);
        assert!(ctx.commands().contains(&RecordedCommand::DrawIndexed {
            index_count: 36,
            instance_count: 5,
            first_index: 0,
            first_instance: 0,
        }));
    }

    #[test]
    fn test_meshes_get_distinct_ids() {
        let a = Mesh::new("a", Aabb::empty());
        let b = Mesh::new("b", Aabb::empty());
        assert_ne!(a.id(), b.id());
    }
}
