//! GPU-facing resources referenced by renderers
//!
//! Meshes, textures and samplers are thin records over device objects owned
//! by the asset collaborator. [`Material`] carries the binding logic.

pub mod handle;
pub mod material;
pub mod mesh;
pub mod texture;

pub use handle::ResourceHandle;
pub use material::{BoundMaterial, Material, MaterialError, MaterialId, MaterialParameter, MaterialResult};
pub use mesh::{Mesh, MeshId, VertexLayout};
pub use texture::{Sampler, Texture};
