//! Quadtree terrain
//!
//! [`QuadTree`] decides which patches to draw, [`TriangleFans`] holds the
//! index variants that stitch a patch to coarser neighbours, and
//! [`TerrainRenderer`] ties them to the scene as a [`crate::scene::Renderer`].

pub mod quadtree;
pub mod renderer;
pub mod triangulation;

pub use quadtree::{Edge, QuadNode, QuadNodeId, QuadTree};
pub use renderer::{TerrainPatch, TerrainRenderer, TERRAIN_HEIGHT_CONSTANT};
pub use triangulation::TriangleFans;
