//! Scene management
//!
//! Objects, their transform hierarchy and the per-frame pipeline that turns
//! them into draw calls.
//!
//! ## Architecture
//!
//! ```text
//! Scene (objects, capability views)
//!   ├─ TransformTree     hierarchy, lazy world matrices
//!   ├─ ObjectBvh         culling and ray queries
//!   ├─ lights/shadows    GPU light records, shadow atlas
//!   └─ RenderQueue       sort → batch → Renderer::draw(_instanced)
//! ```

pub mod bvh;
pub mod camera;
pub mod gizmos;
pub mod light;
pub mod mesh_renderer;
pub mod render_queue;
pub mod renderer;
#[allow(clippy::module_inception)]
pub mod scene;
pub mod shadows;
pub mod transform;

#[cfg(test)]
mod tests;

pub use bvh::{BvhItem, ObjectBvh};
pub use camera::{Camera, CameraUniform, Projection};
pub use gizmos::{GizmoVertex, Gizmos};
pub use light::{GpuLight, Light, LightKind, ShadowRecord};
pub use mesh_renderer::MeshRenderer;
pub use render_queue::{plan_batches, DrawBatch, QueueItem, RenderQueue, SortedQueue};
pub use renderer::{BatchKey, DrawArgs, InstanceData, Renderer, RendererKind, SceneGlobals};
pub use scene::{FrameStats, ObjectCapabilities, Scene, SceneError, SceneObject, ScenePlugin, SceneResult};
pub use transform::{ObjectId, TransformNode, TransformTree};
