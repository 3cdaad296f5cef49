//! # Lumen Engine
//!
//! Scene graph and rendering core for a Vulkan engine. The crate owns no
//! window, swapchain or GPU allocator; it talks to those through the traits in
//! [`gpu`] and records draws into whatever [`gpu::CommandContext`] it is given.
//!
//! ## Features
//!
//! - **Transform hierarchy**: parented objects with lazily cached world matrices
//! - **Materials**: shader keyword variants, per-device descriptor sets, push constants
//! - **Render queue**: sorted submission with automatic instancing
//! - **Lights and shadows**: cascaded sun shadows and spot shadows in one atlas
//! - **Culling and picking**: bounding volume hierarchy over scene objects
//! - **Terrain**: quadtree LOD with crack-free patch stitching
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lumen_engine::prelude::*;
//! use lumen_engine::gpu::recording::{RecordingContext, RecordingDevice};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::default();
//!     let mut scene = Scene::new(config);
//!     let camera = scene.add_object(
//!         SceneObject::new("Camera").with_camera(Camera::perspective(1.0, 16.0 / 9.0, 0.1, 500.0)),
//!     );
//!
//!     let mut ctx = RecordingContext::new(RecordingDevice::new(2));
//!     let target = ctx.recording_device_mut().render_target(1280, 720);
//!     let mut profiler = Profiler::new(true);
//!     profiler.begin_frame();
//!     scene.pre_frame(&mut ctx, &mut profiler, camera)?;
//!     scene.render(&mut ctx, &mut profiler, camera, &target)?;
//!     profiler.end_frame()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod gpu;
pub mod resources;
pub mod scene;
pub mod terrain;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, EngineConfig},
        foundation::{
            math::{Aabb, Mat4, Quat, Ray, Transform, Vec3},
            profiler::Profiler,
            time::{FrameTime, Timer},
        },
        gpu::{CommandContext, GraphicsDevice, PassType, RenderTarget},
        resources::{Material, Mesh, ResourceHandle},
        scene::{
            Camera, Light, LightKind, MeshRenderer, ObjectId, Renderer, Scene, SceneError, SceneObject, ScenePlugin,
        },
        terrain::TerrainRenderer,
    };
}
