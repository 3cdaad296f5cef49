//! Scene Demo
//!
//! Drives a few frames of the scene pipeline against the in-memory recording
//! device and logs what was recorded:
//! - A sun with cascaded shadows and a spot light
//! - A grid of cubes sharing one mesh and material, drawn instanced
//! - A quadtree terrain refined around the camera
//! - A plugin orbiting the camera around the origin
//!
//! Usage: `scene_demo [config.toml|config.ron]`

use std::f32::consts::TAU;
use std::sync::Arc;

use ash::vk;
use lumen_engine::foundation::logging;
use lumen_engine::gpu::recording::{RecordingContext, RecordingDevice, StubShader};
use lumen_engine::gpu::{BufferRange, Shader};
use lumen_engine::prelude::*;
use lumen_engine::resources::VertexLayout;
use lumen_engine::scene::mesh_renderer::{OBJECT_TO_WORLD_CONSTANT, WORLD_TO_OBJECT_CONSTANT};
use lumen_engine::terrain::TERRAIN_HEIGHT_CONSTANT;

const FRAME_COUNT: u64 = 4;
const GRID_SIZE: i32 = 6;
const GRID_SPACING: f32 = 4.0;
const ORBIT_RADIUS: f32 = 30.0;
const ORBIT_HEIGHT: f32 = 12.0;

/// Moves the camera on a circle around the origin, looking at it
struct CameraOrbit {
    camera: ObjectId,
    speed: f32,
}

impl ScenePlugin for CameraOrbit {
    fn name(&self) -> &str {
        "camera orbit"
    }

    fn update(&mut self, scene: &mut Scene, time: FrameTime) {
        let angle = (time.total_time * self.speed) % TAU;
        let position = Vec3::new(angle.sin() * ORBIT_RADIUS, ORBIT_HEIGHT, -angle.cos() * ORBIT_RADIUS);
        let rotation = Quat::face_towards(&-position, &Vec3::y());
        scene
            .transforms_mut()
            .set_local(self.camera, Transform::from_position_rotation(position, rotation));
    }
}

fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => Ok(EngineConfig::load_from_file(path)?),
        None => Ok(EngineConfig::default().with_gizmos(true).with_shadow_atlas(4096, 1024)),
    }
}

fn cube_mesh(ctx: &mut RecordingContext) -> Result<Arc<Mesh>, Box<dyn std::error::Error>> {
    let device = ctx.device();
    let vertices: BufferRange = device.create_buffer("Cube Vertices", 24 * 32, vk::BufferUsageFlags::VERTEX_BUFFER)?;
    let indices: BufferRange = device.create_buffer("Cube Indices", 36 * 2, vk::BufferUsageFlags::INDEX_BUFFER)?;
    Ok(Arc::new(
        Mesh::new("cube", Aabb::new(-Vec3::repeat(0.5), Vec3::repeat(0.5)))
            .with_vertices(vertices, 24, VertexLayout::position_normal_uv())
            .with_indices(indices, 36, vk::IndexType::UINT16),
    ))
}

fn material(name: &str, shader: StubShader) -> Arc<Material> {
    let shader: Arc<dyn Shader> = Arc::new(shader);
    Arc::new(Material::new(name, ResourceHandle::Shared(shader)))
}

fn build_scene(config: EngineConfig, ctx: &mut RecordingContext) -> Result<(Scene, ObjectId), Box<dyn std::error::Error>> {
    let terrain_config = config.terrain.clone();
    let mut scene = Scene::new(config);
    scene.gizmos_mut().set_material(Some(material("gizmo", StubShader::new("gizmo"))));

    let camera = scene.add_object(
        SceneObject::new("Main Camera").with_camera(Camera::perspective(60f32.to_radians(), 16.0 / 9.0, 0.1, 400.0)),
    );
    scene.add_plugin(Box::new(CameraOrbit { camera, speed: 0.5 }));

    let sun_rotation = Quat::face_towards(&Vec3::new(0.3, -1.0, 0.4), &Vec3::y());
    scene.add_object(
        SceneObject::new("Sun")
            .with_transform(Transform::from_position_rotation(Vec3::zeros(), sun_rotation))
            .with_light(Light::sun().with_color(Vec3::new(1.0, 0.95, 0.9), 3.0).with_shadows(true)),
    );
    scene.add_object(
        SceneObject::new("Spot")
            .with_transform(Transform::from_position_rotation(
                Vec3::new(0.0, 10.0, 0.0),
                Quat::face_towards(&-Vec3::y(), &Vec3::z()),
            ))
            .with_light(Light::spot(25.0, 45f32.to_radians())),
    );

    let cube = cube_mesh(ctx)?;
    let lit = material(
        "lit",
        StubShader::new("lit")
            .with_instancing()
            .with_push_constant(OBJECT_TO_WORLD_CONSTANT, 0, 64)
            .with_push_constant(WORLD_TO_OBJECT_CONSTANT, 64, 64),
    );
    let grid = scene.add_object(SceneObject::new("Cube Grid"));
    for x in 0..GRID_SIZE {
        for z in 0..GRID_SIZE {
            let offset = (GRID_SIZE - 1) as f32 * 0.5;
            let position = Vec3::new((x as f32 - offset) * GRID_SPACING, 1.0, (z as f32 - offset) * GRID_SPACING);
            scene.add_object_with_parent(
                SceneObject::new(format!("Cube {x},{z}"))
                    .with_transform(Transform::from_position(position))
                    .with_renderer(MeshRenderer::new(Arc::clone(&cube), Arc::clone(&lit))),
                grid,
            )?;
        }
    }

    let terrain_material = material(
        "terrain",
        StubShader::new("terrain")
            .with_instancing()
            .with_push_constant(OBJECT_TO_WORLD_CONSTANT, 0, 64)
            .with_push_constant(WORLD_TO_OBJECT_CONSTANT, 64, 64)
            .with_push_constant(TERRAIN_HEIGHT_CONSTANT, 128, 4),
    );
    scene.add_object(
        SceneObject::new("Terrain")
            .with_transform(Transform::from_position(Vec3::new(0.0, -2.0, 0.0)))
            .with_renderer(TerrainRenderer::new(terrain_config, terrain_material)),
    );

    log::info!("Scene built with {} objects", scene.len());
    Ok((scene, camera))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    config.validate()?;
    logging::init_with_level(&config.log_level);
    let profiling = config.debug.enable_profiling;

    let mut ctx = RecordingContext::new(RecordingDevice::new(2));
    let target = ctx.recording_device_mut().render_target(1920, 1080);
    let (mut scene, camera) = build_scene(config, &mut ctx)?;

    let mut profiler = Profiler::new(profiling);
    let mut timer = Timer::new();
    for _ in 0..FRAME_COUNT {
        let time = timer.tick();
        profiler.begin_frame();
        scene.update(&mut profiler, time);
        scene.pre_frame(&mut ctx, &mut profiler, camera)?;
        scene.render(&mut ctx, &mut profiler, camera, &target)?;
        profiler.end_frame()?;

        let stats = scene.stats();
        log::info!(
            "Frame {}: {} lights, {} shadow passes, {} visible, {} draws ({} instanced)",
            time.frame_number,
            stats.lights,
            stats.shadow_passes,
            stats.visible_renderers,
            stats.draw_calls,
            stats.instanced_draws
        );
        if profiler.is_enabled() {
            log::debug!("\n{}", profiler.format_last_frame());
        }
        let recorded = ctx.draws().len();
        log::debug!("Recorded {recorded} draw commands");
        ctx.next_frame();
    }

    if let Some((hit, distance)) = scene.raycast(&Ray::new(Vec3::new(0.0, 50.0, 0.0), -Vec3::y()), false, u32::MAX) {
        let name = scene.object(hit).map_or("<removed>", |object| object.name());
        log::info!("Ray from above hits {name} at {distance:.2}");
    }

    scene.release_device(ctx.device())?;
    log::info!(
        "Released device resources ({} live descriptor sets left)",
        ctx.recording_device().live_descriptor_sets()
    );
    Ok(())
}
