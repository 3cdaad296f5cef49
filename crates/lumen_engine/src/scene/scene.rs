//! Scene container and frame orchestration
//!
//! A [`Scene`] owns its objects in a generational arena. Each object may
//! carry a camera, a light and a renderer; the scene keeps one index view per
//! capability so the frame phases only walk the objects they care about.
//!
//! Frame order:
//!
//! ```text
//! update(time)                plugin pre_update / update / post_update
//! pre_frame(ctx, view)        renderer pre_frame, BVH rebuild, light gather,
//!                             shadow depth passes into the atlas
//! render(ctx, camera, target) cull, pre_render, sort, batch, draw,
//!                             gizmos, post_render
//! ```
//!
//! Everything the scene keeps per device (shadow atlas, light and shadow
//! buffers, the shadow camera pool) lives in a per-device record, and the
//! buffers inside it are indexed by the device's frame slot.

use std::collections::{HashMap, HashSet};
use std::mem::size_of;

use ash::vk;
use bitflags::bitflags;
use slotmap::SecondaryMap;
use thiserror::Error;

use super::bvh::{BvhItem, ObjectBvh};
use super::camera::Camera;
use super::gizmos::Gizmos;
use super::light::{GpuLight, Light, LightKind, ShadowRecord};
use super::render_queue::{plan_batches, QueueItem, RenderQueue};
use super::renderer::{DrawArgs, InstanceData, Renderer, SceneGlobals};
use super::shadows::{atlas_tile, cascade_splits, shadow_record, spot_camera, sun_cascade_camera, SUN_CASCADE_COUNT};
use super::transform::{ObjectId, TransformTree};
use crate::config::{EngineConfig, MAX_GPU_LIGHTS};
use crate::foundation::math::{Aabb, Frustum, Mat4, Ray, Transform, Vec3, Vec4};
use crate::foundation::profiler::Profiler;
use crate::foundation::time::FrameTime;
use crate::gpu::{
    upload_temp, BufferRange, CommandContext, DeviceId, GpuError, GraphicsDevice, PassType, RenderPass, RenderTarget,
};

/// Scene errors
#[derive(Error, Debug)]
pub enum SceneError {
    /// The id does not name an object of this scene
    #[error("Unknown scene object {0:?}")]
    UnknownObject(ObjectId),

    /// The object has no camera component
    #[error("Scene object {0:?} has no camera")]
    NotACamera(ObjectId),

    /// A device call failed
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Result type for scene operations
pub type SceneResult<T> = Result<T, SceneError>;

bitflags! {
    /// Components an object was built with
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectCapabilities: u32 {
        /// Has a camera
        const CAMERA = 1 << 0;
        /// Has a light
        const LIGHT = 1 << 1;
        /// Has a renderer
        const RENDERER = 1 << 2;
    }
}

/// An object in a scene.
///
/// Components are attached while building the object and are fixed from then
/// on; they can be changed in place but not added or removed.
pub struct SceneObject {
    name: String,
    enabled: bool,
    transform: Transform,
    camera: Option<Camera>,
    light: Option<Light>,
    renderer: Option<Box<dyn Renderer>>,
}

impl std::fmt::Debug for SceneObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneObject")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("capabilities", &self.capabilities())
            .finish_non_exhaustive()
    }
}

impl SceneObject {
    /// Empty, enabled object at the origin
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            transform: Transform::identity(),
            camera: None,
            light: None,
            renderer: None,
        }
    }

    /// Builder: local transform
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Builder: camera component
    pub fn with_camera(mut self, camera: Camera) -> Self {
        self.camera = Some(camera);
        self
    }

    /// Builder: light component
    pub fn with_light(mut self, light: Light) -> Self {
        self.light = Some(light);
        self
    }

    /// Builder: renderer component
    pub fn with_renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Some(Box::new(renderer));
        self
    }

    /// Builder: enabled state
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Object name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the object itself is enabled (ancestors are not considered)
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Local transform the object was built with, or had when it was removed
    pub fn transform(&self) -> &Transform {
        &self.transform
    }

    /// Camera component
    pub fn camera(&self) -> Option<&Camera> {
        self.camera.as_ref()
    }

    /// Camera component, mutable
    pub fn camera_mut(&mut self) -> Option<&mut Camera> {
        self.camera.as_mut()
    }

    /// Light component
    pub fn light(&self) -> Option<&Light> {
        self.light.as_ref()
    }

    /// Light component, mutable
    pub fn light_mut(&mut self) -> Option<&mut Light> {
        self.light.as_mut()
    }

    /// Renderer component
    pub fn renderer(&self) -> Option<&dyn Renderer> {
        self.renderer.as_deref()
    }

    /// Renderer component, mutable
    pub fn renderer_mut(&mut self) -> Option<&mut (dyn Renderer + 'static)> {
        self.renderer.as_deref_mut()
    }

    /// Components present on the object
    pub fn capabilities(&self) -> ObjectCapabilities {
        let mut capabilities = ObjectCapabilities::empty();
        capabilities.set(ObjectCapabilities::CAMERA, self.camera.is_some());
        capabilities.set(ObjectCapabilities::LIGHT, self.light.is_some());
        capabilities.set(ObjectCapabilities::RENDERER, self.renderer.is_some());
        capabilities
    }
}

/// Hooks run by [`Scene::update`]
#[allow(unused_variables)]
pub trait ScenePlugin {
    /// Plugin name for logging
    fn name(&self) -> &str;

    /// Runs before every plugin's `update`
    fn pre_update(&mut self, scene: &mut Scene, time: FrameTime) {}

    /// Main update
    fn update(&mut self, scene: &mut Scene, time: FrameTime) {}

    /// Runs after every plugin's `update`
    fn post_update(&mut self, scene: &mut Scene, time: FrameTime) {}
}

/// Counters for the current frame, reset by [`Scene::pre_frame`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Lights uploaded to the light buffer
    pub lights: usize,
    /// Shadow cameras rendered
    pub shadow_passes: usize,
    /// Renderers that passed culling in main passes
    pub visible_renderers: usize,
    /// Draw calls issued through renderers, all passes
    pub draw_calls: usize,
    /// Of those, instanced calls
    pub instanced_draws: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameBuffers {
    lights: Option<BufferRange>,
    shadows: Option<BufferRange>,
}

#[derive(Debug, Default)]
struct SceneDeviceData {
    atlas: Option<RenderTarget>,
    frames: Vec<FrameBuffers>,
    shadow_cameras: Vec<Camera>,
    light_count: u32,
}

impl SceneDeviceData {
    fn new(frame_count: usize) -> Self {
        Self {
            frames: vec![FrameBuffers::default(); frame_count],
            ..Self::default()
        }
    }

    fn globals(&self, frame_slot: usize) -> SceneGlobals {
        let frame = self.frames.get(frame_slot).copied().unwrap_or_default();
        SceneGlobals {
            camera: None,
            lights: frame.lights,
            shadows: frame.shadows,
            shadow_atlas: self.atlas.map_or_else(vk::ImageView::null, |atlas| atlas.depth_view),
            light_count: self.light_count,
        }
    }
}

/// A scene: objects, their hierarchy and the per-frame render pipeline
pub struct Scene {
    config: EngineConfig,
    transforms: TransformTree,
    objects: SecondaryMap<ObjectId, SceneObject>,
    cameras: Vec<ObjectId>,
    lights: Vec<ObjectId>,
    renderers: Vec<ObjectId>,
    device_data: HashMap<DeviceId, SceneDeviceData>,
    bvh: ObjectBvh,
    unmasked: Vec<(ObjectId, Aabb)>,
    bvh_stale: bool,
    gizmos: Gizmos,
    plugins: Vec<Box<dyn ScenePlugin>>,
    stats: FrameStats,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Scene {
    /// Empty scene
    pub fn new(config: EngineConfig) -> Self {
        let leaf_size = usize::try_from(config.renderer.bvh_leaf_size).unwrap_or(1);
        Self {
            config,
            transforms: TransformTree::new(),
            objects: SecondaryMap::new(),
            cameras: Vec::new(),
            lights: Vec::new(),
            renderers: Vec::new(),
            device_data: HashMap::new(),
            bvh: ObjectBvh::new(leaf_size),
            unmasked: Vec::new(),
            bvh_stale: true,
            gizmos: Gizmos::new(),
            plugins: Vec::new(),
            stats: FrameStats::default(),
        }
    }

    /// Scene configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the scene has no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Add a root object
    pub fn add_object(&mut self, object: SceneObject) -> ObjectId {
        let id = self.transforms.insert(object.transform);
        let capabilities = object.capabilities();
        if capabilities.contains(ObjectCapabilities::CAMERA) {
            self.cameras.push(id);
        }
        if capabilities.contains(ObjectCapabilities::LIGHT) {
            self.lights.push(id);
        }
        if capabilities.contains(ObjectCapabilities::RENDERER) {
            self.renderers.push(id);
        }
        log::debug!("Added scene object '{}' ({capabilities:?})", object.name);
        self.objects.insert(id, object);
        self.bvh_stale = true;
        id
    }

    /// Add an object as a child of `parent`
    pub fn add_object_with_parent(&mut self, object: SceneObject, parent: ObjectId) -> SceneResult<ObjectId> {
        if !self.objects.contains_key(parent) {
            return Err(SceneError::UnknownObject(parent));
        }
        let id = self.add_object(object);
        self.transforms.set_parent(id, Some(parent));
        Ok(id)
    }

    /// Remove an object and return it.
    ///
    /// The object leaves every capability view and its parent, and its
    /// children become roots.
    pub fn remove_object(&mut self, id: ObjectId) -> SceneResult<SceneObject> {
        let mut object = self.objects.remove(id).ok_or(SceneError::UnknownObject(id))?;
        self.cameras.retain(|other| *other != id);
        self.lights.retain(|other| *other != id);
        self.renderers.retain(|other| *other != id);
        if let Some(local) = self.transforms.remove(id) {
            object.transform = local;
        }
        self.bvh_stale = true;
        log::debug!("Removed scene object '{}'", object.name);
        Ok(object)
    }

    /// Object by id
    pub fn object(&self, id: ObjectId) -> Option<&SceneObject> {
        self.objects.get(id)
    }

    /// Object by id, mutable
    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.bvh_stale = true;
        self.objects.get_mut(id)
    }

    /// Reparent an object; `false` if an id is unknown or a cycle would form
    pub fn set_parent(&mut self, child: ObjectId, parent: Option<ObjectId>) -> bool {
        self.bvh_stale = true;
        self.transforms.set_parent(child, parent)
    }

    /// Enable or disable an object and, through it, its descendants
    pub fn set_enabled(&mut self, id: ObjectId, enabled: bool) -> SceneResult<()> {
        let object = self.objects.get_mut(id).ok_or(SceneError::UnknownObject(id))?;
        object.enabled = enabled;
        self.bvh_stale = true;
        Ok(())
    }

    /// Whether the object and all its ancestors are enabled
    pub fn is_active(&self, id: ObjectId) -> bool {
        let mut current = Some(id);
        while let Some(object_id) = current {
            match self.objects.get(object_id) {
                Some(object) if object.enabled => {}
                _ => return false,
            }
            current = self.transforms.parent(object_id);
        }
        true
    }

    /// The transform hierarchy
    pub fn transforms(&self) -> &TransformTree {
        &self.transforms
    }

    /// The transform hierarchy, mutable
    pub fn transforms_mut(&mut self) -> &mut TransformTree {
        self.bvh_stale = true;
        &mut self.transforms
    }

    /// Objects with a camera, in insertion order
    pub fn cameras(&self) -> &[ObjectId] {
        &self.cameras
    }

    /// Objects with a light, in insertion order
    pub fn lights(&self) -> &[ObjectId] {
        &self.lights
    }

    /// Objects with a renderer, in insertion order
    pub fn renderers(&self) -> &[ObjectId] {
        &self.renderers
    }

    /// Register a plugin run by [`Scene::update`]
    pub fn add_plugin(&mut self, plugin: Box<dyn ScenePlugin>) {
        log::info!("Registered scene plugin '{}'", plugin.name());
        self.plugins.push(plugin);
    }

    /// Counters of the current frame
    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Gizmo collector, e.g. to set its material or add lines
    pub fn gizmos_mut(&mut self) -> &mut Gizmos {
        &mut self.gizmos
    }

    /// The culling hierarchy as of its last rebuild
    pub fn bvh(&self) -> &ObjectBvh {
        &self.bvh
    }

    /// Scene buffers of `device` for `frame_slot`
    pub fn frame_globals(&self, device: DeviceId, frame_slot: usize) -> SceneGlobals {
        self.device_data
            .get(&device)
            .map(|data| data.globals(frame_slot))
            .unwrap_or_default()
    }

    /// Size of the shadow camera pool of `device`; it grows but never shrinks
    pub fn shadow_camera_pool(&self, device: DeviceId) -> usize {
        self.device_data.get(&device).map_or(0, |data| data.shadow_cameras.len())
    }

    /// Run plugin hooks: every `pre_update`, then every `update`, then every
    /// `post_update`
    pub fn update(&mut self, profiler: &mut Profiler, time: FrameTime) {
        let mut plugins = std::mem::take(&mut self.plugins);
        {
            let _scope = profiler.scope("Pre Update");
            for plugin in &mut plugins {
                plugin.pre_update(self, time);
            }
        }
        {
            let _scope = profiler.scope("Update");
            for plugin in &mut plugins {
                plugin.update(self, time);
            }
        }
        {
            let _scope = profiler.scope("Post Update");
            for plugin in &mut plugins {
                plugin.post_update(self, time);
            }
        }
        // Plugins registered by a plugin during the update
        plugins.append(&mut self.plugins);
        self.plugins = plugins;
        self.bvh_stale = true;
    }

    /// Rebuild the culling hierarchy from active, visible renderers
    pub fn rebuild_bvh(&mut self) {
        let mut items = Vec::with_capacity(self.renderers.len());
        self.unmasked.clear();
        for &id in &self.renderers {
            if !self.is_active(id) {
                continue;
            }
            let Some(object_to_world) = self.transforms.world_matrix(id) else {
                continue;
            };
            let Some(renderer) = self.objects.get(id).and_then(|object| object.renderer.as_deref()) else {
                continue;
            };
            if !renderer.visible() {
                continue;
            }
            let bounds = renderer.local_bounds().transformed(&object_to_world);
            match renderer.collision_mask() {
                // Not queryable by rays, still culled and drawn
                0 => self.unmasked.push((id, bounds)),
                mask => items.push(BvhItem {
                    object: id,
                    bounds,
                    mask,
                }),
            }
        }
        self.bvh.build(items, u32::MAX);
        self.bvh_stale = false;
    }

    /// Prepare the frame: renderer `pre_frame`, culling hierarchy, lights
    /// and shadow maps.
    ///
    /// `view_camera` is the camera the sun cascades are fitted to.
    pub fn pre_frame(
        &mut self,
        ctx: &mut dyn CommandContext,
        profiler: &mut Profiler,
        view_camera: ObjectId,
    ) -> SceneResult<()> {
        self.stats = FrameStats::default();
        let view = self.posed_camera(view_camera)?;

        let light_ids = {
            let _scope = profiler.scope("Pre Frame");
            for &id in &self.renderers {
                if let Some(renderer) = self.objects.get_mut(id).and_then(|object| object.renderer.as_mut()) {
                    renderer.pre_frame(ctx);
                }
            }
            self.rebuild_bvh();
            self.gather_lights()
        };

        let device = ctx.device();
        let device_id = device.id();
        let frame_slot = device.frame_slot();
        let frame_count = device.max_frames_in_flight();
        let mut data = self
            .device_data
            .remove(&device_id)
            .unwrap_or_else(|| SceneDeviceData::new(frame_count));
        let result = self.prepare_lights(ctx, profiler, &view, &light_ids, &mut data, frame_slot);
        self.device_data.insert(device_id, data);
        result
    }

    /// Record one pass of the scene as seen from `camera` into `target`
    pub fn render(
        &mut self,
        ctx: &mut dyn CommandContext,
        profiler: &mut Profiler,
        camera: ObjectId,
        target: &RenderTarget,
    ) -> SceneResult<()> {
        let view_id = camera;
        let camera = self.posed_camera(camera)?;
        if self.bvh_stale {
            self.rebuild_bvh();
        }
        let device_id = ctx.device().id();
        let frame_slot = ctx.device().frame_slot();
        let globals = self.frame_globals(device_id, frame_slot);
        let Some(globals) = upload_camera(ctx, &camera, globals) else {
            return Ok(());
        };

        let pass = &target.render_pass;
        let area = target.full_area();
        ctx.begin_render_pass(target, area);
        ctx.set_viewport(
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: area.extent.width as f32,
                height: area.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            area,
        );
        let visible = self.draw_pass(ctx, profiler, &camera, pass, &globals);
        if pass.kind == PassType::Main {
            self.stats.visible_renderers += visible;
            if self.config.debug.draw_gizmos {
                self.draw_gizmos(ctx, profiler, view_id, &camera, pass, &globals);
            }
        }
        ctx.end_render_pass();
        Ok(())
    }

    /// Closest renderer hit by `ray` whose collision mask overlaps `mask`;
    /// with `any`, the first hit found
    pub fn raycast(&mut self, ray: &Ray, any: bool, mask: u32) -> Option<(ObjectId, f32)> {
        if self.bvh_stale {
            self.rebuild_bvh();
        }
        let transforms = &mut self.transforms;
        let objects = &self.objects;
        self.bvh.intersect_with(ray, any, mask, |item| {
            let renderer = objects.get(item.object)?.renderer.as_deref()?;
            let object_to_world = transforms.world_matrix(item.object)?;
            renderer.intersect(ray, &object_to_world)
        })
    }

    /// Release everything held for `device` after waiting for it to go idle
    pub fn release_device(&mut self, device: &mut dyn GraphicsDevice) -> SceneResult<()> {
        device.wait_idle()?;
        if let Some(data) = self.device_data.remove(&device.id()) {
            if let Some(atlas) = data.atlas {
                device.destroy_render_target(atlas);
            }
            for frame in data.frames {
                for buffer in [frame.lights, frame.shadows].into_iter().flatten() {
                    device.destroy_buffer(buffer);
                }
            }
        }
        for &id in &self.renderers {
            if let Some(renderer) = self.objects.get_mut(id).and_then(|object| object.renderer.as_mut()) {
                renderer.release_device(device);
            }
        }
        self.gizmos.release_device(device);
        log::info!("Released scene resources for device {:?}", device.id());
        Ok(())
    }

    fn posed_camera(&mut self, id: ObjectId) -> SceneResult<Camera> {
        let position = self.transforms.world_position(id).ok_or(SceneError::UnknownObject(id))?;
        let rotation = self.transforms.world_rotation(id).ok_or(SceneError::UnknownObject(id))?;
        let object = self.objects.get_mut(id).ok_or(SceneError::UnknownObject(id))?;
        let camera = object.camera.as_mut().ok_or(SceneError::NotACamera(id))?;
        camera.set_pose(position, rotation);
        Ok(camera.clone())
    }

    /// Active lights in insertion order, capped at the GPU light limit
    fn gather_lights(&mut self) -> Vec<ObjectId> {
        let limit = self.config.renderer.max_gpu_lights.min(MAX_GPU_LIGHTS) as usize;
        let active: Vec<ObjectId> = self.lights.iter().copied().filter(|&id| self.is_active(id)).collect();
        if active.len() > limit {
            log::debug!("Dropping {} lights over the limit of {limit}", active.len() - limit);
            for &id in &active[limit..] {
                if let Some(light) = self.objects.get_mut(id).and_then(|object| object.light.as_mut()) {
                    light.shadow_index = None;
                }
            }
        }
        active.into_iter().take(limit).collect()
    }

    fn prepare_lights(
        &mut self,
        ctx: &mut dyn CommandContext,
        profiler: &mut Profiler,
        view: &Camera,
        light_ids: &[ObjectId],
        data: &mut SceneDeviceData,
        frame_slot: usize,
    ) -> SceneResult<()> {
        let shadow_config = self.config.shadows.clone();
        let tile_count = shadow_config.tile_count() as usize;
        let mut gpu_lights = Vec::with_capacity(light_ids.len());
        let mut records: Vec<ShadowRecord> = Vec::new();
        let mut tiles = Vec::new();

        for &id in light_ids {
            let (Some(position), Some(rotation)) =
                (self.transforms.world_position(id), self.transforms.world_rotation(id))
            else {
                continue;
            };
            let Some(light) = self.objects.get_mut(id).and_then(|object| object.light.as_mut()) else {
                continue;
            };
            light.shadow_index = None;

            let needed = light.shadow_camera_count();
            if needed > 0 && records.len() + needed <= tile_count {
                let cameras: Vec<(Camera, f32)> = match light.kind {
                    LightKind::Sun => {
                        let far = shadow_config.shadow_distance.min(view.far());
                        let splits = cascade_splits(view.near(), far, SUN_CASCADE_COUNT, shadow_config.cascade_lambda);
                        splits
                            .windows(2)
                            .map(|pair| (sun_cascade_camera(view, rotation, pair[0], pair[1], &shadow_config), pair[1]))
                            .collect()
                    }
                    LightKind::Spot => vec![(spot_camera(light, position, rotation), light.range)],
                    LightKind::Point => Vec::new(),
                };

                let first = records.len();
                for (camera, split_far) in cameras {
                    let Some(tile) = u32::try_from(records.len())
                        .ok()
                        .and_then(|index| atlas_tile(&shadow_config, index))
                    else {
                        break;
                    };
                    records.push(shadow_record(&camera, &tile, split_far));
                    let index = tiles.len();
                    if index < data.shadow_cameras.len() {
                        data.shadow_cameras[index] = camera;
                    } else {
                        data.shadow_cameras.push(camera);
                    }
                    tiles.push(tile);
                }
                light.shadow_index = u32::try_from(first).ok();
            } else if needed > 0 {
                log::debug!("No free shadow tiles for light {id:?}, drawing it unshadowed");
            }

            gpu_lights.push(light.to_gpu(position, rotation * Vec3::z()));
        }

        self.stats.lights = gpu_lights.len();
        self.stats.shadow_passes = tiles.len();
        data.light_count = u32::try_from(gpu_lights.len()).unwrap_or(MAX_GPU_LIGHTS);

        if data.frames.len() <= frame_slot {
            data.frames.resize_with(frame_slot + 1, FrameBuffers::default);
        }
        let device = ctx.device();
        let frame = &mut data.frames[frame_slot];
        let lights = match frame.lights {
            Some(buffer) => buffer,
            None => {
                let size = (MAX_GPU_LIGHTS as usize * size_of::<GpuLight>()) as vk::DeviceSize;
                let buffer = device.create_buffer("Scene Lights", size, vk::BufferUsageFlags::STORAGE_BUFFER)?;
                *frame.lights.insert(buffer)
            }
        };
        device.write_buffer(&lights, 0, bytemuck::cast_slice(&gpu_lights))?;
        let shadows = match frame.shadows {
            Some(buffer) => buffer,
            None => {
                let size = (tile_count.max(1) * size_of::<ShadowRecord>()) as vk::DeviceSize;
                let buffer = device.create_buffer("Scene Shadows", size, vk::BufferUsageFlags::STORAGE_BUFFER)?;
                *frame.shadows.insert(buffer)
            }
        };
        device.write_buffer(&shadows, 0, bytemuck::cast_slice(&records))?;

        if tiles.is_empty() {
            return Ok(());
        }
        let atlas = match data.atlas {
            Some(atlas) => atlas,
            None => {
                let atlas = device.create_shadow_atlas("Shadow Atlas", shadow_config.atlas_resolution)?;
                log::info!(
                    "Created {0}x{0} shadow atlas with {tile_count} tiles",
                    shadow_config.atlas_resolution
                );
                *data.atlas.insert(atlas)
            }
        };

        let mut scope = profiler.scope("Shadows");
        ctx.begin_render_pass(&atlas, atlas.full_area());
        for (camera, tile) in data.shadow_cameras.iter().zip(&tiles) {
            ctx.set_viewport(tile.viewport(), tile.rect);
            if let Some(globals) = upload_camera(ctx, camera, SceneGlobals::default()) {
                self.draw_pass(ctx, &mut scope, camera, &atlas.render_pass, &globals);
            }
        }
        ctx.end_render_pass();
        Ok(())
    }

    /// Cull, sort, batch and draw every renderer for one pass. Returns the
    /// number of renderers drawn.
    fn draw_pass(
        &mut self,
        ctx: &mut dyn CommandContext,
        profiler: &mut Profiler,
        camera: &Camera,
        pass: &RenderPass,
        globals: &SceneGlobals,
    ) -> usize {
        let frame_slot = ctx.device().frame_slot();
        let visible = self.cull(&camera.frustum(), pass.kind);
        let mut matrices: SecondaryMap<ObjectId, (Mat4, Mat4)> = SecondaryMap::new();

        {
            let _scope = profiler.resume_scope("Pre Render");
            for &id in &visible {
                let (Some(object_to_world), Some(world_to_object)) =
                    (self.transforms.world_matrix(id), self.transforms.inverse_world_matrix(id))
                else {
                    continue;
                };
                matrices.insert(id, (object_to_world, world_to_object));
                let args = DrawArgs {
                    camera,
                    pass,
                    frame_slot,
                    object_to_world,
                    world_to_object,
                    globals,
                };
                if let Some(renderer) = self.objects.get_mut(id).and_then(|object| object.renderer.as_mut()) {
                    renderer.pre_render(ctx, &args);
                }
            }
        }

        let (sorted, batches) = {
            let _scope = profiler.resume_scope("Sort");
            let mut queue = RenderQueue::new();
            for &id in &visible {
                let Some(renderer) = self.objects.get(id).and_then(|object| object.renderer.as_deref()) else {
                    continue;
                };
                let batch_key = renderer.batch_key();
                queue.push(QueueItem {
                    object: id,
                    queue: renderer.render_queue(),
                    batch_key,
                    instanced: batch_key.is_some() && renderer.supports_instancing(ctx.device(), pass.kind),
                });
            }
            let sorted = queue.into_sorted();
            let max_batch = usize::try_from(self.config.renderer.max_instance_batch).unwrap_or(usize::MAX);
            let batches = plan_batches(&sorted, max_batch);
            (sorted, batches)
        };

        {
            let _scope = profiler.resume_scope("Draw");
            let items = sorted.items();
            for batch in &batches {
                let run = &items[batch.start..batch.start + batch.count];
                let Some(&(object_to_world, world_to_object)) = matrices.get(run[0].object) else {
                    continue;
                };
                let args = DrawArgs {
                    camera,
                    pass,
                    frame_slot,
                    object_to_world,
                    world_to_object,
                    globals,
                };

                if batch.instanced {
                    let instances: Vec<InstanceData> = run
                        .iter()
                        .filter_map(|item| matrices.get(item.object))
                        .map(|(object_to_world, world_to_object)| InstanceData::new(object_to_world, world_to_object))
                        .collect();
                    let range = match upload_temp(
                        ctx.device(),
                        "Instances",
                        vk::BufferUsageFlags::STORAGE_BUFFER,
                        &instances,
                    ) {
                        Ok(range) => range,
                        Err(error) => {
                            log::warn!("Failed to upload {} instances: {error}", instances.len());
                            continue;
                        }
                    };
                    let Some(renderer) = self.objects.get_mut(run[0].object).and_then(|object| object.renderer.as_mut())
                    else {
                        continue;
                    };
                    let count = u32::try_from(instances.len()).unwrap_or(u32::MAX);
                    renderer.draw_instanced(ctx, &args, count, &range);
                    self.stats.draw_calls += 1;
                    self.stats.instanced_draws += 1;
                    continue;
                }

                for item in run {
                    let Some(&(object_to_world, world_to_object)) = matrices.get(item.object) else {
                        continue;
                    };
                    let Some(renderer) = self.objects.get_mut(item.object).and_then(|object| object.renderer.as_mut())
                    else {
                        continue;
                    };
                    let args = DrawArgs {
                        object_to_world,
                        world_to_object,
                        ..args
                    };
                    renderer.draw(ctx, &args);
                    self.stats.draw_calls += 1;
                }
            }
        }

        {
            let _scope = profiler.resume_scope("Post Render");
            for &id in &visible {
                if let Some(renderer) = self.objects.get_mut(id).and_then(|object| object.renderer.as_mut()) {
                    renderer.post_render(ctx, pass.kind);
                }
            }
        }
        log::trace!("Drew {} renderers in {:?} pass", visible.len(), pass.kind);
        visible.len()
    }

    /// Renderers intersecting `frustum` that draw in a pass of `kind`, in
    /// insertion order
    fn cull(&self, frustum: &Frustum, kind: PassType) -> Vec<ObjectId> {
        let mut hits = Vec::new();
        self.bvh.frustum_check(frustum, u32::MAX, &mut hits);
        let mut hits: HashSet<ObjectId> = hits.into_iter().collect();
        hits.extend(
            self.unmasked
                .iter()
                .filter(|(_, bounds)| frustum.intersects_aabb(bounds))
                .map(|(id, _)| *id),
        );

        self.renderers
            .iter()
            .copied()
            .filter(|id| hits.contains(id))
            .filter(|&id| {
                self.objects
                    .get(id)
                    .and_then(|object| object.renderer.as_deref())
                    .is_some_and(|renderer| renderer.visible() && (kind != PassType::Depth || renderer.casts_shadows()))
            })
            .collect()
    }

    fn draw_gizmos(
        &mut self,
        ctx: &mut dyn CommandContext,
        profiler: &mut Profiler,
        view_id: ObjectId,
        camera: &Camera,
        pass: &RenderPass,
        globals: &SceneGlobals,
    ) {
        let _scope = profiler.scope("Gizmos");
        let active: Vec<ObjectId> = self.objects.keys().filter(|&id| self.is_active(id)).collect();
        for id in active {
            let (Some(object_to_world), Some(position), Some(rotation)) = (
                self.transforms.world_matrix(id),
                self.transforms.world_position(id),
                self.transforms.world_rotation(id),
            ) else {
                continue;
            };
            let Some(object) = self.objects.get_mut(id) else {
                continue;
            };
            if let Some(renderer) = object.renderer.as_deref() {
                renderer.draw_gizmos(&mut self.gizmos, &object_to_world);
            }
            if let Some(light) = &object.light {
                light.draw_gizmos(&mut self.gizmos, position, rotation * Vec3::z());
            }
            // Not the camera being rendered from
            if let Some(other) = object.camera.as_mut().filter(|_| id != view_id) {
                other.set_pose(position, rotation);
                other.draw_gizmos(&mut self.gizmos);
            }
        }
        if self.config.debug.draw_bvh {
            for bounds in self.bvh.node_bounds() {
                self.gizmos.wire_box(bounds, &Mat4::identity(), Vec4::new(1.0, 0.6, 0.1, 1.0));
            }
        }
        let args = DrawArgs {
            camera,
            pass,
            frame_slot: ctx.device().frame_slot(),
            object_to_world: Mat4::identity(),
            world_to_object: Mat4::identity(),
            globals,
        };
        self.gizmos.draw(ctx, &args);
    }
}

fn upload_camera(ctx: &mut dyn CommandContext, camera: &Camera, globals: SceneGlobals) -> Option<SceneGlobals> {
    match upload_temp(ctx.device(), "Camera", vk::BufferUsageFlags::UNIFORM_BUFFER, &[camera.uniform()]) {
        Ok(range) => Some(SceneGlobals {
            camera: Some(range),
            ..globals
        }),
        Err(error) => {
            log::warn!("Failed to upload camera uniforms: {error}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Quat;
    use crate::gpu::recording::{RecordedCommand, RecordingContext, RecordingDevice, StubShader};
    use crate::gpu::Shader;
    use crate::resources::{Material, Mesh, ResourceHandle, VertexLayout};
    use crate::scene::mesh_renderer::MeshRenderer;
    use ash::vk::Handle;
    use std::sync::Arc;

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

    fn material() -> Arc<Material> {
        let shader: Arc<dyn Shader> = Arc::new(StubShader::new("lit"));
        Arc::new(Material::new("lit", ResourceHandle::Shared(shader)))
    }

    fn mesh_object(name: &str, position: Vec3) -> SceneObject {
        SceneObject::new(name)
            .with_transform(Transform::from_position(position))
            .with_renderer(MeshRenderer::new(cube(), material()))
    }

    fn camera_object() -> SceneObject {
        SceneObject::new("camera").with_camera(Camera::perspective(1.2, 1.0, 0.1, 200.0))
    }

    #[test]
    fn test_views_follow_capabilities() {
        let mut scene = Scene::default();
        let camera = scene.add_object(camera_object());
        let light = scene.add_object(SceneObject::new("lamp").with_light(Light::point(10.0)));
        let cube = scene.add_object(mesh_object("cube", Vec3::zeros()));
        let empty = scene.add_object(SceneObject::new("empty"));

        assert_eq!(scene.cameras(), &[camera]);
        assert_eq!(scene.lights(), &[light]);
        assert_eq!(scene.renderers(), &[cube]);
        assert_eq!(scene.object(empty).unwrap().capabilities(), ObjectCapabilities::empty());
        assert_eq!(
            scene.object(cube).unwrap().capabilities(),
            ObjectCapabilities::RENDERER
        );

        let removed = scene.remove_object(cube).unwrap();
        assert_eq!(removed.name(), "cube");
        assert!(scene.renderers().is_empty());
        assert!(matches!(scene.remove_object(cube), Err(SceneError::UnknownObject(_))));
        assert_eq!(scene.len(), 3);
    }

    #[test]
    fn test_remove_parent_detaches_children() {
        let mut scene = Scene::default();
        let parent = scene.add_object(SceneObject::new("parent").with_transform(Transform::from_position(Vec3::x())));
        let a = scene.add_object_with_parent(SceneObject::new("a"), parent).unwrap();
        let b = scene.add_object_with_parent(SceneObject::new("b"), parent).unwrap();
        assert_eq!(scene.transforms().children(parent), &[a, b]);

        let removed = scene.remove_object(parent).unwrap();
        assert_eq!(removed.transform().position, Vec3::x());
        assert_eq!(scene.transforms().parent(a), None);
        assert_eq!(scene.transforms().parent(b), None);
        assert_eq!(scene.transforms_mut().world_position(a), Some(Vec3::zeros()));
        assert!(scene.add_object_with_parent(SceneObject::new("c"), parent).is_err());
    }

    #[test]
    fn test_disabled_ancestor_hides_subtree() {
        let mut scene = Scene::default();
        let root = scene.add_object(SceneObject::new("root"));
        let child = scene.add_object_with_parent(mesh_object("child", Vec3::zeros()), root).unwrap();
        assert!(scene.is_active(child));

        scene.set_enabled(root, false).unwrap();
        assert!(!scene.is_active(child));
        scene.rebuild_bvh();
        assert!(scene.bvh().is_empty());

        scene.set_enabled(root, true).unwrap();
        scene.rebuild_bvh();
        assert_eq!(scene.bvh().len(), 1);
    }

    #[test]
    fn test_render_draws_visible_objects_only() {
        let mut scene = Scene::default();
        let camera = scene.add_object(camera_object());
        scene.add_object(mesh_object("ahead", Vec3::new(0.0, 0.0, 5.0)));
        scene.add_object(mesh_object("behind", Vec3::new(0.0, 0.0, -5.0)));

        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let target = ctx.recording_device_mut().render_target(640, 480);
        let mut profiler = Profiler::new(true);
        profiler.begin_frame();
        scene.pre_frame(&mut ctx, &mut profiler, camera).unwrap();
        scene.render(&mut ctx, &mut profiler, camera, &target).unwrap();
        profiler.end_frame().unwrap();

        assert_eq!(ctx.draws().len(), 1);
        assert_eq!(scene.stats().visible_renderers, 1);
        assert!(matches!(ctx.commands().first(), Some(RecordedCommand::BeginRenderPass { pass: PassType::Main, .. })));
        assert_eq!(ctx.commands().last(), Some(&RecordedCommand::EndRenderPass));
        let frame = profiler.last_frame().unwrap();
        for label in ["Pre Frame", "Pre Render", "Sort", "Draw", "Post Render"] {
            assert!(frame.find(label).is_some(), "missing {label}");
        }
    }

    #[test]
    fn test_render_requires_camera() {
        let mut scene = Scene::default();
        let cube = scene.add_object(mesh_object("cube", Vec3::zeros()));
        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let target = ctx.recording_device_mut().render_target(64, 64);
        let mut profiler = Profiler::new(false);
        assert!(matches!(
            scene.render(&mut ctx, &mut profiler, cube, &target),
            Err(SceneError::NotACamera(_))
        ));
    }

    #[test]
    fn test_lights_capped_in_insertion_order() {
        let mut scene = Scene::default();
        let camera = scene.add_object(camera_object());
        for i in 0..70 {
            scene.add_object(SceneObject::new(format!("lamp {i}")).with_light(Light::point(i as f32 + 1.0)));
        }
        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let mut profiler = Profiler::new(false);
        scene.pre_frame(&mut ctx, &mut profiler, camera).unwrap();
        assert_eq!(scene.stats().lights, 64);

        let device = ctx.recording_device();
        let globals = scene.frame_globals(device.id(), 0);
        assert_eq!(globals.light_count, 64);
        let bytes = device.buffer_contents(globals.lights.unwrap().buffer).unwrap();
        let stride = size_of::<GpuLight>();
        for i in [0, 31, 63] {
            let light: GpuLight = bytemuck::pod_read_unaligned(&bytes[i * stride..(i + 1) * stride]);
            approx::assert_relative_eq!(light.position[3], i as f32 + 1.0);
            assert_eq!(light.shadow_index, -1);
        }
    }

    #[test]
    fn test_shadow_tiles_and_camera_pool() {
        let config = EngineConfig::default().with_shadow_atlas(2048, 1024);
        let mut scene = Scene::new(config);
        let camera = scene.add_object(camera_object());
        scene.add_object(mesh_object("cube", Vec3::new(0.0, 0.0, 5.0)));
        let down = Quat::rotation_between(&Vec3::z(), &-Vec3::y()).unwrap();
        let sun = scene.add_object(
            SceneObject::new("sun")
                .with_transform(Transform::from_position_rotation(Vec3::zeros(), down))
                .with_light(Light::sun().with_shadows(true)),
        );
        let spot = scene.add_object(
            SceneObject::new("spot")
                .with_transform(Transform::from_position_rotation(Vec3::new(0.0, 5.0, 5.0), down))
                .with_light(Light::spot(20.0, 0.5).with_shadows(true)),
        );

        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let device_id = ctx.recording_device().id();
        let mut profiler = Profiler::new(false);
        scene.pre_frame(&mut ctx, &mut profiler, camera).unwrap();

        // Four tiles: the sun takes them all, the spot goes unshadowed
        assert_eq!(scene.object(sun).unwrap().light().unwrap().shadow_index, Some(0));
        assert_eq!(scene.object(spot).unwrap().light().unwrap().shadow_index, None);
        assert_eq!(scene.stats().shadow_passes, 4);
        assert_eq!(scene.shadow_camera_pool(device_id), 4);
        let viewports = ctx
            .commands()
            .iter()
            .filter(|command| matches!(command, RecordedCommand::SetViewport { .. }))
            .count();
        assert_eq!(viewports, 4);

        // Without the sun the spot gets the first tile; the pool keeps its size
        scene.remove_object(sun).unwrap();
        ctx.next_frame();
        scene.pre_frame(&mut ctx, &mut profiler, camera).unwrap();
        assert_eq!(scene.object(spot).unwrap().light().unwrap().shadow_index, Some(0));
        assert_eq!(scene.stats().shadow_passes, 1);
        assert_eq!(scene.shadow_camera_pool(device_id), 4);
    }

    #[test]
    fn test_raycast_respects_mask() {
        let mut scene = Scene::default();
        let near = scene.add_object(
            SceneObject::new("near")
                .with_transform(Transform::from_position(Vec3::new(0.0, 0.0, 3.0)))
                .with_renderer(MeshRenderer::new(cube(), material()).with_collision_mask(0b01)),
        );
        let far = scene.add_object(
            SceneObject::new("far")
                .with_transform(Transform::from_position(Vec3::new(0.0, 0.0, 8.0)))
                .with_renderer(MeshRenderer::new(cube(), material()).with_collision_mask(0b10)),
        );
        let ray = Ray::new(Vec3::zeros(), Vec3::z());

        let (hit, distance) = scene.raycast(&ray, false, u32::MAX).unwrap();
        assert_eq!(hit, near);
        approx::assert_relative_eq!(distance, 2.5, epsilon = 1e-4);
        assert_eq!(scene.raycast(&ray, false, 0b10).map(|(id, _)| id), Some(far));

        scene.transforms_mut().set_local_position(near, Vec3::new(10.0, 0.0, 3.0));
        assert_eq!(scene.raycast(&ray, false, u32::MAX).map(|(id, _)| id), Some(far));
    }

    #[test]
    fn test_release_device_waits_idle() {
        let mut scene = Scene::default();
        let camera = scene.add_object(camera_object());
        scene.add_object(SceneObject::new("lamp").with_light(Light::point(5.0)));
        let mut ctx = RecordingContext::new(RecordingDevice::new(2));
        let mut profiler = Profiler::new(false);
        scene.pre_frame(&mut ctx, &mut profiler, camera).unwrap();
        let device_id = ctx.recording_device().id();
        assert!(scene.frame_globals(device_id, 0).lights.is_some());

        scene.release_device(ctx.recording_device_mut()).unwrap();
        assert_eq!(ctx.recording_device().wait_idle_calls(), 1);
        assert!(scene.frame_globals(device_id, 0).lights.is_none());
    }

    struct Spinner {
        target: ObjectId,
        calls: Vec<&'static str>,
    }

    impl ScenePlugin for Spinner {
        fn name(&self) -> &str {
            "spinner"
        }

        fn pre_update(&mut self, _scene: &mut Scene, _time: FrameTime) {
            self.calls.push("pre");
        }

        fn update(&mut self, scene: &mut Scene, time: FrameTime) {
            self.calls.push("update");
            let rotation = Quat::from_axis_angle(&Vec3::y_axis(), time.delta_time);
            scene.transforms_mut().set_local_rotation(self.target, rotation);
        }

        fn post_update(&mut self, scene: &mut Scene, _time: FrameTime) {
            self.calls.push("post");
            assert!(scene.transforms().is_dirty(self.target));
        }
    }

    #[test]
    fn test_update_runs_plugin_phases() {
        let mut scene = Scene::default();
        let target = scene.add_object(SceneObject::new("spun"));
        scene.add_plugin(Box::new(Spinner {
            target,
            calls: Vec::new(),
        }));
        let time = FrameTime {
            delta_time: 0.5,
            total_time: 0.5,
            frame_number: 1,
        };
        let mut profiler = Profiler::new(true);
        profiler.begin_frame();
        scene.update(&mut profiler, time);
        profiler.end_frame().unwrap();
        approx::assert_relative_eq!(scene.transforms_mut().world_rotation(target).unwrap().angle(), 0.5, epsilon = 1e-5);
        assert_eq!(scene.plugins.len(), 1);

        let frame = profiler.last_frame().unwrap();
        for label in ["Pre Update", "Update", "Post Update"] {
            assert!(frame.find(label).is_some(), "{label}");
        }
    }
}
