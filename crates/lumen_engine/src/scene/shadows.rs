//! Shadow atlas layout and shadow camera placement
//!
//! All shadow maps of a frame share one square depth atlas split into a grid
//! of equal tiles, `atlas_resolution / tile_resolution` per row. A sun light
//! takes four consecutive tiles (one per cascade), a spot light one.

use ash::vk;

use super::camera::{Camera, Projection};
use super::light::{Light, ShadowRecord};
use crate::config::ShadowConfig;
use crate::foundation::math::{utils, Quat, Vec3};

/// Number of cascades rendered for a sun light
pub const SUN_CASCADE_COUNT: usize = 4;

/// One tile of the shadow atlas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtlasTile {
    /// Tile index, row major
    pub index: u32,
    /// Pixel rectangle inside the atlas
    pub rect: vk::Rect2D,
    /// Normalized rectangle: u offset, v offset, u scale, v scale
    pub uv_rect: [f32; 4],
}

impl AtlasTile {
    /// Viewport covering the tile
    pub fn viewport(&self) -> vk::Viewport {
        vk::Viewport {
            x: self.rect.offset.x as f32,
            y: self.rect.offset.y as f32,
            width: self.rect.extent.width as f32,
            height: self.rect.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Tile `index` of the atlas, or `None` past the last tile
pub fn atlas_tile(config: &ShadowConfig, index: u32) -> Option<AtlasTile> {
    let per_row = config.tiles_per_row();
    if per_row == 0 || index >= config.tile_count() {
        return None;
    }
    let (column, row) = (index % per_row, index / per_row);
    let size = config.tile_resolution;
    let offset = |cell: u32| i32::try_from(cell * size).ok();
    let scale = size as f32 / config.atlas_resolution as f32;
    Some(AtlasTile {
        index,
        rect: vk::Rect2D {
            offset: vk::Offset2D {
                x: offset(column)?,
                y: offset(row)?,
            },
            extent: vk::Extent2D {
                width: size,
                height: size,
            },
        },
        uv_rect: [column as f32 * scale, row as f32 * scale, scale, scale],
    })
}

/// View distances bounding `count` cascades between `near` and `far`.
///
/// Blends a uniform split (`lambda = 0`) with a logarithmic one
/// (`lambda = 1`). Returns `count + 1` increasing distances.
pub fn cascade_splits(near: f32, far: f32, count: usize, lambda: f32) -> Vec<f32> {
    let near = near.max(1e-3);
    let far = far.max(near);
    (0..=count)
        .map(|i| {
            let t = i as f32 / count.max(1) as f32;
            let logarithmic = near * (far / near).powf(t);
            let uniform = near + (far - near) * t;
            utils::lerp(uniform, logarithmic, lambda)
        })
        .collect()
}

/// Orthographic camera covering the view frustum slice `[near, far]` as
/// seen from a sun shining along `light_rotation`'s forward axis.
///
/// The volume is the slice's bounding sphere, so its size does not change as
/// the view rotates, and its centre is snapped to whole shadow texels to keep
/// edges from swimming. The camera is pulled back by `depth_padding` so
/// casters outside the view still land in the map.
pub fn sun_cascade_camera(
    view: &Camera,
    light_rotation: Quat,
    near: f32,
    far: f32,
    config: &ShadowConfig,
) -> Camera {
    let corners = view.slice_corners(near, far);
    let center = corners.iter().sum::<Vec3>() / corners.len() as f32;
    let radius = corners
        .iter()
        .map(|corner| (corner - center).norm())
        .fold(0.0_f32, f32::max)
        .max(1e-3);

    let texel = 2.0 * radius / config.tile_resolution.max(1) as f32;
    let mut light_space = light_rotation.inverse() * center;
    light_space.x = (light_space.x / texel).floor() * texel;
    light_space.y = (light_space.y / texel).floor() * texel;
    let center = light_rotation * light_space;

    // One texel of slack for the snapping
    let half_size = radius + texel;
    let forward = light_rotation * Vec3::z();
    let pull_back = radius + config.depth_padding;
    let mut camera = Camera::orthographic(2.0 * half_size, 2.0 * half_size, 0.0, pull_back + radius);
    camera.set_pose(center - forward * pull_back, light_rotation);
    camera
}

/// Perspective camera covering a spot light's cone
pub fn spot_camera(light: &Light, position: Vec3, rotation: Quat) -> Camera {
    let far = light.range.max(0.02);
    let fov = (2.0 * light.spot_angle).clamp(0.01, std::f32::consts::PI - 0.01);
    let mut camera = Camera::perspective(fov, 1.0, far * 0.001, far);
    camera.set_pose(position, rotation);
    camera
}

/// GPU record for a shadow camera rendered into `tile`
pub fn shadow_record(camera: &Camera, tile: &AtlasTile, split_far: f32) -> ShadowRecord {
    let orthographic = matches!(camera.projection(), Projection::Orthographic { .. });
    ShadowRecord::new(
        &camera.view_projection(),
        tile.uv_rect,
        [camera.near(), camera.far(), split_far, if orthographic { 1.0 } else { 0.0 }],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Aabb;
    use approx::assert_relative_eq;

    #[test]
    fn test_atlas_tiles_form_grid() {
        let config = ShadowConfig::default();
        assert_eq!(config.tiles_per_row(), 8);

        let first = atlas_tile(&config, 0).unwrap();
        assert_eq!(first.rect.offset.x, 0);
        assert_eq!(first.uv_rect, [0.0, 0.0, 0.125, 0.125]);

        let tile = atlas_tile(&config, 9).unwrap();
        assert_eq!((tile.rect.offset.x, tile.rect.offset.y), (1024, 1024));
        assert_relative_eq!(tile.uv_rect[0], 0.125);
        assert_relative_eq!(tile.viewport().width, 1024.0);

        assert!(atlas_tile(&config, 63).is_some());
        assert!(atlas_tile(&config, 64).is_none());
    }

    #[test]
    fn test_cascade_splits_blend() {
        let uniform = cascade_splits(1.0, 101.0, 4, 0.0);
        for (split, expected) in uniform.iter().zip([1.0, 26.0, 51.0, 76.0, 101.0]) {
            assert_relative_eq!(*split, expected, epsilon = 1e-3);
        }

        let log = cascade_splits(1.0, 10000.0, 4, 1.0);
        for (split, expected) in log.iter().zip([1.0, 10.0, 100.0, 1000.0, 10000.0]) {
            assert_relative_eq!(*split, expected, max_relative = 1e-3);
        }

        let mixed = cascade_splits(0.1, 100.0, 4, 0.75);
        assert!(mixed.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_sun_cascade_contains_slice() {
        let mut view = Camera::perspective(1.0, 16.0 / 9.0, 0.1, 500.0);
        view.set_pose(Vec3::new(10.0, 5.0, -3.0), Quat::from_axis_angle(&Vec3::y_axis(), 0.6));
        let sun = Quat::rotation_between(&Vec3::z(), &Vec3::new(0.3, -1.0, 0.2)).unwrap();
        let config = ShadowConfig::default();

        let camera = sun_cascade_camera(&view, sun, 5.0, 20.0, &config);
        let frustum = camera.frustum();
        for corner in view.slice_corners(5.0, 20.0) {
            let probe = Aabb::from_center_extents(corner, Vec3::repeat(1e-3));
            assert!(frustum.intersects_aabb(&probe), "corner {corner:?} outside cascade");
        }
    }

    #[test]
    fn test_spot_camera_matches_cone() {
        let light = Light::spot(30.0, 0.4);
        let camera = spot_camera(&light, Vec3::new(0.0, 10.0, 0.0), Quat::identity());
        assert_relative_eq!(camera.far(), 30.0);
        match camera.projection() {
            Projection::Perspective { fov_y, aspect } => {
                assert_relative_eq!(fov_y, 0.8);
                assert_relative_eq!(aspect, 1.0);
            }
            Projection::Orthographic { .. } => panic!("spot shadows are perspective"),
        }
    }
}
