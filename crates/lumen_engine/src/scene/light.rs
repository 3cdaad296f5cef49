//! Lights and their GPU records

use bytemuck::{Pod, Zeroable};

use super::gizmos::Gizmos;
use crate::foundation::math::{Mat4, Vec3, Vec4};

/// Length of the direction line drawn for a sun
const SUN_GIZMO_LENGTH: f32 = 2.0;

/// Kind of light source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    /// Directional light; shadowed with cascades
    Sun,
    /// Cone light; shadowed with one perspective map
    Spot,
    /// Omnidirectional light; not shadowed
    Point,
}

impl LightKind {
    /// Number of shadow cameras a shadow-casting light of this kind needs
    pub const fn shadow_camera_count(self) -> usize {
        match self {
            Self::Sun => 4,
            Self::Spot => 1,
            Self::Point => 0,
        }
    }

    const fn gpu_type(self) -> u32 {
        match self {
            Self::Sun => 0,
            Self::Spot => 1,
            Self::Point => 2,
        }
    }
}

/// A light component
#[derive(Debug, Clone, PartialEq)]
pub struct Light {
    /// Kind of light
    pub kind: LightKind,
    /// Linear RGB color
    pub color: Vec3,
    /// Intensity multiplier
    pub intensity: f32,
    /// Range of spot and point lights
    pub range: f32,
    /// Half angle of a spot light's cone, in radians
    pub spot_angle: f32,
    /// Whether the light renders shadow maps
    pub casts_shadows: bool,
    /// Index of the light's first shadow record this frame
    pub shadow_index: Option<u32>,
}

impl Light {
    /// White light of the given kind
    pub fn new(kind: LightKind) -> Self {
        Self {
            kind,
            color: Vec3::repeat(1.0),
            intensity: 1.0,
            range: 10.0,
            spot_angle: std::f32::consts::FRAC_PI_4,
            casts_shadows: false,
            shadow_index: None,
        }
    }

    /// Directional light
    pub fn sun() -> Self {
        Self::new(LightKind::Sun)
    }

    /// Spot light
    pub fn spot(range: f32, spot_angle: f32) -> Self {
        Self {
            range,
            spot_angle,
            ..Self::new(LightKind::Spot)
        }
    }

    /// Point light
    pub fn point(range: f32) -> Self {
        Self {
            range,
            ..Self::new(LightKind::Point)
        }
    }

    /// Builder: set color and intensity
    pub fn with_color(mut self, color: Vec3, intensity: f32) -> Self {
        self.color = color;
        self.intensity = intensity;
        self
    }

    /// Builder: enable shadow casting
    pub fn with_shadows(mut self, casts_shadows: bool) -> Self {
        self.casts_shadows = casts_shadows;
        self
    }

    /// Shadow cameras this light needs this frame
    pub fn shadow_camera_count(&self) -> usize {
        if self.casts_shadows {
            self.kind.shadow_camera_count()
        } else {
            0
        }
    }

    /// Wire outline of the light at `position` facing `direction`: a
    /// direction line for suns, the cone for spots and range axes for points
    pub fn draw_gizmos(&self, gizmos: &mut Gizmos, position: Vec3, direction: Vec3) {
        let wire_color = Vec4::new(1.0, 0.9, 0.2, 1.0);
        match self.kind {
            LightKind::Sun => gizmos.line(position, position + direction * SUN_GIZMO_LENGTH, wire_color),
            LightKind::Spot => {
                let tip = position + direction * self.range;
                gizmos.line(position, tip, wire_color);
                let helper = if direction.y.abs() < 0.99 { Vec3::y() } else { Vec3::x() };
                let right = helper.cross(&direction).normalize();
                let up = direction.cross(&right);
                let radius = self.range * self.spot_angle.tan();
                for offset in [right, -right, up, -up] {
                    gizmos.line(position, tip + offset * radius, wire_color);
                }
            }
            LightKind::Point => {
                for axis in [Vec3::x(), Vec3::y(), Vec3::z()] {
                    gizmos.line(position - axis * self.range, position + axis * self.range, wire_color);
                }
            }
        }
    }

    /// GPU record for a light at `position` facing `direction`
    pub fn to_gpu(&self, position: Vec3, direction: Vec3) -> GpuLight {
        let radiance = self.color * self.intensity;
        GpuLight {
            position: [position.x, position.y, position.z, self.range],
            direction: [direction.x, direction.y, direction.z, self.spot_angle.cos()],
            color: [radiance.x, radiance.y, radiance.z, 0.0],
            kind: self.kind.gpu_type(),
            shadow_index: self.shadow_index.map_or(-1, |index| i32::try_from(index).unwrap_or(-1)),
            _padding: [0; 2],
        }
    }
}

/// Light as read by shaders from the light buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct GpuLight {
    /// xyz position, w range
    pub position: [f32; 4],
    /// xyz direction, w cosine of the spot angle
    pub direction: [f32; 4],
    /// rgb radiance
    pub color: [f32; 4],
    /// 0 sun, 1 spot, 2 point
    pub kind: u32,
    /// First shadow record, -1 if unshadowed
    pub shadow_index: i32,
    _padding: [u32; 2],
}

/// One shadow camera as read by shaders from the shadow buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct ShadowRecord {
    /// World to shadow clip space
    pub world_to_shadow: [[f32; 4]; 4],
    /// Atlas sub-rectangle: u offset, v offset, u scale, v scale
    pub atlas_rect: [f32; 4],
    /// Near, far, far split distance of the cascade, orthographic flag
    pub proj_params: [f32; 4],
}

impl ShadowRecord {
    /// Build a record
    pub fn new(world_to_shadow: &Mat4, atlas_rect: [f32; 4], proj_params: [f32; 4]) -> Self {
        Self {
            world_to_shadow: (*world_to_shadow).into(),
            atlas_rect,
            proj_params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_layouts() {
        assert_eq!(std::mem::size_of::<GpuLight>(), 64);
        assert_eq!(std::mem::size_of::<ShadowRecord>(), 96);
    }

    #[test]
    fn test_shadow_camera_counts() {
        assert_eq!(Light::sun().with_shadows(true).shadow_camera_count(), 4);
        assert_eq!(Light::spot(20.0, 0.5).with_shadows(true).shadow_camera_count(), 1);
        assert_eq!(Light::point(5.0).with_shadows(true).shadow_camera_count(), 0);
        assert_eq!(Light::sun().shadow_camera_count(), 0);
    }

    #[test]
    fn test_gizmo_outlines_per_kind() {
        let mut gizmos = Gizmos::new();
        Light::sun().draw_gizmos(&mut gizmos, Vec3::zeros(), Vec3::z());
        assert_eq!(gizmos.line_count(), 1);

        gizmos.clear();
        let spot = Light::spot(10.0, std::f32::consts::FRAC_PI_4);
        spot.draw_gizmos(&mut gizmos, Vec3::zeros(), -Vec3::y());
        assert_eq!(gizmos.line_count(), 5);
        // Rim lines end on the cone's base circle
        for pair in gizmos.vertices().chunks(2).skip(1) {
            let end = Vec3::from(pair[1].position);
            approx::assert_relative_eq!(end.y, -10.0, epsilon = 1e-4);
            approx::assert_relative_eq!(end.xz().norm(), 10.0, epsilon = 1e-4);
        }

        gizmos.clear();
        Light::point(3.0).draw_gizmos(&mut gizmos, Vec3::new(1.0, 0.0, 0.0), Vec3::z());
        assert_eq!(gizmos.line_count(), 3);
        assert_eq!(gizmos.vertices()[0].position, [-2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_unshadowed_light_has_negative_index() {
        let light = Light::sun().with_color(Vec3::new(1.0, 0.5, 0.0), 2.0);
        let gpu = light.to_gpu(Vec3::zeros(), Vec3::z());
        assert_eq!(gpu.shadow_index, -1);
        assert_eq!(gpu.color, [2.0, 1.0, 0.0, 0.0]);

        let shadowed = Light {
            shadow_index: Some(4),
            ..light
        };
        assert_eq!(shadowed.to_gpu(Vec3::zeros(), Vec3::z()).shadow_index, 4);
    }
}
