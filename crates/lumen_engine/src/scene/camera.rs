//! Cameras
//!
//! View space is left-handed: the camera looks down +Z with +Y up. A scene
//! camera's pose is copied from its object's world transform before each
//! frame; shadow cameras are posed directly by the shadow pass.

use bytemuck::{Pod, Zeroable};

use super::gizmos::Gizmos;
use crate::foundation::math::{Frustum, Mat4, Mat4Ext, Quat, Vec3, Vec4};

/// Projection model
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Perspective projection
    Perspective {
        /// Vertical field of view in radians
        fov_y: f32,
        /// Width over height
        aspect: f32,
    },
    /// Orthographic projection
    Orthographic {
        /// View volume width
        width: f32,
        /// View volume height
        height: f32,
    },
}

/// Camera data as laid out for the per-camera uniform buffer
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    /// World to view
    pub view: [[f32; 4]; 4],
    /// View to clip
    pub projection: [[f32; 4]; 4],
    /// World to clip
    pub view_projection: [[f32; 4]; 4],
    /// World-space position, w = 1
    pub position: [f32; 4],
    /// Near plane, far plane, aspect, orthographic flag
    pub params: [f32; 4],
}

/// A view into the scene
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    projection: Projection,
    near: f32,
    far: f32,
    position: Vec3,
    rotation: Quat,
}

impl Camera {
    /// Perspective camera at the origin
    pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Perspective { fov_y, aspect },
            near,
            far,
            position: Vec3::zeros(),
            rotation: Quat::identity(),
        }
    }

    /// Orthographic camera at the origin
    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        Self {
            projection: Projection::Orthographic { width, height },
            near,
            far,
            position: Vec3::zeros(),
            rotation: Quat::identity(),
        }
    }

    /// Place the camera
    pub fn set_pose(&mut self, position: Vec3, rotation: Quat) {
        self.position = position;
        self.rotation = rotation;
    }

    /// Replace the projection model
    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
    }

    /// Replace the clip planes
    pub fn set_clip_planes(&mut self, near: f32, far: f32) {
        self.near = near;
        self.far = far;
    }

    /// Update the aspect ratio of a perspective camera
    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective { fov_y, .. } = self.projection {
            self.projection = Projection::Perspective { fov_y, aspect };
        }
    }

    /// Projection model
    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Near plane distance
    pub fn near(&self) -> f32 {
        self.near
    }

    /// Far plane distance
    pub fn far(&self) -> f32 {
        self.far
    }

    /// World-space position
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// World-space rotation
    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    /// Viewing direction (+Z in view space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::z()
    }

    /// +X in view space
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::x()
    }

    /// +Y in view space
    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::y()
    }

    /// World to view matrix
    pub fn view_matrix(&self) -> Mat4 {
        let inverse_rotation = self.rotation.inverse();
        inverse_rotation.to_homogeneous() * Mat4::new_translation(&-self.position)
    }

    /// View to clip matrix
    pub fn projection_matrix(&self) -> Mat4 {
        match self.projection {
            Projection::Perspective { fov_y, aspect } => Mat4::perspective(fov_y, aspect, self.near, self.far),
            Projection::Orthographic { width, height } => Mat4::orthographic(width, height, self.near, self.far),
        }
    }

    /// World to clip matrix
    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// World-space culling frustum
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// World-space corners of the view volume between view depths `near`
    /// and `far`: four near corners, then four far corners
    pub fn slice_corners(&self, near: f32, far: f32) -> [Vec3; 8] {
        let half_extents = |depth: f32| match self.projection {
            Projection::Perspective { fov_y, aspect } => {
                let half_height = (fov_y * 0.5).tan() * depth;
                (half_height * aspect, half_height)
            }
            Projection::Orthographic { width, height } => (width * 0.5, height * 0.5),
        };
        let (right, up, forward) = (self.right(), self.up(), self.forward());
        let mut corners = [Vec3::zeros(); 8];
        for (i, depth) in [near, far].into_iter().enumerate() {
            let (w, h) = half_extents(depth);
            let center = self.position + forward * depth;
            corners[i * 4] = center - right * w - up * h;
            corners[i * 4 + 1] = center + right * w - up * h;
            corners[i * 4 + 2] = center - right * w + up * h;
            corners[i * 4 + 3] = center + right * w + up * h;
        }
        corners
    }

    /// Wire outline of the view volume
    pub fn draw_gizmos(&self, gizmos: &mut Gizmos) {
        let corners = self.slice_corners(self.near, self.far);
        gizmos.wire_hexahedron(&corners, Vec4::new(0.9, 0.9, 0.9, 1.0));
    }

    /// Uniform buffer contents for this camera
    pub fn uniform(&self) -> CameraUniform {
        let (aspect, orthographic) = match self.projection {
            Projection::Perspective { aspect, .. } => (aspect, 0.0),
            Projection::Orthographic { width, height } => (width / height, 1.0),
        };
        let position = Vec4::new(self.position.x, self.position.y, self.position.z, 1.0);
        CameraUniform {
            view: self.view_matrix().into(),
            projection: self.projection_matrix().into(),
            view_projection: self.view_projection().into(),
            position: position.into(),
            params: [self.near, self.far, aspect, orthographic],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Aabb;
    use approx::assert_relative_eq;

    #[test]
    fn test_view_matrix_moves_camera_to_origin() {
        let mut camera = Camera::perspective(1.0, 1.5, 0.1, 100.0);
        camera.set_pose(
            Vec3::new(3.0, 2.0, 1.0),
            Quat::from_axis_angle(&Vec3::y_axis(), 0.8),
        );
        let origin = camera.view_matrix().transform_point(&camera.position().into());
        assert_relative_eq!(origin.coords, Vec3::zeros(), epsilon = 1e-5);

        let ahead = camera.position() + camera.forward() * 5.0;
        let view = camera.view_matrix().transform_point(&ahead.into());
        assert_relative_eq!(view.coords, Vec3::new(0.0, 0.0, 5.0), epsilon = 1e-4);
    }

    #[test]
    fn test_frustum_culls_behind_camera() {
        let camera = Camera::perspective(1.2, 1.0, 0.1, 50.0);
        let frustum = camera.frustum();
        let ahead = Aabb::from_center_extents(Vec3::new(0.0, 0.0, 10.0), Vec3::repeat(1.0));
        let behind = Aabb::from_center_extents(Vec3::new(0.0, 0.0, -10.0), Vec3::repeat(1.0));
        let too_far = Aabb::from_center_extents(Vec3::new(0.0, 0.0, 80.0), Vec3::repeat(1.0));
        assert!(frustum.intersects_aabb(&ahead));
        assert!(!frustum.intersects_aabb(&behind));
        assert!(!frustum.intersects_aabb(&too_far));
    }

    #[test]
    fn test_slice_corners_lie_on_frustum() {
        let camera = Camera::perspective(1.0, 2.0, 0.5, 40.0);
        let corners = camera.slice_corners(1.0, 20.0);
        let view_projection = camera.view_projection();
        for corner in corners {
            let clip = view_projection * Vec4::new(corner.x, corner.y, corner.z, 1.0);
            assert_relative_eq!(clip.x.abs() / clip.w, 1.0, epsilon = 1e-4);
            assert_relative_eq!(clip.y.abs() / clip.w, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_frustum_gizmo_traces_view_volume() {
        let mut camera = Camera::orthographic(4.0, 2.0, 1.0, 9.0);
        camera.set_pose(Vec3::new(0.0, 3.0, 0.0), Quat::identity());
        let mut gizmos = Gizmos::new();
        camera.draw_gizmos(&mut gizmos);
        assert_eq!(gizmos.line_count(), 12);
        for vertex in gizmos.vertices() {
            let [x, y, z] = vertex.position;
            assert_relative_eq!(x.abs(), 2.0, epsilon = 1e-5);
            assert_relative_eq!((y - 3.0).abs(), 1.0, epsilon = 1e-5);
            assert!(z == 1.0 || z == 9.0, "{z}");
        }
    }

    #[test]
    fn test_uniform_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<CameraUniform>(), 3 * 64 + 32);
        let uniform = Camera::orthographic(10.0, 5.0, 0.0, 20.0).uniform();
        assert_relative_eq!(uniform.params[2], 2.0);
        assert_relative_eq!(uniform.params[3], 1.0);
    }
}
