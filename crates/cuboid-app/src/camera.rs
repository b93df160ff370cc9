// SPDX-License-Identifier: CEPL-1.0
//! Fixed orbit camera. Produces one combined matrix per frame for the
//! renderer's uniform buffer.

use glam::{Mat4, Vec3, Vec4};

const FOV_Y_DEG: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 100.0;

const EYE_DIR: Vec3 = Vec3::new(0.0, 0.5, 1.0);
const SPIN_AXIS: Vec3 = Vec3::new(0.0, 1.0, 0.5);

pub const MIN_DISTANCE: f32 = 1.0;
pub const MAX_DISTANCE: f32 = 20.0;

/// Combined projection * view * model, looking at the origin from
/// `distance` away with the cube rotated by `angle` radians.
pub fn view_proj(aspect: f32, distance: f32, angle: f32) -> [[f32; 4]; 4] {
    matrix(aspect, distance, angle).to_cols_array_2d()
}

fn matrix(aspect: f32, distance: f32, angle: f32) -> Mat4 {
    let proj = Mat4::perspective_rh(FOV_Y_DEG.to_radians(), aspect, Z_NEAR, Z_FAR);
    // Vulkan clip space has Y pointing down.
    let flip = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0));
    let eye = EYE_DIR.normalize() * distance.clamp(MIN_DISTANCE, MAX_DISTANCE);
    let view = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
    let model = Mat4::from_axis_angle(SPIN_AXIS.normalize(), angle);
    flip * proj * view * model
}
