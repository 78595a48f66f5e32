//! Time-warp matrix math
//!
//! Matrices are glam column-vector matrices. A layer's warp matrix maps a
//! lens-space tangent-angle vector `(tx, ty, -1, 1)` to projective texture
//! coordinates of the eye image that was rendered at the layer's pose:
//!
//! `tex_coords_from_tan_angles * time_warp(rendered, predicted) * velocity`

use glam::{Mat4, Quat};

/// Orientations with a squared length at or below this are treated as unset.
pub const VALID_QUATERNION_LENGTH_SQ: f32 = 0.95;

/// Never extrapolate the external velocity over more frames than this.
pub const MAX_VELOCITY_STEPS: u32 = 3;

fn usable(orientation: Quat) -> bool {
    orientation.length_squared() > VALID_QUATERNION_LENGTH_SQ
}

/// Rotation that re-projects an image rendered at `rendered` so it appears
/// correct for a head at `predicted`.
///
/// When one orientation is unusable the other stands in for it and the warp
/// is identity; when both are unusable the identity orientation is used.
pub fn calculate_time_warp(rendered: Quat, predicted: Quat) -> Mat4 {
    let (from, to) = match (usable(rendered), usable(predicted)) {
        (true, true) => (rendered, predicted),
        (true, false) => (rendered, rendered),
        (false, true) => (predicted, predicted),
        (false, false) => (Quat::IDENTITY, Quat::IDENTITY),
    };

    let view = Mat4::from_quat(from.normalize());
    let sensor = Mat4::from_quat(to.normalize());
    (sensor.inverse() * view).inverse()
}

/// Number of frames the external velocity is compounded over.
pub fn velocity_steps(vsync_base: f64, minimum_vsync: i64) -> u32 {
    (vsync_base as i64 - minimum_vsync).clamp(0, MAX_VELOCITY_STEPS as i64) as u32
}

/// `external` applied `steps` times on top of identity.
pub fn extrapolate_velocity(external: Mat4, steps: u32) -> Mat4 {
    (0..steps).fold(Mat4::IDENTITY, |velocity, _| velocity * external)
}

/// Warp matrix of one layer for one scan edge.
pub fn layer_warp(tex_coords_from_tan_angles: Mat4, rendered: Quat, predicted: Quat, velocity: Mat4) -> Mat4 {
    tex_coords_from_tan_angles * calculate_time_warp(rendered, predicted) * velocity
}

/// Texture matrix for a symmetric eye buffer rendered with the given field
/// of view. Texture v grows downward.
pub fn tex_coords_from_fov(fov_x_degrees: f32, fov_y_degrees: f32) -> Mat4 {
    let scale_x = 0.5 / (fov_x_degrees.to_radians() * 0.5).tan();
    let scale_y = 0.5 / (fov_y_degrees.to_radians() * 0.5).tan();
    let rows = [
        [scale_x, 0.0, -0.5, 0.0],
        [0.0, -scale_y, -0.5, 0.0],
        [0.0, 0.0, -1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ];
    Mat4::from_cols_array_2d(&rows).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Vec3, Vec4};

    fn orientations() -> Vec<Quat> {
        vec![
            Quat::IDENTITY,
            Quat::from_rotation_y(0.7),
            Quat::from_rotation_x(-0.4) * Quat::from_rotation_z(1.9),
            Quat::from_axis_angle(Vec3::new(1.0, 2.0, 3.0).normalize(), 2.5),
        ]
    }

    #[test]
    fn matching_orientations_give_identity() {
        for q in orientations() {
            let warp = calculate_time_warp(q, q);
            assert!(warp.abs_diff_eq(Mat4::IDENTITY, 1e-5), "{q:?} -> {warp:?}");
        }
    }

    #[test]
    fn warp_from_identity_is_predicted_rotation() {
        let predicted = Quat::from_rotation_y(0.25);
        let warp = calculate_time_warp(Quat::IDENTITY, predicted);
        assert!(warp.abs_diff_eq(Mat4::from_quat(predicted), 1e-5));
    }

    #[test]
    fn unusable_orientations_substitute() {
        let q = Quat::from_rotation_x(0.9);
        let zero = Quat::from_xyzw(0.0, 0.0, 0.0, 0.0);
        assert!(calculate_time_warp(zero, q).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert!(calculate_time_warp(q, zero).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert!(calculate_time_warp(zero, zero).abs_diff_eq(Mat4::IDENTITY, 1e-6));
        assert!(!calculate_time_warp(zero, zero).is_nan());
    }

    #[test]
    fn velocity_is_capped_at_three_frames() {
        assert_eq!(velocity_steps(100.0, 90), 3);
        assert_eq!(velocity_steps(100.0, 99), 1);
        assert_eq!(velocity_steps(100.0, 120), 0);

        let step = Mat4::from_rotation_y(0.1);
        let velocity = extrapolate_velocity(step, velocity_steps(500.0, 0));
        assert!(velocity.abs_diff_eq(Mat4::from_rotation_y(0.3), 1e-5));
        assert_eq!(extrapolate_velocity(step, 0), Mat4::IDENTITY);
    }

    #[test]
    fn static_layer_warp_is_tex_matrix() {
        let tex = tex_coords_from_fov(90.0, 90.0);
        let q = Quat::from_rotation_y(-1.1);
        assert!(layer_warp(tex, q, q, Mat4::IDENTITY).abs_diff_eq(tex, 1e-5));
    }

    #[test]
    fn fov_matrix_maps_center_and_edges() {
        let tex = tex_coords_from_fov(90.0, 90.0);
        let center = tex * Vec4::new(0.0, 0.0, -1.0, 1.0);
        assert!((center.truncate() - Vec3::new(0.5, 0.5, 1.0)).length() < 1e-6);
        let right_top = tex * Vec4::new(1.0, 1.0, -1.0, 1.0);
        assert!((right_top.x - 1.0).abs() < 1e-5);
        assert!(right_top.y.abs() < 1e-5);
    }
}
