//! Lens distortion meshes
//!
//! Each vertex carries its screen position, the lens-space tangent angles
//! seen through that point for the red, green and blue channels, and the
//! fraction of the way through the slice's scanout at which the vertex is
//! lit. Eye 0 covers the left half of the screen, eye 1 the right half.
//!
//! Indices are laid out eye by eye and, within an eye, slice by slice, so a
//! draw of one eye or one screen slice is a single contiguous index range.

use std::ops::Range;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::config::WarpConfig;
use crate::error::{WarpError, WarpResult};

/// Lateral color: red focuses slightly inside green, blue slightly outside.
const RED_SCALE: f32 = 0.996;
const BLUE_SCALE: f32 = 1.014;

/// Half-size of the cursor patch, in eye-relative units.
const CURSOR_HALF_EXTENT: f32 = 0.025;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct WarpVertex {
    pub position: [f32; 2],
    pub red: [f32; 2],
    pub green: [f32; 2],
    pub blue: [f32; 2],
    /// x: scanout fraction (0 leading edge, 1 trailing), y: intensity.
    pub warp: [f32; 2],
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeshParams {
    pub fov_scale: f32,
    pub k1: f32,
    pub k2: f32,
    pub tesselation: u32,
}

impl From<&WarpConfig> for MeshParams {
    fn from(config: &WarpConfig) -> Self {
        Self {
            fov_scale: config.fov_scale,
            k1: config.distortion_k1,
            k2: config.distortion_k2,
            tesselation: config.mesh_tesselation,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DistortionMesh {
    pub vertices: Vec<WarpVertex>,
    pub indices: Vec<u16>,
    pub slices_per_eye: u32,
}

impl DistortionMesh {
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// Index range of one eye or one screen slice in a mesh of `index_count`
/// indices split into `parts` equal parts.
pub fn part_range(index_count: u32, parts: u32, part: u32) -> Range<u32> {
    let per_part = index_count / parts.max(1);
    per_part * part..per_part * (part + 1)
}

fn radial(params: &MeshParams, lens: Vec2) -> Vec2 {
    let r2 = lens.length_squared();
    lens * (1.0 + params.k1 * r2 + params.k2 * r2 * r2) * params.fov_scale
}

/// Builds the warp mesh with `slices_per_eye` slices per eye. A cursor mesh
/// covers only a small patch in the middle of each eye and has no lateral
/// color.
pub fn build_distortion_mesh(params: &MeshParams, slices_per_eye: u32, cursor: bool) -> WarpResult<DistortionMesh> {
    if slices_per_eye == 0 || params.tesselation == 0 {
        return Err(WarpError::mesh(format!(
            "tesselation {} and slice count {} must be non-zero",
            params.tesselation, slices_per_eye
        )));
    }

    let rows = params.tesselation;
    let columns = params.tesselation.div_ceil(slices_per_eye);
    let eye_columns = columns * slices_per_eye;
    let vertex_count = 2 * slices_per_eye * (columns + 1) * (rows + 1);
    if vertex_count > u32::from(u16::MAX) + 1 {
        return Err(WarpError::mesh(format!(
            "{} vertices exceed 16-bit indices",
            vertex_count
        )));
    }

    let (low, high) = if cursor {
        (0.5 - CURSOR_HALF_EXTENT, 0.5 + CURSOR_HALF_EXTENT)
    } else {
        (0.0, 1.0)
    };

    let mut vertices = Vec::with_capacity(vertex_count as usize);
    let mut indices = Vec::with_capacity((2 * slices_per_eye * columns * rows * 6) as usize);

    for eye in 0..2u32 {
        for slice in 0..slices_per_eye {
            let base = vertices.len() as u32;

            for row in 0..=rows {
                for column in 0..=columns {
                    let u = low + (high - low) * (slice * columns + column) as f32 / eye_columns as f32;
                    let v = low + (high - low) * row as f32 / rows as f32;
                    let lens = Vec2::new(u * 2.0 - 1.0, v * 2.0 - 1.0);
                    let green = radial(params, lens);
                    let (red, blue) = if cursor {
                        (green, green)
                    } else {
                        (green * RED_SCALE, green * BLUE_SCALE)
                    };

                    vertices.push(WarpVertex {
                        position: [eye as f32 - 1.0 + u, v * 2.0 - 1.0],
                        red: red.to_array(),
                        green: green.to_array(),
                        blue: blue.to_array(),
                        warp: [column as f32 / columns as f32, 1.0],
                    });
                }
            }

            let stride = columns + 1;
            for row in 0..rows {
                for column in 0..columns {
                    let a = base + row * stride + column;
                    let b = a + 1;
                    let c = a + stride;
                    let d = c + 1;
                    indices.extend([a, b, d, a, d, c].map(|i| i as u16));
                }
            }
        }
    }

    Ok(DistortionMesh {
        vertices,
        indices,
        slices_per_eye,
    })
}

/// Line list, in eye-local normalized coordinates, of the calibration
/// pattern: a centered cross and a box at half extent.
pub fn calibration_lines() -> Vec<[f32; 2]> {
    let h = 0.5;
    vec![
        [-1.0, 0.0], [1.0, 0.0],
        [0.0, -1.0], [0.0, 1.0],
        [-h, -h], [h, -h],
        [h, -h], [h, h],
        [h, h], [-h, h],
        [-h, h], [-h, -h],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MeshParams {
        MeshParams::from(&WarpConfig::default())
    }

    #[test]
    fn eyes_occupy_their_screen_halves() {
        let mesh = build_distortion_mesh(&params(), 1, false).unwrap();
        for eye in 0..2 {
            for i in part_range(mesh.index_count(), 2, eye) {
                let x = mesh.vertices[mesh.indices[i as usize] as usize].position[0];
                let (lo, hi) = (eye as f32 - 1.0, eye as f32);
                assert!(x >= lo - 1e-6 && x <= hi + 1e-6, "eye {eye} x {x}");
            }
        }
    }

    #[test]
    fn slices_are_contiguous_strips() {
        let slices = 4;
        let mesh = build_distortion_mesh(&params(), slices, false).unwrap();
        let screen_slices = 2 * slices;
        assert_eq!(mesh.index_count() % screen_slices, 0);
        let width = 2.0 / screen_slices as f32;
        for slice in 0..screen_slices {
            let lo = -1.0 + width * slice as f32;
            for i in part_range(mesh.index_count(), screen_slices, slice) {
                let x = mesh.vertices[mesh.indices[i as usize] as usize].position[0];
                assert!(x >= lo - 1e-5 && x <= lo + width + 1e-5, "slice {slice} x {x}");
            }
        }
    }

    #[test]
    fn lateral_color_orders_channels() {
        let mesh = build_distortion_mesh(&params(), 1, false).unwrap();
        let corner = mesh.vertices[0];
        assert!(corner.red[0].abs() < corner.green[0].abs());
        assert!(corner.green[0].abs() < corner.blue[0].abs());

        let cursor = build_distortion_mesh(&params(), 1, true).unwrap();
        assert!(cursor.vertices.iter().all(|v| v.red == v.green && v.blue == v.green));
        assert!(cursor.vertices.iter().all(|v| v.green[0].abs() < 0.1));
    }

    #[test]
    fn rejects_meshes_beyond_16_bit_indices() {
        let huge = MeshParams { tesselation: 400, ..params() };
        assert!(matches!(build_distortion_mesh(&huge, 1, false), Err(WarpError::Mesh(_))));
        assert!(build_distortion_mesh(&params(), 0, false).is_err());
    }

    #[test]
    fn calibration_pattern_is_a_line_list() {
        assert_eq!(calibration_lines().len() % 2, 0);
    }
}
