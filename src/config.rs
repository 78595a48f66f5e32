//! Engine configuration and per-frame options

use glam::Mat4;

use crate::program::ProgramSelection;
use crate::sensors::DEFAULT_MAX_PREDICTION_SECONDS;

/// Settings fixed when the smoother is created.
#[derive(Clone, Debug, PartialEq)]
pub struct WarpConfig {
    /// Start with the dedicated warp thread running.
    pub async_mode: bool,
    /// Screen slices per eye for sliced warping.
    pub slices_per_eye: u32,
    /// Scales lens tangent angles; 1.0 for the nominal lens.
    pub fov_scale: f32,
    /// Radial distortion coefficients (r^2 and r^4 terms).
    pub distortion_k1: f32,
    pub distortion_k2: f32,
    /// Distortion mesh cells per eye along each axis.
    pub mesh_tesselation: u32,
    /// Renderer names (substring match) on which chromatic correction is off.
    pub chromatic_blacklist: Vec<String>,
    pub max_prediction_seconds: f64,
    /// Ask the backend for a high-priority context on the warp thread.
    pub request_high_priority: bool,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            async_mode: false,
            slices_per_eye: 4,
            fov_scale: 1.0,
            distortion_k1: 0.25,
            distortion_k2: 0.15,
            mesh_tesselation: 32,
            chromatic_blacklist: vec!["Mali-T760".to_string()],
            max_prediction_seconds: DEFAULT_MAX_PREDICTION_SECONDS,
            request_high_priority: true,
        }
    }
}

impl WarpConfig {
    pub fn chromatic_disabled_for(&self, renderer_name: &str) -> bool {
        self.chromatic_blacklist
            .iter()
            .any(|gpu| !gpu.is_empty() && renderer_name.contains(gpu.as_str()))
    }
}

/// Options travelling with one submitted frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PresentOptions {
    /// 1 = every vsync, 2 = every other vsync.
    pub minimum_vsyncs: u32,
    /// Block until this frame is on screen and drain extra vsyncs.
    pub flush: bool,
    pub use_sliced_warp: bool,
    pub show_cursor: bool,
    pub draw_calibration_lines: bool,
    /// Overlay layer is head-locked and not warped.
    pub fixed_overlay: bool,
    /// No sRGB conversion on framebuffer writes or texture sampling.
    pub inhibit_srgb: bool,
    /// Black eye image and loading icon for empty layers 0 and 1.
    pub default_images: bool,
    pub program: ProgramSelection,
    /// `[0]` uniform color and loading icon spin rate, `[1]` icon scale.
    pub program_params: [f32; 4],
    /// Per-frame head motion compounded over late frames.
    pub external_velocity: Mat4,
}

impl Default for PresentOptions {
    fn default() -> Self {
        Self {
            minimum_vsyncs: 1,
            flush: false,
            use_sliced_warp: false,
            show_cursor: false,
            draw_calibration_lines: false,
            fixed_overlay: false,
            inhibit_srgb: false,
            default_images: false,
            program: ProgramSelection::default(),
            program_params: [1.0, 1.0, 0.0, 0.0],
            external_velocity: Mat4::IDENTITY,
        }
    }
}
