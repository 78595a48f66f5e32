//! Scheduling templates for the warp pass
//!
//! A swap program fixes, relative to the base vsync of a tick, when each eye
//! starts drawing and which two scanout instants (leading and trailing edge
//! of the eye's half of the panel) the pose is predicted for.

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SwapProgram {
    pub name: &'static str,
    /// Rendering happens on the caller's thread.
    pub single_thread: bool,
    /// Both eyes scan out at once; otherwise the panel scans left to right.
    pub dual_mono_display: bool,
    /// Per eye, fraction of a vsync after the base at which drawing starts.
    pub delta_vsync: [f64; 2],
    /// Per eye, vsync offsets of the two scanout samples.
    pub prediction_points: [[f64; 2]; 2],
}

/// Warp thread on a swapped (double-buffered) surface. Eye 0 draws at the
/// base vsync and is shown one frame later; eye 1 draws half a frame later.
pub const ASYNC_SWAPPED_BUFFER_PORTRAIT: SwapProgram = SwapProgram {
    name: "async-swapped-buffer-portrait",
    single_thread: false,
    dual_mono_display: false,
    delta_vsync: [0.0, 0.5],
    prediction_points: [[1.0, 1.5], [1.5, 2.0]],
};

/// Caller's thread drawing straight into the scanned-out buffer.
pub const SYNC_FRONT_BUFFER_PORTRAIT: SwapProgram = SwapProgram {
    name: "sync-front-buffer-portrait",
    single_thread: true,
    dual_mono_display: false,
    delta_vsync: [0.5, 1.0],
    prediction_points: [[1.0, 1.5], [1.5, 2.0]],
};

/// Caller's thread on a swapped surface: everything lands a frame later.
pub const SYNC_SWAPPED_BUFFER_PORTRAIT: SwapProgram = SwapProgram {
    name: "sync-swapped-buffer-portrait",
    single_thread: true,
    dual_mono_display: false,
    delta_vsync: [0.0, 0.0],
    prediction_points: [[2.0, 2.5], [2.5, 3.0]],
};

pub const SWAP_PROGRAMS: [&SwapProgram; 3] = [
    &ASYNC_SWAPPED_BUFFER_PORTRAIT,
    &SYNC_FRONT_BUFFER_PORTRAIT,
    &SYNC_SWAPPED_BUFFER_PORTRAIT,
];

impl SwapProgram {
    pub fn by_name(name: &str) -> Option<&'static SwapProgram> {
        SWAP_PROGRAMS.iter().copied().find(|program| program.name == name)
    }

    /// Fractional vsyncs whose poses warp `eye` when the tick's base vsync
    /// is `vsync_base`.
    pub fn sample_vsyncs(&self, vsync_base: f64, eye: usize) -> [f64; 2] {
        let [leading, trailing] = self.prediction_points[eye];
        [vsync_base + leading, vsync_base + trailing]
    }

    /// Fractional vsync at which drawing `eye` should begin.
    pub fn draw_vsync(&self, vsync_base: f64, eye: usize) -> f64 {
        vsync_base + self.delta_vsync[eye]
    }
}
