//! Hook for a photodiode latency tester
//!
//! The tester asks for a solid color to be drawn; the time until its sensor
//! sees that color is the motion-to-photon latency.

pub trait LatencyTester: Send {
    /// Color (0-255 RGB) to clear the eye to this frame, if a measurement
    /// is in progress.
    fn display_color(&mut self) -> Option<[u8; 3]>;

    /// Human-readable result of a finished measurement.
    fn take_results(&mut self) -> Option<String>;
}

pub(crate) fn color_to_rgba([r, g, b]: [u8; 3]) -> [f32; 4] {
    [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, 1.0]
}
