//! VR Warp - frame smoothing and time warp for head-mounted displays
//!
//! The application renders eye images at its own pace and hands them to a
//! [`FrameSmoother`]. At every display refresh the smoother re-projects the
//! newest finished eye images with the latest predicted head pose, corrects
//! lens distortion, and presents the result. Presentation runs either on a
//! dedicated warp thread (async mode) or inline on the submitting thread.

pub mod backend;
pub mod config;
pub mod display;
pub mod error;
pub mod exchange;
pub mod latency;
pub mod lockless;
pub mod mesh;
pub mod pose;
pub mod program;
pub mod renderer;
pub mod sensors;
pub mod smoother;
pub mod swap_program;
pub mod time;
pub mod warp_matrix;
pub mod warp_thread;

pub use backend::{FenceSource, FenceStatus, GpuFence, TextureHandle, TextureTarget, WarpBackend};
pub use config::{PresentOptions, WarpConfig};
pub use error::{WarpError, WarpResult};
pub use exchange::{EyeImage, SwapState, WarpStats, WarpThreadState, EYE_COUNT, MAX_LAYERS};
pub use latency::LatencyTester;
pub use pose::{FixedPose, PosePredictor, PoseState};
pub use program::{ProgramKind, ProgramSelection};
pub use renderer::{TextureRegistry, WgpuBackend};
pub use sensors::HeadTracker;
pub use smoother::FrameSmoother;
pub use time::VsyncTimer;

/// Routes `log` output to logcat on Android and to `env_logger` elsewhere.
/// Safe to call more than once.
pub fn init_logging() {
    #[cfg(target_os = "android")]
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(log::LevelFilter::Info)
            .with_tag("VrWarp"),
    );

    #[cfg(not(target_os = "android"))]
    {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
    }
}
