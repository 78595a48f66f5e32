//! Frame hand-off between the submitting thread and the warp thread
//!
//! The submitting thread publishes each frame as an immutable [`Submission`]
//! into a three-deep history ring, then bumps the generation counter. The
//! warp thread reads the counter, walks back through the ring for the newest
//! frame whose GPU fence has signaled, and publishes what it picked as a
//! [`SwapState`]. Nothing on the warp thread's path blocks on a lock; the
//! only mutex guards the condition variable the submitting thread sleeps on.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use log::{info, warn};

use crate::backend::{FenceStatus, GpuFence, TextureHandle};
use crate::config::PresentOptions;
use crate::lockless::Lockless;
use crate::pose::PoseState;

pub const EYE_COUNT: usize = 2;
pub const MAX_LAYERS: usize = 3;
/// Submissions kept for the warp thread to fall back on.
pub const HISTORY_DEPTH: usize = 3;

/// Poses closer to zero than this were never filled in.
const MIN_POSE_LENGTH_SQ: f32 = 1e-18;

/// One layer of one eye, as rendered by the application.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeImage {
    pub texture: TextureHandle,
    /// Per-color-plane cube maps for the cube program.
    pub planar_textures: [TextureHandle; 3],
    pub tex_coords_from_tan_angles: Mat4,
    /// Head pose the image was rendered with.
    pub pose: PoseState,
}

impl Default for EyeImage {
    fn default() -> Self {
        Self {
            texture: TextureHandle::NONE,
            planar_textures: [TextureHandle::NONE; 3],
            tex_coords_from_tan_angles: Mat4::IDENTITY,
            pose: PoseState::IDENTITY,
        }
    }
}

pub type EyeImageSlots = [[EyeImage; MAX_LAYERS]; EYE_COUNT];

/// What the warp thread last displayed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SwapState {
    pub vsync_count: i64,
    pub eye_buffer_count: i64,
}

/// A submitted frame. Immutable once published, apart from the display
/// bookkeeping the warp thread fills in.
pub struct Submission {
    pub generation: i64,
    pub images: EyeImageSlots,
    /// Not displayable before this vsync.
    pub minimum_vsync: i64,
    pub options: PresentOptions,
    pub disable_chromatic: bool,
    fence: Box<dyn GpuFence>,
    first_displayed_vsync: [AtomicI64; EYE_COUNT],
}

impl Submission {
    pub fn new(
        generation: i64,
        images: EyeImageSlots,
        fence: Box<dyn GpuFence>,
        minimum_vsync: i64,
        options: PresentOptions,
        disable_chromatic: bool,
    ) -> Self {
        Self {
            generation,
            images,
            minimum_vsync,
            options,
            disable_chromatic,
            fence,
            first_displayed_vsync: [AtomicI64::new(0), AtomicI64::new(0)],
        }
    }

    pub fn poll_fence(&self, timeout: Duration) -> FenceStatus {
        self.fence.poll(timeout)
    }

    /// Vsync at which `eye` of this frame first went out, 0 if never.
    pub fn first_displayed_vsync(&self, eye: usize) -> i64 {
        self.first_displayed_vsync[eye].load(Ordering::Acquire)
    }

    pub(crate) fn note_displayed(&self, eye: usize, vsync: i64) {
        let _ = self.first_displayed_vsync[eye].compare_exchange(0, vsync, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("generation", &self.generation)
            .field("minimum_vsync", &self.minimum_vsync)
            .field("disable_chromatic", &self.disable_chromatic)
            .finish_non_exhaustive()
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarpThreadState {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    ShutdownRequested = 3,
    Stopped = 4,
}

impl WarpThreadState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => WarpThreadState::Starting,
            2 => WarpThreadState::Running,
            3 => WarpThreadState::ShutdownRequested,
            4 => WarpThreadState::Stopped,
            _ => WarpThreadState::Uninitialized,
        }
    }
}

/// Snapshot of warp activity.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WarpStats {
    pub ticks: u64,
    pub displayed_frames: u64,
    pub idle_ticks: u64,
    pub skipped_frames: u64,
    pub latest_generation: i64,
    pub swap_state: SwapState,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    displayed: AtomicU64,
    idle: AtomicU64,
    skipped: AtomicU64,
}

pub struct FrameExchange {
    history: [ArcSwapOption<Submission>; HISTORY_DEPTH],
    eye_buffer_count: Lockless<i64>,
    swap_state: Lockless<SwapState>,
    shutdown: Lockless<u32>,
    last_activity: Lockless<f64>,
    thread_state: AtomicU32,
    handoff: Mutex<()>,
    handoff_signal: Condvar,
    /// Why the warp thread died, for the submitting thread to report.
    fatal: Mutex<Option<String>>,
    counters: Counters,
}

fn slot(generation: i64) -> usize {
    generation.rem_euclid(HISTORY_DEPTH as i64) as usize
}

impl FrameExchange {
    pub fn new() -> Self {
        Self {
            history: [ArcSwapOption::new(None), ArcSwapOption::new(None), ArcSwapOption::new(None)],
            eye_buffer_count: Lockless::new(0),
            swap_state: Lockless::new(SwapState::default()),
            shutdown: Lockless::new(0),
            last_activity: Lockless::new(0.0),
            thread_state: AtomicU32::new(WarpThreadState::Uninitialized as u32),
            handoff: Mutex::new(()),
            handoff_signal: Condvar::new(),
            fatal: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Generation of the newest published submission, 0 before the first.
    pub fn latest_generation(&self) -> i64 {
        self.eye_buffer_count.state()
    }

    /// Drops the submission sharing a ring slot with `generation`, releasing
    /// its fence before a new one is made.
    pub fn retire(&self, generation: i64) {
        self.history[slot(generation)].store(None);
    }

    /// Makes `submission` visible to the warp thread. Producer thread only.
    pub fn publish(&self, submission: Submission) {
        let generation = submission.generation;
        debug_assert_eq!(generation, self.latest_generation() + 1);
        self.history[slot(generation)].store(Some(Arc::new(submission)));
        self.eye_buffer_count.set_state(generation);
    }

    /// The submission of `generation`, if still held.
    pub fn submission(&self, generation: i64) -> Option<Arc<Submission>> {
        if generation <= 0 {
            return None;
        }
        self.history[slot(generation)]
            .load_full()
            .filter(|submission| submission.generation == generation)
    }

    /// Newest submission that may be displayed on the tick whose base vsync
    /// is `vsync_base`, walking back at most [`HISTORY_DEPTH`] generations.
    pub fn select(&self, vsync_base: f64) -> Option<Arc<Submission>> {
        let latest = self.latest_generation();
        for back in 0..HISTORY_DEPTH as i64 {
            let generation = latest - back;
            if generation <= 0 {
                break;
            }
            let Some(candidate) = self.submission(generation) else {
                continue;
            };
            if candidate.minimum_vsync as f64 > vsync_base {
                continue;
            }
            if candidate.images[0][0].pose.orientation.length_squared() < MIN_POSE_LENGTH_SQ {
                info!("generation {} has no pose", generation);
                continue;
            }
            match candidate.poll_fence(Duration::ZERO) {
                FenceStatus::Signaled => {}
                FenceStatus::TimeoutExpired => continue,
                FenceStatus::Failed => warn!("fence poll failed for generation {}", generation),
            }
            return Some(candidate);
        }
        None
    }

    pub fn swap_state(&self) -> SwapState {
        self.swap_state.state()
    }

    /// Records the tick's vsync and displayed generation and wakes the
    /// submitting thread if it is waiting. Never blocks: when the submitting
    /// thread holds the lock the wakeup is dropped, and the waiter sees the
    /// new state at its next `recheck` timeout instead.
    pub fn publish_swap(&self, vsync_count: i64, eye_buffer_count: i64) {
        let previous = self.swap_state.state();
        self.swap_state.set_state(SwapState {
            vsync_count: vsync_count.max(previous.vsync_count),
            eye_buffer_count: eye_buffer_count.max(previous.eye_buffer_count),
        });
        if let Ok(_guard) = self.handoff.try_lock() {
            self.handoff_signal.notify_all();
        }
    }

    /// Sleeps until `ready` accepts the swap state. Each wait is bounded by
    /// `recheck`, and the wait ends early if the warp thread stops running.
    pub fn wait_for_swap(&self, recheck: Duration, ready: impl Fn(SwapState) -> bool) -> SwapState {
        let mut guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let state = self.swap_state.state();
            if ready(state) || self.thread_state() != WarpThreadState::Running {
                return state;
            }
            guard = self
                .handoff_signal
                .wait_timeout(guard, recheck)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.set_state(1);
    }

    pub fn clear_shutdown(&self) {
        self.shutdown.set_state(0);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.state() != 0
    }

    pub fn note_activity(&self, time_in_seconds: f64) {
        self.last_activity.set_state(time_in_seconds);
    }

    /// Time of the last frame submission.
    pub fn last_activity(&self) -> f64 {
        self.last_activity.state()
    }

    /// Keeps the first unrecoverable error hit on the warp thread.
    pub(crate) fn report_fatal(&self, reason: String) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        fatal.get_or_insert(reason);
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn thread_state(&self) -> WarpThreadState {
        WarpThreadState::from_raw(self.thread_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_thread_state(&self, state: WarpThreadState) {
        let _guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        self.thread_state.store(state as u32, Ordering::Release);
        self.handoff_signal.notify_all();
    }

    /// Blocks until a starting warp thread reports running or stopped.
    pub(crate) fn wait_for_thread_start(&self, recheck: Duration) -> WarpThreadState {
        let mut guard = self.handoff.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match self.thread_state() {
                WarpThreadState::Starting => {}
                state => return state,
            }
            guard = self
                .handoff_signal
                .wait_timeout(guard, recheck)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn count_tick(&self, displayed: bool, skipped: bool) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let counter = match (displayed, skipped) {
            (true, _) => &self.counters.displayed,
            (false, true) => &self.counters.skipped,
            (false, false) => &self.counters.idle,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> WarpStats {
        WarpStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            displayed_frames: self.counters.displayed.load(Ordering::Relaxed),
            idle_ticks: self.counters.idle.load(Ordering::Relaxed),
            skipped_frames: self.counters.skipped.load(Ordering::Relaxed),
            latest_generation: self.latest_generation(),
            swap_state: self.swap_state(),
        }
    }
}

impl Default for FrameExchange {
    fn default() -> Self {
        Self::new()
    }
}
