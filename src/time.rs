//! Process clock and vsync estimate
//!
//! All engine times are seconds (or nanoseconds) since a process-wide epoch.
//! The vsync estimate is fed by the platform's frame callback when one is
//! available and free-runs at the nominal period otherwise.

use std::thread;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use lazy_static::lazy_static;
use log::debug;

use crate::lockless::Lockless;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// 60 Hz panel.
pub const DEFAULT_VSYNC_PERIOD_NANO: i64 = 16_666_667;

/// Tail of a `sleep_until` spent in `yield_now` instead of `sleep`.
const YIELD_WINDOW_SECONDS: f64 = 0.0005;

/// Seconds since the process epoch.
pub fn time_in_seconds() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Nanoseconds since the process epoch.
pub fn time_in_nanos() -> i64 {
    EPOCH.elapsed().as_nanos() as i64
}

/// Converts an [`Instant`] into epoch nanoseconds.
pub fn instant_to_nanos(instant: Instant) -> i64 {
    instant.saturating_duration_since(*EPOCH).as_nanos() as i64
}

/// Last observed vsync: `vsync_count` happened at `vsync_base_nano`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct VsyncState {
    pub vsync_count: i64,
    pub vsync_base_nano: i64,
    pub vsync_period_nano: i64,
}

pub struct VsyncTimer {
    state: Lockless<VsyncState>,
}

impl VsyncTimer {
    pub fn new(period_nano: i64) -> Self {
        Self {
            state: Lockless::new(VsyncState {
                vsync_count: 0,
                vsync_base_nano: time_in_nanos(),
                vsync_period_nano: period_nano.max(1),
            }),
        }
    }

    /// Records a platform vsync timestamp (epoch nanoseconds). Call from the
    /// single thread that receives the display's frame callbacks.
    ///
    /// The count advances by the number of whole periods since the previous
    /// record, so a dropped callback does not lose vsyncs.
    pub fn record_vsync(&self, frame_time_nano: i64) {
        let previous = self.state.state();
        let elapsed = frame_time_nano - previous.vsync_base_nano;
        let advanced = (elapsed as f64 / previous.vsync_period_nano as f64).round() as i64;
        if advanced <= 0 {
            return;
        }
        self.state.set_state(VsyncState {
            vsync_count: previous.vsync_count + advanced,
            vsync_base_nano: frame_time_nano,
            vsync_period_nano: previous.vsync_period_nano,
        });
    }

    /// Changes the refresh period, keeping the current vsync count.
    pub fn set_period(&self, period_nano: i64) {
        let previous = self.state.state();
        let now = time_in_nanos();
        let count = previous.vsync_count
            + (now - previous.vsync_base_nano) / previous.vsync_period_nano;
        debug!("vsync period {} -> {} ns", previous.vsync_period_nano, period_nano);
        self.state.set_state(VsyncState {
            vsync_count: count,
            vsync_base_nano: now,
            vsync_period_nano: period_nano.max(1),
        });
    }

    pub fn state(&self) -> VsyncState {
        self.state.state()
    }

    pub fn period_seconds(&self) -> f64 {
        self.state.state().vsync_period_nano as f64 * 1e-9
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.state.state().vsync_period_nano as u64)
    }

    /// Current position on the vsync timeline, e.g. `1041.37`.
    pub fn fractional_vsync(&self) -> f64 {
        let state = self.state.state();
        let elapsed = time_in_nanos() - state.vsync_base_nano;
        state.vsync_count as f64 + elapsed as f64 / state.vsync_period_nano as f64
    }

    /// Absolute time in seconds of a (fractional) vsync.
    pub fn frame_point_time(&self, vsync: f64) -> f64 {
        let state = self.state.state();
        (state.vsync_base_nano as f64
            + (vsync - state.vsync_count as f64) * state.vsync_period_nano as f64)
            * 1e-9
    }

    /// Sleeps until `time_seconds`; returns how long it slept. The final
    /// sub-millisecond is spent yielding rather than sleeping.
    pub fn sleep_until(&self, time_seconds: f64) -> f64 {
        let start = time_in_seconds();
        let remaining = time_seconds - start;
        if remaining <= 0.0 {
            return 0.0;
        }
        if remaining > YIELD_WINDOW_SECONDS {
            thread::sleep(Duration::from_secs_f64(remaining - YIELD_WINDOW_SECONDS));
        }
        while time_in_seconds() < time_seconds {
            thread::yield_now();
        }
        time_in_seconds() - start
    }
}

impl Default for VsyncTimer {
    fn default() -> Self {
        Self::new(DEFAULT_VSYNC_PERIOD_NANO)
    }
}
