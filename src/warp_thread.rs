//! Dedicated warp thread
//!
//! The thread owns the renderer for as long as it runs and hands it back
//! through its join handle. Each iteration waits for the next vsync, checks
//! for shutdown, and warps whatever the submitting thread has finished.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::backend::{ContextPriority, WarpBackend};
use crate::display::WarpRenderer;
use crate::error::{WarpError, WarpResult};
use crate::exchange::{FrameExchange, WarpThreadState};
use crate::swap_program::ASYNC_SWAPPED_BUFFER_PORTRAIT;
use crate::time::{time_in_seconds, VsyncTimer};

pub const WARP_THREAD_NAME: &str = "vr_warp::smooth";

/// Without a submission for this long the application counts as stalled.
const STALL_SECONDS: f64 = 1.0;
/// A submission this recent ends a stall.
const RESUME_SECONDS: f64 = 0.1;
/// Resync when the loop drifts this many vsyncs from the timer.
const MAX_VSYNC_DRIFT: f64 = 2.0;
/// Re-check interval while waiting on the thread to start.
pub(crate) const START_RECHECK: Duration = Duration::from_millis(10);

/// What the thread hands back when it exits.
pub struct WarpThreadExit<B: WarpBackend> {
    pub renderer: WarpRenderer<B>,
    pub error: Option<WarpError>,
}

pub fn spawn<B: WarpBackend>(
    renderer: WarpRenderer<B>,
    exchange: Arc<FrameExchange>,
    vsync: Arc<VsyncTimer>,
    priority: ContextPriority,
) -> WarpResult<JoinHandle<WarpThreadExit<B>>> {
    thread::Builder::new()
        .name(WARP_THREAD_NAME.to_string())
        .spawn(move || run(renderer, exchange, vsync, priority))
        .map_err(|e| WarpError::thread(format!("failed to spawn warp thread: {e}")))
}

fn run<B: WarpBackend>(
    mut renderer: WarpRenderer<B>,
    exchange: Arc<FrameExchange>,
    vsync: Arc<VsyncTimer>,
    priority: ContextPriority,
) -> WarpThreadExit<B> {
    raise_thread_priority();

    match renderer.backend_mut().enter_warp_thread(priority) {
        Ok(granted) if granted < priority => {
            info!("Warp context priority {:?} requested, {:?} granted", priority, granted);
        }
        Ok(_) => {}
        Err(err) => {
            error!("Warp thread could not take the GPU context: {}", err);
            exchange.set_thread_state(WarpThreadState::Stopped);
            return WarpThreadExit {
                renderer,
                error: Some(err),
            };
        }
    }

    exchange.set_thread_state(WarpThreadState::Running);
    let _stopped = MarkStopped(&exchange);
    info!("Warp thread running");

    warp_loop(&mut renderer, &exchange, &vsync);

    let error = renderer.backend_mut().leave_warp_thread().err();
    if let Some(err) = &error {
        warn!("Warp thread could not release the GPU context: {}", err);
    }
    info!("Warp thread stopped");

    WarpThreadExit { renderer, error }
}

/// Reports the thread stopped on every exit path, unwinding included, so a
/// submitter waiting on the swap state is released.
struct MarkStopped<'a>(&'a FrameExchange);

impl Drop for MarkStopped<'_> {
    fn drop(&mut self) {
        self.0.set_thread_state(WarpThreadState::Stopped);
    }
}

fn warp_loop<B: WarpBackend>(renderer: &mut WarpRenderer<B>, exchange: &FrameExchange, vsync: &VsyncTimer) {
    let mut vsync_count = vsync.fractional_vsync().ceil();
    let mut stalled = false;

    loop {
        let current = vsync.fractional_vsync().ceil();
        if (current - vsync_count).abs() > MAX_VSYNC_DRIFT {
            info!("Warp vsync resync {} -> {}", vsync_count, current);
            vsync_count = current;
        }

        if exchange.shutdown_requested() {
            info!("Warp thread shutdown requested");
            break;
        }

        let now = time_in_seconds();
        let last_activity = exchange.last_activity();
        if stalled {
            if last_activity > now - RESUME_SECONDS {
                info!("Application resumed submitting frames");
                stalled = false;
            }
        } else if last_activity < now - STALL_SECONDS {
            info!("No frames submitted for {:.1} s, coasting", now - last_activity);
            stalled = true;
        }

        vsync.sleep_until(vsync.frame_point_time(vsync_count));
        renderer.render_to_display(exchange, vsync_count, &ASYNC_SWAPPED_BUFFER_PORTRAIT);
        vsync_count += 1.0;
    }
}

#[cfg(unix)]
fn raise_thread_priority() {
    // Per-thread on Linux and Android: PRIO_PROCESS with id 0 is the caller.
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -19) };
    if result != 0 {
        info!(
            "Warp thread keeps default priority: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn raise_thread_priority() {
    info!("Warp thread priority is not adjustable on this platform");
}
