//! Frame submission API
//!
//! The application renders each eye into its own texture, describes the
//! result with [`FrameSmoother::submit_eye_texture`] and
//! [`FrameSmoother::submit_eye_pose`], then calls
//! [`FrameSmoother::present_frame`]. In synchronous mode the warp pass runs
//! right there on the caller's thread. In asynchronous mode a dedicated warp
//! thread re-warps the newest finished frame on every vsync, and
//! `present_frame` only publishes the frame and paces the caller.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use glam::Mat4;
use log::{debug, error, info, warn};

use crate::backend::{ContextPriority, FenceSource, TextureHandle, WarpBackend};
use crate::config::{PresentOptions, WarpConfig};
use crate::display::{DefaultTextures, WarpRenderer};
use crate::error::{WarpError, WarpResult};
use crate::exchange::{
    EyeImage, EyeImageSlots, FrameExchange, Submission, SwapState, WarpStats, WarpThreadState, EYE_COUNT, MAX_LAYERS,
};
use crate::latency::LatencyTester;
use crate::pose::{PosePredictor, PoseState};
use crate::swap_program::SYNC_SWAPPED_BUFFER_PORTRAIT;
use crate::time::{time_in_seconds, VsyncTimer};
use crate::warp_thread::{self, WarpThreadExit, START_RECHECK};

/// Synchronous renders per flushed frame.
const FLUSH_RENDER_COUNT: u32 = 3;

/// `present_frame` never returns sooner than this after it started waiting.
const MIN_PRESENT_WAIT: Duration = Duration::from_millis(1);

pub struct FrameSmoother<B: WarpBackend> {
    config: WarpConfig,
    exchange: Arc<FrameExchange>,
    vsync: Arc<VsyncTimer>,
    fences: Arc<dyn FenceSource>,
    /// Present while synchronous; owned by the warp thread otherwise.
    renderer: Option<WarpRenderer<B>>,
    warp_thread: Option<JoinHandle<WarpThreadExit<B>>>,
    images: EyeImageSlots,
    defaults: DefaultTextures,
    disable_chromatic: bool,
    owner: ThreadId,
    last_swap_vsync_count: i64,
}

impl<B: WarpBackend> FrameSmoother<B> {
    /// Builds the warp renderer on `backend`. The calling thread becomes the
    /// only thread allowed to present frames.
    pub fn new(
        backend: B,
        config: WarpConfig,
        predictor: Arc<dyn PosePredictor>,
        vsync: Arc<VsyncTimer>,
    ) -> WarpResult<Self> {
        let renderer_name = backend.renderer_name();
        let disable_chromatic = config.chromatic_disabled_for(&renderer_name);
        if disable_chromatic {
            info!("Chromatic correction disabled on {}", renderer_name);
        }

        let fences = backend.fence_source();
        let renderer = WarpRenderer::new(backend, &config, predictor, Arc::clone(&vsync))?;
        let defaults = renderer.default_textures();

        let mut smoother = Self {
            config,
            exchange: Arc::new(FrameExchange::new()),
            vsync,
            fences,
            renderer: Some(renderer),
            warp_thread: None,
            images: Default::default(),
            defaults,
            disable_chromatic,
            owner: thread::current().id(),
            last_swap_vsync_count: 0,
        };

        if smoother.config.async_mode {
            smoother.request_async_mode(true)?;
        }
        Ok(smoother)
    }

    fn slot(&mut self, eye: usize, layer: usize) -> &mut EyeImage {
        assert!(
            eye < EYE_COUNT && layer < MAX_LAYERS,
            "eye {eye} layer {layer} out of range"
        );
        &mut self.images[eye][layer]
    }

    /// Sets the texture of a layer for the next frame. `TextureHandle::NONE`
    /// leaves the layer empty.
    pub fn submit_eye_texture(&mut self, eye: usize, layer: usize, texture: TextureHandle) {
        self.slot(eye, layer).texture = texture;
    }

    /// Per-color-plane cube maps for the cube program.
    pub fn submit_planar_textures(&mut self, eye: usize, layer: usize, planes: [TextureHandle; 3]) {
        self.slot(eye, layer).planar_textures = planes;
    }

    /// Sets how a layer maps tangent angles to texture coordinates and the
    /// head pose it was rendered with. Both are always written together.
    pub fn submit_eye_pose(&mut self, eye: usize, layer: usize, tex_coords_from_tan_angles: Mat4, pose: PoseState) {
        let image = self.slot(eye, layer);
        image.tex_coords_from_tan_angles = tex_coords_from_tan_angles;
        image.pose = pose;
    }

    pub fn submit_eye_image(&mut self, eye: usize, layer: usize, image: EyeImage) {
        *self.slot(eye, layer) = image;
    }

    /// Empties every layer of both eyes.
    pub fn clear_eye_images(&mut self) {
        self.images = Default::default();
    }

    /// Publishes the submitted layers as a new frame and either warps it
    /// right away (synchronous) or waits until the warp thread is ready for
    /// the next one (asynchronous).
    ///
    /// # Panics
    ///
    /// When called from a thread other than the one that created the
    /// smoother, when the GPU refuses to create a fence, or when the warp
    /// thread has died on an unrecoverable GPU error.
    pub fn present_frame(&mut self, options: &PresentOptions) {
        let caller = thread::current().id();
        if caller != self.owner {
            error!("present_frame called from {:?} instead of {:?}", caller, self.owner);
            panic!("present_frame called from {caller:?} instead of {:?}", self.owner);
        }

        self.ensure_warp_thread_alive();
        self.exchange.note_activity(time_in_seconds());

        let previous_generation = self.exchange.latest_generation();
        let generation = previous_generation + 1;
        let minimum_vsync = self.last_swap_vsync_count + 2 * i64::from(options.minimum_vsyncs);
        let images = self.frame_images(options);

        self.exchange.retire(generation);
        let fence = match self.fences.create_fence() {
            Ok(fence) => fence,
            Err(err) => {
                error!("Frame fence creation failed: {}", err);
                panic!("frame fence creation failed: {err}");
            }
        };
        self.exchange.publish(Submission::new(
            generation,
            images,
            fence,
            minimum_vsync,
            *options,
            self.disable_chromatic,
        ));

        if self.warp_thread.is_some() {
            self.wait_for_warp(options, previous_generation, generation);
            self.ensure_warp_thread_alive();
        } else {
            self.warp_on_caller(options);
        }
    }

    /// Re-raises a warp thread failure on the submitting thread. Only
    /// `stop_warp_thread` stops a healthy thread, and it clears
    /// `warp_thread` first.
    fn ensure_warp_thread_alive(&self) {
        if self.warp_thread.is_none() || self.exchange.thread_state() != WarpThreadState::Stopped {
            return;
        }
        let reason = self
            .exchange
            .fatal_error()
            .unwrap_or_else(|| "warp thread exited unexpectedly".to_string());
        error!("Warp thread is gone: {}", reason);
        panic!("warp thread is gone: {reason}");
    }

    fn frame_images(&self, options: &PresentOptions) -> EyeImageSlots {
        let mut images = self.images;
        if options.default_images {
            for eye in images.iter_mut() {
                if eye[0].texture.is_none() {
                    eye[0].texture = self.defaults.black;
                }
                if eye[1].texture.is_none() {
                    eye[1].texture = self.defaults.loading_icon;
                }
            }
        }
        images
    }

    fn warp_on_caller(&mut self, options: &PresentOptions) {
        let Some(renderer) = self.renderer.as_mut() else {
            error!("present_frame without a renderer; the warp thread was lost");
            panic!("present_frame without a renderer");
        };

        renderer.backend_mut().finish();
        let renders = if options.flush { FLUSH_RENDER_COUNT } else { 1 };
        for _ in 0..renders {
            let vsync_base = self.vsync.fractional_vsync().floor();
            renderer.render_to_display(&self.exchange, vsync_base, &SYNC_SWAPPED_BUFFER_PORTRAIT);
        }
        self.last_swap_vsync_count = self.exchange.swap_state().vsync_count;
    }

    /// Blocks until the warp thread has taken the previous frame (or, when
    /// flushing, this one) on a tick after the call began.
    fn wait_for_warp(&mut self, options: &PresentOptions, previous_generation: i64, generation: i64) {
        let target = if options.flush { generation } else { previous_generation };
        let start_vsync = self.exchange.swap_state().vsync_count;
        let started = Instant::now();

        let state = self.exchange.wait_for_swap(self.vsync.period(), |state| {
            state.eye_buffer_count >= target && state.vsync_count > start_vsync
        });

        self.last_swap_vsync_count = state
            .vsync_count
            .max(self.last_swap_vsync_count + i64::from(options.minimum_vsyncs));

        let waited = started.elapsed();
        if waited < MIN_PRESENT_WAIT {
            let residual = MIN_PRESENT_WAIT - waited;
            debug!("present_frame sleeping {:?}", residual);
            thread::sleep(residual);
        }
    }

    /// Starts or stops the warp thread. Starting blocks until the thread has
    /// taken the GPU context; stopping joins it and resumes synchronous
    /// warping of the most recent frame.
    pub fn request_async_mode(&mut self, enable: bool) -> WarpResult<()> {
        match (enable, self.warp_thread.is_some()) {
            (true, false) => self.start_warp_thread(),
            (false, true) => self.stop_warp_thread(),
            _ => Ok(()),
        }
    }

    pub fn is_async(&self) -> bool {
        self.warp_thread.is_some()
    }

    fn start_warp_thread(&mut self) -> WarpResult<()> {
        let renderer = self
            .renderer
            .take()
            .ok_or_else(|| WarpError::thread("no renderer to hand to the warp thread"))?;
        let priority = if self.config.request_high_priority {
            ContextPriority::High
        } else {
            ContextPriority::Medium
        };

        self.exchange.clear_shutdown();
        self.exchange.set_thread_state(WarpThreadState::Starting);
        let handle = match warp_thread::spawn(renderer, Arc::clone(&self.exchange), Arc::clone(&self.vsync), priority) {
            Ok(handle) => handle,
            Err(err) => {
                self.exchange.set_thread_state(WarpThreadState::Stopped);
                return Err(err);
            }
        };

        match self.exchange.wait_for_thread_start(START_RECHECK) {
            WarpThreadState::Running => {
                info!("Asynchronous warping started");
                self.warp_thread = Some(handle);
                Ok(())
            }
            state => {
                warn!("Warp thread failed to start ({:?})", state);
                let exit = handle
                    .join()
                    .map_err(|_| WarpError::thread("warp thread panicked while starting"))?;
                self.renderer = Some(exit.renderer);
                Err(exit
                    .error
                    .unwrap_or_else(|| WarpError::thread("warp thread exited while starting")))
            }
        }
    }

    fn stop_warp_thread(&mut self) -> WarpResult<()> {
        let Some(handle) = self.warp_thread.take() else {
            return Ok(());
        };

        self.exchange.set_thread_state(WarpThreadState::ShutdownRequested);
        self.exchange.request_shutdown();
        let exit = handle.join().map_err(|_| {
            error!("Warp thread panicked");
            WarpError::thread("warp thread panicked")
        })?;
        info!("Asynchronous warping stopped");

        let mut renderer = exit.renderer;
        if self.exchange.latest_generation() > 0 {
            let vsync_base = self.vsync.fractional_vsync().floor();
            renderer.render_to_display(&self.exchange, vsync_base, &SYNC_SWAPPED_BUFFER_PORTRAIT);
            self.last_swap_vsync_count = self.exchange.swap_state().vsync_count;
        }
        self.renderer = Some(renderer);

        match exit.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn set_latency_tester(&mut self, tester: Option<Box<dyn LatencyTester>>) -> WarpResult<()> {
        match self.renderer.as_mut() {
            Some(renderer) => {
                renderer.set_latency_tester(tester);
                Ok(())
            }
            None => Err(WarpError::thread("latency tester can only be changed while synchronous")),
        }
    }

    pub fn swap_state(&self) -> SwapState {
        self.exchange.swap_state()
    }

    pub fn stats(&self) -> WarpStats {
        self.exchange.stats()
    }

    pub fn thread_state(&self) -> WarpThreadState {
        self.exchange.thread_state()
    }

    pub fn default_textures(&self) -> DefaultTextures {
        self.defaults
    }

    pub fn chromatic_disabled(&self) -> bool {
        self.disable_chromatic
    }

    /// Vsync at which `eye` of `generation` was first displayed, if it was
    /// and is still held.
    pub fn first_displayed_vsync(&self, generation: i64, eye: usize) -> Option<i64> {
        self.exchange
            .submission(generation)
            .map(|submission| submission.first_displayed_vsync(eye))
            .filter(|&vsync| vsync != 0)
    }

    pub fn exchange(&self) -> &Arc<FrameExchange> {
        &self.exchange
    }

    pub fn vsync(&self) -> &Arc<VsyncTimer> {
        &self.vsync
    }

    /// Stops the warp thread if running and returns the backend.
    pub fn into_backend(mut self) -> WarpResult<B> {
        self.stop_warp_thread()?;
        self.renderer
            .take()
            .map(WarpRenderer::into_backend)
            .ok_or_else(|| WarpError::thread("renderer was lost with the warp thread"))
    }
}

impl<B: WarpBackend> Drop for FrameSmoother<B> {
    fn drop(&mut self) {
        if self.warp_thread.is_some() {
            if let Err(err) = self.stop_warp_thread() {
                warn!("Warp thread shutdown: {}", err);
            }
        }
    }
}
