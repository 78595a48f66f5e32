#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use glam::{Mat4, Quat};
use vr_warp::backend::{
    ContextPriority, DrawCall, FenceSource, FenceStatus, GpuFence, MeshHandle, ProgramHandle, Rect, TextureBinding,
    TextureHandle, WarpBackend, WarpUniforms,
};
use vr_warp::mesh::DistortionMesh;
use vr_warp::program::{ProgramSelection, ShaderSource};
use vr_warp::{FixedPose, FrameSmoother, PoseState, PresentOptions, VsyncTimer, WarpConfig, WarpError, WarpResult};

pub const WIDTH: u32 = 1600;
pub const HEIGHT: u32 = 800;
/// Short refresh period so paced tests finish quickly.
pub const TEST_PERIOD_NANO: i64 = 4_000_000;

#[derive(Clone, Debug)]
pub struct RecordedDraw {
    pub program: ProgramSelection,
    pub uniforms: WarpUniforms,
    pub textures: Vec<TextureBinding>,
    pub mesh: MeshHandle,
    pub first_index: u32,
    pub index_count: u32,
    pub scissor: Rect,
    pub blend: bool,
}

impl RecordedDraw {
    pub fn tex_m(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.uniforms.tex_m)
    }

    pub fn tex_m2(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.uniforms.tex_m2)
    }
}

#[derive(Default, Debug)]
pub struct Recording {
    pub programs: Vec<ProgramSelection>,
    pub meshes: Vec<usize>,
    pub draws: Vec<RecordedDraw>,
    pub clears: Vec<(Rect, [f32; 4])>,
    pub lines: Vec<(Rect, Rect, usize)>,
    pub frames_begun: usize,
    /// Framebuffer sRGB setting of each begun frame.
    pub framebuffer_srgb: Vec<Option<bool>>,
    pub presents: usize,
    pub finishes: usize,
    pub flushes: usize,
}

/// Fences whose signaling the test controls. Tracks how many are alive.
pub struct MockFences {
    auto_signal: AtomicBool,
    issued: Mutex<Vec<Arc<AtomicBool>>>,
    live: Arc<AtomicUsize>,
}

impl MockFences {
    pub fn new(auto_signal: bool) -> Arc<Self> {
        Arc::new(Self {
            auto_signal: AtomicBool::new(auto_signal),
            issued: Mutex::new(Vec::new()),
            live: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn set_auto_signal(&self, enabled: bool) {
        self.auto_signal.store(enabled, Ordering::SeqCst);
    }

    pub fn signal_all(&self) {
        for flag in self.issued.lock().unwrap().iter() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.lock().unwrap().len()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

struct MockFence {
    signaled: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

impl GpuFence for MockFence {
    fn poll(&self, _timeout: Duration) -> FenceStatus {
        if self.signaled.load(Ordering::SeqCst) {
            FenceStatus::Signaled
        } else {
            FenceStatus::TimeoutExpired
        }
    }
}

impl Drop for MockFence {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FenceSource for MockFences {
    fn create_fence(&self) -> WarpResult<Box<dyn GpuFence>> {
        let signaled = Arc::new(AtomicBool::new(self.auto_signal.load(Ordering::SeqCst)));
        self.issued.lock().unwrap().push(Arc::clone(&signaled));
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockFence {
            signaled,
            live: Arc::clone(&self.live),
        }))
    }
}

/// Backend that records every call instead of touching a GPU.
pub struct RecordingBackend {
    pub log: Arc<Mutex<Recording>>,
    pub fences: Arc<MockFences>,
    pub name: String,
    pub refuse_warp_thread: bool,
    pub srgb_write_control: bool,
    /// Number of upcoming `begin_frame` calls that fail with a surface error.
    pub failing_frames: Arc<AtomicUsize>,
    /// Once set, every `begin_frame` fails with a context error.
    pub context_lost: Arc<AtomicBool>,
    next_texture: u64,
    frame_open: bool,
}

impl RecordingBackend {
    pub fn new(fences: Arc<MockFences>) -> Self {
        Self {
            log: Arc::new(Mutex::new(Recording::default())),
            fences,
            name: "Recording GPU".to_string(),
            refuse_warp_thread: false,
            srgb_write_control: false,
            failing_frames: Arc::new(AtomicUsize::new(0)),
            context_lost: Arc::new(AtomicBool::new(false)),
            next_texture: 1,
            frame_open: false,
        }
    }
}

impl WarpBackend for RecordingBackend {
    fn surface_size(&self) -> (u32, u32) {
        (WIDTH, HEIGHT)
    }

    fn renderer_name(&self) -> String {
        self.name.clone()
    }

    fn fence_source(&self) -> Arc<dyn FenceSource> {
        Arc::clone(&self.fences) as Arc<dyn FenceSource>
    }

    fn has_srgb_write_control(&self) -> bool {
        self.srgb_write_control
    }

    fn enter_warp_thread(&mut self, requested: ContextPriority) -> WarpResult<ContextPriority> {
        if self.refuse_warp_thread {
            return Err(WarpError::context("context is current on another thread"));
        }
        Ok(requested)
    }

    fn compile_program(&mut self, selection: ProgramSelection, source: &ShaderSource) -> WarpResult<ProgramHandle> {
        assert!(source.wgsl.contains(source.fragment_entry));
        let mut log = self.log.lock().unwrap();
        log.programs.push(selection);
        Ok(ProgramHandle(log.programs.len() as u32 - 1))
    }

    fn upload_mesh(&mut self, mesh: &DistortionMesh) -> WarpResult<MeshHandle> {
        let mut log = self.log.lock().unwrap();
        log.meshes.push(mesh.indices.len());
        Ok(MeshHandle(log.meshes.len() as u32 - 1))
    }

    fn create_texture_rgba(&mut self, width: u32, height: u32, pixels: &[u8]) -> WarpResult<TextureHandle> {
        assert_eq!(pixels.len(), (width * height * 4) as usize);
        let handle = TextureHandle(1000 + self.next_texture);
        self.next_texture += 1;
        Ok(handle)
    }

    fn finish(&mut self) {
        self.log.lock().unwrap().finishes += 1;
    }

    fn begin_frame(&mut self, framebuffer_srgb: Option<bool>) -> WarpResult<()> {
        if self.context_lost.load(Ordering::SeqCst) {
            return Err(WarpError::context("context lost"));
        }
        let failing = self.failing_frames.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_frames.store(failing - 1, Ordering::SeqCst);
            return Err(WarpError::surface("surface lost"));
        }
        self.frame_open = true;
        let mut log = self.log.lock().unwrap();
        log.frames_begun += 1;
        log.framebuffer_srgb.push(framebuffer_srgb);
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        assert!(self.frame_open, "draw outside a frame");
        let mut log = self.log.lock().unwrap();
        let program = log.programs[call.program.0 as usize];
        log.draws.push(RecordedDraw {
            program,
            uniforms: *call.uniforms,
            textures: call.textures.to_vec(),
            mesh: call.mesh,
            first_index: call.first_index,
            index_count: call.index_count,
            scissor: call.scissor,
            blend: call.blend,
        });
    }

    fn clear_rect(&mut self, rect: Rect, color: [f32; 4]) {
        self.log.lock().unwrap().clears.push((rect, color));
    }

    fn draw_lines(&mut self, viewport: Rect, scissor: Rect, vertices: &[[f32; 2]], _color: [f32; 4]) {
        self.log.lock().unwrap().lines.push((viewport, scissor, vertices.len()));
    }

    fn flush(&mut self) {
        self.log.lock().unwrap().flushes += 1;
    }

    fn present(&mut self) -> WarpResult<()> {
        self.frame_open = false;
        self.log.lock().unwrap().presents += 1;
        Ok(())
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn sync_config() -> WarpConfig {
    WarpConfig {
        async_mode: false,
        ..WarpConfig::default()
    }
}

/// Options that let a frame show on the very next tick.
pub fn immediate_options() -> PresentOptions {
    PresentOptions {
        minimum_vsyncs: 0,
        ..PresentOptions::default()
    }
}

pub struct Harness {
    pub smoother: FrameSmoother<RecordingBackend>,
    pub log: Arc<Mutex<Recording>>,
    pub fences: Arc<MockFences>,
    pub failing_frames: Arc<AtomicUsize>,
    pub context_lost: Arc<AtomicBool>,
}

pub fn harness_with(config: WarpConfig, pose: Quat, configure: impl FnOnce(&mut RecordingBackend)) -> WarpResult<Harness> {
    init_logging();
    let fences = MockFences::new(true);
    let mut backend = RecordingBackend::new(Arc::clone(&fences));
    configure(&mut backend);
    let log = Arc::clone(&backend.log);
    let failing_frames = Arc::clone(&backend.failing_frames);
    let context_lost = Arc::clone(&backend.context_lost);
    let smoother = FrameSmoother::new(
        backend,
        config,
        Arc::new(FixedPose(PoseState::from_orientation(pose))),
        Arc::new(VsyncTimer::new(TEST_PERIOD_NANO)),
    )?;
    Ok(Harness {
        smoother,
        log,
        fences,
        failing_frames,
        context_lost,
    })
}

pub fn harness(config: WarpConfig) -> Harness {
    harness_with(config, Quat::IDENTITY, |_| {}).unwrap()
}

/// Submits the same texture, matrix and pose for both eyes.
pub fn submit_frame(smoother: &mut FrameSmoother<RecordingBackend>, texture: TextureHandle, tex_m: Mat4, pose: PoseState) {
    for eye in 0..2 {
        smoother.submit_eye_texture(eye, 0, texture);
        smoother.submit_eye_pose(eye, 0, tex_m, pose);
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub fn draws(log: &Arc<Mutex<Recording>>) -> Vec<RecordedDraw> {
    log.lock().unwrap().draws.clone()
}

pub fn clear_draws(log: &Arc<Mutex<Recording>>) {
    log.lock().unwrap().draws.clear();
}
