//! Warp pass
//!
//! [`WarpRenderer`] turns the newest finished submission into one displayed
//! frame: for each eye (or each screen slice) it predicts the head pose at
//! the leading and trailing scanout edge, builds the warp matrices for both
//! layers, and draws the distortion mesh with the selected shader.

use std::ops::Range;
use std::sync::Arc;

use glam::{Mat4, Vec4};
use log::{debug, error, info, warn};

use crate::backend::{
    DrawCall, MeshHandle, Rect, TextureBinding, TextureHandle, TextureTarget, WarpBackend, WarpUniforms,
};
use crate::config::{PresentOptions, WarpConfig};
use crate::error::{WarpError, WarpResult};
use crate::exchange::{EyeImage, FrameExchange, Submission, EYE_COUNT, MAX_LAYERS};
use crate::latency::{color_to_rgba, LatencyTester};
use crate::mesh::{build_distortion_mesh, calibration_lines, part_range, DistortionMesh, MeshParams};
use crate::pose::{PosePredictor, PoseState};
use crate::program::{OverlayBinding, ProgramKind, ProgramSelection, WarpPrograms};
use crate::swap_program::SwapProgram;
use crate::time::{time_in_seconds, VsyncTimer};
use crate::warp_matrix::{calculate_time_warp, extrapolate_velocity, layer_warp, velocity_steps};

/// Share of a refresh period during which the panel is actually scanning.
const ACTIVE_SCAN_FRACTION: f64 = 112.0 / 135.0;

const SLOW_EYE_SECONDS: f64 = 0.008;

const LOADING_ICON_SIZE: u32 = 64;

const CALIBRATION_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Displayed { generation: i64 },
    /// Nothing displayable; the tick slept instead of drawing.
    Idle,
    /// The frame was dropped on a transient surface error.
    Skipped,
}

/// Placeholder images substituted for empty layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DefaultTextures {
    pub black: TextureHandle,
    pub loading_icon: TextureHandle,
}

#[derive(Clone, Copy, Debug)]
struct UploadedMesh {
    handle: MeshHandle,
    index_count: u32,
}

#[derive(Default)]
struct ReportWindow {
    second: i64,
    displayed: u32,
    idle: u32,
    skipped: u32,
    slowest_eye: f64,
}

pub struct WarpRenderer<B: WarpBackend> {
    backend: B,
    programs: WarpPrograms,
    warp_mesh: UploadedMesh,
    slice_mesh: UploadedMesh,
    cursor_mesh: UploadedMesh,
    slices_per_eye: u32,
    calibration_lines: Vec<[f32; 2]>,
    defaults: DefaultTextures,
    has_srgb_write_control: bool,
    predictor: Arc<dyn PosePredictor>,
    vsync: Arc<VsyncTimer>,
    latency_tester: Option<Box<dyn LatencyTester>>,
    window: ReportWindow,
}

impl<B: WarpBackend> WarpRenderer<B> {
    /// Creates the framework graphics: shader catalog, meshes and
    /// placeholder textures.
    pub fn new(
        mut backend: B,
        config: &WarpConfig,
        predictor: Arc<dyn PosePredictor>,
        vsync: Arc<VsyncTimer>,
    ) -> WarpResult<Self> {
        let params = MeshParams::from(config);
        let slices_per_eye = config.slices_per_eye.max(1);

        let warp_mesh = upload(&mut backend, &build_distortion_mesh(&params, 1, false)?)?;
        let slice_mesh = upload(&mut backend, &build_distortion_mesh(&params, slices_per_eye, false)?)?;
        let cursor_mesh = upload(&mut backend, &build_distortion_mesh(&params, 1, true)?)?;

        let programs = WarpPrograms::build(&mut backend)?;

        let defaults = DefaultTextures {
            black: backend.create_texture_rgba(1, 1, &[0, 0, 0, 0])?,
            loading_icon: backend.create_texture_rgba(
                LOADING_ICON_SIZE,
                LOADING_ICON_SIZE,
                &loading_icon_pixels(LOADING_ICON_SIZE),
            )?,
        };

        let has_srgb_write_control = backend.has_srgb_write_control();
        if !has_srgb_write_control {
            info!("Framebuffer sRGB control unavailable, leaving conversion to the surface format");
        }

        info!(
            "Warp renderer ready on {}: {} warp indices, {} slices per eye",
            backend.renderer_name(),
            warp_mesh.index_count,
            slices_per_eye
        );

        Ok(Self {
            backend,
            programs,
            warp_mesh,
            slice_mesh,
            cursor_mesh,
            slices_per_eye,
            calibration_lines: calibration_lines(),
            defaults,
            has_srgb_write_control,
            predictor,
            vsync,
            latency_tester: None,
            window: ReportWindow::default(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn default_textures(&self) -> DefaultTextures {
        self.defaults
    }

    pub fn set_latency_tester(&mut self, tester: Option<Box<dyn LatencyTester>>) {
        self.latency_tester = tester;
    }

    /// Displays the best available submission for the tick whose base vsync
    /// is `vsync_base`.
    pub fn render_to_display(&mut self, exchange: &FrameExchange, vsync_base: f64, swap: &SwapProgram) -> TickOutcome {
        let outcome = self.warp_tick(exchange, vsync_base, swap);
        exchange.count_tick(
            matches!(outcome, TickOutcome::Displayed { .. }),
            outcome == TickOutcome::Skipped,
        );
        self.report(outcome);
        outcome
    }

    fn warp_tick(&mut self, exchange: &FrameExchange, vsync_base: f64, swap: &SwapProgram) -> TickOutcome {
        let chosen = exchange.select(vsync_base);
        let shown = chosen
            .as_ref()
            .map_or(exchange.swap_state().eye_buffer_count, |submission| submission.generation);
        exchange.publish_swap(vsync_base as i64, shown);

        let Some(submission) = chosen else {
            self.sleep_past(vsync_base);
            return TickOutcome::Idle;
        };
        if submission.images[0][0].texture.is_none() {
            debug!("generation {} has no eye image", submission.generation);
            self.sleep_past(vsync_base);
            return TickOutcome::Idle;
        }

        let result = if submission.options.use_sliced_warp {
            self.render_sliced(&submission, vsync_base, swap)
        } else {
            self.render_eyes(&submission, vsync_base, swap)
        };

        match result {
            Ok(()) => {
                for eye in 0..EYE_COUNT {
                    submission.note_displayed(eye, vsync_base as i64);
                }
                TickOutcome::Displayed {
                    generation: submission.generation,
                }
            }
            Err(err) if err.is_transient() => {
                warn!("Warp frame skipped: {}", err);
                TickOutcome::Skipped
            }
            Err(err) => {
                error!("Warp rendering failed: {}", err);
                exchange.report_fatal(err.to_string());
                panic!("warp rendering failed: {err}");
            }
        }
    }

    fn sleep_past(&self, vsync_base: f64) {
        self.vsync.sleep_until(self.vsync.frame_point_time(vsync_base + 1.0));
    }

    fn framebuffer_srgb(&self, options: &PresentOptions) -> Option<bool> {
        self.has_srgb_write_control.then_some(!options.inhibit_srgb)
    }

    fn render_eyes(&mut self, submission: &Submission, vsync_base: f64, swap: &SwapProgram) -> WarpResult<()> {
        let options = &submission.options;
        let (width, height) = self.backend.surface_size();
        let velocity = extrapolate_velocity(
            options.external_velocity,
            velocity_steps(vsync_base, submission.minimum_vsync),
        );
        let latency_color = self.poll_latency_tester();

        let framebuffer_srgb = self.framebuffer_srgb(options);
        self.backend.begin_frame(framebuffer_srgb)?;

        for eye in 0..EYE_COUNT {
            self.vsync.sleep_until(self.vsync.frame_point_time(swap.draw_vsync(vsync_base, eye)));
            let started = time_in_seconds();

            let images = &submission.images[eye];
            let mut sensors = [PoseState::IDENTITY; 2];
            let mut primary = [Mat4::IDENTITY; 2];
            let mut overlay = [Mat4::IDENTITY; 2];
            for (scan, sample_vsync) in swap.sample_vsyncs(vsync_base, eye).into_iter().enumerate() {
                sensors[scan] = self.predictor.predict(self.vsync.frame_point_time(sample_vsync));
                let (layer0, layer1) = scan_warps(images, &sensors[scan], velocity, options.fixed_overlay);
                primary[scan] = layer0;
                overlay[scan] = layer1;
            }
            let rolling = calculate_time_warp(sensors[0].orientation, sensors[1].orientation);
            let uniforms = self.uniforms(primary, overlay, rolling, eye, vsync_base, options);

            let eye_rect = eye_rect(eye, width, height);
            let mesh = self.warp_mesh;
            self.draw_layers(
                submission,
                eye,
                &uniforms,
                mesh.handle,
                part_range(mesh.index_count, EYE_COUNT as u32, eye as u32),
                eye_rect,
            );
            if options.show_cursor {
                self.draw_cursor(images, eye, &uniforms, eye_rect, !options.inhibit_srgb);
            }
            self.draw_framework_graphics(options, latency_color, eye_rect, eye_rect);
            self.backend.flush();

            self.note_eye_time(eye, time_in_seconds() - started);
        }

        self.backend.present()
    }

    /// Draws each eye as vertical slices, each warped for the span of
    /// scanout it covers. The trailing pose of one slice is the leading pose
    /// of the next within an eye.
    fn render_sliced(&mut self, submission: &Submission, vsync_base: f64, swap: &SwapProgram) -> WarpResult<()> {
        let options = &submission.options;
        let (width, height) = self.backend.surface_size();
        let screen_slices = self.slices_per_eye * EYE_COUNT as u32;
        let slice_width = width / screen_slices;
        let scan_start = vsync_base + swap.prediction_points[0][0];
        let slice_times: Vec<f64> = (0..=screen_slices)
            .map(|i| {
                self.vsync
                    .frame_point_time(scan_start + ACTIVE_SCAN_FRACTION * i as f64 / screen_slices as f64)
            })
            .collect();
        let velocity = extrapolate_velocity(
            options.external_velocity,
            velocity_steps(vsync_base, submission.minimum_vsync),
        );
        let latency_color = self.poll_latency_tester();

        let framebuffer_srgb = self.framebuffer_srgb(options);
        self.backend.begin_frame(framebuffer_srgb)?;

        let mut carried: Option<(PoseState, Mat4, Mat4)> = None;
        let mut eye_started = time_in_seconds();
        for screen_slice in 0..screen_slices {
            let eye = (screen_slice / self.slices_per_eye) as usize;
            let eye_start = screen_slice % self.slices_per_eye == 0;
            if eye_start {
                carried = None;
                eye_started = time_in_seconds();
            }

            let images = &submission.images[eye];
            let mut sensors = [PoseState::IDENTITY; 2];
            let mut primary = [Mat4::IDENTITY; 2];
            let mut overlay = [Mat4::IDENTITY; 2];
            for scan in 0..2 {
                if let (0, Some((sensor, layer0, layer1))) = (scan, carried) {
                    sensors[0] = sensor;
                    primary[0] = layer0;
                    overlay[0] = layer1;
                    continue;
                }
                let time = slice_times[screen_slice as usize + scan];
                sensors[scan] = self.predictor.predict(time);
                let (layer0, layer1) = scan_warps(images, &sensors[scan], velocity, options.fixed_overlay);
                primary[scan] = layer0;
                overlay[scan] = layer1;
            }
            carried = Some((sensors[1], primary[1], overlay[1]));

            let rolling = calculate_time_warp(sensors[0].orientation, sensors[1].orientation);
            let uniforms = self.uniforms(primary, overlay, rolling, eye, vsync_base, options);

            let eye_rect = eye_rect(eye, width, height);
            let slice_rect = Rect {
                x: screen_slice * slice_width,
                y: 0,
                width: slice_width,
                height,
            };
            let mesh = self.slice_mesh;
            self.draw_layers(
                submission,
                eye,
                &uniforms,
                mesh.handle,
                part_range(mesh.index_count, screen_slices, screen_slice),
                slice_rect,
            );
            if options.show_cursor {
                self.draw_cursor(images, eye, &uniforms, slice_rect, !options.inhibit_srgb);
            }
            self.draw_framework_graphics(options, latency_color, eye_rect, slice_rect);
            self.backend.flush();

            if (screen_slice + 1) % self.slices_per_eye == 0 {
                self.note_eye_time(eye, time_in_seconds() - eye_started);
            }
        }

        self.backend.present()
    }

    fn uniforms(
        &self,
        primary: [Mat4; 2],
        overlay: [Mat4; 2],
        rolling: Mat4,
        eye: usize,
        vsync_base: f64,
        options: &PresentOptions,
    ) -> WarpUniforms {
        let [rate, scale, ..] = options.program_params;
        let angle = self.vsync.frame_point_time(vsync_base) * std::f64::consts::PI * rate as f64;
        WarpUniforms {
            // landscape screen, z flattened
            mvp: Mat4::from_diagonal(Vec4::new(1.0, 1.0, 0.0, 1.0)).to_cols_array_2d(),
            tex_m: primary[0].to_cols_array_2d(),
            tex_m2: primary[1].to_cols_array_2d(),
            tex_m3: overlay[0].to_cols_array_2d(),
            tex_m4: overlay[1].to_cols_array_2d(),
            tex_m5: rolling.to_cols_array_2d(),
            tex_clamp: [eye as f32 * 0.5, (eye + 1) as f32 * 0.5, 0.0, 0.0],
            rotate_scale: [angle.sin() as f32, angle.cos() as f32, scale, 1.0],
            color: [rate; 4],
        }
    }

    fn draw_layers(
        &mut self,
        submission: &Submission,
        eye: usize,
        uniforms: &WarpUniforms,
        mesh: MeshHandle,
        indices: Range<u32>,
        scissor: Rect,
    ) {
        let (program, resolved) = self
            .programs
            .choose(submission.options.program, submission.disable_chromatic);
        let (bindings, count) = texture_bindings(
            &submission.images[eye],
            resolved.kind.overlay_binding(),
            !submission.options.inhibit_srgb,
        );
        self.backend.draw(&DrawCall {
            program,
            uniforms,
            textures: &bindings[..count],
            mesh,
            first_index: indices.start,
            index_count: indices.end - indices.start,
            scissor,
            blend: false,
        });
    }

    /// Redraws the middle of the eye image, with the same warp, blended on
    /// top of the layers.
    fn draw_cursor(
        &mut self,
        images: &[EyeImage; MAX_LAYERS],
        eye: usize,
        uniforms: &WarpUniforms,
        scissor: Rect,
        srgb_decode: bool,
    ) {
        let (program, _) = self
            .programs
            .choose(ProgramSelection::simple(ProgramKind::Simple), true);
        let bindings = [TextureBinding {
            unit: 0,
            target: TextureTarget::Texture2D,
            texture: images[0].texture,
            srgb_decode,
        }];
        let indices = part_range(self.cursor_mesh.index_count, EYE_COUNT as u32, eye as u32);
        self.backend.draw(&DrawCall {
            program,
            uniforms,
            textures: &bindings,
            mesh: self.cursor_mesh.handle,
            first_index: indices.start,
            index_count: indices.end - indices.start,
            scissor,
            blend: true,
        });
    }

    fn poll_latency_tester(&mut self) -> Option<[f32; 4]> {
        let tester = self.latency_tester.as_mut()?;
        if let Some(results) = tester.take_results() {
            info!("Latency tester: {}", results);
        }
        tester.display_color().map(color_to_rgba)
    }

    fn draw_framework_graphics(
        &mut self,
        options: &PresentOptions,
        latency_color: Option<[f32; 4]>,
        viewport: Rect,
        scissor: Rect,
    ) {
        if let Some(color) = latency_color {
            self.backend.clear_rect(scissor, color);
        }
        if options.draw_calibration_lines {
            self.backend
                .draw_lines(viewport, scissor, &self.calibration_lines, CALIBRATION_COLOR);
        }
    }

    fn note_eye_time(&mut self, eye: usize, seconds: f64) {
        if seconds > SLOW_EYE_SECONDS {
            warn!("Eye {} warp took {:.1} ms", eye, seconds * 1e3);
        }
        self.window.slowest_eye = self.window.slowest_eye.max(seconds);
    }

    fn report(&mut self, outcome: TickOutcome) {
        let second = time_in_seconds() as i64;
        if second != self.window.second {
            let window = &self.window;
            if window.displayed + window.idle + window.skipped > 0 {
                info!(
                    "Warp: {} displayed, {} idle, {} skipped, slowest eye {:.2} ms",
                    window.displayed,
                    window.idle,
                    window.skipped,
                    window.slowest_eye * 1e3
                );
            }
            self.window = ReportWindow {
                second,
                ..ReportWindow::default()
            };
        }
        match outcome {
            TickOutcome::Displayed { .. } => self.window.displayed += 1,
            TickOutcome::Idle => self.window.idle += 1,
            TickOutcome::Skipped => self.window.skipped += 1,
        }
    }
}

fn upload<B: WarpBackend>(backend: &mut B, mesh: &DistortionMesh) -> WarpResult<UploadedMesh> {
    if mesh.index_count() == 0 {
        return Err(WarpError::mesh("distortion mesh is empty"));
    }
    Ok(UploadedMesh {
        handle: backend.upload_mesh(mesh)?,
        index_count: mesh.index_count(),
    })
}

fn eye_rect(eye: usize, width: u32, height: u32) -> Rect {
    Rect {
        x: eye as u32 * width / 2,
        y: 0,
        width: width / 2,
        height,
    }
}

/// Primary and overlay warp matrices of one eye for one predicted pose.
fn scan_warps(images: &[EyeImage; MAX_LAYERS], sensor: &PoseState, velocity: Mat4, fixed_overlay: bool) -> (Mat4, Mat4) {
    let primary = layer_warp(
        images[0].tex_coords_from_tan_angles,
        images[0].pose.orientation,
        sensor.orientation,
        velocity,
    );
    let overlay = if images[1].texture.is_none() {
        Mat4::IDENTITY
    } else if fixed_overlay {
        images[1].tex_coords_from_tan_angles
    } else {
        layer_warp(
            images[1].tex_coords_from_tan_angles,
            images[1].pose.orientation,
            sensor.orientation,
            velocity,
        )
    };
    (primary, overlay)
}

fn texture_bindings(
    images: &[EyeImage; MAX_LAYERS],
    binding: OverlayBinding,
    srgb_decode: bool,
) -> ([TextureBinding; 4], usize) {
    let mut bindings = [TextureBinding::default(); 4];
    bindings[0] = TextureBinding {
        unit: 0,
        target: TextureTarget::Texture2D,
        texture: images[0].texture,
        srgb_decode,
    };
    let overlay = |target| TextureBinding {
        unit: 1,
        target,
        texture: images[1].texture,
        srgb_decode,
    };
    match binding {
        OverlayBinding::None => {}
        OverlayBinding::Plane2D => bindings[1] = overlay(TextureTarget::Texture2D),
        OverlayBinding::External => bindings[1] = overlay(TextureTarget::External),
        OverlayBinding::Cube => bindings[1] = overlay(TextureTarget::CubeMap),
        OverlayBinding::CubePlanes => {
            for (plane, texture) in images[1].planar_textures.iter().enumerate() {
                bindings[plane + 1] = TextureBinding {
                    unit: plane as u32 + 1,
                    target: TextureTarget::CubeMap,
                    texture: *texture,
                    srgb_decode,
                };
            }
        }
    }
    (bindings, binding.texture_units())
}

/// White ring whose opacity ramps around the circle; spun by the loading
/// icon shader.
fn loading_icon_pixels(size: u32) -> Vec<u8> {
    let center = (size as f32 - 1.0) * 0.5;
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let dx = (x as f32 - center) / center;
            let dy = (y as f32 - center) / center;
            let radius = (dx * dx + dy * dy).sqrt();
            let alpha = if (0.6..0.9).contains(&radius) {
                let turn = (dy.atan2(dx) + std::f32::consts::PI) / std::f32::consts::TAU;
                (turn * 255.0) as u8
            } else {
                0
            };
            pixels.extend_from_slice(&[255, 255, 255, alpha]);
        }
    }
    pixels
}
