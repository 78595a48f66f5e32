mod common;

use std::sync::Arc;
use std::thread;

use glam::{Mat4, Quat};
use vr_warp::display::{TickOutcome, WarpRenderer};
use vr_warp::exchange::{EyeImageSlots, FrameExchange, Submission};
use vr_warp::mesh::part_range;
use vr_warp::program::{ProgramKind, ProgramSelection};
use vr_warp::swap_program::SYNC_SWAPPED_BUFFER_PORTRAIT;
use vr_warp::warp_matrix::tex_coords_from_fov;
use vr_warp::{
    FenceSource, FixedPose, LatencyTester, PoseState, PresentOptions, TextureHandle, VsyncTimer, WarpConfig,
};

use common::*;

const EYE_TEXTURE: TextureHandle = TextureHandle(7);

fn eye_matrix() -> Mat4 {
    tex_coords_from_fov(90.0, 90.0)
}

#[test]
fn static_head_draws_rendered_matrix() {
    let mut h = harness(sync_config());
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&immediate_options());

    let draws = draws(&h.log);
    assert_eq!(draws.len(), 2);
    for draw in &draws {
        assert_eq!(draw.tex_m(), eye_matrix());
        assert_eq!(draw.tex_m2(), eye_matrix());
        assert_eq!(draw.textures[0].texture, EYE_TEXTURE);
        assert!(!draw.blend);
    }
    assert_eq!(h.log.lock().unwrap().presents, 1);
    assert_eq!(h.smoother.stats().displayed_frames, 1);
}

#[test]
fn eyes_draw_their_half_of_mesh_and_screen() {
    let mut h = harness(sync_config());
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&immediate_options());

    let draws = draws(&h.log);
    let total = draws[0].index_count * 2;
    for (eye, draw) in draws.iter().enumerate() {
        let expected = part_range(total, 2, eye as u32);
        assert_eq!(draw.first_index, expected.start);
        assert_eq!(draw.index_count, expected.end - expected.start);
        assert_eq!(draw.scissor.x, eye as u32 * WIDTH / 2);
        assert_eq!(draw.scissor.width, WIDTH / 2);
        assert_eq!(draw.scissor.height, HEIGHT);
    }
}

#[test]
fn sliced_static_head_draws_every_slice_with_rendered_matrix() {
    let config = WarpConfig {
        slices_per_eye: 4,
        ..sync_config()
    };
    let mut h = harness(config);
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        use_sliced_warp: true,
        ..immediate_options()
    });

    let draws = draws(&h.log);
    assert_eq!(draws.len(), 8);
    let slice_width = WIDTH / 8;
    for (slice, draw) in draws.iter().enumerate() {
        assert_eq!(draw.scissor.x, slice as u32 * slice_width);
        assert_eq!(draw.scissor.width, slice_width);
        assert_eq!(draw.tex_m(), eye_matrix());
        assert_eq!(draw.tex_m2(), eye_matrix());
    }
    // per-eye clamp follows the slice's eye
    assert_eq!(draws[3].uniforms.tex_clamp[0], 0.0);
    assert_eq!(draws[4].uniforms.tex_clamp[0], 0.5);
}

#[test]
fn empty_frame_is_not_drawn() {
    let mut h = harness(sync_config());
    h.smoother.present_frame(&immediate_options());

    assert!(draws(&h.log).is_empty());
    let stats = h.smoother.stats();
    assert_eq!(stats.displayed_frames, 0);
    assert_eq!(stats.idle_ticks, 1);
}

#[test]
fn default_images_fill_empty_layers() {
    let mut h = harness(sync_config());
    let defaults = h.smoother.default_textures();
    h.smoother.present_frame(&PresentOptions {
        default_images: true,
        program: ProgramSelection::simple(ProgramKind::LoadingIcon),
        ..immediate_options()
    });

    let draws = draws(&h.log);
    assert_eq!(draws.len(), 2);
    for draw in &draws {
        assert_eq!(draw.program.kind, ProgramKind::LoadingIcon);
        assert_eq!(draw.textures[0].texture, defaults.black);
        assert_eq!(draw.textures[1].texture, defaults.loading_icon);
    }
}

#[test]
fn blacklisted_gpu_never_draws_chromatic() {
    let mut h = harness_with(sync_config(), Quat::IDENTITY, |backend| {
        backend.name = "ARM Mali-T760".to_string();
    })
    .unwrap();
    assert!(h.smoother.chromatic_disabled());

    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        program: ProgramSelection::chromatic(ProgramKind::Simple),
        ..immediate_options()
    });

    let draws = draws(&h.log);
    assert!(!draws.is_empty());
    assert!(draws.iter().all(|draw| !draw.program.chromatic));
}

#[test]
fn chromatic_is_drawn_when_allowed() {
    let mut h = harness(sync_config());
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        program: ProgramSelection::chromatic(ProgramKind::Simple),
        ..immediate_options()
    });

    assert!(draws(&h.log).iter().all(|draw| draw.program.chromatic));
}

#[test]
fn head_turn_changes_warp() {
    let turned = Quat::from_rotation_y(0.1);
    let mut h = harness_with(sync_config(), turned, |_| {}).unwrap();
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&immediate_options());

    let draws = draws(&h.log);
    assert_eq!(draws.len(), 2);
    assert!(!draws[0].tex_m().abs_diff_eq(eye_matrix(), 1e-4));
}

#[test]
fn cursor_and_framework_graphics_follow_options() {
    struct Probe;
    impl LatencyTester for Probe {
        fn display_color(&mut self) -> Option<[u8; 3]> {
            Some([255, 0, 0])
        }
        fn take_results(&mut self) -> Option<String> {
            Some("latency 42 ms".to_string())
        }
    }

    let mut h = harness(sync_config());
    h.smoother.set_latency_tester(Some(Box::new(Probe))).unwrap();
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        show_cursor: true,
        draw_calibration_lines: true,
        ..immediate_options()
    });

    let log = h.log.lock().unwrap();
    assert_eq!(log.draws.len(), 4);
    assert_eq!(log.draws.iter().filter(|draw| draw.blend).count(), 2);
    assert_eq!(log.clears.len(), 2);
    assert_eq!(log.clears[0].1, [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(log.lines.len(), 2);
}

#[test]
fn surface_loss_skips_the_frame() {
    let mut h = harness(sync_config());
    h.failing_frames.store(1, std::sync::atomic::Ordering::SeqCst);
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&immediate_options());
    assert_eq!(h.smoother.stats().skipped_frames, 1);
    assert!(draws(&h.log).is_empty());

    h.smoother.present_frame(&immediate_options());
    assert_eq!(h.smoother.stats().displayed_frames, 1);
}

#[test]
fn flush_renders_three_times() {
    let mut h = harness(sync_config());
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        flush: true,
        ..immediate_options()
    });

    let log = h.log.lock().unwrap();
    assert_eq!(log.finishes, 1);
    assert_eq!(log.presents, 3);
}

#[test]
fn first_display_is_recorded_per_generation() {
    let mut h = harness(sync_config());
    // vsync 0 reads as "never displayed"
    thread::sleep(std::time::Duration::from_nanos(3 * TEST_PERIOD_NANO as u64));
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&immediate_options());

    let swap = h.smoother.swap_state();
    assert!(swap.vsync_count > 0);
    assert_eq!(swap.eye_buffer_count, 1);
    for eye in 0..2 {
        assert_eq!(h.smoother.first_displayed_vsync(1, eye), Some(swap.vsync_count));
    }
    assert_eq!(h.smoother.first_displayed_vsync(2, 0), None);
}

#[test]
fn retained_generations_hold_at_most_one_fence_each() {
    let mut h = harness(sync_config());
    for _ in 0..10 {
        submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
        h.smoother.present_frame(&immediate_options());
        assert!(h.fences.live() <= vr_warp::exchange::HISTORY_DEPTH);
    }
    assert_eq!(h.fences.issued(), 10);
}

#[test]
#[should_panic(expected = "out of range")]
fn eye_index_is_checked() {
    let mut h = harness(sync_config());
    h.smoother.submit_eye_texture(2, 0, EYE_TEXTURE);
}

#[test]
fn present_from_another_thread_is_refused() {
    let h = harness(sync_config());
    let mut smoother = h.smoother;
    let result = thread::spawn(move || smoother.present_frame(&immediate_options())).join();
    assert!(result.is_err());
}

fn renderer_fixture(predicted: Quat) -> (WarpRenderer<RecordingBackend>, FrameExchange, Arc<MockFences>, Arc<std::sync::Mutex<Recording>>) {
    init_logging();
    let fences = MockFences::new(true);
    let backend = RecordingBackend::new(Arc::clone(&fences));
    let log = Arc::clone(&backend.log);
    let renderer = WarpRenderer::new(
        backend,
        &WarpConfig::default(),
        Arc::new(FixedPose(PoseState::from_orientation(predicted))),
        Arc::new(VsyncTimer::new(TEST_PERIOD_NANO)),
    )
    .unwrap();
    (renderer, FrameExchange::new(), fences, log)
}

fn publish(exchange: &FrameExchange, fences: &MockFences, pose: Quat, minimum_vsync: i64, options: PresentOptions) {
    let generation = exchange.latest_generation() + 1;
    let mut images: EyeImageSlots = Default::default();
    for eye in images.iter_mut() {
        eye[0].texture = EYE_TEXTURE;
        eye[0].tex_coords_from_tan_angles = eye_matrix();
        eye[0].pose = PoseState::from_orientation(pose);
    }
    exchange.retire(generation);
    exchange.publish(Submission::new(
        generation,
        images,
        fences.create_fence().unwrap(),
        minimum_vsync,
        options,
        false,
    ));
}

#[test]
fn external_velocity_is_capped_at_three_steps() {
    let (mut renderer, exchange, fences, log) = renderer_fixture(Quat::IDENTITY);
    let step = Mat4::from_rotation_y(0.01);
    publish(
        &exchange,
        &fences,
        Quat::IDENTITY,
        0,
        PresentOptions {
            external_velocity: step,
            ..immediate_options()
        },
    );

    let outcome = renderer.render_to_display(&exchange, 10.0, &SYNC_SWAPPED_BUFFER_PORTRAIT);
    assert_eq!(outcome, TickOutcome::Displayed { generation: 1 });

    let expected = eye_matrix() * step * step * step;
    let draws = draws(&log);
    assert!(draws[0].tex_m().abs_diff_eq(expected, 1e-5));
}

#[test]
fn unfinished_frame_falls_back_to_previous_generation() {
    let (mut renderer, exchange, fences, _log) = renderer_fixture(Quat::IDENTITY);
    publish(&exchange, &fences, Quat::IDENTITY, 0, immediate_options());
    fences.set_auto_signal(false);
    publish(&exchange, &fences, Quat::IDENTITY, 0, immediate_options());

    let outcome = renderer.render_to_display(&exchange, 0.0, &SYNC_SWAPPED_BUFFER_PORTRAIT);
    assert_eq!(outcome, TickOutcome::Displayed { generation: 1 });
    assert_eq!(exchange.swap_state().eye_buffer_count, 1);

    fences.signal_all();
    let outcome = renderer.render_to_display(&exchange, 1.0, &SYNC_SWAPPED_BUFFER_PORTRAIT);
    assert_eq!(outcome, TickOutcome::Displayed { generation: 2 });
}

#[test]
fn frame_without_pose_is_skipped_over() {
    let (mut renderer, exchange, fences, _log) = renderer_fixture(Quat::IDENTITY);
    publish(&exchange, &fences, Quat::IDENTITY, 0, immediate_options());
    publish(&exchange, &fences, Quat::from_xyzw(0.0, 0.0, 0.0, 0.0), 0, immediate_options());

    let outcome = renderer.render_to_display(&exchange, 0.0, &SYNC_SWAPPED_BUFFER_PORTRAIT);
    assert_eq!(outcome, TickOutcome::Displayed { generation: 1 });
}

#[test]
fn frame_is_held_until_its_minimum_vsync() {
    let (mut renderer, exchange, fences, _log) = renderer_fixture(Quat::IDENTITY);
    publish(&exchange, &fences, Quat::IDENTITY, 0, immediate_options());
    publish(&exchange, &fences, Quat::IDENTITY, 2, immediate_options());

    let early = renderer.render_to_display(&exchange, 1.0, &SYNC_SWAPPED_BUFFER_PORTRAIT);
    assert_eq!(early, TickOutcome::Displayed { generation: 1 });
    let due = renderer.render_to_display(&exchange, 2.0, &SYNC_SWAPPED_BUFFER_PORTRAIT);
    assert_eq!(due, TickOutcome::Displayed { generation: 2 });
}

#[test]
fn inhibit_srgb_turns_off_texture_decode() {
    let mut h = harness(sync_config());
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        show_cursor: true,
        ..immediate_options()
    });
    let decoded = draws(&h.log);
    assert_eq!(decoded.len(), 4);
    assert!(decoded.iter().all(|draw| draw.textures.iter().all(|t| t.srgb_decode)));

    clear_draws(&h.log);
    submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
    h.smoother.present_frame(&PresentOptions {
        show_cursor: true,
        inhibit_srgb: true,
        ..immediate_options()
    });
    let raw = draws(&h.log);
    assert_eq!(raw.len(), 4);
    assert!(raw.iter().all(|draw| draw.textures.iter().all(|t| !t.srgb_decode)));

    // no write control, so the framebuffer setting is left alone
    assert!(h.log.lock().unwrap().framebuffer_srgb.iter().all(Option::is_none));
}

#[test]
fn framebuffer_srgb_follows_inhibit_when_controllable() {
    let mut h = harness_with(sync_config(), Quat::IDENTITY, |backend| {
        backend.srgb_write_control = true;
    })
    .unwrap();
    for inhibit_srgb in [false, true] {
        submit_frame(&mut h.smoother, EYE_TEXTURE, eye_matrix(), PoseState::IDENTITY);
        h.smoother.present_frame(&PresentOptions {
            inhibit_srgb,
            ..immediate_options()
        });
    }
    assert_eq!(h.log.lock().unwrap().framebuffer_srgb, vec![Some(true), Some(false)]);
}
