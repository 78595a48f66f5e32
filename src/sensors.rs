//! Head tracking from rotation sensors
//!
//! [`HeadTracker`] keeps the newest orientation sample in a lockless cell so
//! the warp thread can predict from it at any time without waiting on the
//! sensor thread. On Android, [`AndroidSensorSource`] feeds it from the NDK
//! Game Rotation Vector sensor (no magnetic interference), falling back to
//! the raw gyroscope.

use bytemuck::{Pod, Zeroable};
use glam::{EulerRot, Quat, Vec3};
use log::info;

use crate::config::WarpConfig;
use crate::lockless::Lockless;
use crate::pose::{PosePredictor, PoseState};

/// Predictions further ahead than this are held at the limit.
pub const DEFAULT_MAX_PREDICTION_SECONDS: f64 = 0.1;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct TrackerSample {
    time_in_seconds: f64,
    orientation: [f32; 4],
    angular_velocity: [f32; 3],
    valid: u32,
}

/// Latest-sample store with constant angular velocity prediction.
pub struct HeadTracker {
    sample: Lockless<TrackerSample>,
    recenter: Lockless<[f32; 4]>,
    max_prediction_seconds: f64,
}

impl HeadTracker {
    pub fn new(max_prediction_seconds: f64) -> Self {
        Self {
            sample: Lockless::new(TrackerSample::zeroed()),
            recenter: Lockless::new(Quat::IDENTITY.to_array()),
            max_prediction_seconds: max_prediction_seconds.max(0.0),
        }
    }

    /// Stores a new sample. Call from the single sensor thread.
    pub fn push_sample(&self, time_in_seconds: f64, orientation: Quat, angular_velocity: Vec3) {
        self.sample.set_state(TrackerSample {
            time_in_seconds,
            orientation: orientation.normalize().to_array(),
            angular_velocity: angular_velocity.to_array(),
            valid: 1,
        });
    }

    /// Latest raw sample, if any arrived yet.
    pub fn latest(&self) -> Option<PoseState> {
        let sample = self.sample.state();
        if sample.valid == 0 {
            return None;
        }
        Some(PoseState {
            orientation: Quat::from_array(sample.orientation),
            angular_velocity: Vec3::from_array(sample.angular_velocity),
            time_in_seconds: sample.time_in_seconds,
            ..PoseState::IDENTITY
        })
    }

    /// Makes the current heading the forward direction. Pitch and roll stay
    /// absolute. Call from the single application thread.
    pub fn recenter(&self) {
        let Some(current) = self.latest() else {
            return;
        };
        let (yaw, _, _) = current.orientation.to_euler(EulerRot::YXZ);
        self.recenter.set_state(Quat::from_rotation_y(-yaw).to_array());
        info!("Recentered head tracking, yaw {:.3} rad", yaw);
    }
}

impl Default for HeadTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PREDICTION_SECONDS)
    }
}

impl From<&WarpConfig> for HeadTracker {
    fn from(config: &WarpConfig) -> Self {
        Self::new(config.max_prediction_seconds)
    }
}

impl PosePredictor for HeadTracker {
    fn predict(&self, abs_time_seconds: f64) -> PoseState {
        let Some(sample) = self.latest() else {
            return PoseState::IDENTITY.at_time(abs_time_seconds);
        };

        let ahead = (abs_time_seconds - sample.time_in_seconds).clamp(0.0, self.max_prediction_seconds);
        let rotation = Quat::from_scaled_axis(sample.angular_velocity * ahead as f32);
        let reference = Quat::from_array(self.recenter.state());

        PoseState {
            orientation: (reference * sample.orientation * rotation).normalize(),
            angular_velocity: sample.angular_velocity,
            time_in_seconds: abs_time_seconds,
            ..PoseState::IDENTITY
        }
    }
}

#[cfg(target_os = "android")]
pub use android::AndroidSensorSource;

#[cfg(target_os = "android")]
mod android {
    use std::ptr;

    use glam::{Quat, Vec3};
    use log::{info, warn};

    use super::HeadTracker;
    use crate::time::time_in_seconds;

    // Sensor type constants
    const ASENSOR_TYPE_GAME_ROTATION_VECTOR: i32 = 15;
    const ASENSOR_TYPE_GYROSCOPE: i32 = 4;

    /// Polls NDK sensor events into a [`HeadTracker`]
    pub struct AndroidSensorSource {
        sensor_manager: *mut ndk_sys::ASensorManager,
        event_queue: *mut ndk_sys::ASensorEventQueue,
        looper: *mut ndk_sys::ALooper,
        orientation: Quat,
        angular_velocity: Vec3,
        last_gyro_time: Option<f64>,
        initialized: bool,
    }

    // Safety: the queue and looper are only touched by the polling thread
    unsafe impl Send for AndroidSensorSource {}

    impl AndroidSensorSource {
        pub fn new(package: &std::ffi::CStr) -> Self {
            let mut source = Self {
                sensor_manager: ptr::null_mut(),
                event_queue: ptr::null_mut(),
                looper: ptr::null_mut(),
                orientation: Quat::IDENTITY,
                angular_velocity: Vec3::ZERO,
                last_gyro_time: None,
                initialized: false,
            };
            source.init_sensors(package);
            source
        }

        fn enable(&mut self, sensor_type: i32) -> bool {
            unsafe {
                let sensor = ndk_sys::ASensorManager_getDefaultSensor(self.sensor_manager, sensor_type);
                if sensor.is_null() {
                    return false;
                }
                if ndk_sys::ASensorEventQueue_enableSensor(self.event_queue, sensor) < 0 {
                    warn!("Failed to enable sensor type {}", sensor_type);
                    return false;
                }
                // Request 1 kHz (1000 us); the platform clamps to what it supports
                ndk_sys::ASensorEventQueue_setEventRate(self.event_queue, sensor, 1000);
                true
            }
        }

        fn init_sensors(&mut self, package: &std::ffi::CStr) {
            info!("Initializing head tracking sensors...");

            unsafe {
                self.sensor_manager = ndk_sys::ASensorManager_getInstanceForPackage(package.as_ptr());
                if self.sensor_manager.is_null() {
                    self.sensor_manager = ndk_sys::ASensorManager_getInstance();
                }
                if self.sensor_manager.is_null() {
                    warn!("ASensorManager not available");
                    return;
                }

                self.looper = ndk_sys::ALooper_forThread();
                if self.looper.is_null() {
                    self.looper = ndk_sys::ALooper_prepare(0);
                }
                if self.looper.is_null() {
                    warn!("Failed to get ALooper");
                    return;
                }

                self.event_queue = ndk_sys::ASensorManager_createEventQueue(
                    self.sensor_manager,
                    self.looper,
                    0,
                    None,
                    ptr::null_mut(),
                );
                if self.event_queue.is_null() {
                    warn!("Failed to create sensor event queue");
                    return;
                }
            }

            let rotation = self.enable(ASENSOR_TYPE_GAME_ROTATION_VECTOR);
            let gyro = self.enable(ASENSOR_TYPE_GYROSCOPE);
            self.initialized = rotation || gyro;
            info!(
                "Head tracking sensors: game rotation vector {}, gyroscope {}",
                rotation, gyro
            );
        }

        /// Drains pending events into `tracker`. Non-blocking.
        pub fn poll(&mut self, tracker: &HeadTracker) {
            if !self.initialized {
                return;
            }

            let mut updated = false;
            unsafe {
                let mut event: ndk_sys::ASensorEvent = std::mem::zeroed();
                while ndk_sys::ASensorEventQueue_getEvents(self.event_queue, &mut event, 1) > 0 {
                    let data = event.__bindgen_anon_1.__bindgen_anon_1.data;
                    match event.type_ {
                        ASENSOR_TYPE_GAME_ROTATION_VECTOR => {
                            let (x, y, z) = (data[0], data[1], data[2]);
                            let w = (1.0 - x * x - y * y - z * z).max(0.0).sqrt();
                            self.orientation = Quat::from_xyzw(x, y, z, w).normalize();
                            updated = true;
                        }
                        ASENSOR_TYPE_GYROSCOPE => {
                            let now = time_in_seconds();
                            self.angular_velocity = Vec3::new(data[0], data[1], data[2]);
                            if let Some(last) = self.last_gyro_time {
                                let dt = (now - last) as f32;
                                self.orientation = (self.orientation
                                    * Quat::from_scaled_axis(self.angular_velocity * dt))
                                .normalize();
                            }
                            self.last_gyro_time = Some(now);
                            updated = true;
                        }
                        _ => {}
                    }
                }
            }

            if updated {
                tracker.push_sample(time_in_seconds(), self.orientation, self.angular_velocity);
            }
        }

        pub fn is_available(&self) -> bool {
            self.initialized
        }
    }

    impl Drop for AndroidSensorSource {
        fn drop(&mut self) {
            unsafe {
                if !self.event_queue.is_null() && !self.sensor_manager.is_null() {
                    ndk_sys::ASensorManager_destroyEventQueue(self.sensor_manager, self.event_queue);
                }
            }
        }
    }
}
