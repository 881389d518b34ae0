//! # Kestrel Core
//!
//! Attitude and heading reference system (AHRS) core for light aircraft.
//! Fuses gyro, accelerometer, magnetometer and GPS velocity into a full
//! kinematic state estimate:
//! - 32-state extended Kalman filter over airspeed, attitude, angular
//!   rates, the local magnetic field, wind and per-sensor biases
//! - Quaternion / Tait-Bryan frame algebra shared with the simulator
//! - Online magnetometer hard/soft-iron calibration
//! - A fixed-period fusion pipeline over an abstract sensor source
//!
//! Frames: earth (east/north/up, inertial), aircraft (nose/left-wing/up),
//! and a sensor frame fixed in the aircraft but rotated by a small
//! misalignment quaternion.

pub mod ekf;
pub mod magkal;
pub mod pipeline;
pub mod quaternion;

// Re-export core types
pub use ekf::{FilterStatus, Measurement, State, BIG, DEG, G};
pub use magkal::{MagCalibrator, MagReport};
pub use pipeline::{
    AveragedSample, FusionLoop, RawSample, SensorError, SensorHub, SensorSource, StateSink,
};
pub use quaternion::{from_quaternion, rotation_fragments, to_quaternion};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
