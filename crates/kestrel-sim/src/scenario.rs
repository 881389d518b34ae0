//! Piecewise-linear flight-path scenarios.
//!
//! A scenario is an ordered list of keyframes; linear interpolation
//! between adjacent keyframes yields the true state at any time inside
//! the scenario's range, and queries outside that range fail. From the
//! true state the simulator derives the ideal control inputs (by finite
//! differences) and the ideal sensor measurements, with optional
//! Gaussian noise on top.

use nalgebra::{Quaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::{FRAC_PI_2, PI};
use thiserror::Error;

use kestrel_core::ekf::{Measurement, DEG, G};
use kestrel_core::quaternion::{rotation_fragments, to_quaternion};

/// Finite-difference step for control synthesis, s.
const DERIVATIVE_STEP: f64 = 0.001;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("time {t:.3} is outside the scenario range [{start:.3}, {end:.3}]")]
    OutOfRange { t: f64, start: f64, end: f64 },
    #[error("invalid scenario: {0}")]
    Invalid(String),
}

/// One point on the flight path.
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub t: f64,
    /// Airspeed, kt, aircraft frame
    pub airspeed: Vector3<f64>,
    /// Attitude (phi, theta, psi), rad
    pub attitude: Vector3<f64>,
    /// Sensor mount attitude within the aircraft (phi, theta, psi), rad
    pub mount: Vector3<f64>,
    /// Windspeed, kt, earth frame
    pub wind: Vector3<f64>,
    /// Magnetic field, uT, earth frame
    pub field: Vector3<f64>,
}

impl Keyframe {
    /// Keyframe with an aligned sensor mount and no magnetic field.
    pub fn new(t: f64, airspeed: Vector3<f64>, attitude: Vector3<f64>, wind: Vector3<f64>) -> Self {
        Self {
            t,
            airspeed,
            attitude,
            // psi = pi/2 is the identity mount under the heading convention
            mount: Vector3::new(0.0, 0.0, FRAC_PI_2),
            wind,
            field: Vector3::zeros(),
        }
    }
}

/// True state of the aircraft at one instant.
#[derive(Debug, Clone)]
pub struct TrueState {
    pub t: f64,
    pub u: Vector3<f64>,
    /// Earth -> aircraft quaternion
    pub e: Quaternion<f64>,
    /// Sensor -> aircraft quaternion
    pub f: Quaternion<f64>,
    pub v: Vector3<f64>,
    /// Magnetic field, earth frame
    pub m: Vector3<f64>,
}

/// Ideal inertial sensor outputs, sensor frame.
#[derive(Debug, Clone)]
pub struct Control {
    pub t: f64,
    /// Angular rates, rad/s
    pub gyro: Vector3<f64>,
    /// Specific force, G
    pub accel: Vector3<f64>,
}

pub struct Scenario {
    frames: Vec<Keyframe>,
}

impl Scenario {
    pub fn new(frames: Vec<Keyframe>) -> Result<Scenario, ScenarioError> {
        if frames.len() < 2 {
            return Err(ScenarioError::Invalid(
                "a scenario needs at least two keyframes".into(),
            ));
        }
        if frames.windows(2).any(|w| w[1].t <= w[0].t) {
            return Err(ScenarioError::Invalid(
                "keyframe times must be strictly increasing".into(),
            ));
        }
        Ok(Scenario { frames })
    }

    pub fn start(&self) -> f64 {
        self.frames[0].t
    }

    pub fn end(&self) -> f64 {
        self.frames[self.frames.len() - 1].t
    }

    fn segment(&self, t: f64) -> Result<(usize, f64), ScenarioError> {
        let (start, end) = (self.start(), self.end());
        if t < start || t > end {
            return Err(ScenarioError::OutOfRange { t, start, end });
        }
        let ix = if t > start {
            (self.frames.partition_point(|k| k.t < t) - 1).min(self.frames.len() - 2)
        } else {
            0
        };
        let (t0, t1) = (self.frames[ix].t, self.frames[ix + 1].t);
        Ok((ix, (t1 - t) / (t1 - t0)))
    }

    /// True state at time t by piecewise-linear interpolation.
    pub fn truth(&self, t: f64) -> Result<TrueState, ScenarioError> {
        let (ix, f) = self.segment(t)?;
        let k0 = &self.frames[ix];
        let k1 = &self.frames[ix + 1];
        let blend = |a: &Vector3<f64>, b: &Vector3<f64>| a * f + b * (1.0 - f);

        let att = blend(&k0.attitude, &k1.attitude);
        let mount = blend(&k0.mount, &k1.mount);
        Ok(TrueState {
            t,
            u: blend(&k0.airspeed, &k1.airspeed),
            e: to_quaternion(att.x, att.y, att.z).normalize(),
            f: to_quaternion(mount.x, mount.y, mount.z).normalize(),
            v: blend(&k0.wind, &k1.wind),
            m: blend(&k0.field, &k1.field),
        })
    }

    /// Finite-difference time derivative of airspeed and attitude.
    fn derivative(&self, t: f64) -> Result<(Vector3<f64>, Quaternion<f64>), ScenarioError> {
        let end = self.end();
        let (t0, t1) = if t + DERIVATIVE_STEP > end {
            (end - DERIVATIVE_STEP, end)
        } else {
            (t, t + DERIVATIVE_STEP)
        };
        let s0 = self.truth(t0)?;
        let s1 = self.truth(t1)?;
        let du = (s1.u - s0.u) / DERIVATIVE_STEP;
        let de = Quaternion::from((s1.e.coords - s0.e.coords) / DERIVATIVE_STEP);
        Ok((du, de))
    }

    /// Ideal gyro and accelerometer outputs at time t.
    pub fn control(&self, t: f64) -> Result<Control, ScenarioError> {
        let x = self.truth(t)?;
        let (du, de) = self.derivative(t)?;
        let f_mat = rotation_fragments(&x.f);
        let (e0, e1, e2, e3) = (x.e.w, x.e.i, x.e.j, x.e.k);
        let (d0, d1, d2, d3) = (de.w, de.i, de.j, de.k);

        // omega = 2 * q_dot (x) q_conj, aircraft frame, rad/s
        let h1 = 2.0 * (d1 * e0 - d0 * e1 + d3 * e2 - d2 * e3);
        let h2 = 2.0 * (d2 * e0 - d3 * e1 - d0 * e2 + d1 * e3);
        let h3 = 2.0 * (d3 * e0 + d2 * e1 - d1 * e2 - d0 * e3);
        let h = Vector3::new(h1, h2, h3);

        // Specific force: body acceleration and pseudoforces, less gravity
        let y = Vector3::new(
            -2.0 * (e0 * e2 + e3 * e1) + (-du.x + h2 * x.u.z - h3 * x.u.y) / G,
            -2.0 * (-e0 * e1 + e3 * e2) + (-du.y + h3 * x.u.x - h1 * x.u.z) / G,
            -2.0 * (e0 * e0 + e3 * e3 - 0.5) + (-du.z + h1 * x.u.y - h2 * x.u.x) / G,
        );

        Ok(Control {
            t,
            gyro: f_mat * h,
            accel: f_mat * y,
        })
    }

    /// Ideal pitot, GPS and magnetometer measurements at time t. The
    /// magnetometer group is valid only when the scenario defines a
    /// nonzero field.
    pub fn measurement(&self, t: f64) -> Result<Measurement, ScenarioError> {
        let x = self.truth(t)?;
        let e_mat = rotation_fragments(&x.e);

        let mut m = Measurement::new();
        m.t = t;
        m.w_valid = true;
        m.w = e_mat * x.u + x.v;
        m.u_valid = true;
        m.u = x.u;
        m.m_valid = x.m.norm() > 0.0;
        m.mag = e_mat.transpose() * x.m;
        Ok(m)
    }

    /// The canonical scenario: a level two-revolution standard-rate turn
    /// at 120 kt with 10 s of straight flight on entry and exit, bank
    /// chosen so the centripetal acceleration matches G*tan(bank), and a
    /// touch of pitch to compensate the mush.
    pub fn standard_rate_turn() -> Scenario {
        let airspeed = 120.0;
        let bank = ((2.0 * PI * airspeed) / (G * 120.0)).atan();
        let mush = -airspeed * (PI / 90.0).sin() / bank.cos();
        let wind = Vector3::new(3.0, 4.0, 0.0);

        let times = [0.0, 10.0, 15.0, 255.0, 260.0, 270.0];
        let u3 = [0.0, 0.0, mush, mush, 0.0, 0.0];
        let phi = [0.0, 0.0, bank, bank, 0.0, 0.0];
        let theta = [0.0, 0.0, PI / 90.0, PI / 90.0, 0.0, 0.0];
        let psi = [0.0, 0.0, 0.0, 4.0 * PI, 4.0 * PI, 4.0 * PI];

        let frames = (0..times.len())
            .map(|i| {
                Keyframe::new(
                    times[i],
                    Vector3::new(airspeed, 0.0, u3[i]),
                    Vector3::new(phi[i], theta[i], psi[i]),
                    wind,
                )
            })
            .collect();
        Scenario::new(frames).expect("canonical scenario is well formed")
    }

    /// Straight-and-level flight at a fixed heading.
    pub fn level_flight(airspeed: f64, psi: f64, wind: Vector3<f64>, duration: f64) -> Scenario {
        let u = Vector3::new(airspeed, 0.0, 0.0);
        let att = Vector3::new(0.0, 0.0, psi);
        Scenario::new(vec![
            Keyframe::new(0.0, u, att, wind),
            Keyframe::new(duration, u, att, wind),
        ])
        .expect("level flight scenario is well formed")
    }
}

// ---------------------------------------------------------------------------
// NOISE INJECTION
// ---------------------------------------------------------------------------

/// Per-sensor Gaussian noise levels.
#[derive(Debug, Clone)]
pub struct NoiseConfig {
    /// Gyro noise, deg/s
    pub gyro_dps: f64,
    /// Accelerometer noise, G
    pub accel_g: f64,
    /// GPS speed noise, kt
    pub gps_kt: f64,
    /// Pitot airspeed noise, kt
    pub airspeed_kt: f64,
    /// Magnetometer noise, uT
    pub mag_ut: f64,
    pub seed: u64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gyro_dps: 0.0,
            accel_g: 0.0,
            gps_kt: 0.0,
            airspeed_kt: 0.0,
            mag_ut: 0.0,
            seed: 42,
        }
    }
}

pub struct NoiseInjector {
    cfg: NoiseConfig,
    rng: StdRng,
}

impl NoiseInjector {
    pub fn new(cfg: NoiseConfig) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self { cfg, rng }
    }

    fn jitter(&mut self, v: &mut Vector3<f64>, sd: f64) {
        if sd > 0.0 {
            let normal = Normal::new(0.0, sd).expect("noise stdev must be finite");
            v.x += normal.sample(&mut self.rng);
            v.y += normal.sample(&mut self.rng);
            v.z += normal.sample(&mut self.rng);
        }
    }

    pub fn perturb_control(&mut self, c: &mut Control) {
        let gyro_sd = self.cfg.gyro_dps * DEG; // control rates are rad/s
        self.jitter(&mut c.gyro, gyro_sd);
        let accel_sd = self.cfg.accel_g;
        self.jitter(&mut c.accel, accel_sd);
    }

    pub fn perturb_measurement(&mut self, m: &mut Measurement) {
        let (gps, air, mag) = (self.cfg.gps_kt, self.cfg.airspeed_kt, self.cfg.mag_ut);
        self.jitter(&mut m.w, gps);
        self.jitter(&mut m.u, air);
        self.jitter(&mut m.mag, mag);
    }
}
