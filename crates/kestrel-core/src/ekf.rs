//! Extended Kalman filter for the full aircraft kinematic state.
//!
//! The state couples the body-frame airspeed vector, attitude, angular
//! rates, the earth-frame magnetic field, wind and the biases of every
//! sensor, 32 scalars in all. Measurements are the 15 scalars delivered by
//! pitot, GPS, accelerometer, gyro and magnetometer; missing sensor groups
//! are expressed through a sentinel variance rather than a smaller
//! measurement vector, so the matrix shapes never change at runtime.

use nalgebra::{Matrix3, Quaternion, SMatrix, SVector, Vector3};

use crate::quaternion::rotation_fragments;

// ---------------------------------------------------------------------------
// CONFIGURATION
// ---------------------------------------------------------------------------

/// Acceleration due to gravity, kt/s.
pub const G: f64 = 32.1740 / 1.687810;

/// Sentinel variance for invalid sensor groups.
pub const BIG: f64 = 1e9;

/// Degrees to radians.
pub const DEG: f64 = std::f64::consts::PI / 180.0;

pub type StateCovariance = SMatrix<f64, 32, 32>;
type MeasurementJacobian = SMatrix<f64, 15, 32>;
type MeasurementNoise = SMatrix<f64, 15, 15>;
type Innovation = SVector<f64, 15>;

// ---------------------------------------------------------------------------
// STATUS
// ---------------------------------------------------------------------------

/// Outcome of a filter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Updated,
    SkippedOutdated,
    SingularMatrix,
}

// ---------------------------------------------------------------------------
// MEASUREMENT
// ---------------------------------------------------------------------------

/// One round of sensor readings.
///
/// Group order in the innovation vector: U (pitot), W (GPS), A (accel),
/// B (gyro), M (magnetometer). A false validity flag routes the group to
/// the sentinel variance so it carries essentially zero weight.
#[derive(Clone, Debug)]
pub struct Measurement {
    pub u_valid: bool,
    pub w_valid: bool,
    pub s_valid: bool,
    pub m_valid: bool,

    /// Measured airspeed, kt, aircraft frame
    pub u: Vector3<f64>,
    /// GPS velocity, kt, earth frame
    pub w: Vector3<f64>,
    /// Specific force, G, sensor frame
    pub a: Vector3<f64>,
    /// Angular rates, deg/s, sensor frame
    pub b: Vector3<f64>,
    /// Magnetic field, uT, sensor frame
    pub mag: Vector3<f64>,

    /// Timestamp, s
    pub t: f64,
}

impl Measurement {
    pub fn new() -> Self {
        Self {
            u_valid: false,
            w_valid: false,
            s_valid: false,
            m_valid: false,
            u: Vector3::zeros(),
            w: Vector3::zeros(),
            a: Vector3::zeros(),
            b: Vector3::zeros(),
            mag: Vector3::zeros(),
            t: 0.0,
        }
    }
}

impl Default for Measurement {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// STATE
// ---------------------------------------------------------------------------

/// Complete aircraft state estimate.
///
/// Covariance row/column order: U(0..3), Z(3..6), E(6..10), H(10..13),
/// N(13..16), V(16..19), C(19..22), F(22..26), D(26..29), L(29..32).
#[derive(Clone, Debug)]
pub struct State {
    /// Airspeed, kt, aircraft frame
    pub u: Vector3<f64>,
    /// Rate of change of airspeed, G, aircraft frame
    pub z: Vector3<f64>,
    /// Quaternion rotating the earth frame into the aircraft frame
    pub e: Quaternion<f64>,
    /// Angular rates, deg/s, aircraft frame
    pub h: Vector3<f64>,
    /// Earth's magnetic field, uT, earth frame
    pub n: Vector3<f64>,

    /// Windspeed, kt, earth frame
    pub v: Vector3<f64>,
    /// Accelerometer bias, G, sensor frame
    pub c: Vector3<f64>,
    /// Quaternion rotating the sensor frame into the aircraft frame
    pub f: Quaternion<f64>,
    /// Gyro bias, deg/s, sensor frame
    pub d: Vector3<f64>,
    /// Magnetometer bias, uT, sensor frame
    pub l: Vector3<f64>,

    /// Time of last update, s
    pub t: f64,

    /// State uncertainty covariance
    pub cov: StateCovariance,
    /// Process noise covariance per second
    pub process_noise: StateCovariance,

    // Rotation fragments cached from e and f; e_mat[(i,j)] maps
    // earth-frame i into aircraft-frame j, f_mat[(i,j)] maps sensor-frame
    // i into aircraft-frame j. Rebuilt on every normalize().
    e_mat: Matrix3<f64>,
    f_mat: Matrix3<f64>,
}

impl State {
    /// Initial state from the first valid measurement.
    pub fn initialize(m: &Measurement) -> State {
        // Diagonal of initial state uncertainties, squared into covariance
        let sigmas: [f64; 32] = [
            50.0, 5.0, 5.0, // U
            5.0, 2.0, 2.0, // Z
            0.5, 0.5, 0.5, 0.5, // E
            5.0, 5.0, 5.0, // H
            65.0, 65.0, 65.0, // N
            20.0, 20.0, 2.0, // V
            0.05, 0.05, 0.05, // C
            0.5, 0.5, 0.5, 0.5, // F
            0.1, 0.1, 0.1, // D
            10.0, 10.0, 10.0, // L
        ];
        let mut cov = StateCovariance::zeros();
        for (i, s) in sigmas.iter().enumerate() {
            cov[(i, i)] = s * s;
        }

        // Diagonal of process uncertainties per second, squared likewise
        let noise: [f64; 32] = [
            1.0, 0.1, 0.1, // U
            0.2, 0.2, 0.2, // Z
            0.05, 0.05, 0.05, 0.05, // E
            1.0, 1.0, 1.0, // H
            0.01, 0.01, 0.01, // N
            0.1, 0.1, 0.05, // V
            0.01 / 60.0, 0.01 / 60.0, 0.01 / 60.0, // C
            0.001 / 60.0, 0.001 / 60.0, 0.001 / 60.0, 0.001 / 60.0, // F
            0.1 / 60.0, 0.1 / 60.0, 0.1 / 60.0, // D
            0.01 / 60.0, 0.01 / 60.0, 0.01 / 60.0, // L
        ];
        let mut process_noise = StateCovariance::zeros();
        for (i, s) in noise.iter().enumerate() {
            process_noise[(i, i)] = s * s;
        }

        let mut s = State {
            u: Vector3::zeros(),
            z: Vector3::zeros(),
            e: Quaternion::new(0.0, 0.0, 0.0, 0.0),
            h: Vector3::zeros(),
            n: Vector3::zeros(),
            v: Vector3::zeros(),
            c: Vector3::zeros(),
            f: Quaternion::new(0.0, 0.0, 0.0, 0.0),
            d: Vector3::zeros(),
            l: Vector3::zeros(),
            t: m.t,
            cov,
            process_noise,
            e_mat: Matrix3::zeros(),
            f_mat: Matrix3::zeros(),
        };

        // Best guess at initial airspeed is initial groundspeed
        if m.w_valid {
            s.u.x = m.w.x.hypot(m.w.y);
            s.cov[(0, 0)] = 10.0 * 10.0;
            s.cov[(16, 16)] = 50.0; // matching uncertainty of windspeed
            s.cov[(17, 17)] = 50.0;
        }

        // Best guess at initial heading is initial track
        if m.w_valid && s.u.x > 5.0 {
            // Simplified half-angle formulae
            s.e.w = ((s.u.x + m.w.x) / (2.0 * s.u.x)).sqrt();
            s.e.k = ((s.u.x - m.w.x) / (2.0 * s.u.x)).sqrt();
            if m.w.y > 0.0 {
                s.e.k = -s.e.k;
            }
            for i in 6..10 {
                s.cov[(i, i)] = 0.1 * 0.1;
            }
        } else {
            // No groundspeed, so no idea which way we're pointing
            s.e.w = 1.0;
        }

        // Sensor assumed pointing forward and level until proven otherwise
        s.f.w = 1.0;

        s.normalize();

        if m.m_valid {
            // Earth-frame field that agrees with the current attitude
            s.n = s.e_mat * m.mag;
        }

        s
    }

    /// Renormalize both quaternions and rebuild the rotation caches.
    /// Called at every mutation boundary.
    pub fn normalize(&mut self) {
        self.e = self.e.normalize();
        self.f = self.f.normalize();
        self.e_mat = rotation_fragments(&self.e);
        self.f_mat = rotation_fragments(&self.f);
    }

    /// Cached earth->aircraft rotation fragments.
    pub fn earth_fragments(&self) -> &Matrix3<f64> {
        &self.e_mat
    }

    /// Cached sensor->aircraft rotation fragments.
    pub fn sensor_fragments(&self) -> &Matrix3<f64> {
        &self.f_mat
    }

    // =====================================================================
    // PREDICT
    // =====================================================================

    /// Propagate the state to time t.
    ///
    /// The Jacobian is evaluated on the pre-propagation state, then the
    /// nonlinear map is applied once, the quaternions renormalized and the
    /// rotation caches rebuilt.
    pub fn predict(&mut self, t: f64) {
        let dt = t - self.t;
        let f_jac = self.state_jacobian(dt);

        self.u += dt * self.z / G;

        let (e0, e1, e2, e3) = (self.e.w, self.e.i, self.e.j, self.e.k);
        let (h1, h2, h3) = (self.h.x, self.h.y, self.h.z);
        self.e.w += 0.5 * dt * (-h1 * e1 - h2 * e2 - h3 * e3) * DEG;
        self.e.i += 0.5 * dt * (h1 * e0 + h2 * e3 - h3 * e2) * DEG;
        self.e.j += 0.5 * dt * (-h1 * e3 + h2 * e0 + h3 * e1) * DEG;
        self.e.k += 0.5 * dt * (h1 * e2 - h2 * e1 + h3 * e0) * DEG;

        // All other state vectors are slowly-varying and unchanged

        self.normalize();
        self.t = t;

        self.cov = f_jac * self.cov * f_jac.transpose() + dt * self.process_noise;
        self.cov = (self.cov + self.cov.transpose()) * 0.5;
    }

    /// Jacobian of the propagation map over an interval dt.
    ///
    /// Identity outside the dU/dZ block and the quaternion-integration
    /// blocks dE/dE and dE/dH.
    fn state_jacobian(&self, dt: f64) -> StateCovariance {
        let mut jac = StateCovariance::identity();

        jac[(0, 3)] = dt / G; // U1/Z1
        jac[(1, 4)] = dt / G; // U2/Z2
        jac[(2, 5)] = dt / G; // U3/Z3

        let (e0, e1, e2, e3) = (self.e.w, self.e.i, self.e.j, self.e.k);
        let (h1, h2, h3) = (self.h.x, self.h.y, self.h.z);
        let k = 0.5 * dt * DEG;

        jac[(6, 7)] = -k * h1; // E0/E1
        jac[(6, 8)] = -k * h2; // E0/E2
        jac[(6, 9)] = -k * h3; // E0/E3

        jac[(7, 6)] = k * h1; // E1/E0
        jac[(7, 8)] = -k * h3; // E1/E2
        jac[(7, 9)] = k * h2; // E1/E3

        jac[(8, 6)] = k * h2; // E2/E0
        jac[(8, 7)] = k * h3; // E2/E1
        jac[(8, 9)] = -k * h1; // E2/E3

        jac[(9, 6)] = k * h3; // E3/E0
        jac[(9, 7)] = -k * h2; // E3/E1
        jac[(9, 8)] = k * h1; // E3/E2

        jac[(6, 10)] = -k * e1; // E0/H1
        jac[(6, 11)] = -k * e2; // E0/H2
        jac[(6, 12)] = -k * e3; // E0/H3

        jac[(7, 10)] = k * e0; // E1/H1
        jac[(7, 11)] = k * e3; // E1/H2
        jac[(7, 12)] = -k * e2; // E1/H3

        jac[(8, 10)] = -k * e3; // E2/H1
        jac[(8, 11)] = k * e0; // E2/H2
        jac[(8, 12)] = k * e1; // E2/H3

        jac[(9, 10)] = k * e2; // E3/H1
        jac[(9, 11)] = -k * e1; // E3/H2
        jac[(9, 12)] = k * e0; // E3/H3

        jac
    }

    // =====================================================================
    // MEASUREMENT MAP
    // =====================================================================

    /// Measurement the sensors would report if the current state were
    /// exact. Refreshes the rotation caches first.
    pub fn predict_measurement(&mut self) -> Measurement {
        self.normalize();

        let mut m = Measurement::new();

        m.w_valid = true;
        m.w = self.e_mat * self.u + self.v;

        m.u_valid = true;
        m.u = self.u;

        m.s_valid = true;
        // Pseudoforces from the non-inertial aircraft frame contaminate
        // the accelerometer with the gyro rates
        let gravity = self.e_mat.row(2).transpose();
        let a = -self.z + self.u.cross(&self.h).scale(-DEG / G) - gravity;
        m.a = self.f_mat.transpose() * a + self.c;

        m.b = self.f_mat.transpose() * self.h + self.d;

        m.m_valid = true;
        let m_aircraft = self.e_mat.transpose() * self.n + self.l;
        m.mag = self.f_mat.transpose() * m_aircraft + self.l;

        m.t = self.t;

        m
    }

    // =====================================================================
    // UPDATE
    // =====================================================================

    /// Apply the Kalman correction for a measurement.
    ///
    /// Invalid sensor groups get the sentinel variance and a zeroed
    /// innovation entry. If the innovation covariance cannot be inverted
    /// the update is skipped and the state left untouched.
    pub fn update(&mut self, m: &Measurement) -> FilterStatus {
        let z = self.predict_measurement();

        let mut y = Innovation::zeros();
        y[0] = m.u.x - z.u.x;
        y[1] = m.u.y - z.u.y;
        y[2] = m.u.z - z.u.z;
        y[3] = m.w.x - z.w.x;
        y[4] = m.w.y - z.w.y;
        y[5] = m.w.z - z.w.z;
        y[6] = m.a.x - z.a.x;
        y[7] = m.a.y - z.a.y;
        y[8] = m.a.z - z.a.z;
        y[9] = m.b.x - z.b.x;
        y[10] = m.b.y - z.b.y;
        y[11] = m.b.z - z.b.z;
        // Attitude is not corrected from the magnetometer: its Jacobian
        // rows are disabled, so the innovation entries are zeroed too.
        y[12] = 0.0;
        y[13] = 0.0;
        y[14] = 0.0;

        let h_jac = self.measurement_jacobian();

        let mut r = MeasurementNoise::zeros();
        if m.u_valid {
            r[(0, 0)] = 2.0;
        } else {
            y[0] = 0.0;
            r[(0, 0)] = BIG;
        }
        // Lateral and vertical airspeed rows bias toward coordinated
        // flight, so they keep a finite variance even without a pitot
        r[(1, 1)] = 25.0;
        r[(2, 2)] = 25.0;

        if m.w_valid {
            r[(3, 3)] = 0.2;
            r[(4, 4)] = 0.2;
            r[(5, 5)] = 0.2;
        } else {
            y[3] = 0.0;
            y[4] = 0.0;
            y[5] = 0.0;
            r[(3, 3)] = BIG;
            r[(4, 4)] = BIG;
            r[(5, 5)] = BIG;
        }

        if m.s_valid {
            r[(6, 6)] = 0.2;
            r[(7, 7)] = 0.2;
            r[(8, 8)] = 0.2;
            r[(9, 9)] = 1.0;
            r[(10, 10)] = 1.0;
            r[(11, 11)] = 1.0;
        } else {
            for i in 6..12 {
                y[i] = 0.0;
                r[(i, i)] = BIG;
            }
        }

        if m.m_valid {
            r[(12, 12)] = 5.0;
            r[(13, 13)] = 5.0;
            r[(14, 14)] = 5.0;
        } else {
            r[(12, 12)] = BIG;
            r[(13, 13)] = BIG;
            r[(14, 14)] = BIG;
        }

        let s_mat = h_jac * self.cov * h_jac.transpose() + r;
        let s_inv = match s_mat.try_inverse() {
            Some(inv) => inv,
            None => {
                tracing::warn!("innovation covariance is singular, skipping update");
                return FilterStatus::SingularMatrix;
            }
        };

        let k_gain = self.cov * h_jac.transpose() * s_inv;
        let dx = k_gain * y;
        self.apply_correction(&dx);

        self.cov = (StateCovariance::identity() - k_gain * h_jac) * self.cov;
        self.cov = (self.cov + self.cov.transpose()) * 0.5;

        self.t = m.t;
        self.normalize();
        FilterStatus::Updated
    }

    fn apply_correction(&mut self, dx: &SVector<f64, 32>) {
        self.u.x += dx[0];
        self.u.y += dx[1];
        self.u.z += dx[2];
        self.z.x += dx[3];
        self.z.y += dx[4];
        self.z.z += dx[5];
        self.e.w += dx[6];
        self.e.i += dx[7];
        self.e.j += dx[8];
        self.e.k += dx[9];
        self.h.x += dx[10];
        self.h.y += dx[11];
        self.h.z += dx[12];
        self.n.x += dx[13];
        self.n.y += dx[14];
        self.n.z += dx[15];
        self.v.x += dx[16];
        self.v.y += dx[17];
        self.v.z += dx[18];
        self.c.x += dx[19];
        self.c.y += dx[20];
        self.c.z += dx[21];
        self.f.w += dx[22];
        self.f.i += dx[23];
        self.f.j += dx[24];
        self.f.k += dx[25];
        self.d.x += dx[26];
        self.d.y += dx[27];
        self.d.z += dx[28];
        self.l.x += dx[29];
        self.l.y += dx[30];
        self.l.z += dx[31];
    }

    /// Jacobian of the measurement map at the current state.
    ///
    /// Row order U, W, A, B, M; column order as the state covariance. The
    /// magnetometer rows are zero: see `update`.
    fn measurement_jacobian(&self) -> MeasurementJacobian {
        let (e0, e1, e2, e3) = (self.e.w, self.e.i, self.e.j, self.e.k);
        let (f0, f1, f2, f3) = (self.f.w, self.f.i, self.f.j, self.f.k);
        let (u1, u2, u3) = (self.u.x, self.u.y, self.u.z);
        let (h1, h2, h3) = (self.h.x, self.h.y, self.h.z);
        let e = &self.e_mat;
        let f = &self.f_mat;
        let (f11, f12, f13) = (f[(0, 0)], f[(0, 1)], f[(0, 2)]);
        let (f21, f22, f23) = (f[(1, 0)], f[(1, 1)], f[(1, 2)]);
        let (f31, f32, f33) = (f[(2, 0)], f[(2, 1)], f[(2, 2)]);

        let mut jac = MeasurementJacobian::zeros();

        jac[(0, 0)] = 1.0; // U1/U1
        jac[(1, 1)] = 1.0; // U2/U2
        jac[(2, 2)] = 1.0; // U3/U3

        jac[(3, 0)] = e[(0, 0)]; // W1/U1
        jac[(3, 1)] = e[(0, 1)]; // W1/U2
        jac[(3, 2)] = e[(0, 2)]; // W1/U3
        jac[(3, 6)] = 2.0 * (e0 * u1 + e3 * u2 - e2 * u3); // W1/E0
        jac[(3, 7)] = 2.0 * (e1 * u1 + e2 * u2 + e3 * u3); // W1/E1
        jac[(3, 8)] = 2.0 * (-e2 * u1 + e1 * u2 - e0 * u3); // W1/E2
        jac[(3, 9)] = 2.0 * (-e3 * u1 + e0 * u2 + e1 * u3); // W1/E3
        jac[(3, 16)] = 1.0; // W1/V1

        jac[(4, 0)] = e[(1, 0)]; // W2/U1
        jac[(4, 1)] = e[(1, 1)]; // W2/U2
        jac[(4, 2)] = e[(1, 2)]; // W2/U3
        jac[(4, 6)] = 2.0 * (-e3 * u1 + e0 * u2 + e1 * u3); // W2/E0
        jac[(4, 7)] = 2.0 * (e2 * u1 - e1 * u2 + e0 * u3); // W2/E1
        jac[(4, 8)] = 2.0 * (e1 * u1 + e2 * u2 + e3 * u3); // W2/E2
        jac[(4, 9)] = 2.0 * (-e0 * u1 - e3 * u2 + e2 * u3); // W2/E3
        jac[(4, 17)] = 1.0; // W2/V2

        jac[(5, 0)] = e[(2, 0)]; // W3/U1
        jac[(5, 1)] = e[(2, 1)]; // W3/U2
        jac[(5, 2)] = e[(2, 2)]; // W3/U3
        jac[(5, 6)] = 2.0 * (e2 * u1 - e1 * u2 + e0 * u3); // W3/E0
        jac[(5, 7)] = 2.0 * (e3 * u1 - e0 * u2 - e1 * u3); // W3/E1
        jac[(5, 8)] = 2.0 * (e0 * u1 + e3 * u2 - e2 * u3); // W3/E2
        jac[(5, 9)] = 2.0 * (e1 * u1 + e2 * u2 + e3 * u3); // W3/E3
        jac[(5, 18)] = 1.0; // W3/V3

        let a1 = -self.z.x + (h2 * u3 - h3 * u2) * DEG / G - e[(2, 0)];
        let a2 = -self.z.y + (h3 * u1 - h1 * u3) * DEG / G - e[(2, 1)];
        let a3 = -self.z.z + (h1 * u2 - h2 * u1) * DEG / G - e[(2, 2)];

        // A1 = a1*f11 + a2*f21 + a3*f31 + C1
        jac[(6, 0)] = (h3 * f21 - h2 * f31) * DEG / G; // A1/U1
        jac[(6, 1)] = (h1 * f31 - h3 * f11) * DEG / G; // A1/U2
        jac[(6, 2)] = (h2 * f11 - h1 * f21) * DEG / G; // A1/U3
        jac[(6, 3)] = -f11; // A1/Z1
        jac[(6, 4)] = -f21; // A1/Z2
        jac[(6, 5)] = -f31; // A1/Z3
        jac[(6, 6)] = -2.0 * (e2 * f11 - e1 * f21 + e0 * f31); // A1/E0
        jac[(6, 7)] = -2.0 * (e3 * f11 - e0 * f21 - e1 * f31); // A1/E1
        jac[(6, 8)] = -2.0 * (e0 * f11 + e3 * f21 - e2 * f31); // A1/E2
        jac[(6, 9)] = -2.0 * (e1 * f11 + e2 * f21 + e3 * f31); // A1/E3
        jac[(6, 10)] = (u2 * f31 - u3 * f21) * DEG / G; // A1/H1
        jac[(6, 11)] = (u3 * f11 - u1 * f31) * DEG / G; // A1/H2
        jac[(6, 12)] = (u1 * f21 - u2 * f11) * DEG / G; // A1/H3
        jac[(6, 19)] = 1.0; // A1/C1
        jac[(6, 22)] = 2.0 * (f0 * a1 - f3 * a2 + f2 * a3); // A1/F0
        jac[(6, 23)] = 2.0 * (f1 * a1 + f2 * a2 + f3 * a3); // A1/F1
        jac[(6, 24)] = 2.0 * (-f2 * a1 + f1 * a2 + f0 * a3); // A1/F2
        jac[(6, 25)] = 2.0 * (-f3 * a1 - f0 * a2 + f1 * a3); // A1/F3

        // A2 = a1*f12 + a2*f22 + a3*f32 + C2
        jac[(7, 0)] = (h3 * f22 - h2 * f32) * DEG / G; // A2/U1
        jac[(7, 1)] = (h1 * f32 - h3 * f12) * DEG / G; // A2/U2
        jac[(7, 2)] = (h2 * f12 - h1 * f22) * DEG / G; // A2/U3
        jac[(7, 3)] = -f12; // A2/Z1
        jac[(7, 4)] = -f22; // A2/Z2
        jac[(7, 5)] = -f32; // A2/Z3
        jac[(7, 6)] = -2.0 * (e2 * f12 - e1 * f22 + e0 * f32); // A2/E0
        jac[(7, 7)] = -2.0 * (e3 * f12 - e0 * f22 - e1 * f32); // A2/E1
        jac[(7, 8)] = -2.0 * (e0 * f12 + e3 * f22 - e2 * f32); // A2/E2
        jac[(7, 9)] = -2.0 * (e1 * f12 + e2 * f22 + e3 * f32); // A2/E3
        jac[(7, 10)] = (u2 * f32 - u3 * f22) * DEG / G; // A2/H1
        jac[(7, 11)] = (u3 * f12 - u1 * f32) * DEG / G; // A2/H2
        jac[(7, 12)] = (u1 * f22 - u2 * f12) * DEG / G; // A2/H3
        jac[(7, 20)] = 1.0; // A2/C2
        jac[(7, 22)] = 2.0 * (f3 * a1 + f0 * a2 - f1 * a3); // A2/F0
        jac[(7, 23)] = 2.0 * (f2 * a1 - f1 * a2 - f0 * a3); // A2/F1
        jac[(7, 24)] = 2.0 * (f1 * a1 + f2 * a2 + f3 * a3); // A2/F2
        jac[(7, 25)] = 2.0 * (f0 * a1 - f3 * a2 + f2 * a3); // A2/F3

        // A3 = a1*f13 + a2*f23 + a3*f33 + C3
        jac[(8, 0)] = (h3 * f23 - h2 * f33) * DEG / G; // A3/U1
        jac[(8, 1)] = (h1 * f33 - h3 * f13) * DEG / G; // A3/U2
        jac[(8, 2)] = (h2 * f13 - h1 * f23) * DEG / G; // A3/U3
        jac[(8, 3)] = -f13; // A3/Z1
        jac[(8, 4)] = -f23; // A3/Z2
        jac[(8, 5)] = -f33; // A3/Z3
        jac[(8, 6)] = -2.0 * (e2 * f13 - e1 * f23 + e0 * f33); // A3/E0
        jac[(8, 7)] = -2.0 * (e3 * f13 - e0 * f23 - e1 * f33); // A3/E1
        jac[(8, 8)] = -2.0 * (e0 * f13 + e3 * f23 - e2 * f33); // A3/E2
        jac[(8, 9)] = -2.0 * (e1 * f13 + e2 * f23 + e3 * f33); // A3/E3
        jac[(8, 10)] = (u2 * f33 - u3 * f23) * DEG / G; // A3/H1
        jac[(8, 11)] = (u3 * f13 - u1 * f33) * DEG / G; // A3/H2
        jac[(8, 12)] = (u1 * f23 - u2 * f13) * DEG / G; // A3/H3
        jac[(8, 21)] = 1.0; // A3/C3
        jac[(8, 22)] = 2.0 * (-f2 * a1 + f1 * a2 + f0 * a3); // A3/F0
        jac[(8, 23)] = 2.0 * (f3 * a1 + f0 * a2 - f1 * a3); // A3/F1
        jac[(8, 24)] = 2.0 * (-f0 * a1 + f3 * a2 - f2 * a3); // A3/F2
        jac[(8, 25)] = 2.0 * (f1 * a1 + f2 * a2 + f3 * a3); // A3/F3

        // B1 = H1*f11 + H2*f21 + H3*f31 + D1
        jac[(9, 10)] = f11; // B1/H1
        jac[(9, 11)] = f21; // B1/H2
        jac[(9, 12)] = f31; // B1/H3
        jac[(9, 26)] = 1.0; // B1/D1

        // B2 = H1*f12 + H2*f22 + H3*f32 + D2
        jac[(10, 10)] = f12; // B2/H1
        jac[(10, 11)] = f22; // B2/H2
        jac[(10, 12)] = f32; // B2/H3
        jac[(10, 27)] = 1.0; // B2/D2

        // B3 = H1*f13 + H2*f23 + H3*f33 + D3
        jac[(11, 10)] = f13; // B3/H1
        jac[(11, 11)] = f23; // B3/H2
        jac[(11, 12)] = f33; // B3/H3
        jac[(11, 28)] = 1.0; // B3/D3

        // Magnetometer rows 12..14 stay zero

        jac
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quaternion::from_quaternion;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    fn level_east_measurement(speed: f64) -> Measurement {
        let mut m = Measurement::new();
        m.w_valid = true;
        m.w = Vector3::new(speed, 0.0, 0.0);
        m.u_valid = true;
        m.u = Vector3::new(speed, 0.0, 0.0);
        m.s_valid = true;
        m.a = Vector3::new(0.0, 0.0, -1.0);
        m.b = Vector3::zeros();
        m.t = 0.0;
        m
    }

    #[test]
    fn test_initialize_heading_from_track() {
        // Groundspeed along earth axis 1 is the identity attitude
        let s = State::initialize(&level_east_measurement(120.0));
        assert_relative_eq!(s.u.x, 120.0, epsilon = 1e-9);
        assert_relative_eq!(s.e.w, 1.0, epsilon = 1e-9);
        assert_relative_eq!(s.e.k, 0.0, epsilon = 1e-9);

        // Groundspeed along earth axis 2 means heading north
        let mut m = Measurement::new();
        m.w_valid = true;
        m.w = Vector3::new(0.0, 120.0, 0.0);
        m.t = 0.0;
        let s = State::initialize(&m);
        let (_, _, psi) = from_quaternion(&s.e);
        assert!(psi.abs() < 1e-9 || (psi - 2.0 * std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn test_initialize_without_gps() {
        let mut m = Measurement::new();
        m.t = 1.5;
        let s = State::initialize(&m);
        assert_relative_eq!(s.e.w, 1.0, epsilon = 1e-12);
        assert_relative_eq!(s.f.w, 1.0, epsilon = 1e-12);
        assert_eq!(s.t, 1.5);
        // Airspeed uncertainty stays wide
        assert_relative_eq!(s.cov[(0, 0)], 2500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_initialize_field_from_magnetometer() {
        let mut m = level_east_measurement(120.0);
        m.m_valid = true;
        m.mag = Vector3::new(10.0, 20.0, -40.0);
        let s = State::initialize(&m);
        // Identity attitude: earth field equals the body reading
        assert_relative_eq!(s.n, m.mag, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_keeps_quaternions_unit() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        s.h = Vector3::new(12.0, -4.0, 30.0);
        s.z = Vector3::new(0.1, 0.0, -0.05);
        for i in 1..200 {
            s.predict(i as f64 * 0.1);
            assert!((s.e.norm() - 1.0).abs() < 1e-6);
            assert!((s.f.norm() - 1.0).abs() < 1e-6);
        }
        assert_relative_eq!(s.t, 19.9, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_integrates_airspeed() {
        let mut s = State::initialize(&level_east_measurement(100.0));
        s.z = Vector3::new(0.5, 0.0, 0.0); // G along the nose
        s.predict(2.0);
        assert_relative_eq!(s.u.x, 100.0 + 2.0 * 0.5 / G, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_grows_covariance() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        let before = s.cov[(16, 16)];
        s.predict(10.0);
        assert!(s.cov[(16, 16)] > before);
    }

    #[test]
    fn test_update_converges_on_truth() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        for i in 1..100 {
            let t = i as f64 * 0.1;
            s.predict(t);
            let mut m = level_east_measurement(120.0);
            m.t = t;
            assert_eq!(s.update(&m), FilterStatus::Updated);
        }
        let (phi, theta, psi) = from_quaternion(&s.e);
        assert!(phi.abs() < 0.01);
        assert!(theta.abs() < 0.01);
        assert!((psi - FRAC_PI_2).abs() < 0.01);
        assert_relative_eq!(s.u.x, 120.0, epsilon = 0.5);
    }

    #[test]
    fn test_update_covariance_symmetric_nonnegative() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        for i in 1..50 {
            let t = i as f64 * 0.1;
            s.predict(t);
            let mut m = level_east_measurement(120.0);
            m.t = t;
            s.update(&m);
            for r in 0..32 {
                assert!(s.cov[(r, r)] >= 0.0, "negative variance at {r}");
                for c in 0..32 {
                    assert!((s.cov[(r, c)] - s.cov[(c, r)]).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_update_all_sensors_invalid_leaves_state() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        s.predict(0.1);

        // A measurement that matches the prediction exactly but carries no
        // valid groups: every innovation entry is either zeroed by the
        // validity policy or identically zero, so the state must not move.
        let mut m = s.clone().predict_measurement();
        m.u_valid = false;
        m.w_valid = false;
        m.s_valid = false;
        m.m_valid = false;
        m.t = 0.2;

        let before = s.clone();
        let status = s.update(&m);
        assert_eq!(status, FilterStatus::Updated);
        assert_relative_eq!(s.u, before.u, epsilon = 1e-9);
        assert_relative_eq!(s.v, before.v, epsilon = 1e-9);
        assert_relative_eq!(s.e.w, before.e.w, epsilon = 1e-9);
        assert_relative_eq!(s.e.k, before.e.k, epsilon = 1e-9);
        assert_eq!(s.t, 0.2);
    }

    #[test]
    fn test_magnetometer_never_moves_attitude() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        s.predict(0.1);

        let mut m = s.clone().predict_measurement();
        m.u_valid = false;
        m.w_valid = false;
        m.s_valid = false;
        m.m_valid = true;
        m.mag = Vector3::new(500.0, -300.0, 200.0); // wildly off the prediction
        m.t = 0.2;

        let before = s.clone();
        s.update(&m);
        assert_relative_eq!(s.e.w, before.e.w, epsilon = 1e-9);
        assert_relative_eq!(s.e.i, before.e.i, epsilon = 1e-9);
        assert_relative_eq!(s.e.j, before.e.j, epsilon = 1e-9);
        assert_relative_eq!(s.e.k, before.e.k, epsilon = 1e-9);
        assert_relative_eq!(s.n, before.n, epsilon = 1e-9);
    }

    #[test]
    fn test_predict_measurement_level_flight() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        let z = s.predict_measurement();
        assert_relative_eq!(z.u.x, 120.0, epsilon = 1e-9);
        assert_relative_eq!(z.w.x, 120.0, epsilon = 1e-9);
        assert_relative_eq!(z.w.y, 0.0, epsilon = 1e-9);
        // At rest attitude the accelerometer feels 1G toward the ground
        assert_relative_eq!(z.a.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(z.a.y, 0.0, epsilon = 1e-9);
        assert_relative_eq!(z.a.z, -1.0, epsilon = 1e-9);
        assert_relative_eq!(z.b.norm(), 0.0, epsilon = 1e-9);
    }

    fn measurement_vector(m: &Measurement) -> [f64; 15] {
        [
            m.u.x, m.u.y, m.u.z, m.w.x, m.w.y, m.w.z, m.a.x, m.a.y, m.a.z, m.b.x, m.b.y, m.b.z,
            m.mag.x, m.mag.y, m.mag.z,
        ]
    }

    fn perturbed(s: &State, dx: &SVector<f64, 32>) -> [f64; 15] {
        let mut sp = s.clone();
        sp.apply_correction(dx);
        measurement_vector(&sp.predict_measurement())
    }

    /// The measurement Jacobian against numerical differentiation of the
    /// measurement map. Quaternion slots are perturbed along directions
    /// tangent to the unit sphere, since the map renormalizes its input.
    /// The disabled magnetometer rows are excluded.
    #[test]
    fn test_measurement_jacobian_matches_finite_differences() {
        use crate::quaternion::to_quaternion;

        let mut s = State::initialize(&level_east_measurement(110.0));
        s.u = Vector3::new(110.0, -8.0, 5.0);
        s.z = Vector3::new(0.1, -0.2, 0.05);
        s.e = to_quaternion(0.3, -0.2, 1.1);
        s.h = Vector3::new(10.0, -20.0, 15.0);
        s.n = Vector3::new(10.0, 20.0, -40.0);
        s.v = Vector3::new(3.0, 4.0, -1.0);
        s.c = Vector3::new(0.01, -0.02, 0.03);
        s.f = to_quaternion(0.02, 0.01, FRAC_PI_2 + 0.03);
        s.d = Vector3::new(0.5, -0.2, 0.1);
        s.l = Vector3::new(1.0, -2.0, 3.0);
        s.normalize();

        let jac = s.measurement_jacobian();
        let h0 = measurement_vector(&s.clone().predict_measurement());
        let eps = 1e-7;

        // Plain vector slots
        for col in (0..32).filter(|c| !(6..10).contains(c) && !(22..26).contains(c)) {
            let mut dx = SVector::<f64, 32>::zeros();
            dx[col] = eps;
            let h1 = perturbed(&s, &dx);
            for row in 0..12 {
                let fd = (h1[row] - h0[row]) / eps;
                assert!(
                    (fd - jac[(row, col)]).abs() < 1e-4 * (1.0 + jac[(row, col)].abs()),
                    "row {row} col {col}: fd {fd} vs jac {}",
                    jac[(row, col)]
                );
            }
        }

        // Quaternion slots: directions tangent to the unit sphere
        for (base, q) in [(6, s.e), (22, s.f)] {
            let qv = [q.w, q.i, q.j, q.k];
            for k in 0..4 {
                let mut dir = [0.0; 4];
                dir[k] = 1.0;
                let dot: f64 = (0..4).map(|i| dir[i] * qv[i]).sum();
                for i in 0..4 {
                    dir[i] -= dot * qv[i];
                }
                let norm: f64 = dir.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm < 1e-9 {
                    continue;
                }
                let mut dx = SVector::<f64, 32>::zeros();
                for i in 0..4 {
                    dx[base + i] = dir[i] / norm * eps;
                }
                let h1 = perturbed(&s, &dx);
                for row in 0..12 {
                    let fd = (h1[row] - h0[row]) / eps;
                    let expected: f64 =
                        (0..4).map(|i| jac[(row, base + i)] * dir[i] / norm).sum();
                    assert!(
                        (fd - expected).abs() < 1e-4 * (1.0 + expected.abs()),
                        "row {row} quat base {base} dir {k}: fd {fd} vs {expected}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_fragment_caches_follow_quaternion() {
        let mut s = State::initialize(&level_east_measurement(120.0));
        s.h = Vector3::new(0.0, 0.0, 10.0);
        s.predict(1.0);
        let expected = rotation_fragments(&s.e);
        assert_relative_eq!(*s.earth_fragments(), expected, epsilon = 1e-12);
    }
}
