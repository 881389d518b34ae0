//! Quaternion and frame algebra shared by the filter and the simulator.
//!
//! Tait-Bryan convention: phi positive rolls right, theta positive pitches
//! up, psi = 0 points north and increases eastward. The half-angle
//! formulae therefore negate phi and subtract pi/2 from psi before the
//! standard expansion.

use nalgebra::{Matrix3, Quaternion};
use std::f64::consts::{FRAC_PI_2, PI};

/// Quaternion for the Tait-Bryan angles (phi, theta, psi).
pub fn to_quaternion(phi: f64, theta: f64, psi: f64) -> Quaternion<f64> {
    let phi = -phi;
    let psi = psi - FRAC_PI_2;

    let cphi = (phi / 2.0).cos();
    let sphi = (phi / 2.0).sin();
    let ctheta = (theta / 2.0).cos();
    let stheta = (theta / 2.0).sin();
    let cpsi = (psi / 2.0).cos();
    let spsi = (psi / 2.0).sin();

    Quaternion::new(
        cphi * ctheta * cpsi - sphi * stheta * spsi,
        sphi * ctheta * cpsi + cphi * stheta * spsi,
        cphi * stheta * cpsi - sphi * ctheta * spsi,
        cphi * ctheta * spsi + sphi * stheta * cpsi,
    )
}

/// Tait-Bryan angles (phi, theta, psi) for a quaternion.
/// psi is wrapped into [0, 2*pi).
pub fn from_quaternion(q: &Quaternion<f64>) -> (f64, f64, f64) {
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);
    let phi = (-2.0 * (q0 * q1 - q2 * q3)).atan2(q0 * q0 - q1 * q1 - q2 * q2 + q3 * q3);
    let theta =
        (2.0 * (q0 * q2 + q3 * q1) / (q0 * q0 + q1 * q1 + q2 * q2 + q3 * q3).sqrt()).asin();
    let mut psi = FRAC_PI_2 + (2.0 * (q0 * q3 - q1 * q2)).atan2(q0 * q0 + q1 * q1 - q2 * q2 - q3 * q3);
    if psi < -1e-4 {
        psi += 2.0 * PI;
    }
    (phi, theta, psi)
}

/// Rotation fragments r_ij for a unit quaternion rotating frame A into
/// frame B: entry (i, j) maps frame-A component i into frame-B component j,
/// so frameB_j = sum_i r_ij * frameA_i.
pub fn rotation_fragments(q: &Quaternion<f64>) -> Matrix3<f64> {
    let (q0, q1, q2, q3) = (q.w, q.i, q.j, q.k);
    Matrix3::new(
        2.0 * (q0 * q0 + q1 * q1 - 0.5),
        2.0 * (q0 * q3 + q1 * q2),
        2.0 * (-q0 * q2 + q1 * q3),
        2.0 * (-q0 * q3 + q2 * q1),
        2.0 * (q0 * q0 + q2 * q2 - 0.5),
        2.0 * (q0 * q1 + q2 * q3),
        2.0 * (q0 * q2 + q3 * q1),
        2.0 * (-q0 * q1 + q3 * q2),
        2.0 * (q0 * q0 + q3 * q3 - 0.5),
    )
}
