//! Online magnetometer hard/soft-iron calibration.
//!
//! Tracks running per-axis minima and maxima of the raw field readings.
//! The hard-iron offset of an axis is the midpoint of its range and the
//! soft-iron scale is half the range, so a calibrated sample approaches
//! unit magnitude once the aircraft has rotated through enough attitudes.
//! Offsets and scales are live values and keep drifting as new attitudes
//! are covered.

use nalgebra::Vector3;
use serde::Serialize;

/// Exponential smoothing factor for reported values. The raw estimate fed
/// to the filter is never smoothed.
const SMOOTHING: f64 = 0.9;

pub struct MagCalibrator {
    min: Vector3<f64>,
    max: Vector3<f64>,
    samples: usize,
    smoothed_offset: Option<Vector3<f64>>,
    smoothed_scale: Option<Vector3<f64>>,
}

impl MagCalibrator {
    pub fn new() -> Self {
        Self {
            min: Vector3::repeat(f64::INFINITY),
            max: Vector3::repeat(f64::NEG_INFINITY),
            samples: 0,
            smoothed_offset: None,
            smoothed_scale: None,
        }
    }

    /// Fold one raw field reading into the per-axis ranges.
    pub fn observe(&mut self, raw: Vector3<f64>) {
        self.min = self.min.inf(&raw);
        self.max = self.max.sup(&raw);
        self.samples += 1;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// True once every axis has seen a nonzero range.
    pub fn covered(&self) -> bool {
        self.samples > 0 && (self.max - self.min).iter().all(|r| *r > 0.0)
    }

    /// Per-axis hard-iron offset: the midpoint of the observed range.
    pub fn offset(&self) -> Vector3<f64> {
        if self.samples == 0 {
            return Vector3::zeros();
        }
        (self.min + self.max) * 0.5
    }

    /// Per-axis soft-iron scale: half the observed range. Degenerate axes
    /// report 1 so calibration never divides by zero.
    pub fn scale(&self) -> Vector3<f64> {
        if self.samples == 0 {
            return Vector3::repeat(1.0);
        }
        ((self.max - self.min) * 0.5).map(|s| if s > f64::EPSILON { s } else { 1.0 })
    }

    /// Apply the current calibration to a raw reading.
    pub fn calibrated(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        (raw - self.offset()).component_div(&self.scale())
    }

    /// Build the wire record for a raw reading, advancing the smoothed
    /// display values.
    pub fn report(&mut self, raw: Vector3<f64>) -> MagReport {
        let raw_offset = self.offset();
        let raw_scale = self.scale();
        let offset = smooth(&mut self.smoothed_offset, raw_offset);
        let scale = smooth(&mut self.smoothed_scale, raw_scale);

        let cal = (raw - offset).component_div(&scale);
        let (hdg, dip) = heading_dip(&cal);
        let (hdg_raw, dip_raw) = heading_dip(&raw);

        MagReport {
            m1: cal.x,
            m2: cal.y,
            m3: cal.z,
            o1: offset.x,
            o2: offset.y,
            o3: offset.z,
            s1: scale.x,
            s2: scale.y,
            s3: scale.z,
            hdg: round1(hdg),
            dip: round1(dip),
            hdg_raw: round1(hdg_raw),
            dip_raw: round1(dip_raw),
            mm1: raw.x,
            mm2: raw.y,
            mm3: raw.z,
            a3: if self.covered() { 1.0 } else { 0.0 },
        }
    }
}

impl Default for MagCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

fn smooth(prev: &mut Option<Vector3<f64>>, new: Vector3<f64>) -> Vector3<f64> {
    let out = match prev {
        Some(p) => *p * SMOOTHING + new * (1.0 - SMOOTHING),
        None => new,
    };
    *prev = Some(out);
    out
}

/// Magnetic heading and dip angle, degrees, from a body-frame field
/// vector. Heading is wrapped into [0, 360).
fn heading_dip(m: &Vector3<f64>) -> (f64, f64) {
    let mut hdg = m.y.atan2(m.x).to_degrees();
    if hdg < 0.0 {
        hdg += 360.0;
    }
    let dip = (-m.z).atan2(m.x.hypot(m.y)).to_degrees();
    (hdg, dip)
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// One record of the calibration output stream.
#[derive(Debug, Clone, Serialize)]
pub struct MagReport {
    /// Calibrated field components
    #[serde(rename = "M1")]
    pub m1: f64,
    #[serde(rename = "M2")]
    pub m2: f64,
    #[serde(rename = "M3")]
    pub m3: f64,
    /// Smoothed hard-iron offsets
    #[serde(rename = "O1")]
    pub o1: f64,
    #[serde(rename = "O2")]
    pub o2: f64,
    #[serde(rename = "O3")]
    pub o3: f64,
    /// Smoothed soft-iron scales
    #[serde(rename = "S1")]
    pub s1: f64,
    #[serde(rename = "S2")]
    pub s2: f64,
    #[serde(rename = "S3")]
    pub s3: f64,
    /// Heading and dip from the calibrated field, degrees
    #[serde(rename = "HDG")]
    pub hdg: f64,
    #[serde(rename = "DIP")]
    pub dip: f64,
    /// Heading and dip from the raw field, degrees
    #[serde(rename = "HDGRaw")]
    pub hdg_raw: f64,
    #[serde(rename = "DIPRaw")]
    pub dip_raw: f64,
    /// Raw field components
    #[serde(rename = "MM1")]
    pub mm1: f64,
    #[serde(rename = "MM2")]
    pub mm2: f64,
    #[serde(rename = "MM3")]
    pub mm3: f64,
    /// Coverage flag
    #[serde(rename = "A3")]
    pub a3: f64,
}
