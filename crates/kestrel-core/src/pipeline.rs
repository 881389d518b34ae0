//! Sensor acquisition and fusion pipeline.
//!
//! Two logical threads share one mutex: a reader that polls the sensor
//! source at the hardware rate and accumulates raw sums, and a fusion
//! loop that snapshots the accumulated averages at the (slower) filter
//! rate and advances the EKF. Transient bus errors drop the sample and
//! keep going; the filter coasts on process noise alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nalgebra::Vector3;
use thiserror::Error;

use crate::ekf::{FilterStatus, Measurement, State};

/// Calibration rejection threshold for per-axis gyro variance, (deg/s)^2.
pub const MAX_GYRO_VAR: f64 = 10.0;
/// Calibration rejection threshold for per-axis accel variance, G^2.
pub const MAX_ACCEL_VAR: f64 = 0.01;

/// Errors from the sensor pipeline.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor bus error: {0}")]
    Bus(String),
    #[error("no samples accumulated since the last snapshot")]
    NoSamples,
    #[error(
        "sensor was not inertial during calibration: variance {variance:.4} exceeds {limit:.4}"
    )]
    CalibrationRejected { variance: f64, limit: f64 },
    #[error("sensor configuration failed: {0}")]
    Config(String),
}

/// One raw reading from the sensor source.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    /// Monotonic timestamp, ns
    pub t_ns: u64,
    /// Angular rates, deg/s, sensor frame
    pub gyro: Vector3<f64>,
    /// Specific force, G, sensor frame
    pub accel: Vector3<f64>,
    /// Magnetic field, uT, sensor frame; None when the magnetometer
    /// read failed or is absent
    pub mag: Option<Vector3<f64>>,
}

/// Abstract source of timestamped raw sensor samples. Implemented by the
/// hardware driver; the pipeline never sees the bus.
pub trait SensorSource: Send {
    /// Read one raw sample. Called at the hardware sample rate.
    fn sample(&mut self) -> Result<RawSample, SensorError>;

    fn set_sample_rate(&mut self, hz: u32) -> Result<(), SensorError> {
        let _ = hz;
        Ok(())
    }

    fn set_lpf(&mut self, hz: u32) -> Result<(), SensorError> {
        let _ = hz;
        Ok(())
    }

    /// Release the bus. Called once, after the last transaction.
    fn close(&mut self) {}
}

/// Averages accumulated between two snapshots.
#[derive(Debug, Clone, Copy)]
pub struct AveragedSample {
    /// Timestamp of the newest contributing sample, s
    pub t: f64,
    pub gyro: Vector3<f64>,
    pub accel: Vector3<f64>,
    pub mag: Option<Vector3<f64>>,
}

struct Accumulator {
    gyro: Vector3<f64>,
    accel: Vector3<f64>,
    mag: Vector3<f64>,
    n: u32,
    nm: u32,
    t_ns: u64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            gyro: Vector3::zeros(),
            accel: Vector3::zeros(),
            mag: Vector3::zeros(),
            n: 0,
            nm: 0,
            t_ns: 0,
        }
    }

    fn add(&mut self, s: &RawSample, gyro_bias: &Vector3<f64>, accel_bias: &Vector3<f64>) {
        self.gyro += s.gyro - gyro_bias;
        self.accel += s.accel - accel_bias;
        self.n += 1;
        if let Some(m) = s.mag {
            self.mag += m;
            self.nm += 1;
        }
        self.t_ns = s.t_ns;
    }

    /// Averages since the last snapshot; resets the accumulators either way.
    fn snapshot(&mut self) -> Result<AveragedSample, SensorError> {
        let out = if self.n > 0 {
            Ok(AveragedSample {
                t: self.t_ns as f64 * 1e-9,
                gyro: self.gyro / f64::from(self.n),
                accel: self.accel / f64::from(self.n),
                mag: (self.nm > 0).then(|| self.mag / f64::from(self.nm)),
            })
        } else {
            Err(SensorError::NoSamples)
        };
        *self = Accumulator::new();
        out
    }
}

struct HubShared {
    source: Box<dyn SensorSource>,
    accum: Accumulator,
    gyro_bias: Vector3<f64>,
    accel_bias: Vector3<f64>,
}

/// Owns the sensor reader thread and the shared accumulator.
pub struct SensorHub {
    shared: Arc<Mutex<HubShared>>,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    sample_rate_hz: u32,
}

impl SensorHub {
    /// Start the reader thread polling `source` at `sample_rate_hz`.
    pub fn spawn(source: Box<dyn SensorSource>, sample_rate_hz: u32) -> SensorHub {
        let shared = Arc::new(Mutex::new(HubShared {
            source,
            accum: Accumulator::new(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
        }));
        let running = Arc::new(AtomicBool::new(true));

        let reader = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let period = Duration::from_secs_f64(1.0 / f64::from(sample_rate_hz));
                let mut next = Instant::now() + period;
                while running.load(Ordering::Relaxed) {
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    next += period;

                    let mut hub = shared.lock().expect("sensor mutex poisoned");
                    match hub.source.sample() {
                        Ok(s) => {
                            let gb = hub.gyro_bias;
                            let ab = hub.accel_bias;
                            hub.accum.add(&s, &gb, &ab);
                        }
                        Err(e) => tracing::warn!("dropping sensor sample: {e}"),
                    }
                }
                // Close after the in-flight transaction; whatever is left
                // in the accumulators is discarded with the hub.
                shared.lock().expect("sensor mutex poisoned").source.close();
            })
        };

        SensorHub {
            shared,
            running,
            reader: Some(reader),
            sample_rate_hz,
        }
    }

    /// Averages accumulated since the last snapshot, then reset.
    pub fn snapshot(&self) -> Result<AveragedSample, SensorError> {
        self.shared
            .lock()
            .expect("sensor mutex poisoned")
            .accum
            .snapshot()
    }

    pub fn set_sample_rate(&self, hz: u32) -> Result<(), SensorError> {
        self.shared
            .lock()
            .expect("sensor mutex poisoned")
            .source
            .set_sample_rate(hz)
    }

    pub fn set_lpf(&self, hz: u32) -> Result<(), SensorError> {
        self.shared
            .lock()
            .expect("sensor mutex poisoned")
            .source
            .set_lpf(hz)
    }

    /// Sample the gyro for `duration_s` and store the per-axis means as
    /// the new gyro bias. Rejected if any axis variance exceeds
    /// `MAX_GYRO_VAR`, leaving the stored bias unchanged.
    pub fn calibrate_gyro(&self, duration_s: f64) -> Result<Vector3<f64>, SensorError> {
        let bias = self.calibrate(duration_s, |s| s.gyro, MAX_GYRO_VAR)?;
        self.shared.lock().expect("sensor mutex poisoned").gyro_bias = bias;
        tracing::info!("gyro calibration: {:.3} {:.3} {:.3}", bias.x, bias.y, bias.z);
        Ok(bias)
    }

    /// Sample the accelerometer for `duration_s` and store the per-axis
    /// means as the new accel bias. Assumes the aircraft is level, so
    /// axis 3 should feel exactly -1G. Rejected if any axis variance
    /// exceeds `MAX_ACCEL_VAR`.
    pub fn calibrate_accel(&self, duration_s: f64) -> Result<Vector3<f64>, SensorError> {
        let bias = self.calibrate(
            duration_s,
            |s| Vector3::new(s.accel.x, s.accel.y, s.accel.z + 1.0),
            MAX_ACCEL_VAR,
        )?;
        self.shared.lock().expect("sensor mutex poisoned").accel_bias = bias;
        tracing::info!(
            "accel calibration: {:.4} {:.4} {:.4}",
            bias.x,
            bias.y,
            bias.z
        );
        Ok(bias)
    }

    /// Holds the mutex for the whole run, so the reader accumulates
    /// nothing while calibration is in progress.
    fn calibrate(
        &self,
        duration_s: f64,
        axis: impl Fn(&RawSample) -> Vector3<f64>,
        limit: f64,
    ) -> Result<Vector3<f64>, SensorError> {
        let mut shared = self.shared.lock().expect("sensor mutex poisoned");
        let period = Duration::from_secs_f64(1.0 / f64::from(self.sample_rate_hz));
        let n = (duration_s * f64::from(self.sample_rate_hz)).round().max(1.0) as u32;

        let mut sum = Vector3::zeros();
        let mut sum_sq = Vector3::zeros();
        for _ in 0..n {
            thread::sleep(period);
            let s = shared.source.sample()?;
            let v = axis(&s);
            sum += v;
            sum_sq += v.component_mul(&v);
        }

        let mean = sum / f64::from(n);
        let var = sum_sq / f64::from(n) - mean.component_mul(&mean);
        let worst = var.max();
        if worst > limit {
            return Err(SensorError::CalibrationRejected {
                variance: worst,
                limit,
            });
        }
        Ok(mean)
    }

    /// Stop the reader thread and close the source.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
    }
}

impl Drop for SensorHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// FUSION LOOP
// ---------------------------------------------------------------------------

/// Consumer of fused state estimates.
pub trait StateSink: Send {
    fn push(&mut self, state: &State);
}

/// Fixed-period loop that snapshots the accumulators, advances the EKF
/// and hands results to the sinks.
pub struct FusionLoop {
    hub: SensorHub,
    state: Option<State>,
    latest_gps: Option<Vector3<f64>>,
    sinks: Vec<Box<dyn StateSink>>,
}

impl FusionLoop {
    pub fn new(hub: SensorHub) -> Self {
        Self {
            hub,
            state: None,
            latest_gps: None,
            sinks: Vec::new(),
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn StateSink>) {
        self.sinks.push(sink);
    }

    /// Latest GPS velocity (earth frame, kt) to fold into the next step.
    pub fn offer_gps(&mut self, w: Vector3<f64>) {
        self.latest_gps = Some(w);
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// One filter step: snapshot, then predict and update in that order.
    /// A snapshot older than the state is discarded.
    pub fn step(&mut self) -> Result<FilterStatus, SensorError> {
        let snap = self.hub.snapshot()?;

        let mut m = Measurement::new();
        m.t = snap.t;
        m.s_valid = true;
        m.b = snap.gyro;
        m.a = snap.accel;
        if let Some(mag) = snap.mag {
            m.m_valid = true;
            m.mag = mag;
        }
        if let Some(w) = self.latest_gps.take() {
            m.w_valid = true;
            m.w = w;
        }

        let status = match self.state.as_mut() {
            None => {
                self.state = Some(State::initialize(&m));
                FilterStatus::Updated
            }
            Some(s) => {
                if m.t <= s.t {
                    return Ok(FilterStatus::SkippedOutdated);
                }
                s.predict(m.t);
                s.update(&m)
            }
        };

        if let Some(s) = self.state.as_ref() {
            for sink in &mut self.sinks {
                sink.push(s);
            }
        }
        Ok(status)
    }

    /// Run until `stop` is raised, stepping once per `period`.
    pub fn run(&mut self, period: Duration, stop: &AtomicBool) {
        let mut next = Instant::now() + period;
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
            next += period;

            match self.step() {
                Ok(_) => {}
                Err(e) => tracing::warn!("fusion step skipped: {e}"),
            }
        }
    }

    /// Tear down the loop and the sensor reader behind it.
    pub fn shutdown(self) {
        self.hub.stop();
    }
}
