//! Drives the filter against a scenario and logs what happened.
//!
//! Each step interpolates the true state, synthesizes noisy control
//! inputs and measurements, advances the filter (predict, then update),
//! and records truth, prediction, estimate and standard deviations. The
//! records can be written out as the six CSV analysis logs.

use nalgebra::Vector3;
use std::path::Path;
use thiserror::Error;

use kestrel_core::ekf::{Measurement, State, DEG};
use kestrel_core::quaternion::from_quaternion;

use crate::scenario::{NoiseConfig, NoiseInjector, Scenario, ScenarioError};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error("could not write log file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Filter update period, s
    pub dt: f64,
    pub noise: NoiseConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            dt: 0.1,
            noise: NoiseConfig::default(),
        }
    }
}

/// Everything worth knowing about one filter step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub t: f64,

    pub true_u: Vector3<f64>,
    pub true_euler: Vector3<f64>,
    pub true_wind: Vector3<f64>,
    pub true_field: Vector3<f64>,

    /// State after predict, before the measurement correction
    pub pred_u: Vector3<f64>,
    pub pred_euler: Vector3<f64>,
    pub pred_wind: Vector3<f64>,
    pub pred_field: Vector3<f64>,

    /// State after the measurement correction
    pub est_u: Vector3<f64>,
    pub est_euler: Vector3<f64>,
    pub est_wind: Vector3<f64>,
    pub est_field: Vector3<f64>,

    /// Standard deviations from the covariance diagonal
    pub sd_u: Vector3<f64>,
    pub sd_att: Vector3<f64>,
    pub sd_wind: Vector3<f64>,
    pub sd_field: Vector3<f64>,

    /// Noisy measurements as fed to the filter
    pub meas_w: Vector3<f64>,
    pub meas_mag: Vector3<f64>,
    pub meas_u: Vector3<f64>,

    /// Noisy control inputs, sensor frame (rad/s, G)
    pub control_gyro: Vector3<f64>,
    pub control_accel: Vector3<f64>,
}

pub struct RunResult {
    pub records: Vec<StepRecord>,
    pub state: State,
}

struct Snap {
    u: Vector3<f64>,
    euler: Vector3<f64>,
    wind: Vector3<f64>,
    field: Vector3<f64>,
}

impl Snap {
    fn of(s: &State) -> Snap {
        let (phi, theta, psi) = from_quaternion(&s.e);
        Snap {
            u: s.u,
            euler: Vector3::new(phi, theta, psi),
            wind: s.v,
            field: s.n,
        }
    }
}

fn sd3(s: &State, i0: usize) -> Vector3<f64> {
    Vector3::new(
        s.cov[(i0, i0)].max(0.0).sqrt(),
        s.cov[(i0 + 1, i0 + 1)].max(0.0).sqrt(),
        s.cov[(i0 + 2, i0 + 2)].max(0.0).sqrt(),
    )
}

/// Run the filter over the whole scenario at the configured period.
///
/// `tweak` sees every measurement after noise injection and before the
/// filter does; use it to drop sensors or inject faults mid-flight.
pub fn run_scenario(
    scenario: &Scenario,
    cfg: &HarnessConfig,
    mut tweak: impl FnMut(f64, &mut Measurement),
) -> Result<RunResult, HarnessError> {
    let mut noise = NoiseInjector::new(cfg.noise.clone());
    let mut records = Vec::new();
    let mut state: Option<State> = None;

    let mut t = scenario.start();
    while t < scenario.end() {
        let truth = scenario.truth(t)?;
        let (true_phi, true_theta, true_psi) = from_quaternion(&truth.e);

        let mut control = scenario.control(t)?;
        noise.perturb_control(&mut control);

        let mut m = scenario.measurement(t)?;
        // The inertial group comes from the synthesized control inputs
        m.s_valid = true;
        m.b = control.gyro / DEG;
        m.a = control.accel;
        noise.perturb_measurement(&mut m);
        tweak(t, &mut m);

        let (pred, est, sd) = match state.as_mut() {
            None => {
                let s = State::initialize(&m);
                let snap = Snap::of(&s);
                let sd = (sd3(&s, 0), sd3(&s, 7), sd3(&s, 16), sd3(&s, 13));
                let pred = Snap::of(&s);
                state = Some(s);
                (pred, snap, sd)
            }
            Some(s) => {
                s.predict(t);
                let pred = Snap::of(s);
                // A singular innovation covariance skips the correction;
                // the warning is logged inside the filter
                let _ = s.update(&m);
                let est = Snap::of(s);
                let sd = (sd3(s, 0), sd3(s, 7), sd3(s, 16), sd3(s, 13));
                (pred, est, sd)
            }
        };

        records.push(StepRecord {
            t,
            true_u: truth.u,
            true_euler: Vector3::new(true_phi, true_theta, true_psi),
            true_wind: truth.v,
            true_field: truth.m,
            pred_u: pred.u,
            pred_euler: pred.euler,
            pred_wind: pred.wind,
            pred_field: pred.field,
            est_u: est.u,
            est_euler: est.euler,
            est_wind: est.wind,
            est_field: est.field,
            sd_u: sd.0,
            sd_att: sd.1,
            sd_wind: sd.2,
            sd_field: sd.3,
            meas_w: m.w,
            meas_mag: m.mag,
            meas_u: m.u,
            control_gyro: control.gyro,
            control_accel: control.accel,
        });

        t += cfg.dt;
    }

    let state = state.ok_or(ScenarioError::Invalid("scenario produced no steps".into()))?;
    Ok(RunResult { records, state })
}

// ---------------------------------------------------------------------------
// CSV LOGS
// ---------------------------------------------------------------------------

const STATE_HEADER: [&str; 13] = [
    "T", "Ux", "Uy", "Uz", "Phi", "Theta", "Psi", "Vx", "Vy", "Vz", "Mx", "My", "Mz",
];

fn state_row(t: f64, u: &Vector3<f64>, euler: &Vector3<f64>, v: &Vector3<f64>, m: &Vector3<f64>) -> Vec<String> {
    let mut row = vec![format!("{t:.6}")];
    for vec in [u, euler, v, m] {
        for x in vec.iter() {
            row.push(format!("{x:.6}"));
        }
    }
    row
}

/// Write the six analysis logs into `dir`:
/// `k_state.csv` (truth), `k_kalman.csv` (post-update estimate),
/// `k_predict.csv` (post-predict state), `k_var.csv` (standard
/// deviations), `k_meas.csv` and `k_control.csv`.
pub fn write_logs(records: &[StepRecord], dir: &Path) -> Result<(), HarnessError> {
    std::fs::create_dir_all(dir)?;

    let mut f_actual = csv::Writer::from_path(dir.join("k_state.csv"))?;
    let mut f_kalman = csv::Writer::from_path(dir.join("k_kalman.csv"))?;
    let mut f_predict = csv::Writer::from_path(dir.join("k_predict.csv"))?;
    let mut f_var = csv::Writer::from_path(dir.join("k_var.csv"))?;
    let mut f_meas = csv::Writer::from_path(dir.join("k_meas.csv"))?;
    let mut f_control = csv::Writer::from_path(dir.join("k_control.csv"))?;

    f_actual.write_record(STATE_HEADER)?;
    f_kalman.write_record(STATE_HEADER)?;
    f_predict.write_record(STATE_HEADER)?;
    f_var.write_record(STATE_HEADER)?;
    f_meas.write_record(["T", "Wx", "Wy", "Wz", "Mx", "My", "Mz", "Ux", "Uy", "Uz"])?;
    f_control.write_record(["T", "P", "Q", "R", "Ax", "Ay", "Az"])?;

    for r in records {
        f_actual.write_record(state_row(r.t, &r.true_u, &r.true_euler, &r.true_wind, &r.true_field))?;
        f_kalman.write_record(state_row(r.t, &r.est_u, &r.est_euler, &r.est_wind, &r.est_field))?;
        f_predict.write_record(state_row(r.t, &r.pred_u, &r.pred_euler, &r.pred_wind, &r.pred_field))?;
        f_var.write_record(state_row(r.t, &r.sd_u, &r.sd_att, &r.sd_wind, &r.sd_field))?;

        let mut meas = vec![format!("{:.6}", r.t)];
        for vec in [&r.meas_w, &r.meas_mag, &r.meas_u] {
            for x in vec.iter() {
                meas.push(format!("{x:.6}"));
            }
        }
        f_meas.write_record(meas)?;

        // Roll rate is logged with the sign flipped into the usual
        // P/Q/R convention
        f_control.write_record([
            format!("{:.6}", r.t),
            format!("{:.6}", -r.control_gyro.x),
            format!("{:.6}", r.control_gyro.y),
            format!("{:.6}", r.control_gyro.z),
            format!("{:.6}", r.control_accel.x),
            format!("{:.6}", r.control_accel.y),
            format!("{:.6}", r.control_accel.z),
        ])?;
    }

    f_actual.flush()?;
    f_kalman.flush()?;
    f_predict.flush()?;
    f_var.flush()?;
    f_meas.flush()?;
    f_control.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn angle_diff(a: f64, b: f64) -> f64 {
        let d = (a - b + PI).rem_euclid(2.0 * PI) - PI;
        d.abs()
    }

    #[test]
    fn test_level_flight_recovers_attitude() {
        // Straight flight at the identity attitude, no wind, no noise
        let sc = Scenario::level_flight(120.0, FRAC_PI_2, Vector3::zeros(), 30.0);
        let result = run_scenario(&sc, &HarnessConfig::default(), |_, _| {}).unwrap();

        let euler = result.records.last().unwrap().est_euler;
        assert!(euler.x.abs() < 0.01, "phi {}", euler.x);
        assert!(euler.y.abs() < 0.01, "theta {}", euler.y);
        assert!(angle_diff(euler.z, FRAC_PI_2) < 0.01, "psi {}", euler.z);
    }

    #[test]
    fn test_standard_rate_turn_noiseless() {
        let sc = Scenario::standard_rate_turn();
        let result = run_scenario(&sc, &HarnessConfig::default(), |_, _| {}).unwrap();

        // Two full revolutions bring the heading back to its start and
        // the wings level for the last ten seconds
        let euler = result.records.last().unwrap().est_euler;
        assert!(angle_diff(euler.z, 0.0) < 0.05, "psi {}", euler.z);
        assert!(euler.x.abs() < 0.02, "phi {}", euler.x);
    }

    #[test]
    fn test_wind_estimation() {
        let wind = Vector3::new(3.0, 4.0, 0.0);
        let sc = Scenario::level_flight(120.0, FRAC_PI_2, wind, 60.0);
        let result = run_scenario(&sc, &HarnessConfig::default(), |_, _| {}).unwrap();

        let est = result.state.v;
        assert!((est - wind).norm() < 0.5, "wind estimate {est:?}");
    }

    #[test]
    fn test_gps_dropout_grows_wind_uncertainty() {
        let wind = Vector3::new(3.0, 4.0, 0.0);
        let sc = Scenario::level_flight(120.0, FRAC_PI_2, wind, 80.0);
        let result = run_scenario(&sc, &HarnessConfig::default(), |t, m| {
            if (20.0..30.0).contains(&t) {
                m.w_valid = false;
            }
        })
        .unwrap();

        let at = |time: f64| {
            result
                .records
                .iter()
                .min_by(|a, b| {
                    (a.t - time).abs().partial_cmp(&(b.t - time).abs()).unwrap()
                })
                .unwrap()
        };

        // Wind variance grows on process noise while GPS is gone
        let before = at(19.9);
        let during = at(29.9);
        assert!(during.sd_wind.x > before.sd_wind.x);
        assert!(during.sd_wind.y > before.sd_wind.y);

        // And the estimate reconverges within ten seconds of its return
        let after = at(40.0);
        assert!((after.est_wind - wind).norm() < 0.5, "wind {:?}", after.est_wind);
    }

    #[test]
    fn test_filter_invariants_through_turn() {
        let sc = Scenario::standard_rate_turn();
        let cfg = HarnessConfig::default();
        let mut noise = NoiseInjector::new(cfg.noise.clone());
        let mut state: Option<State> = None;

        let mut t = sc.start();
        while t < sc.end() {
            let mut control = sc.control(t).unwrap();
            noise.perturb_control(&mut control);
            let mut m = sc.measurement(t).unwrap();
            m.s_valid = true;
            m.b = control.gyro / DEG;
            m.a = control.accel;

            match state.as_mut() {
                None => state = Some(State::initialize(&m)),
                Some(s) => {
                    s.predict(t);
                    assert!((s.e.norm() - 1.0).abs() < 1e-6);
                    assert!((s.f.norm() - 1.0).abs() < 1e-6);
                    s.update(&m);
                    assert!((s.e.norm() - 1.0).abs() < 1e-6);
                    assert!((s.f.norm() - 1.0).abs() < 1e-6);
                    for i in 0..32 {
                        assert!(s.cov[(i, i)] >= 0.0, "negative variance at {i}");
                        for j in 0..32 {
                            assert!((s.cov[(i, j)] - s.cov[(j, i)]).abs() < 1e-9);
                        }
                    }
                }
            }
            t += cfg.dt;
        }
    }

    #[test]
    fn test_noisy_turn_still_tracks() {
        let sc = Scenario::standard_rate_turn();
        let cfg = HarnessConfig {
            dt: 0.1,
            noise: NoiseConfig {
                gyro_dps: 0.1,
                accel_g: 0.01,
                gps_kt: 0.5,
                seed: 7,
                ..Default::default()
            },
        };
        let result = run_scenario(&sc, &cfg, |_, _| {}).unwrap();
        let euler = result.records.last().unwrap().est_euler;
        assert!(angle_diff(euler.z, 0.0) < 0.2, "psi {}", euler.z);
        assert!(euler.x.abs() < 0.1, "phi {}", euler.x);
    }

    #[test]
    fn test_write_logs_produces_six_files() {
        let sc = Scenario::level_flight(120.0, FRAC_PI_2, Vector3::zeros(), 2.0);
        let result = run_scenario(&sc, &HarnessConfig::default(), |_, _| {}).unwrap();

        let dir = std::env::temp_dir().join(format!("kestrel-logs-{}", std::process::id()));
        write_logs(&result.records, &dir).unwrap();

        for name in [
            "k_state.csv",
            "k_kalman.csv",
            "k_predict.csv",
            "k_var.csv",
            "k_meas.csv",
            "k_control.csv",
        ] {
            let path = dir.join(name);
            let text = std::fs::read_to_string(&path).unwrap();
            let lines: Vec<&str> = text.lines().collect();
            assert_eq!(lines.len(), result.records.len() + 1, "{name}");
            assert!(lines[0].starts_with("T,"), "{name} header: {}", lines[0]);
        }
        std::fs::remove_dir_all(&dir).ok();
    }
}
