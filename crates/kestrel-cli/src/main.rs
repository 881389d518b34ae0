//! Kestrel - AHRS sensor-fusion simulator.
//!
//! Runs the canonical standard-rate-turn scenario through the filter and
//! writes the six CSV analysis logs.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use kestrel_sim::{run_scenario, write_logs, HarnessConfig, NoiseConfig, Scenario};

#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(about = "AHRS sensor-fusion simulator")]
#[command(version)]
struct Args {
    /// Kalman filter update period, seconds
    #[arg(long, default_value_t = 0.1)]
    dt: f64,

    /// Amount of noise to add to gyro measurements, deg/s
    #[arg(short = 'g', long, default_value_t = 0.0)]
    gyro_noise: f64,

    /// Amount of noise to add to accel measurements, G
    #[arg(short = 'a', long, default_value_t = 0.0)]
    accel_noise: f64,

    /// Amount of noise to add to GPS speed measurements, kt
    #[arg(short = 's', long, default_value_t = 0.0)]
    gps_noise: f64,

    /// Noise generator seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Output directory for the CSV logs
    #[arg(short, long, default_value = "output")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    println!("Kestrel AHRS Simulator");
    println!("======================\n");

    let scenario = Scenario::standard_rate_turn();
    let cfg = HarnessConfig {
        dt: args.dt,
        noise: NoiseConfig {
            gyro_dps: args.gyro_noise,
            accel_g: args.accel_noise,
            gps_kt: args.gps_noise,
            seed: args.seed,
            ..Default::default()
        },
    };

    println!("Running standard-rate turn, dt = {:.3} s ...", cfg.dt);
    let result = run_scenario(&scenario, &cfg, |_, _| {})?;
    write_logs(&result.records, &args.output_dir)?;

    let last = result
        .records
        .last()
        .expect("scenario produced at least one step");
    println!("\nFinal state after {} steps:", result.records.len());
    println!(
        "  Attitude (deg):  roll {:7.2}  pitch {:7.2}  heading {:7.2}",
        last.est_euler.x.to_degrees(),
        last.est_euler.y.to_degrees(),
        last.est_euler.z.to_degrees()
    );
    println!(
        "  Airspeed (kt):   {:7.2} {:7.2} {:7.2}",
        last.est_u.x, last.est_u.y, last.est_u.z
    );
    println!(
        "  Wind (kt):       {:7.2} {:7.2} {:7.2}",
        last.est_wind.x, last.est_wind.y, last.est_wind.z
    );
    println!("\nLogs written to {:?}", args.output_dir);

    Ok(())
}
