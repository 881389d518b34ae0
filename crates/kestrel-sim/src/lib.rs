//! Kestrel Simulation Library
//!
//! Synthesizes ground-truth flight trajectories and the matching noisy
//! sensor data, then drives the AHRS filter against them. Serves as the
//! test harness and the oracle for the filter's property tests.

pub mod harness;
pub mod scenario;

// Re-export main types
pub use harness::{run_scenario, write_logs, HarnessConfig, HarnessError, RunResult, StepRecord};
pub use scenario::{Control, Keyframe, NoiseConfig, NoiseInjector, Scenario, ScenarioError, TrueState};
