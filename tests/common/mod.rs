//! Fixtures shared by the integration tests.

use std::fs;
use std::path::{Path, PathBuf};

pub const N_TIMESTEPS: usize = 30;

/// Writes a renewal-simulator configuration into `dir` and returns its path.
pub fn write_simulator_config(dir: &Path) -> PathBuf {
    let path = dir.join("simulator.yaml");
    fs::write(
        &path,
        format!(
            "
system:
  device: cpu
n_timesteps: {N_TIMESTEPS}
seed: 3
generation_interval_pmf: [0.0, 0.3, 0.4, 0.3]
symptom_onset_pmf: [0.6, 0.4]
parameters:
  infection:
    beta: 0.2
    contacts: 8
  reporting:
    ascertainment: 0.8
  population:
    size: 20000
  seeding:
    cases: 10
"
        ),
    )
    .unwrap();
    path
}

/// Writes an observed-data CSV with a `cases_per_timestep` channel.
pub fn write_observed_data(dir: &Path) -> PathBuf {
    let path = dir.join("observed.csv");
    let mut text = String::from("cases_per_timestep\n");
    for t in 0..N_TIMESTEPS {
        text.push_str(&format!("{}\n", 8 + 3 * t));
    }
    fs::write(&path, text).unwrap();
    path
}
