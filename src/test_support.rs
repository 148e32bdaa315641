//! Deterministic simulator for unit tests.

use ndarray::Array1;

use crate::error::Result;
use crate::simulator::{ParameterTree, ResultBundle, Simulator};

pub(crate) const N_STEPS: usize = 4;

/// Emits `alpha * t + offset + jitter * k` for the `k`-th run since construction.
#[derive(Debug, Clone)]
pub(crate) struct CountingSimulator {
    base: ParameterTree,
    parameters: ParameterTree,
    pub resets: usize,
    pub runs: usize,
}

pub(crate) fn counting_simulator() -> CountingSimulator {
    let base: ParameterTree = serde_yaml::from_str(
        "
rates:
  alpha: 1.0
  offset: 0.0
  jitter: 0.0
",
    )
    .unwrap();
    CountingSimulator {
        parameters: base.clone(),
        base,
        resets: 0,
        runs: 0,
    }
}

impl Simulator for CountingSimulator {
    fn parameters(&self) -> &ParameterTree {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterTree {
        &mut self.parameters
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.parameters = self.base.clone();
    }

    fn run(&mut self) -> Result<ResultBundle> {
        let alpha = self.parameters.get("rates.alpha")?;
        let offset = self.parameters.get("rates.offset")?;
        let jitter = self.parameters.get("rates.jitter")?;
        let shift = jitter * self.runs as f64;
        self.runs += 1;
        let cases: Array1<f64> = (0..N_STEPS)
            .map(|t| alpha * t as f64 + offset + shift)
            .collect();
        let mut bundle = ResultBundle::new();
        bundle.insert("deaths_per_timestep", cases.mapv(|c| 0.5 * c));
        bundle.insert("cases_per_timestep", cases);
        Ok(bundle)
    }
}
