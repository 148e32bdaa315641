//! Adapter that pushes parameter vectors into a simulator and runs it.

use indexmap::IndexMap;
use ndarray::ArrayView1;
use tracing::trace;

use crate::error::{Error, Result};
use crate::simulator::{ResultBundle, Simulator};

/// Owns one simulator and the ordered list of parameter paths it varies.
///
/// Every varied leaf is replaced by a trainable placeholder at construction
/// and again after each reset, so injected values always land on a
/// placeholder and never on the base configuration.
#[derive(Debug, Clone)]
pub struct ModelRunner<S> {
    simulator: S,
    parameter_paths: Vec<String>,
}

impl<S: Simulator> ModelRunner<S> {
    /// Wraps `simulator`; fails if any path does not resolve in its parameter tree.
    pub fn new(simulator: S, parameter_paths: Vec<String>) -> Result<Self> {
        let mut runner = Self {
            simulator,
            parameter_paths,
        };
        runner.set_parameters()?;
        Ok(runner)
    }

    pub fn parameter_paths(&self) -> &[String] {
        &self.parameter_paths
    }

    pub fn simulator(&self) -> &S {
        &self.simulator
    }

    /// Installs a fresh trainable placeholder at every varied path.
    pub fn set_parameters(&mut self) -> Result<()> {
        let tree = self.simulator.parameters_mut();
        for path in &self.parameter_paths {
            tree.make_trainable(path)?;
        }
        Ok(())
    }

    /// Rebuilds the simulator from its base configuration and reinstalls the placeholders.
    pub fn reset_model(&mut self) -> Result<()> {
        self.simulator.reset();
        self.set_parameters()
    }

    /// Resets, writes `values` (in parameter order) and runs one simulation.
    pub fn run_model(&mut self, values: ArrayView1<f64>) -> Result<ResultBundle> {
        if values.len() != self.parameter_paths.len() {
            return Err(Error::DimensionMismatch(format!(
                "got {} parameter values for {} varied parameters",
                values.len(),
                self.parameter_paths.len()
            )));
        }
        self.reset_model()?;
        let tree = self.simulator.parameters_mut();
        for (path, &value) in self.parameter_paths.iter().zip(values.iter()) {
            tree.assign(path, value)?;
        }
        trace!(?values, "running simulator");
        self.simulator.run()
    }

    /// Like [`ModelRunner::run_model`] with values keyed by parameter path.
    pub fn run_with_samples(&mut self, samples: &IndexMap<String, f64>) -> Result<ResultBundle> {
        let values = self
            .parameter_paths
            .iter()
            .map(|path| {
                samples.get(path).copied().ok_or_else(|| {
                    Error::DimensionMismatch(format!("no value supplied for `{path}`"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        self.run_model(ArrayView1::from(&values))
    }
}
