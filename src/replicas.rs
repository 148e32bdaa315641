//! Stochastic replicas of one parameter setting, reduced to mean and spread.

use ndarray::{Array1, Array2, ArrayView1, Axis};

use crate::error::{Error, Result};
use crate::runner::ModelRunner;
use crate::simulator::Simulator;

/// Per-timestep summary of `R` replica runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSummary {
    pub mean: Array1<f64>,
    /// Population standard deviation (`ddof = 0`).
    pub std: Array1<f64>,
}

/// Reduces an `R × T` matrix of replica series to its column mean and population std.
pub fn summarize(replicas: &Array2<f64>) -> Result<ReplicaSummary> {
    let mean = replicas
        .mean_axis(Axis(0))
        .ok_or_else(|| Error::DimensionMismatch("no replicas to summarize".into()))?;
    let std = replicas.std_axis(Axis(0), 0.0);
    Ok(ReplicaSummary { mean, std })
}

/// Runs `replicas` simulations at `values` and summarizes the `output_key` series.
pub fn run_replicas<S: Simulator>(
    runner: &mut ModelRunner<S>,
    values: ArrayView1<f64>,
    replicas: usize,
    output_key: &str,
) -> Result<ReplicaSummary> {
    if replicas == 0 {
        return Err(Error::Config("at least one replica is required".into()));
    }
    let mut stacked: Option<Array2<f64>> = None;
    for _ in 0..replicas {
        let bundle = runner.run_model(values)?;
        let series = bundle.get(output_key)?;
        match stacked.as_mut() {
            None => stacked = Some(series.clone().insert_axis(Axis(0))),
            Some(rows) => {
                if rows.ncols() != series.len() {
                    return Err(Error::DimensionMismatch(format!(
                        "replica produced {} timesteps, expected {}",
                        series.len(),
                        rows.ncols()
                    )));
                }
                rows.push_row(series.view()).map_err(|e| {
                    Error::DimensionMismatch(format!("cannot stack replica: {e}"))
                })?;
            }
        }
    }
    let stacked = stacked.ok_or_else(|| Error::Config("no replicas were run".into()))?;
    summarize(&stacked)
}
