//! Posterior summaries and convergence diagnostics for MCMC draws.

use std::path::Path;

use ndarray::prelude::*;
use ndarray_stats::interpolate::Linear;
use ndarray_stats::QuantileExt;
use noisy_float::types::n64;

use crate::error::{Error, Result};

/// Running potential scale reduction factor over several chains.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::<f64>::zeros((n_chains, n_params)),
            mean_sq: Array2::<f64>::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Adds one draw per chain; `x` is the row-major `n_chains × n_params` block.
    pub fn step(&mut self, x: &[f64]) -> Result<()> {
        self.n += 1;

        let n = self.n as f64;
        let x_arr = ArrayView2::from_shape((self.n_chains, self.n_params), x)
            .map_err(|e| Error::DimensionMismatch(format!("r-hat step: {e}")))?;

        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        if self.n == 1 {
            self.mean_sq = x_arr.pow2();
        } else {
            self.mean_sq = (&self.mean_sq * (n - 1.0) + &x_arr.pow2()) / n;
        };
        Ok(())
    }

    pub fn all(&self) -> Result<Array1<f64>> {
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::DimensionMismatch("r-hat needs at least one chain".into()))?;
        let n_chains = self.n_chains as f64;
        let n = self.n as f64;
        let fac = n / (n_chains - 1.0);
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * fac;
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * n / (n - 1.0);
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::DimensionMismatch("r-hat needs at least one chain".into()))?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }
}

/// Split r-hat: every chain is cut in half and the halves are treated as chains.
///
/// Each element of `chains` is a `draws × n_params` matrix. Works for a single chain.
pub fn split_rhat(chains: &[Array2<f64>]) -> Result<Array1<f64>> {
    let first = chains
        .first()
        .ok_or_else(|| Error::DimensionMismatch("no chains to diagnose".into()))?;
    let n_params = first.ncols();
    let half = chains.iter().map(|c| c.nrows()).min().unwrap_or(0) / 2;
    if half < 2 {
        return Ok(Array1::from_elem(n_params, f64::NAN));
    }
    let mut psr = RhatMulti::new(2 * chains.len(), n_params);
    let mut block = Vec::with_capacity(2 * chains.len() * n_params);
    for j in 0..half {
        block.clear();
        for chain in chains {
            block.extend(chain.row(j).iter());
            block.extend(chain.row(half + j).iter());
        }
        psr.step(&block)?;
    }
    psr.all()
}

/// Posterior summary of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub q5: f64,
    pub median: f64,
    pub q95: f64,
    pub r_hat: f64,
}

/// Summarises the pooled draws of every parameter.
pub fn summarize(names: &[String], chains: &[Array2<f64>]) -> Result<Vec<ParameterSummary>> {
    let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
    let pooled = ndarray::concatenate(Axis(0), &views)
        .map_err(|e| Error::DimensionMismatch(format!("chains differ in width: {e}")))?;
    if pooled.ncols() != names.len() {
        return Err(Error::DimensionMismatch(format!(
            "{} parameter names for {} columns",
            names.len(),
            pooled.ncols()
        )));
    }
    let r_hat = split_rhat(chains)?;
    let mut scratch = pooled.clone();
    let mut quantiles = |q: f64| {
        scratch
            .quantile_axis_skipnan_mut(Axis(0), n64(q), &Linear)
            .map_err(|e| Error::DimensionMismatch(format!("quantile {q}: {e}")))
    };
    let (q5, median, q95) = (quantiles(0.05)?, quantiles(0.5)?, quantiles(0.95)?);
    Ok(names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let column = pooled.column(j);
            ParameterSummary {
                name: name.clone(),
                mean: column.mean().unwrap_or(f64::NAN),
                std: column.std(1.0),
                q5: q5[j],
                median: median[j],
                q95: q95[j],
                r_hat: r_hat[j],
            }
        })
        .collect())
}

pub fn write_summary_csv(path: impl AsRef<Path>, summary: &[ParameterSummary]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path.as_ref())?;
    wtr.write_record(["parameter", "mean", "std", "5%", "50%", "95%", "r_hat"])?;
    for s in summary {
        wtr.write_record([
            s.name.clone(),
            s.mean.to_string(),
            s.std.to_string(),
            s.q5.to_string(),
            s.median.to_string(),
            s.q95.to_string(),
            s.r_hat.to_string(),
        ])?;
    }
    wtr.flush().map_err(|e| Error::io(path.as_ref(), e))?;
    Ok(())
}
