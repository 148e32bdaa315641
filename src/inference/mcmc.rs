/*!
# MCMC Calibration

The generative model draws every fitted parameter from its prior, runs the
simulator once and observes each data channel under the likelihood family,
parameterised by the prediction and the model error. Its log-density is the
shared [`LikelihoodEvaluator`] score plus the prior log-densities.

The kernel works on an unconstrained copy of the parameters: each prior maps
its support onto the real line, and the target adds the log-Jacobian of the
inverse map. The only kernel is a Gaussian random walk Metropolis-Hastings
whose step size is tuned during warmup with a Robbins-Monro update towards
`target_accept_prob`.

After every draw the tagged parameters, mapped back to their natural scale,
are appended to the stage's table and the table is rewritten to
`pyro_chain_<Stage>.csv` (or `pyro_chain_<Stage>_<chain>.csv` when several
chains run). Chains run in parallel, one simulator each, seeded
`seed + chain_index`.
*/

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use indicatif::{MultiProgress, ProgressBar};
use ndarray::{Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

use super::likelihood::LikelihoodEvaluator;
use crate::config::{KernelConfig, McmcConfig};
use crate::distributions::{IsotropicGaussian, Priors, ProposalDistribution};
use crate::error::{Error, Result};
use crate::progress::bar_style;
use crate::simulator::Simulator;
use crate::stats::{summarize, write_summary_csv, ParameterSummary};

/// Phase of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Warmup,
    Sample,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Warmup => write!(f, "Warmup"),
            Stage::Sample => write!(f, "Sample"),
        }
    }
}

/// Log density of the model over unconstrained parameters.
#[derive(Debug)]
pub struct PosteriorTarget<S> {
    priors: Priors,
    evaluator: LikelihoodEvaluator<S>,
}

impl<S: Simulator> PosteriorTarget<S> {
    pub fn new(priors: Priors, evaluator: LikelihoodEvaluator<S>) -> Self {
        Self { priors, evaluator }
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn constrain(&self, unconstrained: &[f64]) -> Vec<f64> {
        self.priors
            .iter()
            .zip(unconstrained)
            .map(|((_, prior), &u)| prior.to_constrained(u))
            .collect()
    }

    /// Log joint of parameters and observations at natural-scale `values`.
    pub fn log_joint(&mut self, values: &[f64]) -> Result<f64> {
        let log_prior: f64 = self
            .priors
            .iter()
            .zip(values)
            .map(|((_, prior), &x)| prior.log_prob(x))
            .sum();
        if log_prior == f64::NEG_INFINITY {
            return Ok(log_prior);
        }
        Ok(log_prior + self.evaluator.evaluate(ArrayView1::from(values))?)
    }

    /// Log joint in unconstrained space, including the log-Jacobian.
    pub fn unnorm_log_prob(&mut self, unconstrained: &[f64]) -> Result<f64> {
        let values = self.constrain(unconstrained);
        let log_det: f64 = self
            .priors
            .iter()
            .zip(unconstrained)
            .map(|((_, prior), &u)| prior.log_abs_det_jacobian(u))
            .sum();
        Ok(self.log_joint(&values)? + log_det)
    }

    /// Starts every chain at the prior medians.
    pub fn initial_state(&self) -> Vec<f64> {
        self.priors
            .iter()
            .map(|(_, prior)| prior.to_unconstrained(prior.ppf(0.5)))
            .collect()
    }
}

/// Random-walk Metropolis-Hastings kernel with warmup step-size adaptation.
#[derive(Debug, Clone)]
pub struct RandomWalkKernel {
    proposal: IsotropicGaussian,
    adapt_step_size: bool,
    target_accept_prob: f64,
    log_step: f64,
    n_adapt: usize,
}

impl RandomWalkKernel {
    pub fn new(step_size: f64, adapt_step_size: bool, target_accept_prob: f64) -> Self {
        Self {
            proposal: IsotropicGaussian::new(step_size),
            adapt_step_size,
            target_accept_prob,
            log_step: step_size.ln(),
            n_adapt: 0,
        }
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        match *config {
            KernelConfig::RandomWalk {
                step_size,
                adapt_step_size,
                target_accept_prob,
            } => Self::new(step_size, adapt_step_size, target_accept_prob),
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.proposal = self.proposal.set_seed(seed);
        self
    }

    pub fn step_size(&self) -> f64 {
        self.proposal.std
    }

    /// Robbins-Monro update of the log step size.
    fn adapt(&mut self, accept_prob: f64) {
        if !self.adapt_step_size {
            return;
        }
        self.n_adapt += 1;
        let gain = (self.n_adapt as f64).powf(-0.6);
        self.log_step += gain * (accept_prob - self.target_accept_prob);
        self.proposal.std = self.log_step.exp();
    }
}

/// Draws of one chain, natural scale, `draws × n_params`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainDraws {
    pub chain: usize,
    pub samples: Array2<f64>,
    pub accept_rate: f64,
    pub step_size: f64,
}

/// Per-stage tables of tagged parameters, rewritten after every draw.
#[derive(Debug, Clone)]
pub struct DrawLogger {
    results_path: PathBuf,
    chain: Option<usize>,
    /// (column in the parameter vector, name)
    columns: Vec<(usize, String)>,
    tables: IndexMap<String, Vec<Vec<f64>>>,
}

impl DrawLogger {
    /// Logs every parameter whose name contains one of `tags`.
    pub fn new(
        results_path: impl Into<PathBuf>,
        names: &[String],
        tags: &[String],
        chain: Option<usize>,
    ) -> Self {
        let columns = names
            .iter()
            .enumerate()
            .filter(|(_, name)| tags.iter().any(|tag| name.contains(tag.as_str())))
            .map(|(i, name)| (i, name.clone()))
            .collect();
        Self {
            results_path: results_path.into(),
            chain,
            columns,
            tables: IndexMap::new(),
        }
    }

    pub fn path(&self, stage: Stage) -> PathBuf {
        let file = match self.chain {
            None => format!("pyro_chain_{stage}.csv"),
            Some(chain) => format!("pyro_chain_{stage}_{chain}.csv"),
        };
        self.results_path.join(file)
    }

    /// Sets row `i` of the stage table to the tagged `values` and rewrites the file.
    pub fn log(&mut self, stage: Stage, i: usize, values: &[f64]) -> Result<()> {
        let path = self.path(stage);
        let row: Vec<f64> = self.columns.iter().map(|&(j, _)| values[j]).collect();
        let table = self.tables.entry(stage.to_string()).or_default();
        if i < table.len() {
            table[i] = row;
        } else {
            table.resize(i, vec![f64::NAN; row.len()]);
            table.push(row);
        }
        write_table(&path, &self.columns, table)
    }
}

fn write_table(path: &Path, columns: &[(usize, String)], rows: &[Vec<f64>]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    if !columns.is_empty() {
        wtr.write_record(columns.iter().map(|(_, name)| name.as_str()))?;
        for row in rows {
            wtr.write_record(row.iter().map(|v| v.to_string()))?;
        }
    }
    wtr.flush().map_err(|e| Error::io(path, e))?;
    Ok(())
}

/// One Markov chain with its own simulator.
#[derive(Debug)]
pub struct McmcChain<S> {
    target: PosteriorTarget<S>,
    kernel: RandomWalkKernel,
    logger: DrawLogger,
    current: Vec<f64>,
    current_lp: f64,
    rng: SmallRng,
    chain: usize,
}

impl<S: Simulator> McmcChain<S> {
    pub fn new(
        target: PosteriorTarget<S>,
        kernel: RandomWalkKernel,
        logger: DrawLogger,
        chain: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut target = target;
        let current = target.initial_state();
        let current_lp = target.unnorm_log_prob(&current)?;
        if !current_lp.is_finite() {
            return Err(Error::Solver(format!(
                "chain {chain}: log density at the prior median is {current_lp}"
            )));
        }
        Ok(Self {
            target,
            kernel: kernel.set_seed(seed),
            logger,
            current,
            current_lp,
            rng: SmallRng::seed_from_u64(seed.wrapping_add(1 << 32)),
            chain,
        })
    }

    /// One Metropolis-Hastings transition. Returns the acceptance probability
    /// and whether the proposal was accepted.
    pub fn step(&mut self) -> Result<(f64, bool)> {
        let proposed = self.kernel.proposal.sample(&self.current);
        let proposed_lp = self.target.unnorm_log_prob(&proposed)?;
        let log_q_forward = self.kernel.proposal.log_prob(&self.current, &proposed);
        let log_q_backward = self.kernel.proposal.log_prob(&proposed, &self.current);
        let log_accept_ratio = (proposed_lp + log_q_backward) - (self.current_lp + log_q_forward);
        let accept_prob = if log_accept_ratio.is_nan() {
            0.0
        } else {
            log_accept_ratio.exp().min(1.0)
        };
        let u: f64 = self.rng.gen();
        let accepted = u.ln() < log_accept_ratio;
        if accepted {
            self.current = proposed;
            self.current_lp = proposed_lp;
        }
        Ok((accept_prob, accepted))
    }

    /// Runs warmup then sampling, logging after every draw.
    pub fn run(
        &mut self,
        warmup_steps: usize,
        num_samples: usize,
        pb: &ProgressBar,
    ) -> Result<ChainDraws> {
        pb.set_length((warmup_steps + num_samples) as u64);
        for i in 0..warmup_steps {
            let (accept_prob, _) = self.step()?;
            self.kernel.adapt(accept_prob);
            self.log_draw(Stage::Warmup, i)?;
            pb.inc(1);
        }
        debug!(
            chain = self.chain,
            step_size = self.kernel.step_size(),
            "warmup finished"
        );

        let n_params = self.current.len();
        let mut samples = Array2::<f64>::zeros((num_samples, n_params));
        let mut n_accepted = 0;
        for i in 0..num_samples {
            let (_, accepted) = self.step()?;
            n_accepted += accepted as usize;
            let values = self.log_draw(Stage::Sample, i)?;
            samples.row_mut(i).assign(&ArrayView1::from(&values));
            pb.inc(1);
            pb.set_message(format!(
                "p(accept)≈{:.2}",
                n_accepted as f64 / (i + 1) as f64
            ));
        }
        pb.finish_with_message("Done!");
        Ok(ChainDraws {
            chain: self.chain,
            samples,
            accept_rate: n_accepted as f64 / num_samples.max(1) as f64,
            step_size: self.kernel.step_size(),
        })
    }

    fn log_draw(&mut self, stage: Stage, i: usize) -> Result<Vec<f64>> {
        let values = self.target.constrain(&self.current);
        self.logger.log(stage, i, &values)?;
        Ok(values)
    }
}

/// Everything an MCMC run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct McmcResults {
    pub parameter_names: Vec<String>,
    pub chains: Vec<ChainDraws>,
    pub summary: Vec<ParameterSummary>,
}

/// MCMC inference engine; holds one evaluator (and so one simulator) per chain.
#[derive(Debug)]
pub struct Mcmc<S> {
    priors: Priors,
    evaluators: Vec<LikelihoodEvaluator<S>>,
    results_path: PathBuf,
    settings: McmcConfig,
    seed: u64,
}

impl<S: Simulator + Send> Mcmc<S> {
    /// Fails unless there is exactly one evaluator per configured chain.
    pub fn new(
        priors: Priors,
        evaluators: Vec<LikelihoodEvaluator<S>>,
        results_path: impl Into<PathBuf>,
        settings: McmcConfig,
        seed: u64,
    ) -> Result<Self> {
        if evaluators.len() != settings.num_chains {
            return Err(Error::Config(format!(
                "{} simulators for {} chains",
                evaluators.len(),
                settings.num_chains
            )));
        }
        Ok(Self {
            priors,
            evaluators,
            results_path: results_path.into(),
            settings,
            seed,
        })
    }

    pub fn run(self) -> Result<McmcResults> {
        fs::create_dir_all(&self.results_path).map_err(|e| Error::io(&self.results_path, e))?;
        let names: Vec<String> = self.priors.names().map(str::to_string).collect();
        let n_chains = self.evaluators.len();
        let multi = MultiProgress::new();
        let settings = &self.settings;
        let priors = &self.priors;
        let results_path = &self.results_path;
        let seed = self.seed;
        info!(
            chains = n_chains,
            warmup = settings.warmup_steps,
            samples = settings.num_samples,
            "running mcmc"
        );

        let draws = self
            .evaluators
            .into_par_iter()
            .enumerate()
            .map(|(chain, evaluator)| {
                let logger = DrawLogger::new(
                    results_path.clone(),
                    &names,
                    &settings.log_tags,
                    (n_chains > 1).then_some(chain),
                );
                let target = PosteriorTarget::new(priors.clone(), evaluator);
                let kernel = RandomWalkKernel::from_config(&settings.kernel);
                let mut mcmc_chain =
                    McmcChain::new(target, kernel, logger, chain, seed.wrapping_add(chain as u64))?;
                let pb = multi.add(ProgressBar::new(0));
                pb.set_style(bar_style());
                pb.set_prefix(format!("Chain {chain}"));
                mcmc_chain.run(settings.warmup_steps, settings.num_samples, &pb)
            })
            .collect::<Result<Vec<_>>>()?;

        let samples: Vec<Array2<f64>> = draws.iter().map(|d| d.samples.clone()).collect();
        let summary = summarize(&names, &samples)?;
        for s in &summary {
            info!(
                parameter = %s.name,
                mean = s.mean,
                std = s.std,
                q5 = s.q5,
                median = s.median,
                q95 = s.q95,
                r_hat = s.r_hat,
                "posterior"
            );
        }
        for d in &draws {
            info!(
                chain = d.chain,
                accept_rate = d.accept_rate,
                step_size = d.step_size,
                "diagnostics"
            );
        }
        write_summary_csv(self.results_path.join("summary.csv"), &summary)?;
        Ok(McmcResults {
            parameter_names: names,
            chains: draws,
            summary,
        })
    }
}
