//! Calibration of simulator parameters against observed data.
//!
//! [`InferenceEngine`] is built from an [`InferenceConfig`] and runs one of two
//! back ends, nested sampling or MCMC. Both score simulations through the same
//! [`likelihood::LikelihoodEvaluator`].

pub mod likelihood;
pub mod mcmc;
pub mod nested;

use std::path::Path;

use tracing::info;

use crate::config::{InferenceConfig, InferenceMethod};
use crate::distributions::{Likelihood, Priors};
use crate::error::Result;
use crate::runner::ModelRunner;
use crate::simulator::{RenewalSimulator, Simulator};

use likelihood::{LikelihoodEvaluator, ObservedData};
use mcmc::{Mcmc, McmcResults};
use nested::{NestedSampling, ResultsTable};

/// A configured inference run.
#[derive(Debug)]
pub enum InferenceEngine<S = RenewalSimulator> {
    NestedSampling(NestedSampling<S>),
    Mcmc(Mcmc<S>),
}

/// What a finished run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    NestedSampling(ResultsTable),
    Mcmc(McmcResults),
}

impl InferenceEngine<RenewalSimulator> {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_config(&InferenceConfig::from_file(path)?)
    }

    /// Loads the renewal simulator once per chain; chain `c` is seeded with the
    /// simulator seed offset by `c`.
    pub fn from_config(config: &InferenceConfig) -> Result<Self> {
        let file = &config.simulator_configuration_file;
        Self::with_simulators(config, |chain| {
            let simulator = RenewalSimulator::from_file(file)?;
            let seed = simulator.configuration().seed.wrapping_add(chain as u64);
            Ok(simulator.set_seed(seed))
        })
    }
}

impl<S: Simulator + Send> InferenceEngine<S> {
    /// Builds the engine with simulators from `make_simulator(chain_index)`.
    ///
    /// Priors and the likelihood family are read before any simulator is built,
    /// so an unsupported family fails before anything is sampled.
    pub fn with_simulators<F>(config: &InferenceConfig, mut make_simulator: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<S>,
    {
        config.validate()?;
        let priors = Priors::from_config(&config.parameters_to_fit)?;
        let likelihood = Likelihood::from_name(&config.likelihood)?;
        let observed = ObservedData::from_csv(&config.data.observed_data)?;
        let names: Vec<String> = priors.names().map(str::to_string).collect();
        let mut evaluator = |chain: usize| -> Result<LikelihoodEvaluator<S>> {
            let runner = ModelRunner::new(make_simulator(chain)?, names.clone())?;
            LikelihoodEvaluator::new(runner, &config.data, &observed, likelihood, config.min_error)
        };

        match &config.inference {
            InferenceMethod::NestedSampling(settings) => {
                info!(parameters = priors.len(), "nested sampling");
                Ok(InferenceEngine::NestedSampling(NestedSampling::new(
                    priors,
                    evaluator(0)?,
                    &config.results_path,
                    settings.clone(),
                    config.seed,
                )))
            }
            InferenceMethod::Mcmc(settings) => {
                info!(parameters = priors.len(), chains = settings.num_chains, "mcmc");
                let evaluators = (0..settings.num_chains)
                    .map(&mut evaluator)
                    .collect::<Result<Vec<_>>>()?;
                Ok(InferenceEngine::Mcmc(Mcmc::new(
                    priors,
                    evaluators,
                    &config.results_path,
                    settings.clone(),
                    config.seed,
                )?))
            }
        }
    }

    pub fn run(self) -> Result<InferenceOutcome> {
        match self {
            InferenceEngine::NestedSampling(mut engine) => {
                Ok(InferenceOutcome::NestedSampling(engine.run()?))
            }
            InferenceEngine::Mcmc(engine) => Ok(InferenceOutcome::Mcmc(engine.run()?)),
        }
    }
}
