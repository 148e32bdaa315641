//! A stochastic renewal-equation epidemic model.
//!
//! New infections at step `t` are drawn from a binomial over the remaining
//! susceptibles, with a force of infection given by past incidence weighted by
//! the generation-interval PMF. Infections are spread over later steps by the
//! symptom-onset PMF and a binomial fraction of onsets is reported as cases.
//!
//! Parameter tree leaves read on every run:
//!
//! | path                      | meaning                                  |
//! |---------------------------|------------------------------------------|
//! | `infection.beta`          | transmission probability per contact     |
//! | `infection.contacts`      | contacts per infectious individual       |
//! | `reporting.ascertainment` | fraction of symptom onsets reported      |
//! | `population.size`         | closed population size                   |
//! | `seeding.cases`           | infections on the first step             |

use std::path::Path;

use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Binomial, Distribution};
use serde::{Deserialize, Serialize};

use super::{ParameterTree, ResultBundle, Simulator};
use crate::config::{read_yaml, Device};
use crate::error::{Error, Result};

pub const BETA: &str = "infection.beta";
pub const CONTACTS: &str = "infection.contacts";
pub const ASCERTAINMENT: &str = "reporting.ascertainment";
pub const POPULATION: &str = "population.size";
pub const SEED_CASES: &str = "seeding.cases";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfiguration {
    #[serde(default)]
    pub device: Device,
}

/// Base configuration the simulator is rebuilt from on every reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalConfiguration {
    #[serde(default)]
    pub system: SystemConfiguration,
    pub n_timesteps: usize,
    #[serde(default)]
    pub seed: u64,
    pub generation_interval_pmf: Vec<f64>,
    #[serde(default = "default_onset_pmf")]
    pub symptom_onset_pmf: Vec<f64>,
    pub parameters: ParameterTree,
}

fn default_onset_pmf() -> Vec<f64> {
    vec![1.0]
}

impl RenewalConfiguration {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let configuration: Self = read_yaml(path)?;
        configuration.validate()?;
        Ok(configuration)
    }

    fn validate(&self) -> Result<()> {
        if self.n_timesteps == 0 {
            return Err(Error::Config("n_timesteps must be positive".into()));
        }
        for (name, pmf) in [
            ("generation_interval_pmf", &self.generation_interval_pmf),
            ("symptom_onset_pmf", &self.symptom_onset_pmf),
        ] {
            if pmf.is_empty() || pmf.iter().any(|p| *p < 0.0) {
                return Err(Error::Config(format!(
                    "{name} must be a non-empty list of non-negative masses"
                )));
            }
        }
        for path in [BETA, CONTACTS, ASCERTAINMENT, POPULATION, SEED_CASES] {
            self.parameters.get(path)?;
        }
        Ok(())
    }
}

/// Owns its parameter tree and random stream; one instance per worker.
#[derive(Debug, Clone)]
pub struct RenewalSimulator {
    configuration: RenewalConfiguration,
    parameters: ParameterTree,
    rng: SmallRng,
}

impl RenewalSimulator {
    pub fn new(configuration: RenewalConfiguration) -> Result<Self> {
        configuration.validate()?;
        let rng = SmallRng::seed_from_u64(configuration.seed);
        Ok(Self {
            parameters: configuration.parameters.clone(),
            configuration,
            rng,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(RenewalConfiguration::from_file(path)?)
    }

    /// Reseeds the random stream, e.g. to decorrelate workers built from one file.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn configuration(&self) -> &RenewalConfiguration {
        &self.configuration
    }
}

impl Simulator for RenewalSimulator {
    fn parameters(&self) -> &ParameterTree {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut ParameterTree {
        &mut self.parameters
    }

    fn reset(&mut self) {
        self.parameters = self.configuration.parameters.clone();
    }

    fn run(&mut self) -> Result<ResultBundle> {
        let n_steps = self.configuration.n_timesteps;
        let gi = &self.configuration.generation_interval_pmf;
        let onset_pmf = &self.configuration.symptom_onset_pmf;

        let r0 = self.parameters.get(BETA)? * self.parameters.get(CONTACTS)?;
        let ascertainment = self.parameters.get(ASCERTAINMENT)?.clamp(0.0, 1.0);
        let population = self.parameters.get(POPULATION)?.round();
        if !(population >= 1.0) {
            return Err(Error::Simulation(format!(
                "population size must be at least 1, got {population}"
            )));
        }
        let population = population as u64;
        let seed_cases = (self.parameters.get(SEED_CASES)?.max(0.0).round() as u64).min(population);

        let mut infections = vec![0u64; n_steps];
        let mut onsets = vec![0u64; n_steps];
        let mut cum_infected = 0u64;

        for step in 0..n_steps {
            let new_infections = if step == 0 {
                seed_cases
            } else {
                let susceptible = population - cum_infected;
                let mut force = 0.0;
                for lag in 0..usize::min(step, gi.len()) {
                    force += infections[step - lag - 1] as f64 * gi[lag];
                }
                let rate = (r0 * force * susceptible as f64 / population as f64).max(0.0);
                if susceptible > 0 && rate > 0.0 {
                    let p = (rate / susceptible as f64).min(1.0);
                    binomial(susceptible, p)?.sample(&mut self.rng)
                } else {
                    0
                }
            };
            infections[step] = new_infections;
            cum_infected += new_infections;

            if new_infections > 0 {
                let mut residual_mass = onset_pmf.iter().sum::<f64>();
                let mut remaining = new_infections;
                for (mass, slot) in onset_pmf.iter().zip(onsets.iter_mut().skip(step)) {
                    if remaining == 0 || residual_mass <= 0.0 {
                        break;
                    }
                    let p = (mass / residual_mass).clamp(0.0, 1.0);
                    let moved = binomial(remaining, p)?.sample(&mut self.rng);
                    *slot += moved;
                    remaining -= moved;
                    residual_mass -= mass;
                }
            }
        }

        let mut cases = Vec::with_capacity(n_steps);
        for &n in &onsets {
            cases.push(binomial(n, ascertainment)?.sample(&mut self.rng) as f64);
        }
        let cases = Array1::from(cases);
        let mut cumulative = cases.clone();
        cumulative.accumulate_axis_inplace(ndarray::Axis(0), |&prev, curr| *curr += prev);

        let mut bundle = ResultBundle::new();
        bundle.insert(
            "infections_per_timestep",
            infections.iter().map(|&n| n as f64).collect::<Array1<f64>>(),
        );
        bundle.insert(
            "onsets_per_timestep",
            onsets.iter().map(|&n| n as f64).collect::<Array1<f64>>(),
        );
        bundle.insert("cases_per_timestep", cases);
        bundle.insert("cumulative_cases", cumulative);
        Ok(bundle)
    }
}

fn binomial(n: u64, p: f64) -> Result<Binomial> {
    Binomial::new(n, p).map_err(|e| Error::Simulation(format!("binomial(n={n}, p={p}): {e}")))
}
