//! YAML configuration for sample generation and inference runs.
//!
//! Both configurations are plain `serde` structs; optional settings carry
//! `#[serde(default)]`. Anything that parses but makes no sense (an empty
//! range, zero replicas, ...) is rejected by `validate` with [`Error::Config`].

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compute device. Only the CPU is available to the built-in simulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

/// A `[low, high]` interval for one varied parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct ParameterRange {
    pub low: f64,
    pub high: f64,
}

impl From<[f64; 2]> for ParameterRange {
    fn from([low, high]: [f64; 2]) -> Self {
        Self { low, high }
    }
}

impl From<ParameterRange> for [f64; 2] {
    fn from(range: ParameterRange) -> Self {
        [range.low, range.high]
    }
}

impl ParameterRange {
    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn contains(&self, x: f64) -> bool {
        self.low <= x && x <= self.high
    }
}

/// Reads and deserializes a YAML file.
pub fn read_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(serde_yaml::from_str(&text)?)
}

fn default_output_key() -> String {
    "cases_per_timestep".to_string()
}

fn default_workers() -> usize {
    1
}

/// Configuration of a sample-generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub device: Device,
    #[serde(alias = "june_configuration_file")]
    pub simulator_configuration_file: PathBuf,
    pub n_samples: usize,
    /// Dotted parameter path to `[low, high]`. Order fixes the column order.
    pub parameters_to_vary: IndexMap<String, ParameterRange>,
    pub n_samples_per_parameter: usize,
    pub save_path: PathBuf,
    #[serde(default = "default_output_key")]
    pub output_key: String,
    #[serde(default = "default_workers")]
    pub n_workers: usize,
    #[serde(default)]
    pub seed: u64,
}

impl GenerationConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_samples == 0 {
            return Err(Error::Config("n_samples must be positive".into()));
        }
        if self.n_samples_per_parameter == 0 {
            return Err(Error::Config(
                "n_samples_per_parameter must be positive".into(),
            ));
        }
        if self.n_workers == 0 {
            return Err(Error::Config("n_workers must be positive".into()));
        }
        if self.parameters_to_vary.is_empty() {
            return Err(Error::Config("parameters_to_vary is empty".into()));
        }
        for (name, range) in &self.parameters_to_vary {
            if !(range.low < range.high) {
                return Err(Error::Config(format!(
                    "range for `{name}` must satisfy low < high, got [{}, {}]",
                    range.low, range.high
                )));
            }
        }
        Ok(())
    }

    pub fn parameter_names(&self) -> Vec<String> {
        self.parameters_to_vary.keys().cloned().collect()
    }

    pub fn ranges(&self) -> Vec<ParameterRange> {
        self.parameters_to_vary.values().copied().collect()
    }
}

/// Prior as written in the configuration: a family name plus its named arguments.
///
/// Turned into a [`crate::distributions::Prior`] by
/// [`crate::distributions::Prior::from_spec`], which rejects unknown families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    pub dist: String,
    #[serde(flatten)]
    pub args: IndexMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameter {
    pub prior: PriorSpec,
}

/// Which timesteps of a channel enter the likelihood.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeStamps")]
pub enum TimeStamps {
    All,
    Indices(Vec<usize>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawTimeStamps {
    Keyword(String),
    Indices(Vec<usize>),
}

impl TryFrom<RawTimeStamps> for TimeStamps {
    type Error = String;

    fn try_from(raw: RawTimeStamps) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawTimeStamps::Keyword(k) if k == "all" => Ok(TimeStamps::All),
            RawTimeStamps::Keyword(k) => Err(format!(
                "time_stamps must be \"all\" or a list of indices, got \"{k}\""
            )),
            RawTimeStamps::Indices(ix) => Ok(TimeStamps::Indices(ix)),
        }
    }
}

impl TimeStamps {
    /// Resolves the selection against a series of length `len`.
    pub fn resolve(&self, len: usize) -> Result<Vec<usize>> {
        match self {
            TimeStamps::All => Ok((0..len).collect()),
            TimeStamps::Indices(ix) => {
                if let Some(bad) = ix.iter().find(|&&i| i >= len) {
                    return Err(Error::DimensionMismatch(format!(
                        "time stamp {bad} is outside a series of length {len}"
                    )));
                }
                Ok(ix.clone())
            }
        }
    }
}

/// One observed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservableConfig {
    pub time_stamps: TimeStamps,
    /// Relative error fraction of the heteroscedastic noise model.
    pub error: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// CSV with one column per channel and one row per timestep.
    pub observed_data: PathBuf,
    pub observable: IndexMap<String, ObservableConfig>,
}

fn default_likelihood() -> String {
    "Normal".to_string()
}

fn default_min_error() -> f64 {
    1e-6
}

fn default_live_points() -> usize {
    100
}

fn default_evidence_tolerance() -> f64 {
    0.5
}

fn default_max_iterations() -> usize {
    10_000
}

fn default_walk_steps() -> usize {
    20
}

/// Settings of the built-in nested sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedSamplingConfig {
    #[serde(default = "default_live_points")]
    pub n_live_points: usize,
    /// Stop once the live points could raise the log-evidence by less than this.
    #[serde(default = "default_evidence_tolerance")]
    pub evidence_tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_walk_steps")]
    pub walk_steps: usize,
}

impl Default for NestedSamplingConfig {
    fn default() -> Self {
        Self {
            n_live_points: default_live_points(),
            evidence_tolerance: default_evidence_tolerance(),
            max_iterations: default_max_iterations(),
            walk_steps: default_walk_steps(),
        }
    }
}

fn default_step_size() -> f64 {
    0.1
}

fn default_target_accept() -> f64 {
    0.234
}

fn default_true() -> bool {
    true
}

/// MCMC transition kernel, selected by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KernelConfig {
    /// Gaussian random-walk Metropolis-Hastings in unconstrained space.
    RandomWalk {
        #[serde(default = "default_step_size")]
        step_size: f64,
        #[serde(default = "default_true")]
        adapt_step_size: bool,
        #[serde(default = "default_target_accept")]
        target_accept_prob: f64,
    },
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::RandomWalk {
            step_size: default_step_size(),
            adapt_step_size: true,
            target_accept_prob: default_target_accept(),
        }
    }
}

fn default_num_samples() -> usize {
    1000
}

fn default_warmup() -> usize {
    200
}

fn default_chains() -> usize {
    1
}

fn default_log_tags() -> Vec<String> {
    vec!["beta".to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcConfig {
    #[serde(default)]
    pub kernel: KernelConfig,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default = "default_warmup")]
    pub warmup_steps: usize,
    #[serde(default = "default_chains")]
    pub num_chains: usize,
    /// Parameters whose name contains any of these tags are logged per draw.
    #[serde(default = "default_log_tags")]
    pub log_tags: Vec<String>,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            num_samples: default_num_samples(),
            warmup_steps: default_warmup(),
            num_chains: default_chains(),
            log_tags: default_log_tags(),
        }
    }
}

/// Inference engine selection, tagged by `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InferenceMethod {
    NestedSampling(NestedSamplingConfig),
    Mcmc(McmcConfig),
}

/// Configuration of an inference run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub device: Device,
    #[serde(alias = "june_configuration_file")]
    pub simulator_configuration_file: PathBuf,
    /// Dotted parameter path to its prior. Order fixes the column order.
    pub parameters_to_fit: IndexMap<String, FitParameter>,
    pub data: DataConfig,
    #[serde(default = "default_likelihood")]
    pub likelihood: String,
    /// Floor applied to the model error so the likelihood scale stays positive.
    #[serde(default = "default_min_error")]
    pub min_error: f64,
    pub results_path: PathBuf,
    #[serde(default)]
    pub seed: u64,
    pub inference: InferenceMethod,
}

impl InferenceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parameters_to_fit.is_empty() {
            return Err(Error::Config("parameters_to_fit is empty".into()));
        }
        if self.data.observable.is_empty() {
            return Err(Error::Config("data.observable is empty".into()));
        }
        for (name, obs) in &self.data.observable {
            if !(obs.error > 0.0) {
                return Err(Error::Config(format!(
                    "relative error of channel `{name}` must be positive"
                )));
            }
        }
        if !(self.min_error > 0.0) {
            return Err(Error::Config("min_error must be positive".into()));
        }
        match &self.inference {
            InferenceMethod::NestedSampling(ns) => {
                if ns.n_live_points < 2 {
                    return Err(Error::Config("n_live_points must be at least 2".into()));
                }
            }
            InferenceMethod::Mcmc(mcmc) => {
                if mcmc.num_samples == 0 {
                    return Err(Error::Config("num_samples must be positive".into()));
                }
                if mcmc.num_chains == 0 {
                    return Err(Error::Config("num_chains must be positive".into()));
                }
                let KernelConfig::RandomWalk {
                    step_size,
                    target_accept_prob,
                    ..
                } = &mcmc.kernel;
                if !(*step_size > 0.0) {
                    return Err(Error::Config("kernel step_size must be positive".into()));
                }
                if !(0.0 < *target_accept_prob && *target_accept_prob < 1.0) {
                    return Err(Error::Config(
                        "kernel target_accept_prob must lie in (0, 1)".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATION: &str = "
device: cpu
june_configuration_file: sim.yaml
n_samples: 10
parameters_to_vary:
  infection.beta: [0.0, 1.0]
  infection.contacts: [5, 10]
n_samples_per_parameter: 3
save_path: samples.bin
";

    #[test]
    fn test_generation_config_keeps_parameter_order() {
        let config: GenerationConfig = serde_yaml::from_str(GENERATION).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.parameter_names(),
            vec!["infection.beta", "infection.contacts"]
        );
        assert_eq!(config.ranges()[1], ParameterRange { low: 5.0, high: 10.0 });
        assert_eq!(config.output_key, "cases_per_timestep");
        assert_eq!(config.n_workers, 1);
        assert_eq!(config.seed, 0);
    }

    #[test]
    fn test_generation_config_rejects_empty_range() {
        let text = GENERATION.replace("[5, 10]", "[10, 5]");
        let config: GenerationConfig = serde_yaml::from_str(&text).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_device_fails_to_parse() {
        let text = GENERATION.replace("device: cpu", "device: cuda:0");
        assert!(serde_yaml::from_str::<GenerationConfig>(&text).is_err());
    }

    #[test]
    fn test_missing_key_fails_to_parse() {
        let text = GENERATION.replace("n_samples: 10\n", "");
        assert!(serde_yaml::from_str::<GenerationConfig>(&text).is_err());
    }

    const INFERENCE: &str = "
simulator_configuration_file: sim.yaml
parameters_to_fit:
  infection.beta:
    prior:
      dist: Uniform
      low: 0.0
      high: 1.0
  reporting.ascertainment:
    prior:
      dist: Normal
      loc: 0.5
      scale: 0.1
data:
  observed_data: observed.csv
  observable:
    cases_per_timestep:
      time_stamps: all
      error: 0.2
    cumulative_cases:
      time_stamps: [3, 5, 7]
      error: 0.1
results_path: results
inference:
  method: mcmc
  kernel:
    type: RandomWalk
    step_size: 0.05
  num_samples: 50
";

    #[test]
    fn test_inference_config_parses_mcmc() {
        let config: InferenceConfig = serde_yaml::from_str(INFERENCE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.likelihood, "Normal");
        let prior = &config.parameters_to_fit["infection.beta"].prior;
        assert_eq!(prior.dist, "Uniform");
        assert_eq!(prior.args["high"], 1.0);
        assert_eq!(
            config.data.observable["cases_per_timestep"].time_stamps,
            TimeStamps::All
        );
        assert_eq!(
            config.data.observable["cumulative_cases"].time_stamps,
            TimeStamps::Indices(vec![3, 5, 7])
        );
        match config.inference {
            InferenceMethod::Mcmc(mcmc) => {
                assert_eq!(mcmc.num_samples, 50);
                assert_eq!(mcmc.warmup_steps, 200);
                assert_eq!(mcmc.log_tags, vec!["beta"]);
                assert_eq!(
                    mcmc.kernel,
                    KernelConfig::RandomWalk {
                        step_size: 0.05,
                        adapt_step_size: true,
                        target_accept_prob: 0.234
                    }
                );
            }
            other => panic!("expected mcmc, got {other:?}"),
        }
    }

    #[test]
    fn test_inference_config_parses_nested_sampling() {
        let text = INFERENCE.replace(
            "  method: mcmc\n  kernel:\n    type: RandomWalk\n    step_size: 0.05\n  num_samples: 50\n",
            "  method: nested_sampling\n  n_live_points: 40\n",
        );
        let config: InferenceConfig = serde_yaml::from_str(&text).unwrap();
        match config.inference {
            InferenceMethod::NestedSampling(ns) => {
                assert_eq!(ns.n_live_points, 40);
                assert_eq!(ns.walk_steps, 20);
            }
            other => panic!("expected nested sampling, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kernel_fails_to_parse() {
        let text = INFERENCE.replace("type: RandomWalk", "type: NUTS");
        assert!(serde_yaml::from_str::<InferenceConfig>(&text).is_err());
    }

    #[test]
    fn test_bad_time_stamp_keyword() {
        let text = INFERENCE.replace("time_stamps: all", "time_stamps: some");
        assert!(serde_yaml::from_str::<InferenceConfig>(&text).is_err());
    }

    #[test]
    fn test_time_stamps_resolve() {
        assert_eq!(TimeStamps::All.resolve(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(
            TimeStamps::Indices(vec![0, 2]).resolve(3).unwrap(),
            vec![0, 2]
        );
        assert!(TimeStamps::Indices(vec![3]).resolve(3).is_err());
    }
}
