/*!
# Training-Sample Generation

Draws a Latin Hypercube design over the varied parameters, runs
`n_samples_per_parameter` stochastic replicas for every design row and keeps
the per-timestep mean and standard deviation of the chosen output series.

Work is split across ranks with [`crate::distributed`]. Every rank seeds its
design RNG with the same global seed, so all ranks hold the same design
matrix and simply slice out their own rows. The coordinator gathers the
shards and persists the resulting [`SampleDataset`] with `bincode`.
*/

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array2, Axis};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{GenerationConfig, ParameterRange};
use crate::distributed::{gather_shards, shard_range, Communicator, LocalCluster, Shard};
use crate::error::{Error, Result};
use crate::progress::progress_bar;
use crate::replicas::run_replicas;
use crate::runner::ModelRunner;
use crate::sampling::sample_parameters;
use crate::simulator::{RenewalSimulator, Simulator};

/// Parameters and replica summaries, row-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDataset {
    pub parameter_names: Vec<String>,
    /// `n_samples × n_parameters`
    pub parameters: Array2<f64>,
    /// `n_samples × n_timesteps`
    pub means: Array2<f64>,
    /// `n_samples × n_timesteps`
    pub stds: Array2<f64>,
}

impl SampleDataset {
    pub fn n_samples(&self) -> usize {
        self.parameters.nrows()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush().map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Ok(bincode::deserialize_from(BufReader::new(file))?)
    }
}

/// Sample generator for one rank. Owns that rank's simulator.
#[derive(Debug)]
pub struct SampleGenerator<S> {
    runner: ModelRunner<S>,
    ranges: Vec<ParameterRange>,
    n_samples: usize,
    n_samples_per_parameter: usize,
    output_key: String,
    seed: u64,
    save_path: PathBuf,
}

impl<S: Simulator> SampleGenerator<S> {
    pub fn new(simulator: S, config: &GenerationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            runner: ModelRunner::new(simulator, config.parameter_names())?,
            ranges: config.ranges(),
            n_samples: config.n_samples,
            n_samples_per_parameter: config.n_samples_per_parameter,
            output_key: config.output_key.clone(),
            seed: config.seed,
            save_path: config.save_path.clone(),
        })
    }

    pub fn parameter_names(&self) -> &[String] {
        self.runner.parameter_paths()
    }

    /// The full design matrix. Identical on every rank for a given seed.
    pub fn sample_parameters(&self) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(self.seed);
        sample_parameters(&self.ranges, self.n_samples, &mut rng)
    }

    /// Runs the replicas for this rank's slice of `parameters`.
    pub fn run_models<C: Communicator>(
        &mut self,
        comm: &C,
        parameters: &Array2<f64>,
    ) -> Result<Shard> {
        let range = shard_range(comm.rank(), comm.size(), parameters.nrows());
        info!(
            rank = comm.rank(),
            low = range.start,
            high = range.end,
            "running shard"
        );
        let shard_parameters = parameters.slice(ndarray::s![range.clone(), ..]).to_owned();

        let pb = progress_bar(range.len(), "Samples", comm.is_coordinator());
        let mut means = Vec::with_capacity(range.len());
        let mut stds = Vec::with_capacity(range.len());
        for row in shard_parameters.axis_iter(Axis(0)) {
            let summary = run_replicas(
                &mut self.runner,
                row,
                self.n_samples_per_parameter,
                &self.output_key,
            )?;
            means.push(summary.mean);
            stds.push(summary.std);
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(Shard {
            parameters: shard_parameters,
            means: stack_rows(&means)?,
            stds: stack_rows(&stds)?,
        })
    }

    /// Samples, computes this rank's shard and gathers everything on the coordinator.
    ///
    /// The coordinator saves the dataset and returns it; other ranks return `None`.
    pub fn run<C: Communicator>(&mut self, comm: &C) -> Result<Option<SampleDataset>> {
        let parameters = self.sample_parameters();
        let shard = self.run_models(comm, &parameters)?;
        let Some(gathered) = gather_shards(comm, shard, self.n_samples)? else {
            return Ok(None);
        };
        let dataset = SampleDataset {
            parameter_names: self.parameter_names().to_vec(),
            parameters: gathered.parameters,
            means: gathered.means,
            stds: gathered.stds,
        };
        self.save_samples(&dataset)?;
        Ok(Some(dataset))
    }

    pub fn save_samples(&self, dataset: &SampleDataset) -> Result<()> {
        dataset.save(&self.save_path)?;
        info!(
            path = %self.save_path.display(),
            samples = dataset.n_samples(),
            "saved samples"
        );
        Ok(())
    }
}

fn stack_rows(rows: &[ndarray::Array1<f64>]) -> Result<Array2<f64>> {
    if rows.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map_err(|e| Error::DimensionMismatch(format!("replica summaries differ in length: {e}")))
}

/// Runs a whole generation job on `config.n_workers` local ranks.
///
/// Each rank loads its own copy of the renewal simulator; rank `r` draws its
/// replicas from the simulator seed offset by `r`.
pub fn generate(config: &GenerationConfig) -> Result<SampleDataset> {
    config.validate()?;
    info!(
        workers = config.n_workers,
        samples = config.n_samples,
        replicas = config.n_samples_per_parameter,
        "generating samples"
    );
    let results = LocalCluster::new(config.n_workers).run(|comm| {
        let simulator = RenewalSimulator::from_file(&config.simulator_configuration_file)?;
        let seed = simulator.configuration().seed.wrapping_add(comm.rank() as u64);
        debug!(rank = comm.rank(), seed, "simulator ready");
        let mut generator = SampleGenerator::new(simulator.set_seed(seed), config)?;
        generator.run(&comm)
    })?;
    results
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| Error::Communication("coordinator returned no dataset".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{counting_simulator, N_STEPS};
    use tempfile::tempdir;

    fn config(save_path: PathBuf, n_workers: usize) -> GenerationConfig {
        serde_yaml::from_str::<GenerationConfig>(&format!(
            "
simulator_configuration_file: unused.yaml
n_samples: 10
parameters_to_vary:
  rates.alpha: [0, 1]
  rates.offset: [5, 10]
n_samples_per_parameter: 3
save_path: {}
n_workers: {n_workers}
",
            save_path.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_single_rank_end_to_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.bin");
        let config = config(path.clone(), 1);
        let results = LocalCluster::new(1)
            .run(|comm| SampleGenerator::new(counting_simulator(), &config)?.run(&comm))
            .unwrap();
        let dataset = results[0].clone().unwrap();
        assert_eq!(dataset.parameters.dim(), (10, 2));
        assert_eq!(dataset.means.dim(), (10, N_STEPS));
        assert_eq!(dataset.stds.dim(), (10, N_STEPS));
        assert!(dataset.parameters.column(0).iter().all(|&x| (0.0..=1.0).contains(&x)));
        assert!(dataset.parameters.column(1).iter().all(|&x| (5.0..=10.0).contains(&x)));
        assert_eq!(SampleDataset::load(&path).unwrap(), dataset);
    }

    #[test]
    fn test_two_ranks_gather_all_rows_in_design_order() {
        let dir = tempdir().unwrap();
        let config = config(dir.path().join("samples.bin"), 2);
        let results = LocalCluster::new(2)
            .run(|comm| SampleGenerator::new(counting_simulator(), &config)?.run(&comm))
            .unwrap();
        assert!(results[1].is_none());
        let dataset = results[0].clone().unwrap();
        assert_eq!(dataset.n_samples(), 10);

        let design = SampleGenerator::new(counting_simulator(), &config)
            .unwrap()
            .sample_parameters();
        assert_eq!(dataset.parameters, design);
        // deterministic simulator: the mean at t = 0 is the offset
        for (row, means) in design.axis_iter(Axis(0)).zip(dataset.means.axis_iter(Axis(0))) {
            assert!((means[0] - row[1]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_unknown_parameter_path_propagates() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path().join("samples.bin"), 1);
        config
            .parameters_to_vary
            .insert("rates.gamma".into(), [0.0, 1.0].into());
        assert!(matches!(
            SampleGenerator::new(counting_simulator(), &config),
            Err(Error::AttributeResolution { .. })
        ));
    }
}
