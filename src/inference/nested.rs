/*!
# Nested Sampling

The engine exposes the two callbacks a nested-sampling solver needs:

- [`NestedSampling::prior_transform`] maps a point of the unit hypercube to
  parameter space through each prior's inverse CDF;
- [`NestedSampling::log_likelihood`] runs the simulator once at those
  parameters and scores it with the shared [`LikelihoodEvaluator`].

A [`NestedSolver`] drives the two callbacks and writes its native output,
`<basename>.txt`, a whitespace-separated table of Fortran-style numbers with
the posterior weight in column 0, the log-likelihood in column 1 and the
parameters in declaration order after that. [`NestedSampling::save_results`]
turns that table into `results.csv`.

The built-in solver is [`ConstrainedWalkSolver`]: classic nested sampling
where each discarded live point is replaced by a random walk, started from a
surviving live point, that only accepts moves above the current likelihood
threshold.
*/

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, info};

use super::likelihood::LikelihoodEvaluator;
use crate::config::NestedSamplingConfig;
use crate::distributions::Priors;
use crate::error::{Error, Result};
use crate::progress::progress_bar;
use crate::simulator::Simulator;

/// Name of the solver's output files inside the results directory.
pub const OUTPUT_BASENAME: &str = "multinest";

/// Evidence estimate reported by a solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverSummary {
    pub log_evidence: f64,
    pub log_evidence_err: f64,
    pub n_iterations: usize,
    pub n_likelihood_calls: usize,
}

/// A nested-sampling solver.
pub trait NestedSolver {
    /// Samples the posterior and writes `<basename>.txt`.
    fn solve<P, L>(
        &mut self,
        prior: P,
        log_likelihood: L,
        n_dims: usize,
        basename: &Path,
    ) -> Result<SolverSummary>
    where
        P: FnMut(&[f64]) -> Vec<f64>,
        L: FnMut(&[f64]) -> Result<f64>;
}

/// Posterior samples in the layout of `results.csv`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsTable {
    pub parameter_names: Vec<String>,
    pub likelihood: Array1<f64>,
    /// `rows × n_parameters`
    pub parameters: Array2<f64>,
    pub weights: Array1<f64>,
}

impl ResultsTable {
    pub fn rows(&self) -> usize {
        self.likelihood.len()
    }

    /// Builds the table from a solver output matrix.
    pub fn from_solver_output(
        parameter_names: Vec<String>,
        output: &Array2<f64>,
    ) -> Result<Self> {
        let n_params = parameter_names.len();
        if output.ncols() < 2 + n_params {
            return Err(Error::Solver(format!(
                "solver output has {} columns, expected at least {}",
                output.ncols(),
                2 + n_params
            )));
        }
        Ok(Self {
            likelihood: output.column(1).to_owned(),
            parameters: output.slice(ndarray::s![.., 2..2 + n_params]).to_owned(),
            weights: output.column(0).to_owned(),
            parameter_names,
        })
    }

    /// Writes the table with a leading row-number column.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut wtr = csv::Writer::from_path(path)?;
        let mut header = vec![String::new(), "likelihood".to_string()];
        header.extend(self.parameter_names.iter().cloned());
        header.push("weights".to_string());
        wtr.write_record(&header)?;
        for i in 0..self.rows() {
            let mut row = vec![i.to_string(), self.likelihood[i].to_string()];
            row.extend(self.parameters.row(i).iter().map(|v| v.to_string()));
            row.push(self.weights[i].to_string());
            wtr.write_record(&row)?;
        }
        wtr.flush().map_err(|e| Error::io(path, e))?;
        Ok(())
    }
}

/// Nested-sampling inference engine.
#[derive(Debug)]
pub struct NestedSampling<S> {
    priors: Priors,
    evaluator: LikelihoodEvaluator<S>,
    results_path: PathBuf,
    settings: NestedSamplingConfig,
    seed: u64,
}

impl<S: Simulator> NestedSampling<S> {
    pub fn new(
        priors: Priors,
        evaluator: LikelihoodEvaluator<S>,
        results_path: impl Into<PathBuf>,
        settings: NestedSamplingConfig,
        seed: u64,
    ) -> Self {
        Self {
            priors,
            evaluator,
            results_path: results_path.into(),
            settings,
            seed,
        }
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn prior_transform(&self, cube: &[f64]) -> Vec<f64> {
        transform(&self.priors, cube)
    }

    /// Log-likelihood of one parameter vector, in prior-declaration order.
    pub fn log_likelihood(&mut self, values: &[f64]) -> Result<f64> {
        self.evaluator.evaluate(ArrayView1::from(values))
    }

    /// Runs the built-in solver and writes `results.csv`.
    pub fn run(&mut self) -> Result<ResultsTable> {
        let mut solver = ConstrainedWalkSolver::new(self.settings.clone()).set_seed(self.seed);
        self.run_with(&mut solver)
    }

    pub fn run_with<N: NestedSolver>(&mut self, solver: &mut N) -> Result<ResultsTable> {
        fs::create_dir_all(&self.results_path).map_err(|e| Error::io(&self.results_path, e))?;
        let basename = self.results_path.join(OUTPUT_BASENAME);
        let priors = &self.priors;
        let evaluator = &mut self.evaluator;
        let summary = solver.solve(
            |cube| transform(priors, cube),
            |values| evaluator.evaluate(ArrayView1::from(values)),
            priors.len(),
            &basename,
        )?;
        info!(
            log_evidence = summary.log_evidence,
            err = summary.log_evidence_err,
            iterations = summary.n_iterations,
            likelihood_calls = summary.n_likelihood_calls,
            "nested sampling finished"
        );
        self.save_results()
    }

    /// Converts `multinest.txt` into `results.csv`.
    pub fn save_results(&self) -> Result<ResultsTable> {
        let output = read_fortran_table(
            self.results_path
                .join(format!("{OUTPUT_BASENAME}.txt")),
        )?;
        let names = self.priors.names().map(str::to_string).collect();
        let table = ResultsTable::from_solver_output(names, &output)?;
        let path = self.results_path.join("results.csv");
        table.write_csv(&path)?;
        info!(path = %path.display(), rows = table.rows(), "saved results");
        Ok(table)
    }
}

fn transform(priors: &Priors, cube: &[f64]) -> Vec<f64> {
    priors
        .iter()
        .zip(cube)
        .map(|((_, prior), &q)| prior.ppf(q))
        .collect()
}

/// Formats `x` as a Fortran `E` field with 18 significant digits,
/// e.g. `0.123456789012345678E+00`.
pub fn format_fortran(x: f64) -> String {
    if !x.is_finite() {
        return format!("{x}");
    }
    if x == 0.0 {
        return format!("0.{}E+00", "0".repeat(18));
    }
    let scientific = format!("{:.17e}", x.abs());
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let exponent = exponent.parse::<i32>().unwrap_or(0) + 1;
    let sign = if x < 0.0 { "-" } else { "" };
    let exp_sign = if exponent < 0 { '-' } else { '+' };
    format!("{sign}0.{digits}E{exp_sign}{:02}", exponent.abs())
}

/// Parses one Fortran number: `E` or `D` exponents, or a bare signed
/// exponent when three exponent digits did not leave room for the letter.
pub fn parse_fortran(token: &str) -> Option<f64> {
    let normalized = token.replace(['D', 'd'], "E");
    if let Ok(x) = normalized.parse::<f64>() {
        return Some(x);
    }
    let split = normalized
        .char_indices()
        .skip(1)
        .find(|&(i, c)| (c == '+' || c == '-') && !normalized[..i].ends_with(['E', 'e']))
        .map(|(i, _)| i)?;
    format!("{}E{}", &normalized[..split], &normalized[split..])
        .parse()
        .ok()
}

/// Reads a whitespace-separated numeric table written by a nested solver.
pub fn read_fortran_table(path: impl AsRef<Path>) -> Result<Array2<f64>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut values = Vec::new();
    let mut n_cols = None;
    let mut n_rows = 0;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        let row = line
            .split_whitespace()
            .map(|token| {
                parse_fortran(token).ok_or_else(|| {
                    Error::Solver(format!(
                        "{}:{}: cannot parse `{token}`",
                        path.display(),
                        line_no + 1
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        if row.is_empty() {
            continue;
        }
        match n_cols {
            None => n_cols = Some(row.len()),
            Some(n) if n != row.len() => {
                return Err(Error::Solver(format!(
                    "{}:{}: expected {n} columns, found {}",
                    path.display(),
                    line_no + 1,
                    row.len()
                )))
            }
            Some(_) => {}
        }
        values.extend(row);
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_cols.unwrap_or(0)), values)
        .map_err(|e| Error::Solver(format!("malformed table {}: {e}", path.display())))
}

/// Writes rows of `weight, log-likelihood, parameters...` in the solver's native format.
pub fn write_fortran_table(path: impl AsRef<Path>, rows: &[Vec<f64>]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        let line: String = row.iter().map(|&x| format!("{:>28}", format_fortran(x))).collect();
        writeln!(writer, "{line}").map_err(|e| Error::io(path, e))?;
    }
    writer.flush().map_err(|e| Error::io(path, e))?;
    Ok(())
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

#[derive(Debug, Clone)]
struct LivePoint {
    cube: Vec<f64>,
    params: Vec<f64>,
    log_l: f64,
}

/// Nested sampler that refills the live set with likelihood-constrained random walks.
#[derive(Debug, Clone)]
pub struct ConstrainedWalkSolver {
    settings: NestedSamplingConfig,
    step: f64,
    rng: SmallRng,
}

impl ConstrainedWalkSolver {
    pub fn new(settings: NestedSamplingConfig) -> Self {
        Self {
            settings,
            step: 0.1,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    fn uniform_cube(&mut self, n_dims: usize) -> Vec<f64> {
        (0..n_dims).map(|_| self.rng.gen::<f64>()).collect()
    }

    /// Random walk from `start` restricted to `log L > threshold`.
    fn constrained_walk<P, L>(
        &mut self,
        start: &LivePoint,
        threshold: f64,
        prior: &mut P,
        log_likelihood: &mut L,
        calls: &mut usize,
    ) -> Result<LivePoint>
    where
        P: FnMut(&[f64]) -> Vec<f64>,
        L: FnMut(&[f64]) -> Result<f64>,
    {
        let mut current = start.clone();
        let mut accepted = 0;
        for _ in 0..self.settings.walk_steps {
            let cube: Vec<f64> = current
                .cube
                .iter()
                .map(|&c| {
                    let z: f64 = self.rng.sample(StandardNormal);
                    reflect(c + self.step * z)
                })
                .collect();
            let params = prior(&cube);
            let log_l = log_likelihood(&params)?;
            *calls += 1;
            if log_l > threshold {
                current = LivePoint { cube, params, log_l };
                accepted += 1;
            }
        }
        let rate = accepted as f64 / self.settings.walk_steps.max(1) as f64;
        self.step = if rate > 0.5 {
            (self.step * 1.1).min(0.5)
        } else {
            (self.step / 1.1).max(1e-6)
        };
        Ok(current)
    }
}

/// Reflects into the unit interval, keeping clear of the endpoints.
fn reflect(x: f64) -> f64 {
    let mut y = x.rem_euclid(2.0);
    if y > 1.0 {
        y = 2.0 - y;
    }
    y.clamp(1e-12, 1.0 - 1e-12)
}

impl NestedSolver for ConstrainedWalkSolver {
    fn solve<P, L>(
        &mut self,
        mut prior: P,
        mut log_likelihood: L,
        n_dims: usize,
        basename: &Path,
    ) -> Result<SolverSummary>
    where
        P: FnMut(&[f64]) -> Vec<f64>,
        L: FnMut(&[f64]) -> Result<f64>,
    {
        let n_live = self.settings.n_live_points;
        if n_live < 2 {
            return Err(Error::Solver("need at least two live points".into()));
        }
        let mut calls = 0;
        let mut live = Vec::with_capacity(n_live);
        for _ in 0..n_live {
            let cube = self.uniform_cube(n_dims).into_iter().map(reflect).collect::<Vec<_>>();
            let params = prior(&cube);
            let log_l = log_likelihood(&params)?;
            calls += 1;
            live.push(LivePoint { cube, params, log_l });
        }

        // (log weight, log-likelihood, parameters) of every discarded point
        let mut dead: Vec<(f64, f64, Vec<f64>)> = Vec::new();
        let mut log_z = f64::NEG_INFINITY;
        let log_shrink = (1.0 - (-1.0 / n_live as f64).exp()).ln();
        let mut log_x = 0.0;
        let pb = progress_bar(self.settings.max_iterations, "Nested", true);

        let mut iteration = 0;
        while iteration < self.settings.max_iterations {
            iteration += 1;
            let (worst, _) = live
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.log_l.total_cmp(&b.1.log_l))
                .ok_or_else(|| Error::Solver("live set is empty".into()))?;
            let threshold = live[worst].log_l;
            let log_weight = log_x + log_shrink + threshold;
            log_z = log_sum_exp(log_z, log_weight);
            log_x -= 1.0 / n_live as f64;
            dead.push((log_weight, threshold, live[worst].params.clone()));

            let max_live = live
                .iter()
                .map(|p| p.log_l)
                .fold(f64::NEG_INFINITY, f64::max);
            let remaining = log_sum_exp(log_z, log_x + max_live) - log_z;
            pb.set_message(format!("logZ≈{log_z:.3} Δ≈{remaining:.3}"));
            pb.inc(1);
            if remaining < self.settings.evidence_tolerance {
                debug!(iteration, remaining, "evidence tolerance reached");
                live.swap_remove(worst);
                break;
            }

            let mut donor = self.rng.gen_range(0..n_live - 1);
            if donor >= worst {
                donor += 1;
            }
            let start = live[donor].clone();
            live[worst] = self.constrained_walk(
                &start,
                threshold,
                &mut prior,
                &mut log_likelihood,
                &mut calls,
            )?;
        }
        pb.finish_and_clear();

        // the remaining prior volume is shared evenly by the surviving live points
        let log_live_weight = log_x - (live.len() as f64).ln();
        for point in live {
            let log_weight = log_live_weight + point.log_l;
            log_z = log_sum_exp(log_z, log_weight);
            dead.push((log_weight, point.log_l, point.params));
        }

        let mut information = 0.0;
        let rows: Vec<Vec<f64>> = dead
            .into_iter()
            .map(|(log_weight, log_l, params)| {
                let weight = (log_weight - log_z).exp();
                if weight > 0.0 {
                    information += weight * (log_l - log_z);
                }
                let mut row = Vec::with_capacity(2 + params.len());
                row.push(weight);
                row.push(log_l);
                row.extend(params);
                row
            })
            .collect();

        let path = basename.with_extension("txt");
        write_fortran_table(&path, &rows)?;
        debug!(path = %path.display(), rows = rows.len(), "wrote solver output");

        Ok(SolverSummary {
            log_evidence: log_z,
            log_evidence_err: (information.max(0.0) / n_live as f64).sqrt(),
            n_iterations: iteration,
            n_likelihood_calls: calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use crate::distributions::{Likelihood, Prior};
    use crate::inference::likelihood::ObservedData;
    use crate::runner::ModelRunner;
    use crate::test_support::{counting_simulator, CountingSimulator};
    use approx::assert_abs_diff_eq;
    use indexmap::IndexMap;
    use ndarray::arr1;
    use tempfile::tempdir;

    #[test]
    fn test_format_fortran() {
        assert_eq!(format_fortran(0.0), "0.000000000000000000E+00");
        assert_eq!(format_fortran(1.0), "0.100000000000000000E+01");
        assert_eq!(format_fortran(-0.025), "-0.250000000000000000E-01");
        assert_eq!(format_fortran(123.5), "0.123500000000000000E+03");
    }

    #[test]
    fn test_parse_fortran_variants() {
        assert_eq!(parse_fortran("0.15D+02"), Some(15.0));
        assert_eq!(parse_fortran("-0.25E-01"), Some(-0.025));
        assert_eq!(parse_fortran("0.1-100"), Some(0.1e-100));
        assert_eq!(parse_fortran("abc"), None);
        let x = -1234.56789e-7;
        assert_abs_diff_eq!(parse_fortran(&format_fortran(x)).unwrap(), x, epsilon = 1e-20);
    }

    #[test]
    fn test_save_results_layout() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("multinest.txt"),
            "  0.25D+00 -0.1E+01  0.5E+00  0.7E+01\n  0.75D+00 -0.2E+01  0.4E+00  0.6E+01\n",
        )
        .unwrap();
        let engine = engine(dir.path(), NestedSamplingConfig::default());
        let table = engine.save_results().unwrap();
        assert_eq!(table.rows(), 2);
        assert_eq!(table.likelihood, arr1(&[-1.0, -2.0]));
        assert_eq!(table.weights, arr1(&[0.25, 0.75]));
        assert_eq!(table.parameters.row(1), arr1(&[0.4, 6.0]));

        let csv = std::fs::read_to_string(dir.path().join("results.csv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            ",likelihood,rates.alpha,rates.offset,weights"
        );
        assert_eq!(lines.next().unwrap(), "0,-1,0.5,7,0.25");
        assert_eq!(lines.count(), 1);
    }

    #[test]
    fn test_too_few_columns_is_solver_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("multinest.txt"), "0.5 -1.0 0.2\n").unwrap();
        let engine = engine(dir.path(), NestedSamplingConfig::default());
        assert!(matches!(engine.save_results(), Err(Error::Solver(_))));
    }

    #[test]
    fn test_solver_recovers_gaussian_evidence() {
        let dir = tempdir().unwrap();
        let settings = NestedSamplingConfig {
            n_live_points: 200,
            evidence_tolerance: 0.01,
            max_iterations: 5000,
            walk_steps: 20,
        };
        let mut solver = ConstrainedWalkSolver::new(settings).set_seed(11);
        let sigma: f64 = 0.1;
        let norm = -(sigma * (2.0 * std::f64::consts::PI).sqrt()).ln();
        let summary = solver
            .solve(
                |cube| cube.to_vec(),
                |x| {
                    let z = (x[0] - 0.5) / sigma;
                    Ok(norm - 0.5 * z * z)
                },
                1,
                &dir.path().join("multinest"),
            )
            .unwrap();
        // Gaussian mass inside [0, 1] is ~1
        assert!(summary.log_evidence.abs() < 0.5, "{summary:?}");

        let output = read_fortran_table(dir.path().join("multinest.txt")).unwrap();
        assert_eq!(output.ncols(), 3);
        assert_abs_diff_eq!(output.column(0).sum(), 1.0, epsilon = 1e-9);
        let mean = output
            .rows()
            .into_iter()
            .map(|row| row[0] * row[2])
            .sum::<f64>();
        assert_abs_diff_eq!(mean, 0.5, epsilon = 0.05);
    }

    #[test]
    fn test_tolerance_stop_drops_discarded_point_from_live_set() {
        let dir = tempdir().unwrap();
        let settings = NestedSamplingConfig {
            n_live_points: 5,
            evidence_tolerance: 100.0,
            max_iterations: 50,
            walk_steps: 5,
        };
        let mut solver = ConstrainedWalkSolver::new(settings).set_seed(4);
        let summary = solver
            .solve(
                |cube| cube.to_vec(),
                |x| Ok(-x[0]),
                1,
                &dir.path().join("multinest"),
            )
            .unwrap();
        assert_eq!(summary.n_iterations, 1);

        let output = read_fortran_table(dir.path().join("multinest.txt")).unwrap();
        assert_eq!(output.nrows(), 5);
        for (i, a) in output.rows().into_iter().enumerate() {
            for b in output.rows().into_iter().skip(i + 1) {
                assert!(a[1] != b[1] || a[2] != b[2], "row repeated: {a:?}");
            }
        }
        assert_abs_diff_eq!(output.column(0).sum(), 1.0, epsilon = 1e-9);
    }

    fn engine(results: &Path, settings: NestedSamplingConfig) -> NestedSampling<CountingSimulator> {
        let names = vec!["rates.alpha".to_string(), "rates.offset".to_string()];
        let priors = Priors::new(IndexMap::from([
            (names[0].clone(), Prior::Uniform { low: 0.0, high: 4.0 }),
            (names[1].clone(), Prior::Normal { loc: 1.0, scale: 0.5 }),
        ]));
        let data: DataConfig = serde_yaml::from_str(
            "
observed_data: unused.csv
observable:
  cases_per_timestep:
    time_stamps: all
    error: 0.3
",
        )
        .unwrap();
        let observed = ObservedData::new(IndexMap::from([(
            "cases_per_timestep".to_string(),
            arr1(&[1.0, 3.0, 5.0, 7.0]),
        )]));
        let runner = ModelRunner::new(counting_simulator(), names).unwrap();
        let evaluator =
            LikelihoodEvaluator::new(runner, &data, &observed, Likelihood::Normal, 1e-6).unwrap();
        NestedSampling::new(priors, evaluator, results, settings, 3)
    }

    #[test]
    fn test_prior_transform_uses_ppf() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path(), NestedSamplingConfig::default());
        let params = engine.prior_transform(&[0.25, 0.5]);
        assert_abs_diff_eq!(params[0], 1.0);
        assert_abs_diff_eq!(params[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_run_writes_results_with_solver_row_count() {
        let dir = tempdir().unwrap();
        let settings = NestedSamplingConfig {
            n_live_points: 10,
            evidence_tolerance: 0.5,
            max_iterations: 30,
            walk_steps: 5,
        };
        let mut engine = engine(&dir.path().join("results"), settings);
        let table = engine.run().unwrap();
        let native = read_fortran_table(dir.path().join("results/multinest.txt")).unwrap();
        assert_eq!(table.rows(), native.nrows());
        assert_eq!(native.ncols(), 4);
        assert!(table.parameters.column(0).iter().all(|&a| (0.0..=4.0).contains(&a)));

        let mut reader = csv::Reader::from_path(dir.path().join("results/results.csv")).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, vec!["", "likelihood", "rates.alpha", "rates.offset", "weights"]);
        assert_eq!(reader.records().count(), native.nrows());
    }

    #[test]
    fn test_log_likelihood_matches_evaluator() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path(), NestedSamplingConfig::default());
        let best = engine.log_likelihood(&[2.0, 1.0]).unwrap();
        let worse = engine.log_likelihood(&[0.5, 1.0]).unwrap();
        assert!(best > worse);
    }
}
