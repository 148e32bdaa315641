//! The one routine that scores a simulation against the observed channels.
//!
//! Both inference engines go through [`LikelihoodEvaluator`]: it runs the
//! simulator once for a named parameter sample and sums, over every observed
//! channel and every selected timestep, the log-density of the observation
//! under the configured likelihood family. The family is parameterised by the
//! prediction and a heteroscedastic model error
//!
//! ```text
//! error_t = max(rel_error · sqrt(Σ_{s ≤ t} y_s²), min_error)
//! ```

use std::fs::File;
use std::path::Path;

use indexmap::IndexMap;
use ndarray::{Array1, ArrayView1};

use crate::config::{DataConfig, TimeStamps};
use crate::distributions::Likelihood;
use crate::error::{Error, Result};
use crate::runner::ModelRunner;
use crate::simulator::Simulator;

/// Observed time series, one per channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservedData {
    channels: IndexMap<String, Array1<f64>>,
}

impl ObservedData {
    pub fn new(channels: IndexMap<String, Array1<f64>>) -> Self {
        Self { channels }
    }

    /// Reads a CSV with one column per channel and one row per timestep.
    ///
    /// An unnamed leading column (a written-out row index) is ignored.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut reader = csv::Reader::from_reader(file);
        let headers = reader.headers()?.clone();
        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            for (col, field) in record.iter().enumerate() {
                if headers.get(col).map_or(true, str::is_empty) {
                    continue;
                }
                let value = field.trim().parse::<f64>().map_err(|_| {
                    Error::Config(format!(
                        "{}: row {row}, column `{}` is not a number: `{field}`",
                        path.display(),
                        &headers[col]
                    ))
                })?;
                columns[col].push(value);
            }
        }
        let channels = headers
            .iter()
            .zip(columns)
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, values)| (name.to_string(), Array1::from(values)))
            .collect();
        Ok(Self { channels })
    }

    pub fn channel(&self, name: &str) -> Result<&Array1<f64>> {
        self.channels
            .get(name)
            .ok_or_else(|| Error::MissingChannel(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}

/// An observed channel with its timestep selection and relative error.
#[derive(Debug, Clone, PartialEq)]
struct Channel {
    name: String,
    time_stamps: TimeStamps,
    rel_error: f64,
    observed: Array1<f64>,
}

/// Heteroscedastic model error of a predicted series.
pub fn model_error(prediction: ArrayView1<f64>, rel_error: f64, min_error: f64) -> Array1<f64> {
    let mut running = 0.0;
    prediction.mapv(|y| {
        running += y * y;
        (rel_error * running.sqrt()).max(min_error)
    })
}

/// Scores simulator runs against observed data.
#[derive(Debug, Clone)]
pub struct LikelihoodEvaluator<S> {
    runner: ModelRunner<S>,
    channels: Vec<Channel>,
    likelihood: Likelihood,
    min_error: f64,
}

impl<S: Simulator> LikelihoodEvaluator<S> {
    /// Fails with [`Error::MissingChannel`] if an observable has no observed column.
    pub fn new(
        runner: ModelRunner<S>,
        data: &DataConfig,
        observed: &ObservedData,
        likelihood: Likelihood,
        min_error: f64,
    ) -> Result<Self> {
        let channels = data
            .observable
            .iter()
            .map(|(name, obs)| {
                Ok(Channel {
                    name: name.clone(),
                    time_stamps: obs.time_stamps.clone(),
                    rel_error: obs.error,
                    observed: observed.channel(name)?.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            runner,
            channels,
            likelihood,
            min_error,
        })
    }

    pub fn parameter_names(&self) -> &[String] {
        self.runner.parameter_paths()
    }

    /// Log-likelihood of the observations given parameter values in declaration order.
    pub fn evaluate(&mut self, values: ArrayView1<f64>) -> Result<f64> {
        let bundle = self.runner.run_model(values)?;
        let mut total = 0.0;
        for channel in &self.channels {
            let prediction = bundle.get(&channel.name)?;
            let error = model_error(prediction.view(), channel.rel_error, self.min_error);
            let selected = channel.time_stamps.resolve(prediction.len())?;
            for t in selected {
                let observed = channel.observed.get(t).copied().ok_or_else(|| {
                    Error::DimensionMismatch(format!(
                        "channel `{}` has {} observations, timestep {t} requested",
                        channel.name,
                        channel.observed.len()
                    ))
                })?;
                total += self.likelihood.log_prob(observed, prediction[t], error[t]);
            }
        }
        Ok(total)
    }

    /// Same as [`LikelihoodEvaluator::evaluate`] with values keyed by parameter name.
    pub fn evaluate_samples(&mut self, samples: &IndexMap<String, f64>) -> Result<f64> {
        let values = self
            .parameter_names()
            .iter()
            .map(|name| {
                samples.get(name).copied().ok_or_else(|| {
                    Error::DimensionMismatch(format!("no value supplied for `{name}`"))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        self.evaluate(ArrayView1::from(&values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{counting_simulator, CountingSimulator};
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use std::io::Write;

    fn data_config(time_stamps: &str) -> DataConfig {
        serde_yaml::from_str(&format!(
            "
observed_data: unused.csv
observable:
  cases_per_timestep:
    time_stamps: {time_stamps}
    error: 0.5
"
        ))
        .unwrap()
    }

    fn observed(values: &[f64]) -> ObservedData {
        ObservedData::new(
            [("cases_per_timestep".to_string(), arr1(values))]
                .into_iter()
                .collect(),
        )
    }

    fn evaluator(time_stamps: &str, obs: &[f64]) -> LikelihoodEvaluator<CountingSimulator> {
        let runner = ModelRunner::new(
            counting_simulator(),
            vec!["rates.alpha".into(), "rates.offset".into()],
        )
        .unwrap();
        LikelihoodEvaluator::new(
            runner,
            &data_config(time_stamps),
            &observed(obs),
            Likelihood::Normal,
            1e-6,
        )
        .unwrap()
    }

    #[test]
    fn test_model_error_is_cumulative_and_floored() {
        let err = model_error(arr1(&[0.0, 3.0, 4.0]).view(), 0.5, 0.1);
        assert_abs_diff_eq!(err, arr1(&[0.1, 1.5, 2.5]), epsilon = 1e-12);
    }

    #[test]
    fn test_evaluate_sums_selected_timesteps() {
        // alpha = 1, offset = 1: prediction [1, 2, 3, 4]
        let obs = [1.0, 2.5, 3.0, 5.0];
        let mut full = evaluator("all", &obs);
        let mut some = evaluator("[1, 3]", &obs);
        let values = arr1(&[1.0, 1.0]);

        let prediction = arr1(&[1.0, 2.0, 3.0, 4.0]);
        let error = model_error(prediction.view(), 0.5, 1e-6);
        let expected = |ts: &[usize]| -> f64 {
            ts.iter()
                .map(|&t| Likelihood::Normal.log_prob(obs[t], prediction[t], error[t]))
                .sum()
        };
        assert_abs_diff_eq!(
            full.evaluate(values.view()).unwrap(),
            expected(&[0, 1, 2, 3]),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            some.evaluate(values.view()).unwrap(),
            expected(&[1, 3]),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_evaluate_sums_over_channels() {
        let data: DataConfig = serde_yaml::from_str(
            "
observed_data: unused.csv
observable:
  cases_per_timestep:
    time_stamps: all
    error: 0.5
  deaths_per_timestep:
    time_stamps: [1, 3]
    error: 0.1
",
        )
        .unwrap();
        let cases_obs = arr1(&[1.0, 2.5, 3.0, 5.0]);
        let deaths_obs = arr1(&[9.0, 1.2, 9.0, 1.7]);
        let observed = ObservedData::new(
            [
                ("cases_per_timestep".to_string(), cases_obs.clone()),
                ("deaths_per_timestep".to_string(), deaths_obs.clone()),
            ]
            .into_iter()
            .collect(),
        );
        let runner = ModelRunner::new(
            counting_simulator(),
            vec!["rates.alpha".into(), "rates.offset".into()],
        )
        .unwrap();
        let mut evaluator =
            LikelihoodEvaluator::new(runner, &data, &observed, Likelihood::Normal, 1e-6).unwrap();

        // alpha = 1, offset = 1: cases [1, 2, 3, 4], deaths half of that
        let cases = arr1(&[1.0, 2.0, 3.0, 4.0]);
        let deaths = cases.mapv(|c| 0.5 * c);
        let cases_err = model_error(cases.view(), 0.5, 1e-6);
        let deaths_err = model_error(deaths.view(), 0.1, 1e-6);
        let cases_term: f64 = (0..4)
            .map(|t| Likelihood::Normal.log_prob(cases_obs[t], cases[t], cases_err[t]))
            .sum();
        let deaths_term: f64 = [1, 3]
            .iter()
            .map(|&t| Likelihood::Normal.log_prob(deaths_obs[t], deaths[t], deaths_err[t]))
            .sum();

        assert_abs_diff_eq!(
            evaluator.evaluate(arr1(&[1.0, 1.0]).view()).unwrap(),
            cases_term + deaths_term,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_better_fit_scores_higher() {
        let mut evaluator = evaluator("all", &[2.0, 4.0, 6.0, 8.0]);
        let good = evaluator.evaluate(arr1(&[2.0, 2.0]).view()).unwrap();
        let bad = evaluator.evaluate(arr1(&[0.5, 2.0]).view()).unwrap();
        assert!(good > bad);
    }

    #[test]
    fn test_missing_channel_in_observed_data() {
        let runner = ModelRunner::new(counting_simulator(), vec!["rates.alpha".into()]).unwrap();
        let result = LikelihoodEvaluator::new(
            runner,
            &data_config("all"),
            &ObservedData::default(),
            Likelihood::Normal,
            1e-6,
        );
        assert!(matches!(result, Err(Error::MissingChannel(_))));
    }

    #[test]
    fn test_time_stamp_beyond_series() {
        let mut evaluator = evaluator("[9]", &[0.0; 4]);
        assert!(matches!(
            evaluator.evaluate(arr1(&[1.0, 0.0]).view()),
            Err(Error::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_evaluate_samples_by_name() {
        let mut evaluator = evaluator("all", &[1.0, 2.0, 3.0, 4.0]);
        let samples: IndexMap<String, f64> =
            [("rates.offset".to_string(), 1.0), ("rates.alpha".to_string(), 1.0)]
                .into_iter()
                .collect();
        let by_name = evaluator.evaluate_samples(&samples).unwrap();
        let by_order = evaluator.evaluate(arr1(&[1.0, 1.0]).view()).unwrap();
        assert_eq!(by_name, by_order);
    }

    #[test]
    fn test_observed_csv_skips_index_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observed.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, ",cases_per_timestep,deaths_per_timestep").unwrap();
        writeln!(file, "0,1.5,0").unwrap();
        writeln!(file, "1,2.5,1").unwrap();
        drop(file);

        let data = ObservedData::from_csv(&path).unwrap();
        assert_eq!(
            data.names().collect::<Vec<_>>(),
            vec!["cases_per_timestep", "deaths_per_timestep"]
        );
        assert_eq!(data.channel("cases_per_timestep").unwrap(), &arr1(&[1.5, 2.5]));
        assert!(matches!(data.channel("hospitalised"), Err(Error::MissingChannel(_))));
    }
}
