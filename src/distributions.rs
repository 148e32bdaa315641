/*!
Priors, observation likelihoods and the random-walk proposal used by the
calibration engines.

Priors are one-dimensional and come in two families, `Uniform { low, high }`
and `Normal { loc, scale }`. Each exposes

- [`Prior::ppf`], the inverse CDF used by nested sampling to map the unit cube
  onto parameter space,
- [`Prior::sample`] and [`Prior::log_prob`] for MCMC,
- a bijection onto the whole real line ([`Prior::to_unconstrained`] /
  [`Prior::to_constrained`]) so MCMC proposals never leave the support.

# Examples

```rust
use epi_calibrate::distributions::Prior;

let prior = Prior::Uniform { low: 5.0, high: 10.0 };
assert_eq!(prior.ppf(0.5), 7.5);

let u = prior.to_unconstrained(6.0);
assert!((prior.to_constrained(u) - 6.0).abs() < 1e-12);
```
*/

use std::f64::consts::PI;

use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use statrs::distribution::{ContinuousCDF, Normal as NormalCdf, Uniform as UniformCdf};

use crate::config::{FitParameter, PriorSpec};
use crate::error::{Error, Result};

/// A trait for generating proposals in Metropolis-Hastings or similar algorithms.
pub trait ProposalDistribution {
    /// Samples a new point from q(x' | x).
    fn sample(&mut self, current: &[f64]) -> Vec<f64>;

    /// Evaluates log q(x' | x).
    fn log_prob(&self, from: &[f64], to: &[f64]) -> f64;

    /// Returns a new instance of this proposal distribution seeded with `seed`.
    fn set_seed(self, seed: u64) -> Self;
}

/// One-dimensional prior over a fitted parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prior {
    Uniform { low: f64, high: f64 },
    Normal { loc: f64, scale: f64 },
}

impl Prior {
    /// Builds a prior from its configuration entry.
    ///
    /// Fails with [`Error::UnsupportedDistribution`] for any family other than
    /// `Uniform` and `Normal`, and with [`Error::Config`] for missing or
    /// invalid arguments.
    pub fn from_spec(spec: &PriorSpec) -> Result<Self> {
        let arg = |name: &str| {
            spec.args.get(name).copied().ok_or_else(|| {
                Error::Config(format!("{} prior is missing `{name}`", spec.dist))
            })
        };
        match spec.dist.as_str() {
            "Uniform" => {
                let (low, high) = (arg("low")?, arg("high")?);
                if !(low < high) {
                    return Err(Error::Config(format!(
                        "Uniform prior needs low < high, got [{low}, {high}]"
                    )));
                }
                Ok(Prior::Uniform { low, high })
            }
            "Normal" => {
                let (loc, scale) = (arg("loc")?, arg("scale")?);
                if !(scale > 0.0) {
                    return Err(Error::Config(format!(
                        "Normal prior needs a positive scale, got {scale}"
                    )));
                }
                Ok(Prior::Normal { loc, scale })
            }
            other => Err(Error::UnsupportedDistribution(other.to_string())),
        }
    }

    /// Inverse CDF. `q` is clamped into `[0, 1]`; a NaN `q` or invalid prior gives NaN.
    pub fn ppf(&self, q: f64) -> f64 {
        if q.is_nan() {
            return f64::NAN;
        }
        let q = q.clamp(0.0, 1.0);
        match *self {
            Prior::Uniform { low, high } => UniformCdf::new(low, high).ok().map(|d| d.inverse_cdf(q)),
            Prior::Normal { loc, scale } => NormalCdf::new(loc, scale).ok().map(|d| d.inverse_cdf(q)),
        }
        .unwrap_or(f64::NAN)
    }

    /// Normalized log-density.
    pub fn log_prob(&self, x: f64) -> f64 {
        match *self {
            Prior::Uniform { low, high } => {
                if low <= x && x <= high {
                    -(high - low).ln()
                } else {
                    f64::NEG_INFINITY
                }
            }
            Prior::Normal { loc, scale } => normal_log_prob(x, loc, scale),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Prior::Uniform { low, high } => Uniform::new(low, high).sample(rng),
            Prior::Normal { loc, scale } => Normal::new(loc, scale)
                .map(|n| n.sample(rng))
                .unwrap_or(loc),
        }
    }

    /// Maps a value from the support onto the real line.
    pub fn to_unconstrained(&self, x: f64) -> f64 {
        match *self {
            Prior::Uniform { low, high } => {
                let p = (x - low) / (high - low);
                (p / (1.0 - p)).ln()
            }
            Prior::Normal { .. } => x,
        }
    }

    /// Maps an unconstrained value back onto the support.
    pub fn to_constrained(&self, u: f64) -> f64 {
        match *self {
            Prior::Uniform { low, high } => low + (high - low) * sigmoid(u),
            Prior::Normal { .. } => u,
        }
    }

    /// log |d to_constrained / du| at `u`.
    pub fn log_abs_det_jacobian(&self, u: f64) -> f64 {
        match *self {
            Prior::Uniform { low, high } => {
                // log σ(u) + log(1 - σ(u)) = -(softplus(-u) + softplus(u))
                (high - low).ln() - softplus(-u) - softplus(u)
            }
            Prior::Normal { .. } => 0.0,
        }
    }
}

fn sigmoid(u: f64) -> f64 {
    if u >= 0.0 {
        1.0 / (1.0 + (-u).exp())
    } else {
        let e = u.exp();
        e / (1.0 + e)
    }
}

fn softplus(u: f64) -> f64 {
    if u > 30.0 {
        u
    } else {
        u.exp().ln_1p()
    }
}

/// Ordered set of named priors. Order fixes the column order of every result.
#[derive(Debug, Clone, PartialEq)]
pub struct Priors {
    entries: IndexMap<String, Prior>,
}

impl Priors {
    pub fn new(entries: IndexMap<String, Prior>) -> Self {
        Self { entries }
    }

    /// Reads every prior before anything is sampled, so a bad family fails early.
    pub fn from_config(parameters: &IndexMap<String, FitParameter>) -> Result<Self> {
        let entries = parameters
            .iter()
            .map(|(name, p)| Ok((name.clone(), Prior::from_spec(&p.prior)?)))
            .collect::<Result<IndexMap<_, _>>>()?;
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Prior)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Distribution family of the observation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Likelihood {
    Normal,
    Laplace,
}

impl Likelihood {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "Normal" => Ok(Likelihood::Normal),
            "Laplace" => Ok(Likelihood::Laplace),
            other => Err(Error::UnsupportedLikelihood(other.to_string())),
        }
    }

    /// Log-density of `x` under the family with location `loc` and scale `scale`.
    pub fn log_prob(&self, x: f64, loc: f64, scale: f64) -> f64 {
        match self {
            Likelihood::Normal => normal_log_prob(x, loc, scale),
            Likelihood::Laplace => -(x - loc).abs() / scale - (2.0 * scale).ln(),
        }
    }
}

fn normal_log_prob(x: f64, loc: f64, scale: f64) -> f64 {
    let z = (x - loc) / scale;
    -0.5 * z * z - scale.ln() - 0.5 * (2.0 * PI).ln()
}

/**
An isotropic Gaussian random-walk proposal.

Adds independent Gaussian noise (mean 0, standard deviation `std`) to each
coordinate of the current state. `std` is public so a sampler can adapt it
during warmup.

```rust
use epi_calibrate::distributions::{IsotropicGaussian, ProposalDistribution};

let mut proposal = IsotropicGaussian::new(1.0).set_seed(42);
let candidate = proposal.sample(&[0.0, 0.0]);
assert_eq!(candidate.len(), 2);
```
*/
#[derive(Debug, Clone)]
pub struct IsotropicGaussian {
    pub std: f64,
    rng: SmallRng,
}

impl IsotropicGaussian {
    /// Creates a new isotropic Gaussian proposal distribution with the specified standard deviation.
    pub fn new(std: f64) -> Self {
        Self {
            std,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl ProposalDistribution for IsotropicGaussian {
    fn sample(&mut self, current: &[f64]) -> Vec<f64> {
        let Ok(normal) = Normal::new(0.0, self.std) else {
            return current.to_vec();
        };
        normal
            .sample_iter(&mut self.rng)
            .zip(current)
            .map(|(eps, x)| x + eps)
            .collect()
    }

    fn log_prob(&self, from: &[f64], to: &[f64]) -> f64 {
        from.iter()
            .zip(to)
            .map(|(&f, &t)| normal_log_prob(t, f, self.std))
            .sum()
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}
