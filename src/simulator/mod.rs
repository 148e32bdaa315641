/*!
# Simulator Interface

The calibration harness never looks inside the epidemic model. It only needs:

- a [`ParameterTree`] whose leaves can be addressed by dotted path
  (`"infection.beta"`) and overwritten in place,
- a way to rebuild the model from its base configuration ([`Simulator::reset`]),
- a call that runs one full simulation and returns a named [`ResultBundle`] of
  per-timestep output series.

A simulator instance is mutable state owned by exactly one rank or chain. It is
never shared between threads; each worker builds its own.

```rust
use epi_calibrate::simulator::ParameterTree;

let mut tree: ParameterTree = serde_yaml::from_str("infection:\n  beta: 0.3\n").unwrap();
tree.make_trainable("infection.beta").unwrap();
tree.assign("infection.beta", 0.7).unwrap();
assert_eq!(tree.get("infection.beta").unwrap(), 0.7);
assert!(tree.assign("infection.gamma", 1.0).is_err());
```
*/

pub mod renewal;

use indexmap::IndexMap;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use renewal::{RenewalConfiguration, RenewalSimulator};

/// A mutable, stochastic simulator addressed through its parameter tree.
pub trait Simulator {
    /// Read access to the current parameter tree.
    fn parameters(&self) -> &ParameterTree;

    /// Mutable access to the parameter tree. Writes take effect on the next [`Simulator::run`].
    fn parameters_mut(&mut self) -> &mut ParameterTree;

    /// Rebuilds the model from its base configuration.
    ///
    /// Any value written through [`Simulator::parameters_mut`] is discarded. The random
    /// stream is not rewound, so replicas after a reset still differ.
    fn reset(&mut self);

    /// Runs one full simulation.
    fn run(&mut self) -> Result<ResultBundle>;
}

/// One node of a [`ParameterTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawNode", into = "RawNode")]
pub enum ParameterNode {
    /// A value read from configuration.
    Fixed(f64),
    /// A placeholder installed by the calibration harness.
    Trainable(f64),
    Branch(IndexMap<String, ParameterNode>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawNode {
    Value(f64),
    Branch(IndexMap<String, RawNode>),
}

impl From<RawNode> for ParameterNode {
    fn from(raw: RawNode) -> Self {
        match raw {
            RawNode::Value(v) => ParameterNode::Fixed(v),
            RawNode::Branch(children) => ParameterNode::Branch(
                children.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<ParameterNode> for RawNode {
    fn from(node: ParameterNode) -> Self {
        match node {
            ParameterNode::Fixed(v) | ParameterNode::Trainable(v) => RawNode::Value(v),
            ParameterNode::Branch(children) => {
                RawNode::Branch(children.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// Nested mapping of named numeric leaves, addressed by dotted path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterTree {
    root: IndexMap<String, ParameterNode>,
}

impl ParameterTree {
    /// Returns the value of the leaf at `path`.
    pub fn get(&self, path: &str) -> Result<f64> {
        match self.resolve(path)? {
            ParameterNode::Fixed(v) | ParameterNode::Trainable(v) => Ok(*v),
            ParameterNode::Branch(_) => Err(not_a_leaf(path)),
        }
    }

    /// Whether the leaf at `path` currently holds a harness-installed placeholder.
    pub fn is_trainable(&self, path: &str) -> Result<bool> {
        Ok(matches!(self.resolve(path)?, ParameterNode::Trainable(_)))
    }

    /// Replaces the leaf at `path` with a fresh trainable placeholder set to zero.
    pub fn make_trainable(&mut self, path: &str) -> Result<()> {
        let leaf = self.resolve_leaf_mut(path)?;
        *leaf = ParameterNode::Trainable(0.0);
        Ok(())
    }

    /// Overwrites the value of the leaf at `path`, keeping its kind.
    pub fn assign(&mut self, path: &str, value: f64) -> Result<()> {
        if let ParameterNode::Fixed(v) | ParameterNode::Trainable(v) = self.resolve_leaf_mut(path)? {
            *v = value;
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> Result<&ParameterNode> {
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default();
        let mut node = self
            .root
            .get(first)
            .ok_or_else(|| unresolved(path, first))?;
        for segment in segments {
            node = match node {
                ParameterNode::Branch(children) => {
                    children.get(segment).ok_or_else(|| unresolved(path, segment))?
                }
                _ => return Err(unresolved(path, segment)),
            };
        }
        Ok(node)
    }

    fn resolve_leaf_mut(&mut self, path: &str) -> Result<&mut ParameterNode> {
        let mut segments = path.split('.');
        let first = segments.next().unwrap_or_default();
        let mut node = self
            .root
            .get_mut(first)
            .ok_or_else(|| unresolved(path, first))?;
        for segment in segments {
            node = match node {
                ParameterNode::Branch(children) => children
                    .get_mut(segment)
                    .ok_or_else(|| unresolved(path, segment))?,
                _ => return Err(unresolved(path, segment)),
            };
        }
        if matches!(node, ParameterNode::Branch(_)) {
            return Err(not_a_leaf(path));
        }
        Ok(node)
    }
}

fn unresolved(path: &str, segment: &str) -> Error {
    Error::AttributeResolution {
        path: path.to_string(),
        segment: segment.to_string(),
    }
}

fn not_a_leaf(path: &str) -> Error {
    let segment = path.rsplit('.').next().unwrap_or(path);
    Error::AttributeResolution {
        path: path.to_string(),
        segment: format!("{segment} (not a leaf)"),
    }
}

/// Named output series of one simulation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultBundle {
    series: IndexMap<String, Array1<f64>>,
}

impl ResultBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, series: Array1<f64>) {
        self.series.insert(name.into(), series);
    }

    /// Looks up one output series.
    pub fn get(&self, name: &str) -> Result<&Array1<f64>> {
        self.series
            .get(name)
            .ok_or_else(|| Error::MissingOutput(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ParameterTree {
        serde_yaml::from_str(
            "
population:
  size: 1000
infection:
  beta: 0.3
  contacts: 8
",
        )
        .unwrap()
    }

    #[test]
    fn test_make_trainable_resets_value() {
        let mut t = tree();
        assert!(!t.is_trainable("infection.beta").unwrap());
        t.make_trainable("infection.beta").unwrap();
        assert!(t.is_trainable("infection.beta").unwrap());
        assert_eq!(t.get("infection.beta").unwrap(), 0.0);
        t.assign("infection.beta", 0.9).unwrap();
        assert!(t.is_trainable("infection.beta").unwrap());
        assert_eq!(t.get("infection.beta").unwrap(), 0.9);
    }

    #[test]
    fn test_unknown_segment_is_attribute_error() {
        let mut t = tree();
        match t.assign("infection.gamma", 1.0) {
            Err(Error::AttributeResolution { path, segment }) => {
                assert_eq!(path, "infection.gamma");
                assert_eq!(segment, "gamma");
            }
            other => panic!("expected attribute error, got {other:?}"),
        }
        assert!(matches!(
            t.make_trainable("recovery.rate"),
            Err(Error::AttributeResolution { .. })
        ));
    }

    #[test]
    fn test_branch_is_not_assignable() {
        let mut t = tree();
        assert!(t.assign("infection", 1.0).is_err());
        assert!(t.get("infection").is_err());
        assert!(t.get("infection.beta.x").is_err());
    }

    #[test]
    fn test_bundle_missing_output() {
        let mut bundle = ResultBundle::new();
        bundle.insert("cases_per_timestep", Array1::zeros(3));
        assert_eq!(bundle.get("cases_per_timestep").unwrap().len(), 3);
        assert!(matches!(
            bundle.get("deaths"),
            Err(Error::MissingOutput(name)) if name == "deaths"
        ));
    }
}
