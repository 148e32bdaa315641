//! Error type shared by the sample generator and the inference engines.

use thiserror::Error;

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while generating samples or calibrating.
///
/// None of these are recovered from locally; they bubble up to the binary,
/// which logs them and exits.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("parameter path `{path}` does not resolve: no attribute `{segment}`")]
    AttributeResolution { path: String, segment: String },

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("simulator output `{0}` not found in result bundle")]
    MissingOutput(String),

    #[error("observed channel `{0}` not found")]
    MissingChannel(String),

    #[error("gathered {actual} rows but {expected} samples were requested")]
    AggregationInvariant { expected: usize, actual: usize },

    #[error("distribution `{0}` is not implemented")]
    UnsupportedDistribution(String),

    #[error("likelihood `{0}` is not implemented")]
    UnsupportedLikelihood(String),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("solver error: {0}")]
    Solver(String),
}

impl Error {
    /// Wraps an [`std::io::Error`] with the path that caused it.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}
