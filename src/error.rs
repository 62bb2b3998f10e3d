/// Errors that can occur when running the doublet detection.
#[derive(Debug, thiserror::Error)]
pub enum ScrubletError {
    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("unknown distance metric: {0}")]
    UnknownMetric(String),

    #[error("distance metric `{metric}` is not supported by the {backend} neighbour search")]
    UnsupportedMetric {
        metric: String,
        backend: &'static str,
    },

    #[error("dimension mismatch: {0}")]
    Dimension(String),

    #[error("no genes passed the expression and variability filter")]
    NoGenesRetained,

    #[error("decomposition failed: {0}")]
    Decomposition(String),
}

impl ScrubletError {
    /// Convenience for parameter errors built from a format string.
    pub fn param(msg: impl Into<String>) -> Self {
        Self::Parameter(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ScrubletError>;
