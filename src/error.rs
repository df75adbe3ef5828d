use thiserror::Error;

/// Failures of an evaluation call.
#[derive(Debug, Error)]
pub enum EvalError {
    /// Configuration and model schema disagree (conditional vs unconditional).
    #[error("contract violation: {0}")]
    ContractViolation(String),
    /// Non-finite generator output or a sentinel-tagged metric value.
    #[error("numeric corruption: {context}")]
    NumericCorruption { context: String },
    #[error("not enough examples: {available} available, {requested} requested")]
    NotEnoughExamples { available: i64, requested: i64 },
    #[error("raw images of this data sample were discarded")]
    ImagesDiscarded,
    #[error("features were not computed for this data sample")]
    MissingFeatures,
    /// Two tasks produced the same result key.
    #[error("metric key `{0}` produced by more than one task")]
    DuplicateMetric(String),
    #[error(transparent)]
    Torch(#[from] tch::TchError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    pub fn corruption(context: impl Into<String>) -> Self {
        Self::NumericCorruption {
            context: context.into(),
        }
    }
}
