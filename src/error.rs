//! Error types shared across the evolution loop.

use thiserror::Error;

use crate::evaluator::EvaluatorError;
use crate::store::StoreError;
use crate::strategy::StrategyError;

pub type Result<T> = std::result::Result<T, EvolveError>;

/// Errors surfaced by the generator, selection and orchestration layers.
#[derive(Debug, Error)]
pub enum EvolveError {
    /// A parameter set references an undeclared field or a value violates its field.
    #[error("schema error: {0}")]
    Schema(String),

    /// A field cannot be sampled (empty choice, inverted or non-finite bounds).
    #[error("bounds error: {0}")]
    Bounds(String),

    /// Selection was asked to pick from zero records.
    #[error("empty population: nothing to select from")]
    EmptyPopulation,

    /// A record lacks statistics the caller requires.
    #[error("record {id} is missing metrics: {missing:?}")]
    IncompleteMetrics { id: String, missing: Vec<String> },

    /// An evaluation did not finish within the polling window.
    #[error("evaluation of {candidate} timed out after {waited_secs}s")]
    EvaluatorTimeout { candidate: String, waited_secs: u64 },

    #[error("evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),

    /// Champion load/save failed; the generation cannot continue safely.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("strategy error: {0}")]
    Strategy(#[from] StrategyError),

    /// A result document did not match the declared envelope shape.
    #[error("result envelope error: {0}")]
    Envelope(String),
}

impl EvolveError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn bounds(msg: impl Into<String>) -> Self {
        Self::Bounds(msg.into())
    }
}
