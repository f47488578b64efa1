//! Evolutionary search over trading-strategy parameters.
//!
//! Each generation mutates the stored champion (or bootstraps from the
//! schema), evaluates the children concurrently, scores them and promotes
//! a strictly better winner.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod fitness;
pub mod generator;
pub mod orchestrator;
pub mod record;
pub mod schema;
pub mod store;
pub mod strategy;
pub mod telemetry;

pub use error::{EvolveError, Result};
pub use evaluator::{CloudConfig, CloudEvaluator, Evaluator, LocalEvaluator, PollSettings};
pub use fitness::{Objective, QualityGate, SelectionMode};
pub use generator::MutationPolicy;
pub use orchestrator::{EvolveSettings, GenerationReport, Orchestrator};
pub use record::{Champion, EvaluationRecord};
pub use schema::{Field, ParamValue, ParameterSchema, ParameterSet};
pub use store::{ChampionStore, EvolutionStore, JsonFileStore, MemoryStore, ResultStore};
