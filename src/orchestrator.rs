//! One generation: load champion, breed, vet, evaluate concurrently, record,
//! select, gate, promote, keep survivors.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EvolveError, Result};
use crate::evaluator::{Evaluator, EvaluatorError, PollSettings, evaluate};
use crate::fitness::{
    ClusterConfig, GateVerdict, Objective, QualityGate, SelectionMode, select_survivors,
    select_winner_by, should_promote,
};
use crate::generator::{MutationPolicy, generate};
use crate::record::{Champion, EvaluationRecord};
use crate::schema::{ParameterSchema, ParameterSet};
use crate::store::EvolutionStore;
use crate::strategy::StrategyRegistry;

pub const DEFAULT_POPULATION: usize = 10;
pub const DEFAULT_SURVIVORS: usize = 2;
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Everything that shapes a generation, independent of how it was configured.
#[derive(Clone, Debug)]
pub struct EvolveSettings {
    pub population: usize,
    pub policy: MutationPolicy,
    pub survivors: usize,
    pub objective: Objective,
    pub selection: SelectionMode,
    pub cluster: ClusterConfig,
    pub gate: QualityGate,
    pub concurrency: usize,
    pub poll: PollSettings,
}

impl Default for EvolveSettings {
    fn default() -> Self {
        Self {
            population: DEFAULT_POPULATION,
            policy: MutationPolicy::default(),
            survivors: DEFAULT_SURVIVORS,
            objective: Objective::default(),
            selection: SelectionMode::default(),
            cluster: ClusterConfig::default(),
            gate: QualityGate::default(),
            concurrency: DEFAULT_CONCURRENCY,
            poll: PollSettings::default(),
        }
    }
}

/// A candidate that never produced a record.
#[derive(Clone, Debug, Serialize)]
pub struct CandidateFailure {
    pub index: usize,
    pub name: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct GenerationReport {
    pub generation: u32,
    pub submitted: usize,
    pub completed: usize,
    pub failures: Vec<CandidateFailure>,
    pub winner_id: Option<String>,
    pub fitness: Option<f64>,
    pub cluster_score: Option<f64>,
    pub promoted: bool,
    pub gate: Option<GateVerdict>,
}

pub struct Orchestrator {
    schema: ParameterSchema,
    strategy: String,
    registry: StrategyRegistry,
    evaluator: Arc<dyn Evaluator>,
    store: Arc<dyn EvolutionStore>,
    settings: EvolveSettings,
    rng: StdRng,
    generation: u32,
}

impl Orchestrator {
    pub fn new(
        schema: ParameterSchema,
        strategy: &str,
        evaluator: Arc<dyn Evaluator>,
        store: Arc<dyn EvolutionStore>,
        settings: EvolveSettings,
        seed: Option<u64>,
    ) -> Result<Self> {
        schema.check()?;
        let registry = StrategyRegistry::default();
        registry.resolve(strategy)?;
        if settings.population == 0 {
            return Err(EvolveError::bounds("population must be >= 1"));
        }
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            schema,
            strategy: strategy.to_string(),
            registry,
            evaluator,
            store,
            settings,
            rng,
            generation: 0,
        })
    }

    /// Continue numbering after generations run by an earlier process.
    pub fn starting_at(mut self, completed_generations: u32) -> Self {
        self.generation = completed_generations;
        self
    }

    /// Strategy vetting; failures are returned, not raised.
    fn vet(&self, params: &ParameterSet) -> Result<()> {
        self.schema.validate(params)?;
        let mut strategy = self.registry.create(&self.strategy)?;
        strategy.initialize(params)?;
        Ok(())
    }

    pub async fn run_generation(&mut self) -> Result<GenerationReport> {
        self.generation += 1;
        let generation = self.generation;
        let mut report = GenerationReport {
            generation,
            ..GenerationReport::default()
        };

        let champion = self.store.load_champion().await?;
        match &champion {
            Some(c) => info!(
                generation,
                source = %c.source_id,
                fitness = c.fitness,
                "mutating from champion"
            ),
            None => info!(generation, "no champion yet, bootstrapping"),
        }

        let candidates = generate(
            champion.as_ref().map(|c| &c.parameters),
            &self.schema,
            self.settings.population,
            &self.settings.policy,
            &mut self.rng,
        )?;

        let run_tag = Uuid::new_v4().simple().to_string();
        let mut accepted = Vec::with_capacity(candidates.len());
        for (index, params) in candidates.into_iter().enumerate() {
            let name = format!("gen{generation:03}-{index:02}-{}", &run_tag[..8]);
            match self.vet(&params) {
                Ok(()) => accepted.push((index, name, params)),
                Err(e) => {
                    warn!(candidate = %name, error = %e, "candidate rejected before submission");
                    report.failures.push(CandidateFailure {
                        index,
                        name,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.submitted = accepted.len();

        let poll = self.settings.poll;
        let mut outcomes: Vec<_> = stream::iter(accepted.into_iter().map(|(index, name, params)| {
            let evaluator = Arc::clone(&self.evaluator);
            async move {
                let outcome = evaluate(evaluator.as_ref(), &name, &params, poll).await;
                (index, name, params, outcome)
            }
        }))
        .buffer_unordered(self.settings.concurrency.max(1))
        .collect()
        .await;
        outcomes.sort_by_key(|(index, ..)| *index);

        let mut records = Vec::with_capacity(outcomes.len());
        for (index, name, params, outcome) in outcomes {
            match outcome {
                Ok(statistics) => {
                    let record =
                        EvaluationRecord::new(name, generation, &self.strategy, params, statistics);
                    if let Err(e) = self.store.append_record(&record).await {
                        warn!(record = %record.id, error = %e, "failed to persist record");
                    }
                    records.push(record);
                }
                Err(e) => {
                    let err = match e {
                        EvaluatorError::Timeout { waited_secs } => EvolveError::EvaluatorTimeout {
                            candidate: name.clone(),
                            waited_secs,
                        },
                        other => EvolveError::Evaluator(other),
                    };
                    warn!(candidate = %name, error = %err, "evaluation failed");
                    report.failures.push(CandidateFailure {
                        index,
                        name,
                        error: err.to_string(),
                    });
                }
            }
        }
        report.failures.sort_by_key(|f| f.index);
        report.completed = records.len();

        if records.is_empty() {
            warn!(generation, "no completed evaluations, skipping promotion");
            return Ok(report);
        }

        let selection = select_winner_by(
            &records,
            &self.settings.objective,
            self.settings.selection,
            &self.settings.cluster,
        )?;
        report.winner_id = Some(selection.winner.id.clone());
        report.fitness = Some(selection.fitness);
        report.cluster_score = selection.cluster_score;

        let verdict = (!self.settings.gate.is_disabled())
            .then(|| self.settings.gate.check(selection.winner));
        let gate_ok = verdict.as_ref().is_none_or(GateVerdict::passed);
        if let Some(GateVerdict::Rejected(reasons)) = &verdict {
            info!(winner = %selection.winner.id, ?reasons, "winner failed quality gate");
        }
        report.gate = verdict;

        if gate_ok && should_promote(selection.fitness, champion.as_ref()) {
            let next = Champion::from_record(selection.winner, selection.fitness);
            self.store.save_champion(&next).await?;
            report.promoted = true;
            info!(
                generation,
                winner = %next.source_id,
                fitness = next.fitness,
                previous = ?champion.as_ref().map(|c| c.fitness),
                "promoted new champion"
            );
        } else {
            info!(
                generation,
                winner = %selection.winner.id,
                fitness = selection.fitness,
                "champion kept"
            );
        }

        let survivors =
            select_survivors(&records, self.settings.survivors, &self.settings.objective);
        self.store.save_survivors(&survivors).await?;

        Ok(report)
    }

    /// Run `generations` in sequence. A failed generation is logged and the
    /// next one starts from whatever champion the store holds, unless
    /// `fail_fast` is set.
    pub async fn run(
        &mut self,
        generations: u32,
        fail_fast: bool,
    ) -> Result<Vec<GenerationReport>> {
        let mut reports = Vec::with_capacity(generations as usize);
        for _ in 0..generations {
            match self.run_generation().await {
                Ok(report) => reports.push(report),
                Err(e) if fail_fast => return Err(e),
                Err(e) => error!(generation = self.generation, error = %e, "generation failed"),
            }
        }
        Ok(reports)
    }
}
