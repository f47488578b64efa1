//! Fitness scoring, winner/survivor selection, the quality gate and the
//! promotion rule.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EvolveError, Result};
use crate::record::{Champion, EvaluationRecord, DRAWDOWN, SHARPE_RATIO};
use crate::schema::ParamValue;

/// Score given to records that lack the metrics the objective needs.
pub const MISSING_METRIC_SCORE: f64 = -1e6;

/// What "better" means. Higher scores are always better.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Objective {
    /// `sharpe_weight * sharpeRatio - drawdown_weight * drawdown`
    SharpeDrawdown {
        sharpe_weight: f64,
        drawdown_weight: f64,
    },
    /// A single statistic taken as-is (e.g. `netProfit`, `oosNetProfit`).
    Metric { name: String },
}

impl Default for Objective {
    fn default() -> Self {
        Objective::SharpeDrawdown {
            sharpe_weight: 1.0,
            drawdown_weight: 2.0,
        }
    }
}

impl Objective {
    /// Metric names a record must carry to score above the sentinel.
    pub fn required_metrics(&self) -> Vec<&str> {
        match self {
            Objective::SharpeDrawdown { .. } => vec![SHARPE_RATIO, DRAWDOWN],
            Objective::Metric { name } => vec![name.as_str()],
        }
    }

    pub fn is_complete(&self, record: &EvaluationRecord) -> bool {
        self.required_metrics()
            .iter()
            .all(|m| record.metric(m).is_some())
    }

    /// Pure; incomplete records score [`MISSING_METRIC_SCORE`] instead of failing.
    pub fn score(&self, record: &EvaluationRecord) -> f64 {
        match self {
            Objective::SharpeDrawdown {
                sharpe_weight,
                drawdown_weight,
            } => match (record.metric(SHARPE_RATIO), record.metric(DRAWDOWN)) {
                (Some(sharpe), Some(dd)) => sharpe_weight * sharpe - drawdown_weight * dd,
                _ => MISSING_METRIC_SCORE,
            },
            Objective::Metric { name } => record.metric(name).unwrap_or(MISSING_METRIC_SCORE),
        }
    }

    /// Best-first ordering: complete before incomplete, then score, then
    /// earlier `created_at`.
    fn rank(&self, a: &EvaluationRecord, b: &EvaluationRecord) -> Ordering {
        self.is_complete(b)
            .cmp(&self.is_complete(a))
            .then_with(|| self.score(b).total_cmp(&self.score(a)))
            .then_with(|| a.created_at.cmp(&b.created_at))
    }
}

/// Score with the default sharpe/drawdown objective.
pub fn score(record: &EvaluationRecord) -> f64 {
    Objective::default().score(record)
}

/// Highest-scoring record. Ties go to the earlier-created one, then input order.
pub fn select_winner<'a>(
    records: &'a [EvaluationRecord],
    objective: &Objective,
) -> Result<&'a EvaluationRecord> {
    let mut best: Option<&EvaluationRecord> = None;
    for rec in records {
        if best.is_none_or(|b| objective.rank(rec, b) == Ordering::Less) {
            best = Some(rec);
        }
    }
    best.ok_or(EvolveError::EmptyPopulation)
}

/// Top `k` records by score, best first.
pub fn select_survivors(
    records: &[EvaluationRecord],
    k: usize,
    objective: &Objective,
) -> Vec<EvaluationRecord> {
    let mut ranked: Vec<&EvaluationRecord> = records.iter().collect();
    ranked.sort_by(|a, b| objective.rank(a, b));
    ranked.into_iter().take(k).cloned().collect()
}

/// Neighbourhood definition for stability-aware selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Categorical field neighbours must share (e.g. `symbol`).
    pub group_by: Option<String>,
    /// Numeric field → maximum absolute distance.
    pub tolerances: BTreeMap<String, f64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            group_by: Some("symbol".to_string()),
            tolerances: [("fast".to_string(), 2.0), ("slow".to_string(), 5.0)].into(),
        }
    }
}

impl ClusterConfig {
    fn are_neighbours(&self, a: &EvaluationRecord, b: &EvaluationRecord) -> bool {
        if let Some(group) = &self.group_by {
            if a.parameters.get(group) != b.parameters.get(group) {
                return false;
            }
        }
        self.tolerances.iter().all(|(field, tol)| {
            match (
                a.parameters.get(field).and_then(ParamValue::as_f64),
                b.parameters.get(field).and_then(ParamValue::as_f64),
            ) {
                (Some(x), Some(y)) => (x - y).abs() <= *tol,
                _ => false,
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Highest single score.
    #[default]
    Best,
    /// Highest mean score over a candidate and its neighbours.
    Cluster,
}

/// Outcome of [`select_winner_by`].
#[derive(Clone, Debug)]
pub struct Selection<'a> {
    pub winner: &'a EvaluationRecord,
    pub fitness: f64,
    /// Mean fitness of the winning cluster, when one was found.
    pub cluster_score: Option<f64>,
    pub neighbours: usize,
}

/// Winner whose neighbourhood scores best on average.
///
/// Only complete records take part in clusters, either as centre or as
/// neighbour. Candidates with no neighbours are skipped. When nobody has a
/// neighbour this falls back to [`select_winner`].
pub fn select_stable_winner<'a>(
    records: &'a [EvaluationRecord],
    objective: &Objective,
    cluster: &ClusterConfig,
) -> Result<Selection<'a>> {
    if records.is_empty() {
        return Err(EvolveError::EmptyPopulation);
    }

    let scores: Vec<f64> = records.iter().map(|r| objective.score(r)).collect();
    let mut best: Option<(usize, f64, usize)> = None;

    for (i, cand) in records.iter().enumerate() {
        if cand.parameters.is_empty() || !objective.is_complete(cand) {
            continue;
        }
        let neighbours: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(j, other)| {
                *j != i
                    && other.id != cand.id
                    && !other.parameters.is_empty()
                    && objective.is_complete(other)
                    && cluster.are_neighbours(cand, other)
            })
            .map(|(j, _)| j)
            .collect();
        if neighbours.is_empty() {
            continue;
        }

        let total: f64 = scores[i] + neighbours.iter().map(|j| scores[*j]).sum::<f64>();
        let mean = total / (neighbours.len() + 1) as f64;
        if best.is_none_or(|(_, m, _)| mean > m) {
            best = Some((i, mean, neighbours.len()));
        }
    }

    match best {
        Some((i, mean, n)) => Ok(Selection {
            winner: &records[i],
            fitness: scores[i],
            cluster_score: Some(mean),
            neighbours: n,
        }),
        None => {
            tracing::info!("no stable clusters found, falling back to single best score");
            let winner = select_winner(records, objective)?;
            Ok(Selection {
                winner,
                fitness: objective.score(winner),
                cluster_score: None,
                neighbours: 0,
            })
        }
    }
}

/// Dispatch on the configured selection mode.
pub fn select_winner_by<'a>(
    records: &'a [EvaluationRecord],
    objective: &Objective,
    mode: SelectionMode,
    cluster: &ClusterConfig,
) -> Result<Selection<'a>> {
    match mode {
        SelectionMode::Best => {
            let winner = select_winner(records, objective)?;
            Ok(Selection {
                winner,
                fitness: objective.score(winner),
                cluster_score: None,
                neighbours: 0,
            })
        }
        SelectionMode::Cluster => select_stable_winner(records, objective, cluster),
    }
}

/// Strictly-better rule: ties keep the incumbent.
pub fn should_promote(candidate_fitness: f64, champion: Option<&Champion>) -> bool {
    match champion {
        None => candidate_fitness.is_finite(),
        Some(c) => candidate_fitness > c.fitness,
    }
}

/// Absolute thresholds a winner must clear before it may be promoted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityGate {
    pub min_sharpe: Option<f64>,
    pub max_drawdown: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "verdict", content = "reasons", rename_all = "snake_case")]
pub enum GateVerdict {
    Passed,
    Rejected(Vec<String>),
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, GateVerdict::Passed)
    }
}

impl QualityGate {
    pub fn is_disabled(&self) -> bool {
        self.min_sharpe.is_none() && self.max_drawdown.is_none()
    }

    pub fn check(&self, record: &EvaluationRecord) -> GateVerdict {
        let mut reasons = Vec::new();

        if let Some(min) = self.min_sharpe {
            match record.metric(SHARPE_RATIO) {
                Some(s) if s >= min => {}
                Some(s) => reasons.push(format!("sharpe {s:.3} < {min}")),
                None => reasons.push("sharpe missing".to_string()),
            }
        }
        if let Some(max) = self.max_drawdown {
            match record.metric(DRAWDOWN) {
                Some(d) if d <= max => {}
                Some(d) => reasons.push(format!("drawdown {d:.3} > {max}")),
                None => reasons.push("drawdown missing".to_string()),
            }
        }

        if reasons.is_empty() {
            GateVerdict::Passed
        } else {
            GateVerdict::Rejected(reasons)
        }
    }
}
