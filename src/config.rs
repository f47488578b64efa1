//! Parsers for the compact knob syntax used on the command line and in
//! environment variables, and the builders that turn them into settings.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::evaluator::PollSettings;
use crate::fitness::{ClusterConfig, Objective, QualityGate, SelectionMode};
use crate::generator::{MutationPolicy, OrderedPair};

/// `fast=2,slow=5`
pub fn parse_tolerances(s: &str) -> Result<BTreeMap<String, f64>, String> {
    let mut out = BTreeMap::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, tol) = part
            .split_once('=')
            .ok_or_else(|| format!("expected name=tolerance, got `{part}`"))?;
        let tol: f64 = tol
            .trim()
            .parse()
            .map_err(|_| format!("tolerance for `{}` is not a number", name.trim()))?;
        if !tol.is_finite() || tol < 0.0 {
            return Err(format!("tolerance for `{}` must be >= 0", name.trim()));
        }
        out.insert(name.trim().to_string(), tol);
    }
    Ok(out)
}

/// `fast:slow`
pub fn parse_pair(part: &str) -> Result<OrderedPair, String> {
    let part = part.trim();
    let (fast, slow) = part
        .split_once(':')
        .ok_or_else(|| format!("expected fast:slow, got `{part}`"))?;
    let (fast, slow) = (fast.trim(), slow.trim());
    if fast.is_empty() || slow.is_empty() || fast == slow {
        return Err(format!("bad ordered pair `{part}`"));
    }
    Ok(OrderedPair::new(fast, slow))
}

/// `sharpe-drawdown` or `metric:<name>`
pub fn parse_objective(s: &str) -> Result<Objective, String> {
    match s.trim() {
        "sharpe-drawdown" | "default" => Ok(Objective::default()),
        other => match other.strip_prefix("metric:") {
            Some(name) if !name.trim().is_empty() => Ok(Objective::Metric {
                name: name.trim().to_string(),
            }),
            _ => Err(format!(
                "unknown objective `{other}`; use sharpe-drawdown or metric:<name>"
            )),
        },
    }
}

pub fn parse_selection(s: &str) -> Result<SelectionMode, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "best" => Ok(SelectionMode::Best),
        "cluster" | "stable" => Ok(SelectionMode::Cluster),
        other => Err(format!("unknown selection mode `{other}`; use best or cluster")),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyKind {
    Fraction,
    Gaussian,
}

pub fn parse_policy_kind(s: &str) -> Result<PolicyKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "fraction" => Ok(PolicyKind::Fraction),
        "gaussian" | "jitter" => Ok(PolicyKind::Gaussian),
        other => Err(format!("unknown mutation policy `{other}`; use fraction or gaussian")),
    }
}

pub fn build_policy(
    kind: PolicyKind,
    fraction: f64,
    sigma: f64,
    min_gap: i64,
    pairs: Vec<OrderedPair>,
) -> MutationPolicy {
    match kind {
        PolicyKind::Fraction => MutationPolicy::FractionMutate { fraction },
        PolicyKind::Gaussian => MutationPolicy::GaussianJitter {
            sigma,
            min_gap,
            pairs,
        },
    }
}

pub fn build_cluster(group_by: &str, tolerances: BTreeMap<String, f64>) -> ClusterConfig {
    let group_by = group_by.trim();
    ClusterConfig {
        group_by: (!group_by.is_empty()).then(|| group_by.to_string()),
        tolerances,
    }
}

pub fn build_gate(min_sharpe: Option<f64>, max_drawdown: Option<f64>) -> QualityGate {
    QualityGate {
        min_sharpe,
        max_drawdown,
    }
}

pub fn build_poll(interval_secs: u64, timeout_secs: u64) -> PollSettings {
    PollSettings {
        interval: Duration::from_secs(interval_secs.max(1)),
        timeout: Duration::from_secs(timeout_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerances() {
        let t = parse_tolerances("fast=2, slow = 5").unwrap();
        assert_eq!(t["fast"], 2.0);
        assert_eq!(t["slow"], 5.0);
        assert!(parse_tolerances("").unwrap().is_empty());
        assert!(parse_tolerances("fast").is_err());
        assert!(parse_tolerances("fast=-1").is_err());
    }

    #[test]
    fn pairs() {
        assert_eq!(parse_pair(" fast : slow ").unwrap(), OrderedPair::new("fast", "slow"));
        assert!(parse_pair("fast").is_err());
        assert!(parse_pair("fast:fast").is_err());
        assert!(parse_pair(":slow").is_err());
    }

    #[test]
    fn objectives() {
        assert_eq!(parse_objective("sharpe-drawdown").unwrap(), Objective::default());
        assert_eq!(
            parse_objective("metric:oosNetProfit").unwrap(),
            Objective::Metric {
                name: "oosNetProfit".into()
            }
        );
        assert!(parse_objective("metric:").is_err());
        assert!(parse_objective("sortino").is_err());
    }

    #[test]
    fn selection_and_policy() {
        assert_eq!(parse_selection("Cluster").unwrap(), SelectionMode::Cluster);
        assert!(parse_selection("random").is_err());

        let kind = parse_policy_kind("gaussian").unwrap();
        let policy = build_policy(kind, 0.3, 0.2, 5, vec![parse_pair("fast:slow").unwrap()]);
        assert_eq!(
            policy,
            MutationPolicy::GaussianJitter {
                sigma: 0.2,
                min_gap: 5,
                pairs: vec![OrderedPair::new("fast", "slow")],
            }
        );
    }

    #[test]
    fn empty_group_disables_grouping() {
        assert_eq!(build_cluster("", BTreeMap::new()).group_by, None);
        assert_eq!(build_cluster("symbol", BTreeMap::new()).group_by.as_deref(), Some("symbol"));
    }
}
