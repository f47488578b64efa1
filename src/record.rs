//! Evaluation records, the champion document and result-envelope decoding.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EvolveError, Result};
use crate::schema::ParameterSet;

pub const SHARPE_RATIO: &str = "sharpeRatio";
pub const DRAWDOWN: &str = "drawdown";
pub const NET_PROFIT: &str = "netProfit";
pub const TOTAL_ORDERS: &str = "totalOrders";

/// Platform statistic labels and the canonical key each one folds into.
const STAT_ALIASES: &[(&str, &str)] = &[
    ("Sharpe Ratio", SHARPE_RATIO),
    ("SharpeRatio", SHARPE_RATIO),
    ("Drawdown", DRAWDOWN),
    ("Max Drawdown", DRAWDOWN),
    ("maxDrawdown", DRAWDOWN),
    ("Net Profit", NET_PROFIT),
    ("Compounding Annual Return", "compoundingAnnualReturn"),
    ("Total Orders", TOTAL_ORDERS),
    ("Total Trades", TOTAL_ORDERS),
    ("OOS Net Profit", "oosNetProfit"),
];

/// Metric name → numeric value.
pub type Statistics = BTreeMap<String, f64>;

/// One finished evaluation. Append-only once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRecord {
    pub id: String,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub strategy: String,
    pub parameters: ParameterSet,
    pub statistics: Statistics,
    pub created_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(
        id: impl Into<String>,
        generation: u32,
        strategy: impl Into<String>,
        parameters: ParameterSet,
        statistics: Statistics,
    ) -> Self {
        Self {
            id: id.into(),
            generation,
            strategy: strategy.into(),
            parameters,
            statistics,
            created_at: Utc::now(),
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.statistics.get(name).copied().filter(|v| v.is_finite())
    }

    /// Soft check for callers that cannot work with partial statistics.
    pub fn require_metrics(&self, names: &[&str]) -> Result<()> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| self.metric(n).is_none())
            .map(|n| n.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EvolveError::IncompleteMetrics {
                id: self.id.clone(),
                missing,
            })
        }
    }
}

/// The best-known parameter set carried into the next generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Champion {
    pub parameters: ParameterSet,
    pub statistics: Statistics,
    pub fitness: f64,
    /// Id of the record this champion was promoted from.
    pub source_id: String,
    pub promoted_at: DateTime<Utc>,
}

impl Champion {
    pub fn from_record(record: &EvaluationRecord, fitness: f64) -> Self {
        Self {
            parameters: record.parameters.clone(),
            statistics: record.statistics.clone(),
            fitness,
            source_id: record.id.clone(),
            promoted_at: Utc::now(),
        }
    }
}

/// Where an evaluator puts its statistics block.
///
/// Each evaluator declares its shape up front; decoding never searches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeShape {
    /// `{"statistics": {...}}`
    Flat,
    /// `{"results": {"statistics": {...}}}`
    Nested,
    /// `{"backtest": {"statistics": {...}}}`
    Backtest,
}

impl EnvelopeShape {
    fn path(self) -> &'static [&'static str] {
        match self {
            EnvelopeShape::Flat => &["statistics"],
            EnvelopeShape::Nested => &["results", "statistics"],
            EnvelopeShape::Backtest => &["backtest", "statistics"],
        }
    }

    /// Pull the statistics block out of `doc` and normalise it.
    pub fn decode(self, doc: &Value) -> Result<Statistics> {
        let mut node = doc;
        for key in self.path() {
            node = node.get(key).ok_or_else(|| {
                EvolveError::Envelope(format!("{self:?} envelope has no `{key}` object"))
            })?;
        }
        let obj = node.as_object().ok_or_else(|| {
            EvolveError::Envelope(format!("{self:?} statistics is not an object"))
        })?;
        Ok(normalize_statistics(obj))
    }
}

/// Fold platform labels into canonical keys and coerce values to numbers.
/// Entries that are not numeric are dropped.
pub fn normalize_statistics(raw: &Map<String, Value>) -> Statistics {
    let mut out = Statistics::new();
    for (key, value) in raw {
        let Some(v) = parse_stat(value) else {
            continue;
        };
        let canonical = STAT_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key.as_str())
            .map(|(_, c)| *c)
            .unwrap_or(key.as_str());
        // A canonical key already present wins over an alias.
        if canonical != key && raw.contains_key(canonical) {
            continue;
        }
        out.insert(canonical.to_string(), v);
    }
    out
}

/// `1.25`, `"1.25"`, `"12.5%"` (→ 0.125), `"$1,234.50"`.
pub fn parse_stat(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| *c != '$' && *c != ',')
                .collect();
            let (num, scale) = match cleaned.strip_suffix('%') {
                Some(rest) => (rest.trim(), 0.01),
                None => (cleaned.as_str(), 1.0),
            };
            num.parse::<f64>().ok().map(|v| v * scale)
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_declared_shape() {
        let flat = json!({"statistics": {"sharpeRatio": 1.2, "drawdown": 0.1}});
        let nested = json!({"results": {"statistics": {"sharpeRatio": 1.2, "drawdown": 0.1}}});
        let backtest = json!({
            "success": true,
            "backtest": {
                "status": "Completed.",
                "statistics": {"Sharpe Ratio": "1.2", "Drawdown": "10%"}
            }
        });

        for (shape, doc) in [
            (EnvelopeShape::Flat, flat),
            (EnvelopeShape::Nested, nested),
            (EnvelopeShape::Backtest, backtest),
        ] {
            let stats = shape.decode(&doc).unwrap();
            assert_eq!(stats.get(SHARPE_RATIO), Some(&1.2), "{shape:?}");
            assert!((stats[DRAWDOWN] - 0.1).abs() < 1e-12, "{shape:?}");
        }
    }

    #[test]
    fn wrong_shape_is_an_error_not_a_search() {
        let doc = json!({"results": {"statistics": {"sharpeRatio": 1.0}}});
        let err = EnvelopeShape::Flat.decode(&doc).unwrap_err();
        assert!(matches!(err, EvolveError::Envelope(_)));
    }

    #[test]
    fn parses_platform_number_formats() {
        assert_eq!(parse_stat(&json!(0.5)), Some(0.5));
        assert_eq!(parse_stat(&json!("-0.25")), Some(-0.25));
        assert_eq!(parse_stat(&json!("$1,234.50")), Some(1234.5));
        assert!((parse_stat(&json!("12.5%")).unwrap() - 0.125).abs() < 1e-12);
        assert_eq!(parse_stat(&json!("n/a")), None);
        assert_eq!(parse_stat(&json!(null)), None);
    }

    #[test]
    fn canonical_key_beats_alias() {
        let raw = json!({"sharpeRatio": 2.0, "Sharpe Ratio": "1.0", "Total Orders": "14"});
        let stats = normalize_statistics(raw.as_object().unwrap());
        assert_eq!(stats[SHARPE_RATIO], 2.0);
        assert_eq!(stats[TOTAL_ORDERS], 14.0);
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn record_round_trips_with_camel_case_keys() {
        let rec = EvaluationRecord::new(
            "gen001-a",
            1,
            "ema_cross",
            [("fast".to_string(), crate::schema::ParamValue::Int(9))].into(),
            [(SHARPE_RATIO.to_string(), 1.0)].into(),
        );
        let doc = serde_json::to_value(&rec).unwrap();
        assert!(doc.get("createdAt").is_some());
        let back: EvaluationRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn require_metrics_lists_what_is_missing() {
        let rec = EvaluationRecord::new(
            "x",
            1,
            "ema_cross",
            ParameterSet::new(),
            [(SHARPE_RATIO.to_string(), 1.0)].into(),
        );
        match rec.require_metrics(&[SHARPE_RATIO, DRAWDOWN]) {
            Err(EvolveError::IncompleteMetrics { missing, .. }) => {
                assert_eq!(missing, vec![DRAWDOWN.to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
