//! Child parameter-set generation: bootstrap sampling and mutation policies.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EvolveError, Result};
use crate::schema::{round_half_up, round_to, Field, ParamValue, ParameterSchema, ParameterSet};

pub const DEFAULT_MUTATION_FRACTION: f64 = 0.3;
pub const DEFAULT_SIGMA: f64 = 0.15;
pub const DEFAULT_MIN_GAP: i64 = 5;

/// A pair of integer fields where `slow` must stay ahead of `fast`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedPair {
    pub fast: String,
    pub slow: String,
}

impl OrderedPair {
    pub fn new(fast: impl Into<String>, slow: impl Into<String>) -> Self {
        Self {
            fast: fast.into(),
            slow: slow.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MutationPolicy {
    /// Redraw a random subset of fields; copy the rest from the parent.
    FractionMutate { fraction: f64 },
    /// Perturb every numeric field by noise proportional to its magnitude.
    GaussianJitter {
        sigma: f64,
        min_gap: i64,
        pairs: Vec<OrderedPair>,
    },
}

impl Default for MutationPolicy {
    fn default() -> Self {
        MutationPolicy::FractionMutate {
            fraction: DEFAULT_MUTATION_FRACTION,
        }
    }
}

impl MutationPolicy {
    pub fn gaussian(sigma: f64) -> Self {
        MutationPolicy::GaussianJitter {
            sigma,
            min_gap: DEFAULT_MIN_GAP,
            pairs: Vec::new(),
        }
    }
}

/// Produce exactly `count` parameter sets.
///
/// Without a parent every field is drawn uniformly from its domain. With a
/// parent each child is mutated independently from the same snapshot.
pub fn generate(
    parent: Option<&ParameterSet>,
    schema: &ParameterSchema,
    count: usize,
    policy: &MutationPolicy,
    rng: &mut StdRng,
) -> Result<Vec<ParameterSet>> {
    let Some(parent) = parent else {
        return (0..count).map(|_| sample_candidate(schema, rng)).collect();
    };

    schema.check_names_and_types(parent)?;
    let base = complete_parent(parent, schema, rng)?;

    (0..count)
        .map(|_| match policy {
            MutationPolicy::FractionMutate { fraction } => {
                fraction_mutate(&base, schema, *fraction, rng)
            }
            MutationPolicy::GaussianJitter {
                sigma,
                min_gap,
                pairs,
            } => Ok(gaussian_jitter(&base, schema, *sigma, *min_gap, pairs, rng)),
        })
        .collect()
}

/// Uniform draw of every field.
pub fn sample_candidate(schema: &ParameterSchema, rng: &mut StdRng) -> Result<ParameterSet> {
    schema
        .iter()
        .map(|(name, field)| sample_field(name, field, rng).map(|v| (name.clone(), v)))
        .collect()
}

pub fn sample_field(name: &str, field: &Field, rng: &mut StdRng) -> Result<ParamValue> {
    match field {
        Field::Integer { min, max, .. } => {
            if min > max {
                return Err(EvolveError::bounds(format!("field {name}: min > max")));
            }
            Ok(ParamValue::Int(rng.random_range(*min..=*max)))
        }
        Field::Real {
            min,
            max,
            precision,
        } => {
            if !(min <= max) {
                return Err(EvolveError::bounds(format!("field {name}: min > max")));
            }
            let v = rng.random_range(*min..=*max);
            Ok(ParamValue::Real(round_to(v, *precision).clamp(*min, *max)))
        }
        Field::Choice { values } => {
            if values.is_empty() {
                return Err(EvolveError::bounds(format!(
                    "field {name}: choice has no values"
                )));
            }
            let idx = rng.random_range(0..values.len());
            Ok(values[idx].clone())
        }
    }
}

/// Number of fields redrawn per child under fraction-mutate.
pub fn fraction_mutation_size(fraction: f64, schema_len: usize) -> usize {
    ((fraction * schema_len as f64).round() as usize)
        .max(1)
        .min(schema_len)
}

fn fraction_mutate(
    base: &ParameterSet,
    schema: &ParameterSchema,
    fraction: f64,
    rng: &mut StdRng,
) -> Result<ParameterSet> {
    let mut child = base.clone();
    if schema.is_empty() {
        return Ok(child);
    }

    let names: Vec<&String> = schema.names().collect();
    let amount = fraction_mutation_size(fraction, names.len());
    for idx in rand::seq::index::sample(rng, names.len(), amount) {
        let name = names[idx];
        let field = schema
            .get(name)
            .ok_or_else(|| EvolveError::schema(format!("undeclared field `{name}`")))?;
        child.insert(name.clone(), sample_field(name, field, rng)?);
    }
    Ok(child)
}

fn gaussian_jitter(
    base: &ParameterSet,
    schema: &ParameterSchema,
    sigma: f64,
    min_gap: i64,
    pairs: &[OrderedPair],
    rng: &mut StdRng,
) -> ParameterSet {
    let mut child = base.clone();

    for (name, field) in schema.iter() {
        let Some(cur) = child.get(name).and_then(ParamValue::as_f64) else {
            continue;
        };
        let noisy = cur + gauss(rng, sigma * cur.abs());
        match field {
            Field::Integer { min, max, period } => {
                let mut v = round_half_up(noisy).clamp(*min, *max);
                if *period {
                    v = v.max(1);
                }
                child.insert(name.clone(), ParamValue::Int(v));
            }
            Field::Real {
                min,
                max,
                precision,
            } => {
                let v = round_to(noisy, *precision).clamp(*min, *max);
                child.insert(name.clone(), ParamValue::Real(v));
            }
            Field::Choice { .. } => {}
        }
    }

    repair_pairs(&mut child, schema, pairs, min_gap);
    child
}

/// Keep every `slow` at least `min_gap` above its `fast`.
///
/// `slow` is raised first; when its upper bound gets in the way `fast` is
/// lowered instead, never below its own lower bound. If the bounds leave no
/// room for the gap the pair stays in bounds and a warning is logged.
pub fn repair_pairs(
    set: &mut ParameterSet,
    schema: &ParameterSchema,
    pairs: &[OrderedPair],
    min_gap: i64,
) {
    for pair in pairs {
        let (Some(fast), Some(slow)) = (
            set.get(&pair.fast).and_then(ParamValue::as_i64),
            set.get(&pair.slow).and_then(ParamValue::as_i64),
        ) else {
            continue;
        };
        if slow >= fast + min_gap {
            continue;
        }

        let (fast_lo, fast_period) = int_floor(schema.get(&pair.fast));
        let slow_hi = match schema.get(&pair.slow) {
            Some(Field::Integer { max, .. }) => *max,
            _ => i64::MAX,
        };

        let wanted = fast + min_gap;
        if wanted <= slow_hi {
            set.insert(pair.slow.clone(), ParamValue::Int(wanted));
        } else {
            let mut new_fast = (slow_hi - min_gap).max(fast_lo);
            if fast_period {
                new_fast = new_fast.max(1);
            }
            if slow_hi < new_fast.saturating_add(min_gap) {
                tracing::warn!(
                    fast = %pair.fast,
                    slow = %pair.slow,
                    min_gap,
                    "schema bounds leave no room for the ordered-pair gap"
                );
            }
            set.insert(pair.fast.clone(), ParamValue::Int(new_fast));
            set.insert(pair.slow.clone(), ParamValue::Int(slow_hi));
        }
    }
}

fn int_floor(field: Option<&Field>) -> (i64, bool) {
    match field {
        Some(Field::Integer { min, period, .. }) => (*min, *period),
        _ => (i64::MIN, false),
    }
}

/// Fill fields the parent does not carry (e.g. the schema grew since the
/// champion was stored) with fresh draws.
fn complete_parent(
    parent: &ParameterSet,
    schema: &ParameterSchema,
    rng: &mut StdRng,
) -> Result<ParameterSet> {
    let mut base = parent.clone();
    for (name, field) in schema.iter() {
        if !base.contains_key(name) {
            tracing::debug!(field = %name, "parent lacks field, drawing a fresh value");
            base.insert(name.clone(), sample_field(name, field, rng)?);
        }
    }
    Ok(base)
}

/// Box-Muller normal deviate with standard deviation `sigma`.
fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    if sigma == 0.0 {
        return 0.0;
    }
    let u1 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2 = rng.random::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z * sigma
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ema_schema() -> ParameterSchema {
        ParameterSchema::new()
            .with_field("fast", Field::int(5, 40))
            .with_field("slow", Field::int(20, 200))
    }

    fn wide_schema() -> ParameterSchema {
        ParameterSchema::new()
            .with_field("fast", Field::period(1, 40))
            .with_field("slow", Field::period(2, 60))
            .with_field("rsi", Field::period(2, 30))
            .with_field("stop", Field::real(0.01, 0.25))
            .with_field("size", Field::real(0.1, 1.0))
            .with_field("hold", Field::int(1, 20))
            .with_field("flip", Field::choice([true, false]))
            .with_field("rsi_hi", Field::int(55, 90))
            .with_field("rsi_lo", Field::int(10, 45))
            .with_field("symbol", Field::choice(["SPY", "QQQ", "IWM", "TLT", "GLD"]))
    }

    fn parent() -> ParameterSet {
        [
            ("fast".to_string(), ParamValue::Int(10)),
            ("slow".to_string(), ParamValue::Int(100)),
        ]
        .into()
    }

    #[test]
    fn bootstrap_produces_exact_count_within_bounds() {
        let schema = wide_schema();
        let mut rng = StdRng::seed_from_u64(7);
        for count in [1, 3, 25] {
            let policy = MutationPolicy::default();
            let sets = generate(None, &schema, count, &policy, &mut rng).unwrap();
            assert_eq!(sets.len(), count);
            for set in &sets {
                schema.validate(set).unwrap();
            }
        }
    }

    #[test]
    fn bootstrap_rounds_reals_to_precision() {
        let schema = ParameterSchema::new().with_field("x", Field::real(0.0, 1.0));
        let mut rng = StdRng::seed_from_u64(3);
        for set in generate(None, &schema, 50, &MutationPolicy::default(), &mut rng).unwrap() {
            let x = set["x"].as_f64().unwrap();
            assert_eq!(round_to(x, crate::schema::DEFAULT_PRECISION), x);
        }
    }

    #[test]
    fn empty_choice_is_bounds_error() {
        let schema = ParameterSchema::new().with_field("sym", Field::Choice { values: vec![] });
        let mut rng = StdRng::seed_from_u64(1);
        let err = generate(None, &schema, 2, &MutationPolicy::default(), &mut rng).unwrap_err();
        assert!(matches!(err, EvolveError::Bounds(_)));
    }

    #[test]
    fn parent_with_undeclared_field_is_schema_error() {
        let mut p = parent();
        p.insert("rsi".into(), ParamValue::Int(14));
        let mut rng = StdRng::seed_from_u64(1);
        let err = generate(Some(&p), &ema_schema(), 3, &MutationPolicy::default(), &mut rng)
            .unwrap_err();
        assert!(matches!(err, EvolveError::Schema(_)));
    }

    #[test]
    fn seeded_fraction_mutate_is_reproducible() {
        let schema = ema_schema();
        let policy = MutationPolicy::FractionMutate { fraction: 1.0 };

        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            generate(Some(&parent()), &schema, 8, &policy, &mut rng).unwrap()
        };

        let a = run(42);
        let b = run(42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        for set in &a {
            schema.validate(set).unwrap();
        }
        assert_ne!(a, run(43));
    }

    #[test]
    fn fraction_mutate_touches_expected_share_of_fields() {
        let schema = wide_schema();
        let mut rng = StdRng::seed_from_u64(11);
        let p = sample_candidate(&schema, &mut rng).unwrap();
        let policy = MutationPolicy::default();
        let redraws = fraction_mutation_size(DEFAULT_MUTATION_FRACTION, schema.len());
        assert_eq!(redraws, 3);

        let trials = 2_000;
        let children = generate(Some(&p), &schema, trials, &policy, &mut rng).unwrap();
        let changed: usize = children
            .iter()
            .map(|c| schema.names().filter(|n| c[*n] != p[*n]).count())
            .sum();

        // A redraw can land on the parent's value, so the mean sits a little
        // under the number of redrawn fields but never above it.
        let mean = changed as f64 / trials as f64;
        assert!(mean <= redraws as f64);
        assert!(mean > redraws as f64 * 0.75, "mean changed fields {mean}");
        assert!(
            children
                .iter()
                .all(|c| schema.names().filter(|n| c[*n] != p[*n]).count() <= redraws)
        );
    }

    #[test]
    fn siblings_are_mutated_from_the_same_snapshot() {
        let schema = ema_schema();
        let policy = MutationPolicy::FractionMutate { fraction: 0.5 };
        let mut rng = StdRng::seed_from_u64(5);
        let children = generate(Some(&parent()), &schema, 200, &policy, &mut rng).unwrap();
        // Exactly one of the two fields is redrawn each time, so the other
        // always matches the parent.
        for c in &children {
            assert!(c["fast"] == ParamValue::Int(10) || c["slow"] == ParamValue::Int(100));
        }
    }

    #[test]
    fn parent_missing_field_is_completed() {
        let schema = ema_schema().with_field("rsi", Field::period(5, 30));
        let mut rng = StdRng::seed_from_u64(2);
        let children = generate(Some(&parent()), &schema, 4, &MutationPolicy::default(), &mut rng)
            .unwrap();
        for c in &children {
            schema.validate(c).unwrap();
        }
    }

    #[test]
    fn gaussian_jitter_respects_bounds_floor_and_gap() {
        let schema = ParameterSchema::new()
            .with_field("fast", Field::period(-10, 40))
            .with_field("slow", Field::period(1, 45))
            .with_field("stop", Field::real(0.01, 0.5))
            .with_field("symbol", Field::choice(["SPY", "QQQ"]));
        let p: ParameterSet = [
            ("fast".to_string(), ParamValue::Int(3)),
            ("slow".to_string(), ParamValue::Int(40)),
            ("stop".to_string(), ParamValue::Real(0.1)),
            ("symbol".to_string(), ParamValue::from("QQQ")),
        ]
        .into();
        let policy = MutationPolicy::GaussianJitter {
            sigma: 0.9,
            min_gap: 5,
            pairs: vec![OrderedPair::new("fast", "slow")],
        };

        let mut rng = StdRng::seed_from_u64(99);
        let children = generate(Some(&p), &schema, 500, &policy, &mut rng).unwrap();
        assert_eq!(children.len(), 500);
        for c in &children {
            let fast = c["fast"].as_i64().unwrap();
            let slow = c["slow"].as_i64().unwrap();
            assert!(fast >= 1, "period floor violated: {fast}");
            assert!(slow <= 45);
            assert!(slow >= fast + 5, "gap violated: fast={fast} slow={slow}");
            let stop = c["stop"].as_f64().unwrap();
            assert!((0.01..=0.5).contains(&stop));
            assert_eq!(c["symbol"], ParamValue::from("QQQ"));
        }
        assert!(children.iter().any(|c| c["stop"] != p["stop"]));
    }

    #[test]
    fn gaussian_jitter_is_seed_stable() {
        let schema = ema_schema();
        let policy = MutationPolicy::gaussian(DEFAULT_SIGMA);
        let mut a = StdRng::seed_from_u64(8);
        let mut b = StdRng::seed_from_u64(8);
        assert_eq!(
            generate(Some(&parent()), &schema, 10, &policy, &mut a).unwrap(),
            generate(Some(&parent()), &schema, 10, &policy, &mut b).unwrap()
        );
    }

    #[test]
    fn repair_lowers_fast_when_slow_is_capped() {
        let schema = ParameterSchema::new()
            .with_field("fast", Field::period(1, 50))
            .with_field("slow", Field::period(10, 50));
        let mut set: ParameterSet = [
            ("fast".to_string(), ParamValue::Int(48)),
            ("slow".to_string(), ParamValue::Int(49)),
        ]
        .into();
        repair_pairs(&mut set, &schema, &[OrderedPair::new("fast", "slow")], 5);
        assert_eq!(set["fast"], ParamValue::Int(45));
        assert_eq!(set["slow"], ParamValue::Int(50));
    }

    #[test]
    fn jittered_reals_stay_inside_off_grid_bounds() {
        // 0.014 is not on the two-digit grid, so rounding after clamping
        // could land on 0.01.
        let schema = ParameterSchema::new().with_field(
            "stop",
            Field::Real {
                min: 0.014,
                max: 0.9,
                precision: 2,
            },
        );
        let p: ParameterSet = [("stop".to_string(), ParamValue::Real(0.02))].into();
        let policy = MutationPolicy::gaussian(0.9);

        let mut rng = StdRng::seed_from_u64(5);
        let children = generate(Some(&p), &schema, 200, &policy, &mut rng).unwrap();
        for c in &children {
            schema.validate(c).unwrap();
            let stop = c["stop"].as_f64().unwrap();
            assert!((0.014..=0.9).contains(&stop), "out of bounds: {stop}");
        }
    }

    #[test]
    fn repair_stays_in_bounds_when_gap_cannot_fit() {
        let schema = ParameterSchema::new()
            .with_field("fast", Field::period(40, 50))
            .with_field("slow", Field::period(10, 42));
        let mut set: ParameterSet = [
            ("fast".to_string(), ParamValue::Int(45)),
            ("slow".to_string(), ParamValue::Int(41)),
        ]
        .into();
        repair_pairs(&mut set, &schema, &[OrderedPair::new("fast", "slow")], 5);
        assert_eq!(set["fast"], ParamValue::Int(40));
        assert_eq!(set["slow"], ParamValue::Int(42));
        schema.validate(&set).unwrap();
    }
}
