//! Strategy capability and the static name → implementation registry.
//!
//! A strategy is picked once at startup by name. The orchestrator uses
//! [`Strategy::initialize`] to vet candidates before submission, and the
//! local evaluator replays bars through [`Strategy::on_data`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{ParamValue, ParameterSet};

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown strategy `{0}`")]
    Unknown(String),

    #[error("strategy {strategy}: missing parameter `{name}`")]
    MissingParameter { strategy: &'static str, name: String },

    #[error("strategy {strategy}: {reason}")]
    InvalidParameters {
        strategy: &'static str,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Target exposure requested by a strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Long,
    Flat,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StrategySummary {
    pub bars_seen: usize,
    pub signals: usize,
    pub ended_long: bool,
}

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Bind a parameter set. Fails if the set is unusable for this strategy.
    fn initialize(&mut self, params: &ParameterSet) -> Result<(), StrategyError>;

    /// Feed one bar; returns a signal only when the desired exposure changes.
    fn on_data(&mut self, bar: &Bar) -> Option<Signal>;

    fn finalize(&mut self) -> StrategySummary;
}

type Constructor = fn() -> Box<dyn Strategy>;

/// Compile-time table of available strategies.
#[derive(Clone)]
pub struct StrategyRegistry {
    entries: Vec<(&'static str, Constructor)>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                (EmaCross::NAME, new_ema_cross as Constructor),
                (RsiReversion::NAME, new_rsi_reversion as Constructor),
            ],
        }
    }
}

fn new_ema_cross() -> Box<dyn Strategy> {
    Box::new(EmaCross::default())
}

fn new_rsi_reversion() -> Box<dyn Strategy> {
    Box::new(RsiReversion::default())
}

impl StrategyRegistry {
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(n, _)| *n).collect()
    }

    pub fn resolve(&self, name: &str) -> Result<Constructor, StrategyError> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, ctor)| *ctor)
            .ok_or_else(|| StrategyError::Unknown(name.to_string()))
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Strategy>, StrategyError> {
        Ok(self.resolve(name)?())
    }
}

fn int_param(
    strategy: &'static str,
    params: &ParameterSet,
    name: &str,
) -> Result<i64, StrategyError> {
    params
        .get(name)
        .and_then(ParamValue::as_i64)
        .ok_or_else(|| StrategyError::MissingParameter {
            strategy,
            name: name.to_string(),
        })
}

fn real_param(
    strategy: &'static str,
    params: &ParameterSet,
    name: &str,
) -> Result<f64, StrategyError> {
    params
        .get(name)
        .and_then(ParamValue::as_f64)
        .ok_or_else(|| StrategyError::MissingParameter {
            strategy,
            name: name.to_string(),
        })
}

#[derive(Clone, Debug, Default)]
struct Ema {
    alpha: f64,
    value: Option<f64>,
    seen: usize,
    period: usize,
}

impl Ema {
    fn new(period: usize) -> Self {
        Self {
            alpha: 2.0 / (period as f64 + 1.0),
            value: None,
            seen: 0,
            period,
        }
    }

    fn update(&mut self, x: f64) {
        self.seen += 1;
        self.value = Some(match self.value {
            Some(v) => v + self.alpha * (x - v),
            None => x,
        });
    }

    fn ready(&self) -> bool {
        self.seen >= self.period
    }
}

/// Long while the fast EMA is above the slow EMA.
#[derive(Clone, Debug, Default)]
pub struct EmaCross {
    fast: Ema,
    slow: Ema,
    long: bool,
    summary: StrategySummary,
}

impl EmaCross {
    pub const NAME: &'static str = "ema_cross";
}

impl Strategy for EmaCross {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initialize(&mut self, params: &ParameterSet) -> Result<(), StrategyError> {
        let fast = int_param(Self::NAME, params, "fast")?;
        let slow = int_param(Self::NAME, params, "slow")?;
        if fast < 1 {
            return Err(StrategyError::InvalidParameters {
                strategy: Self::NAME,
                reason: format!("fast period {fast} < 1"),
            });
        }
        if slow <= fast {
            return Err(StrategyError::InvalidParameters {
                strategy: Self::NAME,
                reason: format!("slow period {slow} must exceed fast period {fast}"),
            });
        }
        *self = Self {
            fast: Ema::new(fast as usize),
            slow: Ema::new(slow as usize),
            ..Self::default()
        };
        Ok(())
    }

    fn on_data(&mut self, bar: &Bar) -> Option<Signal> {
        self.summary.bars_seen += 1;
        self.fast.update(bar.close);
        self.slow.update(bar.close);
        if !self.slow.ready() {
            return None;
        }
        let (Some(f), Some(s)) = (self.fast.value, self.slow.value) else {
            return None;
        };
        let want_long = f > s;
        if want_long == self.long {
            return None;
        }
        self.long = want_long;
        self.summary.signals += 1;
        Some(if want_long { Signal::Long } else { Signal::Flat })
    }

    fn finalize(&mut self) -> StrategySummary {
        self.summary.ended_long = self.long;
        std::mem::take(&mut self.summary)
    }
}

/// Wilder RSI: buy below `rsi_buy`, exit above `rsi_sell`.
#[derive(Clone, Debug, Default)]
pub struct RsiReversion {
    period: usize,
    buy: f64,
    sell: f64,
    prev_close: Option<f64>,
    avg_gain: f64,
    avg_loss: f64,
    seen: usize,
    long: bool,
    summary: StrategySummary,
}

impl RsiReversion {
    pub const NAME: &'static str = "rsi_reversion";

    fn rsi(&self) -> f64 {
        if self.avg_loss == 0.0 {
            return 100.0;
        }
        let rs = self.avg_gain / self.avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

impl Strategy for RsiReversion {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn initialize(&mut self, params: &ParameterSet) -> Result<(), StrategyError> {
        let period = int_param(Self::NAME, params, "rsi")?;
        let buy = real_param(Self::NAME, params, "rsi_buy")?;
        let sell = real_param(Self::NAME, params, "rsi_sell")?;
        if period < 2 {
            return Err(StrategyError::InvalidParameters {
                strategy: Self::NAME,
                reason: format!("rsi period {period} < 2"),
            });
        }
        if !(0.0..=100.0).contains(&buy) || !(0.0..=100.0).contains(&sell) || buy >= sell {
            return Err(StrategyError::InvalidParameters {
                strategy: Self::NAME,
                reason: format!(
                    "thresholds buy={buy} sell={sell} must satisfy 0 <= buy < sell <= 100"
                ),
            });
        }
        *self = Self {
            period: period as usize,
            buy,
            sell,
            ..Self::default()
        };
        Ok(())
    }

    fn on_data(&mut self, bar: &Bar) -> Option<Signal> {
        self.summary.bars_seen += 1;
        let Some(prev) = self.prev_close.replace(bar.close) else {
            return None;
        };
        let change = bar.close - prev;
        let (gain, loss) = (change.max(0.0), (-change).max(0.0));
        self.seen += 1;
        let n = self.period as f64;
        if self.seen <= self.period {
            self.avg_gain += gain / n;
            self.avg_loss += loss / n;
            if self.seen < self.period {
                return None;
            }
        } else {
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }

        let rsi = self.rsi();
        let signal = if !self.long && rsi < self.buy {
            self.long = true;
            Signal::Long
        } else if self.long && rsi > self.sell {
            self.long = false;
            Signal::Flat
        } else {
            return None;
        };
        self.summary.signals += 1;
        Some(signal)
    }

    fn finalize(&mut self) -> StrategySummary {
        self.summary.ended_long = self.long;
        std::mem::take(&mut self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Bar {
                ts: i as i64 * 86_400,
                open: *c,
                high: *c,
                low: *c,
                close: *c,
            })
            .collect()
    }

    fn params(pairs: &[(&str, ParamValue)]) -> ParameterSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let reg = StrategyRegistry::default();
        assert_eq!(reg.names(), ["ema_cross", "rsi_reversion"]);
        assert_eq!(reg.create("ema_cross").unwrap().name(), "ema_cross");
        assert!(matches!(reg.create("nope"), Err(StrategyError::Unknown(_))));
    }

    #[test]
    fn ema_cross_rejects_inverted_periods() {
        let mut s = EmaCross::default();
        let err = s
            .initialize(&params(&[("fast", ParamValue::Int(30)), ("slow", ParamValue::Int(10))]))
            .unwrap_err();
        assert!(matches!(err, StrategyError::InvalidParameters { .. }));
        let err = s.initialize(&params(&[("fast", ParamValue::Int(3))])).unwrap_err();
        assert!(matches!(err, StrategyError::MissingParameter { .. }));
    }

    #[test]
    fn ema_cross_goes_long_on_uptrend_and_flat_on_reversal() {
        let mut s = EmaCross::default();
        s.initialize(&params(&[("fast", ParamValue::Int(2)), ("slow", ParamValue::Int(5))]))
            .unwrap();

        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        closes.extend((0..20).map(|i| 119.0 - 2.0 * i as f64));
        let signals: Vec<Signal> = bars(&closes).iter().filter_map(|b| s.on_data(b)).collect();
        assert_eq!(signals, [Signal::Long, Signal::Flat]);

        let summary = s.finalize();
        assert_eq!(summary.bars_seen, 40);
        assert_eq!(summary.signals, 2);
        assert!(!summary.ended_long);
    }

    #[test]
    fn rsi_reversion_buys_oversold_and_sells_overbought() {
        let mut s = RsiReversion::default();
        s.initialize(&params(&[
            ("rsi", ParamValue::Int(3)),
            ("rsi_buy", ParamValue::Real(30.0)),
            ("rsi_sell", ParamValue::Real(70.0)),
        ]))
        .unwrap();

        let mut closes: Vec<f64> = (0..8).map(|i| 100.0 - 3.0 * i as f64).collect();
        closes.extend((0..8).map(|i| 80.0 + 3.0 * i as f64));
        let signals: Vec<Signal> = bars(&closes).iter().filter_map(|b| s.on_data(b)).collect();
        assert_eq!(signals, [Signal::Long, Signal::Flat]);
    }

    #[test]
    fn rsi_reversion_validates_thresholds() {
        let mut s = RsiReversion::default();
        let err = s
            .initialize(&params(&[
                ("rsi", ParamValue::Int(14)),
                ("rsi_buy", ParamValue::Real(70.0)),
                ("rsi_sell", ParamValue::Real(30.0)),
            ]))
            .unwrap_err();
        assert!(matches!(err, StrategyError::InvalidParameters { .. }));
    }
}
