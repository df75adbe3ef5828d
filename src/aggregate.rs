use crate::{
    error::EvalError,
    tasks::{TaskResult, NAN_DETECTED},
};
use serde::Serialize;
use std::{collections::BTreeMap, fmt};

/// One entry of the final result mapping.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Text(String),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Flat result mapping of a whole evaluation.
pub type EvalResults = BTreeMap<String, MetricValue>;

/// Shortest round-trip form with a signed, two-digit exponent (`1e-05`,
/// `1.5e+16`), plain positional form otherwise (`10.0`).
fn format_score(v: f64) -> String {
    let repr = format!("{:?}", v);
    match repr.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => repr,
    }
}

/// Mean, population standard deviation and run listing per metric key.
///
/// Keys come from the first run; every other run must report them too. A
/// sentinel or non-finite score fails the aggregation instead of being
/// averaged in.
pub fn aggregate(runs: &[TaskResult]) -> Result<EvalResults, EvalError> {
    let mut out = EvalResults::new();
    let first = match runs.first() {
        Some(first) => first,
        None => return Ok(out),
    };
    for key in first.keys() {
        let scores = runs
            .iter()
            .enumerate()
            .map(|(i, run)| match run.get(key) {
                Some(&v) if v == NAN_DETECTED || !v.is_finite() => Err(EvalError::corruption(
                    format!("`{}` of run {} is {}", key, i, v),
                )),
                Some(&v) => Ok(v),
                None => Err(EvalError::contract(format!("run {} did not report `{}`", i, key))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let n = scores.len() as f64;
        let mean = scores.iter().sum::<f64>() / n;
        let var = scores.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let list = scores
            .iter()
            .map(|&v| format_score(v))
            .collect::<Vec<_>>()
            .join("_");
        out.insert(format!("{}_mean", key), MetricValue::Float(mean));
        out.insert(format!("{}_std", key), MetricValue::Float(var.sqrt()));
        out.insert(format!("{}_list", key), MetricValue::Text(list));
    }
    Ok(out)
}

/// Merge one task's statistics into the global mapping, rejecting collisions.
pub fn merge(into: &mut EvalResults, stats: EvalResults) -> Result<(), EvalError> {
    if let Some(key) = stats.keys().find(|k| into.contains_key(*k)) {
        return Err(EvalError::DuplicateMetric(key.clone()));
    }
    into.extend(stats);
    Ok(())
}
