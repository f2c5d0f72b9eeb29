// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in combiner plugins.
//!
//! Folds (`avg`, `sum`, `min`, `max`, `count`) collapse per-host rows into
//! one combined map, computing each metric over the hosts that reported it.
//! `scale` preserves shape and can sit on either side of a fold.

use std::sync::Arc;

use combaine_cluster::PluginSpec;
use hashbrown::hash_map::Entry;
use serde::Deserialize;

use crate::cycle::MetricMap;
use crate::errors::{CombineError, PluginError};
use crate::plugins::{typed_params, Combiner, CombinerRegistry, StageData};

/// Registry with the built-in combiners.
pub fn registry() -> CombinerRegistry {
    let mut registry = CombinerRegistry::new("combiner");
    for (name, kind) in [
        ("avg", FoldKind::Avg),
        ("sum", FoldKind::Sum),
        ("min", FoldKind::Min),
        ("max", FoldKind::Max),
        ("count", FoldKind::Count),
    ] {
        registry.register(name, move |_| {
            Ok(Arc::new(Fold { kind }) as Arc<dyn Combiner>)
        });
    }
    registry.register("scale", |spec| {
        Ok(Arc::new(Scale::from_spec(spec)?) as Arc<dyn Combiner>)
    });
    registry
}

#[derive(Debug, Clone, Copy)]
enum FoldKind {
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

impl FoldKind {
    fn merge(self, acc: f64, value: f64) -> f64 {
        match self {
            FoldKind::Avg | FoldKind::Sum => acc + value,
            FoldKind::Min => acc.min(value),
            FoldKind::Max => acc.max(value),
            FoldKind::Count => acc,
        }
    }

    fn finalize(self, acc: f64, seen: usize) -> f64 {
        match self {
            FoldKind::Avg => acc / seen as f64,
            FoldKind::Sum | FoldKind::Min | FoldKind::Max => acc,
            FoldKind::Count => seen as f64,
        }
    }
}

/// Per-metric fold across hosts. A metric missing from some hosts is folded
/// over the hosts that did report it.
struct Fold {
    kind: FoldKind,
}

impl Combiner for Fold {
    fn combine(&self, input: StageData) -> Result<StageData, CombineError> {
        let rows = match input {
            StageData::PerHost(rows) => rows,
            StageData::Combined(_) => return Err(CombineError::ExpectedPerHost),
        };
        let mut accumulator: hashbrown::HashMap<String, (f64, usize)> = hashbrown::HashMap::new();
        for row in rows {
            for (name, value) in row {
                match accumulator.entry(name) {
                    Entry::Occupied(mut entry) => {
                        let (acc, seen) = entry.get_mut();
                        *acc = self.kind.merge(*acc, value);
                        *seen += 1;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert((value, 1));
                    }
                }
            }
        }
        let combined: MetricMap = accumulator
            .into_iter()
            .map(|(name, (acc, seen))| (name, self.kind.finalize(acc, seen)))
            .collect();
        Ok(StageData::Combined(combined))
    }
}

#[derive(Debug, Deserialize)]
struct ScaleParams {
    factor: f64,
}

/// Multiplies every value by a fixed factor, keeping the input shape.
struct Scale {
    factor: f64,
}

impl Scale {
    fn from_spec(spec: &PluginSpec) -> Result<Self, PluginError> {
        let params: ScaleParams = typed_params(spec)?;
        Ok(Self {
            factor: params.factor,
        })
    }

    fn scale(&self, mut metrics: MetricMap) -> MetricMap {
        for value in metrics.values_mut() {
            *value *= self.factor;
        }
        metrics
    }
}

impl Combiner for Scale {
    fn combine(&self, input: StageData) -> Result<StageData, CombineError> {
        Ok(match input {
            StageData::PerHost(rows) => {
                StageData::PerHost(rows.into_iter().map(|row| self.scale(row)).collect())
            }
            StageData::Combined(metrics) => StageData::Combined(self.scale(metrics)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> MetricMap {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    fn fold(name: &str, rows: Vec<MetricMap>) -> MetricMap {
        let combiner = registry().build(&PluginSpec::named(name)).unwrap();
        match combiner.combine(StageData::PerHost(rows)).unwrap() {
            StageData::Combined(metrics) => metrics,
            StageData::PerHost(_) => panic!("fold must produce combined data"),
        }
    }

    #[test]
    fn avg_averages_each_metric_over_reporting_hosts() {
        let combined = fold(
            "avg",
            vec![row(&[("cpu", 10.0)]), row(&[("cpu", 20.0), ("mem", 4.0)])],
        );
        assert_eq!(combined.get("cpu"), Some(&15.0));
        // Only one host reported mem, so its average is its own value.
        assert_eq!(combined.get("mem"), Some(&4.0));
    }

    #[test]
    fn sum_min_max_fold_per_metric() {
        let rows = vec![row(&[("cpu", 10.0)]), row(&[("cpu", 30.0)])];
        assert_eq!(fold("sum", rows.clone()).get("cpu"), Some(&40.0));
        assert_eq!(fold("min", rows.clone()).get("cpu"), Some(&10.0));
        assert_eq!(fold("max", rows).get("cpu"), Some(&30.0));
    }

    #[test]
    fn count_reports_how_many_hosts_carried_the_metric() {
        let combined = fold(
            "count",
            vec![
                row(&[("cpu", 1.0)]),
                row(&[("cpu", 2.0)]),
                row(&[("mem", 3.0)]),
            ],
        );
        assert_eq!(combined.get("cpu"), Some(&2.0));
        assert_eq!(combined.get("mem"), Some(&1.0));
    }

    #[test]
    fn empty_input_folds_to_an_empty_map() {
        assert!(fold("avg", Vec::new()).is_empty());
    }

    #[test]
    fn folds_reject_already_combined_input() {
        let combiner = registry().build(&PluginSpec::named("avg")).unwrap();
        let err = combiner
            .combine(StageData::Combined(row(&[("cpu", 1.0)])))
            .unwrap_err();
        assert!(matches!(err, CombineError::ExpectedPerHost));
    }

    #[test]
    fn scale_works_on_both_sides_of_a_fold() {
        let scale = registry()
            .build(&PluginSpec::with_params(
                "scale",
                serde_json::json!({"factor": 2.0}),
            ))
            .unwrap();

        let scaled = scale
            .combine(StageData::PerHost(vec![row(&[("cpu", 10.0)])]))
            .unwrap();
        assert_eq!(scaled, StageData::PerHost(vec![row(&[("cpu", 20.0)])]));

        let scaled = scale
            .combine(StageData::Combined(row(&[("cpu", 15.0)])))
            .unwrap();
        assert_eq!(scaled, StageData::Combined(row(&[("cpu", 30.0)])));
    }

    #[test]
    fn scale_requires_a_factor() {
        let result = registry().build(&PluginSpec::named("scale"));
        assert!(matches!(result, Err(PluginError::InvalidParams { .. })));
    }

    #[test]
    fn registry_lists_builtins() {
        assert_eq!(
            registry().names(),
            ["avg", "count", "max", "min", "scale", "sum"]
        );
    }
}
