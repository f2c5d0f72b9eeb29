// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Combines one cycle's host results through the group's pipeline.

use combaine_cluster::GroupConfig;
use tracing::debug;

use crate::cycle::{AggregateResult, Cycle, HostFailureReport, HostResult};
use crate::errors::AggregateError;
use crate::plugins::{CombinerRegistry, StageData};

/// Runs the group's combiner stages over the successful host results.
///
/// Failed hosts never enter numeric computation; they are carried in the
/// result as classified metadata. The pipeline must end in combined data,
/// and at least `min_success` hosts must have succeeded for the cycle to
/// aggregate at all.
pub fn aggregate(
    combiners: &CombinerRegistry,
    group: &GroupConfig,
    cycle: &Cycle,
    host_results: Vec<HostResult>,
) -> Result<AggregateResult, AggregateError> {
    let hosts_total = host_results.len();
    let mut rows = Vec::with_capacity(hosts_total);
    let mut failures = Vec::new();
    for result in host_results {
        match result.outcome {
            Ok(metrics) => rows.push(metrics),
            Err(failure) => failures.push(HostFailureReport {
                host: result.host,
                failure,
            }),
        }
    }

    let hosts_succeeded = rows.len();
    if hosts_succeeded < group.min_success {
        return Err(AggregateError::InsufficientData {
            succeeded: hosts_succeeded,
            total: hosts_total,
            required: group.min_success,
        });
    }

    let mut data = StageData::PerHost(rows);
    for spec in &group.combiners {
        let combiner = combiners.build(spec)?;
        data = combiner
            .combine(data)
            .map_err(|source| AggregateError::Stage {
                stage: spec.plugin.clone(),
                source,
            })?;
    }
    let metrics = match data {
        StageData::Combined(metrics) => metrics,
        StageData::PerHost(_) => {
            return Err(AggregateError::NotCombined {
                group: group.name.to_string(),
            })
        }
    };

    debug!(
        cycle = %cycle.id,
        metrics = metrics.len(),
        hosts_succeeded,
        hosts_total,
        "cycle aggregated"
    );
    Ok(AggregateResult {
        group: group.name.clone(),
        cycle_id: cycle.id.clone(),
        timestamp: cycle.frame.current,
        metrics,
        hosts_total,
        hosts_succeeded,
        failures,
    })
}

#[cfg(test)]
mod tests {
    use combaine_cluster::{GroupName, PluginSpec};

    use super::*;
    use crate::combiners;
    use crate::cycle::{Frame, MetricMap};
    use crate::errors::{CombineError, HostFailure};

    fn group(combiner_specs: Vec<PluginSpec>, min_success: usize) -> GroupConfig {
        GroupConfig {
            name: GroupName::new("g1"),
            hosts: vec!["h1".to_string(), "h2".to_string()],
            interval_secs: 60,
            fetcher: PluginSpec::named("static"),
            combiners: combiner_specs,
            sinks: vec![PluginSpec::named("log")],
            min_success,
        }
    }

    fn cycle() -> Cycle {
        Cycle::new(
            GroupName::new("g1"),
            Frame {
                previous: 100,
                current: 160,
            },
        )
    }

    fn success(host: &str, value: f64) -> HostResult {
        let mut metrics = MetricMap::new();
        metrics.insert("value".to_string(), value);
        HostResult {
            host: host.to_string(),
            outcome: Ok(metrics),
        }
    }

    fn failure(host: &str, failure: HostFailure) -> HostResult {
        HostResult {
            host: host.to_string(),
            outcome: Err(failure),
        }
    }

    #[test]
    fn failed_hosts_become_metadata_not_data() {
        let registry = combiners::registry();
        let result = aggregate(
            &registry,
            &group(vec![PluginSpec::named("avg")], 1),
            &cycle(),
            vec![success("h1", 10.0), failure("h2", HostFailure::Timeout)],
        )
        .unwrap();

        assert_eq!(result.metrics.get("value"), Some(&10.0));
        assert_eq!(result.hosts_total, 2);
        assert_eq!(result.hosts_succeeded, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].host, "h2");
        assert_eq!(result.failures[0].failure, HostFailure::Timeout);
        assert_eq!(result.timestamp, 160);
        assert_eq!(result.cycle_id, "g1@160");
    }

    #[test]
    fn too_few_successes_is_insufficient_data() {
        let registry = combiners::registry();
        let err = aggregate(
            &registry,
            &group(vec![PluginSpec::named("avg")], 2),
            &cycle(),
            vec![success("h1", 10.0), failure("h2", HostFailure::Timeout)],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            AggregateError::InsufficientData {
                succeeded: 1,
                total: 2,
                required: 2,
            }
        ));
    }

    #[test]
    fn stages_chain_in_order() {
        let registry = combiners::registry();
        let scale = PluginSpec::with_params("scale", serde_json::json!({"factor": 2.0}));
        let result = aggregate(
            &registry,
            &group(vec![scale, PluginSpec::named("avg")], 1),
            &cycle(),
            vec![success("h1", 10.0), success("h2", 20.0)],
        )
        .unwrap();
        assert_eq!(result.metrics.get("value"), Some(&30.0));

        let scale = PluginSpec::with_params("scale", serde_json::json!({"factor": 2.0}));
        let result = aggregate(
            &registry,
            &group(vec![PluginSpec::named("avg"), scale], 1),
            &cycle(),
            vec![success("h1", 10.0), success("h2", 20.0)],
        )
        .unwrap();
        assert_eq!(result.metrics.get("value"), Some(&30.0));
    }

    #[test]
    fn a_pipeline_ending_per_host_is_rejected() {
        let registry = combiners::registry();
        let scale = PluginSpec::with_params("scale", serde_json::json!({"factor": 2.0}));
        let err = aggregate(
            &registry,
            &group(vec![scale], 1),
            &cycle(),
            vec![success("h1", 10.0)],
        )
        .unwrap_err();
        assert!(matches!(err, AggregateError::NotCombined { .. }));
    }

    #[test]
    fn a_failing_stage_is_named() {
        let registry = combiners::registry();
        let err = aggregate(
            &registry,
            &group(vec![PluginSpec::named("avg"), PluginSpec::named("sum")], 1),
            &cycle(),
            vec![success("h1", 10.0)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AggregateError::Stage {
                ref stage,
                source: CombineError::ExpectedPerHost,
            } if stage == "sum"
        ));
    }

    #[test]
    fn unknown_combiners_fail_the_cycle() {
        let registry = combiners::registry();
        let err = aggregate(
            &registry,
            &group(vec![PluginSpec::named("median")], 1),
            &cycle(),
            vec![success("h1", 10.0)],
        )
        .unwrap_err();
        assert!(matches!(err, AggregateError::Plugin(_)));
    }
}
