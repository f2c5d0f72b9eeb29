// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric collection and aggregation worker.
//!
//! A worker owns a slice of the configured groups, decided by the cluster
//! assignment. For every owned group a scheduler drives strictly sequential
//! cycles: fetch metrics from each host in parallel, combine the successful
//! results through the group's pipeline, and deliver the aggregate to the
//! configured sinks with bounded retries.

pub mod aggregate;
pub mod collector;
pub mod combiners;
pub mod cycle;
pub mod errors;
pub mod fetchers;
pub mod plugins;
pub mod scheduler;
pub mod sender;
pub mod sinks;
pub mod stats;
pub mod worker;

pub use aggregate::aggregate;
pub use collector::{Collection, Collector};
pub use cycle::{AggregateResult, Cycle, Frame, HostFailureReport, HostResult, MetricMap};
pub use errors::{AggregateError, CombineError, HostFailure, PluginError, SinkError};
pub use plugins::{
    Combiner, CombinerRegistry, Fetcher, FetcherRegistry, Registries, Registry, Sink,
    SinkRegistry, StageData,
};
pub use scheduler::{CycleOutcome, CycleRunner, GroupState, Scheduler};
pub use sender::{RetryPolicy, SendReport, Sender};
pub use stats::{StatsSnapshot, WorkerStats};
pub use worker::{Worker, WorkerView};
