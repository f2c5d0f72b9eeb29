// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Data model of one collection cycle.

use std::time::{SystemTime, UNIX_EPOCH};

use combaine_cluster::GroupName;
use serde::{Deserialize, Serialize};

use crate::errors::HostFailure;

/// Flat metric-name-to-value map, the unit of data flowing through the
/// pipeline.
pub type MetricMap = hashbrown::HashMap<String, f64>;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The half-open time window `(previous, current]` a cycle covers. Fetchers
/// pass it to hosts so data is collected since the last cycle, not from an
/// arbitrary point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub previous: u64,
    pub current: u64,
}

impl Frame {
    /// The next frame: from the end of the previous one up to now.
    pub fn next(previous: u64) -> Self {
        Self {
            previous,
            current: unix_now(),
        }
    }
}

/// One scheduled run for one group.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub group: GroupName,
    pub frame: Frame,
    /// Correlates every log line and result of this run.
    pub id: String,
}

impl Cycle {
    pub fn new(group: GroupName, frame: Frame) -> Self {
        let id = format!("{}@{}", group, frame.current);
        Self { group, frame, id }
    }
}

/// Outcome of polling one host: its metrics, or a classified failure.
#[derive(Debug, Clone)]
pub struct HostResult {
    pub host: String,
    pub outcome: Result<MetricMap, HostFailure>,
}

impl HostResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostFailureReport {
    pub host: String,
    pub failure: HostFailure,
}

/// The combined metrics of one cycle plus collection metadata. This is what
/// sinks deliver downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub group: GroupName,
    pub cycle_id: String,
    /// End of the covered frame, in Unix seconds. Sinks use it as the data
    /// point timestamp.
    pub timestamp: u64,
    pub metrics: MetricMap,
    pub hosts_total: usize,
    pub hosts_succeeded: usize,
    pub failures: Vec<HostFailureReport>,
}
