// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Failure taxonomy for the collection pipeline.
//!
//! Host and sink failures are contained to their own unit and reported as
//! structured data, never thrown up to abort unrelated work. Only
//! coordination loss halts scheduling, and that lives in the cluster crate.

use serde::{Deserialize, Serialize};

/// Why one host produced no metrics this cycle. Travels as metadata in the
/// aggregate result, so it serializes with a stable shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum HostFailure {
    #[error("timed out")]
    Timeout,

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("parse failure: {0}")]
    Parse(String),
}

/// Building a plugin from its spec failed.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("unknown {0}")]
    Unknown(String),

    #[error("invalid parameters for plugin {plugin}: {reason}")]
    InvalidParams { plugin: String, reason: String },
}

/// A combiner stage rejected its input.
#[derive(Debug, thiserror::Error)]
pub enum CombineError {
    #[error("expected per-host input, got already combined data")]
    ExpectedPerHost,

    #[error("invalid input: {0}")]
    Invalid(String),
}

/// Aggregation of one cycle failed as a whole.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("insufficient data: {succeeded} of {total} hosts succeeded, {required} required")]
    InsufficientData {
        succeeded: usize,
        total: usize,
        required: usize,
    },

    #[error("combiner stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: CombineError,
    },

    #[error("pipeline for group {group} ended with per-host data, add a fold stage")]
    NotCombined { group: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Delivering to one sink failed (a single attempt; retries wrap this).
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("sink endpoint returned status {0}")]
    Status(u16),
}
