// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of aggregate results to the group's sinks.
//!
//! Sinks are independent: each gets its own task and its own retry budget,
//! and one sink exhausting its retries never blocks another or fails the
//! cycle. Exhaustion is reported in the send report and the counters.

use std::sync::Arc;
use std::time::Duration;

use combaine_cluster::PluginSpec;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cycle::AggregateResult;
use crate::plugins::{Sink, SinkRegistry};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded exponential backoff: `backoff_base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff_base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff_base,
        }
    }

    fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

/// How one cycle's deliveries went.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: usize,
    /// Sink name and the final error, one entry per sink that never made it.
    pub failed: Vec<(String, String)>,
}

impl SendReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Sender {
    registry: Arc<SinkRegistry>,
    policy: RetryPolicy,
}

impl Sender {
    pub fn new(registry: Arc<SinkRegistry>, policy: RetryPolicy) -> Self {
        Self { registry, policy }
    }

    /// Delivers `result` to every configured sink concurrently.
    pub async fn send(&self, specs: &[PluginSpec], result: Arc<AggregateResult>) -> SendReport {
        let mut tasks = JoinSet::new();
        let mut failed = Vec::new();
        for spec in specs {
            match self.registry.build(spec) {
                Ok(sink) => {
                    let name = spec.plugin.clone();
                    let result = Arc::clone(&result);
                    let policy = self.policy;
                    tasks.spawn(async move {
                        let outcome = deliver_with_retry(sink, &name, &result, policy).await;
                        (name, outcome)
                    });
                }
                Err(err) => {
                    error!(
                        cycle = %result.cycle_id,
                        sink = %spec.plugin,
                        error = %err,
                        "failed to build sink"
                    );
                    failed.push((spec.plugin.clone(), err.to_string()));
                }
            }
        }

        let mut delivered = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((name, Err(reason))) => failed.push((name, reason)),
                Err(join_error) => {
                    warn!(cycle = %result.cycle_id, error = %join_error, "sink task failed");
                }
            }
        }
        SendReport { delivered, failed }
    }
}

async fn deliver_with_retry(
    sink: Arc<dyn Sink>,
    name: &str,
    result: &AggregateResult,
    policy: RetryPolicy,
) -> Result<(), String> {
    let mut attempt = 1;
    loop {
        match sink.deliver(result).await {
            Ok(()) => {
                debug!(cycle = %result.cycle_id, sink = name, attempt, "aggregate delivered");
                return Ok(());
            }
            Err(err) if attempt < policy.attempts => {
                let backoff = policy.backoff_after(attempt);
                warn!(
                    cycle = %result.cycle_id,
                    sink = name,
                    attempt,
                    error = %err,
                    retry_in_ms = backoff.as_millis() as u64,
                    "delivery attempt failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                error!(
                    cycle = %result.cycle_id,
                    sink = name,
                    attempts = attempt,
                    error = %err,
                    "delivery failed, retries exhausted"
                );
                return Err(err.to_string());
            }
        }
    }
}
