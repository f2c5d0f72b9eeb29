// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parallel host polling for one cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cycle::{Cycle, HostResult};
use crate::errors::HostFailure;
use crate::plugins::Fetcher;

/// Outcome of collecting one cycle.
#[derive(Debug)]
pub enum Collection {
    /// One result per polled host, successes and failures alike.
    Completed(Vec<HostResult>),
    /// Ownership was revoked mid-collection. In-flight host calls are
    /// abandoned; each is already bounded by the per-host timeout.
    Cancelled,
}

pub struct Collector {
    host_timeout: Duration,
}

impl Collector {
    pub fn new(host_timeout: Duration) -> Self {
        Self { host_timeout }
    }

    /// Polls every host in parallel. A host that neither answers nor fails
    /// within the per-host timeout is recorded as timed out; one host's
    /// failure never affects another's result.
    pub async fn collect(
        &self,
        cycle: &Cycle,
        hosts: &[String],
        fetcher: Arc<dyn Fetcher>,
        cancel: &CancellationToken,
    ) -> Collection {
        let mut tasks = JoinSet::new();
        for host in hosts {
            let host = host.clone();
            let fetcher = Arc::clone(&fetcher);
            let frame = cycle.frame;
            let host_timeout = self.host_timeout;
            tasks.spawn(async move {
                let started = Instant::now();
                let outcome = match tokio::time::timeout(host_timeout, fetcher.fetch(&host, frame))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(HostFailure::Timeout),
                };
                (host, outcome, started.elapsed())
            });
        }

        let mut results = Vec::with_capacity(hosts.len());
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(cycle = %cycle.id, "collection cancelled, abandoning in-flight hosts");
                    return Collection::Cancelled;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((host, outcome, elapsed))) => {
                        match &outcome {
                            Ok(metrics) => debug!(
                                cycle = %cycle.id,
                                host = %host,
                                metrics = metrics.len(),
                                elapsed_ms = elapsed.as_millis() as u64,
                                "host polled"
                            ),
                            Err(failure) => warn!(
                                cycle = %cycle.id,
                                host = %host,
                                error = %failure,
                                "host poll failed"
                            ),
                        }
                        results.push(HostResult { host, outcome });
                    }
                    Some(Err(join_error)) => {
                        warn!(cycle = %cycle.id, error = %join_error, "host poll task failed");
                    }
                    None => break,
                }
            }
        }
        Collection::Completed(results)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use combaine_cluster::GroupName;

    use super::*;
    use crate::cycle::{Frame, MetricMap};

    /// Fetcher scripted by host name prefix: `slow-*` hangs forever,
    /// `dead-*` is unreachable, anything else returns one metric.
    struct ScriptedFetcher;

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, host: &str, _frame: Frame) -> Result<MetricMap, HostFailure> {
            if host.starts_with("slow") {
                return std::future::pending::<Result<MetricMap, HostFailure>>().await;
            }
            if host.starts_with("dead") {
                return Err(HostFailure::Unreachable("connection refused".to_string()));
            }
            let mut metrics = MetricMap::new();
            metrics.insert("value".to_string(), 10.0);
            Ok(metrics)
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

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn every_host_yields_exactly_one_result() {
        let collector = Collector::new(Duration::from_millis(50));
        let collection = collector
            .collect(
                &cycle(),
                &hosts(&["h1", "slow-1", "dead-1", "h2", "slow-2"]),
                Arc::new(ScriptedFetcher),
                &CancellationToken::new(),
            )
            .await;

        let Collection::Completed(mut results) = collection else {
            panic!("collection must complete");
        };
        assert_eq!(results.len(), 5);

        results.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(
            results[0].outcome,
            Err(HostFailure::Unreachable("connection refused".to_string()))
        );
        assert!(results[1].is_success());
        assert!(results[2].is_success());
        assert_eq!(results[3].outcome, Err(HostFailure::Timeout));
        assert_eq!(results[4].outcome, Err(HostFailure::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_bounded_by_the_per_host_deadline() {
        let collector = Collector::new(Duration::from_secs(10));
        let started = Instant::now();
        let collection = collector
            .collect(
                &cycle(),
                &hosts(&["slow-1", "h1"]),
                Arc::new(ScriptedFetcher),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(collection, Collection::Completed(results) if results.len() == 2));
        // Virtual time must have advanced to the deadline, not beyond it.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_the_collection() {
        let collector = Collector::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let collection = collector
            .collect(
                &cycle(),
                &hosts(&["slow-1", "slow-2"]),
                Arc::new(ScriptedFetcher),
                &cancel,
            )
            .await;
        assert!(matches!(collection, Collection::Cancelled));
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits() {
        let collector = Collector::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let collection = collector
            .collect(&cycle(), &hosts(&["h1"]), Arc::new(ScriptedFetcher), &cancel)
            .await;
        assert!(matches!(collection, Collection::Cancelled));
    }
}
