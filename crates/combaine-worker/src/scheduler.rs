// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-group cycle scheduling.
//!
//! Each owned group gets its own loop task ticking on the group's interval.
//! Cycles of one group are strictly sequential: a tick that arrives while
//! the previous cycle is still running is dropped and logged, never queued.
//! Revoking a group cancels its token; collection stops at host-result
//! granularity and nothing is aggregated or delivered afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use combaine_cluster::{GroupConfig, GroupName};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::aggregate;
use crate::collector::{Collection, Collector};
use crate::cycle::{unix_now, Cycle, Frame};
use crate::errors::AggregateError;
use crate::plugins::Registries;
use crate::sender::{RetryPolicy, Sender};
use crate::stats::WorkerStats;

/// How one cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed {
        delivered: usize,
        failed_sinks: usize,
    },
    Failed,
    Cancelled,
}

/// Executes one cycle end to end: collect, aggregate, deliver.
pub struct CycleRunner {
    registries: Registries,
    collector: Collector,
    sender: Sender,
    stats: Arc<WorkerStats>,
}

impl CycleRunner {
    pub fn new(
        registries: Registries,
        host_timeout: Duration,
        retry: RetryPolicy,
        stats: Arc<WorkerStats>,
    ) -> Self {
        let collector = Collector::new(host_timeout);
        let sender = Sender::new(Arc::clone(&registries.sinks), retry);
        Self {
            registries,
            collector,
            sender,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.stats
    }

    pub async fn run_cycle(
        &self,
        config: &GroupConfig,
        frame: Frame,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        self.stats.cycles_started.incr();
        let cycle = Cycle::new(config.name.clone(), frame);

        let fetcher = match self.registries.fetchers.build(&config.fetcher) {
            Ok(fetcher) => fetcher,
            Err(err) => {
                error!(cycle = %cycle.id, error = %err, "failed to build fetcher");
                self.stats.cycles_failed.incr();
                return CycleOutcome::Failed;
            }
        };

        let host_results = match self
            .collector
            .collect(&cycle, &config.hosts, fetcher, cancel)
            .await
        {
            Collection::Completed(results) => results,
            Collection::Cancelled => {
                self.stats.cycles_cancelled.incr();
                return CycleOutcome::Cancelled;
            }
        };
        let succeeded = host_results.iter().filter(|r| r.is_success()).count() as u64;
        self.stats.hosts_succeeded.add(succeeded);
        self.stats.hosts_failed.add(host_results.len() as u64 - succeeded);

        // Revocation boundary: once ownership is gone, no aggregate leaves
        // this worker.
        if cancel.is_cancelled() {
            self.stats.cycles_cancelled.incr();
            return CycleOutcome::Cancelled;
        }

        let result = match aggregate(&self.registries.combiners, config, &cycle, host_results) {
            Ok(result) => result,
            Err(err @ AggregateError::InsufficientData { .. }) => {
                warn!(cycle = %cycle.id, error = %err, "cycle skipped");
                self.stats.cycles_insufficient.incr();
                return CycleOutcome::Failed;
            }
            Err(err) => {
                error!(cycle = %cycle.id, error = %err, "cycle aggregation failed");
                self.stats.cycles_failed.incr();
                return CycleOutcome::Failed;
            }
        };

        if cancel.is_cancelled() {
            self.stats.cycles_cancelled.incr();
            return CycleOutcome::Cancelled;
        }

        let report = self.sender.send(&config.sinks, Arc::new(result)).await;
        self.stats.sinks_delivered.add(report.delivered as u64);
        self.stats.sinks_failed.add(report.failed.len() as u64);
        self.stats.cycles_completed.incr();
        info!(
            cycle = %cycle.id,
            delivered = report.delivered,
            failed_sinks = report.failed.len(),
            "cycle completed"
        );
        CycleOutcome::Completed {
            delivered: report.delivered,
            failed_sinks: report.failed.len(),
        }
    }
}

/// Scheduler state of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    Running,
    Revoked,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GroupState::Idle => "idle",
            GroupState::Running => "running",
            GroupState::Revoked => "revoked",
        })
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(state: GroupState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn store(&self, state: GroupState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    fn load(&self) -> GroupState {
        match self.0.load(Ordering::Relaxed) {
            0 => GroupState::Idle,
            1 => GroupState::Running,
            _ => GroupState::Revoked,
        }
    }
}

struct GroupEntry {
    config: GroupConfig,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    task: JoinHandle<()>,
}

impl GroupEntry {
    fn revoke(self) {
        self.state.store(GroupState::Revoked);
        self.cancel.cancel();
        // The loop observes the token and winds down on its own; in-flight
        // host calls stay bounded by the per-host timeout.
        drop(self.task);
    }
}

/// Owns the loop tasks for the groups currently assigned to this worker.
pub struct Scheduler {
    runner: Arc<CycleRunner>,
    groups: Mutex<HashMap<GroupName, GroupEntry>>,
}

impl Scheduler {
    pub fn new(runner: Arc<CycleRunner>) -> Self {
        Self {
            runner,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles the running loops with the desired group set: revokes
    /// groups that left, restarts groups whose config changed, starts
    /// groups that arrived. Unchanged groups keep their loop and schedule.
    pub fn apply(&self, desired: Vec<GroupConfig>) {
        let mut groups = self.groups.lock().expect("lock poisoned");
        let desired: HashMap<GroupName, GroupConfig> = desired
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();

        let stale: Vec<GroupName> = groups
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(entry) = groups.remove(&name) {
                info!(group = %name, "group revoked");
                entry.revoke();
            }
        }

        for (name, config) in desired {
            match groups.get(&name) {
                Some(entry) if entry.config == config => {}
                Some(_) => {
                    if let Some(entry) = groups.remove(&name) {
                        info!(group = %name, "group config changed, restarting");
                        entry.revoke();
                    }
                    groups.insert(name, self.start_group(config));
                }
                None => {
                    info!(group = %name, "group acquired");
                    groups.insert(name, self.start_group(config));
                }
            }
        }
    }

    pub fn revoke_all(&self) {
        let mut groups = self.groups.lock().expect("lock poisoned");
        for (name, entry) in groups.drain() {
            info!(group = %name, "group revoked");
            entry.revoke();
        }
    }

    pub fn owned_count(&self) -> usize {
        self.groups.lock().expect("lock poisoned").len()
    }

    /// Current groups and their states, sorted by name.
    pub fn snapshot(&self) -> Vec<(GroupName, GroupState)> {
        let groups = self.groups.lock().expect("lock poisoned");
        let mut snapshot: Vec<(GroupName, GroupState)> = groups
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state.load()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    fn start_group(&self, config: GroupConfig) -> GroupEntry {
        let cancel = CancellationToken::new();
        let state = Arc::new(StateCell::new(GroupState::Idle));
        let task = tokio::spawn(group_loop(
            Arc::clone(&self.runner),
            config.clone(),
            cancel.clone(),
            Arc::clone(&state),
        ));
        GroupEntry {
            config,
            cancel,
            state,
            task,
        }
    }
}

async fn group_loop(
    runner: Arc<CycleRunner>,
    config: GroupConfig,
    cancel: CancellationToken,
    state: Arc<StateCell>,
) {
    let interval_secs = config.interval_secs.max(1);
    // Start at the next interval boundary: a group moving between workers
    // must not fire twice within the boundary slot it last ran in.
    let align = Duration::from_secs(interval_secs - (unix_now() % interval_secs));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(align) => {}
    }

    let mut ticks = tokio::time::interval(Duration::from_secs(interval_secs));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = unix_now().saturating_sub(interval_secs);
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }
        if let Some(handle) = &in_flight {
            if !handle.is_finished() {
                warn!(group = %config.name, "previous cycle still running, dropping tick");
                runner.stats().ticks_dropped.incr();
                continue;
            }
        }

        let frame = Frame {
            previous,
            current: unix_now(),
        };
        previous = frame.current;
        state.store(GroupState::Running);

        let runner = Arc::clone(&runner);
        let config = config.clone();
        let cancel = cancel.clone();
        let state = Arc::clone(&state);
        in_flight = Some(tokio::spawn(async move {
            runner.run_cycle(&config, frame, &cancel).await;
            state.store(GroupState::Idle);
        }));
    }
}
