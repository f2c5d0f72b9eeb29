// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ties membership, configuration and scheduling together.
//!
//! The worker recomputes the assignment whenever the membership snapshot or
//! the group set changes, then reconciles the scheduler against the groups
//! the hash ring gives to this worker. While not joined it owns nothing.

use std::sync::Arc;
use std::time::Duration;

use combaine_cluster::{assign, GroupConfig, GroupName, MembershipSnapshot, WorkerId};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::plugins::Registries;
use crate::scheduler::{CycleRunner, GroupState, Scheduler};
use crate::sender::RetryPolicy;
use crate::stats::{StatsSnapshot, WorkerStats};

/// Read-only handle onto a running worker, for the status endpoint.
#[derive(Clone)]
pub struct WorkerView {
    worker: WorkerId,
    stats: Arc<WorkerStats>,
    scheduler: Arc<Scheduler>,
    membership: watch::Receiver<MembershipSnapshot>,
}

impl WorkerView {
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn groups(&self) -> Vec<(GroupName, GroupState)> {
        self.scheduler.snapshot()
    }

    pub fn membership(&self) -> MembershipSnapshot {
        self.membership.borrow().clone()
    }
}

pub struct Worker {
    id: WorkerId,
    membership: watch::Receiver<MembershipSnapshot>,
    groups: watch::Receiver<Arc<[GroupConfig]>>,
    scheduler: Arc<Scheduler>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        membership: watch::Receiver<MembershipSnapshot>,
        groups: watch::Receiver<Arc<[GroupConfig]>>,
        registries: Registries,
        host_timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());
        let runner = Arc::new(CycleRunner::new(
            registries,
            host_timeout,
            retry,
            Arc::clone(&stats),
        ));
        let scheduler = Arc::new(Scheduler::new(runner));
        Self {
            id,
            membership,
            groups,
            scheduler,
            stats,
        }
    }

    pub fn view(&self) -> WorkerView {
        WorkerView {
            worker: self.id.clone(),
            stats: Arc::clone(&self.stats),
            scheduler: Arc::clone(&self.scheduler),
            membership: self.membership.clone(),
        }
    }

    /// Reconciles until shutdown. Also stops if either input channel closes,
    /// which only happens when the process is tearing down anyway.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.reconcile();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = self.membership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile();
                }
                changed = self.groups.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile();
                }
            }
        }
        self.scheduler.revoke_all();
        info!(worker = %self.id, "worker stopped");
    }

    fn reconcile(&mut self) {
        let snapshot = self.membership.borrow_and_update().clone();
        let groups = self.groups.borrow_and_update().clone();

        if !snapshot.joined {
            info!(worker = %self.id, "not a cluster member, revoking all groups");
            self.scheduler.revoke_all();
            return;
        }

        let names: Vec<GroupName> = groups.iter().map(|config| config.name.clone()).collect();
        let assignment = assign(&names, &snapshot.members);
        let owned: Vec<GroupConfig> = groups
            .iter()
            .filter(|config| assignment.owner_of(&config.name) == Some(&self.id))
            .cloned()
            .collect();

        info!(
            worker = %self.id,
            members = snapshot.members.len(),
            groups = names.len(),
            owned = owned.len(),
            "assignment recomputed"
        );
        for (member, count) in assignment.distribution() {
            debug!(member = %member, groups = count, "assignment distribution");
        }
        self.scheduler.apply(owned);
    }
}
