// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership maintenance.
//!
//! The membership task joins the cluster, heartbeats the lease, polls the
//! member list, and publishes every observed change on a watch channel.
//! When the lease is lost, or renewals have been failing for a full lease
//! ttl, the task fences itself: it publishes an empty not-joined snapshot so
//! the worker revokes all groups, then rejoins from scratch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination::{Coordination, CoordinationError, WorkerId};

const JOIN_BACKOFF_START: Duration = Duration::from_millis(500);
const JOIN_BACKOFF_CAP: Duration = Duration::from_secs(15);
const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

/// What the rest of the process knows about the cluster at one instant.
///
/// While `joined` is false the worker holds no lease and must not own any
/// groups; `members` is empty in that state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub joined: bool,
    pub members: Arc<[WorkerId]>,
}

impl Default for MembershipSnapshot {
    fn default() -> Self {
        Self {
            joined: false,
            members: Arc::from([]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub worker: WorkerId,
    pub lease_ttl: Duration,
    pub members_poll: Duration,
}

pub struct Membership {
    backend: Arc<dyn Coordination>,
    config: MembershipConfig,
    snapshot_tx: watch::Sender<MembershipSnapshot>,
}

impl Membership {
    pub fn new(
        backend: Arc<dyn Coordination>,
        config: MembershipConfig,
    ) -> (Self, watch::Receiver<MembershipSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(MembershipSnapshot::default());
        (
            Self {
                backend,
                config,
                snapshot_tx,
            },
            snapshot_rx,
        )
    }

    /// Drives the join/heartbeat/rejoin loop until `shutdown` fires, then
    /// deregisters from the backend.
    pub async fn run(self, shutdown: CancellationToken) {
        let heartbeat_every = (self.config.lease_ttl / 3).max(MIN_HEARTBEAT);
        loop {
            let members = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                members = self.join_with_backoff() => members,
            };
            self.publish(MembershipSnapshot {
                joined: true,
                members: members.into(),
            });
            info!(worker = %self.config.worker, "joined cluster");

            let lease_lost = self.steady_state(&shutdown, heartbeat_every).await;
            if !lease_lost {
                break;
            }
            warn!(worker = %self.config.worker, "lease lost, rejoining cluster");
            self.publish(MembershipSnapshot::default());
        }

        self.publish(MembershipSnapshot::default());
        match self.backend.deregister(&self.config.worker).await {
            Ok(()) => info!(worker = %self.config.worker, "left cluster"),
            Err(err) => {
                warn!(worker = %self.config.worker, error = %err, "failed to deregister, lease will expire on its own");
            }
        }
    }

    /// Registers and fetches the initial member list, retrying with doubling
    /// backoff until both succeed.
    async fn join_with_backoff(&self) -> Vec<WorkerId> {
        let mut backoff = JOIN_BACKOFF_START;
        loop {
            match self.try_join().await {
                Ok(members) => return members,
                Err(err) => {
                    warn!(
                        worker = %self.config.worker,
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "failed to join cluster"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(JOIN_BACKOFF_CAP);
                }
            }
        }
    }

    async fn try_join(&self) -> Result<Vec<WorkerId>, CoordinationError> {
        self.backend
            .register(&self.config.worker, self.config.lease_ttl)
            .await?;
        self.backend.members().await
    }

    /// Heartbeats the lease and polls membership until shutdown or lease
    /// loss. Returns true when the lease was lost and the caller should
    /// rejoin, false on shutdown.
    async fn steady_state(&self, shutdown: &CancellationToken, heartbeat_every: Duration) -> bool {
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll = tokio::time::interval(self.config.members_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // discard first tick, which is instantaneous
        poll.tick().await; // discard first tick, which is instantaneous

        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = heartbeat.tick() => {
                    match self.backend.renew(&self.config.worker).await {
                        Ok(_) => last_renewed = Instant::now(),
                        Err(CoordinationError::LeaseExpired(_)) => return true,
                        Err(err) => {
                            warn!(worker = %self.config.worker, error = %err, "lease renewal failed");
                            if last_renewed.elapsed() >= self.config.lease_ttl {
                                error!(
                                    worker = %self.config.worker,
                                    "no successful renewal within one lease ttl, assuming lease lost"
                                );
                                return true;
                            }
                        }
                    }
                }
                _ = poll.tick() => self.refresh_members().await,
            }
        }
    }

    async fn refresh_members(&self) {
        match self.backend.members().await {
            Ok(members) => self.publish(MembershipSnapshot {
                joined: true,
                members: members.into(),
            }),
            Err(err) => {
                debug!(worker = %self.config.worker, error = %err, "failed to poll members, keeping previous view");
            }
        }
    }

    fn publish(&self, snapshot: MembershipSnapshot) {
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
