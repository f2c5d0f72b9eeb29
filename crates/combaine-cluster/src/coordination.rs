// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lease-based coordination backend contract.
//!
//! A worker registers itself under a time-bounded lease, renews it on a
//! heartbeat cadence, and reads back the set of live members. Any backend
//! providing these primitives can drive a Combaine cluster. The in-memory
//! implementation below is the reference model; it also serves single-node
//! deployments and tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Identifier of one worker process in the cluster.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From, Into, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A granted liveness claim. The holder must renew before `ttl` elapses or
/// the backend treats the worker as gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub ttl: Duration,
    pub deadline: Instant,
}

impl Lease {
    /// Lease granted now, expiring one ttl from now.
    pub fn granted(ttl: Duration) -> Self {
        Self {
            ttl,
            deadline: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The backend could not be reached or answered with a server error.
    /// Transient: callers retry with backoff.
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),
    /// The lease lapsed before renewal. The worker must stop running cycles
    /// and rejoin from scratch.
    #[error("lease expired for worker {0}")]
    LeaseExpired(WorkerId),
}

/// Lease operations a coordination backend must provide.
///
/// The membership service relies only on the semantics spelled out per
/// method, so backends are substitutable: the HTTP client in
/// [`crate::http_coordination`] talks to a shared lease service, while
/// [`MemoryCoordination`] keeps everything in-process.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Registers `worker` under a lease of `ttl`. Registering an already
    /// known worker resets its lease.
    async fn register(&self, worker: &WorkerId, ttl: Duration)
        -> Result<Lease, CoordinationError>;

    /// Renews the lease for `worker`. Fails with
    /// [`CoordinationError::LeaseExpired`] when the lease already lapsed or
    /// the backend does not know the worker.
    async fn renew(&self, worker: &WorkerId) -> Result<Lease, CoordinationError>;

    /// Removes `worker` immediately. Idempotent.
    async fn deregister(&self, worker: &WorkerId) -> Result<(), CoordinationError>;

    /// Returns the workers holding an unexpired lease, sorted by id.
    async fn members(&self) -> Result<Vec<WorkerId>, CoordinationError>;
}

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
}

/// In-process coordination backend keeping leases in a mutexed table.
#[derive(Debug, Default)]
pub struct MemoryCoordination {
    leases: Mutex<HashMap<WorkerId, LeaseEntry>>,
}

#[async_trait]
impl Coordination for MemoryCoordination {
    async fn register(
        &self,
        worker: &WorkerId,
        ttl: Duration,
    ) -> Result<Lease, CoordinationError> {
        let mut leases = self.leases.lock().expect("lock poisoned");
        let deadline = Instant::now() + ttl;
        leases.insert(worker.clone(), LeaseEntry { ttl, deadline });
        Ok(Lease { ttl, deadline })
    }

    async fn renew(&self, worker: &WorkerId) -> Result<Lease, CoordinationError> {
        let mut leases = self.leases.lock().expect("lock poisoned");
        let now = Instant::now();
        match leases.get_mut(worker) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(Lease {
                    ttl: entry.ttl,
                    deadline: entry.deadline,
                })
            }
            Some(_) => {
                leases.remove(worker);
                Err(CoordinationError::LeaseExpired(worker.clone()))
            }
            None => Err(CoordinationError::LeaseExpired(worker.clone())),
        }
    }

    async fn deregister(&self, worker: &WorkerId) -> Result<(), CoordinationError> {
        let mut leases = self.leases.lock().expect("lock poisoned");
        leases.remove(worker);
        Ok(())
    }

    async fn members(&self) -> Result<Vec<WorkerId>, CoordinationError> {
        let mut leases = self.leases.lock().expect("lock poisoned");
        let now = Instant::now();
        leases.retain(|_, entry| entry.deadline > now);
        let mut members: Vec<WorkerId> = leases.keys().cloned().collect();
        members.sort();
        Ok(members)
    }
}
