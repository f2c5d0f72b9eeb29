// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cluster plumbing for Combaine workers.
//!
//! The crate covers everything a worker needs before it can run a single
//! collection cycle: a lease-based view of which workers are alive
//! ([`coordination`], [`membership`]), a deterministic mapping from monitored
//! groups to workers ([`partition`]), and the store of group definitions
//! ([`repository`]).

pub mod coordination;
pub mod http_coordination;
pub mod membership;
pub mod partition;
pub mod repository;

pub use coordination::{Coordination, CoordinationError, Lease, MemoryCoordination, WorkerId};
pub use http_coordination::HttpCoordination;
pub use membership::{Membership, MembershipConfig, MembershipSnapshot};
pub use partition::{assign, Assignment, HashRing};
pub use repository::{
    spawn_repository_watch, FileRepository, GroupConfig, GroupName, MemoryRepository, PluginSpec,
    Repository, RepositoryError,
};
