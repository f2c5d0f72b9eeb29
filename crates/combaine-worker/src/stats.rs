// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker-level counters, cheap enough to bump from any task.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters accumulated over the life of the worker process.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub cycles_started: Counter,
    pub cycles_completed: Counter,
    pub cycles_cancelled: Counter,
    pub cycles_insufficient: Counter,
    pub cycles_failed: Counter,
    pub ticks_dropped: Counter,
    pub hosts_succeeded: Counter,
    pub hosts_failed: Counter,
    pub sinks_delivered: Counter,
    pub sinks_failed: Counter,
}

/// Point-in-time copy of the counters, shaped for the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub cycles_started: u64,
    pub cycles_completed: u64,
    pub cycles_cancelled: u64,
    pub cycles_insufficient: u64,
    pub cycles_failed: u64,
    pub ticks_dropped: u64,
    pub hosts_succeeded: u64,
    pub hosts_failed: u64,
    pub sinks_delivered: u64,
    pub sinks_failed: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles_started: self.cycles_started.get(),
            cycles_completed: self.cycles_completed.get(),
            cycles_cancelled: self.cycles_cancelled.get(),
            cycles_insufficient: self.cycles_insufficient.get(),
            cycles_failed: self.cycles_failed.get(),
            ticks_dropped: self.ticks_dropped.get(),
            hosts_succeeded: self.hosts_succeeded.get(),
            hosts_failed: self.hosts_failed.get(),
            sinks_delivered: self.sinks_delivered.get(),
            sinks_failed: self.sinks_failed.get(),
        }
    }
}
