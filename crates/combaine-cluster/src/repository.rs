// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Group configuration store.
//!
//! A group definition names the hosts to poll, the polling interval, and the
//! aggregation pipeline: one fetcher plugin, an ordered list of combiners,
//! and the sinks to deliver to. The file store reads one YAML file per group
//! from a directory, the file stem being the group name:
//!
//! ```yaml
//! hosts:
//!   - web-1.example.com
//!   - web-2.example.com
//! interval_secs: 60
//! fetcher:
//!   plugin: http
//!   params:
//!     port: 8080
//! combiners:
//!   - plugin: avg
//! sinks:
//!   - plugin: graphite
//!     params:
//!       address: "127.0.0.1:2003"
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Name of a monitored group, unique within the cluster.
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    From,
    Into,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct GroupName(String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A plugin reference: registry name plus free-form parameters the plugin
/// deserializes itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub plugin: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl PluginSpec {
    pub fn named(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(plugin: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            plugin: plugin.into(),
            params,
        }
    }
}

fn default_min_success() -> usize {
    1
}

/// One group definition, immutable within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub name: GroupName,
    pub hosts: Vec<String>,
    pub interval_secs: u64,
    pub fetcher: PluginSpec,
    pub combiners: Vec<PluginSpec>,
    pub sinks: Vec<PluginSpec>,
    /// Minimum number of successful hosts a cycle needs before aggregation
    /// is meaningful.
    #[serde(default = "default_min_success")]
    pub min_success: usize,
}

impl GroupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), RepositoryError> {
        let invalid = |reason: &str| RepositoryError::Invalid {
            group: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.as_str().is_empty() {
            return Err(invalid("group name is empty"));
        }
        if self.hosts.is_empty() {
            return Err(invalid("no hosts configured"));
        }
        if self.interval_secs == 0 {
            return Err(invalid("interval must be at least one second"));
        }
        if self.combiners.is_empty() {
            return Err(invalid("no combiner stages configured"));
        }
        if self.sinks.is_empty() {
            return Err(invalid("no sinks configured"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid group {group}: {reason}")]
    Invalid { group: GroupName, reason: String },
}

/// Source of group definitions.
#[async_trait]
pub trait Repository: Send + Sync {
    /// All configured groups, sorted by name.
    async fn list_groups(&self) -> Result<Vec<GroupConfig>, RepositoryError>;
}

/// Reads group definitions from a directory of `*.yaml`/`*.yml` files. The
/// directory is small and read-mostly, so reads are synchronous.
pub struct FileRepository {
    dir: PathBuf,
}

impl FileRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load_file(&self, path: &Path) -> Result<GroupConfig, RepositoryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RepositoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut group: GroupConfig =
            serde_yaml::from_str(&raw).map_err(|source| RepositoryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            group.name = GroupName::new(stem);
        }
        group.validate()?;
        Ok(group)
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

#[async_trait]
impl Repository for FileRepository {
    async fn list_groups(&self) -> Result<Vec<GroupConfig>, RepositoryError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| RepositoryError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut groups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RepositoryError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !is_yaml(&path) {
                continue;
            }
            groups.push(self.load_file(&path)?);
        }
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }
}

/// In-process repository, for tests and embedded use.
#[derive(Default)]
pub struct MemoryRepository {
    groups: Mutex<Vec<GroupConfig>>,
}

impl MemoryRepository {
    pub fn new(groups: Vec<GroupConfig>) -> Self {
        Self {
            groups: Mutex::new(groups),
        }
    }

    pub fn replace(&self, groups: Vec<GroupConfig>) {
        *self.groups.lock().expect("lock poisoned") = groups;
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_groups(&self) -> Result<Vec<GroupConfig>, RepositoryError> {
        let mut groups = self.groups.lock().expect("lock poisoned").clone();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }
}

/// Polls the repository and publishes each distinct group set on a watch
/// channel. The first poll happens immediately. A failed poll keeps the
/// previous snapshot: a broken config push must not tear down running
/// groups.
pub fn spawn_repository_watch(
    repository: Arc<dyn Repository>,
    poll_every: Duration,
    shutdown: CancellationToken,
) -> (
    watch::Receiver<Arc<[GroupConfig]>>,
    tokio::task::JoinHandle<()>,
) {
    let (snapshot_tx, snapshot_rx) = watch::channel::<Arc<[GroupConfig]>>(Arc::from(Vec::new()));
    let handle = tokio::spawn(async move {
        let mut poll = tokio::time::interval(poll_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = poll.tick() => {}
            }
            match repository.list_groups().await {
                Ok(groups) => {
                    snapshot_tx.send_if_modified(|current| {
                        if current.as_ref() == groups.as_slice() {
                            false
                        } else {
                            info!(groups = groups.len(), "group configuration changed");
                            *current = groups.into();
                            true
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "failed to load group configuration, keeping previous snapshot");
                }
            }
        }
    });
    (snapshot_rx, handle)
}
