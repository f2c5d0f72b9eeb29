// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod status;

use std::{env, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use combaine_cluster::{
    spawn_repository_watch, Coordination, FileRepository, HttpCoordination, Membership,
    MembershipConfig, MemoryCoordination, WorkerId,
};
use combaine_worker::{Registries, RetryPolicy, Worker};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("COMBAINE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config::Config::new() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Error creating config on combaine agent startup: {e}");
            return;
        }
    };

    let shutdown = CancellationToken::new();

    let backend: Arc<dyn Coordination> = match &config.coordination_url {
        Some(url) => Arc::new(HttpCoordination::new(url)),
        None => {
            info!("no coordination service configured, running as a single-worker cluster");
            Arc::new(MemoryCoordination::default())
        }
    };

    let worker_id = WorkerId::new(config.worker_id.clone());
    let (membership, membership_rx) = Membership::new(
        backend,
        MembershipConfig {
            worker: worker_id.clone(),
            lease_ttl: config.lease_ttl,
            members_poll: config.members_poll,
        },
    );
    let membership_handle = tokio::spawn(membership.run(shutdown.clone()));

    let repository = Arc::new(FileRepository::new(&config.config_dir));
    let (groups_rx, repository_handle) =
        spawn_repository_watch(repository, config.config_poll, shutdown.clone());

    let worker = Worker::new(
        worker_id,
        membership_rx,
        groups_rx,
        Registries::with_builtins(),
        config.host_timeout,
        RetryPolicy::new(config.send_attempts, config.send_backoff_base),
    );
    let view = worker.view();
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    if config.status_port > 0 {
        let status_shutdown = shutdown.clone();
        let status_port = config.status_port;
        tokio::spawn(async move {
            let res = status::serve(status_port, view, status_shutdown).await;
            if let Err(e) = res {
                error!("Error serving status endpoints: {e}");
            }
        });
    }

    info!(worker = %config.worker_id, "combaine agent started");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
        Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
    }
    shutdown.cancel();

    // groups stop first, then the membership task deregisters on its way out
    let _ = worker_handle.await;
    let _ = membership_handle.await;
    let _ = repository_handle.await;

    info!("combaine agent stopped");
}
