// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in fetcher plugins.

use std::sync::Arc;

use async_trait::async_trait;
use combaine_cluster::PluginSpec;
use serde::Deserialize;

use crate::cycle::{Frame, MetricMap};
use crate::errors::{HostFailure, PluginError};
use crate::plugins::{typed_params, Fetcher, FetcherRegistry};

/// Registry with the built-in fetchers: `http` and `static`.
pub fn registry() -> FetcherRegistry {
    let mut registry = FetcherRegistry::new("fetcher");
    registry.register("http", |spec| {
        Ok(Arc::new(HttpFetcher::from_spec(spec)?) as Arc<dyn Fetcher>)
    });
    registry.register("static", |spec| {
        Ok(Arc::new(StaticFetcher::from_spec(spec)?) as Arc<dyn Fetcher>)
    });
    registry
}

fn default_path() -> String {
    "/metrics".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

#[derive(Debug, Deserialize)]
struct HttpFetcherParams {
    port: u16,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default = "default_scheme")]
    scheme: String,
}

/// Asks each host for a flat JSON object of numbers over the cycle's frame:
/// `GET <scheme>://<host>:<port><path>?from=<previous>&until=<current>`.
pub struct HttpFetcher {
    params: HttpFetcherParams,
    client: reqwest::Client,
}

impl HttpFetcher {
    fn from_spec(spec: &PluginSpec) -> Result<Self, PluginError> {
        // No client-side timeout: the collector bounds every fetch with the
        // per-host deadline.
        let client = reqwest::Client::builder().build().unwrap_or_default();
        Ok(Self {
            params: typed_params(spec)?,
            client,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, host: &str, frame: Frame) -> Result<MetricMap, HostFailure> {
        let url = format!(
            "{}://{}:{}{}",
            self.params.scheme, host, self.params.port, self.params.path
        );
        let response = self
            .client
            .get(&url)
            .query(&[("from", frame.previous), ("until", frame.current)])
            .send()
            .await
            .map_err(|err| HostFailure::Unreachable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(HostFailure::Unreachable(format!(
                "status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|err| HostFailure::Parse(err.to_string()))?;
        parse_metrics(&body)
    }
}

fn parse_metrics(body: &serde_json::Value) -> Result<MetricMap, HostFailure> {
    let object = body
        .as_object()
        .ok_or_else(|| HostFailure::Parse("expected a JSON object of numbers".to_string()))?;
    let mut metrics = MetricMap::with_capacity(object.len());
    for (name, value) in object {
        let number = value
            .as_f64()
            .ok_or_else(|| HostFailure::Parse(format!("metric {name} is not a number")))?;
        metrics.insert(name.clone(), number);
    }
    Ok(metrics)
}

#[derive(Debug, Deserialize)]
struct StaticParams {
    #[serde(default)]
    metrics: MetricMap,
}

/// Returns fixed metrics from its params, for smoke-testing pipelines.
pub struct StaticFetcher {
    metrics: MetricMap,
}

impl StaticFetcher {
    fn from_spec(spec: &PluginSpec) -> Result<Self, PluginError> {
        let params: StaticParams = typed_params(spec)?;
        Ok(Self {
            metrics: params.metrics,
        })
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, _host: &str, _frame: Frame) -> Result<MetricMap, HostFailure> {
        Ok(self.metrics.clone())
    }
}
