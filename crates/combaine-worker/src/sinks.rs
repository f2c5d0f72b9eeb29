// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in sink plugins.

use std::sync::Arc;

use async_trait::async_trait;
use combaine_cluster::PluginSpec;
use regex::Regex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::info;

use crate::cycle::AggregateResult;
use crate::errors::{PluginError, SinkError};
use crate::plugins::{typed_params, Sink, SinkRegistry};

/// Registry with the built-in sinks: `http`, `graphite` and `log`.
pub fn registry() -> SinkRegistry {
    let mut registry = SinkRegistry::new("sink");
    registry.register("http", |spec| {
        Ok(Arc::new(HttpSink::from_spec(spec)?) as Arc<dyn Sink>)
    });
    registry.register("graphite", |spec| {
        Ok(Arc::new(GraphiteSink::from_spec(spec)?) as Arc<dyn Sink>)
    });
    registry.register("log", |_| Ok(Arc::new(LogSink) as Arc<dyn Sink>));
    registry
}

#[derive(Debug, Deserialize)]
struct HttpSinkParams {
    url: String,
}

/// POSTs the aggregate result as JSON.
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    fn from_spec(spec: &PluginSpec) -> Result<Self, PluginError> {
        let params: HttpSinkParams = typed_params(spec)?;
        let client = reqwest::Client::builder().build().unwrap_or_default();
        Ok(Self {
            url: params.url,
            client,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, result: &AggregateResult) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.url)
            .json(result)
            .send()
            .await
            .map_err(|err| SinkError::Delivery(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

fn default_prefix() -> String {
    "combaine".to_string()
}

#[derive(Debug, Deserialize)]
struct GraphiteParams {
    address: String,
    #[serde(default = "default_prefix")]
    prefix: String,
}

/// Writes `<prefix>.<group>.<metric> <value> <timestamp>` lines over the
/// Graphite plaintext protocol.
pub struct GraphiteSink {
    address: String,
    prefix: String,
    sanitize: Regex,
}

impl GraphiteSink {
    fn from_spec(spec: &PluginSpec) -> Result<Self, PluginError> {
        let params: GraphiteParams = typed_params(spec)?;
        let sanitize =
            Regex::new(r"[^A-Za-z0-9_.-]+").map_err(|err| PluginError::InvalidParams {
                plugin: spec.plugin.clone(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            address: params.address,
            prefix: params.prefix,
            sanitize,
        })
    }

    fn format_lines(&self, result: &AggregateResult) -> String {
        let mut names: Vec<&String> = result.metrics.keys().collect();
        names.sort_unstable();
        let mut lines = String::new();
        for name in names {
            let metric = self.sanitize.replace_all(name, "_");
            lines.push_str(&format!(
                "{}.{}.{} {} {}\n",
                self.prefix, result.group, metric, result.metrics[name], result.timestamp
            ));
        }
        lines
    }
}

#[async_trait]
impl Sink for GraphiteSink {
    async fn deliver(&self, result: &AggregateResult) -> Result<(), SinkError> {
        let lines = self.format_lines(result);
        let mut stream = TcpStream::connect(&self.address)
            .await
            .map_err(|err| SinkError::Delivery(err.to_string()))?;
        stream
            .write_all(lines.as_bytes())
            .await
            .map_err(|err| SinkError::Delivery(err.to_string()))?;
        stream
            .shutdown()
            .await
            .map_err(|err| SinkError::Delivery(err.to_string()))?;
        Ok(())
    }
}

/// Emits each metric as a tracing event. Useful when wiring up a group
/// before pointing it at a real backend.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, result: &AggregateResult) -> Result<(), SinkError> {
        for (metric, value) in &result.metrics {
            info!(
                group = %result.group,
                cycle = %result.cycle_id,
                metric = %metric,
                value = %value,
                "aggregate metric"
            );
        }
        Ok(())
    }
}
