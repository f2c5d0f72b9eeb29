// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Plugin seams and the registries that build plugins from group configs.
//!
//! Each plugin kind is a small capability trait. Plugins hold no shared
//! state between invocations; a registry builds a fresh instance per cycle
//! from the group's [`PluginSpec`].

use std::sync::Arc;

use async_trait::async_trait;
use combaine_cluster::PluginSpec;
use serde::de::DeserializeOwned;

use crate::cycle::{AggregateResult, Frame, MetricMap};
use crate::errors::{CombineError, HostFailure, PluginError, SinkError};

/// Polls one host for the metrics covering `frame`. Fetching and parsing
/// are one seam: whatever the host speaks, the fetcher turns it into a
/// metric map or a classified failure.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, host: &str, frame: Frame) -> Result<MetricMap, HostFailure>;
}

/// Data flowing between combiner stages. Folds consume per-host rows and
/// produce a combined map; shape-preserving stages accept either.
#[derive(Debug, Clone, PartialEq)]
pub enum StageData {
    PerHost(Vec<MetricMap>),
    Combined(MetricMap),
}

/// One stage of the aggregation pipeline. Pure: same input, same output.
pub trait Combiner: Send + Sync {
    fn combine(&self, input: StageData) -> Result<StageData, CombineError>;
}

/// Delivers one aggregate result downstream.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, result: &AggregateResult) -> Result<(), SinkError>;
}

type Builder<P> = Box<dyn Fn(&PluginSpec) -> Result<Arc<P>, PluginError> + Send + Sync>;

/// Named constructors for one plugin kind.
pub struct Registry<P: ?Sized> {
    kind: &'static str,
    builders: hashbrown::HashMap<String, Builder<P>>,
}

impl<P: ?Sized> Registry<P> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            builders: hashbrown::HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        builder: impl Fn(&PluginSpec) -> Result<Arc<P>, PluginError> + Send + Sync + 'static,
    ) {
        self.builders.insert(name.into(), Box::new(builder));
    }

    pub fn build(&self, spec: &PluginSpec) -> Result<Arc<P>, PluginError> {
        match self.builders.get(&spec.plugin) {
            Some(builder) => builder(spec),
            None => Err(PluginError::Unknown(format!(
                "{} {}",
                self.kind, spec.plugin
            ))),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub type FetcherRegistry = Registry<dyn Fetcher>;
pub type CombinerRegistry = Registry<dyn Combiner>;
pub type SinkRegistry = Registry<dyn Sink>;

/// The three registries a worker runs with.
#[derive(Clone)]
pub struct Registries {
    pub fetchers: Arc<FetcherRegistry>,
    pub combiners: Arc<CombinerRegistry>,
    pub sinks: Arc<SinkRegistry>,
}

impl Registries {
    /// Registries holding only the built-in plugins.
    pub fn with_builtins() -> Self {
        Self {
            fetchers: Arc::new(crate::fetchers::registry()),
            combiners: Arc::new(crate::combiners::registry()),
            sinks: Arc::new(crate::sinks::registry()),
        }
    }

    pub fn from_parts(
        fetchers: FetcherRegistry,
        combiners: CombinerRegistry,
        sinks: SinkRegistry,
    ) -> Self {
        Self {
            fetchers: Arc::new(fetchers),
            combiners: Arc::new(combiners),
            sinks: Arc::new(sinks),
        }
    }
}

/// Deserializes a spec's params into the plugin's own parameter struct.
/// Missing params mean "all defaults", so `null` reads as an empty object.
pub fn typed_params<T: DeserializeOwned>(spec: &PluginSpec) -> Result<T, PluginError> {
    let params = match &spec.params {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|err| PluginError::InvalidParams {
        plugin: spec.plugin.clone(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    struct Identity;

    impl Combiner for Identity {
        fn combine(&self, input: StageData) -> Result<StageData, CombineError> {
            Ok(input)
        }
    }

    #[test]
    fn build_resolves_registered_plugins() {
        let mut registry = CombinerRegistry::new("combiner");
        registry.register("identity", |_| Ok(Arc::new(Identity) as Arc<dyn Combiner>));

        let plugin = registry.build(&PluginSpec::named("identity")).unwrap();
        let out = plugin.combine(StageData::Combined(MetricMap::new())).unwrap();
        assert_eq!(out, StageData::Combined(MetricMap::new()));
    }

    #[test]
    fn build_rejects_unknown_plugins_by_kind_and_name() {
        let registry = CombinerRegistry::new("combiner");
        let Err(err) = registry.build(&PluginSpec::named("median")) else {
            panic!("median should not resolve");
        };
        assert_eq!(err.to_string(), "unknown combiner median");
    }

    #[test]
    fn names_are_sorted() {
        let mut registry = CombinerRegistry::new("combiner");
        registry.register("sum", |_| Ok(Arc::new(Identity) as Arc<dyn Combiner>));
        registry.register("avg", |_| Ok(Arc::new(Identity) as Arc<dyn Combiner>));
        assert_eq!(registry.names(), ["avg", "sum"]);
    }

    #[derive(Debug, Deserialize)]
    struct Params {
        #[serde(default = "default_port")]
        port: u16,
    }

    fn default_port() -> u16 {
        8080
    }

    #[test]
    fn typed_params_treats_null_as_defaults() {
        let params: Params = typed_params(&PluginSpec::named("http")).unwrap();
        assert_eq!(params.port, 8080);

        let params: Params =
            typed_params(&PluginSpec::with_params("http", serde_json::json!({"port": 9000})))
                .unwrap();
        assert_eq!(params.port, 9000);
    }

    #[test]
    fn typed_params_reports_the_plugin_on_bad_input() {
        let spec = PluginSpec::with_params("http", serde_json::json!({"port": "not a number"}));
        let err = typed_params::<Params>(&spec).unwrap_err();
        assert!(matches!(
            err,
            PluginError::InvalidParams { ref plugin, .. } if plugin == "http"
        ));
    }
}
