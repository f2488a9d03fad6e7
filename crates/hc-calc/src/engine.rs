//! The engine facade: a dispatcher over a cache, a loader and an evaluator.
//!
//! Most callers build one [`Engine`] at startup (from code or from an
//! [`EngineConfig`]) and share it. A process-wide instance can be installed
//! once with [`install_global`]; it is never reset implicitly, only its
//! cache can be cleared.

use std::sync::{Arc, OnceLock};

use serde::Serialize;

use hc_core::{Error, Estimation, Result};
use hc_data::{CompiledEvaluator, DataLoader, ExpressionEvaluator, JsonColumnLoader, Projection};

use crate::cache::{Cache, CacheStats, FileSystemCache, MemoryCache};
use crate::calculation::{Calculation, Task};
use crate::config::{CacheConfig, EngineConfig};
use crate::dispatcher::Dispatcher;
use crate::fingerprint::Fingerprint;
use crate::graph::{Graph, Handle, Value};

/// Observable engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngineStats {
    /// Cache counters.
    pub cache: CacheStats,
    /// Calculations actually executed by this engine.
    pub executions: u64,
    /// Entries currently held by the cache.
    pub entries: usize,
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    cache: Option<Arc<dyn Cache>>,
    loader: Option<Arc<dyn DataLoader>>,
    evaluator: Option<Arc<dyn ExpressionEvaluator>>,
    threads: usize,
}

impl EngineBuilder {
    /// Result cache (default: a fresh [`MemoryCache`]).
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Data loader. Required.
    pub fn loader(mut self, loader: Arc<dyn DataLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Expression evaluator (default: [`CompiledEvaluator`]).
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Worker threads (0 = one per core).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let loader = self
            .loader
            .ok_or_else(|| Error::Config("engine requires a data loader".to_string()))?;
        let cache = self.cache.unwrap_or_else(|| Arc::new(MemoryCache::new()));
        let evaluator = self.evaluator.unwrap_or_else(|| Arc::new(CompiledEvaluator::new()));
        let dispatcher = Dispatcher::new(cache, loader, evaluator, self.threads)?;
        tracing::debug!(threads = dispatcher.threads(), "engine ready");
        Ok(Engine { dispatcher })
    }
}

/// Entry point for evaluating calculations and graphs.
#[derive(Debug)]
pub struct Engine {
    dispatcher: Dispatcher,
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Build from configuration: JSON column files under `data_dir`, the
    /// configured cache, the default evaluator.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let cache: Arc<dyn Cache> = match &config.cache {
            CacheConfig::Memory => Arc::new(MemoryCache::new()),
            CacheConfig::Filesystem { path } => Arc::new(FileSystemCache::open(path)?),
        };
        Engine::builder()
            .loader(Arc::new(JsonColumnLoader::new(&config.data_dir)))
            .cache(cache)
            .threads(config.threads)
            .build()
    }

    /// The underlying dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Fingerprint of `calculation` on `projection`, without evaluating.
    pub fn fingerprint(&self, calculation: &Calculation, projection: &Projection) -> Result<Fingerprint> {
        Fingerprint::of(calculation, projection)
    }

    /// Evaluate a single calculation (cached).
    pub fn evaluate(&self, calculation: Calculation, projection: Projection) -> Result<Estimation> {
        let task = Task::new(calculation, projection)?;
        self.dispatcher
            .resolve(std::slice::from_ref(&task))
            .pop()
            .unwrap_or_else(|| Err(Error::Validation("dispatcher returned no result".to_string())))
    }

    /// Evaluate `targets` of a graph in one batch.
    pub fn evaluate_graph(&self, graph: &Graph, targets: &[Handle]) -> Vec<Result<Value>> {
        graph.evaluate(&self.dispatcher, targets)
    }

    /// Evaluate one node of a graph.
    pub fn evaluate_one(&self, graph: &Graph, target: Handle) -> Result<Value> {
        graph
            .evaluate(&self.dispatcher, &[target])
            .pop()
            .unwrap_or_else(|| Err(Error::Validation("graph returned no result".to_string())))
    }

    /// Drop one cached result (and any recorded failure).
    pub fn clear(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.dispatcher.clear(fingerprint)
    }

    /// Drop every cached result and recorded failure.
    pub fn clear_all(&self) -> Result<()> {
        self.dispatcher.clear_all()
    }

    /// Current counters.
    pub fn stats(&self) -> Result<EngineStats> {
        let cache = self.dispatcher.cache();
        Ok(EngineStats {
            cache: cache.stats(),
            executions: self.dispatcher.executions(),
            entries: cache.entries()?,
        })
    }
}

static GLOBAL: OnceLock<Arc<Engine>> = OnceLock::new();

/// Install the process-wide engine. Fails if one is already installed.
pub fn install_global(engine: Engine) -> Result<Arc<Engine>> {
    let engine = Arc::new(engine);
    GLOBAL
        .set(engine.clone())
        .map_err(|_| Error::Config("a global engine is already installed".to_string()))?;
    tracing::info!("global engine installed");
    Ok(engine)
}

/// The process-wide engine, if installed.
pub fn global() -> Option<Arc<Engine>> {
    GLOBAL.get().cloned()
}
