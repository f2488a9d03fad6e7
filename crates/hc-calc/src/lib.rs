//! # hc-calc
//!
//! Calculation layer for hepcalc.
//!
//! A [`Calculation`] (count or histogram) applied to a
//! [`Projection`](hc_data::Projection) is a [`Task`], addressed by a
//! deterministic [`Fingerprint`]. The [`Dispatcher`] resolves batches of
//! tasks: duplicates collapse to one execution, cached results are reused,
//! and the rest run in parallel with one data load per process. A [`Graph`]
//! composes task results into derived estimations and uncertainties; the
//! [`Engine`] ties everything together.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hc_calc::{Calculation, Engine, Graph, MemoryCache};
//! use hc_data::{JsonColumnLoader, Process, Projection, Region};
//!
//! let engine = Engine::builder()
//!     .loader(Arc::new(JsonColumnLoader::new("data")))
//!     .cache(Arc::new(MemoryCache::new()))
//!     .build()
//!     .unwrap();
//!
//! let ttbar = Arc::new(Process::new("ttbar", ["ttbar.json"]));
//! let cr = Arc::new(Region::new("njet == 2", "weight"));
//! let mut graph = Graph::new();
//! let count = graph.calculation(Calculation::count(), Projection::new(ttbar, cr)).unwrap();
//! let estimate = graph.scale(count, 0.37);
//! let value = engine.evaluate_one(&graph, estimate).unwrap();
//! println!("{:?}", value);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod artifact;
pub mod cache;
pub mod calculation;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod fingerprint;
pub mod graph;

pub use artifact::PlotArtifact;
pub use cache::{Cache, CacheStats, FileSystemCache, MemoryCache};
pub use calculation::{Calculation, Task};
pub use config::{CacheConfig, EngineConfig};
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineBuilder, EngineStats};
pub use fingerprint::Fingerprint;
pub use graph::{Graph, Handle, Value, VariationNode};
