//! # hc-data
//!
//! Event data access for hepcalc.
//!
//! A [`Process`] names a dataset (a set of file references), a [`Region`]
//! names a selection and a weight, and a [`Projection`] pairs the two to
//! produce the selected, weighted [`EventView`] that counts and histograms
//! are filled from.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hc_data::{CompiledEvaluator, JsonColumnLoader, Process, Projection, Region};
//!
//! let loader = JsonColumnLoader::new("data");
//! let evaluator = CompiledEvaluator::new();
//! let ttbar = Arc::new(Process::new("ttbar", ["ttbar_1.json", "ttbar_2.json"]));
//! let sr = Arc::new(Region::new("pt > 20 && njet >= 4", "weight_mc"));
//! let view = Projection::new(ttbar, sr).project(&loader, &evaluator).unwrap();
//! println!("{} selected events", view.len());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binning;
pub mod compose;
pub mod expr;
pub mod filler;
pub mod process;
pub mod projection;
pub mod region;
pub mod source;
pub mod table;

pub use binning::Binning;
pub use expr::{CompiledEvaluator, CompiledExpr, ExpressionEvaluator};
pub use filler::{FilledHistogram, FlowPolicy, NegativeWeightPolicy, VarianceConvention};
pub use process::{Normalization, Patch, Process, ProcessIdentity, Style};
pub use projection::{EventView, Projection};
pub use region::{Region, RegionIdentity, RegionVariation};
pub use source::{DataLoader, DataSource, JsonColumnLoader, MemoryLoader};
pub use table::Table;
