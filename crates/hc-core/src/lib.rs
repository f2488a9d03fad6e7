//! # hc-core
//!
//! Core value types for hepcalc.
//!
//! This crate contains no I/O and no scheduling. It defines:
//!
//! - [`Error`] - the error taxonomy shared by every hepcalc crate
//! - [`Estimation`] - a count or histogram with per-bin variance, plus the
//!   algebra used to compose them (sum, difference, scale, ratio)
//! - [`Uncertainty`] - a nominal estimation with named systematic variations
//!   and the combination rules (symmetrize, quadrature, envelope, bands)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod estimation;
pub mod uncertainty;

pub use error::{Error, Result, panic_message};
pub use estimation::{Count, Estimation, Histogram, to_overall};
pub use uncertainty::{Band, Combination, Uncertainty, Variation, sum_quadrature};
