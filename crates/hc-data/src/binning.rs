//! Histogram binning specifications.

use serde::{Deserialize, Serialize};

use hc_core::{Error, Result};

/// Either uniform bins over a range or explicit edges.
///
/// In YAML/JSON: `{low: 0, high: 100, bins: 10}` or `[0, 10, 50, 100]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binning {
    /// `bins` equal-width bins on `[low, high)`.
    Uniform {
        /// Lower edge.
        low: f64,
        /// Upper edge.
        high: f64,
        /// Number of bins.
        bins: usize,
    },
    /// Explicit, strictly increasing bin edges.
    Edges(Vec<f64>),
}

impl Binning {
    /// Uniform binning.
    pub fn uniform(low: f64, high: f64, bins: usize) -> Self {
        Binning::Uniform { low, high, bins }
    }

    /// Bin edges, validated: at least two finite, strictly increasing values.
    pub fn edges(&self) -> Result<Vec<f64>> {
        let edges = match self {
            Binning::Uniform { low, high, bins } => {
                if *bins == 0 {
                    return Err(Error::Validation("uniform binning needs at least one bin".into()));
                }
                let width = (high - low) / *bins as f64;
                let mut e: Vec<f64> = (0..*bins).map(|i| low + i as f64 * width).collect();
                // Exact upper edge, no accumulated rounding.
                e.push(*high);
                e
            }
            Binning::Edges(e) => e.clone(),
        };
        if edges.len() < 2 {
            return Err(Error::Validation(format!(
                "binning needs at least 2 edges, got {}",
                edges.len()
            )));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::Validation(format!(
                "bin edges must be finite and strictly increasing: {edges:?}"
            )));
        }
        Ok(edges)
    }

    /// Number of bins, if the binning is valid.
    pub fn n_bins(&self) -> Result<usize> {
        Ok(self.edges()?.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn uniform_edges() {
        let e = Binning::uniform(0.0, 1.0, 4).edges().unwrap();
        assert_eq!(e.len(), 5);
        assert_relative_eq!(e[1], 0.25);
        assert_eq!(e[4], 1.0);
    }

    #[test]
    fn invalid_binnings() {
        assert!(Binning::uniform(0.0, 1.0, 0).edges().is_err());
        assert!(Binning::uniform(1.0, 0.0, 2).edges().is_err());
        assert!(Binning::Edges(vec![0.0]).edges().is_err());
        assert!(Binning::Edges(vec![0.0, 1.0, 1.0]).edges().is_err());
        assert!(Binning::Edges(vec![0.0, f64::NAN]).edges().is_err());
    }

    #[test]
    fn deserializes_both_forms() {
        let u: Binning = serde_json::from_str(r#"{"low": 0, "high": 10, "bins": 5}"#).unwrap();
        assert_eq!(u, Binning::uniform(0.0, 10.0, 5));
        let e: Binning = serde_json::from_str("[0, 1, 5]").unwrap();
        assert_eq!(e.n_bins().unwrap(), 2);
    }
}
