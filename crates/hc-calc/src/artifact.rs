//! Plot artifacts (numbers-first) for external renderers.
//!
//! An artifact carries resolved numbers plus the display metadata of the
//! process and region they were computed from. Rendering is someone else's
//! job.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use hc_core::{Band, Estimation, Result};
use hc_data::{Process, Region, Style};

use crate::graph::Value;

/// Schema tag of [`PlotArtifact`].
pub const PLOT_SCHEMA: &str = "hepcalc_plot_v1";

/// One resolved result ready for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct PlotArtifact {
    /// Always [`PLOT_SCHEMA`].
    pub schema_version: String,
    /// Creation time.
    pub created_unix_ms: u128,
    /// Process display metadata.
    pub process: PlotProcess,
    /// Region display metadata.
    pub region: PlotRegion,
    /// `"count"` or `"histogram"`.
    pub shape: String,
    /// Bin edges (histograms only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<f64>>,
    /// Central values.
    pub contents: Vec<f64>,
    /// Statistical errors, `sqrt(variance)` per bin.
    pub errors: Vec<f64>,
    /// Systematic band, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band: Option<Band>,
}

/// Process part of a [`PlotArtifact`].
#[derive(Debug, Clone, Serialize)]
pub struct PlotProcess {
    /// Process name.
    pub name: String,
    /// Legend label (the name when unset).
    pub label: String,
    /// Colors and markers.
    pub style: Style,
}

/// Region part of a [`PlotArtifact`].
#[derive(Debug, Clone, Serialize)]
pub struct PlotRegion {
    /// Display label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Free-form metadata.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl PlotArtifact {
    /// Artifact for a plain estimation (no band).
    pub fn from_estimation(estimation: &Estimation, process: &Process, region: &Region) -> Self {
        let created_unix_ms =
            SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
        Self {
            schema_version: PLOT_SCHEMA.to_string(),
            created_unix_ms,
            process: PlotProcess {
                name: process.name.clone(),
                label: process.label().to_string(),
                style: process.style.clone(),
            },
            region: PlotRegion { label: region.label.clone(), metadata: region.metadata.clone() },
            shape: estimation.shape_name().to_string(),
            edges: estimation.edges().map(<[f64]>::to_vec),
            contents: estimation.values().to_vec(),
            errors: estimation.variances().iter().map(|v| v.max(0.0).sqrt()).collect(),
            band: None,
        }
    }

    /// From a graph value; an uncertainty contributes its asymmetric band
    /// around the nominal.
    pub fn from_value(value: &Value, process: &Process, region: &Region) -> Result<Self> {
        let artifact = Self::from_estimation(value.nominal(), process, region);
        match value {
            Value::Estimation(_) => Ok(artifact),
            Value::Uncertainty(u) => Ok(artifact.with_band(u.band()?)),
        }
    }

    /// Attach a band.
    pub fn with_band(mut self, band: Band) -> Self {
        self.band = Some(band);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hc_core::{Histogram, Uncertainty, Variation};

    fn hist() -> Estimation {
        Histogram::new(vec![0.0, 1.0, 2.0], vec![4.0, 9.0], vec![4.0, 9.0]).unwrap().into()
    }

    #[test]
    fn numbers_and_metadata() {
        let process = Process::new("ttbar", ["t.json"]).with_label("t#bar{t}");
        let region = Region::new("njet >= 4", "w").with_label("SR").with_metadata("channel", "ee");
        let a = PlotArtifact::from_estimation(&hist(), &process, &region);
        assert_eq!(a.contents, vec![4.0, 9.0]);
        assert_eq!(a.errors, vec![2.0, 3.0]);
        assert_eq!(a.edges.as_deref(), Some(&[0.0, 1.0, 2.0][..]));

        let json = serde_json::to_value(&a).unwrap();
        assert_eq!(json["schema_version"], PLOT_SCHEMA);
        assert_eq!(json["process"]["label"], "t#bar{t}");
        assert_eq!(json["region"]["metadata"]["channel"], "ee");
        assert!(json.get("band").is_none());
    }

    #[test]
    fn uncertainty_carries_band() {
        let nominal = hist();
        let u = Uncertainty::new(nominal.clone())
            .with_variation("stat", Variation::statistical(&nominal))
            .unwrap();
        let a = PlotArtifact::from_value(
            &Value::Uncertainty(u),
            &Process::new("p", ["f"]),
            &Region::new("", ""),
        )
        .unwrap();
        let band = a.band.unwrap();
        assert_eq!(band.up, vec![2.0, 3.0]);
        assert_eq!(band.down, vec![2.0, 3.0]);
    }
}
