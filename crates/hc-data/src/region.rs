//! Regions: an event selection plus a weighting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::binning::Binning;
use crate::compose::{anded, multiplied};

/// A modification of a region's selection or weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionVariation {
    /// Multiply `weight` into the region weight.
    Reweighted {
        /// Extra weight expression.
        weight: String,
    },
    /// AND `selection` into the region selection.
    Reselected {
        /// Extra selection expression.
        selection: String,
    },
    /// Replace selection and weight outright.
    Replaced {
        /// New selection.
        selection: String,
        /// New weight.
        weight: String,
    },
}

/// An event selection and weight with display metadata.
///
/// An empty selection keeps all events; an empty weight is unit weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// Selection expression.
    #[serde(default)]
    pub selection: String,
    /// Weight expression.
    #[serde(default)]
    pub weight: String,
    /// Display label.
    #[serde(default)]
    pub label: Option<String>,
    /// Free-form display metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Whether the weight is applied.
    #[serde(default = "default_weighted")]
    pub weighted: bool,
    /// Variations, applied in order.
    #[serde(default)]
    pub variations: Vec<RegionVariation>,
    /// Default binning for histograms in this region. Not part of identity.
    #[serde(default)]
    pub binning: Option<Binning>,
}

fn default_weighted() -> bool {
    true
}

/// The identity-relevant part of a [`Region`]: its effective selection and
/// weight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RegionIdentity {
    /// Effective selection.
    pub selection: String,
    /// Effective weight (empty when unweighted).
    pub weight: String,
}

impl Region {
    /// A weighted region.
    pub fn new(selection: impl Into<String>, weight: impl Into<String>) -> Self {
        Self {
            selection: selection.into(),
            weight: weight.into(),
            label: None,
            metadata: BTreeMap::new(),
            weighted: true,
            variations: Vec::new(),
            binning: None,
        }
    }

    /// Set the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the default binning.
    pub fn with_binning(mut self, binning: Binning) -> Self {
        self.binning = Some(binning);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Copy with a variation appended.
    pub fn varied(&self, variation: RegionVariation) -> Self {
        let mut r = self.clone();
        r.variations.push(variation);
        r
    }

    /// Copy with weighting switched on or off.
    pub fn weighted(&self, weighted: bool) -> Self {
        Self { weighted, ..self.clone() }
    }

    /// Effective `(selection, weight)` after variations and weighting.
    pub fn selection_weight(&self) -> (String, String) {
        let (mut selection, mut weight) = (self.selection.clone(), self.weight.clone());
        for v in &self.variations {
            match v {
                RegionVariation::Reweighted { weight: w } => {
                    weight = multiplied([weight.as_str(), w.as_str()]);
                }
                RegionVariation::Reselected { selection: s } => {
                    selection = anded([selection.as_str(), s.as_str()]);
                }
                RegionVariation::Replaced { selection: s, weight: w } => {
                    selection = s.clone();
                    weight = w.clone();
                }
            }
        }
        if !self.weighted {
            weight.clear();
        }
        (selection, weight)
    }

    /// Canonical identity.
    pub fn identity(&self) -> RegionIdentity {
        let (selection, weight) = self.selection_weight();
        RegionIdentity { selection, weight }
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Region {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variations_compose() {
        let sr = Region::new("njet >= 4", "w_mc");
        let up = sr.varied(RegionVariation::Reweighted { weight: "w_btag_up".into() });
        assert_eq!(up.selection_weight(), ("njet >= 4".into(), "(w_mc) * (w_btag_up)".into()));

        let tight = sr.varied(RegionVariation::Reselected { selection: "met > 50".into() });
        assert_eq!(tight.selection_weight().0, "(njet >= 4) && (met > 50)");

        let cr = tight.varied(RegionVariation::Replaced {
            selection: "njet == 2".into(),
            weight: String::new(),
        });
        assert_eq!(cr.selection_weight(), ("njet == 2".into(), String::new()));
    }

    #[test]
    fn unweighted_drops_weight() {
        let r = Region::new("pt > 20", "w").weighted(false);
        assert_eq!(r.identity().weight, "");
        assert_ne!(r, Region::new("pt > 20", "w"));
        assert_eq!(r, Region::new("pt > 20", ""));
    }

    #[test]
    fn display_metadata_does_not_affect_identity() {
        let a = Region::new("x > 1", "").with_label("Signal region").with_metadata("tag", "sr");
        let b = Region::new("x > 1", "").with_binning(Binning::uniform(0.0, 1.0, 2));
        assert_eq!(a, b);
    }
}
