//! Systematic uncertainties: a nominal estimation plus named variations.
//!
//! Deviations are measured bin by bin against the nominal values. A
//! symmetric variation contributes `|varied - nominal|`; an up/down pair is
//! symmetrized to `|up - down| / 2`. Totals are reported as an [`Estimation`]
//! carrying the nominal values and the combined deviation squared as
//! variance, so they flow through the same algebra as statistical errors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::estimation::{Count, Estimation, Histogram};
use crate::{Error, Result};

/// Rule for combining several variations into one band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combination {
    /// Sum of squared deviations.
    Quadrature,
    /// Largest deviation per bin.
    Envelope,
}

/// A single systematic variation of a nominal estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Variation {
    /// One varied estimation, interpreted symmetrically.
    Symmetric {
        /// Varied estimation.
        varied: Estimation,
    },
    /// Separate up and down variations.
    UpDown {
        /// +1 sigma estimation.
        up: Estimation,
        /// -1 sigma estimation.
        down: Estimation,
    },
}

impl Variation {
    /// Statistical variation: `content ± sqrt(|content|)` in every bin.
    pub fn statistical(nominal: &Estimation) -> Variation {
        let shift = |sign: f64| -> Estimation {
            match nominal {
                Estimation::Count(c) => Estimation::Count(Count {
                    value: c.value + sign * c.value.abs().sqrt(),
                    variance: c.variance,
                }),
                Estimation::Histogram(h) => {
                    let contents =
                        h.contents().iter().map(|c| c + sign * c.abs().sqrt()).collect();
                    Histogram::new(h.edges().to_vec(), contents, h.variances().to_vec())
                        .map(Estimation::Histogram)
                        .unwrap_or_else(|_| nominal.clone())
                }
            }
        };
        Variation::UpDown { up: shift(1.0), down: shift(-1.0) }
    }

    /// Normalization-only variation: `up_factor * nominal` and
    /// `down_factor * nominal`.
    pub fn from_overall(nominal: &Estimation, up_factor: f64, down_factor: f64) -> Variation {
        Variation::UpDown { up: nominal.scale(up_factor), down: nominal.scale(down_factor) }
    }

    /// Fail unless every varied estimation has the nominal's shape.
    pub fn ensure_compatible(&self, nominal: &Estimation) -> Result<()> {
        match self {
            Variation::Symmetric { varied } => nominal.ensure_same_shape(varied, "variation"),
            Variation::UpDown { up, down } => {
                nominal.ensure_same_shape(up, "up variation")?;
                nominal.ensure_same_shape(down, "down variation")
            }
        }
    }

    /// Symmetric per-bin deviation from `nominal`.
    ///
    /// An up/down pair becomes half the absolute difference between up and
    /// down; a single variation is its absolute distance to nominal.
    pub fn symmetrize(&self, nominal: &Estimation) -> Result<Vec<f64>> {
        self.ensure_compatible(nominal)?;
        Ok(match self {
            Variation::Symmetric { varied } => abs_diff(varied.values(), nominal.values()),
            Variation::UpDown { up, down } => abs_diff(up.values(), down.values())
                .into_iter()
                .map(|d| 0.5 * d)
                .collect(),
        })
    }

    /// Per-bin `(|up - nominal|, |down - nominal|)`.
    pub fn asymmetric_deviations(&self, nominal: &Estimation) -> Result<(Vec<f64>, Vec<f64>)> {
        self.ensure_compatible(nominal)?;
        Ok(match self {
            Variation::Symmetric { varied } => {
                let d = abs_diff(varied.values(), nominal.values());
                (d.clone(), d)
            }
            Variation::UpDown { up, down } => (
                abs_diff(up.values(), nominal.values()),
                abs_diff(down.values(), nominal.values()),
            ),
        })
    }
}

/// `sqrt(sum(x^2))`.
pub fn sum_quadrature(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn abs_diff(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).collect()
}

/// A nominal estimation with named systematic variations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uncertainty {
    nominal: Estimation,
    variations: BTreeMap<String, Variation>,
}

impl Uncertainty {
    /// An uncertainty with no variations yet.
    pub fn new(nominal: Estimation) -> Self {
        Self { nominal, variations: BTreeMap::new() }
    }

    /// Add (or replace) a named variation. Fails on shape mismatch.
    pub fn insert(&mut self, name: impl Into<String>, variation: Variation) -> Result<()> {
        variation.ensure_compatible(&self.nominal)?;
        self.variations.insert(name.into(), variation);
        Ok(())
    }

    /// Builder form of [`Uncertainty::insert`].
    pub fn with_variation(mut self, name: impl Into<String>, variation: Variation) -> Result<Self> {
        self.insert(name, variation)?;
        Ok(self)
    }

    /// The nominal estimation.
    pub fn nominal(&self) -> &Estimation {
        &self.nominal
    }

    /// All variations, ordered by name.
    pub fn variations(&self) -> &BTreeMap<String, Variation> {
        &self.variations
    }

    /// A single variation by name.
    pub fn variation(&self, name: &str) -> Option<&Variation> {
        self.variations.get(name)
    }

    /// A copy keeping only the named variations.
    pub fn restricted(&self, names: &[&str]) -> Result<Uncertainty> {
        let mut out = Uncertainty::new(self.nominal.clone());
        for name in names {
            let v = self
                .variations
                .get(*name)
                .ok_or_else(|| Error::Validation(format!("unknown variation '{name}'")))?;
            out.variations.insert((*name).to_string(), v.clone());
        }
        Ok(out)
    }

    /// Symmetric deviation of one named variation.
    pub fn symmetrize(&self, name: &str) -> Result<Vec<f64>> {
        self.variations
            .get(name)
            .ok_or_else(|| Error::Validation(format!("unknown variation '{name}'")))?
            .symmetrize(&self.nominal)
    }

    /// Total systematic: nominal values with variance `sum(deviation^2)`.
    pub fn combine_quadrature(&self) -> Result<Estimation> {
        self.combine(Combination::Quadrature)
    }

    /// Total systematic: nominal values with variance `max(deviation)^2`.
    pub fn envelope(&self) -> Result<Estimation> {
        self.combine(Combination::Envelope)
    }

    /// Combine all variations with the given rule.
    pub fn combine(&self, rule: Combination) -> Result<Estimation> {
        let n = self.nominal.n_bins();
        let mut total = vec![0.0f64; n];
        for variation in self.variations.values() {
            let dev = variation.symmetrize(&self.nominal)?;
            for (t, d) in total.iter_mut().zip(dev) {
                match rule {
                    Combination::Quadrature => *t += d * d,
                    Combination::Envelope => *t = t.max(d * d),
                }
            }
        }
        with_variances(&self.nominal, total)
    }

    /// Systematic total plus the nominal's own statistical variance.
    pub fn total(&self, rule: Combination) -> Result<Estimation> {
        let syst = self.combine(rule)?;
        let summed: Vec<f64> =
            syst.variances().iter().zip(self.nominal.variances()).map(|(s, n)| s + n).collect();
        with_variances(&self.nominal, summed)
    }

    /// Asymmetric band: per-bin quadrature sums of the up and down deviations.
    ///
    /// Bins whose nominal content is not positive get zero error.
    pub fn band(&self) -> Result<Band> {
        let n = self.nominal.n_bins();
        let mut up = vec![0.0f64; n];
        let mut down = vec![0.0f64; n];
        for variation in self.variations.values() {
            let (du, dd) = variation.asymmetric_deviations(&self.nominal)?;
            for i in 0..n {
                up[i] += du[i] * du[i];
                down[i] += dd[i] * dd[i];
            }
        }
        let nominal = self.nominal.values().to_vec();
        for i in 0..n {
            if nominal[i] > 0.0 {
                up[i] = up[i].sqrt();
                down[i] = down[i].sqrt();
            } else {
                up[i] = 0.0;
                down[i] = 0.0;
            }
        }
        Ok(Band { edges: self.nominal.edges().map(<[f64]>::to_vec), nominal, up, down })
    }
}

fn with_variances(nominal: &Estimation, variances: Vec<f64>) -> Result<Estimation> {
    match nominal {
        Estimation::Count(c) => Ok(Estimation::Count(Count { value: c.value, variance: variances[0] })),
        Estimation::Histogram(h) => {
            Ok(Histogram::new(h.edges().to_vec(), h.contents().to_vec(), variances)?.into())
        }
    }
}

/// An asymmetric error band around nominal values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Bin edges (`None` for a scalar band).
    pub edges: Option<Vec<f64>>,
    /// Central values.
    pub nominal: Vec<f64>,
    /// Upward error per bin.
    pub up: Vec<f64>,
    /// Downward error per bin.
    pub down: Vec<f64>,
}

/// Sentinel ratio errors used when a varied denominator is zero.
const RATIO_SENTINEL: f64 = 100.0;

impl Band {
    /// Check that `up`, `down` and `edges` agree with `nominal`.
    pub fn validate(&self) -> Result<()> {
        let n = self.nominal.len();
        if self.up.len() != n || self.down.len() != n {
            return Err(Error::ShapeMismatch(format!(
                "band with {n} bins has {} up and {} down errors",
                self.up.len(),
                self.down.len()
            )));
        }
        if let Some(edges) = &self.edges
            && edges.len() != n + 1
        {
            return Err(Error::ShapeMismatch(format!(
                "band with {n} bins has {} edges",
                edges.len()
            )));
        }
        Ok(())
    }

    /// Combine bands in quadrature.
    ///
    /// The central values come from `base` if given, otherwise from the
    /// first band.
    pub fn combine(bands: &[Band], base: Option<&Estimation>) -> Result<Band> {
        let first = bands
            .first()
            .ok_or_else(|| Error::Validation("list of bands must be non-empty".into()))?;
        let n = first.nominal.len();
        for b in bands {
            b.validate()?;
        }
        if let Some(b) = bands.iter().find(|b| b.nominal.len() != n || b.edges != first.edges) {
            return Err(Error::ShapeMismatch(format!(
                "band with {} bins vs {} bins",
                b.nominal.len(),
                n
            )));
        }
        let nominal = match base {
            Some(e) => {
                if e.n_bins() != n || e.edges() != first.edges.as_deref() {
                    return Err(Error::ShapeMismatch(format!(
                        "base with {} bins vs band with {} bins",
                        e.n_bins(),
                        n
                    )));
                }
                e.values().to_vec()
            }
            None => first.nominal.clone(),
        };
        Ok(Band {
            edges: first.edges.clone(),
            nominal,
            up: (0..n).map(|i| sum_quadrature(bands.iter().map(|b| b.up[i]))).collect(),
            down: (0..n).map(|i| sum_quadrature(bands.iter().map(|b| b.down[i]))).collect(),
        })
    }

    /// Express the band as a ratio band centered on 1.
    ///
    /// Assumes the numerator equals the denominator, which is the only band
    /// that stays defined for empty data bins. Negative varied denominators
    /// are clamped to 0.
    pub fn ratio(&self) -> Result<Band> {
        self.validate()?;
        let n = self.nominal.len();
        let mut up = Vec::with_capacity(n);
        let mut down = Vec::with_capacity(n);
        for i in 0..n {
            let d = self.nominal[i].max(0.0);
            let d_up = (self.nominal[i] + self.up[i]).max(0.0);
            let d_down = (self.nominal[i] - self.down[i]).max(0.0);
            let ratio_up = if d_up != 0.0 { d / d_up } else { -RATIO_SENTINEL };
            let ratio_down = if d_down != 0.0 { d / d_down } else { RATIO_SENTINEL };
            // Upward band follows the downward denominator shift and vice versa.
            up.push(1.0 - ratio_up);
            down.push(ratio_down - 1.0);
        }
        Ok(Band { edges: self.edges.clone(), nominal: vec![1.0; n], up, down })
    }
}
