//! Weighted counting and histogram filling over selected events.

use serde::{Deserialize, Serialize};

use hc_core::{Count, Error, Histogram, Result};

/// Under/overflow handling policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPolicy {
    /// Drop entries outside the histogram range (record them in `underflow/overflow`).
    #[default]
    Drop,
    /// Fold underflow into the first bin and overflow into the last bin.
    Fold,
}

/// Negative weight handling policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeWeightPolicy {
    /// Keep negative weights as-is.
    #[default]
    Allow,
    /// Clamp negative weights to 0.
    ClampToZero,
    /// Error on the first negative weight encountered.
    Error,
}

/// How the variance of a weighted sum is estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceConvention {
    /// Sum of squared weights, `Σ w²`.
    #[default]
    SumW2,
    /// Poisson approximation on the weighted sum, `|Σ w|`.
    Poisson,
}

impl VarianceConvention {
    fn finish(self, sumw: f64, sumw2: f64) -> f64 {
        match self {
            VarianceConvention::SumW2 => sumw2,
            VarianceConvention::Poisson => sumw.abs(),
        }
    }
}

/// Result of filling a histogram.
#[derive(Debug, Clone)]
pub struct FilledHistogram {
    /// Filled histogram (contents and variances per the convention used).
    pub histogram: Histogram,
    /// Underflow sum of weights (before optional folding).
    pub underflow: f64,
    /// Overflow sum of weights (before optional folding).
    pub overflow: f64,
    /// Count of entries with negative weights (after applying policy).
    pub negative_weight_entries: u64,
    /// Entries that landed in a bin.
    pub entries: u64,
}

fn apply_negative(policy: NegativeWeightPolicy, entry: usize, w: f64) -> Result<(f64, bool)> {
    if w >= 0.0 {
        return Ok((w, false));
    }
    match policy {
        NegativeWeightPolicy::Allow => Ok((w, true)),
        NegativeWeightPolicy::ClampToZero => Ok((0.0, true)),
        NegativeWeightPolicy::Error => {
            Err(Error::Validation(format!("negative weight (entry={entry}, weight={w})")))
        }
    }
}

/// Weighted count of all entries.
pub fn count(
    weights: &[f64],
    variance: VarianceConvention,
    negative: NegativeWeightPolicy,
) -> Result<Count> {
    let (mut sumw, mut sumw2) = (0.0, 0.0);
    for (entry, &w) in weights.iter().enumerate() {
        let (w, _) = apply_negative(negative, entry, w)?;
        sumw += w;
        sumw2 += w * w;
    }
    Count::new(sumw, variance.finish(sumw, sumw2))
}

/// Fill one histogram from per-entry values and weights.
///
/// NaN values are skipped.
pub fn fill_histogram(
    values: &[f64],
    weights: &[f64],
    edges: &[f64],
    flow: FlowPolicy,
    negative: NegativeWeightPolicy,
    variance: VarianceConvention,
) -> Result<FilledHistogram> {
    if values.len() != weights.len() {
        return Err(Error::Validation(format!(
            "{} values but {} weights",
            values.len(),
            weights.len()
        )));
    }
    if edges.len() < 2 {
        return Err(Error::Validation(format!("invalid bin_edges (len(edges)={})", edges.len())));
    }
    let n_bins = edges.len() - 1;
    let mut sumw = vec![0.0; n_bins];
    let mut sumw2 = vec![0.0; n_bins];
    let (mut underflow, mut overflow) = (0.0, 0.0);
    let (mut entries, mut negative_weight_entries) = (0u64, 0u64);

    for (entry, (&val, &w)) in values.iter().zip(weights).enumerate() {
        if val.is_nan() {
            continue;
        }
        let (w, was_negative) = apply_negative(negative, entry, w)?;
        negative_weight_entries += u64::from(was_negative);

        let bin = if val < edges[0] {
            underflow += w;
            (flow == FlowPolicy::Fold).then_some(0)
        } else if val >= edges[n_bins] {
            overflow += w;
            (flow == FlowPolicy::Fold).then_some(n_bins - 1)
        } else {
            find_bin(edges, val)
        };
        if let Some(b) = bin {
            sumw[b] += w;
            sumw2[b] += w * w;
            entries += 1;
        }
    }

    let variances = sumw.iter().zip(&sumw2).map(|(s, s2)| variance.finish(*s, *s2)).collect();
    Ok(FilledHistogram {
        histogram: Histogram::new(edges.to_vec(), sumw, variances)?,
        underflow,
        overflow,
        negative_weight_entries,
        entries,
    })
}

/// Bin index for an in-range value given sorted edges; `None` outside.
fn find_bin(edges: &[f64], val: f64) -> Option<usize> {
    if val < edges[0] || val >= edges[edges.len() - 1] {
        return None;
    }
    // First edge strictly greater than val, minus one.
    Some(edges.partition_point(|e| *e <= val) - 1)
}
