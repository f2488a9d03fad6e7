//! Counts and histograms with variance, and the algebra that composes them.
//!
//! Every operation assumes independent errors: variances always accumulate,
//! including under subtraction (`a - a` has value 0 and variance `2 * a.var`).
//! Binary histogram operations require identical bin edges and apply the
//! scalar rule to each bin independently.

use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A scalar count with its variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Count {
    /// Central value (sum of weights).
    pub value: f64,
    /// Variance of `value` (non-negative).
    pub variance: f64,
}

impl Count {
    /// Create a count. Fails if the variance is negative or not finite.
    pub fn new(value: f64, variance: f64) -> Result<Self> {
        let c = Self { value, variance };
        c.validate()?;
        Ok(c)
    }

    /// A count with zero variance.
    pub fn exact(value: f64) -> Self {
        Self { value, variance: 0.0 }
    }

    /// Standard deviation (`sqrt(variance)`).
    pub fn error(&self) -> f64 {
        self.variance.sqrt()
    }

    /// `k * self`, with variance `k^2 * var`.
    pub fn scale(self, k: f64) -> Self {
        Self { value: k * self.value, variance: k * k * self.variance }
    }

    /// First-order error propagation for `self / denominator`.
    pub fn ratio(self, denominator: Count) -> Result<Self> {
        let b = denominator.value;
        if b == 0.0 {
            return Err(Error::DivisionByZero(format!(
                "ratio {} / {} has a zero denominator",
                self.value, b
            )));
        }
        let a = self.value;
        let b2 = b * b;
        Ok(Self {
            value: a / b,
            variance: self.variance / b2 + denominator.variance * a * a / (b2 * b2),
        })
    }

    fn validate(&self) -> Result<()> {
        if !self.value.is_finite() {
            return Err(Error::Validation(format!("count value is not finite: {}", self.value)));
        }
        if !(self.variance.is_finite() && self.variance >= 0.0) {
            return Err(Error::Validation(format!(
                "count variance must be finite and non-negative, got {}",
                self.variance
            )));
        }
        Ok(())
    }
}

impl Add for Count {
    type Output = Count;

    fn add(self, rhs: Count) -> Count {
        Count { value: self.value + rhs.value, variance: self.variance + rhs.variance }
    }
}

impl Neg for Count {
    type Output = Count;

    fn neg(self) -> Count {
        self.scale(-1.0)
    }
}

impl Sub for Count {
    type Output = Count;

    fn sub(self, rhs: Count) -> Count {
        self + (-rhs)
    }
}

impl Mul<f64> for Count {
    type Output = Count;

    fn mul(self, k: f64) -> Count {
        self.scale(k)
    }
}

/// Serialized form of [`Histogram`]; decoding goes through validation.
#[derive(Serialize, Deserialize)]
struct HistogramRepr {
    edges: Vec<f64>,
    contents: Vec<f64>,
    variances: Vec<f64>,
}

/// A 1D binned estimation.
///
/// Invariant: `contents.len() == variances.len() == edges.len() - 1`, edges
/// strictly increasing, variances non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "HistogramRepr", into = "HistogramRepr")]
pub struct Histogram {
    edges: Vec<f64>,
    contents: Vec<f64>,
    variances: Vec<f64>,
}

impl TryFrom<HistogramRepr> for Histogram {
    type Error = Error;

    fn try_from(r: HistogramRepr) -> Result<Self> {
        Histogram::new(r.edges, r.contents, r.variances)
    }
}

impl From<Histogram> for HistogramRepr {
    fn from(h: Histogram) -> Self {
        HistogramRepr { edges: h.edges, contents: h.contents, variances: h.variances }
    }
}

impl Histogram {
    /// Create a histogram, validating the shape invariants.
    pub fn new(edges: Vec<f64>, contents: Vec<f64>, variances: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        let n_bins = edges.len() - 1;
        if contents.len() != n_bins || variances.len() != n_bins {
            return Err(Error::Validation(format!(
                "histogram with {} edges needs {} bins (contents={}, variances={})",
                edges.len(),
                n_bins,
                contents.len(),
                variances.len()
            )));
        }
        if let Some((i, v)) =
            variances.iter().enumerate().find(|(_, v)| !(v.is_finite() && **v >= 0.0))
        {
            return Err(Error::Validation(format!(
                "bin {i} variance must be finite and non-negative, got {v}"
            )));
        }
        Ok(Self { edges, contents, variances })
    }

    /// An empty histogram with the given edges.
    pub fn zeros(edges: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        let n = edges.len() - 1;
        Ok(Self { edges, contents: vec![0.0; n], variances: vec![0.0; n] })
    }

    /// Bin edges (length = `n_bins() + 1`).
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bin contents.
    pub fn contents(&self) -> &[f64] {
        &self.contents
    }

    /// Bin variances.
    pub fn variances(&self) -> &[f64] {
        &self.variances
    }

    /// Per-bin standard deviation.
    pub fn errors(&self) -> Vec<f64> {
        self.variances.iter().map(|v| v.sqrt()).collect()
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.contents.len()
    }

    /// Bin `i` as a count.
    pub fn bin(&self, i: usize) -> Option<Count> {
        Some(Count { value: *self.contents.get(i)?, variance: self.variances[i] })
    }

    /// Sum over all bins.
    pub fn integral(&self) -> Count {
        Count {
            value: self.contents.iter().sum(),
            variance: self.variances.iter().sum(),
        }
    }

    /// Whether `other` has exactly the same bin edges.
    pub fn same_binning(&self, other: &Histogram) -> bool {
        self.edges == other.edges
    }

    /// Scale every bin by `k`.
    pub fn scale(&self, k: f64) -> Histogram {
        Histogram {
            edges: self.edges.clone(),
            contents: self.contents.iter().map(|c| k * c).collect(),
            variances: self.variances.iter().map(|v| k * k * v).collect(),
        }
    }

    /// Apply a scalar rule bin-by-bin. Fails on binning mismatch.
    fn binwise(
        &self,
        other: &Histogram,
        op: &str,
        f: impl Fn(usize, Count, Count) -> Result<Count>,
    ) -> Result<Histogram> {
        if !self.same_binning(other) {
            return Err(Error::ShapeMismatch(format!(
                "{op}: bin edges differ ({} bins over [{}, {}] vs {} bins over [{}, {}])",
                self.n_bins(),
                self.edges[0],
                self.edges[self.n_bins()],
                other.n_bins(),
                other.edges[0],
                other.edges[other.n_bins()]
            )));
        }
        let n = self.n_bins();
        let mut contents = Vec::with_capacity(n);
        let mut variances = Vec::with_capacity(n);
        for i in 0..n {
            let a = Count { value: self.contents[i], variance: self.variances[i] };
            let b = Count { value: other.contents[i], variance: other.variances[i] };
            let c = f(i, a, b)?;
            contents.push(c.value);
            variances.push(c.variance);
        }
        Ok(Histogram { edges: self.edges.clone(), contents, variances })
    }
}

fn validate_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::Validation(format!(
            "a histogram needs at least 2 bin edges, got {}",
            edges.len()
        )));
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(Error::Validation("bin edges must be finite".into()));
    }
    if edges.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Validation("bin edges must be strictly increasing".into()));
    }
    Ok(())
}

/// The result of a calculation: a scalar count or a histogram.
///
/// Serialized with a `"shape"` tag so a persisted value can be checked
/// against its declared shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Estimation {
    /// Scalar count.
    Count(Count),
    /// Binned histogram.
    Histogram(Histogram),
}

impl From<Count> for Estimation {
    fn from(c: Count) -> Self {
        Estimation::Count(c)
    }
}

impl From<Histogram> for Estimation {
    fn from(h: Histogram) -> Self {
        Estimation::Histogram(h)
    }
}

impl Estimation {
    /// Shape name (`"count"` or `"histogram"`).
    pub fn shape_name(&self) -> &'static str {
        match self {
            Estimation::Count(_) => "count",
            Estimation::Histogram(_) => "histogram",
        }
    }

    /// Number of bins (1 for a count).
    pub fn n_bins(&self) -> usize {
        match self {
            Estimation::Count(_) => 1,
            Estimation::Histogram(h) => h.n_bins(),
        }
    }

    /// Central values, one per bin.
    pub fn values(&self) -> &[f64] {
        match self {
            Estimation::Count(c) => std::slice::from_ref(&c.value),
            Estimation::Histogram(h) => h.contents(),
        }
    }

    /// Variances, one per bin.
    pub fn variances(&self) -> &[f64] {
        match self {
            Estimation::Count(c) => std::slice::from_ref(&c.variance),
            Estimation::Histogram(h) => h.variances(),
        }
    }

    /// Bin edges, if this is a histogram.
    pub fn edges(&self) -> Option<&[f64]> {
        match self {
            Estimation::Count(_) => None,
            Estimation::Histogram(h) => Some(h.edges()),
        }
    }

    /// The count, if this is a scalar.
    pub fn as_count(&self) -> Option<Count> {
        match self {
            Estimation::Count(c) => Some(*c),
            Estimation::Histogram(_) => None,
        }
    }

    /// The histogram, if this is binned.
    pub fn as_histogram(&self) -> Option<&Histogram> {
        match self {
            Estimation::Count(_) => None,
            Estimation::Histogram(h) => Some(h),
        }
    }

    /// Total over all bins (the count itself for scalars).
    pub fn integral(&self) -> Count {
        match self {
            Estimation::Count(c) => *c,
            Estimation::Histogram(h) => h.integral(),
        }
    }

    /// Whether both estimations have the same shape (kind and bin edges).
    pub fn same_shape(&self, other: &Estimation) -> bool {
        match (self, other) {
            (Estimation::Count(_), Estimation::Count(_)) => true,
            (Estimation::Histogram(a), Estimation::Histogram(b)) => a.same_binning(b),
            _ => false,
        }
    }

    /// Fail with [`Error::ShapeMismatch`] unless `other` has the same shape.
    pub fn ensure_same_shape(&self, other: &Estimation, context: &str) -> Result<()> {
        if self.same_shape(other) {
            return Ok(());
        }
        Err(Error::ShapeMismatch(format!(
            "{context}: {} with {} bins vs {} with {} bins",
            self.shape_name(),
            self.n_bins(),
            other.shape_name(),
            other.n_bins()
        )))
    }

    /// Check the shape invariants (used after decoding untrusted data).
    pub fn validate(&self) -> Result<()> {
        match self {
            Estimation::Count(c) => c.validate(),
            Estimation::Histogram(h) => {
                Histogram::new(h.edges.clone(), h.contents.clone(), h.variances.clone())
                    .map(|_| ())
            }
        }
    }

    /// `self + other`.
    pub fn add(&self, other: &Estimation) -> Result<Estimation> {
        self.combine(other, "add", |_, a, b| Ok(a + b))
    }

    /// `self - other`; variances add.
    pub fn sub(&self, other: &Estimation) -> Result<Estimation> {
        self.add(&other.scale(-1.0))
    }

    /// `k * self`.
    pub fn scale(&self, k: f64) -> Estimation {
        match self {
            Estimation::Count(c) => Estimation::Count(c.scale(k)),
            Estimation::Histogram(h) => Estimation::Histogram(h.scale(k)),
        }
    }

    /// `self / other` with first-order error propagation, bin by bin.
    pub fn ratio(&self, other: &Estimation) -> Result<Estimation> {
        self.combine(other, "ratio", |i, a, b| {
            a.ratio(b).map_err(|e| match (i, e) {
                (Some(bin), Error::DivisionByZero(msg)) => {
                    Error::DivisionByZero(format!("bin {bin}: {msg}"))
                }
                (_, e) => e,
            })
        })
    }

    /// Sum of a non-empty sequence of estimations of the same shape.
    pub fn sum<'a>(items: impl IntoIterator<Item = &'a Estimation>) -> Result<Estimation> {
        let mut iter = items.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| Error::Validation("cannot sum an empty set of estimations".into()))?;
        iter.try_fold(first.clone(), |acc, e| acc.add(e))
    }

    fn combine(
        &self,
        other: &Estimation,
        op: &str,
        f: impl Fn(Option<usize>, Count, Count) -> Result<Count>,
    ) -> Result<Estimation> {
        match (self, other) {
            (Estimation::Count(a), Estimation::Count(b)) => Ok(Estimation::Count(f(None, *a, *b)?)),
            (Estimation::Histogram(a), Estimation::Histogram(b)) => {
                Ok(Estimation::Histogram(a.binwise(b, op, |i, x, y| f(Some(i), x, y))?))
            }
            _ => Err(Error::ShapeMismatch(format!(
                "{op}: cannot combine a {} with a {}",
                self.shape_name(),
                other.shape_name()
            ))),
        }
    }
}

/// Convert a shape variation to an overall (normalization) factor:
/// `integral(shape) / integral(nominal)`, or 0 when the nominal integral is 0.
pub fn to_overall(shape: &Estimation, nominal: &Estimation) -> Result<f64> {
    nominal.ensure_same_shape(shape, "to_overall")?;
    let n = nominal.integral().value;
    if n == 0.0 {
        return Ok(0.0);
    }
    Ok(shape.integral().value / n)
}
