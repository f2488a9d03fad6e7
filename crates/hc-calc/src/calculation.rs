//! Declarative calculations over projections.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use hc_core::{Estimation, Result};
use hc_data::filler::{count, fill_histogram};
use hc_data::{
    Binning, EventView, ExpressionEvaluator, FlowPolicy, NegativeWeightPolicy, Projection,
    VarianceConvention,
};

use crate::fingerprint::Fingerprint;

/// What to compute from a projection. Every parameter is part of the
/// fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calculation {
    /// Weighted event count.
    Count {
        /// Variance convention.
        #[serde(default)]
        variance: VarianceConvention,
        /// Negative weight policy.
        #[serde(default)]
        negative_weights: NegativeWeightPolicy,
    },
    /// Weighted histogram of an expression.
    Histogram {
        /// Expression to histogram.
        expression: String,
        /// Binning.
        binning: Binning,
        /// Under/overflow policy.
        #[serde(default)]
        flow: FlowPolicy,
        /// Negative weight policy.
        #[serde(default)]
        negative_weights: NegativeWeightPolicy,
        /// Variance convention.
        #[serde(default)]
        variance: VarianceConvention,
    },
}

impl Calculation {
    /// Count with default conventions (`Σw²` variance, negative weights kept).
    pub fn count() -> Self {
        Calculation::Count {
            variance: VarianceConvention::default(),
            negative_weights: NegativeWeightPolicy::default(),
        }
    }

    /// Histogram with default conventions (flow dropped).
    pub fn histogram(expression: impl Into<String>, binning: Binning) -> Self {
        Calculation::Histogram {
            expression: expression.into(),
            binning,
            flow: FlowPolicy::default(),
            negative_weights: NegativeWeightPolicy::default(),
            variance: VarianceConvention::default(),
        }
    }

    /// Replace the variance convention.
    pub fn with_variance(mut self, convention: VarianceConvention) -> Self {
        match &mut self {
            Calculation::Count { variance, .. } | Calculation::Histogram { variance, .. } => {
                *variance = convention;
            }
        }
        self
    }

    /// Replace the negative weight policy.
    pub fn with_negative_weights(mut self, policy: NegativeWeightPolicy) -> Self {
        match &mut self {
            Calculation::Count { negative_weights, .. }
            | Calculation::Histogram { negative_weights, .. } => *negative_weights = policy,
        }
        self
    }

    /// Replace the flow policy. No effect on counts.
    pub fn with_flow(mut self, policy: FlowPolicy) -> Self {
        if let Calculation::Histogram { flow, .. } = &mut self {
            *flow = policy;
        }
        self
    }

    /// Kind name (`"count"` or `"histogram"`).
    pub fn kind(&self) -> &'static str {
        match self {
            Calculation::Count { .. } => "count",
            Calculation::Histogram { .. } => "histogram",
        }
    }

    /// Check parameters that can be checked without data.
    pub fn validate(&self) -> Result<()> {
        if let Calculation::Histogram { binning, .. } = self {
            binning.edges()?;
        }
        Ok(())
    }

    /// Fields the loader must provide to compute this on `projection`.
    pub fn required_fields(
        &self,
        projection: &Projection,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<BTreeSet<String>> {
        let mut fields = projection.required_fields(evaluator)?;
        if let Calculation::Histogram { expression, .. } = self {
            let own = evaluator.fields(expression)?;
            fields.extend(projection.source_fields(own, evaluator)?);
        }
        Ok(fields)
    }

    /// Compute from selected, weighted events.
    pub fn compute(&self, view: &EventView, evaluator: &dyn ExpressionEvaluator) -> Result<Estimation> {
        match self {
            Calculation::Count { variance, negative_weights } => {
                Ok(count(&view.weights, *variance, *negative_weights)?.into())
            }
            Calculation::Histogram { expression, binning, flow, negative_weights, variance } => {
                let edges = binning.edges()?;
                let values = evaluator.evaluate(expression, &view.table)?;
                let filled =
                    fill_histogram(&values, &view.weights, &edges, *flow, *negative_weights, *variance)?;
                tracing::trace!(
                    expression = %expression,
                    entries = filled.entries,
                    underflow = filled.underflow,
                    overflow = filled.overflow,
                    "histogram filled"
                );
                Ok(filled.histogram.into())
            }
        }
    }
}

impl fmt::Display for Calculation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Calculation::Count { .. } => write!(f, "count"),
            Calculation::Histogram { expression, .. } => write!(f, "histogram({expression})"),
        }
    }
}

/// A calculation bound to a projection: the unit the dispatcher executes.
#[derive(Debug, Clone)]
pub struct Task {
    /// What to compute.
    pub calculation: Calculation,
    /// What to compute it on.
    pub projection: Projection,
    fingerprint: Fingerprint,
}

impl Task {
    /// Bind `calculation` to `projection`. Validates the calculation and
    /// computes the fingerprint; loads nothing.
    pub fn new(calculation: Calculation, projection: Projection) -> Result<Self> {
        calculation.validate()?;
        let fingerprint = Fingerprint::of(&calculation, &projection)?;
        Ok(Self { calculation, projection, fingerprint })
    }

    /// Identity of this task.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Project and compute. No caching at this level.
    pub fn run(
        &self,
        loader: &dyn hc_data::DataLoader,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<Estimation> {
        let fields = self.calculation.required_fields(&self.projection, evaluator)?;
        let table = loader.load(&self.projection.process, &fields)?;
        let view = self.projection.apply(table, evaluator)?;
        self.calculation.compute(&view, evaluator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use hc_data::{CompiledEvaluator, MemoryLoader, Patch, Process, Region, Table};
    use std::sync::Arc;

    fn loader() -> MemoryLoader {
        let mut l = MemoryLoader::new();
        l.insert(
            "F1",
            Table::from_columns([("pt", vec![10.0, 25.0, 50.0]), ("w", vec![1.0, 2.0, 3.0])])
                .unwrap(),
        );
        l.insert("F2", Table::from_columns([("pt", vec![21.0]), ("w", vec![0.5])]).unwrap());
        l
    }

    fn projection(selection: &str, weight: &str) -> Projection {
        Projection::new(
            Arc::new(Process::new("P", ["F1", "F2"])),
            Arc::new(Region::new(selection, weight)),
        )
    }

    #[test]
    fn count_is_sum_of_weights_with_sumw2_variance() {
        let task = Task::new(Calculation::count(), projection("pt > 20", "w")).unwrap();
        let c = task.run(&loader(), &CompiledEvaluator::new()).unwrap().as_count().unwrap();
        assert_relative_eq!(c.value, 5.5);
        assert_relative_eq!(c.variance, 4.0 + 9.0 + 0.25);
    }

    #[test]
    fn poisson_convention() {
        let calc = Calculation::count().with_variance(VarianceConvention::Poisson);
        let task = Task::new(calc, projection("pt > 20", "w")).unwrap();
        let c = task.run(&loader(), &CompiledEvaluator::new()).unwrap().as_count().unwrap();
        assert_relative_eq!(c.variance, 5.5);
    }

    #[test]
    fn histogram_of_patched_field() {
        let process = Process::new("P", ["F1", "F2"])
            .patched(Patch::Define { field: "pt_gev".into(), expression: "pt / 10".into() });
        let projection = Projection::new(Arc::new(process), Arc::new(Region::new("", "")));
        let calc = Calculation::histogram("pt_gev", Binning::Edges(vec![0.0, 2.0, 6.0]));
        let ev = CompiledEvaluator::new();
        assert_eq!(
            calc.required_fields(&projection, &ev).unwrap(),
            BTreeSet::from(["pt".to_string()])
        );
        let h = Task::new(calc, projection).unwrap().run(&loader(), &ev).unwrap();
        assert_eq!(h.values(), &[1.0, 3.0]);
        assert_eq!(h.edges().unwrap(), &[0.0, 2.0, 6.0]);
    }

    #[test]
    fn invalid_binning_rejected_at_bind_time() {
        let calc = Calculation::histogram("pt", Binning::Edges(vec![1.0]));
        assert!(Task::new(calc, projection("", "")).is_err());
    }

    #[test]
    fn builders_set_parameters() {
        let calc = Calculation::histogram("x", Binning::uniform(0.0, 1.0, 2))
            .with_flow(FlowPolicy::Fold)
            .with_negative_weights(NegativeWeightPolicy::ClampToZero);
        let Calculation::Histogram { flow, negative_weights, .. } = &calc else {
            panic!("expected histogram");
        };
        assert_eq!(*flow, FlowPolicy::Fold);
        assert_eq!(*negative_weights, NegativeWeightPolicy::ClampToZero);
        assert_eq!(calc.to_string(), "histogram(x)");
        assert_eq!(Calculation::count().with_flow(FlowPolicy::Fold), Calculation::count());
    }

    #[test]
    fn yaml_form() {
        let c: Calculation = serde_yaml_ng::from_str(
            "kind: histogram\nexpression: pt\nbinning: {low: 0, high: 100, bins: 4}\nflow: fold\n",
        )
        .unwrap();
        assert_eq!(c.kind(), "histogram");
        let c: Calculation = serde_yaml_ng::from_str("kind: count\n").unwrap();
        assert_eq!(c, Calculation::count());
    }
}
