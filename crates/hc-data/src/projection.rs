//! Projections: a process seen through a region.

use std::collections::BTreeSet;
use std::sync::Arc;

use hc_core::{Error, Result};

use crate::expr::ExpressionEvaluator;
use crate::process::{Patch, Process};
use crate::region::Region;
use crate::source::DataLoader;
use crate::table::Table;

/// Selected events with their final weights.
#[derive(Debug, Clone)]
pub struct EventView {
    /// Selected rows (all loaded fields, after patches).
    pub table: Table,
    /// Per-event weight: region weight times process normalization.
    pub weights: Vec<f64>,
}

impl EventView {
    /// Number of selected events.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether no event was selected.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

/// A (process, region) pair. Two projections are equal iff both parts are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Dataset.
    pub process: Arc<Process>,
    /// Selection and weight.
    pub region: Arc<Region>,
}

impl Projection {
    /// Pair a process with a region.
    pub fn new(process: Arc<Process>, region: Arc<Region>) -> Self {
        Self { process, region }
    }

    /// Fields the loader must provide: everything the region's expressions
    /// and the patches reference, minus fields the patches define.
    pub fn required_fields(&self, evaluator: &dyn ExpressionEvaluator) -> Result<BTreeSet<String>> {
        let (selection, weight) = self.region.selection_weight();
        let mut wanted = BTreeSet::new();
        for expr in [selection.as_str(), weight.as_str()] {
            if !expr.trim().is_empty() {
                wanted.extend(evaluator.fields(expr)?);
            }
        }
        self.source_fields(wanted, evaluator)
    }

    /// Map fields needed after patching to fields needed from the loader.
    pub fn source_fields(
        &self,
        mut wanted: BTreeSet<String>,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<BTreeSet<String>> {
        // Every patch runs, so walk them backwards: a defined field is
        // replaced by the inputs of its definition.
        for patch in self.process.patches.iter().rev() {
            let Patch::Define { field, expression } = patch;
            wanted.remove(field);
            wanted.extend(evaluator.fields(expression)?);
        }
        Ok(wanted)
    }

    /// Apply patches, selection and weights to a loaded table.
    pub fn apply(&self, mut table: Table, evaluator: &dyn ExpressionEvaluator) -> Result<EventView> {
        for patch in &self.process.patches {
            let Patch::Define { field, expression } = patch;
            let values = evaluator.evaluate(expression, &table)?;
            table.insert(field.clone(), values)?;
        }

        let (selection, weight) = self.region.selection_weight();
        let table = if selection.trim().is_empty() {
            table
        } else {
            let mask: Vec<bool> =
                check_len(evaluator.evaluate(&selection, &table)?, &table, &selection)?
                    .into_iter()
                    .map(|v| v > 0.0)
                    .collect();
            table.filter(&mask)?
        };

        let factor = self.process.normalization.factor();
        let weights = if weight.trim().is_empty() {
            vec![factor; table.n_rows()]
        } else {
            check_len(evaluator.evaluate(&weight, &table)?, &table, &weight)?
                .into_iter()
                .map(|w| w * factor)
                .collect()
        };
        Ok(EventView { table, weights })
    }

    /// Load the process' data and apply the region.
    pub fn project(
        &self,
        loader: &dyn DataLoader,
        evaluator: &dyn ExpressionEvaluator,
    ) -> Result<EventView> {
        let fields = self.required_fields(evaluator)?;
        let table = loader.load(&self.process, &fields)?;
        self.apply(table, evaluator)
    }
}

fn check_len(values: Vec<f64>, table: &Table, expr: &str) -> Result<Vec<f64>> {
    if values.len() != table.n_rows() {
        return Err(Error::Expression(format!(
            "'{expr}' produced {} values for {} events",
            values.len(),
            table.n_rows()
        )));
    }
    Ok(values)
}
