//! Columnar event table.

use std::collections::{BTreeMap, BTreeSet};

use hc_core::{Error, Result};

/// A set of equally long `f64` columns keyed by field name.
///
/// The row count is stored explicitly so a table with no columns still knows
/// how many events it holds (constant expressions need it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    n_rows: usize,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Table {
    /// An empty table with `n_rows` rows and no columns.
    pub fn with_rows(n_rows: usize) -> Self {
        Self { n_rows, columns: BTreeMap::new() }
    }

    /// Build a table from named columns. All columns must have the same length.
    pub fn from_columns<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut iter = columns.into_iter().peekable();
        let n_rows = iter.peek().map(|(_, v)| v.len()).unwrap_or(0);
        let mut table = Table::with_rows(n_rows);
        for (name, values) in iter {
            table.insert(name, values)?;
        }
        Ok(table)
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Add or replace a column.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.n_rows {
            return Err(Error::Validation(format!(
                "column '{}' has {} rows, table has {}",
                name,
                values.len(),
                self.n_rows
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// Column data by field name.
    ///
    /// A missing field is an expression error: some expression referenced a
    /// field the dataset does not provide.
    pub fn column(&self, name: &str) -> Result<&[f64]> {
        self.columns
            .get(name)
            .map(|v| v.as_slice())
            .ok_or_else(|| Error::Expression(format!("undefined field: '{name}'")))
    }

    /// Whether a column is present.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Field names in sorted order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Append the rows of `other`. Both tables must have the same fields.
    pub fn append(&mut self, other: &Table) -> Result<()> {
        if self.columns.is_empty() && self.n_rows == 0 {
            *self = other.clone();
            return Ok(());
        }
        if !self.columns.keys().eq(other.columns.keys()) {
            return Err(Error::Validation(format!(
                "cannot append tables with different fields ({:?} vs {:?})",
                self.columns.keys().collect::<Vec<_>>(),
                other.columns.keys().collect::<Vec<_>>()
            )));
        }
        for (name, values) in self.columns.iter_mut() {
            values.extend_from_slice(&other.columns[name]);
        }
        self.n_rows += other.n_rows;
        Ok(())
    }

    /// Keep only the listed fields. Fails if any is missing.
    pub fn select(&self, fields: &BTreeSet<String>) -> Result<Table> {
        let mut out = Table::with_rows(self.n_rows);
        for f in fields {
            out.columns.insert(f.clone(), self.column(f)?.to_vec());
        }
        Ok(out)
    }

    /// Keep only the rows where `mask` is true.
    pub fn filter(&self, mask: &[bool]) -> Result<Table> {
        if mask.len() != self.n_rows {
            return Err(Error::Validation(format!(
                "mask has {} entries, table has {} rows",
                mask.len(),
                self.n_rows
            )));
        }
        let n_rows = mask.iter().filter(|m| **m).count();
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                let kept =
                    values.iter().zip(mask).filter(|(_, m)| **m).map(|(v, _)| *v).collect();
                (name.clone(), kept)
            })
            .collect();
        Ok(Table { n_rows, columns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_must_agree() {
        let t = Table::from_columns([("a", vec![1.0, 2.0]), ("b", vec![3.0])]);
        assert!(t.is_err());
    }

    #[test]
    fn missing_column_is_expression_error() {
        let t = Table::from_columns([("pt", vec![1.0])]).unwrap();
        assert!(matches!(t.column("eta"), Err(Error::Expression(_))));
    }

    #[test]
    fn append_and_filter() {
        let mut t = Table::from_columns([("x", vec![1.0, 2.0])]).unwrap();
        t.append(&Table::from_columns([("x", vec![3.0])]).unwrap()).unwrap();
        assert_eq!(t.n_rows(), 3);
        let f = t.filter(&[true, false, true]).unwrap();
        assert_eq!(f.column("x").unwrap(), &[1.0, 3.0]);
        assert!(t.append(&Table::from_columns([("y", vec![0.0])]).unwrap()).is_err());
    }

    #[test]
    fn append_into_empty_takes_other() {
        let mut t = Table::default();
        t.append(&Table::from_columns([("x", vec![1.0])]).unwrap()).unwrap();
        assert_eq!(t.n_rows(), 1);
    }

    #[test]
    fn select_subset() {
        let t = Table::from_columns([("a", vec![1.0]), ("b", vec![2.0])]).unwrap();
        let s = t.select(&BTreeSet::from(["b".to_string()])).unwrap();
        assert_eq!(s.field_names().collect::<Vec<_>>(), vec!["b"]);
    }
}
