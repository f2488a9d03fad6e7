//! Data loading: turning a process' file references into a [`Table`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hc_core::{Error, Result};

use crate::process::Process;
use crate::table::Table;

/// Loads the requested fields of a process into one table.
///
/// Rows of all files are concatenated in the process' file order.
pub trait DataLoader: Send + Sync {
    /// Load `fields` of every file of `process`.
    ///
    /// Unresolvable or unreadable files are [`Error::DataUnavailable`];
    /// fields the data does not provide are [`Error::Expression`].
    fn load(&self, process: &Process, fields: &BTreeSet<String>) -> Result<Table>;
}

fn empty_table(fields: &BTreeSet<String>) -> Result<Table> {
    Table::from_columns(fields.iter().map(|f| (f.clone(), Vec::new())))
}

/// Backing storage for a data file.
///
/// `Mmap` avoids copying large files into RAM; `Owned` is used for
/// in-memory data and testing.
pub enum DataSource {
    /// File bytes owned in a `Vec<u8>`.
    Owned(Vec<u8>),
    /// Memory-mapped file.
    Mmap(memmap2::Mmap),
}

impl DataSource {
    /// Memory-map a file. Empty files are read as owned (mapping them fails
    /// on some platforms).
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = fs::File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(DataSource::Owned(Vec::new()));
        }
        // SAFETY: the mapping is only read; concurrent modification of the
        // file is outside what we support for read-only analysis inputs.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        Ok(DataSource::Mmap(mmap))
    }
}

impl Deref for DataSource {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            DataSource::Owned(v) => v,
            DataSource::Mmap(m) => m,
        }
    }
}

impl AsRef<[u8]> for DataSource {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

// ── In-memory loader ───────────────────────────────────────────

/// Loader over tables registered in memory, keyed by file reference.
///
/// Counts loads, which makes it handy for checking how often the data layer
/// is hit.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    files: HashMap<String, Table>,
    loads: AtomicU64,
}

impl MemoryLoader {
    /// An empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the table behind a file reference.
    pub fn insert(&mut self, file: impl Into<String>, table: Table) {
        self.files.insert(file.into(), table);
    }

    /// Number of `load` calls served so far.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

impl DataLoader for MemoryLoader {
    fn load(&self, process: &Process, fields: &BTreeSet<String>) -> Result<Table> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let mut out = empty_table(fields)?;
        for file in &process.files {
            let table = self.files.get(file).ok_or_else(|| Error::DataUnavailable {
                process: process.name.clone(),
                reason: format!("unknown file reference '{file}'"),
            })?;
            out.append(&table.select(fields)?)?;
        }
        Ok(out)
    }
}

// ── JSON column files ──────────────────────────────────────────

/// Loader for JSON column files: `{"<tree>": {"<field>": [values...]}}`.
///
/// File references are resolved against a base directory.
#[derive(Debug, Clone)]
pub struct JsonColumnLoader {
    base_dir: PathBuf,
}

impl JsonColumnLoader {
    /// Resolve relative file references against `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    /// Resolved path of a file reference.
    pub fn resolve(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }

    fn load_file(&self, process: &Process, file: &str, fields: &BTreeSet<String>) -> Result<Table> {
        let path = self.resolve(file);
        let unavailable = |reason: String| Error::DataUnavailable {
            process: process.name.clone(),
            reason: format!("{}: {reason}", path.display()),
        };

        let data = DataSource::open(&path).map_err(|e| unavailable(e.to_string()))?;
        let mut trees: HashMap<String, BTreeMap<String, Vec<f64>>> =
            serde_json::from_slice(&data).map_err(|e| unavailable(e.to_string()))?;
        let mut columns = trees
            .remove(&process.tree)
            .ok_or_else(|| unavailable(format!("no tree '{}'", process.tree)))?;

        // A tree can have rows but no requested fields (constant expressions).
        if fields.is_empty() {
            let n_rows = columns.values().next().map(Vec::len).unwrap_or(0);
            return Ok(Table::with_rows(n_rows));
        }
        let mut selected = Vec::with_capacity(fields.len());
        for f in fields {
            let values = columns.remove(f).ok_or_else(|| {
                Error::Expression(format!(
                    "undefined field: '{f}' (tree '{}' in {})",
                    process.tree,
                    path.display()
                ))
            })?;
            selected.push((f.clone(), values));
        }
        Table::from_columns(selected).map_err(|e| unavailable(format!("inconsistent columns: {e}")))
    }
}

impl DataLoader for JsonColumnLoader {
    fn load(&self, process: &Process, fields: &BTreeSet<String>) -> Result<Table> {
        let mut out = empty_table(fields)?;
        for file in &process.files {
            let table = self.load_file(process, file, fields)?;
            tracing::debug!(process = %process.name, file = %file, rows = table.n_rows(), "loaded");
            out.append(&table)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir()
            .join(format!("hc_data_source_{tag}_{}_{}", std::process::id(), nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn memory_loader_concatenates_files() {
        let mut l = MemoryLoader::new();
        l.insert("a", Table::from_columns([("x", vec![1.0]), ("y", vec![9.0])]).unwrap());
        l.insert("b", Table::from_columns([("x", vec![2.0, 3.0]), ("y", vec![0.0, 0.0])]).unwrap());
        let t = l.load(&Process::new("p", ["a", "b"]), &fields(&["x"])).unwrap();
        assert_eq!(t.column("x").unwrap(), &[1.0, 2.0, 3.0]);
        assert!(!t.has_column("y"));
        assert_eq!(l.loads(), 1);
    }

    #[test]
    fn json_loader_reads_tree() {
        let dir = tmp_dir("read");
        fs::write(dir.join("f.json"), r#"{"events": {"pt": [10, 30], "w": [1, 2]}}"#).unwrap();
        let l = JsonColumnLoader::new(&dir);
        let t = l.load(&Process::new("p", ["f.json", "f.json"]), &fields(&["pt"])).unwrap();
        assert_eq!(t.column("pt").unwrap(), &[10.0, 30.0, 10.0, 30.0]);

        let all = l.load(&Process::new("p", ["f.json"]), &BTreeSet::new()).unwrap();
        assert_eq!(all.n_rows(), 2);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn json_loader_errors() {
        let dir = tmp_dir("errors");
        fs::write(dir.join("f.json"), r#"{"events": {"pt": [10]}}"#).unwrap();
        fs::write(dir.join("bad.json"), "not json").unwrap();
        let l = JsonColumnLoader::new(&dir);

        let missing = l.load(&Process::new("p", ["nope.json"]), &fields(&["pt"]));
        assert!(matches!(missing, Err(Error::DataUnavailable { .. })));
        let bad = l.load(&Process::new("p", ["bad.json"]), &fields(&["pt"]));
        assert!(matches!(bad, Err(Error::DataUnavailable { .. })));
        let tree = l.load(&Process::new("p", ["f.json"]).retreed("other"), &fields(&["pt"]));
        assert!(matches!(tree, Err(Error::DataUnavailable { .. })));
        let field = l.load(&Process::new("p", ["f.json"]), &fields(&["eta"]));
        assert!(matches!(field, Err(Error::Expression(_))));
        let _ = fs::remove_dir_all(&dir);
    }
}
