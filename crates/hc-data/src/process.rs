//! Processes: named datasets with display and normalization metadata.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Display metadata. Not part of identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Style {
    /// Legend label.
    pub label: Option<String>,
    /// Line color (renderer-specific string, e.g. `"#1f77b4"`).
    pub line_color: Option<String>,
    /// Fill color.
    pub fill_color: Option<String>,
    /// Marker style.
    pub marker_style: Option<String>,
}

/// Generator-level normalization. The product of all factors multiplies
/// every event weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalization {
    /// Cross-section.
    pub cross_section: f64,
    /// Integrated luminosity.
    pub luminosity: f64,
    /// Additional scale factor.
    pub scale: f64,
}

impl Default for Normalization {
    fn default() -> Self {
        Self { cross_section: 1.0, luminosity: 1.0, scale: 1.0 }
    }
}

impl Normalization {
    /// Combined weight factor.
    pub fn factor(&self) -> f64 {
        self.cross_section * self.luminosity * self.scale
    }
}

/// A modification applied to the loaded table before selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Patch {
    /// Add (or overwrite) `field` with the value of `expression`.
    Define {
        /// Field to define.
        field: String,
        /// Expression over existing fields.
        expression: String,
    },
}

/// A named dataset: a collection of file references plus metadata.
///
/// File order is kept for reproducible loading; identity uses the sorted
/// set of files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Unique name.
    pub name: String,
    /// Source-file references (opaque to hepcalc, interpreted by the loader).
    pub files: Vec<String>,
    /// Tree/table key inside each file.
    #[serde(default = "default_tree")]
    pub tree: String,
    /// Display metadata.
    #[serde(default)]
    pub style: Style,
    /// Normalization metadata.
    #[serde(default)]
    pub normalization: Normalization,
    /// Patches applied in order after loading.
    #[serde(default)]
    pub patches: Vec<Patch>,
}

fn default_tree() -> String {
    "events".to_string()
}

/// The identity-relevant part of a [`Process`], in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessIdentity {
    /// Process name.
    pub name: String,
    /// Sorted, deduplicated file references.
    pub files: Vec<String>,
    /// Tree key.
    pub tree: String,
    /// Normalization.
    pub normalization: Normalization,
    /// Patches, in application order.
    pub patches: Vec<Patch>,
}

impl Process {
    /// A process reading `tree = "events"` from the given files.
    pub fn new<I, S>(name: impl Into<String>, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            files: files.into_iter().map(Into::into).collect(),
            tree: default_tree(),
            style: Style::default(),
            normalization: Normalization::default(),
            patches: Vec::new(),
        }
    }

    /// Set the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.style.label = Some(label.into());
        self
    }

    /// Set display metadata.
    pub fn with_style(mut self, style: Style) -> Self {
        self.style = style;
        self
    }

    /// Set normalization.
    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Copy reading a different tree.
    pub fn retreed(&self, tree: impl Into<String>) -> Self {
        Self { tree: tree.into(), ..self.clone() }
    }

    /// Copy with a patch appended.
    pub fn patched(&self, patch: Patch) -> Self {
        let mut p = self.clone();
        p.patches.push(patch);
        p
    }

    /// Label for display: the style label, falling back to the name.
    pub fn label(&self) -> &str {
        self.style.label.as_deref().unwrap_or(&self.name)
    }

    /// Canonical identity.
    pub fn identity(&self) -> ProcessIdentity {
        let mut files = self.files.clone();
        files.sort();
        files.dedup();
        ProcessIdentity {
            name: self.name.clone(),
            files,
            tree: self.tree.clone(),
            normalization: self.normalization,
            patches: self.patches.clone(),
        }
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Process {}

impl Hash for Process {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let id = self.identity();
        id.name.hash(state);
        id.files.hash(state);
        id.tree.hash(state);
        id.normalization.factor().to_bits().hash(state);
        id.patches.hash(state);
    }
}
