//! Error types for hepcalc

use std::sync::Arc;

use thiserror::Error;

/// hepcalc error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Invalid input (bad binning, inconsistent columns, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid or missing configuration
    #[error("Config error: {0}")]
    Config(String),

    /// A process' source files could not be resolved or read
    #[error("data unavailable for process '{process}': {reason}")]
    DataUnavailable {
        /// Process name.
        process: String,
        /// What went wrong.
        reason: String,
    },

    /// Selection/weight expression is invalid or references unknown fields
    #[error("Expression error: {0}")]
    Expression(String),

    /// Binning mismatch in algebra or uncertainty combination
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Ratio with a zero denominator
    #[error("division by zero: {0}")]
    DivisionByZero(String),

    /// A loader, evaluator or calculation panicked
    #[error("panicked: {0}")]
    Panicked(String),

    /// A persisted cache entry does not decode to its declared shape
    #[error("corrupt cache entry {key}: {reason}")]
    CacheCorruption {
        /// Cache key (fingerprint hex).
        key: String,
        /// Decoding failure.
        reason: String,
    },

    /// A base calculation this result depends on failed
    #[error("dependency {fingerprint} failed: {source}")]
    Dependency {
        /// Fingerprint (hex) of the failed base calculation.
        fingerprint: String,
        /// The original failure, shared by every dependent.
        #[source]
        source: Arc<Error>,
    },

    /// A composed result failed inside its own combination logic, or an
    /// input composition did
    #[error("composition '{node}' failed: {source}")]
    Composition {
        /// Name of the failing composition node.
        node: String,
        /// The failure.
        #[source]
        source: Arc<Error>,
    },
}

impl Error {
    /// Fingerprint of the failed base calculation, if this error was
    /// propagated from one.
    pub fn failed_dependency(&self) -> Option<&str> {
        match self {
            Error::Dependency { fingerprint, .. } => Some(fingerprint),
            _ => None,
        }
    }

    /// Owned copy of a shared error, for handing the same failure to several
    /// dependents.
    ///
    /// Annotations are copied as-is; any other error is attributed to `node`.
    pub fn share(shared: &Arc<Error>, node: &str) -> Error {
        match shared.as_ref() {
            Error::Dependency { fingerprint, source } => {
                Error::Dependency { fingerprint: fingerprint.clone(), source: Arc::clone(source) }
            }
            Error::Composition { node, source } => {
                Error::Composition { node: node.clone(), source: Arc::clone(source) }
            }
            _ => Error::Composition { node: node.to_string(), source: Arc::clone(shared) },
        }
    }

    /// The underlying error, looking through dependency annotations.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Dependency { source, .. } | Error::Composition { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

/// Message of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_reports_fingerprint_and_cause() {
        let base = Arc::new(Error::Expression("missing field: 'pt'".into()));
        let err = Error::Dependency { fingerprint: "ab12".into(), source: base };
        assert_eq!(err.failed_dependency(), Some("ab12"));
        assert!(matches!(err.root_cause(), Error::Expression(_)));
        assert!(err.to_string().contains("ab12"));
        assert!(err.to_string().contains("pt"));
    }

    #[test]
    fn share_keeps_annotations() {
        let base = Arc::new(Error::Expression("bad".into()));
        let dep = Arc::new(Error::Dependency { fingerprint: "cd34".into(), source: base });
        let copy = Error::share(&dep, "total");
        assert_eq!(copy.failed_dependency(), Some("cd34"));

        let local = Arc::new(Error::DivisionByZero("bin 0".into()));
        let wrapped = Error::share(&local, "ratio");
        assert!(wrapped.failed_dependency().is_none());
        assert!(matches!(wrapped.root_cause(), Error::DivisionByZero(_)));
        assert!(wrapped.to_string().contains("ratio"));
    }

    #[test]
    fn local_errors_have_no_dependency() {
        let err = Error::ShapeMismatch("2 bins vs 3 bins".into());
        assert!(err.failed_dependency().is_none());
        assert!(matches!(err.root_cause(), Error::ShapeMismatch(_)));
    }
}
