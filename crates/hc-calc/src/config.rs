//! Engine configuration and the layered YAML/JSON loader.
//!
//! Configuration files are YAML (JSON is accepted too, being a YAML
//! subset). Next to `env.yaml` an analyst may keep an untracked
//! `env.local.yaml`; its top-level keys replace those of the shared file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use hc_core::{Error, Result};

/// Which cache backs the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    /// In-process cache, lost at exit.
    #[default]
    Memory,
    /// Persistent cache under `path`.
    Filesystem {
        /// Cache root directory.
        path: PathBuf,
    },
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker threads (0 = one per core).
    pub threads: usize,
    /// Result cache.
    pub cache: CacheConfig,
    /// Base directory for process file references.
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { threads: 0, cache: CacheConfig::Memory, data_dir: PathBuf::from(".") }
    }
}

impl EngineConfig {
    /// Load from a file (plus its `.local` override), resolving relative
    /// paths against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: EngineConfig = load_layered(path)?;
        let base = path.parent().unwrap_or(Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    /// Make relative paths absolute with respect to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.data_dir = resolve_path(base, &self.data_dir);
        if let CacheConfig::Filesystem { path } = &mut self.cache {
            *path = resolve_path(base, path);
        }
    }
}

/// `p` if absolute, else `base/p`.
pub fn resolve_path(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { base.join(p) }
}

/// Path of the local override for `path`: `dir/stem.local.ext`.
pub fn local_override_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let name = match ext {
        Some(ext) => format!("{stem}.local.{ext}"),
        None => format!("{stem}.local.yaml"),
    };
    path.with_file_name(name)
}

/// Read `path` and its local override, merge top-level keys, deserialize.
///
/// A missing base file is [`Error::Config`], even when an override exists.
pub fn load_layered<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(Error::Config(format!("configuration file not found: {}", path.display())));
    }
    let mut merged = read_mapping(path)?;
    let local = local_override_path(path);
    if local.is_file() {
        tracing::debug!(path = %local.display(), "applying local configuration override");
        for (k, v) in read_mapping(&local)? {
            merged.insert(k, v);
        }
    }
    Ok(serde_yaml_ng::from_value(serde_yaml_ng::Value::Mapping(merged))?)
}

fn read_mapping(path: &Path) -> Result<serde_yaml_ng::Mapping> {
    let bytes = std::fs::read(path)?;
    match serde_yaml_ng::from_slice::<serde_yaml_ng::Value>(&bytes)? {
        serde_yaml_ng::Value::Mapping(m) => Ok(m),
        serde_yaml_ng::Value::Null => Ok(serde_yaml_ng::Mapping::new()),
        _ => Err(Error::Config(format!("{}: top level must be a mapping", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir()
            .join(format!("hc_config_{tag}_{}_{}", std::process::id(), nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults() {
        let c: EngineConfig = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(c, EngineConfig::default());
    }

    #[test]
    fn local_override_replaces_top_level_keys() {
        let dir = tmp_dir("override");
        fs::write(
            dir.join("env.yaml"),
            "threads: 2\ncache: {kind: filesystem, path: shared_cache}\ndata_dir: data\n",
        )
        .unwrap();
        fs::write(dir.join("env.local.yaml"), "cache: {kind: memory}\n").unwrap();

        let c = EngineConfig::load(&dir.join("env.yaml")).unwrap();
        assert_eq!(c.threads, 2);
        assert_eq!(c.cache, CacheConfig::Memory);
        assert_eq!(c.data_dir, dir.join("data"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn relative_cache_path_is_resolved() {
        let dir = tmp_dir("paths");
        fs::write(dir.join("env.json"), r#"{"cache": {"kind": "filesystem", "path": "c"}}"#).unwrap();
        let c = EngineConfig::load(&dir.join("env.json")).unwrap();
        assert_eq!(c.cache, CacheConfig::Filesystem { path: dir.join("c") });
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_base_file_is_config_error() {
        let dir = tmp_dir("missing");
        fs::write(dir.join("env.local.yaml"), "threads: 1\n").unwrap();
        let err = EngineConfig::load(&dir.join("env.yaml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = serde_yaml_ng::from_str::<EngineConfig>("thread: 2\n");
        assert!(err.is_err());
    }

    #[test]
    fn override_path_naming() {
        assert_eq!(local_override_path(Path::new("/a/env.yml")), PathBuf::from("/a/env.local.yml"));
        assert_eq!(local_override_path(Path::new("cfg")), PathBuf::from("cfg.local.yaml"));
    }
}
