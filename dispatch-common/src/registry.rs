//! The model plug-in registry: discovers `*.model.toml` definitions in a
//! directory, versions each by the MD5 hash of its raw bytes, and exposes
//! a thread-safe `(name, version) -> definition` map plus a `name ->
//! latest` pointer.
//!
//! Grounded in `original_source/npsgd/model_manager.py`'s `ModelManager`
//! and `setupModels`/`loadMembers`. Dynamic class loading has no
//! equivalent in a compiled language, so a "plug-in" here is a data file;
//! loading it is a deserialize-and-validate rather than an import.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::Deserialize;

use crate::error::RegistryError;
use crate::parameters::{Parameter, ParameterKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Standalone,
    Matlab,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSpec {
    pub kind: RunKind,
    pub binary: String,
}

/// A fully-loaded model definition: the parameter schema, the output
/// attachment list, the result body template, and how to invoke the run.
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    pub short_name: String,
    pub version: String,
    pub subtitle: String,
    pub body_template: String,
    pub attachments: Vec<String>,
    pub parameters: Vec<Parameter>,
    pub run: RunSpec,
}

/// On-disk shape of a `*.model.toml` file, before parameters are resolved
/// into validated `Parameter`s.
#[derive(Debug, Deserialize)]
struct ModelDefinitionFile {
    short_name: String,
    #[serde(default)]
    subtitle: String,
    #[serde(default)]
    body_template: String,
    #[serde(default)]
    attachments: Vec<String>,
    run: RunSpec,
    #[serde(rename = "parameters", default)]
    parameters: Vec<RawParameter>,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    kind: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    units: String,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    default: Option<toml::Value>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    step: Option<f64>,
    #[serde(default)]
    options: Option<Vec<String>>,
    #[serde(default)]
    range_start: Option<f64>,
    #[serde(default)]
    range_end: Option<f64>,
}

impl RawParameter {
    fn into_parameter(self, file: &str) -> Result<Parameter, RegistryError> {
        let kind = match self.kind.as_str() {
            "integer" => ParameterKind::Integer {
                min: self.min.map(|v| v as i64),
                max: self.max.map(|v| v as i64),
                step: self.step.map(|v| v as i64),
            },
            "float" => ParameterKind::Float {
                min: self.min,
                max: self.max,
                step: self.step,
            },
            "range" => {
                let range_start = self.range_start.ok_or_else(|| {
                    RegistryError::InvalidDefinition(file.to_owned(), "range_start")
                })?;
                let range_end = self.range_end.ok_or_else(|| {
                    RegistryError::InvalidDefinition(file.to_owned(), "range_end")
                })?;
                ParameterKind::Range {
                    range_start,
                    range_end,
                    step: self.step.unwrap_or(1.0),
                }
            }
            "string" => ParameterKind::String,
            "boolean" => ParameterKind::Boolean,
            "select" => ParameterKind::Select {
                options: self
                    .options
                    .ok_or_else(|| RegistryError::InvalidDefinition(file.to_owned(), "options"))?,
            },
            other => {
                return Err(RegistryError::ParseError {
                    path: file.to_owned(),
                    error: format!("unknown parameter kind '{other}'"),
                })
            }
        };

        let default = self.default.map(|v| toml_value_to_raw(&v));

        let mut param = Parameter::new(self.name, kind);
        param.description = self.description;
        param.units = self.units;
        param.hidden = self.hidden;
        param.default = default;

        param
            .with_default_applied()
            .map_err(|e| RegistryError::ParseError {
                path: file.to_owned(),
                error: e.to_string(),
            })
    }
}

fn toml_value_to_raw(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        other => other.to_string(),
    }
}

impl ModelDefinitionFile {
    fn into_definition(self, version: String, file: &str) -> Result<ModelDefinition, RegistryError> {
        if self.short_name.trim().is_empty() {
            return Err(RegistryError::InvalidDefinition(file.to_owned(), "short_name"));
        }
        if self.parameters.is_empty() {
            return Err(RegistryError::InvalidDefinition(file.to_owned(), "parameters"));
        }

        let parameters = self
            .parameters
            .into_iter()
            .map(|p| p.into_parameter(file))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ModelDefinition {
            short_name: self.short_name,
            version,
            subtitle: self.subtitle,
            body_template: self.body_template,
            attachments: self.attachments,
            parameters,
            run: self.run,
        })
    }
}

#[derive(Default)]
struct RegistryInner {
    models: HashMap<(String, String), Arc<ModelDefinition>>,
    latest: HashMap<String, Arc<ModelDefinition>>,
}

/// Thread-safe `(name, version) -> definition` map, upserted by periodic
/// directory scans. Never evicts: an in-flight task needs the exact
/// version it was created against even after a newer one loads.
pub struct ModelRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn get(&self, name: &str, version: &str) -> Option<Arc<ModelDefinition>> {
        self.inner
            .read()
            .unwrap()
            .models
            .get(&(name.to_owned(), version.to_owned()))
            .cloned()
    }

    pub fn get_latest(&self, name: &str) -> Option<Arc<ModelDefinition>> {
        self.inner.read().unwrap().latest.get(name).cloned()
    }

    pub fn has(&self, name: &str, version: &str) -> bool {
        self.get(name, version).is_some()
    }

    pub fn model_names(&self) -> Vec<String> {
        self.inner.read().unwrap().latest.keys().cloned().collect()
    }

    pub fn model_versions(&self) -> Vec<(String, String)> {
        self.inner.read().unwrap().models.keys().cloned().collect()
    }

    /// Scan `dir` for `*.model.toml` files, loading any `(short_name,
    /// hash)` pair not already present. A malformed file is logged and
    /// skipped rather than aborting the scan. Returns the count of newly
    /// loaded definitions.
    pub fn scan_directory(&self, dir: &Path) -> Result<usize, RegistryError> {
        if !dir.is_dir() {
            return Err(RegistryError::MissingDirectory(dir.display().to_string()));
        }

        let mut loaded = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let file_label = path.display().to_string();

            match self.load_one(&path) {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(file = %file_label, error = %err, "failed to load model definition");
                }
            }
        }

        Ok(loaded)
    }

    fn load_one(&self, path: &Path) -> Result<bool, RegistryError> {
        let bytes = fs::read(path)?;
        let version = format!("{:x}", md5::compute(&bytes));
        let file_label = path.display().to_string();

        let text = String::from_utf8_lossy(&bytes);
        let parsed: ModelDefinitionFile =
            toml::from_str(&text).map_err(|e| RegistryError::ParseError {
                path: file_label.clone(),
                error: e.to_string(),
            })?;

        if self.has(&parsed.short_name, &version) {
            return Ok(false);
        }

        let definition = Arc::new(parsed.into_definition(version.clone(), &file_label)?);

        let mut inner = self.inner.write().unwrap();
        inner
            .models
            .insert((definition.short_name.clone(), version), definition.clone());
        inner
            .latest
            .insert(definition.short_name.clone(), definition.clone());

        tracing::info!(
            model = %definition.short_name,
            version = %definition.version,
            "loaded model definition"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_model(dir: &Path, filename: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(filename)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    const VALID_MODEL: &str = r#"
short_name = "abmu"
subtitle = "Adult Body Mass Uncertainty"
body_template = "results for {{email}}"
attachments = []

[run]
kind = "standalone"
binary = "/opt/models/abmu/run.sh"

[[parameters]]
kind = "integer"
name = "nSamples"
description = "Number of samples"
units = "samples"
min = 1
max = 1000000
default = 10000
"#;

    #[test]
    fn scan_loads_valid_definition_and_sets_latest() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "abmu.model.toml", VALID_MODEL);

        let registry = ModelRegistry::new();
        let loaded = registry.scan_directory(dir.path()).unwrap();
        assert_eq!(loaded, 1);

        let latest = registry.get_latest("abmu").unwrap();
        assert_eq!(latest.short_name, "abmu");
        assert_eq!(latest.parameters.len(), 1);
        assert!(registry.has("abmu", &latest.version));
    }

    #[test]
    fn rescanning_same_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "abmu.model.toml", VALID_MODEL);

        let registry = ModelRegistry::new();
        assert_eq!(registry.scan_directory(dir.path()).unwrap(), 1);
        assert_eq!(registry.scan_directory(dir.path()).unwrap(), 0);
        assert_eq!(registry.model_versions().len(), 1);
    }

    #[test]
    fn new_version_does_not_evict_old_version() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "abmu.model.toml", VALID_MODEL);
        let registry = ModelRegistry::new();
        registry.scan_directory(dir.path()).unwrap();
        let old_version = registry.get_latest("abmu").unwrap().version.clone();

        let updated = VALID_MODEL.replace("10000", "20000");
        write_model(dir.path(), "abmu.model.toml", &updated);
        registry.scan_directory(dir.path()).unwrap();

        assert!(registry.has("abmu", &old_version));
        let latest = registry.get_latest("abmu").unwrap();
        assert_ne!(latest.version, old_version);
    }

    #[test]
    fn malformed_definition_is_skipped_without_aborting_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path(), "broken.model.toml", "short_name = \"x\"\n");
        write_model(dir.path(), "abmu.model.toml", VALID_MODEL);

        let registry = ModelRegistry::new();
        let loaded = registry.scan_directory(dir.path()).unwrap();
        assert_eq!(loaded, 1);
        assert!(registry.get_latest("abmu").is_some());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let registry = ModelRegistry::new();
        let err = registry
            .scan_directory(Path::new("/nonexistent/path/for/tests"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingDirectory(_)));
    }
}
