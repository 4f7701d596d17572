//! Namespaced key-value persistence for parameter values, settings and results.
//!
//! Keys look like `routes.get_pet.param.pet_id`, `globals.param.<id>`,
//! `settings.<name>` or `routes.get_pet.result`. Parameter values and settings
//! are durable and written to a versioned JSON file; request results are kept
//! in memory only.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::parameter::{ParamValue, Parameter, ParameterValues};
use crate::route::Route;

/// Schema tag of the state file. Files with another version are ignored.
pub const STORAGE_VERSION: u32 = 1;

pub const STORAGE_DIR_NAME: &str = "httpdeck";
pub const STORAGE_FILE_NAME: &str = "storage.json";

/// `<config dir>/httpdeck/storage.json`, or relative to the working directory
/// when the platform has no config directory.
pub fn default_storage_path() -> PathBuf {
    return dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STORAGE_DIR_NAME)
        .join(STORAGE_FILE_NAME);
}

#[derive(Serialize, Deserialize)]
struct StorageFile {
    version: u32,
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
pub struct Storage {
    path: Option<PathBuf>,
    durable: RwLock<BTreeMap<String, Value>>,
    results: RwLock<HashMap<String, String>>,
}

impl Storage {
    /// Empty storage that is never written to disk.
    pub fn in_memory() -> Storage {
        return Storage::default();
    }

    /// Empty storage backed by `path`; nothing is read.
    pub fn new(path: &Path) -> Storage {
        return Storage {
            path: Some(path.to_path_buf()),
            ..Storage::default()
        };
    }

    /// Restores storage from `path`.
    ///
    /// A missing file or a file written with another schema version yields
    /// empty storage. A file that is not valid JSON is an error so that it is
    /// not overwritten by the next [`Storage::persist`].
    pub fn load(path: &Path) -> Result<Storage> {
        let storage = Storage::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "no storage file, starting empty");
            return Ok(storage);
        }

        let text = fs::read_to_string(path)?;
        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| Error::Storage(format!("{} is not valid JSON: {}", path.display(), e)))?;
        let version = raw.get("version").and_then(Value::as_u64);
        if version != Some(u64::from(STORAGE_VERSION)) {
            warn!(path = %path.display(), ?version, expected = STORAGE_VERSION, "storage version mismatch, starting empty");
            return Ok(storage);
        }

        let file: StorageFile = serde_json::from_value(raw)
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), entries = file.data.len(), "restored storage");
        *storage.durable.write().unwrap_or_else(PoisonError::into_inner) = file.data;
        return Ok(storage);
    }

    pub fn path(&self) -> Option<&Path> {
        return self.path.as_deref();
    }

    /// Writes the durable entries to the backing file. Last writer wins.
    pub fn persist(&self) -> Result<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = StorageFile {
            version: STORAGE_VERSION,
            data: self.durable_snapshot(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)?;
        debug!(path = %path.display(), entries = file.data.len(), "persisted storage");
        return Ok(());
    }

    pub fn durable_snapshot(&self) -> BTreeMap<String, Value> {
        return self.durable.read().unwrap_or_else(PoisonError::into_inner).clone();
    }

    fn read(&self, key: &str) -> Option<Value> {
        return self.durable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
    }

    fn write(&self, key: String, value: Value) {
        self.durable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    pub fn save_parameter(&self, prefix: &str, parameter: &Parameter, value: &str) {
        self.write(parameter.storage_key(prefix), Value::String(value.to_string()));
    }

    /// The stored raw value; `None` when absent, null or not a string.
    pub fn load_parameter(&self, prefix: &str, parameter: &Parameter) -> Option<String> {
        let key = parameter.storage_key(prefix);
        return match self.read(&key)? {
            Value::String(value) => Some(value),
            Value::Null => None,
            other => {
                warn!(key = %key, value = %other, "ignoring non-string parameter value");
                None
            }
        };
    }

    pub fn remove_parameter(&self, prefix: &str, parameter: &Parameter) {
        self.durable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&parameter.storage_key(prefix));
    }

    pub fn save_setting(&self, name: &str, value: &str) {
        self.write(format!("settings.{}", name), Value::String(value.to_string()));
    }

    pub fn load_setting(&self, name: &str) -> Option<String> {
        return match self.read(&format!("settings.{}", name))? {
            Value::String(value) => Some(value),
            _ => None,
        };
    }

    pub fn save_request_result(&self, route: &Route, result: &str) {
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(format!("{}.result", route.storage_prefix()), result.to_string());
    }

    pub fn load_request_result(&self, route: &Route) -> Option<String> {
        return self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&format!("{}.result", route.storage_prefix()))
            .cloned();
    }

    /// Resolves `parameters` stored under `prefix`.
    ///
    /// An absent or empty stored value falls back to the default, which is
    /// used as is. Anything else goes through the parameter's type. A required
    /// parameter whose value is still empty is a [`Error::MissingParameter`].
    /// Generators are never run here.
    pub fn get_parameter_values(&self, prefix: &str, parameters: &[Parameter]) -> Result<ParameterValues> {
        let mut values = ParameterValues::new();
        for param in parameters {
            let value = match self.load_parameter(prefix, param) {
                Some(raw) if !raw.is_empty() => Some(param.process_value(&raw)),
                _ => param
                    .default()
                    .map(|default| ParamValue::Text(default.to_string())),
            };
            let empty = value.as_ref().map_or(true, |v| v.is_empty());
            if empty && param.is_required() {
                return Err(Error::MissingParameter {
                    name: param.name().to_string(),
                });
            }
            values.insert(param.name(), value);
        }
        return Ok(values);
    }

    /// Values of the route's group (empty without a group) and of the route itself.
    pub fn get_parameter_values_for_route(&self, route: &Route) -> Result<(ParameterValues, ParameterValues)> {
        let group_values = match route.group() {
            Some(group) => self.get_parameter_values(&group.storage_prefix(), group.parameters())?,
            None => ParameterValues::new(),
        };
        let route_values = self.get_parameter_values(&route.storage_prefix(), route.parameters())?;
        return Ok((group_values, route_values));
    }
}
