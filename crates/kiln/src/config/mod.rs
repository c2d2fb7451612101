//! TOML document loading for recipes and profiles.
//!
//! A document may name a single parent with a root-level `extends = "..."`
//! and pull in fragments with `imports = ["...", ...]`. Both are resolved
//! relative to the file that mentions them and deep-merged in this order:
//! parent, imports (in list order), the document itself.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    /// Build a document from an in-memory TOML string (no extends/imports).
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    /// Directory that relative paths in this document are resolved against.
    pub fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        path.split('.')
            .try_fold(&self.value, |cur, seg| cur.as_table()?.get(seg))
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path)?.as_table()
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v.clone().try_into().map_err(|e| {
            Error::config(format!(
                "invalid '{}' in {}: {e}",
                if path.is_empty() { "<root>" } else { path },
                self.path.display()
            ))
        })?;
        Ok(Some(parsed))
    }

    /// Top-level keys of the document, in sorted order.
    pub fn top_level_keys(&self) -> Vec<&str> {
        self.value
            .as_table()
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Deep-merge `overlay` into `base`. Tables merge key by key; any other value
/// in the overlay replaces the base value.
pub fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(over_tbl)) => {
            for (k, v) in over_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn relative_to(file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        return p;
    }
    file.parent().unwrap_or_else(|| Path::new(".")).join(p)
}

fn take_string_list(path: &Path, tbl: &mut toml::value::Table, key: &str) -> Result<Vec<String>> {
    let Some(raw) = tbl.remove(key) else {
        return Ok(Vec::new());
    };
    let items = match raw {
        Value::String(s) => vec![Value::String(s)],
        Value::Array(items) => items,
        _ => {
            return Err(Error::config(format!(
                "'{key}' in {} must be a string or a list of strings",
                path.display()
            )));
        }
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str() else {
            return Err(Error::config(format!(
                "'{key}' in {} must contain only strings",
                path.display()
            )));
        };
        let s = s.trim();
        if !s.is_empty() {
            out.push(s.to_string());
        }
    }
    Ok(out)
}

fn load_value(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "extends/imports cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
    let Some(tbl) = value.as_table_mut() else {
        return Err(Error::config(format!(
            "{} must contain a TOML table",
            path.display()
        )));
    };

    let parents = take_string_list(path, tbl, "extends")?;
    if parents.len() > 1 {
        return Err(Error::config(format!(
            "'extends' in {} names more than one parent",
            path.display()
        )));
    }
    let imports = take_string_list(path, tbl, "imports")?;

    let mut out = Value::Table(Default::default());
    for reference in parents.iter().chain(imports.iter()) {
        let loaded = load_value(&relative_to(path, reference), stack)?;
        merge(&mut out, loaded);
    }
    merge(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::new();
    let value = load_value(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
