//! Hierarchical settings tree.
//!
//! Drivers hand the engine a tree of named entries; every component reads
//! its sublist by name (`Mesh`, `Solver`, `Physics`, `Functions`,
//! `Parameters`, `Postprocess`). Typed getters either fall back to a default
//! or fail with [`ConfigError::MissingSetting`] for required entries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A single settings entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    RealList(Vec<f64>),
    StrList(Vec<String>),
    Sublist(Settings),
}

/// A named tree of settings entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    entries: BTreeMap<String, SettingValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: SettingValue) -> &mut Self {
        self.entries.insert(name.to_string(), value);
        self
    }

    pub fn set_bool(&mut self, name: &str, v: bool) -> &mut Self {
        self.set(name, SettingValue::Bool(v))
    }

    pub fn set_int(&mut self, name: &str, v: i64) -> &mut Self {
        self.set(name, SettingValue::Int(v))
    }

    pub fn set_real(&mut self, name: &str, v: f64) -> &mut Self {
        self.set(name, SettingValue::Real(v))
    }

    pub fn set_str(&mut self, name: &str, v: &str) -> &mut Self {
        self.set(name, SettingValue::Str(v.to_string()))
    }

    pub fn set_real_list(&mut self, name: &str, v: Vec<f64>) -> &mut Self {
        self.set(name, SettingValue::RealList(v))
    }

    pub fn set_str_list(&mut self, name: &str, v: Vec<String>) -> &mut Self {
        self.set(name, SettingValue::StrList(v))
    }

    /// Insert (or fetch) a nested sublist and return a mutable handle to it.
    pub fn sublist_mut(&mut self, name: &str) -> &mut Settings {
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| SettingValue::Sublist(Settings::new()));
        if !matches!(entry, SettingValue::Sublist(_)) {
            *entry = SettingValue::Sublist(Settings::new());
        }
        match entry {
            SettingValue::Sublist(s) => s,
            _ => unreachable!(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.entries.get(name)
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn sublist(&self, name: &str) -> Option<&Settings> {
        match self.entries.get(name) {
            Some(SettingValue::Sublist(s)) => Some(s),
            _ => None,
        }
    }

    pub fn require_sublist(&self, name: &str) -> Result<&Settings, ConfigError> {
        self.sublist(name)
            .ok_or_else(|| ConfigError::MissingSetting(name.to_string()))
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.entries.get(name) {
            Some(SettingValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn get_int(&self, name: &str, default: i64) -> i64 {
        match self.entries.get(name) {
            Some(SettingValue::Int(v)) => *v,
            Some(SettingValue::Real(v)) => *v as i64,
            _ => default,
        }
    }

    pub fn get_real(&self, name: &str, default: f64) -> f64 {
        match self.entries.get(name) {
            Some(SettingValue::Real(v)) => *v,
            Some(SettingValue::Int(v)) => *v as f64,
            _ => default,
        }
    }

    pub fn get_str<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        match self.entries.get(name) {
            Some(SettingValue::Str(v)) => v.as_str(),
            _ => default,
        }
    }

    pub fn get_real_list(&self, name: &str) -> Option<&[f64]> {
        match self.entries.get(name) {
            Some(SettingValue::RealList(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_str_list(&self, name: &str) -> Option<&[String]> {
        match self.entries.get(name) {
            Some(SettingValue::StrList(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn require_real(&self, name: &str) -> Result<f64, ConfigError> {
        match self.entries.get(name) {
            Some(SettingValue::Real(v)) => Ok(*v),
            Some(SettingValue::Int(v)) => Ok(*v as f64),
            Some(_) => Err(ConfigError::WrongType {
                name: name.to_string(),
                expected: "real",
            }),
            None => Err(ConfigError::MissingSetting(name.to_string())),
        }
    }

    pub fn require_int(&self, name: &str) -> Result<i64, ConfigError> {
        match self.entries.get(name) {
            Some(SettingValue::Int(v)) => Ok(*v),
            Some(_) => Err(ConfigError::WrongType {
                name: name.to_string(),
                expected: "int",
            }),
            None => Err(ConfigError::MissingSetting(name.to_string())),
        }
    }

    pub fn require_str(&self, name: &str) -> Result<&str, ConfigError> {
        match self.entries.get(name) {
            Some(SettingValue::Str(v)) => Ok(v.as_str()),
            Some(_) => Err(ConfigError::WrongType {
                name: name.to_string(),
                expected: "string",
            }),
            None => Err(ConfigError::MissingSetting(name.to_string())),
        }
    }
}
