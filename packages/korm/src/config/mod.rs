//! Layered application configuration.
//!
//! Sources (TOML, JSON, YAML files or strings and environment variables) are
//! merged into one tree; later sources override earlier ones. Section and key
//! lookups match the exact name, ignoring case: `AutoMigrate` and
//! `AUTOMIGRATE` address the same value, `Auto_Migrate` does not. Nested
//! sections are addressed with `:` (`KormMigrations:ConnectionString`).

pub mod connection;
pub mod migrations;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::KormError;

pub use connection::{sanitize_connection_string, ConnectionSettings, DbProvider};
pub use migrations::{MigrationsSection, MIGRATIONS_SECTION};

pub const KEY_DELIMITER: char = ':';
pub const ENV_KEY_DELIMITER: &str = "__";

fn normalize_key(key: &str) -> String {
    key.to_lowercase()
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (normalize_key(&k), normalize_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        other => other,
    }
}

fn merge(target: &mut Map<String, Value>, source: Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    root: Map<String, Value>,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    pub fn from_value(value: Value) -> Result<Self, KormError> {
        match normalize_value(value) {
            Value::Object(root) => Ok(Self { root }),
            Value::Null => Ok(Self::default()),
            other => Err(KormError::config(format!(
                "configuration root must be a table, got {other}"
            ))),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, KormError> {
        Self::builder().add_toml_str(contents).build()
    }

    pub fn from_json_str(contents: &str) -> Result<Self, KormError> {
        Self::builder().add_json_str(contents).build()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Section by name or `:`-separated path. Always returns a section; use
    /// [`ConfigurationSection::exists`] to test presence.
    pub fn section(&self, path: &str) -> ConfigurationSection<'_> {
        let mut current: Option<&Value> = None;
        for (i, part) in path.split(KEY_DELIMITER).enumerate() {
            let key = normalize_key(part);
            current = if i == 0 {
                self.root.get(&key)
            } else {
                current.and_then(|v| v.as_object()).and_then(|m| m.get(&key))
            };
        }

        ConfigurationSection {
            path: path.to_string(),
            value: current,
        }
    }

    fn merge_layer(&mut self, layer: Value) -> Result<(), KormError> {
        match normalize_value(layer) {
            Value::Object(map) => {
                merge(&mut self.root, map);
                Ok(())
            }
            Value::Null => Ok(()),
            other => Err(KormError::config(format!(
                "configuration root must be a table, got {other}"
            ))),
        }
    }
}

/// A view into one node of a [`Configuration`].
#[derive(Debug, Clone)]
pub struct ConfigurationSection<'a> {
    path: String,
    value: Option<&'a Value>,
}

impl<'a> ConfigurationSection<'a> {
    /// The path as requested, e.g. `KormMigrations:ConnectionString`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when the section holds a value or at least one child.
    pub fn exists(&self) -> bool {
        match self.value {
            None | Some(Value::Null) => false,
            Some(Value::Object(map)) => !map.is_empty(),
            Some(_) => true,
        }
    }

    pub fn section(&self, key: &str) -> ConfigurationSection<'a> {
        let value = self
            .value
            .and_then(|v| v.as_object())
            .and_then(|m| m.get(&normalize_key(key)));
        ConfigurationSection {
            path: format!("{}{KEY_DELIMITER}{key}", self.path),
            value,
        }
    }

    /// Scalar value rendered as a string; `None` for missing sections and tables.
    pub fn value(&self) -> Option<String> {
        match self.value? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Parse the scalar at `key`, falling back to `default` when it is absent.
    /// A present but unparsable value is an error.
    pub fn get_value<T>(&self, key: &str, default: T) -> Result<T, KormError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let child = self.section(key);
        let Some(raw) = child.value() else {
            return Ok(default);
        };

        let raw = raw.trim();
        let raw = if raw.eq_ignore_ascii_case("true") {
            "true"
        } else if raw.eq_ignore_ascii_case("false") {
            "false"
        } else {
            raw
        };

        raw.parse::<T>().map_err(|e| {
            KormError::config(format!("invalid value '{raw}' for '{}': {e}", child.path))
        })
    }

    /// Deserialize the section into `T`. Keys are stored lowercased, so field
    /// names must be lowercase too, e.g. via `#[serde(rename)]`.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<Option<T>, KormError> {
        if !self.exists() {
            return Ok(None);
        }
        let value = self.value.cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| KormError::config(format!("failed to bind '{}': {e}", self.path)))
    }
}

#[derive(Debug, Clone)]
enum Source {
    Toml(String),
    Json(String),
    Yaml(String),
    File { path: PathBuf, optional: bool },
    Env { prefix: String },
}

/// Collects configuration sources; [`ConfigurationBuilder::build`] merges them in order.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationBuilder {
    sources: Vec<Source>,
}

impl ConfigurationBuilder {
    pub fn add_toml_str(mut self, contents: &str) -> Self {
        self.sources.push(Source::Toml(contents.to_string()));
        self
    }

    pub fn add_json_str(mut self, contents: &str) -> Self {
        self.sources.push(Source::Json(contents.to_string()));
        self
    }

    pub fn add_yaml_str(mut self, contents: &str) -> Self {
        self.sources.push(Source::Yaml(contents.to_string()));
        self
    }

    /// Format is chosen by extension: `toml`, `json`, `yml`/`yaml`.
    pub fn add_file(mut self, path: impl Into<PathBuf>, optional: bool) -> Self {
        self.sources.push(Source::File {
            path: path.into(),
            optional,
        });
        self
    }

    /// Environment variables starting with `prefix`; `__` separates sections,
    /// so `KORM_KormMigrations__AutoMigrate=true` sets `KormMigrations:AutoMigrate`.
    pub fn add_env_vars(mut self, prefix: impl Into<String>) -> Self {
        self.sources.push(Source::Env {
            prefix: prefix.into(),
        });
        self
    }

    pub fn build(self) -> Result<Configuration, KormError> {
        let mut configuration = Configuration::default();
        for source in self.sources {
            let layer = match source {
                Source::Toml(contents) => parse_toml(&contents)?,
                Source::Json(contents) => parse_json(&contents)?,
                Source::Yaml(contents) => parse_yaml(&contents)?,
                Source::File { path, optional } => match read_file(&path, optional)? {
                    Some(layer) => layer,
                    None => continue,
                },
                Source::Env { prefix } => env_layer(&prefix, std::env::vars()),
            };
            configuration.merge_layer(layer)?;
        }
        Ok(configuration)
    }
}

fn parse_toml(contents: &str) -> Result<Value, KormError> {
    toml::from_str(contents).map_err(|e| KormError::config(format!("TOML parse error: {e}")))
}

fn parse_json(contents: &str) -> Result<Value, KormError> {
    serde_json::from_str(contents).map_err(|e| KormError::config(format!("JSON parse error: {e}")))
}

fn parse_yaml(contents: &str) -> Result<Value, KormError> {
    serde_yaml::from_str(contents).map_err(|e| KormError::config(format!("YAML parse error: {e}")))
}

fn read_file(path: &Path, optional: bool) -> Result<Option<Value>, KormError> {
    if optional && !path.exists() {
        tracing::debug!(path = %path.display(), "optional configuration file not found");
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path).map_err(|e| {
        KormError::config(format!("failed to read '{}': {e}", path.display()))
    })?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let value = match ext {
        "toml" => parse_toml(&contents)?,
        "json" => parse_json(&contents)?,
        "yml" | "yaml" => parse_yaml(&contents)?,
        other => {
            return Err(KormError::config(format!(
                "unsupported config extension: {other}"
            )))
        }
    };
    Ok(Some(value))
}

fn env_layer<I>(prefix: &str, vars: I) -> Value
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut root = Map::new();
    'vars: for (name, value) in vars {
        let Some(key) = name.strip_prefix(prefix) else {
            continue;
        };
        let parts: Vec<&str> = key.split(ENV_KEY_DELIMITER).filter(|p| !p.is_empty()).collect();
        let Some((last, parents)) = parts.split_last() else {
            continue;
        };

        let mut node = &mut root;
        for part in parents {
            let entry = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry {
                Value::Object(child) => child,
                _ => continue 'vars,
            };
        }
        node.insert(last.to_string(), Value::String(value));
    }
    Value::Object(root)
}
