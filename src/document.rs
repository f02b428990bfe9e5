//! Assembly documents: loading and splitting.
//!
//! A document is a syntax-independent `serde_json::Value` tree:
//!
//! ```text
//! include = ["db.toml"]                       # reserved: merged by `load`
//! alias   = [{ name = "sql.main", alias = "db" }]
//! const   = [{ name = "limit", value = 10 }]
//! run     = ["web.front"]
//! [widget.a]                                  # <type-category>.<instance>
//! Limit = "!CONST:limit"
//! ```
//!
//! [`load`] reads `.toml` or `.json` files and follows `include` lists
//! relative to the including file. [`load_as`] forces a [`Format`] for
//! documents whose extension says nothing about their syntax. [`Document::from_value`] splits out the
//! `alias`, `const` and `run` blocks; every other top-level key is a module
//! category, left raw for the assembler to validate against its registry.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{AppError, AssembleError};

pub const ALIAS_KEY: &str = "alias";
pub const CONST_KEY: &str = "const";
pub const RUN_KEY: &str = "run";
pub const INCLUDE_KEY: &str = "include";

/// One `(name, alias)` pair of the `alias` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AliasEntry {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Alias")]
    pub alias: String,
}

/// One `(name, value)` pair of the `const` block.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConstEntry {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Value")]
    pub value: Option<Value>,
}

/// A document split into its reserved blocks and module categories.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// `None` when the document has no `alias` block.
    pub aliases: Option<Vec<AliasEntry>>,
    /// `None` when the document has no `const` block.
    pub constants: Option<Vec<ConstEntry>>,
    /// Explicit run list; `None` means "run every runnable module".
    pub run: Option<Vec<String>>,
    /// `category → raw category value`, not yet validated.
    pub categories: BTreeMap<String, Value>,
}

impl Document {
    pub fn from_value(value: Value) -> Result<Self, AssembleError> {
        let Value::Object(map) = value else {
            return Err(AssembleError::ConfigShape(format!(
                "document must be a map, found {}",
                kind(&value)
            )));
        };

        let mut doc = Document::default();
        for (key, value) in map {
            match key.as_str() {
                ALIAS_KEY => doc.aliases = Some(parse_block(ALIAS_KEY, value)?),
                CONST_KEY => doc.constants = Some(parse_block(CONST_KEY, value)?),
                RUN_KEY => doc.run = Some(parse_block(RUN_KEY, value)?),
                _ => {
                    doc.categories.insert(key, value);
                }
            }
        }
        Ok(doc)
    }
}

fn parse_block<T: for<'de> Deserialize<'de>>(key: &str, value: Value) -> Result<T, AssembleError> {
    serde_json::from_value(value)
        .map_err(|e| AssembleError::ConfigShape(format!("invalid {key} block: {e}")))
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Convert a TOML tree to the JSON value model. Datetimes become strings.
pub fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => {
            Value::Object(table.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect())
        }
    }
}

// ── Format ────────────────────────────────────────────────────────────────────

/// Document syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Toml,
    Json,
}

impl Format {
    /// Format implied by the file extension, if it names one.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Some(Format::Toml),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Some(Format::Json),
            _ => None,
        }
    }

    /// Parse `text` into the document value model. `origin` names the
    /// source in errors.
    pub fn parse(self, text: &str, origin: &Path) -> Result<Value, AppError> {
        let parse_err = |e: &dyn fmt::Display| {
            AppError::Config(format!("{self} parse error in {}: {e}", origin.display()))
        };
        match self {
            Format::Json => serde_json::from_str(text).map_err(|e| parse_err(&e)),
            Format::Toml => toml::from_str::<toml::Value>(text)
                .map(toml_to_json)
                .map_err(|e| parse_err(&e)),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Toml => "toml",
            Format::Json => "json",
        })
    }
}

impl FromStr for Format {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "toml" => Ok(Format::Toml),
            "json" => Ok(Format::Json),
            other => Err(AppError::Config(format!(
                "unknown document format '{other}' (expected toml or json)"
            ))),
        }
    }
}

// ── File loading ──────────────────────────────────────────────────────────────

/// Load a document file and everything it includes, then split it.
/// Every file's format follows its extension.
pub fn load(path: &Path) -> Result<Document, AppError> {
    load_as(path, None)
}

/// [`load`] with the root document's format forced to `format` when set.
///
/// Includes use their own extension. An include without a recognised one
/// is read in the format of the file that includes it.
pub fn load_as(path: &Path, format: Option<Format>) -> Result<Document, AppError> {
    let format = format.or_else(|| Format::from_path(path)).ok_or_else(|| {
        AppError::Config(format!(
            "unsupported document format: {} (expected .toml or .json)",
            path.display()
        ))
    })?;
    let merged = load_merged(path, format, &mut HashSet::new())?;
    Ok(Document::from_value(merged)?)
}

/// Read one file and merge its includes after it. `visited` carries the
/// canonical paths already on this include chain.
fn load_merged(
    path: &Path,
    format: Format,
    visited: &mut HashSet<PathBuf>,
) -> Result<Value, AppError> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !visited.insert(canonical.clone()) {
        return Err(AppError::Config(format!(
            "circular include detected at: {}",
            path.display()
        )));
    }

    let text = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    let mut value = format.parse(&text, path)?;
    let includes = match &mut value {
        Value::Object(map) => map.remove(INCLUDE_KEY),
        _ => None,
    };

    if let Some(includes) = includes {
        let includes: Vec<String> = serde_json::from_value(includes).map_err(|e| {
            AppError::Config(format!("invalid include list in {}: {e}", path.display()))
        })?;
        let dir = path.parent().unwrap_or(Path::new("."));
        for include in includes {
            let include_path = if Path::new(&include).is_absolute() {
                PathBuf::from(&include)
            } else {
                dir.join(&include)
            };
            let include_format = Format::from_path(&include_path).unwrap_or(format);
            debug!(
                from = %path.display(),
                include = %include_path.display(),
                format = %include_format,
                "loading include"
            );
            let included = load_merged(&include_path, include_format, visited)?;
            merge_documents(&mut value, included, &include_path)?;
        }
    }

    visited.remove(&canonical);
    Ok(value)
}

/// Merge an included document into `base`.
///
/// List blocks (`alias`, `const`, `run`) are appended; module categories are
/// merged by instance name, and an instance defined twice is an error.
fn merge_documents(base: &mut Value, included: Value, source: &Path) -> Result<(), AppError> {
    let shape_err = || AppError::Config(format!("{} is not a map document", source.display()));
    let Value::Object(included) = included else {
        return Err(shape_err());
    };
    let Value::Object(base) = base else {
        return Err(shape_err());
    };

    for (key, value) in included {
        let Some(existing) = base.get_mut(&key) else {
            base.insert(key, value);
            continue;
        };
        match (existing, value) {
            (Value::Array(into), Value::Array(more)) => into.extend(more),
            (Value::Object(into), Value::Object(more)) => merge_instances(&key, into, more, source)?,
            _ => {
                return Err(AppError::Config(format!(
                    "cannot merge key {key} from {}: mismatched types",
                    source.display()
                )));
            }
        }
    }
    Ok(())
}

fn merge_instances(
    category: &str,
    into: &mut Map<String, Value>,
    more: Map<String, Value>,
    source: &Path,
) -> Result<(), AppError> {
    for (name, config) in more {
        if into.contains_key(&name) {
            return Err(AppError::Config(format!(
                "duplicate module {category}.{name} in {}",
                source.display()
            )));
        }
        into.insert(name, config);
    }
    Ok(())
}
