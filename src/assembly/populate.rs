//! Populator: fills a module from a raw configuration tree.
//!
//! Population runs in two stages:
//!
//! 1. [`resolve`] walks the raw `serde_json::Value` depth-first and hands
//!    every scalar to a [`ScalarHook`] before converting it. The hook may
//!    substitute the scalar (the assembler uses this to swap `!REF:` and
//!    `!CONST:` markers for published instances), and may suspend while doing
//!    so. The output is a resolved [`Node`] tree.
//! 2. [`Module::populate`](super::module::Module::populate) reads the resolved
//!    tree through [`Fields`]. Plain settings deserialize with serde; module
//!    references and durations convert with [`FromNode`].
//!
//! Unknown keys are ignored so documents can carry fields for other readers.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};

use crate::error::PopulateError;

use super::module::{downcast_module, Module};

// ── FieldPath ─────────────────────────────────────────────────────────────────

/// Location of a value inside an instance's configuration, e.g. `Pool.Backends[2]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPath(Vec<Segment>);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

impl FieldPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(&self, key: &str) -> Self {
        let mut next = self.clone();
        next.0.push(Segment::Key(key.to_string()));
        next
    }

    pub fn index(&self, index: usize) -> Self {
        let mut next = self.clone();
        next.0.push(Segment::Index(index));
        next
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Error at this location.
    pub fn error(&self, message: impl Into<String>) -> PopulateError {
        PopulateError::new(self.to_string(), message)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, seg) in self.0.iter().enumerate() {
            match seg {
                Segment::Key(k) if i == 0 => write!(f, "{k}")?,
                Segment::Key(k) => write!(f, ".{k}")?,
                Segment::Index(n) => write!(f, "[{n}]")?,
            }
        }
        Ok(())
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

/// A configuration tree after scalar resolution.
#[derive(Clone)]
pub enum Node {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Node>),
    Map(BTreeMap<String, Node>),
    /// A published module substituted for a reference marker.
    Module(Arc<dyn Module>),
}

impl Node {
    /// Short kind name used in mismatch messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Null => "null",
            Node::Bool(_) => "boolean",
            Node::Number(_) => "number",
            Node::String(_) => "string",
            Node::List(_) => "list",
            Node::Map(_) => "map",
            Node::Module(_) => "module",
        }
    }

    /// Convert back to a plain value; `None` if the tree holds a module.
    pub fn to_value(&self) -> Option<Value> {
        Some(match self {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Number(n) => Value::Number(n.clone()),
            Node::String(s) => Value::String(s.clone()),
            Node::List(items) => {
                Value::Array(items.iter().map(Node::to_value).collect::<Option<Vec<_>>>()?)
            }
            Node::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_value()?);
                }
                Value::Object(out)
            }
            Node::Module(_) => return None,
        })
    }
}

impl From<Value> for Node {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => Node::Number(n),
            Value::String(s) => Node::String(s),
            Value::Array(items) => Node::List(items.into_iter().map(Node::from).collect()),
            Value::Object(map) => Node::Map(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect()),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Null => f.write_str("Null"),
            Node::Bool(b) => write!(f, "Bool({b})"),
            Node::Number(n) => write!(f, "Number({n})"),
            Node::String(s) => write!(f, "String({s:?})"),
            Node::List(items) => f.debug_list().entries(items).finish(),
            Node::Map(map) => f.debug_map().entries(map).finish(),
            Node::Module(m) => write!(f, "Module({})", m.type_name()),
        }
    }
}

// ── Scalar hook ───────────────────────────────────────────────────────────────

/// Future returned by [`ScalarHook::on_scalar`].
pub type HookFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Node>, PopulateError>> + Send + 'a>>;

type ResolveFuture<'a> = Pin<Box<dyn Future<Output = Result<Node, PopulateError>> + Send + 'a>>;

/// Intercepts every scalar before conversion.
///
/// Returning `Ok(Some(node))` substitutes `node`; `Ok(None)` keeps the
/// scalar as-is.
pub trait ScalarHook: Send + Sync {
    fn on_scalar<'a>(&'a self, path: &'a FieldPath, value: &'a Value) -> HookFuture<'a>;
}

/// Hook that never substitutes anything.
pub struct NoHook;

impl ScalarHook for NoHook {
    fn on_scalar<'a>(&'a self, _path: &'a FieldPath, _value: &'a Value) -> HookFuture<'a> {
        Box::pin(async { Ok(None) })
    }
}

/// Walk `value` depth-first, passing every scalar through `hook`.
///
/// Scalars are visited in document order (map keys in sorted order), one at
/// a time, so a hook that suspends holds up the rest of the walk.
pub async fn resolve(value: &Value, hook: &dyn ScalarHook) -> Result<Node, PopulateError> {
    resolve_at(value, FieldPath::root(), hook).await
}

fn resolve_at<'a>(value: &'a Value, path: FieldPath, hook: &'a dyn ScalarHook) -> ResolveFuture<'a> {
    Box::pin(async move {
        match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    out.push(resolve_at(item, path.index(i), hook).await?);
                }
                Ok(Node::List(out))
            }
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    let node = resolve_at(&map[key], path.key(key), hook).await?;
                    out.insert(key.clone(), node);
                }
                Ok(Node::Map(out))
            }
            scalar => match hook.on_scalar(&path, scalar).await? {
                Some(node) => Ok(node),
                None => Ok(Node::from(scalar.clone())),
            },
        }
    })
}

// ── Fields ────────────────────────────────────────────────────────────────────

/// Typed read access to one resolved map.
///
/// Plain settings are read with serde: [`Fields::parse`] for one key,
/// [`Fields::deserialize`] for every reference-free entry at once.
/// References and durations go through [`FromNode`] with [`Fields::get`].
pub struct Fields<'a> {
    path: FieldPath,
    entries: &'a BTreeMap<String, Node>,
}

impl<'a> Fields<'a> {
    /// View the root of a resolved instance tree. The root must be a map.
    pub fn from_node(node: &'a Node) -> Result<Self, PopulateError> {
        Self::at(node, FieldPath::root())
    }

    fn at(node: &'a Node, path: FieldPath) -> Result<Self, PopulateError> {
        match node {
            Node::Map(entries) => Ok(Self { path, entries }),
            other => Err(path.error(format!("expected map, found {}", other.kind()))),
        }
    }

    /// Entry for `key`. An explicit `null` counts as absent.
    fn entry(&self, key: &str) -> Option<&'a Node> {
        self.entries.get(key).filter(|node| !matches!(node, Node::Null))
    }

    /// Deserialize `key` with serde.
    ///
    /// An absent key deserializes from `null`, so `Option<T>` reads it as
    /// `None` and anything else reports a missing required field.
    pub fn parse<T: DeserializeOwned>(&self, key: &str) -> Result<T, PopulateError> {
        let path = self.path.key(key);
        let Some(node) = self.entry(key) else {
            return serde_json::from_value(Value::Null)
                .map_err(|_| path.error("missing required field"));
        };
        let value = node
            .to_value()
            .ok_or_else(|| path.error("expected plain value, found module reference"))?;
        serde_json::from_value(value).map_err(|e| path.error(e.to_string()))
    }

    /// [`Fields::parse`], falling back to `default` when `key` is absent.
    pub fn parse_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, PopulateError> {
        match self.entry(key) {
            None => Ok(default),
            Some(_) => self.parse(key),
        }
    }

    /// Deserialize the whole map into a settings struct.
    ///
    /// Entries holding a module reference and explicit nulls are left out.
    /// Read references separately with [`Fields::get`] or [`Fields::module`].
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, PopulateError> {
        let plain: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .filter_map(|(k, node)| match node {
                Node::Null => None,
                node => node.to_value().map(|v| (k.clone(), v)),
            })
            .collect();
        serde_json::from_value(Value::Object(plain)).map_err(|e| self.path.error(e.to_string()))
    }

    /// Convert `key` if present. An explicit `null` counts as absent.
    pub fn get<T: FromNode>(&self, key: &str) -> Result<Option<T>, PopulateError> {
        match self.entry(key) {
            None => Ok(None),
            Some(node) => T::from_node(node, &self.path.key(key)).map(Some),
        }
    }

    pub fn require<T: FromNode>(&self, key: &str) -> Result<T, PopulateError> {
        self.get(key)?
            .ok_or_else(|| self.path.key(key).error("missing required field"))
    }

    pub fn get_or<T: FromNode>(&self, key: &str, default: T) -> Result<T, PopulateError> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    /// Required reference to a published module of type `T`.
    pub fn module<T: Module>(&self, key: &str) -> Result<Arc<T>, PopulateError> {
        self.require::<Arc<T>>(key)
    }

    /// List of references to modules of type `T`; absent means empty.
    pub fn modules<T: Module>(&self, key: &str) -> Result<Vec<Arc<T>>, PopulateError> {
        let path = self.path.key(key);
        match self.entry(key) {
            None => Ok(Vec::new()),
            Some(Node::List(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| Arc::<T>::from_node(item, &path.index(i)))
                .collect(),
            Some(other) => Err(mismatch(&path, "list of module references", other)),
        }
    }

    /// Typed view of a nested map.
    pub fn nested(&self, key: &str) -> Result<Fields<'a>, PopulateError> {
        let path = self.path.key(key);
        match self.entries.get(key) {
            Some(node) => Fields::at(node, path),
            None => Err(path.error("missing required field")),
        }
    }
}

// ── FromNode ──────────────────────────────────────────────────────────────────

/// Conversion from a resolved node for values serde cannot read: module
/// references, and durations written the humantime way.
pub trait FromNode: Sized {
    fn from_node(node: &Node, path: &FieldPath) -> Result<Self, PopulateError>;
}

fn mismatch(path: &FieldPath, expected: &str, node: &Node) -> PopulateError {
    path.error(format!("expected {expected}, found {}", node.kind()))
}

impl FromNode for Node {
    fn from_node(node: &Node, _path: &FieldPath) -> Result<Self, PopulateError> {
        Ok(node.clone())
    }
}

/// Durations accept humantime strings (`"250ms"`, `"2m 30s"`) or an integer
/// number of milliseconds.
impl FromNode for Duration {
    fn from_node(node: &Node, path: &FieldPath) -> Result<Self, PopulateError> {
        match node {
            Node::String(s) => parse_duration(s).map_err(|e| path.error(e)),
            Node::Number(n) => n
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| path.error(format!("expected milliseconds, found {n}"))),
            other => Err(mismatch(path, "duration", other)),
        }
    }
}

/// A reference field. The referenced module must have concrete type `T`.
impl<T: Module> FromNode for Arc<T> {
    fn from_node(node: &Node, path: &FieldPath) -> Result<Self, PopulateError> {
        match node {
            Node::Module(m) => downcast_module::<T>(m).ok_or_else(|| {
                path.error(format!(
                    "module of type {} is not assignable to {}",
                    m.type_name(),
                    std::any::type_name::<T>()
                ))
            }),
            other => Err(mismatch(path, "module reference", other)),
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| format!("bad duration {s:?}: {e}"))
}

/// serde `deserialize_with` helper taking the same duration forms as
/// [`FromNode`] for settings structs.
pub fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => parse_duration(&s).map_err(de::Error::custom),
    }
}
