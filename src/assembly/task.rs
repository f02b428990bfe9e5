//! Assembler tasks: one concurrent unit of work per configured name.
//!
//! - [`assemble_module`] builds one ordinary component.
//! - [`assemble_aliases`] walks the whole `alias` block in document order.
//! - [`assemble_constants`] publishes the whole `const` block at once.
//!
//! Tasks never talk to each other. They meet only in the [`ModuleStore`],
//! and the only place they suspend is a store wait.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::document::{AliasEntry, ConstEntry};
use crate::error::{PopulateError, TaskError};

use super::module::{Instance, Module};
use super::populate::{self, FieldPath, Fields, HookFuture, Node, ScalarHook};
use super::store::ModuleStore;

/// Marker substituting another component.
pub const REF_MARKER: &str = "!REF:";
/// Marker substituting a registered constant.
pub const CONST_MARKER: &str = "!CONST:";

/// Name of the task that handles the `alias` block.
pub const ALIAS_TASK: &str = "alias";
/// Name of the task that handles the `const` block.
pub const CONST_TASK: &str = "const";

// ── Reference hook ────────────────────────────────────────────────────────────

/// Scalar hook that resolves reference markers against the store on behalf
/// of one requesting task.
pub struct ReferenceHook<'a> {
    store: &'a ModuleStore,
    requester: &'a str,
}

impl<'a> ReferenceHook<'a> {
    pub fn new(store: &'a ModuleStore, requester: &'a str) -> Self {
        Self { store, requester }
    }

    async fn lookup(&self, path: &FieldPath, name: &str) -> Result<Instance, PopulateError> {
        if name.is_empty() {
            return Err(path.error("missing reference name"));
        }
        self.store
            .resolve(self.requester, name)
            .await
            .map_err(|e| path.error(e.to_string()))
    }
}

impl ScalarHook for ReferenceHook<'_> {
    fn on_scalar<'h>(&'h self, path: &'h FieldPath, value: &'h Value) -> HookFuture<'h> {
        Box::pin(async move {
            let Value::String(s) = value else {
                return Ok(None);
            };
            if let Some(name) = s.strip_prefix(REF_MARKER) {
                let node = match self.lookup(path, name).await? {
                    Instance::Module(m) => Node::Module(m),
                    Instance::Constant(v) => Node::from(v),
                };
                return Ok(Some(node));
            }
            if let Some(name) = s.strip_prefix(CONST_MARKER) {
                return match self.lookup(path, name).await? {
                    Instance::Constant(v) => Ok(Some(Node::from(v))),
                    Instance::Module(m) => Err(path.error(format!(
                        "{name} is a module of type {}, not a constant",
                        m.type_name()
                    ))),
                };
            }
            Ok(None)
        })
    }
}

// ── Ordinary component ────────────────────────────────────────────────────────

/// Resolve, populate, initialize and publish one component.
pub async fn assemble_module(
    store: Arc<ModuleStore>,
    name: String,
    config: Value,
    mut instance: Box<dyn Module>,
) -> Result<(), TaskError> {
    let hook = ReferenceHook::new(&store, &name);
    let resolved = populate::resolve(&config, &hook).await?;
    let fields = Fields::from_node(&resolved)?;
    instance.populate(&fields)?;
    instance.initialize().map_err(TaskError::Initialize)?;

    let instance: Arc<dyn Module> = Arc::from(instance);
    store.publish(&name, &name, Instance::Module(instance))?;
    Ok(())
}

// ── Alias block ───────────────────────────────────────────────────────────────

/// Publish each alias in order. An alias may name an earlier alias.
pub async fn assemble_aliases(
    store: Arc<ModuleStore>,
    entries: Vec<AliasEntry>,
) -> Result<(), TaskError> {
    for (i, entry) in entries.iter().enumerate() {
        if entry.name.is_empty() || entry.alias.is_empty() {
            return Err(TaskError::Malformed(format!(
                "alias[{i}]: missing \"name\" or \"alias\""
            )));
        }
        let target = store.resolve(ALIAS_TASK, &entry.name).await?;
        store.publish(ALIAS_TASK, &entry.alias, target)?;
        debug!(name = %entry.name, alias = %entry.alias, "alias published");
    }
    Ok(())
}

// ── Const block ───────────────────────────────────────────────────────────────

/// Validate the whole block, then publish it in one step.
pub async fn assemble_constants(
    store: Arc<ModuleStore>,
    entries: Vec<ConstEntry>,
) -> Result<(), TaskError> {
    let mut seen = HashSet::new();
    let mut batch = Vec::with_capacity(entries.len());
    for (i, entry) in entries.into_iter().enumerate() {
        let value = match entry.value {
            Some(v) if !v.is_null() => v,
            _ => {
                return Err(TaskError::Malformed(format!(
                    "const[{i}]: missing \"name\" or \"value\""
                )));
            }
        };
        if entry.name.is_empty() {
            return Err(TaskError::Malformed(format!(
                "const[{i}]: missing \"name\" or \"value\""
            )));
        }
        if !seen.insert(entry.name.clone()) {
            warn!(name = %entry.name, "constant defined twice");
            return Err(TaskError::Malformed(format!(
                "const[{i}]: duplicate constant {}",
                entry.name
            )));
        }
        batch.push((entry.name, Instance::Constant(value)));
    }
    let count = batch.len();
    store.publish_all(CONST_TASK, batch)?;
    debug!(count, "constants published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::event::{self, EventReceiver};
    use crate::assembly::registry::Registry;
    use serde_json::json;

    fn store() -> (Arc<ModuleStore>, EventReceiver) {
        let (tx, rx) = event::channel();
        (Arc::new(ModuleStore::new(Arc::new(Registry::new()), tx)), rx)
    }

    #[derive(Default)]
    struct Limited {
        limit: u32,
    }

    impl Module for Limited {
        fn populate(&mut self, fields: &Fields<'_>) -> Result<(), PopulateError> {
            self.limit = fields.parse("Limit")?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn const_marker_substitutes_literal() {
        let (store, _rx) = store();
        store.publish("const", "limit", Instance::Constant(json!(10))).unwrap();
        assemble_module(
            store.clone(),
            "widget.a".into(),
            json!({"Limit": "!CONST:limit"}),
            Box::new(Limited::default()),
        )
        .await
        .unwrap();
        let m = store.try_get("widget.a").unwrap();
        let w = crate::assembly::module::downcast_module::<Limited>(m.as_module().unwrap()).unwrap();
        assert_eq!(w.limit, 10);
    }

    #[tokio::test]
    async fn const_marker_rejects_modules() {
        let (store, _rx) = store();
        store.publish("x", "widget.z", Instance::module(Limited::default())).unwrap();
        let err = assemble_module(
            store.clone(),
            "widget.a".into(),
            json!({"Limit": "!CONST:widget.z"}),
            Box::new(Limited::default()),
        )
        .await
        .unwrap_err();
        assert!(matches!(&err, TaskError::Populate(p) if p.path == "Limit"));
        assert!(err.to_string().contains("not a constant"));
        assert!(store.try_get("widget.a").is_none());
    }

    #[tokio::test]
    async fn empty_reference_name_is_an_error() {
        let (store, _rx) = store();
        let err = assemble_module(
            store,
            "widget.a".into(),
            json!({"Limit": "!REF:"}),
            Box::new(Limited::default()),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("missing reference name"));
    }

    #[tokio::test]
    async fn initialize_failure_keeps_name_unpublished() {
        #[derive(Default)]
        struct Picky;
        impl Module for Picky {
            fn initialize(&mut self) -> Result<(), crate::error::BoxError> {
                Err("refusing to start".into())
            }
        }
        let (store, _rx) = store();
        let err = assemble_module(store.clone(), "p.a".into(), json!({}), Box::new(Picky))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Initialize(_)));
        assert!(store.try_get("p.a").is_none());
    }

    #[tokio::test]
    async fn aliases_resolve_in_order() {
        let (store, _rx) = store();
        store.publish("x", "widget.x", Instance::module(Limited::default())).unwrap();
        assemble_aliases(
            store.clone(),
            vec![
                AliasEntry { name: "widget.x".into(), alias: "first".into() },
                AliasEntry { name: "first".into(), alias: "second".into() },
            ],
        )
        .await
        .unwrap();
        let x = store.try_get("widget.x").unwrap();
        assert!(store.try_get("first").unwrap().same_as(&x));
        assert!(store.try_get("second").unwrap().same_as(&x));
    }

    #[tokio::test]
    async fn empty_alias_is_malformed() {
        let (store, _rx) = store();
        let err = assemble_aliases(
            store,
            vec![AliasEntry { name: "widget.x".into(), alias: String::new() }],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::Malformed(_)));
    }

    #[tokio::test]
    async fn const_block_is_all_or_nothing() {
        let (store, _rx) = store();
        let err = assemble_constants(
            store.clone(),
            vec![
                ConstEntry { name: "a".into(), value: Some(json!(1)) },
                ConstEntry { name: "b".into(), value: None },
            ],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TaskError::Malformed(_)));
        assert!(store.try_get("a").is_none());

        let err = assemble_constants(
            store.clone(),
            vec![
                ConstEntry { name: "a".into(), value: Some(json!(1)) },
                ConstEntry { name: "a".into(), value: Some(json!(2)) },
            ],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("duplicate constant a"));

        assemble_constants(
            store.clone(),
            vec![ConstEntry { name: "a".into(), value: Some(json!("x")) }],
        )
        .await
        .unwrap();
        assert_eq!(store.try_get("a").unwrap().as_constant(), Some(&json!("x")));
    }
}
