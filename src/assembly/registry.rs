//! Type registry and built-in table.
//!
//! Host code fills a [`Registry`] before assembly: one factory per type
//! category, plus any pre-existing named values. The registry is an ordinary
//! owned object, so independent assemblies (e.g. parallel tests) never share
//! state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::module::{Factory, Instance, Module};

/// Top-level document keys reserved by default.
pub const DEFAULT_RESERVED: &[&str] = &["include"];

pub struct Registry {
    factories: HashMap<String, Factory>,
    builtins: HashMap<String, Instance>,
    reserved: HashSet<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            builtins: HashMap::new(),
            reserved: DEFAULT_RESERVED.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Register `factory` for `type_name`. A second registration overwrites.
    pub fn register<F>(&mut self, type_name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        if self.factories.insert(type_name.to_string(), Arc::new(factory)).is_some() {
            debug!(type_name, "module factory overwritten");
        }
        self
    }

    /// Register a factory that builds `T::default()`.
    pub fn register_default<T: Module + Default>(&mut self, type_name: &str) -> &mut Self {
        self.register(type_name, || Box::new(T::default()))
    }

    /// Make `instance` available under `name` without assembly. Built-ins are
    /// looked up before the Module Store and are never waited for.
    pub fn register_builtin(&mut self, name: &str, instance: Instance) -> &mut Self {
        if self.builtins.insert(name.to_string(), instance).is_some() {
            debug!(name, "built-in overwritten");
        }
        self
    }

    pub fn register_builtin_module<T: Module>(&mut self, name: &str, module: T) -> &mut Self {
        self.register_builtin(name, Instance::module(module))
    }

    pub fn register_builtin_constant(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.register_builtin(name, Instance::Constant(value.into()))
    }

    /// Mark a top-level document key as not being a module category.
    pub fn reserve(&mut self, key: &str) -> &mut Self {
        self.reserved.insert(key.to_string());
        self
    }

    pub fn factory(&self, type_name: &str) -> Option<&Factory> {
        self.factories.get(type_name)
    }

    pub fn builtin(&self, name: &str) -> Option<&Instance> {
        self.builtins.get(name)
    }

    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved.contains(key)
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::module::downcast_module;
    use crate::assembly::populate::Fields;
    use crate::error::PopulateError;

    #[derive(Default)]
    struct Counter {
        start: u32,
    }

    impl Module for Counter {
        fn populate(&mut self, fields: &Fields<'_>) -> Result<(), PopulateError> {
            self.start = fields.parse_or("Start", 0)?;
            Ok(())
        }
    }

    #[test]
    fn factories_produce_fresh_instances() {
        let mut reg = Registry::new();
        reg.register_default::<Counter>("counter");
        let factory = reg.factory("counter").unwrap();
        let a: Arc<dyn Module> = Arc::from(factory());
        let b: Arc<dyn Module> = Arc::from(factory());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(downcast_module::<Counter>(&a).unwrap().start, 0);
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let mut reg = Registry::new();
        reg.register("counter", || Box::new(Counter { start: 1 }));
        reg.register("counter", || Box::new(Counter { start: 2 }));
        let m: Arc<dyn Module> = Arc::from(reg.factory("counter").unwrap()());
        assert_eq!(downcast_module::<Counter>(&m).unwrap().start, 2);
        assert_eq!(reg.type_names(), vec!["counter"]);
    }

    #[test]
    fn builtins_and_reserved_keys() {
        let mut reg = Registry::new();
        reg.register_builtin_constant("app.version", "1.2.3")
            .register_builtin_module("clock.system", Counter::default())
            .reserve("meta");
        assert_eq!(
            reg.builtin("app.version").and_then(Instance::as_constant),
            Some(&Value::from("1.2.3"))
        );
        assert!(reg.builtin("clock.system").and_then(Instance::as_module).is_some());
        assert!(reg.builtin("nope").is_none());
        assert!(reg.is_reserved("include"));
        assert!(reg.is_reserved("meta"));
        assert!(!reg.is_reserved("widget"));
    }
}
