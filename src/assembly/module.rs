//! The module contract and the type-erased instances the engine moves around.
//!
//! A [`Module`] is any value a factory can create and the populator can fill.
//! Each capability (populate, initialize, run) has a no-op default, so a type
//! only implements the hooks it needs.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, PopulateError};

use super::populate::Fields;

/// A boxed, owned future returned by [`Module::run`].
pub type ModuleFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send + 'static>>;

/// Produces a fresh, unpopulated instance for one type category.
pub type Factory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Upcasting helper so `Arc<dyn Module>` can be downcast to its concrete type.
pub trait AsAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A named, typed unit produced and owned by the assembly engine.
pub trait Module: AsAny {
    /// Fill `self` from the resolved configuration of this instance.
    ///
    /// References have already been substituted: a `!REF:` field holds a
    /// [`Node::Module`](super::populate::Node::Module) and a `!CONST:` field
    /// holds the constant's literal.
    fn populate(&mut self, _fields: &Fields<'_>) -> Result<(), PopulateError> {
        Ok(())
    }

    /// Self-check after population, before the instance is published.
    fn initialize(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Long-lived entry point started by the runner.
    ///
    /// Returns `None` when the module is not runnable. The future should
    /// return once `shutdown` is cancelled.
    fn run(self: Arc<Self>, _shutdown: CancellationToken) -> Option<ModuleFuture> {
        None
    }

    /// Concrete type name, used in type-mismatch messages.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Downcast a published module to its concrete type, keeping the same `Arc`.
pub fn downcast_module<T: Module>(module: &Arc<dyn Module>) -> Option<Arc<T>> {
    Arc::clone(module).into_any().downcast::<T>().ok()
}

/// A value held by the Module Store: either an assembled module or a
/// literal registered through the `const` block.
#[derive(Clone)]
pub enum Instance {
    Module(Arc<dyn Module>),
    Constant(Value),
}

impl Instance {
    pub fn module(module: impl Module) -> Self {
        Instance::Module(Arc::new(module))
    }

    pub fn as_module(&self) -> Option<&Arc<dyn Module>> {
        match self {
            Instance::Module(m) => Some(m),
            Instance::Constant(_) => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match self {
            Instance::Constant(v) => Some(v),
            Instance::Module(_) => None,
        }
    }

    /// Whether two instances are the same published value. Modules compare by
    /// allocation, constants by value.
    pub fn same_as(&self, other: &Instance) -> bool {
        match (self, other) {
            (Instance::Module(a), Instance::Module(b)) => Arc::ptr_eq(a, b),
            (Instance::Constant(a), Instance::Constant(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instance::Module(m) => write!(f, "Module({})", m.type_name()),
            Instance::Constant(v) => write!(f, "Constant({v})"),
        }
    }
}
