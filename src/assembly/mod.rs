//! Concurrent assembly engine.
//!
//! [`Assembler::assemble`] turns a [`Document`] into an [`Assembly`]: one
//! tokio task per configured module, plus one for the `alias` block and one
//! for the `const` block. Tasks find each other's output through the
//! [`ModuleStore`] and report to the coordinator over the event stream.
//!
//! The coordinator keeps two counters, `outstanding` and `blocked`. When
//! every outstanding task is blocked nothing can ever be published again and
//! the assembly fails with [`AssembleError::Deadlock`].

pub mod event;
pub mod module;
pub mod populate;
pub mod registry;
pub mod runner;
pub mod store;
pub mod task;

use std::collections::{HashMap, HashSet};
use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{self, Instant};
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::document::Document;
use crate::error::{AssembleError, TaskError};

pub use event::{Event, EventKind};
pub use module::{Instance, Module, ModuleFuture, downcast_module};
pub use populate::{Fields, FromNode, Node};
pub use registry::Registry;
pub use store::ModuleStore;

use event::EventSender;

pub struct Assembler {
    registry: Arc<Registry>,
    timeout: Option<Duration>,
}

/// One planned ordinary component: name, raw config, fresh instance.
struct Planned {
    name: String,
    config: Value,
    instance: Box<dyn Module>,
}

/// Running tasks with their names, so a panic can be attributed.
struct TaskSet {
    set: JoinSet<()>,
    names: HashMap<Id, String>,
    events: EventSender,
    assembly_id: Uuid,
}

impl TaskSet {
    fn spawn<F>(&mut self, name: String, work: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        let events = self.events.clone();
        let span = info_span!("module", module = %name, assembly = %self.assembly_id);
        let task_name = name.clone();
        let handle = self.set.spawn(
            async move {
                let result = work.await;
                events.finished(&task_name, result);
            }
            .instrument(span),
        );
        self.names.insert(handle.id(), name);
    }

    fn name_of(&self, id: Id) -> String {
        self.names.get(&id).cloned().unwrap_or_else(|| format!("task {id}"))
    }
}

impl Assembler {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry, timeout: None }
    }

    /// Fail with [`AssembleError::Timeout`] if assembly takes longer than `after`.
    pub fn with_timeout(mut self, after: Duration) -> Self {
        self.timeout = Some(after);
        self
    }

    /// Assemble every module the document configures.
    ///
    /// The document is validated before anything is spawned. On failure the
    /// remaining tasks are cancelled and nothing is returned.
    pub async fn assemble(&self, document: &Document) -> Result<Assembly, AssembleError> {
        let started = Instant::now();
        let planned = self.plan(document)?;
        let assembly_id = Uuid::now_v7();

        let (events, mut rx) = event::channel();
        let store = Arc::new(ModuleStore::new(self.registry.clone(), events.clone()));
        let mut tasks = TaskSet { set: JoinSet::new(), names: HashMap::new(), events, assembly_id };

        // Names some task will publish, used to tell cycles from missing names.
        let mut expected: HashSet<String> = HashSet::new();

        for Planned { name, config, instance } in planned {
            expected.insert(name.clone());
            tasks.spawn(name.clone(), task::assemble_module(store.clone(), name, config, instance));
        }
        if let Some(aliases) = &document.aliases {
            expected.extend(aliases.iter().map(|a| a.alias.clone()));
            tasks.spawn(task::ALIAS_TASK.to_string(), task::assemble_aliases(store.clone(), aliases.clone()));
        }
        if let Some(constants) = &document.constants {
            expected.extend(constants.iter().map(|c| c.name.clone()));
            tasks.spawn(
                task::CONST_TASK.to_string(),
                task::assemble_constants(store.clone(), constants.clone()),
            );
        }

        let mut outstanding = tasks.names.len();
        let mut blocked = 0usize;
        info!(assembly = %assembly_id, tasks = outstanding, "assembly started");

        // A timeout too large for the clock means no deadline at all.
        let deadline = self
            .timeout
            .and_then(|after| started.checked_add(after).map(|at| (after, at)));
        let expired = async move {
            match deadline {
                Some((after, at)) => {
                    time::sleep_until(at).await;
                    after
                }
                None => future::pending().await,
            }
        };
        tokio::pin!(expired);

        while outstanding > 0 {
            tokio::select! {
                biased;

                Some(event) = rx.recv() => match event.kind {
                    EventKind::Blocked => blocked += 1,
                    EventKind::Resumed => blocked = blocked.saturating_sub(1),
                    EventKind::Finished(Ok(())) => {
                        outstanding -= 1;
                        debug!(module = %event.task, outstanding, "module assembled");
                    }
                    EventKind::Finished(Err(source)) => {
                        let dependents = store.dependents_of(&event.task);
                        error!(module = %event.task, error = %source, "assemble module fail");
                        return Err(AssembleError::Task { name: event.task, dependents, source });
                    }
                },

                Some(joined) = tasks.set.join_next_with_id(), if !tasks.set.is_empty() => {
                    if let Err(e) = joined {
                        let name = tasks.name_of(e.id());
                        let message = panic_message(e);
                        error!(module = %name, %message, "assembler task panicked");
                        return Err(AssembleError::Panicked { name, message });
                    }
                }

                after = &mut expired => {
                    warn!(?after, outstanding, blocked, "assembly timed out");
                    return Err(AssembleError::Timeout { after, outstanding });
                }
            }

            if outstanding > 0 && blocked == outstanding {
                let chains = store.dump_waiting_chains();
                let missing: Vec<String> = store
                    .awaited_names()
                    .into_iter()
                    .filter(|name| !expected.contains(name))
                    .collect();
                error!(blocked, ?chains, ?missing, "module dependency deadlock");
                return Err(AssembleError::Deadlock { chains, missing });
            }
        }

        let assembly = Assembly { modules: store.snapshot(), run: document.run.clone() };
        info!(
            assembly = %assembly_id,
            modules = assembly.len(),
            elapsed = ?started.elapsed(),
            "assembly complete"
        );
        Ok(assembly)
    }

    /// Validate every module category and create one instance per entry.
    fn plan(&self, document: &Document) -> Result<Vec<Planned>, AssembleError> {
        let mut planned = Vec::new();
        for (category, instances) in &document.categories {
            if self.registry.is_reserved(category) {
                continue;
            }
            let factory = self.registry.factory(category).ok_or_else(|| {
                AssembleError::ConfigShape(format!("unknown module type {category}"))
            })?;
            let Value::Object(instances) = instances else {
                return Err(AssembleError::ConfigShape(format!(
                    "module category {category} must be a map of instances"
                )));
            };
            for (instance, config) in instances {
                let name = format!("{category}.{instance}");
                if !config.is_object() {
                    return Err(AssembleError::ConfigShape(format!(
                        "module {name} must be configured with a map"
                    )));
                }
                planned.push(Planned { name, config: config.clone(), instance: factory() });
            }
        }
        Ok(planned)
    }
}

pub(crate) fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ── Assembly ──────────────────────────────────────────────────────────────────

/// Result of a successful assembly: every published name and the run list.
#[derive(Debug, Clone, Default)]
pub struct Assembly {
    modules: HashMap<String, Instance>,
    run: Option<Vec<String>>,
}

impl Assembly {
    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.modules.get(name)
    }

    pub fn module(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.instance(name).and_then(Instance::as_module)
    }

    /// Typed access to an assembled module.
    pub fn get<T: Module>(&self, name: &str) -> Option<Arc<T>> {
        self.module(name).and_then(downcast_module::<T>)
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.instance(name).and_then(Instance::as_constant)
    }

    /// Every published name, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// The document's `run` list, if it had one.
    pub fn run_list(&self) -> Option<&[String]> {
        self.run.as_deref()
    }
}
