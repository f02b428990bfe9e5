//! Application-wide error types.
//!
//! [`AppError`] is the host-level error returned by the binary. The engine
//! errors below it follow the assembly pipeline: a task fails with a
//! [`TaskError`], the coordinator reports an [`AssembleError`], and the
//! runner reports a [`RunError`].

use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by module hooks (`initialize`, `run`).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error(transparent)]
    Run(#[from] RunError),
}

/// Field-level failure while filling a module from its resolved tree.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct PopulateError {
    /// Dotted field path, e.g. `Backends[1]` or `Limits.max`.
    pub path: String,
    pub message: String,
}

impl PopulateError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self { path: path.into(), message: message.into() }
    }
}

/// Module Store refusals.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("module name already taken: {0}")]
    DuplicateName(String),

    #[error("wait for {0} abandoned: module store closed")]
    Closed(String),
}

/// Why a single assembler task terminated with an error.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("populate fail: {0}")]
    Populate(#[from] PopulateError),

    #[error("initialize fail: {0}")]
    Initialize(#[source] BoxError),

    #[error("malformed entry: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum AssembleError {
    /// The document does not match the expected category/map structure.
    #[error("config shape error: {0}")]
    ConfigShape(String),

    #[error("assemble module {name} fail: {source}{}", waiting_suffix(.dependents))]
    Task {
        name: String,
        /// Tasks that were (transitively) waiting on `name` when it failed.
        dependents: Vec<String>,
        #[source]
        source: TaskError,
    },

    /// Every outstanding task is blocked on a name nobody can publish.
    #[error("module dependency deadlock: {}{}", render_chains(.chains), missing_suffix(.missing))]
    Deadlock {
        chains: Vec<Vec<String>>,
        /// Awaited names that no configured task produces.
        missing: Vec<String>,
    },

    #[error("assembly timed out after {after:?} with {outstanding} module(s) outstanding")]
    Timeout { after: Duration, outstanding: usize },

    #[error("assembler task for {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

impl AssembleError {
    /// The module name this error originated from, if any.
    pub fn module_name(&self) -> Option<&str> {
        match self {
            AssembleError::Task { name, .. } | AssembleError::Panicked { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("missing run module: {0}")]
    Missing(String),

    #[error("module {0} is not runnable")]
    NotRunnable(String),

    #[error("module {name} stopped with error: {source}")]
    Failed {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("module {name} panicked: {message}")]
    Panicked { name: String, message: String },
}

fn waiting_suffix(dependents: &[String]) -> String {
    if dependents.is_empty() {
        String::new()
    } else {
        format!(" (blocking {})", dependents.join(", "))
    }
}

fn render_chains(chains: &[Vec<String>]) -> String {
    if chains.is_empty() {
        return "no waiting chains".to_string();
    }
    chains.iter().map(|c| c.join(" -> ")).collect::<Vec<_>>().join("; ")
}

fn missing_suffix(missing: &[String]) -> String {
    if missing.is_empty() {
        String::new()
    } else {
        format!(" (never configured: {})", missing.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_error_display() {
        let e = AppError::Config("missing field".into());
        assert!(e.to_string().contains("missing field"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: AppError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }

    #[test]
    fn populate_error_carries_path() {
        let e = PopulateError::new("Backends[1]", "expected string, found number");
        assert_eq!(e.to_string(), "Backends[1]: expected string, found number");
    }

    #[test]
    fn task_error_names_dependents() {
        let e = AssembleError::Task {
            name: "widget.a".into(),
            dependents: vec!["widget.b".into(), "widget.c".into()],
            source: TaskError::Malformed("bad".into()),
        };
        let msg = e.to_string();
        assert!(msg.contains("widget.a"));
        assert!(msg.contains("blocking widget.b, widget.c"));
        assert_eq!(e.module_name(), Some("widget.a"));
        assert!(e.source().is_some());
    }

    #[test]
    fn deadlock_renders_chains_and_missing() {
        let e = AssembleError::Deadlock {
            chains: vec![vec!["a".into(), "b".into(), "a".into()]],
            missing: vec!["service.y".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("a -> b -> a"));
        assert!(msg.contains("never configured: service.y"));
    }

    #[test]
    fn initialize_error_is_source() {
        let e = TaskError::Initialize("port out of range".into());
        assert!(e.to_string().contains("port out of range"));
        assert!(e.source().is_some());
    }
}
