//! Runner: starts every runnable module of a finished assembly.
//!
//! Each run future is spawned as its own tokio task. If any of them returns
//! `Err` or panics, `shutdown` is cancelled so the siblings stop
//! cooperatively. Once `shutdown` is cancelled the siblings get a bounded
//! grace period. Whatever is still running after it is aborted, and the
//! first error is returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{Id, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{BoxError, RunError};

use super::module::{Module, ModuleFuture};
use super::{Assembly, panic_message};

/// How long modules get to return after `shutdown` is cancelled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the assembly's modules until they all return, with the default
/// [`SHUTDOWN_GRACE`].
pub async fn run(assembly: &Assembly, shutdown: CancellationToken) -> Result<(), RunError> {
    run_with_grace(assembly, shutdown, SHUTDOWN_GRACE).await
}

/// Run the assembly's modules until they all return.
///
/// With a run list, every listed name must be a runnable module. Without
/// one, every published runnable module is started once, even when it is
/// also published under an alias. Modules still running `grace` after
/// `shutdown` is cancelled are aborted.
pub async fn run_with_grace(
    assembly: &Assembly,
    shutdown: CancellationToken,
    grace: Duration,
) -> Result<(), RunError> {
    let runnable = select(assembly, &shutdown)?;
    if runnable.is_empty() {
        info!("no runnable modules");
        return Ok(());
    }

    let mut set: JoinSet<Result<(), BoxError>> = JoinSet::new();
    let mut names: HashMap<Id, String> = HashMap::new();
    for (name, future) in runnable {
        debug!(module = %name, "starting module");
        let handle = set.spawn(future);
        names.insert(handle.id(), name);
    }
    info!(count = names.len(), "modules running");

    let mut first_err: Option<RunError> = None;
    let mut draining = false;
    // Stays `None` while draining if `grace` overflows the clock.
    let mut deadline: Option<Instant> = None;
    loop {
        let joined = if !draining {
            tokio::select! {
                biased;
                joined = set.join_next_with_id() => joined,
                () = shutdown.cancelled() => {
                    draining = true;
                    deadline = Instant::now().checked_add(grace);
                    debug!(?grace, remaining = set.len(), "shutdown requested, draining modules");
                    continue;
                }
            }
        } else if let Some(at) = deadline {
            match time::timeout_at(at, set.join_next_with_id()).await {
                Ok(joined) => joined,
                Err(_) => {
                    let stuck: Vec<&str> = names.values().map(String::as_str).collect();
                    warn!(?grace, ?stuck, "modules ignored shutdown, aborting");
                    set.abort_all();
                    break;
                }
            }
        } else {
            set.join_next_with_id().await
        };
        let Some(res) = joined else { break };

        match res {
            Err(e) => {
                let name = names.remove(&e.id()).unwrap_or_default();
                let message = panic_message(e);
                error!(module = %name, %message, "module panicked");
                shutdown.cancel();
                first_err.get_or_insert(RunError::Panicked { name, message });
            }
            Ok((id, Err(source))) => {
                let name = names.remove(&id).unwrap_or_default();
                error!(module = %name, error = %source, "module stopped with error");
                shutdown.cancel();
                first_err.get_or_insert(RunError::Failed { name, source });
            }
            Ok((id, Ok(()))) => {
                let name = names.remove(&id).unwrap_or_default();
                debug!(module = %name, "module exited");
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Pick the modules to run and obtain their futures, in name order.
fn select(
    assembly: &Assembly,
    shutdown: &CancellationToken,
) -> Result<Vec<(String, ModuleFuture)>, RunError> {
    let mut out = Vec::new();

    let mut started: Vec<&Arc<dyn Module>> = Vec::new();

    if let Some(list) = assembly.run_list() {
        for name in list {
            let module = assembly
                .instance(name)
                .ok_or_else(|| RunError::Missing(name.clone()))?
                .as_module()
                .ok_or_else(|| RunError::NotRunnable(name.clone()))?;
            if started.iter().any(|m| Arc::ptr_eq(m, module)) {
                debug!(module = %name, "run list names a started module again");
                continue;
            }
            started.push(module);
            let future = Arc::clone(module)
                .run(shutdown.clone())
                .ok_or_else(|| RunError::NotRunnable(name.clone()))?;
            out.push((name.clone(), future));
        }
        return Ok(out);
    }

    for name in assembly.names() {
        let Some(module) = assembly.module(name) else {
            continue;
        };
        if started.iter().any(|m| Arc::ptr_eq(m, module)) {
            debug!(module = name, "skipping alias of a started module");
            continue;
        }
        started.push(module);
        if let Some(future) = Arc::clone(module).run(shutdown.clone()) {
            out.push((name.to_string(), future));
        }
    }
    Ok(out)
}
