//! Module Store and Wait Table.
//!
//! `name → instance` and `name → pending requests` live behind a single
//! mutex and always change together. A request for an unpublished name parks
//! a `oneshot` slot in the Wait Table; the publish that fills the name drains
//! every slot for it in the same critical section, so a request can never
//! slip in between "not published yet" and "no longer waited on".
//!
//! The lock is never held across an await.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::StoreError;

use super::event::EventSender;
use super::module::Instance;
use super::registry::Registry;

/// Outcome of [`ModuleStore::get_or_wait`].
pub enum Lookup {
    Ready(Instance),
    /// The caller has been queued; the slot fires when `name` is published.
    Wait(oneshot::Receiver<Instance>),
}

struct Waiter {
    requester: String,
    slot: oneshot::Sender<Instance>,
}

#[derive(Default)]
struct Tables {
    modules: HashMap<String, Instance>,
    waiting: HashMap<String, Vec<Waiter>>,
}

pub struct ModuleStore {
    registry: Arc<Registry>,
    events: EventSender,
    tables: Mutex<Tables>,
}

impl ModuleStore {
    pub fn new(registry: Arc<Registry>, events: EventSender) -> Self {
        Self { registry, events, tables: Mutex::new(Tables::default()) }
    }

    // Every critical section leaves both tables consistent, so a poisoned
    // lock still guards valid data.
    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Built-in or published instance for `name`, without waiting.
    pub fn try_get(&self, name: &str) -> Option<Instance> {
        if let Some(instance) = self.registry.builtin(name) {
            return Some(instance.clone());
        }
        self.lock().modules.get(name).cloned()
    }

    /// Return `name` if available, otherwise queue `requester` for it.
    ///
    /// Queuing emits `Blocked` for `requester` before the lock is released.
    pub fn get_or_wait(&self, requester: &str, name: &str) -> Lookup {
        if let Some(instance) = self.registry.builtin(name) {
            return Lookup::Ready(instance.clone());
        }
        let mut tables = self.lock();
        if let Some(instance) = tables.modules.get(name) {
            return Lookup::Ready(instance.clone());
        }
        let (slot, rx) = oneshot::channel();
        tables
            .waiting
            .entry(name.to_string())
            .or_default()
            .push(Waiter { requester: requester.to_string(), slot });
        self.events.blocked(requester);
        debug!(requester, awaited = name, "waiting for module");
        Lookup::Wait(rx)
    }

    /// [`get_or_wait`](Self::get_or_wait), suspending until the name is published.
    pub async fn resolve(&self, requester: &str, name: &str) -> Result<Instance, StoreError> {
        match self.get_or_wait(requester, name) {
            Lookup::Ready(instance) => Ok(instance),
            Lookup::Wait(rx) => rx.await.map_err(|_| StoreError::Closed(name.to_string())),
        }
    }

    /// Publish `instance` under `name` and wake everyone waiting for it.
    ///
    /// `Resumed` is emitted for each waiter here, on the publisher's side, so
    /// it reaches the coordinator before the publisher's own `Finished`.
    pub fn publish(&self, publisher: &str, name: &str, instance: Instance) -> Result<(), StoreError> {
        let mut tables = self.lock();
        self.check_free(&tables, name)?;
        self.insert(&mut tables, publisher, name.to_string(), instance);
        Ok(())
    }

    /// Publish a batch in one critical section. Nothing is published unless
    /// every name is free.
    pub fn publish_all(
        &self,
        publisher: &str,
        entries: Vec<(String, Instance)>,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock();
        for (name, _) in &entries {
            self.check_free(&tables, name)?;
        }
        for (name, instance) in entries {
            self.insert(&mut tables, publisher, name, instance);
        }
        Ok(())
    }

    fn check_free(&self, tables: &Tables, name: &str) -> Result<(), StoreError> {
        if tables.modules.contains_key(name) || self.registry.builtin(name).is_some() {
            return Err(StoreError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn insert(&self, tables: &mut Tables, publisher: &str, name: String, instance: Instance) {
        let waiters = tables.waiting.remove(&name).unwrap_or_default();
        debug!(publisher, module = %name, waiters = waiters.len(), "module published");
        for waiter in waiters {
            self.events.resumed(&waiter.requester);
            let _ = waiter.slot.send(instance.clone());
        }
        tables.modules.insert(name, instance);
    }

    /// Names that currently have at least one waiter.
    pub fn awaited_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().waiting.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every requester transitively waiting on `name`, sorted.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let tables = self.lock();
        let mut found = BTreeSet::new();
        let mut frontier = vec![name.to_string()];
        while let Some(current) = frontier.pop() {
            for waiter in tables.waiting.get(&current).into_iter().flatten() {
                if waiter.requester != name && found.insert(waiter.requester.clone()) {
                    frontier.push(waiter.requester.clone());
                }
            }
        }
        found.into_iter().collect()
    }

    /// Requester → awaited-name chains built from the live Wait Table.
    ///
    /// Each chain starts at a requester and follows what it waits on until a
    /// name that waits on nothing. A chain that runs into a name it already
    /// passed ends by repeating that name, so `[a, b, a]` is a cycle.
    /// Chains start from requesters nobody waits on first, then from
    /// whatever is left (pure cycles).
    pub fn dump_waiting_chains(&self) -> Vec<Vec<String>> {
        let depends: BTreeMap<String, String> = {
            let tables = self.lock();
            tables
                .waiting
                .iter()
                .flat_map(|(awaited, waiters)| {
                    waiters.iter().map(move |w| (w.requester.clone(), awaited.clone()))
                })
                .collect()
        };
        let awaited: HashSet<&String> = depends.values().collect();
        let heads = depends.keys().filter(|r| !awaited.contains(r));
        let rest = depends.keys().filter(|r| awaited.contains(r));

        let mut searched: HashSet<&str> = HashSet::new();
        let mut chains = Vec::new();
        for start in heads.chain(rest) {
            if searched.contains(start.as_str()) {
                continue;
            }
            let mut chain = vec![start.clone()];
            let mut on_chain: HashSet<&str> = HashSet::from([start.as_str()]);
            searched.insert(start);
            let mut current = start;
            while let Some(next) = depends.get(current) {
                chain.push(next.clone());
                if on_chain.contains(next.as_str()) || searched.contains(next.as_str()) {
                    break;
                }
                on_chain.insert(next);
                searched.insert(next);
                current = next;
            }
            chains.push(chain);
        }
        chains
    }

    /// Copy of every published `name → instance` pair.
    pub fn snapshot(&self) -> HashMap<String, Instance> {
        self.lock().modules.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::event::{self, EventKind, EventReceiver};
    use serde_json::json;

    fn store() -> (ModuleStore, EventReceiver) {
        let (tx, rx) = event::channel();
        let mut reg = Registry::new();
        reg.register_builtin_constant("builtin.k", 1);
        (ModuleStore::new(Arc::new(reg), tx), rx)
    }

    fn kinds(rx: &mut EventReceiver) -> Vec<(String, &'static str)> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            let kind = match e.kind {
                EventKind::Blocked => "blocked",
                EventKind::Resumed => "resumed",
                EventKind::Finished(_) => "finished",
            };
            out.push((e.task, kind));
        }
        out
    }

    #[test]
    fn published_name_returns_without_waiting() {
        let (store, mut rx) = store();
        store.publish("p", "k", Instance::Constant(json!(42))).unwrap();
        assert!(matches!(store.get_or_wait("r", "k"), Lookup::Ready(_)));
        assert!(store.awaited_names().is_empty());
        assert!(kinds(&mut rx).is_empty());
    }

    #[test]
    fn builtins_are_never_awaited() {
        let (store, mut rx) = store();
        match store.get_or_wait("r", "builtin.k") {
            Lookup::Ready(i) => assert_eq!(i.as_constant(), Some(&json!(1))),
            Lookup::Wait(_) => panic!("built-in must be ready"),
        }
        assert!(store.try_get("builtin.k").is_some());
        assert!(kinds(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn publish_wakes_every_waiter() {
        let (store, mut rx) = store();
        let Lookup::Wait(a) = store.get_or_wait("a", "x") else { panic!("expected wait") };
        let Lookup::Wait(b) = store.get_or_wait("b", "x") else { panic!("expected wait") };
        assert_eq!(store.awaited_names(), vec!["x"]);

        let published = Instance::Constant(json!("v"));
        store.publish("p", "x", published.clone()).unwrap();
        assert!(a.await.unwrap().same_as(&published));
        assert!(b.await.unwrap().same_as(&published));
        assert!(store.awaited_names().is_empty());

        assert_eq!(
            kinds(&mut rx),
            vec![
                ("a".to_string(), "blocked"),
                ("b".to_string(), "blocked"),
                ("a".to_string(), "resumed"),
                ("b".to_string(), "resumed"),
            ]
        );
    }

    #[test]
    fn duplicate_publish_refused() {
        let (store, _rx) = store();
        store.publish("p", "x", Instance::Constant(json!(1))).unwrap();
        let err = store.publish("q", "x", Instance::Constant(json!(2))).unwrap_err();
        assert_eq!(err, StoreError::DuplicateName("x".into()));
        assert_eq!(store.try_get("x").unwrap().as_constant(), Some(&json!(1)));

        let err = store.publish("q", "builtin.k", Instance::Constant(json!(2))).unwrap_err();
        assert_eq!(err, StoreError::DuplicateName("builtin.k".into()));
    }

    #[test]
    fn batch_publish_is_all_or_nothing() {
        let (store, _rx) = store();
        store.publish("p", "taken", Instance::Constant(json!(0))).unwrap();
        let err = store
            .publish_all(
                "const",
                vec![
                    ("fresh".into(), Instance::Constant(json!(1))),
                    ("taken".into(), Instance::Constant(json!(2))),
                ],
            )
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateName("taken".into()));
        assert!(store.try_get("fresh").is_none());
    }

    #[tokio::test]
    async fn resolve_reports_closed_store() {
        let (store, _rx) = store();
        let store = Arc::new(store);
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.resolve("a", "never").await })
        };
        while store.awaited_names().is_empty() {
            tokio::task::yield_now().await;
        }
        // Dropping the wait entry without a publish closes the slot.
        store.lock().waiting.clear();
        assert_eq!(waiter.await.unwrap().unwrap_err(), StoreError::Closed("never".into()));
    }

    #[test]
    fn waiting_chains_follow_dependencies() {
        let (store, _rx) = store();
        // a -> b -> c (c never published), and a cycle x -> y -> x.
        let _wa = store.get_or_wait("a", "b");
        let _wb = store.get_or_wait("b", "c");
        let _wx = store.get_or_wait("x", "y");
        let _wy = store.get_or_wait("y", "x");

        let chains = store.dump_waiting_chains();
        assert_eq!(
            chains,
            vec![
                vec!["a".to_string(), "b".into(), "c".into()],
                vec!["x".to_string(), "y".into(), "x".into()],
            ]
        );
        assert_eq!(store.dependents_of("c"), vec!["a", "b"]);
        assert_eq!(store.dependents_of("x"), vec!["y"]);
    }
}
