//! Runner scenarios on assembled documents.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wireup::assembly::{Assembler, Assembly, Fields, Module, ModuleFuture, Registry, runner};
use wireup::error::{BoxError, PopulateError, RunError};
use wireup::{Document, stock};

/// Runs until shutdown, counting how many times it was started.
#[derive(Default)]
struct Service {
    starts: AtomicUsize,
    stopped: AtomicUsize,
}

impl Module for Service {
    fn run(self: Arc<Self>, shutdown: CancellationToken) -> Option<ModuleFuture> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Some(Box::pin(async move {
            shutdown.cancelled().await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }
}

/// Fails after `After`, or panics when `Panic` is set.
#[derive(Default)]
struct Faulty {
    after: Duration,
    panic: bool,
}

impl Module for Faulty {
    fn populate(&mut self, fields: &Fields<'_>) -> Result<(), PopulateError> {
        self.after = fields.get_or("After", Duration::from_millis(10))?;
        self.panic = fields.parse_or("Panic", false)?;
        Ok(())
    }

    fn run(self: Arc<Self>, _shutdown: CancellationToken) -> Option<ModuleFuture> {
        Some(Box::pin(async move {
            tokio::time::sleep(self.after).await;
            if self.panic {
                panic!("faulty module gave up");
            }
            Err("backend unreachable".into())
        }))
    }
}

#[derive(Default)]
struct Passive;
impl Module for Passive {}

/// Never looks at the shutdown token.
#[derive(Default)]
struct Stubborn;

impl Module for Stubborn {
    fn run(self: Arc<Self>, _shutdown: CancellationToken) -> Option<ModuleFuture> {
        Some(Box::pin(std::future::pending::<Result<(), BoxError>>()))
    }
}

async fn assemble(document: Value) -> Assembly {
    let mut reg = Registry::new();
    stock::register(&mut reg);
    reg.register_default::<Service>("service")
        .register_default::<Faulty>("faulty")
        .register_default::<Passive>("passive")
        .register_default::<Stubborn>("stubborn");
    let doc = Document::from_value(document).unwrap();
    Assembler::new(Arc::new(reg)).assemble(&doc).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_error_cancels_siblings() {
    let assembly = assemble(json!({
        "service": {"a": {}, "b": {}},
        "faulty": {"f": {"After": "1s"}}
    }))
    .await;
    let shutdown = CancellationToken::new();

    let err = runner::run(&assembly, shutdown.clone()).await.unwrap_err();
    match &err {
        RunError::Failed { name, source } => {
            assert_eq!(name, "faulty.f");
            assert!(source.to_string().contains("backend unreachable"));
        }
        other => panic!("expected failure, got {other}"),
    }
    assert!(shutdown.is_cancelled());
    for name in ["service.a", "service.b"] {
        let s = assembly.get::<Service>(name).unwrap();
        assert_eq!(s.stopped.load(Ordering::SeqCst), 1, "{name} should have drained");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_reported() {
    let assembly = assemble(json!({
        "service": {"a": {}},
        "faulty": {"p": {"Panic": true}}
    }))
    .await;
    let err = runner::run(&assembly, CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(&err, RunError::Panicked { name, message } if name == "faulty.p" && message.contains("gave up")),
        "{err}"
    );
}

#[tokio::test]
async fn test_aliased_module_starts_once() {
    let assembly = assemble(json!({
        "alias": [{"name": "service.a", "alias": "primary"}],
        "service": {"a": {}},
        "passive": {"p": {}}
    }))
    .await;
    let shutdown = CancellationToken::new();
    let run = tokio::spawn({
        let assembly = assembly.clone();
        let shutdown = shutdown.clone();
        async move { runner::run(&assembly, shutdown).await }
    });

    let service = assembly.get::<Service>("service.a").unwrap();
    while service.starts.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    shutdown.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(service.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_list_selects_modules() {
    let assembly = assemble(json!({
        "run": ["service.b"],
        "service": {"a": {}, "b": {}}
    }))
    .await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    runner::run(&assembly, shutdown).await.unwrap();

    assert_eq!(assembly.get::<Service>("service.a").unwrap().starts.load(Ordering::SeqCst), 0);
    assert_eq!(assembly.get::<Service>("service.b").unwrap().starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_list_rejects_bad_names() {
    let assembly = assemble(json!({
        "run": ["passive.p"],
        "passive": {"p": {}}
    }))
    .await;
    let err = runner::run(&assembly, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RunError::NotRunnable(name) if name == "passive.p"));

    let assembly = assemble(json!({"run": ["service.ghost"], "service": {"a": {}}})).await;
    let err = runner::run(&assembly, CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RunError::Missing(name) if name == "service.ghost"));
}

#[tokio::test(start_paused = true)]
async fn test_tickers_share_referenced_sink() {
    let assembly = assemble(json!({
        "sink": {"main": {"Prefix": "test"}},
        "ticker": {
            "a": {"Interval": "100ms", "Count": 3, "Sink": "!REF:sink.main"},
            "b": {"Interval": 250, "Count": 2, "Sink": "!REF:sink.main"}
        }
    }))
    .await;

    runner::run(&assembly, CancellationToken::new()).await.unwrap();
    assert_eq!(assembly.get::<stock::Sink>("sink.main").unwrap().emitted(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_module_ignoring_shutdown_is_aborted_after_grace() {
    let assembly = assemble(json!({
        "stubborn": {"s": {}},
        "faulty": {"f": {"After": "1s"}}
    }))
    .await;
    let started = tokio::time::Instant::now();

    let err = runner::run_with_grace(&assembly, CancellationToken::new(), Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(&err, RunError::Failed { name, .. } if name == "faulty.f"), "{err}");
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_external_shutdown_aborts_stragglers() {
    let assembly = assemble(json!({"stubborn": {"s": {}}, "service": {"a": {}}})).await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    runner::run_with_grace(&assembly, shutdown, Duration::from_millis(500)).await.unwrap();
    let service = assembly.get::<Service>("service.a").unwrap();
    assert_eq!(service.stopped.load(Ordering::SeqCst), 1);
}
