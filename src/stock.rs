//! Stock modules shipped with the binary.
//!
//! - `sink`: named log destination; holds a prefix and emits lines through
//!   `tracing`.
//! - `ticker`: runnable; emits `Message` to its `Sink` every `Interval`,
//!   `Count` times or until shutdown.
//!
//! ```toml
//! [sink.main]
//! Prefix = "demo"
//!
//! [ticker.fast]
//! Interval = "500ms"
//! Count = 3
//! Sink = "!REF:sink.main"
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::assembly::populate::duration;
use crate::assembly::{Fields, Module, ModuleFuture, Registry};
use crate::error::{BoxError, PopulateError};

pub const SINK_TYPE: &str = "sink";
pub const TICKER_TYPE: &str = "ticker";

/// Register every stock module type.
pub fn register(registry: &mut Registry) -> &mut Registry {
    registry.register_default::<Sink>(SINK_TYPE).register_default::<Ticker>(TICKER_TYPE)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Sink {
    #[serde(default = "default_prefix")]
    prefix: String,
    #[serde(skip)]
    emitted: AtomicU64,
}

fn default_prefix() -> String {
    "wireup".to_string()
}

impl Sink {
    pub fn emit(&self, line: &str) {
        let n = self.emitted.fetch_add(1, Ordering::Relaxed) + 1;
        info!(sink = %self.prefix, n, "{line}");
    }

    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl Module for Sink {
    fn populate(&mut self, fields: &Fields<'_>) -> Result<(), PopulateError> {
        *self = fields.deserialize()?;
        Ok(())
    }
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ticker {
    #[serde(deserialize_with = "duration")]
    interval: Duration,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default = "default_message")]
    message: String,
    /// Read from the resolved tree; serde never sees references.
    #[serde(skip)]
    sink: Option<Arc<Sink>>,
}

fn default_message() -> String {
    "tick".to_string()
}

impl Ticker {
    pub fn sink(&self) -> Option<&Arc<Sink>> {
        self.sink.as_ref()
    }
}

impl Module for Ticker {
    fn populate(&mut self, fields: &Fields<'_>) -> Result<(), PopulateError> {
        let sink = fields.get("Sink")?;
        *self = fields.deserialize()?;
        self.sink = sink;
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), BoxError> {
        if self.interval.is_zero() {
            return Err("Interval must be greater than zero".into());
        }
        if self.count == Some(0) {
            return Err("Count must be at least 1 when set".into());
        }
        Ok(())
    }

    fn run(self: Arc<Self>, shutdown: CancellationToken) -> Option<ModuleFuture> {
        Some(Box::pin(async move {
            let mut ticks = time::interval_at(time::Instant::now() + self.interval, self.interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sent = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        sent += 1;
                        match &self.sink {
                            Some(sink) => sink.emit(&self.message),
                            None => info!(n = sent, "{}", self.message),
                        }
                        if self.count.is_some_and(|c| sent >= c) {
                            break;
                        }
                    }
                }
            }
            Ok(())
        }))
    }
}
