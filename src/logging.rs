//! Tracing setup and forwarding of log events into the Task Store.
//!
//! Everything is written to stderr so stdout stays reserved for the
//! discovery sentinels. [`StoreLogLayer`] additionally queues events at
//! or above a threshold; once a sink is available a shipper task drains
//! the queue in batches.

use std::fmt::Write as _;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::client::CoordinationClient;
use crate::domain::NewLogRecord;

/// Most records written per store call
pub const BATCH_SIZE: usize = 50;

/// Targets whose events are never forwarded (the shipping path itself)
const SKIPPED_TARGETS: &[&str] = &["lectern::client"];

/// Install the global subscriber: `RUST_LOG` filter (default `info`),
/// compact stderr output, and optionally the store layer
pub fn init_tracing(store_layer: Option<StoreLogLayer>) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(store_layer)
        .init();
}

/// Where batches of log records end up
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn write_batch(&self, records: &[NewLogRecord]) -> Result<()>;
}

#[async_trait]
impl LogSink for CoordinationClient {
    async fn write_batch(&self, records: &[NewLogRecord]) -> Result<()> {
        self.add_system_logs(records).await?;
        Ok(())
    }
}

/// Receiving end of a [`StoreLogLayer`]; records buffer here until shipped
pub struct LogReceiver(mpsc::UnboundedReceiver<NewLogRecord>);

/// Captures tracing events as [`NewLogRecord`]s
pub struct StoreLogLayer {
    source: String,
    threshold: Level,
    tx: mpsc::UnboundedSender<NewLogRecord>,
}

impl StoreLogLayer {
    pub fn new(source: impl Into<String>, threshold: Level) -> (Self, LogReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let layer = Self {
            source: source.into(),
            threshold,
            tx,
        };
        (layer, LogReceiver(rx))
    }
}

impl<S: Subscriber> Layer<S> for StoreLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // more verbose levels compare greater
        if *metadata.level() > self.threshold {
            return;
        }
        if SKIPPED_TARGETS.iter().any(|t| metadata.target().starts_with(t)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = NewLogRecord {
            source: self.source.clone(),
            level: metadata.level().as_str().to_string(),
            message: visitor.finish(),
            timestamp: Some(Utc::now()),
        };
        // receiver gone means shipping stopped; drop quietly
        let _ = self.tx.send(record);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Drain the receiver into `sink` until every sender is gone.
/// Failures go to stderr directly so they cannot feed back into tracing.
pub fn spawn_shipper<K: LogSink>(receiver: LogReceiver, sink: K) -> JoinHandle<()> {
    let LogReceiver(mut rx) = receiver;
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = Vec::with_capacity(BATCH_SIZE);
            batch.push(first);
            while batch.len() < BATCH_SIZE {
                match rx.try_recv() {
                    Ok(record) => batch.push(record),
                    Err(_) => break,
                }
            }
            if let Err(e) = sink.write_batch(&batch).await {
                eprintln!("Failed to ship {} log records: {e:#}", batch.len());
            }
        }
    })
}
