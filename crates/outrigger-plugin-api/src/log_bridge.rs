//! Forwards a child's `tracing` events into its logging stream.
//!
//! Records pass through a bounded channel. While a consumer is attached a
//! full channel blocks the logging thread until the consumer catches up;
//! before any consumer attaches, overflow is discarded.

use crate::message::LogMessage;
use crate::transport::LogStream;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Bounded log channel shared by the layer and the stream consumers.
#[derive(Clone)]
pub struct LogBridge {
    tx: flume::Sender<LogMessage>,
    rx: flume::Receiver<LogMessage>,
    consumers: Arc<AtomicUsize>,
}

impl LogBridge {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            consumers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Layer to install in the child's subscriber.
    pub fn layer(&self) -> LogBridgeLayer {
        LogBridgeLayer {
            tx: self.tx.clone(),
            consumers: self.consumers.clone(),
        }
    }

    /// Queues a record directly, bypassing `tracing`.
    pub fn publish(&self, message: LogMessage) {
        if self.consumers.load(Ordering::Acquire) > 0 {
            let _ = self.tx.send(message);
        } else {
            let _ = self.tx.try_send(message);
        }
    }

    /// Attaches a consumer. The channel blocks producers only while at least
    /// one returned stream is alive.
    pub fn subscribe(&self) -> LogStream {
        self.consumers.fetch_add(1, Ordering::AcqRel);
        let guard = ConsumerGuard(self.consumers.clone());
        self.rx
            .clone()
            .into_stream()
            .map(move |message| {
                let _ = &guard;
                Ok(message)
            })
            .boxed()
    }

    pub fn consumers(&self) -> usize {
        self.consumers.load(Ordering::Acquire)
    }
}

struct ConsumerGuard(Arc<AtomicUsize>);

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// `tracing_subscriber` layer feeding a [`LogBridge`].
pub struct LogBridgeLayer {
    tx: flume::Sender<LogMessage>,
    consumers: Arc<AtomicUsize>,
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogBridgeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = LogMessage {
            level: metadata.level().to_string(),
            message: visitor.message,
            fields: visitor.fields,
            target: metadata.target().to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };

        if self.consumers.load(Ordering::Acquire) > 0 {
            let _ = self.tx.send(message);
        } else {
            let _ = self.tx.try_send(message);
        }
    }
}
