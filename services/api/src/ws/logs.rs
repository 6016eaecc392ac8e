//! Log Broadcast Channel: mirrors lifecycle events to the one attached observer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Dotted event name, e.g. `connection.accepted`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEvent {
    pub fn new(level: LogLevel, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            kind: kind.into(),
            call_id: None,
            message: message.into(),
            data: None,
        }
    }

    pub fn info(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, kind, message)
    }

    pub fn warn(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, kind, message)
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, kind, message)
    }

    pub fn with_call(mut self, call_id: Option<&str>) -> Self {
        self.call_id = call_id.map(str::to_string);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

struct Observer {
    conn_id: Uuid,
    tx: mpsc::Sender<LogEvent>,
}

/// Fan-out point for [`LogEvent`]s. Cloning shares the same observer slot.
#[derive(Clone, Default)]
pub struct LogChannel {
    observer: Arc<Mutex<Option<Observer>>>,
}

impl LogChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `tx` as the observer, replacing any previous one.
    pub fn attach(&self, conn_id: Uuid, tx: mpsc::Sender<LogEvent>) {
        *self.observer.lock() = Some(Observer { conn_id, tx });
    }

    /// Removes the observer only if `conn_id` still owns the slot.
    pub fn detach(&self, conn_id: Uuid) -> bool {
        let mut slot = self.observer.lock();
        match slot.as_ref() {
            Some(observer) if observer.conn_id == conn_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Connection id of the attached observer.
    pub fn observer_id(&self) -> Option<Uuid> {
        self.observer.lock().as_ref().map(|o| o.conn_id)
    }

    pub fn has_observer(&self) -> bool {
        self.observer.lock().is_some()
    }

    /// Delivers the event to the observer, or drops it.
    ///
    /// Never waits: a full or closed observer queue loses the event.
    pub fn publish(&self, event: LogEvent) {
        let slot = self.observer.lock();
        match slot.as_ref() {
            Some(observer) => {
                if let Err(e) = observer.tx.try_send(event) {
                    trace!(error = %e, "Log observer did not take event");
                }
            }
            None => trace!(kind = %event.kind, "No log observer attached"),
        }
    }
}
