//! Security alert sink.
//!
//! Events go onto a bounded queue drained by a background worker, so the
//! response path never waits on, or fails because of, the alert channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::{AlertEvent, Severity};

/// Destination of alert events (log pipeline, audit store, pager, ...).
#[async_trait]
pub trait AlertWriter: Send + Sync {
    async fn write(&self, event: &AlertEvent) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct SecurityAlertSink {
    sender: mpsc::Sender<AlertEvent>,
}

impl SecurityAlertSink {
    /// Start the background worker. Must be called inside a Tokio runtime.
    pub fn spawn(writer: Arc<dyn AlertWriter>, capacity: usize, write_timeout: Duration) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AlertEvent>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match tokio::time::timeout(write_timeout, writer.write(&event)).await {
                    Ok(Ok(())) => {
                        tracing::debug!(alert_id = %event.id, "Security alert delivered");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(
                            error = %e,
                            alert_id = %event.id,
                            severity = %event.severity.as_str(),
                            "Failed to write security alert"
                        );
                    }
                    Err(_) => {
                        tracing::error!(
                            alert_id = %event.id,
                            timeout_ms = write_timeout.as_millis() as u64,
                            "Security alert write timed out"
                        );
                    }
                }
            }
            tracing::debug!("Security alert worker stopped");
        });

        Self { sender }
    }

    /// Fire-and-forget. Never blocks; a full or closed queue is logged and
    /// the event dropped.
    pub fn event(&self, module: &str, message: &str, severity: Severity, subject: &str) {
        let event = AlertEvent::new(module, message, severity, subject);
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::error!(
                    module = %event.module,
                    subject = %event.subject,
                    message = %event.message,
                    "Security alert queue full, dropping event"
                );
            }
            Err(TrySendError::Closed(event)) => {
                tracing::error!(
                    module = %event.module,
                    subject = %event.subject,
                    message = %event.message,
                    "Security alert worker gone, dropping event"
                );
            }
        }
    }
}

/// Records every event in memory. `set_failing(true)` makes writes fail.
#[derive(Default)]
pub struct MockAlertWriter {
    events: Mutex<Vec<AlertEvent>>,
    failing: AtomicBool,
}

impl MockAlertWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Poll until at least `count` events arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<AlertEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let events = self.events();
            if events.len() >= count || tokio::time::Instant::now() >= deadline {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AlertWriter for MockAlertWriter {
    async fn write(&self, event: &AlertEvent) -> Result<(), anyhow::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Alert channel unavailable"));
        }
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock alert mutex poisoned: {}", e))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_reaches_writer() {
        let writer = Arc::new(MockAlertWriter::new());
        let sink = SecurityAlertSink::spawn(writer.clone(), 8, Duration::from_secs(1));

        sink.event("mfa-service", "google auth invalid token", Severity::Warning, "alice");

        let events = writer.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0].subject, "alice");
        assert_eq!(events[0].module, "mfa-service");
    }

    #[tokio::test]
    async fn test_writer_failure_is_swallowed() {
        let writer = Arc::new(MockAlertWriter::new());
        writer.set_failing(true);
        let sink = SecurityAlertSink::spawn(writer.clone(), 8, Duration::from_secs(1));

        sink.event("mfa-service", "first", Severity::Warning, "alice");
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.set_failing(false);
        sink.event("mfa-service", "second", Severity::Info, "alice");

        let events = writer.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "second");
    }
}
