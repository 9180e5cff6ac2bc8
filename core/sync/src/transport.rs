//! Delivery transport abstraction.
//!
//! The central authority is reached through [`DeliveryTransport`]. The
//! engine never talks to a remote directly; it hands an [`Envelope`] to the
//! transport and bounds the call with a timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use storesync_common::{Error, Operation, OutboxEntry, Payload, Priority, QueueEntry, Result};

/// Which store an envelope was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeSource {
    Outbox,
    Queue,
}

/// One event on its way to the central authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: EnvelopeSource,
    pub id: i64,
    pub event_type: String,
    pub entity_id: Option<String>,
    pub operation: Option<Operation>,
    pub priority: Option<Priority>,
    pub version: Option<u32>,
    pub payload: Payload,
}

impl Envelope {
    pub fn from_outbox(entry: &OutboxEntry) -> Self {
        Self {
            source: EnvelopeSource::Outbox,
            id: entry.id,
            event_type: entry.entity_type.to_string(),
            entity_id: Some(entry.entity_id.clone()),
            operation: Some(entry.operation),
            priority: Some(entry.priority),
            version: Some(entry.version),
            payload: entry.payload.clone(),
        }
    }

    pub fn from_queue(entry: &QueueEntry) -> Self {
        Self {
            source: EnvelopeSource::Queue,
            id: entry.id,
            event_type: entry.event_type.clone(),
            entity_id: None,
            operation: None,
            priority: None,
            version: None,
            payload: entry.payload.clone(),
        }
    }
}

/// Sends events to the central authority.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// Deliver one envelope.
    ///
    /// # Errors
    /// - `Transport` if the remote rejected or could not be reached
    async fn deliver(&self, envelope: &Envelope) -> Result<()>;
}

/// Deliver with a hard upper bound on the call duration.
///
/// # Errors
/// - `Timeout` if `timeout` elapses first
/// - whatever the transport returned otherwise
pub async fn deliver_with_timeout(
    transport: &dyn DeliveryTransport,
    envelope: &Envelope,
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, transport.deliver(envelope)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "delivery timed out after {}s",
            timeout.as_secs_f64()
        ))),
    }
}

/// Accepts every envelope.
///
/// Used when no remote authority is wired: delivery reduces to marking
/// entries as sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackTransport;

impl LoopbackTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeliveryTransport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn deliver(&self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }
}

/// Scripted outcome for one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Reject(String),
    Stall(Duration),
}

/// Transport with scripted outcomes per event type that remembers what it
/// accepted.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    outcomes: Mutex<HashMap<String, Outcome>>,
    delivered: Mutex<Vec<Envelope>>,
}

impl RecordingTransport {
    /// Transport that accepts everything until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome for an event type.
    pub fn script(&self, event_type: impl Into<String>, outcome: Outcome) {
        let mut outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        outcomes.insert(event_type.into(), outcome);
    }

    /// Builder form of [`script`](Self::script).
    pub fn with_outcome(self, event_type: impl Into<String>, outcome: Outcome) -> Self {
        self.script(event_type, outcome);
        self
    }

    /// Envelopes accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<Envelope> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn outcome_for(&self, event_type: &str) -> Outcome {
        let outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        outcomes.get(event_type).cloned().unwrap_or(Outcome::Accept)
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<()> {
        match self.outcome_for(&envelope.event_type) {
            Outcome::Accept => {}
            Outcome::Reject(message) => return Err(Error::Transport(message)),
            Outcome::Stall(duration) => tokio::time::sleep(duration).await,
        }
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use storesync_common::{EntityType, NewOutboxEntry};

    fn envelope(event_type: &str) -> Envelope {
        let entry = NewOutboxEntry {
            entity_type: EntityType::new(event_type).unwrap(),
            entity_id: "X1".to_string(),
            operation: Operation::Create,
            payload: json!({"qty": 1}),
            priority: Priority::High,
            conflict_flag: false,
            version: 3,
            created_at: Utc::now(),
        }
        .into_entry(11);
        Envelope::from_outbox(&entry)
    }

    #[test]
    fn test_envelope_from_outbox() {
        let env = envelope("sale");
        assert_eq!(env.source, EnvelopeSource::Outbox);
        assert_eq!(env.event_type, "sale");
        assert_eq!(env.version, Some(3));
        assert_eq!(env.entity_id.as_deref(), Some("X1"));
    }

    #[tokio::test]
    async fn test_loopback_accepts() {
        let transport = LoopbackTransport::new();
        let result = deliver_with_timeout(&transport, &envelope("sale"), Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_recording_outcomes() {
        let transport = RecordingTransport::new()
            .with_outcome("transfer", Outcome::Reject("503 from hq".to_string()));

        deliver_with_timeout(&transport, &envelope("sale"), Duration::from_secs(1))
            .await
            .unwrap();
        let err = deliver_with_timeout(&transport, &envelope("transfer"), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transport(ref m) if m == "503 from hq"));
        assert_eq!(transport.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_stall_times_out() {
        let transport = RecordingTransport::new()
            .with_outcome("sale", Outcome::Stall(Duration::from_secs(5)));
        let err = deliver_with_timeout(&transport, &envelope("sale"), Duration::from_millis(20))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(ref m) if m.starts_with("delivery timed out after")));
        assert!(transport.delivered().is_empty());
    }
}
