//! Wire contract between the page, background and popup contexts.
//!
//! Contexts never share memory. Every message is serialized to JSON before it
//! crosses a [`Port`] and every reply comes back the same way, so anything sent
//! here must survive a round trip through `serde_json`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// A work item observed on a tracked page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemRef {
    #[serde(default, deserialize_with = "id_from_number_or_string")]
    pub id: u32,
    /// Best effort; empty when the page had not rendered it yet.
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_at: Option<DateTime<Utc>>,
}

impl WorkItemRef {
    pub fn new(id: u32, organization: &str, project: &str) -> Self {
        Self {
            id,
            title: String::new(),
            organization: organization.to_string(),
            project: project.to_string(),
            url: None,
            observed_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Only complete refs may be stored or reconciled.
    pub fn is_complete(&self) -> bool {
        self.id > 0 && !self.organization.trim().is_empty() && !self.project.trim().is_empty()
    }

    /// Title to show the user, falling back to the id.
    pub fn display_title(&self) -> String {
        if self.title.trim().is_empty() {
            format!("Work Item {}", self.id)
        } else {
            self.title.clone()
        }
    }
}

// Pages occasionally hand over the id as a string ("4821").
pub(crate) fn id_from_number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(n) => u32::try_from(n).map_err(serde::de::Error::custom),
        RawId::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Detector -> Relay
    WorkItemDetected {
        #[serde(rename = "workItem")]
        work_item: WorkItemRef,
    },
    /// Detector -> Relay
    ClearWorkItem,
    /// Reconciler -> Relay, replied with the ref or `null`
    GetCurrentWorkItem,
    /// Relay -> Detector
    RunDetection,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::WorkItemDetected { .. } => "WORK_ITEM_DETECTED",
            Message::ClearWorkItem => "CLEAR_WORK_ITEM",
            Message::GetCurrentWorkItem => "GET_CURRENT_WORK_ITEM",
            Message::RunDetection => "RUN_DETECTION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub const OK: Ack = Ack { success: true };
    pub const REJECTED: Ack = Ack { success: false };
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no listener in the receiving context")]
    NoListener,
    #[error("receiving context dropped the message without replying")]
    NoReply,
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A message in flight, still in its serialized form.
#[derive(Debug)]
pub struct Envelope {
    pub payload: String,
    reply: oneshot::Sender<String>,
}

impl Envelope {
    pub fn message(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Send the reply back. A sender that stopped waiting is not an error.
    pub fn respond<T: Serialize>(self, reply: &T) {
        match serde_json::to_string(reply) {
            Ok(raw) => {
                let _ = self.reply.send(raw);
            }
            Err(e) => tracing::warn!("failed to serialize reply: {e}"),
        }
    }
}

/// Sending half of a context's inbox.
#[derive(Debug, Clone)]
pub struct Port {
    tx: mpsc::Sender<Envelope>,
}

impl Port {
    pub fn channel(capacity: usize) -> (Port, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Port { tx }, rx)
    }

    /// Send a message and wait for the receiving context to answer.
    pub async fn request<T: DeserializeOwned>(&self, message: &Message) -> Result<T, DeliveryError> {
        self.request_raw(serde_json::to_string(message)?).await
    }

    /// Send an already serialized payload; the receiver validates it.
    pub async fn request_raw<T: DeserializeOwned>(&self, payload: String) -> Result<T, DeliveryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Envelope { payload, reply: reply_tx })
            .await
            .map_err(|_| DeliveryError::NoListener)?;
        let raw = reply_rx.await.map_err(|_| DeliveryError::NoReply)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detected_message_wire_shape() {
        let msg = Message::WorkItemDetected {
            work_item: WorkItemRef::new(4821, "Contoso", "WebApp").with_title("Fix login bug"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "WORK_ITEM_DETECTED",
                "workItem": {
                    "id": 4821,
                    "title": "Fix login bug",
                    "organization": "Contoso",
                    "project": "WebApp"
                }
            })
        );
    }

    #[test]
    fn test_unit_messages_carry_only_type() {
        assert_eq!(
            serde_json::to_value(Message::ClearWorkItem).unwrap(),
            json!({"type": "CLEAR_WORK_ITEM"})
        );
        let parsed: Message = serde_json::from_str(r#"{"type":"GET_CURRENT_WORK_ITEM"}"#).unwrap();
        assert_eq!(parsed, Message::GetCurrentWorkItem);
        assert_eq!(parsed.kind(), "GET_CURRENT_WORK_ITEM");
    }

    #[test]
    fn test_string_id_is_coerced() {
        let item: WorkItemRef =
            serde_json::from_str(r#"{"id":"77","organization":"o","project":"p"}"#).unwrap();
        assert_eq!(item.id, 77);
        assert!(item.is_complete());
    }

    #[test]
    fn test_observed_at_uses_epoch_millis() {
        let item: WorkItemRef = serde_json::from_str(
            r#"{"id":1,"organization":"o","project":"p","observedAt":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(item.observed_at.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_incomplete_refs() {
        assert!(!WorkItemRef::new(0, "o", "p").is_complete());
        assert!(!WorkItemRef::new(1, "", "p").is_complete());
        assert!(!WorkItemRef::new(1, "o", "  ").is_complete());
        let missing_id: WorkItemRef =
            serde_json::from_str(r#"{"organization":"o","project":"p"}"#).unwrap();
        assert!(!missing_id.is_complete());
    }

    #[test]
    fn test_display_title_falls_back_to_id() {
        assert_eq!(WorkItemRef::new(9, "o", "p").display_title(), "Work Item 9");
        assert_eq!(WorkItemRef::new(9, "o", "p").with_title("X").display_title(), "X");
    }

    #[tokio::test]
    async fn test_request_without_listener_fails() {
        let (port, rx) = Port::channel(1);
        drop(rx);
        assert!(!port.is_connected());
        let err = port.request::<Ack>(&Message::ClearWorkItem).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NoListener));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (port, mut rx) = Port::channel(1);
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                assert_eq!(envelope.message().unwrap(), Message::RunDetection);
                envelope.respond(&Ack::OK);
            }
        });
        let ack: Ack = port.request(&Message::RunDetection).await.unwrap();
        assert!(ack.success);
    }

    #[tokio::test]
    async fn test_dropped_envelope_is_no_reply() {
        let (port, mut rx) = Port::channel(1);
        tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        let err = port.request::<Ack>(&Message::ClearWorkItem).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NoReply));
    }
}
