use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frame discriminator that carries a deliverable notification.
pub const NOTIFICATION_FRAME_TYPE: &str = "notification";

/// Raw inbound frame as sent by the realtime service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl InboundFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Builds a notification frame wrapping `data`.
    pub fn notification(data: Value) -> Self {
        Self {
            kind: NOTIFICATION_FRAME_TYPE.to_string(),
            data: Some(data),
        }
    }

    /// Extracts the notification payload, if this frame carries one.
    pub fn into_notification(self) -> Option<NotificationEvent> {
        if self.kind != NOTIFICATION_FRAME_TYPE {
            return None;
        }
        self.data.map(NotificationEvent::new)
    }
}

/// Notification payload forwarded verbatim to listeners.
///
/// The channel never looks inside the record; listeners own its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    data: Value,
}

impl NotificationEvent {
    pub fn new(data: Value) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn into_inner(self) -> Value {
        self.data
    }

    /// Deserializes the payload into a listener-defined record.
    pub fn decode<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.data)
    }
}

/// Outcome of decoding one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Notification(NotificationEvent),
    /// Well-formed frame that carries nothing to deliver.
    Ignored { kind: String },
    /// Payload was not a valid frame.
    Malformed { reason: String },
}

/// Decodes a text frame without ever failing the caller.
pub fn decode_frame(text: &str) -> FrameOutcome {
    let frame = match InboundFrame::from_text(text) {
        Ok(frame) => frame,
        Err(err) => {
            return FrameOutcome::Malformed {
                reason: err.to_string(),
            }
        }
    };

    let kind = frame.kind.clone();
    match frame.into_notification() {
        Some(event) => FrameOutcome::Notification(event),
        None => FrameOutcome::Ignored { kind },
    }
}
