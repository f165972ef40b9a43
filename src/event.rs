//! Domain event representation
//!
//! The canonical in-memory event and its published wire shape. The wire
//! envelope is a structured JSON document: `type`, `subject` and `action`
//! are lower-cased, `correlationid` is omitted when empty, and `data`
//! carries the JSON entity snapshot.

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical in-memory event before serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    /// Unique event id; consumers deduplicate on it
    pub id: String,
    pub subject: String,
    pub action: String,
    /// Event type, e.g. the tracked entity name
    pub event_type: String,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<String>,
    /// JSON entity snapshot
    pub data: serde_json::Value,
    /// Internal primary key of the root row
    pub primary_key: String,
}

impl EventData {
    /// Published wire envelope for this event.
    pub fn to_envelope(&self) -> PublishedEvent {
        PublishedEvent {
            event_type: self.event_type.to_lowercase(),
            source: self.source.clone(),
            id: self.id.clone(),
            time: self.timestamp,
            subject: self.subject.to_lowercase(),
            action: self.action.to_lowercase(),
            correlation_id: self
                .correlation_id
                .as_deref()
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            data_content_type: "application/json".to_string(),
            data: self.data.clone(),
        }
    }

    /// Serialized wire payload.
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.to_envelope())?))
    }
}

/// Published event wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub id: String,
    pub time: DateTime<Utc>,
    pub subject: String,
    pub action: String,
    #[serde(rename = "correlationid", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(rename = "datacontenttype")]
    pub data_content_type: String,
    pub data: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> EventData {
        EventData {
            id: "evt-1".to_string(),
            subject: "Legacy.Contact".to_string(),
            action: "Created".to_string(),
            event_type: "Contact".to_string(),
            source: Some("https://api.example.com/contacts/42".to_string()),
            timestamp: "2026-08-30T12:00:00Z".parse().unwrap(),
            correlation_id: Some("corr-1".to_string()),
            data: json!({"Name": "Alice"}),
            primary_key: "42".to_string(),
        }
    }

    #[test]
    fn test_envelope_lowercases() {
        let envelope = event().to_envelope();
        assert_eq!(envelope.event_type, "contact");
        assert_eq!(envelope.subject, "legacy.contact");
        assert_eq!(envelope.action, "created");
        assert_eq!(envelope.data_content_type, "application/json");
    }

    #[test]
    fn test_envelope_wire_fields() {
        let json = serde_json::to_value(event().to_envelope()).unwrap();
        assert_eq!(json["type"], "contact");
        assert_eq!(json["subject"], "legacy.contact");
        assert_eq!(json["action"], "created");
        assert_eq!(json["correlationid"], "corr-1");
        assert_eq!(json["datacontenttype"], "application/json");
        assert_eq!(json["data"]["Name"], "Alice");
        assert_eq!(json["time"], "2026-08-30T12:00:00Z");
    }

    #[test]
    fn test_empty_correlation_id_omitted() {
        let mut e = event();
        e.correlation_id = Some(String::new());
        let json = serde_json::to_value(e.to_envelope()).unwrap();
        assert!(json.get("correlationid").is_none());

        let mut e = event();
        e.correlation_id = None;
        let json = serde_json::to_value(e.to_envelope()).unwrap();
        assert!(json.get("correlationid").is_none());
    }

    #[test]
    fn test_payload_round_trips() {
        let payload = event().to_payload().unwrap();
        let parsed: PublishedEvent = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed.id, "evt-1");
        assert_eq!(parsed.action, "created");
    }
}
