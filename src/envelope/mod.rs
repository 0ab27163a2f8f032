//! Envelope - the immutable event record.
//!
//! Every event published on the bus is an [`Envelope`]. Callers build an
//! [`EnvelopeDraft`]; the bus seals it (fills the timestamp, validates the
//! type) and from then on only hands out `Arc<Envelope>`.
//!
//! Fields:
//! - **type**: hierarchical, colon-delimited (`module:audio:activated`)
//! - **source_id**: who published it
//! - **payload / metadata**: opaque JSON
//! - **essence_labels**: semantic tags used for label-filtered routing
//! - **correlation_id**: set on request/response traffic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::types::{CorrelationId, EnvelopeId, Result};

pub mod pattern;

pub use pattern::{has_segment_prefix, root_segment, validate_event_type, EventPattern};

/// A published event. Immutable: no setters, shared as `Arc<Envelope>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EnvelopeId,
    #[serde(rename = "type")]
    event_type: String,
    source_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    essence_labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
}

impl Envelope {
    /// Start building an envelope.
    pub fn draft(event_type: impl Into<String>, source_id: impl Into<String>) -> EnvelopeDraft {
        EnvelopeDraft::new(event_type, source_id)
    }

    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn essence_labels(&self) -> &BTreeSet<String> {
        &self.essence_labels
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Whether the envelope carries `label`.
    pub fn has_label(&self, label: &str) -> bool {
        self.essence_labels.contains(label)
    }

    /// Whether any of `labels` is carried.
    pub fn has_any_label(&self, labels: &BTreeSet<String>) -> bool {
        labels.iter().any(|l| self.essence_labels.contains(l))
    }
}

/// Unsealed envelope. Timestamp is optional until publish.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeDraft {
    event_type: String,
    source_id: String,
    timestamp: Option<DateTime<Utc>>,
    payload: Value,
    metadata: Value,
    essence_labels: BTreeSet<String>,
    correlation_id: Option<CorrelationId>,
}

impl EnvelopeDraft {
    pub fn new(event_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.essence_labels.insert(label.into());
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.essence_labels.extend(labels.into_iter().map(Into::into));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Validate and freeze. Missing timestamps become `now`.
    pub(crate) fn seal(self, now: DateTime<Utc>) -> Result<Envelope> {
        validate_event_type(&self.event_type)?;
        Ok(Envelope {
            id: EnvelopeId::new(),
            event_type: self.event_type,
            source_id: self.source_id,
            timestamp: self.timestamp.unwrap_or(now),
            payload: self.payload,
            metadata: self.metadata,
            essence_labels: self.essence_labels,
            correlation_id: self.correlation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_seal_fills_timestamp() {
        let now = Utc::now();
        let env = Envelope::draft("ui:click", "button").seal(now).unwrap();
        assert_eq!(env.timestamp(), now);
        assert_eq!(env.event_type(), "ui:click");
        assert_eq!(env.source_id(), "button");
        assert!(env.correlation_id().is_none());
    }

    #[test]
    fn test_seal_keeps_explicit_timestamp() {
        let earlier = Utc::now() - Duration::seconds(30);
        let env = Envelope::draft("ui:click", "button")
            .with_timestamp(earlier)
            .seal(Utc::now())
            .unwrap();
        assert_eq!(env.timestamp(), earlier);
    }

    #[test]
    fn test_seal_rejects_empty_type() {
        assert!(Envelope::draft("", "src").seal(Utc::now()).is_err());
    }

    #[test]
    fn test_labels() {
        let env = Envelope::draft("a:b", "src")
            .with_label("calm")
            .with_labels(["focus", "night"])
            .seal(Utc::now())
            .unwrap();
        assert!(env.has_label("focus"));
        let filter: BTreeSet<String> = ["night".to_string(), "loud".to_string()].into();
        assert!(env.has_any_label(&filter));
        let miss: BTreeSet<String> = ["loud".to_string()].into();
        assert!(!env.has_any_label(&miss));
    }

    #[test]
    fn test_serializes_type_field() {
        let env = Envelope::draft("a:b", "src")
            .with_payload(serde_json::json!({"n": 1}))
            .seal(Utc::now())
            .unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "a:b");
        assert_eq!(json["payload"]["n"], 1);
        assert!(json.get("correlation_id").is_none());
    }
}
