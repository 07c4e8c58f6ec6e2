//! Standard Webhooks envelope codec.
//!
//! An envelope is the JSON body `{type, timestamp, data}`:
//! - `type` is a full-stop delimited event type such as `user.created`,
//! - `timestamp` is RFC 3339 (with or without fractional seconds),
//! - `data` is arbitrary JSON.
//!
//! Event types are matched against route filters with exact or `prefix.*`
//! wildcard semantics.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unmarshaling payload: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("type is required")]
    MissingType,

    #[error("type must be hierarchical and contain only [A-Za-z0-9_.]: {0}")]
    InvalidType(String),

    #[error("timestamp is required")]
    ZeroTimestamp,

    #[error("parsing timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("event type cannot be empty")]
    EmptyEventType,
}

/// A validated Standard Webhooks payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Full-stop delimited event type, e.g. `invoice.paid`.
    pub event_type: String,
    /// When the event occurred at the producer.
    pub timestamp: DateTime<Utc>,
    /// Event data, opaque to the relay.
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Result<Self, PayloadError> {
        let envelope = Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            data,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Parse and validate raw JSON bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, PayloadError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.event_type.is_empty() {
            return Err(PayloadError::MissingType);
        }
        if !is_valid_event_type(&self.event_type) {
            return Err(PayloadError::InvalidType(self.event_type.clone()));
        }
        if is_zero_timestamp(self.timestamp) {
            return Err(PayloadError::ZeroTimestamp);
        }
        Ok(())
    }

    /// Canonical minified JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Whether this envelope's type passes the given filter list.
    ///
    /// An empty list accepts everything.
    pub fn matches_event_type(&self, patterns: &[String]) -> bool {
        matches_event_type(&self.event_type, patterns)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(rename = "type")]
            event_type: &'a str,
            timestamp: String,
            data: &'a serde_json::Value,
        }

        Wire {
            event_type: &self.event_type,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            data: &self.data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(rename = "type")]
            event_type: String,
            timestamp: String,
            data: serde_json::Value,
        }

        let wire = Wire::deserialize(deserializer)?;
        let timestamp = DateTime::parse_from_rfc3339(&wire.timestamp)
            .map_err(|e| D::Error::custom(format!("parsing timestamp: {e}")))?
            .with_timezone(&Utc);

        Ok(Envelope {
            event_type: wire.event_type,
            timestamp,
            data: wire.data,
        })
    }
}

/// The uninitialized-instant sentinel, 0001-01-01T00:00:00Z. Producers that
/// serialize a never-set timestamp emit exactly this value; any real
/// timestamp, including the Unix epoch, is accepted.
fn is_zero_timestamp(timestamp: DateTime<Utc>) -> bool {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).single() == Some(timestamp)
}

/// Check an event type against the hierarchical grammar: one or more
/// `[A-Za-z0-9_]+` segments joined by full stops, no wildcard.
pub fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty()
        && event_type.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

/// Validate a filter pattern, which may carry a trailing `.*` wildcard.
pub fn validate_pattern(pattern: &str) -> Result<(), PayloadError> {
    if pattern.is_empty() {
        return Err(PayloadError::EmptyEventType);
    }

    let base = pattern.strip_suffix(".*").unwrap_or(pattern);
    if !is_valid_event_type(base) {
        return Err(PayloadError::InvalidType(pattern.to_string()));
    }
    Ok(())
}

/// Match an event type against a filter list.
///
/// A pattern matches when it equals the type exactly, or when it ends in `.*`
/// and the type extends its prefix by at least one segment: `user.*` matches
/// `user.created` and `user.a.b` but not `user` or `username.x`.
pub fn matches_event_type(event_type: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }

    patterns.iter().any(|pattern| {
        if pattern == event_type {
            return true;
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) if !prefix.is_empty() => {
                event_type.len() > prefix.len() + 1
                    && event_type.starts_with(prefix)
                    && event_type.as_bytes()[prefix.len()] == b'.'
            }
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_valid_envelope() {
        let raw = br#"{"type":"user.created","timestamp":"2024-01-01T12:00:00Z","data":{"id":1}}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.event_type, "user.created");
        assert_eq!(envelope.data, json!({"id": 1}));
    }

    #[test]
    fn parse_accepts_nano_precision() {
        let raw =
            br#"{"type":"order.shipped","timestamp":"2024-01-01T12:00:00.123456789Z","data":[]}"#;
        assert!(Envelope::parse(raw).is_ok());
    }

    #[test]
    fn parse_rejects_missing_fields() {
        assert!(Envelope::parse(br#"{"timestamp":"2024-01-01T12:00:00Z","data":{}}"#).is_err());
        assert!(Envelope::parse(br#"{"type":"user.created","data":{}}"#).is_err());
        assert!(Envelope::parse(br#"{"type":"user.created","timestamp":"2024-01-01T12:00:00Z"}"#)
            .is_err());
    }

    #[test]
    fn parse_rejects_bad_types() {
        for bad in ["user..created", ".user", "user.", "user created", "user.*"] {
            let raw = format!(
                r#"{{"type":"{bad}","timestamp":"2024-01-01T12:00:00Z","data":{{}}}}"#
            );
            assert!(Envelope::parse(raw.as_bytes()).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn parse_rejects_garbage_timestamp() {
        let raw = br#"{"type":"a.b","timestamp":"yesterday","data":{}}"#;
        assert!(matches!(
            Envelope::parse(raw),
            Err(PayloadError::Parse(_))
        ));
    }

    #[test]
    fn parse_accepts_epoch_timestamp() {
        // The Unix epoch is a legitimate timestamp, not the zero sentinel.
        let raw = br#"{"type":"a.b","timestamp":"1970-01-01T00:00:00Z","data":{}}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.timestamp.timestamp(), 0);
    }

    #[test]
    fn parse_rejects_zero_instant_timestamp() {
        let raw = br#"{"type":"a.b","timestamp":"0001-01-01T00:00:00Z","data":{}}"#;
        assert!(matches!(
            Envelope::parse(raw),
            Err(PayloadError::ZeroTimestamp)
        ));
    }

    #[test]
    fn serialization_is_minified() {
        let envelope = Envelope::new("user.created", json!({"id": 7})).unwrap();
        let bytes = envelope.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with(r#"{"type":"user.created","timestamp":"#));
        assert!(!text.contains(' '));
    }

    #[test]
    fn wildcard_matching() {
        let patterns = vec!["user.*".to_string()];
        assert!(matches_event_type("user.created", &patterns));
        assert!(matches_event_type("user.a.b", &patterns));
        assert!(!matches_event_type("user", &patterns));
        assert!(!matches_event_type("username.created", &patterns));
        assert!(!matches_event_type("account.user", &patterns));
    }

    #[test]
    fn exact_matching_and_empty_filter() {
        assert!(matches_event_type("a.b", &[]));
        assert!(matches_event_type("a.b", &["a.b".to_string()]));
        assert!(!matches_event_type("a.b", &["a.c".to_string()]));
    }

    #[test]
    fn pattern_validation() {
        assert!(validate_pattern("user.created").is_ok());
        assert!(validate_pattern("user.*").is_ok());
        assert!(validate_pattern("user").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern(".*").is_err());
        assert!(validate_pattern("user..*").is_err());
        assert!(validate_pattern("us er.*").is_err());
    }
}
