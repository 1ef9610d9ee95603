//! Opaque feed record

use chrono::{DateTime, Utc};

/// A single feed record: opaque payload plus arrival time.
///
/// The pipeline never inspects the payload; it is forwarded byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    payload: Vec<u8>,
    received_at: DateTime<Utc>,
}

impl Record {
    /// Create a record stamped with the current time.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_timestamp(payload, Utc::now())
    }

    pub fn with_timestamp(payload: impl Into<Vec<u8>>, received_at: DateTime<Utc>) -> Self {
        Self {
            payload: payload.into(),
            received_at,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl From<String> for Record {
    fn from(line: String) -> Self {
        Record::new(line)
    }
}

impl From<&str> for Record {
    fn from(line: &str) -> Self {
        Record::new(line)
    }
}
