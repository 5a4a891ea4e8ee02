//! Document envelope
//!
//! User fields are stored flattened next to the bookkeeping fields
//! `_rev`, `_deleted`, `_meta` and `_attachments`.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Bookkeeping metadata of a stored document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Last write time in milliseconds (two decimals of resolution)
    #[serde(default)]
    pub lwt: f64,
    /// Plugin-owned metadata
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Attachment metadata, optionally carrying base64 payload on writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentData {
    /// `sha256-<base64>` digest of the payload
    pub digest: String,
    /// Payload length in bytes
    pub length: u64,
    /// MIME type
    #[serde(rename = "type")]
    pub content_type: String,
    /// Base64 payload, only present on write rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl AttachmentData {
    /// Copy without the payload
    pub fn stub(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }
}

/// A stored document: user fields plus bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentData {
    /// User fields, including the primary key
    #[serde(flatten)]
    pub data: Map<String, Value>,
    /// `<height>-<hash>` revision
    #[serde(rename = "_rev", default)]
    pub rev: String,
    /// Soft-delete flag
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
    /// Write metadata
    #[serde(rename = "_meta", default)]
    pub meta: DocumentMeta,
    /// Attachment metadata keyed by attachment id
    #[serde(rename = "_attachments", default)]
    pub attachments: BTreeMap<String, AttachmentData>,
}

impl DocumentData {
    /// Wrap user fields into an envelope with empty bookkeeping
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    /// Parse a full envelope from JSON
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(Error::validation(format!(
                "document must be a JSON object, got {other}"
            ))),
        }
    }

    /// Serialize the full envelope to JSON
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// User fields only, as a JSON object
    pub fn user_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Primary key value stored under `primary_path`
    pub fn primary(&self, primary_path: &str) -> Option<&str> {
        self.data.get(primary_path).and_then(Value::as_str)
    }

    /// Resolve a dotted path, including `_deleted`, `_rev` and `_meta.lwt`
    pub fn get_path(&self, path: &str) -> Option<Cow<'_, Value>> {
        match path {
            "_deleted" => Some(Cow::Owned(Value::Bool(self.deleted))),
            "_rev" => Some(Cow::Owned(Value::String(self.rev.clone()))),
            "_meta.lwt" => Some(Cow::Owned(Value::from(self.meta.lwt))),
            _ => {
                let (head, rest) = match path.split_once('.') {
                    Some((head, rest)) => (head, Some(rest)),
                    None => (path, None),
                };
                let root = self.data.get(head)?;
                match rest {
                    Some(rest) => get_value_path(root, rest).map(Cow::Borrowed),
                    None => Some(Cow::Borrowed(root)),
                }
            }
        }
    }

    /// Remove attachment payloads, keeping metadata
    pub fn strip_attachment_data(&mut self) {
        for attachment in self.attachments.values_mut() {
            attachment.data = None;
        }
    }

    /// Copy with attachment payloads removed
    pub fn without_attachment_data(&self) -> Self {
        let mut doc = self.clone();
        doc.strip_attachment_data();
        doc
    }

    /// Whether both envelopes carry the same user-visible state
    pub fn same_content(&self, other: &DocumentData) -> bool {
        self.deleted == other.deleted && self.data == other.data && {
            let mine: Vec<_> = self.attachments.iter().map(|(k, a)| (k, &a.digest)).collect();
            let theirs: Vec<_> = other.attachments.iter().map(|(k, a)| (k, &a.digest)).collect();
            mine == theirs
        }
    }
}

/// Resolve a dotted path inside a JSON value; numeric segments index arrays
pub fn get_value_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Replication and change-stream cursor: last document id plus its lwt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Primary key of the last document seen
    pub id: String,
    /// Last write time of the last document seen
    pub lwt: f64,
}

impl Checkpoint {
    /// Checkpoint positioned at `doc`
    pub fn of(doc: &DocumentData, primary_path: &str) -> Option<Self> {
        doc.primary(primary_path).map(|id| Self {
            id: id.to_string(),
            lwt: doc.meta.lwt,
        })
    }

    /// Total order by `(lwt, id)`
    pub fn position_cmp(&self, other: &Checkpoint) -> Ordering {
        self.lwt
            .partial_cmp(&other.lwt)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

static LAST_LWT: Mutex<f64> = parking_lot::const_mutex(0.0);

/// Strictly increasing millisecond timestamp with 0.01 resolution
pub fn now_lwt() -> f64 {
    let mut last = LAST_LWT.lock();
    let mut now = chrono::Utc::now().timestamp_millis() as f64;
    if now <= *last {
        now = ((*last + 0.01) * 100.0).round() / 100.0;
    }
    *last = now;
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip_shape() {
        let doc = DocumentData::from_value(json!({
            "id": "a",
            "age": 3,
            "_rev": "1-x",
            "_deleted": false,
            "_meta": { "lwt": 1000.5 },
            "_attachments": {}
        }))
        .unwrap();

        assert_eq!(doc.primary("id"), Some("a"));
        assert_eq!(doc.rev, "1-x");
        assert_eq!(doc.meta.lwt, 1000.5);
        assert_eq!(doc.data.len(), 2);

        let value = doc.to_value();
        assert_eq!(value["_rev"], "1-x");
        assert_eq!(value["age"], 3);
        assert!(value.get("_attachments").is_some());
    }

    #[test]
    fn test_get_path() {
        let mut doc = DocumentData::new(
            json!({ "id": "a", "address": { "city": "Lyon" }, "tags": ["x", "y"] })
                .as_object()
                .cloned()
                .unwrap(),
        );
        doc.deleted = true;
        doc.meta.lwt = 42.0;

        assert_eq!(doc.get_path("address.city").unwrap().as_ref(), &json!("Lyon"));
        assert_eq!(doc.get_path("tags.1").unwrap().as_ref(), &json!("y"));
        assert_eq!(doc.get_path("_deleted").unwrap().as_ref(), &json!(true));
        assert_eq!(doc.get_path("_meta.lwt").unwrap().as_ref(), &json!(42.0));
        assert!(doc.get_path("address.zip").is_none());
    }

    #[test]
    fn test_strip_attachment_data() {
        let mut doc = DocumentData::default();
        doc.attachments.insert(
            "a.txt".into(),
            AttachmentData {
                digest: "sha256-x".into(),
                length: 3,
                content_type: "text/plain".into(),
                data: Some("YWJj".into()),
            },
        );
        let stripped = doc.without_attachment_data();
        assert!(stripped.attachments["a.txt"].data.is_none());
        assert!(doc.same_content(&stripped));
    }

    #[test]
    fn test_now_lwt_strictly_increasing() {
        let mut last = now_lwt();
        for _ in 0..1000 {
            let next = now_lwt();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_checkpoint_order() {
        let a = Checkpoint { id: "b".into(), lwt: 1.0 };
        let b = Checkpoint { id: "a".into(), lwt: 2.0 };
        let c = Checkpoint { id: "c".into(), lwt: 1.0 };
        assert_eq!(a.position_cmp(&b), Ordering::Less);
        assert_eq!(a.position_cmp(&c), Ordering::Less);
    }
}
