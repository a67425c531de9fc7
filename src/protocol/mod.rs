//! Wire protocol envelopes exchanged between fleet nodes
//!
//! Every message on a fleet connection is one JSON envelope tagged by
//! `type`. The set of types is closed; unknown tags are ignored by
//! receivers and malformed bodies are dropped without tearing down the
//! connection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::{TaskConfig, TaskStatus};

/// Fixed upload chunk size (512 KiB)
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Message `type` tags understood by fleet nodes
const KNOWN_TYPES: &[&str] = &[
    "node-info",
    "pack-task",
    "task-status",
    "upload-start",
    "upload-chunk",
    "upload-end",
    "upload-ack",
];

/// One message exchanged over a fleet connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Identity announcement; carried in envelope fields, not `data`
    #[serde(rename_all = "camelCase")]
    NodeInfo {
        node_id: Uuid,
        platform: String,
        hostname: String,
    },
    /// A build task dispatched to workers
    PackTask { data: PackTaskData },
    /// Point-in-time task status snapshot
    TaskStatus { data: TaskSnapshot },
    /// Open an upload session on the receiver
    UploadStart { data: UploadStartData },
    /// One in-order chunk of the file being uploaded
    UploadChunk { data: UploadChunkData },
    /// Close an upload session
    UploadEnd { data: UploadEndData },
    /// Receiver acknowledgement for an upload session
    UploadAck { data: UploadAckData },
}

/// Why an inbound frame could not be turned into an [`Envelope`]
#[derive(Debug)]
pub enum DecodeError {
    /// `type` tag outside the closed set; receivers ignore the message
    UnknownType(String),
    /// Body not resolvable into an envelope; receivers drop the message
    Malformed(String),
}

impl Envelope {
    /// Decode one wire frame
    ///
    /// Two-stage so an unknown `type` is distinguishable from a malformed
    /// payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownType`] for tags outside the closed set
    /// and [`DecodeError::Malformed`] for anything else that fails to parse.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| DecodeError::Malformed("missing type tag".to_string()))?;
        if !KNOWN_TYPES.contains(&tag) {
            return Err(DecodeError::UnknownType(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of `pack-task`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackTaskData {
    pub task_id: Uuid,
    pub config: TaskConfig,
}

/// Payload of `task-status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    /// Node reporting the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `upload-start`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStartData {
    pub upload_id: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_dir: Option<String>,
}

/// Payload of `upload-chunk`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkData {
    pub upload_id: String,
    /// Text-safe encoding of one file chunk, in file order
    pub chunk_base64: String,
}

/// Payload of `upload-end`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEndData {
    pub upload_id: String,
}

/// Payload of `upload-ack`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAckData {
    pub upload_id: String,
    pub status: AckStatus,
    /// Destination path, present on the `started` ack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Upload acknowledgement states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Started,
    Completed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_info_round_trips_with_camel_case_fields() {
        let envelope = Envelope::NodeInfo {
            node_id: Uuid::nil(),
            platform: "linux".to_string(),
            hostname: "builder-1".to_string(),
        };
        let json = envelope.encode().unwrap();
        assert!(json.contains("\"type\":\"node-info\""));
        assert!(json.contains("\"nodeId\""));

        let decoded = Envelope::decode(&json).unwrap();
        assert!(matches!(decoded, Envelope::NodeInfo { .. }));
    }

    #[test]
    fn pack_task_decodes() {
        let json = r#"{
            "type": "pack-task",
            "data": {
                "taskId": "00000000-0000-0000-0000-000000000001",
                "config": {
                    "repoUrl": "https://example/repo.git",
                    "branch": "main",
                    "platforms": ["linux"],
                    "outputDir": "/out"
                }
            }
        }"#;
        let Envelope::PackTask { data } = Envelope::decode(json).unwrap() else {
            panic!("expected pack-task");
        };
        assert_eq!(data.config.branch, "main");
        assert_eq!(data.config.platforms, vec!["linux".to_string()]);
    }

    #[test]
    fn upload_ack_status_serializes_lowercase() {
        let envelope = Envelope::UploadAck {
            data: UploadAckData {
                upload_id: "u1".to_string(),
                status: AckStatus::Started,
                path: Some(PathBuf::from("/srv/outputs/u1.zip")),
            },
        };
        let json = envelope.encode().unwrap();
        assert!(json.contains("\"status\":\"started\""));
        assert!(json.contains("\"uploadId\":\"u1\""));
    }

    #[test]
    fn unknown_type_is_distinguished_from_malformed() {
        let unknown = Envelope::decode(r#"{"type":"telemetry","data":{}}"#);
        assert!(matches!(unknown, Err(DecodeError::UnknownType(t)) if t == "telemetry"));

        let malformed = Envelope::decode(r#"{"type":"upload-end","data":{}}"#);
        assert!(matches!(malformed, Err(DecodeError::Malformed(_))));

        let not_json = Envelope::decode("not json at all");
        assert!(matches!(not_json, Err(DecodeError::Malformed(_))));

        let missing_tag = Envelope::decode(r#"{"data":{}}"#);
        assert!(matches!(missing_tag, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn chunk_size_is_512_kib() {
        assert_eq!(CHUNK_SIZE, 512 * 1024);
    }
}
