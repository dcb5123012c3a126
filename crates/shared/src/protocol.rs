use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{BatchId, ConnectionState, MemberId, MessageId, MessageStatus},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub edited: bool,
    pub payload: MessagePayload,
}

impl ContentMessage {
    pub fn plaintext(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            status: MessageStatus::Unknown,
            edited: false,
            payload: MessagePayload::Plaintext { text: text.into() },
        }
    }

    pub fn file(id: MessageId, body: FileBody) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            status: MessageStatus::Unknown,
            edited: false,
            payload: MessagePayload::File(body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    Plaintext { text: String },
    File(FileBody),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBody {
    pub file_ref: FileRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub location: FileLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileLocation {
    Remote { url: String },
    Inline { data_b64: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinConfig {
    pub endpoint: String,
    pub member_id: MemberId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_name: Option<String>,
    #[serde(default)]
    pub eagerly_connect: bool,
}

/// Requests a local client (tab) sends to the multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    Join {
        config: JoinConfig,
    },
    Send {
        message: ContentMessage,
    },
    Delete {
        message_id: MessageId,
    },
    Detach,
    SetOnline {
        online: bool,
    },
    Reconnect,
    Resync {
        #[serde(default)]
        last_known_id: Option<MessageId>,
    },
}

/// Events fanned out from the multiplexer to attached clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Snapshot {
        messages: Vec<ContentMessage>,
        connection: ConnectionState,
    },
    Online,
    Offline {
        session_duration_ms: u64,
    },
    MessageUpserted {
        message: ContentMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replaces: Option<MessageId>,
    },
    MessageDeleted {
        message_id: MessageId,
    },
    Acknowledged {
        local_id: MessageId,
        canonical_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    Error(ApiError),
}

/// Unit of outbound transmission to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutgoingEnvelope {
    Message {
        message: ContentMessage,
    },
    UploadIntent {
        local_id: MessageId,
        timestamp: DateTime<Utc>,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        size_bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<BatchId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_files: Option<u32>,
    },
}

impl OutgoingEnvelope {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Message { message } => &message.id,
            Self::UploadIntent { local_id, .. } => local_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryReference {
    pub url: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u32>,
}

/// Frames the backend pushes to the multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendFrame {
    Ack {
        local_id: MessageId,
        canonical_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        reason: String,
    },
    Plaintext {
        id: MessageId,
        timestamp: DateTime<Utc>,
        text: String,
        #[serde(default)]
        edited: bool,
    },
    Binary {
        id: MessageId,
        timestamp: DateTime<Utc>,
        reference: BinaryReference,
    },
    Zipped {
        id: MessageId,
        timestamp: DateTime<Utc>,
        reference: BinaryReference,
        supersedes: Vec<MessageId>,
    },
    UploadFailed {
        local_id: MessageId,
        reason: String,
    },
}
