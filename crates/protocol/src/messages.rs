use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Every message exchanged over a data channel.
///
/// Serialized with an internal `type` tag, e.g. `{"type":"ping"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Meta(TransferMeta),
    Chunk(ChunkMessage),
    TransferAccepted(TransferAccepted),
    TransferRejected(TransferRejected),
    Chat(ChatMessage),
    Ping,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Tag used on the wire, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Meta(_) => "meta",
            Message::Chunk(_) => "chunk",
            Message::TransferAccepted(_) => "transfer-accepted",
            Message::TransferRejected(_) => "transfer-rejected",
            Message::Chat(_) => "chat",
            Message::Ping => "ping",
            Message::Unknown => "unknown",
        }
    }

    /// Transfer this message belongs to, if any.
    pub fn transfer_id(&self) -> Option<&str> {
        match self {
            Message::Meta(m) => Some(&m.transfer_id),
            Message::Chunk(c) => Some(&c.transfer_id),
            Message::TransferAccepted(a) => Some(&a.transfer_id),
            Message::TransferRejected(r) => Some(&r.transfer_id),
            Message::Chat(_) | Message::Ping | Message::Unknown => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transfer payloads
// ---------------------------------------------------------------------------

/// Describes a file about to be sent. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMeta {
    pub transfer_id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub total_chunks: u32,
    /// Hex SHA-256 of the whole file, when the sender managed to compute it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// One slice of a file.
///
/// In JSON `data` is a base64 data URL; binary-capable channels carry the
/// payload raw next to a [`ChunkHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub transfer_id: String,
    pub name: String,
    pub index: u32,
    pub total: u32,
    #[serde(with = "data_url")]
    pub data: Vec<u8>,
}

impl ChunkMessage {
    /// Splits the chunk into its header and raw payload.
    pub fn into_parts(self) -> (ChunkHeader, Vec<u8>) {
        (
            ChunkHeader {
                msg_type: ChunkHeader::TYPE.into(),
                transfer_id: self.transfer_id,
                name: self.name,
                index: self.index,
                total: self.total,
            },
            self.data,
        )
    }

    /// Rebuilds a chunk from a header and its raw payload.
    pub fn from_parts(header: ChunkHeader, data: Vec<u8>) -> Self {
        Self {
            transfer_id: header.transfer_id,
            name: header.name,
            index: header.index,
            total: header.total,
            data,
        }
    }
}

/// Header of a binary chunk frame (everything except the payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub transfer_id: String,
    pub name: String,
    pub index: u32,
    pub total: u32,
}

impl ChunkHeader {
    pub const TYPE: &'static str = "chunk";
}

/// Receiver accepted a transfer; the sender resumes at `resume_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAccepted {
    pub transfer_id: String,
    pub resume_index: u32,
}

/// Receiver refused a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRejected {
    pub transfer_id: String,
    pub reason: RejectReason,
}

/// Why a receiver refused a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Not enough storage for the announced size.
    QuotaExceeded,
    /// The meta is internally inconsistent.
    InvalidMeta,
    /// The receiver cannot take the transfer right now.
    Busy,
    /// Refused for any other reason.
    #[serde(other)]
    Declined,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::QuotaExceeded => "quota-exceeded",
            RejectReason::InvalidMeta => "invalid-meta",
            RejectReason::Busy => "busy",
            RejectReason::Declined => "declined",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Free-text message sharing the transfer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Serde helper: bytes as a base64 data URL.
///
/// Decoding also accepts plain base64 without the `data:` prefix.
pub mod data_url {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    const PREFIX: &str = "data:application/octet-stream;base64,";

    /// Encodes bytes as `data:application/octet-stream;base64,...`.
    pub fn encode(data: &[u8]) -> String {
        let mut out = String::with_capacity(PREFIX.len() + data.len().div_ceil(3) * 4);
        out.push_str(PREFIX);
        STANDARD.encode_string(data, &mut out);
        out
    }

    /// Decodes a data URL (or bare base64) back to bytes.
    pub fn decode(s: &str) -> Result<Vec<u8>, String> {
        let b64 = match s.strip_prefix("data:") {
            Some(rest) => {
                let (header, body) = rest
                    .split_once(',')
                    .ok_or_else(|| "data URL without payload separator".to_string())?;
                if !header.ends_with(";base64") {
                    return Err(format!("data URL is not base64 encoded: {header}"));
                }
                body
            }
            None => s,
        };
        STANDARD.decode(b64).map_err(|e| e.to_string())
    }

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> TransferMeta {
        TransferMeta {
            transfer_id: "abc123".into(),
            name: "notes.pdf".into(),
            size: 70_000,
            mime: "application/pdf".into(),
            total_chunks: 2,
            hash: None,
        }
    }

    #[test]
    fn meta_wire_shape() {
        let json = serde_json::to_value(Message::Meta(sample_meta())).unwrap();
        assert_eq!(json["type"], "meta");
        assert_eq!(json["transferId"], "abc123");
        assert_eq!(json["totalChunks"], 2);
        // Absent digest is omitted, not null.
        assert!(json.get("hash").is_none());
    }

    #[test]
    fn ping_is_bare_tag() {
        let json = serde_json::to_string(&Message::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Message::Ping);
    }

    #[test]
    fn accepted_uses_kebab_tag() {
        let msg = Message::TransferAccepted(TransferAccepted {
            transfer_id: "t1".into(),
            resume_index: 3,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transfer-accepted");
        assert_eq!(json["resumeIndex"], 3);
    }

    #[test]
    fn rejected_reason_strings() {
        let msg = Message::TransferRejected(TransferRejected {
            transfer_id: "t1".into(),
            reason: RejectReason::QuotaExceeded,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["reason"], "quota-exceeded");

        let unknown: TransferRejected =
            serde_json::from_str(r#"{"transferId":"t1","reason":"user-said-no"}"#).unwrap();
        assert_eq!(unknown.reason, RejectReason::Declined);
    }

    #[test]
    fn chunk_data_is_data_url() {
        let msg = Message::Chunk(ChunkMessage {
            transfer_id: "t1".into(),
            name: "a.txt".into(),
            index: 0,
            total: 1,
            data: b"Hello".to_vec(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], "data:application/octet-stream;base64,SGVsbG8=");
    }

    #[test]
    fn chunk_accepts_plain_base64() {
        let json = r#"{"type":"chunk","transferId":"t1","name":"a","index":0,"total":1,"data":"SGVsbG8="}"#;
        let Message::Chunk(chunk) = serde_json::from_str(json).unwrap() else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.data, b"Hello");
    }

    #[test]
    fn data_url_rejects_non_base64() {
        assert!(data_url::decode("data:text/plain,hello").is_err());
        assert!(data_url::decode("data:application/octet-stream;base64").is_err());
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let parsed: Message = serde_json::from_str(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(parsed, Message::Unknown);
    }

    #[test]
    fn chunk_parts_round_trip() {
        let chunk = ChunkMessage {
            transfer_id: "t1".into(),
            name: "a.bin".into(),
            index: 4,
            total: 9,
            data: vec![1, 2, 3],
        };
        let (header, data) = chunk.clone().into_parts();
        assert_eq!(header.msg_type, "chunk");
        assert_eq!(ChunkMessage::from_parts(header, data), chunk);
    }

    #[test]
    fn transfer_id_accessor() {
        assert_eq!(Message::Meta(sample_meta()).transfer_id(), Some("abc123"));
        assert_eq!(Message::Ping.transfer_id(), None);
    }
}
