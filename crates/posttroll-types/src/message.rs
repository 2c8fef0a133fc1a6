//! The PostTroll wire message envelope.
//!
//! A [`Message`] is a versioned, self-describing text record: a
//! space-separated header line identifying the protocol version, subject,
//! sender, timestamp, and type, followed by a newline and a payload block
//! whose shape depends on `type`/the binary flag.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MessageError;
use crate::MessageResult;

/// Magic prefix opening every header; the version token follows directly
/// (e.g. `pytroll:/v1.02`), preserving wire compatibility with deployments
/// that already speak this magic word.
const MAGIC: &str = "pytroll:/";

/// Protocol version token. `V1_02` is current (timezone-aware timestamps);
/// `V1_01` is the legacy naive-UTC compatibility mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageVersion {
    /// Legacy version: timestamps encode without a zone offset.
    V1_01,
    /// Current version: timestamps encode with a `+00:00` zone offset.
    #[default]
    V1_02,
}

impl MessageVersion {
    fn as_token(self) -> &'static str {
        match self {
            MessageVersion::V1_01 => "v1.01",
            MessageVersion::V1_02 => "v1.02",
        }
    }
}

impl std::str::FromStr for MessageVersion {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "v1.01" => Ok(MessageVersion::V1_01),
            "v1.02" => Ok(MessageVersion::V1_02),
            other => Err(MessageError::MalformedHeader(format!(
                "unrecognized version token `{other}`"
            ))),
        }
    }
}

impl std::fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_token())
    }
}

/// The message payload. A tagged-variant representation of spec.md's
/// "text blob, binary blob, or structured mapping" payload options.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MessageData {
    /// No payload.
    #[default]
    None,
    /// A raw text blob, carried verbatim in the payload block.
    Text(String),
    /// A binary blob, base64-framed on the wire with the binary flag set.
    Binary(Vec<u8>),
    /// A structured key/value mapping, JSON-serialized.
    Mapping(Value),
}

/// A PostTroll message envelope.
///
/// Equality is defined over `(subject, type, data, sender, time, version)`
/// — `id` is excluded since it never appears on the wire (the header
/// grammar in spec.md §4.A has no id field; `decode` always mints a fresh
/// one), so comparing it would make `decode(encode(m)) == m` false for
/// every message. With `id` excluded, that round trip holds modulo the
/// timezone normalization `v1.01` performs on encode.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub type_: String,
    pub sender: String,
    pub time: DateTime<Utc>,
    pub id: Uuid,
    pub version: MessageVersion,
    pub data: MessageData,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.type_ == other.type_
            && self.sender == other.sender
            && self.time == other.time
            && self.version == other.version
            && self.data == other.data
    }
}

impl Message {
    /// Construct a new message, auto-filling `sender`, `id`, and `time`.
    ///
    /// `subject` and `type_` must be non-empty; `data` defaults to
    /// [`MessageData::None`] and `version` defaults to
    /// [`MessageVersion::V1_02`].
    pub fn new(
        subject: impl Into<String>,
        type_: impl Into<String>,
        data: Option<MessageData>,
        version: Option<MessageVersion>,
    ) -> MessageResult<Self> {
        let subject = subject.into();
        let type_ = type_.into();
        if subject.is_empty() {
            return Err(MessageError::InvalidField {
                field: "subject",
                reason: "must be non-empty".to_string(),
            });
        }
        if type_.is_empty() {
            return Err(MessageError::InvalidField {
                field: "type",
                reason: "must be non-empty".to_string(),
            });
        }
        Ok(Message {
            subject,
            type_,
            sender: current_sender(),
            time: Utc::now(),
            id: Uuid::new_v4(),
            version: version.unwrap_or_default(),
            data: data.unwrap_or_default(),
        })
    }

    /// Encode this message into its wire representation.
    pub fn encode(&self) -> String {
        let binary_flag = matches!(self.data, MessageData::Binary(_)) as u8;
        let isotime = encode_time(self.time, self.version);
        let header = format!(
            "{MAGIC}{version} {subject} {sender} {isotime} {type_} {binary_flag}",
            version = self.version,
            subject = self.subject,
            sender = self.sender,
            type_ = self.type_,
        );
        let payload = match &self.data {
            MessageData::None => String::new(),
            MessageData::Text(text) => text.clone(),
            MessageData::Binary(bytes) => {
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes)
            }
            MessageData::Mapping(value) => value.to_string(),
        };
        format!("{header}\n{payload}")
    }

    /// Decode a message from its wire representation.
    ///
    /// Parses the timestamp permissively (accepts both tz-aware and naive
    /// forms regardless of the header's declared version) and interprets
    /// the payload according to `type`/binary flag. Malformed input fails
    /// with [`MessageError`].
    pub fn decode(raw: &str) -> MessageResult<Self> {
        let (header, payload) = match raw.split_once('\n') {
            Some((h, p)) => (h, p),
            None => (raw, ""),
        };

        let fields: Vec<&str> = header.split(' ').collect();
        if fields.len() != 6 {
            return Err(MessageError::MalformedHeader(format!(
                "expected 6 space-separated header fields, found {}",
                fields.len()
            )));
        }
        let [version_token, subject, sender, isotime, type_, binary_flag] = [
            fields[0], fields[1], fields[2], fields[3], fields[4], fields[5],
        ];

        let version_str = version_token.strip_prefix(MAGIC).ok_or_else(|| {
            MessageError::MalformedHeader(format!(
                "missing `{MAGIC}` magic prefix in `{version_token}`"
            ))
        })?;
        let version: MessageVersion = version_str.parse()?;

        if subject.is_empty() || sender.is_empty() || type_.is_empty() {
            return Err(MessageError::MalformedHeader(
                "subject, sender, and type must be non-empty".to_string(),
            ));
        }

        let time = decode_time(isotime)?;
        let is_binary = binary_flag == "1";

        let data = if is_binary {
            let bytes =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, payload)?;
            MessageData::Binary(bytes)
        } else if payload.is_empty() {
            MessageData::None
        } else {
            match serde_json::from_str::<Value>(payload) {
                Ok(value @ (Value::Object(_) | Value::Array(_))) => MessageData::Mapping(value),
                _ => MessageData::Text(payload.to_string()),
            }
        };

        Ok(Message {
            subject: subject.to_string(),
            type_: type_.to_string(),
            sender: sender.to_string(),
            time,
            id: Uuid::new_v4(),
            version,
            data,
        })
    }
}

fn encode_time(time: DateTime<Utc>, version: MessageVersion) -> String {
    match version {
        MessageVersion::V1_02 => time.to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
        MessageVersion::V1_01 => time
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string(),
    }
}

fn decode_time(isotime: &str) -> MessageResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(isotime) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(isotime, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    Err(MessageError::MalformedTimestamp(isotime.to_string()))
}

/// Builds the `user@host` sender string used at construction time.
fn current_sender() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{user}@{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fills_sender_id_time() {
        let m = Message::new("/counter", "info", None, None).unwrap();
        assert!(m.sender.contains('@'));
        assert_eq!(m.version, MessageVersion::V1_02);
        assert_eq!(m.data, MessageData::None);
    }

    #[test]
    fn new_rejects_empty_subject() {
        let err = Message::new("", "info", None, None).unwrap_err();
        assert!(matches!(err, MessageError::InvalidField { field: "subject", .. }));
    }

    #[test]
    fn new_rejects_empty_type() {
        let err = Message::new("/x", "", None, None).unwrap_err();
        assert!(matches!(err, MessageError::InvalidField { field: "type", .. }));
    }

    #[test]
    fn roundtrip_text_v102() {
        let m = Message::new(
            "/counter",
            "info",
            Some(MessageData::Text("1".to_string())),
            Some(MessageVersion::V1_02),
        )
        .unwrap();
        let decoded = Message::decode(&m.encode()).unwrap();
        // `id` is excluded from `PartialEq` since it is never on the wire.
        assert_eq!(decoded, m);
        assert_ne!(decoded.id, m.id);
    }

    #[test]
    fn roundtrip_binary() {
        let m = Message::new(
            "/blob",
            "file",
            Some(MessageData::Binary(vec![0, 1, 2, 255])),
            None,
        )
        .unwrap();
        let decoded = Message::decode(&m.encode()).unwrap();
        assert_eq!(decoded.data, MessageData::Binary(vec![0, 1, 2, 255]));
    }

    #[test]
    fn roundtrip_mapping() {
        let value = serde_json::json!({"URI": "tcp://host:9000", "service": "svc"});
        let m = Message::new(
            "/oper/ns",
            "info",
            Some(MessageData::Mapping(value.clone())),
            None,
        )
        .unwrap();
        let decoded = Message::decode(&m.encode()).unwrap();
        assert_eq!(decoded.data, MessageData::Mapping(value));
    }

    #[test]
    fn v101_strips_zone_but_decodes_as_utc() {
        let m = Message::new(
            "/counter",
            "info",
            Some(MessageData::Text("1".to_string())),
            Some(MessageVersion::V1_01),
        )
        .unwrap();
        let encoded = m.encode();
        assert!(encoded.contains("pytroll:/v1.01"));
        let decoded = Message::decode(&encoded).unwrap();
        // v1.01 has microsecond resolution but no zone offset; since the
        // source time was already UTC, round-tripping through naive-UTC
        // parsing recovers the identical instant.
        assert_eq!(decoded.time, m.time);
    }

    #[test]
    fn v101_message_decodes_under_v102_reader_and_vice_versa() {
        let v101 = Message::new("/x", "info", None, Some(MessageVersion::V1_01)).unwrap();
        let decoded = Message::decode(&v101.encode()).unwrap();
        assert_eq!(decoded.version, MessageVersion::V1_01);

        let v102 = Message::new("/x", "info", None, Some(MessageVersion::V1_02)).unwrap();
        let decoded = Message::decode(&v102.encode()).unwrap();
        assert_eq!(decoded.version, MessageVersion::V1_02);
    }

    #[test]
    fn decode_rejects_missing_magic() {
        let err = Message::decode("v1.02 /x sender@host 2024-01-01T00:00:00.000000+00:00 info 0\n")
            .unwrap_err();
        assert!(matches!(err, MessageError::MalformedHeader(_)));
    }

    #[test]
    fn decode_rejects_wrong_field_count() {
        let err = Message::decode("pytroll:/v1.02 /x sender@host info 0\n").unwrap_err();
        assert!(matches!(err, MessageError::MalformedHeader(_)));
    }

    #[test]
    fn decode_rejects_malformed_timestamp() {
        let raw = "pytroll:/v1.02 /x sender@host not-a-time info 0\n";
        let err = Message::decode(raw).unwrap_err();
        assert!(matches!(err, MessageError::MalformedTimestamp(_)));
    }
}
