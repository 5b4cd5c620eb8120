//! Chat message wire shapes

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de;
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type GroupId = i64;

/// Accept the timestamp encodings the backend has been seen to emit:
/// ISO-8601 strings, epoch milliseconds, or Jackson's `[y,m,d,h,mi,s,nanos]`
/// array form. Everything is normalized to an ISO-8601 string.
fn lenient_timestamp<'de, D: de::Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<String>, D::Error> {
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<String>;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("timestamp string, epoch millis or date-time array")
        }
        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }
        fn visit_some<D2: de::Deserializer<'de>>(
            self,
            d: D2,
        ) -> std::result::Result<Self::Value, D2::Error> {
            d.deserialize_any(self)
        }
        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(Some(v.to_string()))
        }
        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            self.visit_i64(v as i64)
        }
        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            Utc.timestamp_millis_opt(v)
                .single()
                .map(|t| Some(format_timestamp(t)))
                .ok_or_else(|| E::custom(format!("epoch millis out of range: {}", v)))
        }
        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut parts = [0i64; 7];
            let mut n = 0;
            while let Some(v) = seq.next_element::<i64>()? {
                if n < parts.len() {
                    parts[n] = v;
                }
                n += 1;
            }
            if n < 3 {
                return Err(de::Error::invalid_length(n, &"at least [year, month, day]"));
            }
            let t = NaiveDate::from_ymd_opt(parts[0] as i32, parts[1] as u32, parts[2] as u32)
                .and_then(|d| {
                    d.and_hms_nano_opt(parts[3] as u32, parts[4] as u32, parts[5] as u32, parts[6] as u32)
                })
                .ok_or_else(|| <A::Error as de::Error>::custom("invalid date-time array"))?;
            Ok(Some(format_timestamp(Utc.from_utc_datetime(&t))))
        }
    }
    d.deserialize_option(Visitor)
}

/// ISO-8601 with millisecond precision, the format used when sending.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a wire timestamp. Zone-less values are taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

/// Direct (1:1) chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

impl ChatMessage {
    /// New outbound message stamped with the current time.
    pub fn new(sender_id: UserId, receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            content: content.into(),
            timestamp: Some(format_timestamp(Utc::now())),
        }
    }

    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    fn is_presence(&self) -> bool {
        (self.content.is_empty() && self.receiver_id < 0) || is_join_notice(&self.content)
    }
}

/// Group chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    pub group_id: GroupId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

impl GroupMessage {
    pub fn new(group_id: GroupId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            group_id,
            sender_id,
            content: content.into(),
            timestamp: Some(format_timestamp(Utc::now())),
        }
    }
}

/// The broker announces joins as chat messages with this text.
fn is_join_notice(content: &str) -> bool {
    content.to_lowercase().contains("joined the chat")
}

/// Who is using this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub email: String,
}

pub const CHAT_SEND_DESTINATION: &str = "/app/chat.send";
pub const PRESENCE_DESTINATION: &str = "/app/chat.addUser";
pub const GROUP_SEND_DESTINATION: &str = "/app/group.send";

/// Everything the client publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Chat(ChatMessage),
    Group(GroupMessage),
    /// Presence announcement. Carries no content.
    Join(Identity),
}

impl Outbound {
    pub fn destination(&self) -> &'static str {
        match self {
            Outbound::Chat(_) => CHAT_SEND_DESTINATION,
            Outbound::Group(_) => GROUP_SEND_DESTINATION,
            Outbound::Join(_) => PRESENCE_DESTINATION,
        }
    }

    /// JSON body. `Join` keeps the server's expected chat-message shape with
    /// empty content and no receiver.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Outbound::Chat(m) => serde_json::json!(m),
            Outbound::Group(m) => serde_json::json!(m),
            Outbound::Join(identity) => serde_json::json!({
                "senderId": identity.id,
                "receiverId": -1,
                "content": ""
            }),
        }
    }
}

/// A join/presence notice seen on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceNotice {
    pub sender_id: UserId,
    pub content: String,
}

/// Everything the client can receive on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Direct(ChatMessage),
    Group(GroupMessage),
    Presence(PresenceNotice),
}

impl Inbound {
    /// Decode a frame body from a direct-message channel.
    pub fn decode_direct(body: &str) -> serde_json::Result<Self> {
        let msg: ChatMessage = serde_json::from_str(body)?;
        if msg.is_presence() {
            return Ok(Inbound::Presence(PresenceNotice {
                sender_id: msg.sender_id,
                content: msg.content,
            }));
        }
        Ok(Inbound::Direct(msg))
    }

    /// Decode a frame body from a group channel.
    pub fn decode_group(body: &str) -> serde_json::Result<Self> {
        let msg: GroupMessage = serde_json::from_str(body)?;
        if msg.content.is_empty() || is_join_notice(&msg.content) {
            return Ok(Inbound::Presence(PresenceNotice {
                sender_id: msg.sender_id,
                content: msg.content,
            }));
        }
        Ok(Inbound::Group(msg))
    }
}
