//! STOMP 1.2 frame encoding and decoding
//!
//! Each WebSocket text message carries zero or more frames terminated by NUL.
//! A message made only of end-of-line characters is a heart-beat.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while decoding an inbound STOMP frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header: {0}")]
    BadEscape(String),
}

/// STOMP frame commands (client and server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }

    /// CONNECT and CONNECTED frames do not escape header values.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Look up a header. Repeated headers resolve to the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// CONNECT frame announcing STOMP 1.2 and our heart-beat wishes.
    pub fn connect(host: &str, heartbeat: HeartBeat) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", heartbeat.header_value())
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    /// SEND frame carrying a JSON body.
    pub fn send_json(destination: &str, body: String) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", body.len().to_string())
            .with_body(body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    /// Serialize to wire text, including the trailing NUL.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame (without the trailing NUL, leading EOLs already stripped).
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let (head, body) = match raw.find("\n\n") {
            Some(pos) => (&raw[..pos], &raw[pos + 2..]),
            None => match raw.find("\r\n\r\n") {
                Some(pos) => (&raw[..pos], &raw[pos + 4..]),
                None => (raw, ""),
            },
        };

        let mut lines = head.lines();
        let command_line = lines.next().map(str::trim_end).unwrap_or("");
        if command_line.is_empty() {
            return Err(FrameError::Empty);
        }
        let command = Command::parse(command_line)?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Frame {
            command,
            headers,
            body: body.to_string(),
        };

        // Honor content-length when it points inside the body we were given.
        if let Some(len) = frame.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            if len < frame.body.len() && frame.body.is_char_boundary(len) {
                frame.body.truncate(len);
            }
        }

        Ok(frame)
    }
}

/// Something received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Heartbeat,
    Frame(Frame),
}

/// Decode one WebSocket text message into heart-beats and frames.
pub fn decode_message(text: &str) -> Result<Vec<Incoming>, FrameError> {
    let mut out = Vec::new();
    let mut first_err = None;

    for chunk in text.split('\0') {
        let trimmed = chunk.trim_start_matches(|c| c == '\r' || c == '\n');
        if trimmed.len() != chunk.len() {
            out.push(Incoming::Heartbeat);
        }
        if trimmed.is_empty() {
            continue;
        }
        match Frame::parse(trimmed) {
            Ok(frame) => out.push(Incoming::Frame(frame)),
            Err(e) => {
                tracing::warn!("Skipping malformed STOMP frame: {}", e);
                first_err.get_or_insert(e);
            }
        }
    }

    if out.is_empty() {
        if let Some(e) = first_err {
            return Err(e);
        }
        if text.is_empty() {
            return Err(FrameError::Empty);
        }
    }
    out.dedup_by(|a, b| *a == Incoming::Heartbeat && *b == Incoming::Heartbeat);
    Ok(out)
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::BadEscape(s.to_string())),
        }
    }
    Ok(out)
}

/// Heart-beat intervals in milliseconds, as carried by the `heart-beat` header.
///
/// For the client the pair is (can send every, wants to receive every).
/// Zero means "cannot"/"does not want".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing_ms: u64,
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (cx, cy) = value.split_once(',')?;
        Some(Self {
            outgoing_ms: cx.trim().parse().ok()?,
            incoming_ms: cy.trim().parse().ok()?,
        })
    }

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Negotiate against the server's CONNECTED `heart-beat` header.
    ///
    /// Returns (how often we must send, how often we expect to receive).
    /// `None` disables that direction.
    pub fn negotiate(&self, server: HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(ours.max(theirs)))
            }
        };
        (
            pick(self.outgoing_ms, server.incoming_ms),
            pick(self.incoming_ms, server.outgoing_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_subscribe() {
        let frame = Frame::subscribe("sub-0", "/topic/group.7");
        assert_eq!(
            frame.encode(),
            "SUBSCRIBE\nid:sub-0\ndestination:/topic/group.7\nack:auto\n\n\0"
        );
    }

    #[test]
    fn test_connect_headers_not_escaped() {
        let frame = Frame::connect("localhost:8080", HeartBeat::new(4000, 4000));
        let text = frame.encode();
        assert!(text.contains("host:localhost:8080\n"));
        assert!(text.contains("heart-beat:4000,4000\n"));
    }

    #[test]
    fn test_send_header_escaping() {
        let frame = Frame::new(Command::Send).header("note", "a:b\nc\\d");
        let text = frame.encode();
        assert!(text.contains("note:a\\cb\\nc\\\\d\n"));

        let parsed = Frame::parse(text.trim_end_matches('\0')).unwrap();
        assert_eq!(parsed.get("note"), Some("a:b\nc\\d"));
    }

    #[test]
    fn test_parse_message_frame() {
        let raw = "MESSAGE\ndestination:/topic/public\nsubscription:sub-1\nmessage-id:42\ncontent-type:application/json\n\n{\"content\":\"hi\"}\0";
        let decoded = decode_message(raw).unwrap();
        assert_eq!(decoded.len(), 1);
        let Incoming::Frame(frame) = &decoded[0] else {
            panic!("expected frame");
        };
        assert_eq!(frame.command, Command::Message);
        assert_eq!(frame.get("subscription"), Some("sub-1"));
        assert_eq!(frame.body, "{\"content\":\"hi\"}");
    }

    #[test]
    fn test_repeated_header_first_wins() {
        let frame = Frame::parse("MESSAGE\nfoo:1\nfoo:2\n\n").unwrap();
        assert_eq!(frame.get("foo"), Some("1"));
    }

    #[test]
    fn test_heartbeat_only_message() {
        assert_eq!(decode_message("\n").unwrap(), vec![Incoming::Heartbeat]);
        assert_eq!(decode_message("\r\n\r\n").unwrap(), vec![Incoming::Heartbeat]);
    }

    #[test]
    fn test_heartbeat_before_frame() {
        let decoded = decode_message("\nRECEIPT\nreceipt-id:7\n\n\0").unwrap();
        assert_eq!(decoded[0], Incoming::Heartbeat);
        assert!(matches!(&decoded[1], Incoming::Frame(f) if f.command == Command::Receipt));
    }

    #[test]
    fn test_multiple_frames_in_one_message() {
        let decoded = decode_message("RECEIPT\nreceipt-id:1\n\n\0RECEIPT\nreceipt-id:2\n\n\0").unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_bad_frame_does_not_drop_its_neighbours() {
        let raw = "MESSAGE\nsubscription:sub-1\n\n{}\0BOGUS\n\n\0RECEIPT\nreceipt-id:3\n\n\0";
        let decoded = decode_message(raw).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(matches!(&decoded[0], Incoming::Frame(f) if f.command == Command::Message));
        assert!(matches!(&decoded[1], Incoming::Frame(f) if f.command == Command::Receipt));

        assert_eq!(
            decode_message("BOGUS\n\n\0"),
            Err(FrameError::UnknownCommand("BOGUS".to_string()))
        );
    }

    #[test]
    fn test_content_length_truncates_body() {
        let frame = Frame::parse("MESSAGE\ncontent-length:2\n\nhi\n").unwrap();
        assert_eq!(frame.body, "hi");
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert_eq!(
            Frame::parse("HELLO\n\n"),
            Err(FrameError::UnknownCommand("HELLO".to_string()))
        );
    }

    #[test]
    fn test_bad_escape_rejected() {
        assert!(matches!(
            Frame::parse("MESSAGE\nfoo:bar\\t\n\n"),
            Err(FrameError::BadEscape(_))
        ));
    }

    #[test]
    fn test_heartbeat_negotiation() {
        let ours = HeartBeat::new(4000, 4000);
        let (out, inc) = ours.negotiate(HeartBeat::new(10000, 10000));
        assert_eq!(out, Some(Duration::from_millis(10000)));
        assert_eq!(inc, Some(Duration::from_millis(10000)));

        let (out, inc) = ours.negotiate(HeartBeat::new(0, 0));
        assert_eq!(out, None);
        assert_eq!(inc, None);

        let (out, inc) = ours.negotiate(HeartBeat::new(1000, 0));
        assert_eq!(out, None);
        assert_eq!(inc, Some(Duration::from_millis(4000)));
    }

    #[test]
    fn test_heartbeat_header_parse() {
        assert_eq!(HeartBeat::parse("0, 4000"), Some(HeartBeat::new(0, 4000)));
        assert_eq!(HeartBeat::parse("garbage"), None);
    }
}
