use crate::stomp::error::{Result, StompError};
use bytes::{Buf, Bytes, BytesMut};

/// Upper bound on a single frame, command line through NUL terminator.
pub const FRAME_MAX_SIZE: usize = 1 << 20;

/// STOMP 1.2 frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    // Client commands
    Connect,
    Stomp,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    // Server commands
    Connected,
    Message,
    Receipt,
    Error,
}

impl StompCommand {
    pub fn as_name(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Stomp => "STOMP",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Ack => "ACK",
            StompCommand::Nack => "NACK",
            StompCommand::Begin => "BEGIN",
            StompCommand::Commit => "COMMIT",
            StompCommand::Abort => "ABORT",
            StompCommand::Disconnect => "DISCONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "CONNECT" => Some(StompCommand::Connect),
            "STOMP" => Some(StompCommand::Stomp),
            "SEND" => Some(StompCommand::Send),
            "SUBSCRIBE" => Some(StompCommand::Subscribe),
            "UNSUBSCRIBE" => Some(StompCommand::Unsubscribe),
            "ACK" => Some(StompCommand::Ack),
            "NACK" => Some(StompCommand::Nack),
            "BEGIN" => Some(StompCommand::Begin),
            "COMMIT" => Some(StompCommand::Commit),
            "ABORT" => Some(StompCommand::Abort),
            "DISCONNECT" => Some(StompCommand::Disconnect),
            "CONNECTED" => Some(StompCommand::Connected),
            "MESSAGE" => Some(StompCommand::Message),
            "RECEIPT" => Some(StompCommand::Receipt),
            "ERROR" => Some(StompCommand::Error),
            _ => None,
        }
    }

    /// CONNECT and CONNECTED frames never escape header values, per the
    /// STOMP 1.2 backward-compatibility rule. Every other frame does.
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

/// Outcome of one decode step against the receive buffer.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// Not enough bytes buffered for a full frame.
    Incomplete,
    /// A bare end-of-line, the STOMP heartbeat.
    Heartbeat,
    Frame(StompFrame),
}

/// A single STOMP frame. Headers keep arrival order; a repeated header
/// name keeps its first value when read through [`StompFrame::header_value`].
#[derive(Debug, Clone)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value recorded for a header name.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> Bytes {
        let escaped = self.command.escapes_headers();
        let mut out = BytesMut::with_capacity(self.body.len() + 128);
        out.extend_from_slice(self.command.as_name().as_bytes());
        out.extend_from_slice(b"\n");
        for (name, value) in &self.headers {
            if escaped {
                out.extend_from_slice(escape_header(name).as_bytes());
                out.extend_from_slice(b":");
                out.extend_from_slice(escape_header(value).as_bytes());
            } else {
                out.extend_from_slice(name.as_bytes());
                out.extend_from_slice(b":");
                out.extend_from_slice(value.as_bytes());
            }
            out.extend_from_slice(b"\n");
        }
        if !self.body.is_empty() && self.header_value("content-length").is_none() {
            out.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\n");
        out.extend_from_slice(&self.body);
        out.extend_from_slice(b"\0");
        out.freeze()
    }

    /// Decodes one frame (or heartbeat) from the front of `buf`, consuming
    /// the bytes only when a complete unit is present.
    pub fn decode(buf: &mut BytesMut) -> Result<DecodeOutcome> {
        if buf.is_empty() {
            return Ok(DecodeOutcome::Incomplete);
        }
        if buf[0] == b'\n' {
            buf.advance(1);
            return Ok(DecodeOutcome::Heartbeat);
        }
        if buf[0] == b'\r' {
            if buf.len() < 2 {
                return Ok(DecodeOutcome::Incomplete);
            }
            if buf[1] == b'\n' {
                buf.advance(2);
                return Ok(DecodeOutcome::Heartbeat);
            }
            return Err(StompError::MalformedHeader("\r".to_string()));
        }

        let Some(command_end) = find_line_end(buf, 0) else {
            return incomplete_guard(buf.len());
        };
        let command_name = line_str(&buf[..command_end])?;
        let command = StompCommand::from_name(command_name)
            .ok_or_else(|| StompError::UnknownCommand(command_name.to_string()))?;

        // Header lines until the blank separator line.
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut pos = command_end + 1;
        let body_start = loop {
            let Some(line_end) = find_line_end(buf, pos) else {
                return incomplete_guard(buf.len());
            };
            let line = line_str(&buf[pos..line_end])?;
            pos = line_end + 1;
            if line.is_empty() {
                break pos;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(StompError::MalformedHeader(line.to_string()));
            };
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        };

        let content_length = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map(|(_, v)| {
                v.parse::<usize>()
                    .map_err(|_| StompError::InvalidContentLength(v.clone()))
            })
            .transpose()?;

        let frame_end = match content_length {
            Some(len) => {
                let end = body_start + len;
                if buf.len() < end + 1 {
                    return incomplete_guard(buf.len());
                }
                if buf[end] != 0 {
                    return Err(StompError::MissingTerminator);
                }
                end + 1
            }
            None => {
                let Some(nul) = buf[body_start..].iter().position(|b| *b == 0) else {
                    return incomplete_guard(buf.len());
                };
                body_start + nul + 1
            }
        };
        if frame_end > FRAME_MAX_SIZE {
            return Err(StompError::FrameTooLarge(frame_end));
        }

        let consumed = buf.split_to(frame_end).freeze();
        let body = consumed.slice(body_start..frame_end - 1);
        Ok(DecodeOutcome::Frame(StompFrame {
            command,
            headers,
            body,
        }))
    }
}

fn incomplete_guard(buffered: usize) -> Result<DecodeOutcome> {
    if buffered > FRAME_MAX_SIZE {
        return Err(StompError::FrameTooLarge(buffered));
    }
    Ok(DecodeOutcome::Incomplete)
}

fn find_line_end(buf: &BytesMut, from: usize) -> Option<usize> {
    buf[from..].iter().position(|b| *b == b'\n').map(|i| from + i)
}

/// A header or command line as UTF-8, with an optional trailing CR stripped.
fn line_str(raw: &[u8]) -> Result<&str> {
    let raw = match raw.last() {
        Some(b'\r') => &raw[..raw.len() - 1],
        _ => raw,
    };
    std::str::from_utf8(raw)
        .map_err(|_| StompError::MalformedHeader(String::from_utf8_lossy(raw).into_owned()))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
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
            _ => return Err(StompError::InvalidEscape),
        }
    }
    Ok(out)
}
