//! Babble text protocol parser and answer framing.
//!
//! Requests are one command per line:
//! - `LOGIN <id>`, `PUBLISH <msg>`, `FOLLOW <id>`
//! - `TIMELINE`, `FOLLOW_COUNT` (or `FCOUNT`), `RDV`
//!
//! Numeric ids `0`..`5` are accepted in place of the keywords, in that
//! order. A leading `S ` marker asks the server not to answer.
//!
//! Answers are binary frames: a message is its UTF-8 bytes followed by a
//! single `\0`; a multi-part answer starts with its true element count as a
//! big-endian `u32`, followed by at most [`BABBLE_TIMELINE_MAX`] messages.

use crate::queue::Ticket;
use crate::registration::{ClientBundle, ClientSink};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Maximum identifier length in bytes.
pub const BABBLE_ID_SIZE: usize = 16;

/// Maximum published message length in bytes.
pub const BABBLE_SIZE: usize = 64;

/// Maximum number of timeline messages put on the wire.
pub const BABBLE_TIMELINE_MAX: usize = 16;

/// Maximum accepted request line length.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Kind of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Login,
    Publish,
    Follow,
    Timeline,
    FollowCount,
    Rdv,
    /// Issued by the server when a connection closes; never parsed.
    Unregister,
}

impl CommandKind {
    /// Payload bound for this kind; `None` when no payload is allowed.
    pub fn max_payload(self) -> Option<usize> {
        match self {
            CommandKind::Login | CommandKind::Follow => Some(BABBLE_ID_SIZE),
            CommandKind::Publish => Some(BABBLE_SIZE),
            CommandKind::Timeline
            | CommandKind::FollowCount
            | CommandKind::Rdv
            | CommandKind::Unregister => None,
        }
    }

    /// Whether the streaming marker may suppress the answer.
    fn answer_optional(self) -> bool {
        matches!(self, CommandKind::Publish | CommandKind::Follow)
    }

    fn from_token(token: &str) -> Option<Self> {
        let kind = match token.to_ascii_uppercase().as_str() {
            "LOGIN" | "0" => CommandKind::Login,
            "PUBLISH" | "1" => CommandKind::Publish,
            "FOLLOW" | "2" => CommandKind::Follow,
            "TIMELINE" | "3" => CommandKind::Timeline,
            "FOLLOW_COUNT" | "FCOUNT" | "4" => CommandKind::FollowCount,
            "RDV" | "5" => CommandKind::Rdv,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Login => "LOGIN",
            CommandKind::Publish => "PUBLISH",
            CommandKind::Follow => "FOLLOW",
            CommandKind::Timeline => "TIMELINE",
            CommandKind::FollowCount => "FOLLOW_COUNT",
            CommandKind::Rdv => "RDV",
            CommandKind::Unregister => "UNREGISTER",
        };
        f.write_str(name)
    }
}

/// Response attached to a processed command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Answer {
    /// Nothing to send.
    #[default]
    Empty,
    /// One message frame.
    Single(String),
    /// Count frame followed by the most recent messages, oldest first.
    Sequence(Vec<String>),
}

/// One parsed client request.
pub struct Command {
    pub kind: CommandKind,
    pub key: u64,
    pub payload: String,
    pub answer_expected: bool,
    pub answer: Answer,
    /// Connection write half, only carried by LOGIN.
    pub sink: Option<ClientSink>,
    /// Session that issued the command; its answer goes back there only.
    pub origin: Option<Arc<ClientBundle>>,
    /// Execution turn within the originating connection.
    pub ticket: Option<Ticket>,
}

impl Command {
    /// Create an empty command of `kind` on behalf of `key`.
    pub fn new(kind: CommandKind, key: u64) -> Self {
        Self {
            kind,
            key,
            payload: String::new(),
            answer_expected: true,
            answer: Answer::Empty,
            sink: None,
            origin: None,
            ticket: None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key={}", self.kind, self.key)?;
        if !self.payload.is_empty() {
            write!(f, " payload={:?}", self.payload)?;
        }
        if !self.answer_expected {
            f.write_str(" (no answer)")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("answer_expected", &self.answer_expected)
            .field("answer", &self.answer)
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("missing payload for {0}")]
    MissingPayload(CommandKind),
    #[error("payload too long for {kind}: {len} bytes (max: {max})")]
    PayloadTooLong {
        kind: CommandKind,
        len: usize,
        max: usize,
    },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("{0} takes no payload")]
    UnexpectedPayload(CommandKind),
    #[error("already logged in")]
    AlreadyLoggedIn,
}

/// Answer transmission errors
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("client {0} is not registered")]
    NotConnected(u64),
    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Derive the client key from a login identifier (djb2).
pub fn client_key(id: &str) -> u64 {
    id.bytes().fold(5381u64, |hash, byte| {
        hash.wrapping_shl(5)
            .wrapping_add(hash)
            .wrapping_add(u64::from(byte))
    })
}

/// Normalize a raw request line: drop control characters and surrounding blanks.
pub fn str_clean(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Split a cleaned line into its command kind, answer flag and raw payload.
pub fn str_to_command(line: &str) -> Result<(CommandKind, bool, &str), ParseError> {
    let (streaming, line) = match line.split_once(char::is_whitespace) {
        Some((marker, rest)) if marker.eq_ignore_ascii_case("S") => (true, rest.trim_start()),
        _ => (false, line),
    };

    let (token, rest) = match line.split_once(char::is_whitespace) {
        Some((token, rest)) => (token, rest.trim()),
        None => (line, ""),
    };
    if token.is_empty() {
        return Err(ParseError::Empty);
    }

    let kind =
        CommandKind::from_token(token).ok_or_else(|| ParseError::UnknownCommand(token.into()))?;
    let answer_expected = !(streaming && kind.answer_optional());
    Ok((kind, answer_expected, rest))
}

/// Validate the payload of `kind` against its size bound.
pub fn str_to_payload(kind: CommandKind, rest: &str) -> Result<String, ParseError> {
    let Some(max) = kind.max_payload() else {
        if !rest.is_empty() {
            return Err(ParseError::UnexpectedPayload(kind));
        }
        return Ok(String::new());
    };

    if rest.is_empty() {
        return Err(ParseError::MissingPayload(kind));
    }
    if rest.len() > max {
        return Err(ParseError::PayloadTooLong {
            kind,
            len: rest.len(),
            max,
        });
    }
    if max == BABBLE_ID_SIZE && rest.contains(char::is_whitespace) {
        return Err(ParseError::InvalidIdentifier(rest.into()));
    }
    Ok(rest.to_string())
}

/// Parse one request line into a command issued by `key`.
pub fn parse_command(line: &str, key: u64) -> Result<Command, ParseError> {
    let cleaned = str_clean(line);
    let (kind, answer_expected, rest) = str_to_command(&cleaned)?;
    let payload = str_to_payload(kind, rest)?;

    let mut cmd = Command::new(kind, key);
    cmd.payload = payload;
    cmd.answer_expected = answer_expected;
    Ok(cmd)
}

/// Encode one null-terminated message frame.
pub fn message_frame(msg: &str) -> BytesMut {
    let mut frame = BytesMut::with_capacity(msg.len() + 1);
    frame.extend_from_slice(msg.as_bytes());
    frame.put_u8(0);
    frame
}

/// Encode the count frame of a multi-part answer.
pub fn count_frame(count: usize) -> BytesMut {
    let mut frame = BytesMut::with_capacity(4);
    frame.put_u32(u32::try_from(count).unwrap_or(u32::MAX));
    frame
}

/// Write `answer` to `out`, sending at most `limit` elements of a sequence.
///
/// The sequence is consumed front to back; skipped and sent elements are
/// dropped as soon as they are passed. Returns the number of message frames
/// written.
pub fn write_answer<W: Write + ?Sized>(
    answer: Answer,
    out: &mut W,
    limit: usize,
) -> Result<usize, SendError> {
    match answer {
        Answer::Empty => Ok(0),
        Answer::Single(msg) => {
            out.write_all(&message_frame(&msg))?;
            out.flush()?;
            Ok(1)
        }
        Answer::Sequence(items) => {
            let count = items.len();
            out.write_all(&count_frame(count))?;

            let skip = count.saturating_sub(limit);
            let mut sent = 0;
            for item in items.into_iter().skip(skip) {
                out.write_all(&message_frame(&item))?;
                sent += 1;
            }
            out.flush()?;

            assert_eq!(sent, count.min(limit), "timeline frame count mismatch");
            Ok(sent)
        }
    }
}

/// Tell the client its last line could not be parsed.
pub fn notify_parse_error<W: Write + ?Sized>(out: &mut W, err: &ParseError) -> io::Result<()> {
    out.write_all(&message_frame(&format!("error: {err}")))?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_login() {
        let cmd = parse_command("LOGIN alice\r\n", 0).unwrap();
        assert_eq!(cmd.kind, CommandKind::Login);
        assert_eq!(cmd.payload, "alice");
        assert!(cmd.answer_expected);
    }

    #[test]
    fn test_parse_case_insensitive_and_numeric() {
        let cmd = parse_command("publish hello world", 7).unwrap();
        assert_eq!(cmd.kind, CommandKind::Publish);
        assert_eq!(cmd.payload, "hello world");
        assert_eq!(cmd.key, 7);

        let cmd = parse_command("2 bob", 7).unwrap();
        assert_eq!(cmd.kind, CommandKind::Follow);
        assert_eq!(cmd.payload, "bob");

        let cmd = parse_command("fcount", 7).unwrap();
        assert_eq!(cmd.kind, CommandKind::FollowCount);
    }

    #[test]
    fn test_streaming_marker() {
        let cmd = parse_command("S PUBLISH quiet", 1).unwrap();
        assert_eq!(cmd.kind, CommandKind::Publish);
        assert!(!cmd.answer_expected);

        // Replies are the whole point of these commands.
        let cmd = parse_command("S TIMELINE", 1).unwrap();
        assert!(cmd.answer_expected);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_command("   \r\n", 0), Err(ParseError::Empty)));
        assert!(matches!(
            parse_command("SHOUT x", 0),
            Err(ParseError::UnknownCommand(token)) if token == "SHOUT"
        ));
        assert!(matches!(
            parse_command("LOGIN", 0),
            Err(ParseError::MissingPayload(CommandKind::Login))
        ));
        assert!(matches!(
            parse_command("FOLLOW two words", 0),
            Err(ParseError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            parse_command("TIMELINE now", 0),
            Err(ParseError::UnexpectedPayload(CommandKind::Timeline))
        ));
    }

    #[test]
    fn test_payload_bounds() {
        let id = "a".repeat(BABBLE_ID_SIZE);
        assert!(parse_command(&format!("LOGIN {id}"), 0).is_ok());
        assert!(matches!(
            parse_command(&format!("LOGIN {id}x"), 0),
            Err(ParseError::PayloadTooLong { max: BABBLE_ID_SIZE, .. })
        ));

        let msg = "m".repeat(BABBLE_SIZE + 1);
        assert!(matches!(
            parse_command(&format!("PUBLISH {msg}"), 0),
            Err(ParseError::PayloadTooLong { max: BABBLE_SIZE, .. })
        ));
    }

    #[test]
    fn test_str_clean() {
        assert_eq!(str_clean("  LOGIN bob\r\n"), "LOGIN bob");
        assert_eq!(str_clean("\tRDV\0"), "RDV");
    }

    #[test]
    fn test_client_key_is_stable() {
        assert_eq!(client_key("alice"), client_key("alice"));
        assert_ne!(client_key("alice"), client_key("bob"));
        assert_eq!(client_key(""), 5381);
    }

    #[test]
    fn test_command_display() {
        let cmd = parse_command("S FOLLOW bob", 42).unwrap();
        assert_eq!(cmd.to_string(), "FOLLOW key=42 payload=\"bob\" (no answer)");
    }

    #[test]
    fn test_write_single() {
        let mut out = Vec::new();
        let sent = write_answer(Answer::Single("ok".into()), &mut out, 4).unwrap();
        assert_eq!(sent, 1);
        assert_eq!(out, b"ok\0");
    }

    #[test]
    fn test_write_single_flushes() {
        let mut out = io::BufWriter::new(Vec::new());
        write_answer(Answer::Single("ok".into()), &mut out, 4).unwrap();
        assert!(out.buffer().is_empty());
        assert_eq!(out.get_ref().as_slice(), b"ok\0");
    }

    #[test]
    fn test_write_empty() {
        let mut out = Vec::new();
        assert_eq!(write_answer(Answer::Empty, &mut out, 4).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_write_sequence_truncates_but_reports_true_count() {
        let items: Vec<String> = (0..6).map(|i| format!("m{i}")).collect();
        let mut out = Vec::new();
        let sent = write_answer(Answer::Sequence(items), &mut out, 4).unwrap();
        assert_eq!(sent, 4);

        assert_eq!(&out[..4], &6u32.to_be_bytes());
        assert_eq!(&out[4..], b"m2\0m3\0m4\0m5\0");
    }

    #[test]
    fn test_write_short_sequence() {
        let mut out = Vec::new();
        let sent = write_answer(Answer::Sequence(vec!["hi".into()]), &mut out, 4).unwrap();
        assert_eq!(sent, 1);
        assert_eq!(out, b"\0\0\0\x01hi\0");
    }

    #[test]
    fn test_write_failure_is_send_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let result = write_answer(Answer::Single("x".into()), &mut Broken, 4);
        assert!(matches!(result, Err(SendError::Io(_))));
    }

    #[test]
    fn test_notify_parse_error() {
        let mut out = Vec::new();
        notify_parse_error(&mut out, &ParseError::Empty).unwrap();
        assert_eq!(out, b"error: empty command\0");
    }
}
