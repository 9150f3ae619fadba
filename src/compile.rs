//! Compile response decoding.
//!
//! A compile response is an 'R' packet carrying the request id, the new
//! parse-tree handle, a one-letter result code, and an ordered list of
//! error/warning/exception messages. Message text may embed 'D'/'d' location
//! sub-messages naming the symbol a fragment refers to; those are accepted in
//! both exception and error contexts. All extracted text is
//! whitespace-normalized and fragments join with single spaces.

use std::fmt;

use crate::error::Error;
use crate::protocol::Packet;

/// Overall outcome of one compile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success,
    Exception,
    PreludeError,
    TypecheckError,
    Cancelled,
}

impl ResultCode {
    /// Decode the one-letter wire form.
    fn from_wire(s: &str) -> Result<Self, Error> {
        match s {
            "S" => Ok(ResultCode::Success),
            "X" => Ok(ResultCode::Exception),
            "L" => Ok(ResultCode::PreludeError),
            "F" => Ok(ResultCode::TypecheckError),
            "C" => Ok(ResultCode::Cancelled),
            other => Err(Error::protocol(format!("unknown result code: {:?}", other))),
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultCode::Success => "Success",
            ResultCode::Exception => "Exception in ML code",
            ResultCode::PreludeError => "Error or exception in ML prelude",
            ResultCode::TypecheckError => "Parse or typecheck error",
            ResultCode::Cancelled => "Compilation cancelled",
        };
        write!(f, "{}", text)
    }
}

/// A source span reported by the compiler.
///
/// A wire line number of 0 means "no line" and decodes to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: Option<u32>,
    pub start: u64,
    pub end: u64,
}

/// One diagnostic from a compile response, in reported order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A runtime exception raised during compilation or execution.
    Exception {
        text: String,
        location: Option<Location>,
    },
    Error {
        code: String,
        location: Location,
        text: String,
    },
    Warning {
        code: String,
        location: Location,
        text: String,
    },
}

impl Message {
    pub fn text(&self) -> &str {
        match self {
            Message::Exception { text, .. }
            | Message::Error { text, .. }
            | Message::Warning { text, .. } => text,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            Message::Exception { location, .. } => location.as_ref(),
            Message::Error { location, .. } | Message::Warning { location, .. } => Some(location),
        }
    }
}

/// Decoded outcome of one compile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub code: ResultCode,
    pub messages: Vec<Message>,
}

impl CompileResult {
    pub fn succeeded(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// Collapse every run of whitespace to one space and trim the ends.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn push_fragment(fragments: &mut Vec<String>, text: &str) {
    let normalized = normalize_whitespace(text);
    if !normalized.is_empty() {
        fragments.push(normalized);
    }
}

fn location_from_wire(file: String, line: u64, start: u64, end: u64) -> Location {
    Location {
        file,
        line: if line == 0 { None } else { Some(line as u32) },
        start,
        end,
    }
}

/// Decode a compile response packet.
///
/// Returns the new parse-tree handle together with the structured result.
/// The packet's request id must match `expected_id`; a mismatch is a protocol
/// error.
pub fn decode_compile_response(
    mut packet: Packet,
    expected_id: u64,
) -> Result<(String, CompileResult), Error> {
    packet.pop_code('R')?;
    let rid = packet.pop_int()?;
    if rid != expected_id {
        return Err(Error::protocol(format!(
            "compile response id {} does not match request {}",
            rid, expected_id
        )));
    }
    packet.pop_code(',')?;
    let parse_tree = packet.pop_str()?;
    packet.pop_code(',')?;
    let code = ResultCode::from_wire(&packet.pop_str()?)?;
    packet.pop_code(',')?;
    let _final_offset = packet.pop_int()?;
    packet.pop_code(';')?;
    packet.pop_empty()?;

    let mut messages = Vec::new();
    let mut next = packet.pop_any_code()?;

    // An exception result carries one exception block first; further error
    // entries may still follow it.
    if next == 'X' {
        let (message, after) = decode_exception(&mut packet)?;
        messages.push(message);
        next = after;
    }

    while next == 'E' {
        messages.push(decode_entry(&mut packet)?);
        next = packet.pop_any_code()?;
    }
    // `next` is the packet's closing 'r'; anything left is ignored.

    Ok((parse_tree, CompileResult { code, messages }))
}

/// Decode an exception block, the opening 'X' already consumed.
///
/// Free text interleaves with location sub-messages until the terminating
/// 'x'. Returns the message and the code following the block.
fn decode_exception(packet: &mut Packet) -> Result<(Message, char), Error> {
    let mut fragments = Vec::new();
    let mut location = None;
    loop {
        push_fragment(&mut fragments, &packet.pop_str()?);
        match packet.pop_any_code()? {
            'D' => {
                let (loc, symbol) = decode_location_block(packet)?;
                push_fragment(&mut fragments, &symbol);
                location.get_or_insert(loc);
            }
            'x' => break,
            c => {
                return Err(Error::protocol(format!(
                    "unexpected code ESC[{}] in exception block",
                    c
                )))
            }
        }
    }
    packet.pop_empty()?;
    let next = packet.pop_any_code()?;
    Ok((
        Message::Exception {
            text: fragments.join(" "),
            location,
        },
        next,
    ))
}

/// Decode one 'E' entry, the opening code already consumed.
fn decode_entry(packet: &mut Packet) -> Result<Message, Error> {
    let code = packet.pop_str()?;
    packet.pop_code(',')?;
    let file = packet.pop_str()?;
    packet.pop_code(',')?;
    let line = packet.pop_int()?;
    packet.pop_code(',')?;
    let start = packet.pop_int()?;
    packet.pop_code(',')?;
    let end = packet.pop_int()?;
    packet.pop_code(';')?;

    let mut fragments = Vec::new();
    loop {
        push_fragment(&mut fragments, &packet.pop_str()?);
        match packet.pop_any_code()? {
            'D' => {
                let (_, symbol) = decode_location_block(packet)?;
                push_fragment(&mut fragments, &symbol);
            }
            'e' => break,
            c => {
                return Err(Error::protocol(format!(
                    "unexpected code ESC[{}] in message entry",
                    c
                )))
            }
        }
    }
    packet.pop_empty()?;

    let location = location_from_wire(file, line, start, end);
    let text = fragments.join(" ");
    Ok(if code == "E" {
        Message::Error { code, location, text }
    } else {
        Message::Warning { code, location, text }
    })
}

/// Decode a 'D'...'d' location sub-message, the opening 'D' already consumed.
///
/// Returns the location and the symbol text; the trailing text after 'd' is
/// left for the caller's fragment loop.
fn decode_location_block(packet: &mut Packet) -> Result<(Location, String), Error> {
    packet.pop_empty()?;
    packet.pop_code(',')?;
    let file = packet.pop_str()?;
    packet.pop_code(',')?;
    let line = packet.pop_int()?;
    packet.pop_code(',')?;
    let start = packet.pop_int()?;
    packet.pop_code(',')?;
    let end = packet.pop_int()?;
    packet.pop_code(';')?;
    let symbol = packet.pop_str()?;
    packet.pop_code('d')?;
    Ok((location_from_wire(file, line, start, end), symbol))
}
