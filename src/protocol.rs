//! Token and packet model for the Poly/ML IDE protocol.
//!
//! The wire format frames every field with a single escape byte followed by a
//! one-letter code. A packet opens with `<ESC><CODE>` and closes with the
//! lowercase of the same letter; in between, plain text alternates with
//! escape codes. This module holds the parsed representation (`Token`,
//! `Packet`), the typed pop operations decoders consume packets with, and the
//! request encoder.

use std::collections::VecDeque;
use std::fmt;

use crate::error::Error;

/// The escape marker byte that introduces every code letter.
pub const ESC: u8 = 0x1b;

/// Response kinds that carry a request id as their second token.
///
/// 'M' is deliberately absent: it provides no request id and cannot be
/// correlated.
pub const RESPONSE_CODES: [char; 5] = ['R', 'I', 'V', 'O', 'T'];

/// One element of a packet: either raw text (possibly empty) or an escape
/// code letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Code(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Text(s) => write!(f, "{:?}", s),
            Token::Code(c) => write!(f, "ESC[{}]", c),
        }
    }
}

/// An ordered sequence of tokens, consumed front-to-back.
///
/// The first token is always an escape code naming the packet's kind, and the
/// last is the matching lowercase closing code. Popping the wrong shape is a
/// [`Error::Protocol`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    tokens: VecDeque<Token>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: Token) {
        self.tokens.push_back(token);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The opening code of the packet, if well-formed.
    pub fn opening_code(&self) -> Result<char, Error> {
        match self.tokens.front() {
            Some(Token::Code(c)) => Ok(*c),
            _ => Err(Error::protocol("malformed packet: no opening code")),
        }
    }

    /// Whether this packet is a recognized response kind carrying a request id.
    pub fn is_response(&self) -> Result<bool, Error> {
        Ok(RESPONSE_CODES.contains(&self.opening_code()?))
    }

    /// The request id of a response packet, without consuming any tokens.
    pub fn response_id(&self) -> Result<u64, Error> {
        match self.tokens.get(1) {
            Some(Token::Text(s)) => s
                .parse()
                .map_err(|_| Error::protocol(format!("bad request id: {:?}", s))),
            other => Err(Error::protocol(format!(
                "expected request id, got: {}",
                other.map(|t| t.to_string()).unwrap_or_else(|| "end of packet".into())
            ))),
        }
    }

    /// Pop the next token regardless of shape.
    pub fn pop(&mut self) -> Result<Token, Error> {
        self.tokens
            .pop_front()
            .ok_or_else(|| Error::protocol("unexpected end of packet"))
    }

    /// Pop a text token and parse it as a decimal integer.
    pub fn pop_int(&mut self) -> Result<u64, Error> {
        match self.pop()? {
            Token::Text(s) => s
                .parse()
                .map_err(|_| Error::protocol(format!("expected int, got: {:?}", s))),
            tok => Err(Error::protocol(format!("expected int, got: {}", tok))),
        }
    }

    /// Pop a text token.
    pub fn pop_str(&mut self) -> Result<String, Error> {
        match self.pop()? {
            Token::Text(s) => Ok(s),
            tok => Err(Error::protocol(format!("expected string, got: {}", tok))),
        }
    }

    /// Pop any escape code and return its letter.
    pub fn pop_any_code(&mut self) -> Result<char, Error> {
        match self.pop()? {
            Token::Code(c) => Ok(c),
            tok => Err(Error::protocol(format!("expected code, got: {}", tok))),
        }
    }

    /// Pop the escape code `expected`, failing on anything else.
    pub fn pop_code(&mut self, expected: char) -> Result<(), Error> {
        let c = self.pop_any_code()?;
        if c == expected {
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "expected code '{}', got: ESC[{}]",
                expected, c
            )))
        }
    }

    /// Pop an empty text token.
    ///
    /// The protocol emits an empty string between certain adjacent escape
    /// codes; decoders consume and discard it explicitly.
    pub fn pop_empty(&mut self) -> Result<(), Error> {
        match self.pop()? {
            Token::Text(s) if s.is_empty() => Ok(()),
            tok => Err(Error::protocol(format!("expected '', got: {}", tok))),
        }
    }

    /// Discard tokens up to and including the escape code `code`.
    pub fn pop_until_code(&mut self, code: char) -> Result<(), Error> {
        loop {
            match self.pop()? {
                Token::Code(c) if c == code => return Ok(()),
                _ => continue,
            }
        }
    }
}

/// One argument of an outgoing request: a decimal integer or raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Int(u64),
    Text(String),
}

impl Arg {
    pub fn text(s: impl Into<String>) -> Self {
        Arg::Text(s.into())
    }
}

impl From<u64> for Arg {
    fn from(n: u64) -> Self {
        Arg::Int(n)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Text(s.to_string())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(n) => write!(f, "{}", n),
            Arg::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Encode a request frame:
/// `<ESC><CODE_UPPER><id><ESC>,<arg0><ESC>,<arg1>...<ESC><code_lower>`.
///
/// Text arguments must not contain the escape byte; the protocol has no way
/// to quote it.
pub fn encode_request(code: char, id: u64, args: &[Arg]) -> Result<Vec<u8>, Error> {
    for arg in args {
        if let Arg::Text(s) = arg {
            if s.as_bytes().contains(&ESC) {
                return Err(Error::protocol("request argument contains the escape byte"));
            }
        }
    }

    let mut frame = Vec::new();
    frame.push(ESC);
    frame.push(code.to_ascii_uppercase() as u8);
    frame.extend_from_slice(id.to_string().as_bytes());
    for arg in args {
        frame.push(ESC);
        frame.push(b',');
        frame.extend_from_slice(arg.to_string().as_bytes());
    }
    frame.push(ESC);
    frame.push(code.to_ascii_lowercase() as u8);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn packet_of(tokens: Vec<Token>) -> Packet {
        let mut p = Packet::new();
        for t in tokens {
            p.push(t);
        }
        p
    }

    #[test]
    fn test_typed_pops() {
        let mut p = packet_of(vec![
            Token::Code('R'),
            Token::Text("42".into()),
            Token::Code(','),
            Token::Text("hello".into()),
            Token::Text(String::new()),
            Token::Code('r'),
        ]);

        assert_eq!(p.opening_code().unwrap(), 'R');
        p.pop_code('R').unwrap();
        assert_eq!(p.pop_int().unwrap(), 42);
        p.pop_code(',').unwrap();
        assert_eq!(p.pop_str().unwrap(), "hello");
        p.pop_empty().unwrap();
        assert_eq!(p.pop_any_code().unwrap(), 'r');
        assert!(p.is_empty());
    }

    #[test]
    fn test_wrong_shape_is_protocol_error() {
        let mut p = packet_of(vec![Token::Code('R'), Token::Code(',')]);
        p.pop().unwrap();
        // A code where an int is expected.
        assert!(matches!(p.pop_int(), Err(crate::Error::Protocol(_))));

        let mut p = packet_of(vec![Token::Text("text".into())]);
        assert!(matches!(p.pop_any_code(), Err(crate::Error::Protocol(_))));

        let mut p = packet_of(vec![Token::Text("not-empty".into())]);
        assert!(matches!(p.pop_empty(), Err(crate::Error::Protocol(_))));

        let mut p = Packet::new();
        assert!(matches!(p.pop(), Err(crate::Error::Protocol(_))));
    }

    #[test]
    fn test_is_response_recognizes_correlatable_kinds() {
        for code in RESPONSE_CODES {
            let p = packet_of(vec![Token::Code(code), Token::Text("7".into())]);
            assert!(p.is_response().unwrap(), "code {} should be a response", code);
            assert_eq!(p.response_id().unwrap(), 7);
        }

        let p = packet_of(vec![Token::Code('M'), Token::Text("7".into())]);
        assert!(!p.is_response().unwrap());
    }

    #[test]
    fn test_malformed_packet_without_opening_code() {
        let p = packet_of(vec![Token::Text("garbage".into())]);
        assert!(matches!(p.is_response(), Err(crate::Error::Protocol(_))));
    }

    #[test]
    fn test_encode_request_layout() {
        let frame = encode_request(
            'R',
            3,
            &[Arg::text("-scratch-"), Arg::Int(0), Arg::Int(18)],
        )
        .unwrap();
        assert_eq!(
            frame,
            b"\x1bR3\x1b,-scratch-\x1b,0\x1b,18\x1br".to_vec()
        );
    }

    #[test]
    fn test_encode_request_uppercases_code() {
        let frame = encode_request('k', 9, &[Arg::Int(4)]).unwrap();
        assert_eq!(frame, b"\x1bK9\x1b,4\x1bk".to_vec());
    }

    #[test]
    fn test_encode_request_rejects_embedded_escape() {
        let result = encode_request('R', 0, &[Arg::text("bad\x1btext")]);
        assert!(matches!(result, Err(crate::Error::Protocol(_))));
    }
}
