//! Incremental framing of SIP messages on a TCP byte stream.
//!
//! SIP-over-TCP delimits each message with an empty line after the headers
//! and a `Content-Length` body. The framer accumulates bytes and yields one
//! tokenised [`RawSipMessage`] at a time; [`crate::SipMessage::parse`] turns
//! that into the typed model.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};

/// Largest header section we accept before assuming a broken peer.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A tokenised SIP message: start line, header list, body text.
#[derive(Debug, Clone, Default)]
pub struct RawSipMessage {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawSipMessage {
    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Accumulates TCP bytes and splits complete SIP messages off the front.
#[derive(Default)]
pub struct SipFramer {
    buf: BytesMut,
}

impl SipFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<RawSipMessage>> {
        // Devices keep the connection alive with bare CRLF pairs.
        while self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
        }

        let Some(head_end) = find_subsequence(&self.buf, b"\r\n\r\n") else {
            if self.buf.len() > MAX_HEADER_BYTES {
                return Err(Error::TooLarge(self.buf.len()));
            }
            return Ok(None);
        };

        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|e| Error::Parse(format!("non-utf8 header section: {e}")))?;

        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or("").to_string();
        if start_line.is_empty() {
            return Err(Error::Parse("empty start line".into()));
        }

        let mut headers = Vec::new();
        let mut content_length = 0usize;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::Parse(format!("malformed header line: {line}")));
            };
            let name = name.trim().to_string();
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value
                    .parse()
                    .map_err(|_| Error::InvalidHeader { name: "Content-Length", value: value.clone() })?;
            }
            headers.push((name, value));
        }

        let total = head_end + 4 + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = self.buf.split_to(total);
        let body = String::from_utf8_lossy(&frame[head_end + 4..]).into_owned();
        Ok(Some(RawSipMessage { start_line, headers, body }))
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
        Via: SIP/2.0/TCP 192.168.3.99:5060;rport;branch=z9hG4bK563315752\r\n\
        From: <sip:34020000001320000001@3402000000>;tag=2043466181\r\n\
        To: <sip:34020000001320000001@3402000000>\r\n\
        Call-ID: 1011047669\r\n\
        CSeq: 1 REGISTER\r\n\
        Contact: <sip:34020000001320000001@192.168.3.99:5060>\r\n\
        Max-Forwards: 70\r\n\
        Expires: 3600\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn splits_one_message() {
        let mut framer = SipFramer::new();
        framer.extend(REGISTER.as_bytes());

        let raw = framer.next_message().unwrap().unwrap();
        assert!(raw.start_line.starts_with("REGISTER "));
        assert_eq!(raw.header("call-id"), Some("1011047669"));
        assert_eq!(raw.header("CSeq"), Some("1 REGISTER"));
        assert!(raw.body.is_empty());

        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn waits_for_torn_reads() {
        let bytes = REGISTER.as_bytes();
        let mut framer = SipFramer::new();
        for chunk in bytes.chunks(7) {
            framer.extend(chunk);
        }
        assert!(framer.next_message().unwrap().is_some());
    }

    #[test]
    fn body_honours_content_length() {
        let msg = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\r\n\
            Call-ID: x\r\n\
            CSeq: 20 MESSAGE\r\n\
            Content-Type: Application/MANSCDP+xml\r\n\
            Content-Length: 11\r\n\r\nhello\r\nbody";
        let mut framer = SipFramer::new();
        framer.extend(msg.as_bytes());

        let raw = framer.next_message().unwrap().unwrap();
        assert_eq!(raw.body, "hello\r\nbody");
    }

    #[test]
    fn pipelined_messages_split_in_order() {
        let keepalive = "\r\n\r\n";
        let mut framer = SipFramer::new();
        framer.extend(keepalive.as_bytes());
        framer.extend(REGISTER.as_bytes());
        framer.extend(REGISTER.as_bytes());

        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_some());
        assert!(framer.next_message().unwrap().is_none());
    }

    #[test]
    fn incomplete_body_is_not_yielded() {
        let msg = "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 5\r\n\r\nab";
        let mut framer = SipFramer::new();
        framer.extend(msg.as_bytes());
        assert!(framer.next_message().unwrap().is_none());

        framer.extend(b"cde");
        let raw = framer.next_message().unwrap().unwrap();
        assert_eq!(raw.body, "abcde");
    }
}
