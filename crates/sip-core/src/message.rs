//! The typed SIP message model.
//!
//! The transaction state machine never touches raw header text; it reads the
//! structured fields parsed here and drives on the `is_*` predicates. The
//! field split mirrors the headers GB/T 28181 actually uses, including the
//! `Subject` carrier of the SSRC.

use std::fmt;

use crate::error::{Error, Result};
use crate::reader::RawSipMessage;

/// The GB28181 subset of SIP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Message,
    Invite,
    Ack,
    Bye,
}

impl SipMethod {
    pub fn from_token(s: &str) -> Result<SipMethod> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "MESSAGE" => Ok(SipMethod::Message),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            other => Err(Error::UnsupportedMethod(other.to_string())),
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Message => "MESSAGE",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SipMessageKind {
    #[default]
    Request,
    Response,
}

/// A parsed SIP message.
///
/// Composite headers keep both the raw text (for echoing in responses and
/// serialisation) and the parsed components (for the state machine). Example
/// values follow the GB numbering convention: device ids end in type `132`,
/// server ids in type `200`.
#[derive(Debug, Clone, Default)]
pub struct SipMessage {
    pub kind: SipMessageKind,

    // For requests.
    pub method: Option<SipMethod>,
    /// For example: `sip:34020000001320000001@3402000000`
    pub request_uri: String,
    pub request_uri_user: String,
    pub request_uri_host: String,

    // For responses.
    pub status: u16,

    /// For example: `SIP/2.0/TCP 192.168.3.82:5060;rport;branch=z9hG4bK0l31rx`
    pub via: String,
    pub via_transport: String,
    pub via_send_by: String,
    pub via_send_by_address: String,
    pub via_send_by_port: u16,
    /// The transaction identifier, always prefixed `z9hG4bK`.
    pub via_branch: String,
    pub via_rport: String,

    /// For example: `<sip:34020000002000000001@3402000000>;tag=gblink1er282t`
    pub from: String,
    pub from_address_user: String,
    pub from_address_host: String,
    pub from_tag: String,

    pub to: String,
    pub to_address_user: String,
    pub to_address_host: String,
    pub to_tag: String,

    pub call_id: String,
    /// For example: `<sip:34020000001320000001@192.168.3.82:5060>`
    pub contact: String,
    pub contact_user: String,
    pub contact_host: String,
    pub contact_host_address: String,
    pub contact_host_port: u16,

    pub expires: Option<u32>,
    pub max_forwards: u32,

    pub cseq: String,
    pub cseq_number: u32,
    pub cseq_method: String,

    /// GB/T 28181 §9: `SSRC:DomainID` style carrier, e.g.
    /// `34020000001320000001:0200001234,34020000002000000001:0`.
    pub subject: String,
    pub content_type: String,

    pub body: String,
    /// Body with `\r`/`\n` escaped, for one-line logging.
    pub body_escaped: String,
}

impl SipMessage {
    /// Build the typed view over one framed message.
    pub fn parse(raw: &RawSipMessage) -> Result<SipMessage> {
        let mut msg = SipMessage::default();

        let mut parts = raw.start_line.split_ascii_whitespace();
        let first = parts.next().ok_or_else(|| Error::InvalidStartLine(raw.start_line.clone()))?;
        if first.eq_ignore_ascii_case("SIP/2.0") {
            msg.kind = SipMessageKind::Response;
            let status = parts.next().ok_or_else(|| Error::InvalidStartLine(raw.start_line.clone()))?;
            msg.status = status
                .parse()
                .map_err(|_| Error::InvalidStartLine(raw.start_line.clone()))?;
        } else {
            msg.kind = SipMessageKind::Request;
            msg.method = Some(SipMethod::from_token(first)?);
            let uri = parts.next().ok_or_else(|| Error::InvalidStartLine(raw.start_line.clone()))?;
            msg.request_uri = uri.to_string();
            let (user, host) = parse_address(uri);
            msg.request_uri_user = user;
            msg.request_uri_host = host;
        }

        if let Some(via) = raw.header("Via") {
            msg.parse_via(via)?;
        }
        if let Some(from) = raw.header("From") {
            msg.parse_from(from)?;
        }
        if let Some(to) = raw.header("To") {
            msg.parse_to(to)?;
        }
        if let Some(v) = raw.header("Call-ID") {
            msg.call_id = v.to_string();
        }
        if let Some(cseq) = raw.header("CSeq") {
            msg.parse_cseq(cseq)?;
        }
        if let Some(contact) = raw.header("Contact") {
            msg.parse_contact(contact)?;
        }
        if let Some(v) = raw.header("Expires") {
            msg.expires = Some(
                v.parse()
                    .map_err(|_| Error::InvalidHeader { name: "Expires", value: v.to_string() })?,
            );
        }
        if let Some(v) = raw.header("Max-Forwards") {
            msg.max_forwards = v.parse().unwrap_or(0);
        }
        if let Some(v) = raw.header("Subject") {
            msg.subject = v.to_string();
        }
        if let Some(v) = raw.header("Content-Type") {
            msg.content_type = v.to_string();
        }

        msg.set_body(raw.body.clone());
        Ok(msg)
    }

    /// The id this message identifies its device by: the request-URI user
    /// for requests, the From user for responses.
    pub fn device_id(&self) -> &str {
        match self.kind {
            SipMessageKind::Request => &self.request_uri_user,
            SipMessageKind::Response => &self.from_address_user,
        }
    }

    /// The SSRC component of the GB `Subject` header
    /// (`<sender>:<ssrc>,<receiver>:0`).
    pub fn ssrc_domain_id(&self) -> &str {
        let first = self.subject.split(',').next().unwrap_or("");
        match first.split_once(':') {
            Some((_, ssrc)) => ssrc.trim(),
            None => "",
        }
    }

    pub fn set_body(&mut self, v: String) {
        self.body_escaped = v.replace('\r', "\\r").replace('\n', "\\n");
        self.body = v;
    }

    fn parse_via(&mut self, via: &str) -> Result<()> {
        self.via = via.to_string();

        let (proto, rest) = via
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidHeader { name: "Via", value: via.to_string() })?;
        self.via_transport = proto.rsplit('/').next().unwrap_or("").to_string();

        let mut params = rest.trim().split(';');
        self.via_send_by = params.next().unwrap_or("").to_string();
        let (addr, port) = parse_hostport(&self.via_send_by, 5060);
        self.via_send_by_address = addr;
        self.via_send_by_port = port;

        for p in params {
            let p = p.trim();
            if let Some(branch) = p.strip_prefix("branch=") {
                self.via_branch = branch.to_string();
            } else if p == "rport" || p.starts_with("rport=") {
                self.via_rport = p.to_string();
            }
        }
        Ok(())
    }

    fn parse_from(&mut self, from: &str) -> Result<()> {
        self.from = from.to_string();
        let (user, host, tag) = parse_name_addr(from);
        self.from_address_user = user;
        self.from_address_host = host;
        self.from_tag = tag;
        Ok(())
    }

    fn parse_to(&mut self, to: &str) -> Result<()> {
        self.to = to.to_string();
        let (user, host, tag) = parse_name_addr(to);
        self.to_address_user = user;
        self.to_address_host = host;
        self.to_tag = tag;
        Ok(())
    }

    fn parse_cseq(&mut self, cseq: &str) -> Result<()> {
        self.cseq = cseq.to_string();
        let (number, method) = cseq
            .trim()
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::InvalidHeader { name: "CSeq", value: cseq.to_string() })?;
        self.cseq_number = number
            .parse()
            .map_err(|_| Error::InvalidHeader { name: "CSeq", value: cseq.to_string() })?;
        self.cseq_method = method.trim().to_string();
        Ok(())
    }

    fn parse_contact(&mut self, contact: &str) -> Result<()> {
        self.contact = contact.to_string();
        let (user, host, _) = parse_name_addr(contact);
        self.contact_user = user;
        self.contact_host = host.clone();
        let (addr, port) = parse_hostport(&host, 5060);
        self.contact_host_address = addr;
        self.contact_host_port = port;
        Ok(())
    }

    // Predicates the state machine drives on.

    pub fn is_register(&self) -> bool {
        self.kind == SipMessageKind::Request && self.method == Some(SipMethod::Register)
    }

    pub fn is_message(&self) -> bool {
        self.kind == SipMessageKind::Request && self.method == Some(SipMethod::Message)
    }

    pub fn is_invite(&self) -> bool {
        self.kind == SipMessageKind::Request && self.method == Some(SipMethod::Invite)
    }

    pub fn is_bye(&self) -> bool {
        self.kind == SipMessageKind::Request && self.method == Some(SipMethod::Bye)
    }

    pub fn is_trying(&self) -> bool {
        self.kind == SipMessageKind::Response && self.cseq_method == "INVITE" && self.status == 100
    }

    pub fn is_invite_ok(&self) -> bool {
        self.kind == SipMessageKind::Response && self.cseq_method == "INVITE" && self.status == 200
    }

    pub fn is_bye_ok(&self) -> bool {
        self.kind == SipMessageKind::Response && self.cseq_method == "BYE" && self.status == 200
    }

    /// Start a request; the caller fills the dialog headers.
    pub fn request(method: SipMethod, uri_user: &str, uri_host: &str) -> SipMessage {
        let mut msg = SipMessage {
            kind: SipMessageKind::Request,
            method: Some(method),
            request_uri: format!("sip:{uri_user}@{uri_host}"),
            request_uri_user: uri_user.to_string(),
            request_uri_host: uri_host.to_string(),
            max_forwards: 70,
            ..SipMessage::default()
        };
        msg.cseq_method = method.to_string();
        msg
    }

    /// A response echoing the dialog identity of `req`. A To tag is added
    /// when the peer has none yet, as the accepting side must.
    pub fn reply_to(req: &SipMessage, status: u16) -> SipMessage {
        let mut msg = SipMessage {
            kind: SipMessageKind::Response,
            status,
            via: req.via.clone(),
            from: req.from.clone(),
            to: req.to.clone(),
            call_id: req.call_id.clone(),
            cseq: req.cseq.clone(),
            cseq_number: req.cseq_number,
            cseq_method: req.cseq_method.clone(),
            expires: req.expires,
            ..SipMessage::default()
        };
        msg.parse_via(&req.via).ok();
        msg.parse_from(&req.from).ok();
        msg.parse_to(&req.to).ok();
        if msg.to_tag.is_empty() && status == 200 {
            let tag = crate::token::tag();
            msg.to = format!("{};tag={}", msg.to, tag);
            msg.to_tag = tag;
        }
        msg
    }

    /// Render for the wire.
    pub fn to_wire(&self) -> String {
        let mut s = String::with_capacity(512);
        match self.kind {
            SipMessageKind::Request => {
                let method = self.method.map(|m| m.to_string()).unwrap_or_default();
                s.push_str(&format!("{method} {} SIP/2.0\r\n", self.request_uri));
            }
            SipMessageKind::Response => {
                s.push_str(&format!("SIP/2.0 {} {}\r\n", self.status, status_text(self.status)));
            }
        }

        if !self.via.is_empty() {
            s.push_str(&format!("Via: {}\r\n", self.via));
        }
        if !self.from.is_empty() {
            s.push_str(&format!("From: {}\r\n", self.from));
        }
        if !self.to.is_empty() {
            s.push_str(&format!("To: {}\r\n", self.to));
        }
        if !self.call_id.is_empty() {
            s.push_str(&format!("Call-ID: {}\r\n", self.call_id));
        }
        if !self.cseq_method.is_empty() {
            s.push_str(&format!("CSeq: {} {}\r\n", self.cseq_number, self.cseq_method));
        }
        if !self.contact.is_empty() {
            s.push_str(&format!("Contact: {}\r\n", self.contact));
        }
        if !self.subject.is_empty() {
            s.push_str(&format!("Subject: {}\r\n", self.subject));
        }
        if self.kind == SipMessageKind::Request && self.max_forwards > 0 {
            s.push_str(&format!("Max-Forwards: {}\r\n", self.max_forwards));
        }
        if let Some(expires) = self.expires {
            s.push_str(&format!("Expires: {expires}\r\n"));
        }
        s.push_str(&format!("User-Agent: {}\r\n", crate::token::USER_AGENT));
        if !self.content_type.is_empty() {
            s.push_str(&format!("Content-Type: {}\r\n", self.content_type));
        }
        s.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        s.push_str(&self.body);
        s
    }
}

/// Split `sip:user@host` (optionally angle-bracketed, optionally with a
/// display name) into user and host.
pub fn parse_address(address: &str) -> (String, String) {
    let inner = match (address.find('<'), address.find('>')) {
        (Some(l), Some(r)) if l < r => &address[l + 1..r],
        _ => address,
    };
    let inner = inner.strip_prefix("sip:").unwrap_or(inner);
    let inner = inner.split(';').next().unwrap_or(inner);
    match inner.split_once('@') {
        Some((user, host)) => (user.to_string(), host.to_string()),
        None => (String::new(), inner.to_string()),
    }
}

/// Split `host[:port]`, with a default port.
pub fn parse_hostport(s: &str, default_port: u16) -> (String, u16) {
    match s.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (s.to_string(), default_port),
        },
        None => (s.to_string(), default_port),
    }
}

/// The `tag=` parameter of a From/To header, if present.
fn parse_name_addr(s: &str) -> (String, String, String) {
    let (user, host) = parse_address(s);
    let tag = s
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("tag="))
        .unwrap_or("")
        .to_string();
    (user, host, tag)
}

fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        _ => "Unknown",
    }
}
