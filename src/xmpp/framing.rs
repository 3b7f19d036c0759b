//! XMPP wire codec: stanza boundary detection over a TCP byte stream, a small
//! element tree, and the streaming reader/writer pair built on top of them.
//!
//! The chat stream is one unbounded XML document, so nothing here ever buffers
//! more than the stanza currently being assembled. The reader hands out the
//! start tag of each top-level element first; the caller then either decodes the
//! whole subtree or skips it without building a tree.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::ns;
use crate::error::XmppError;

/// Maximum number of buffered bytes that may accumulate without yielding a
/// complete stanza.
///
/// Typical stanzas are a few KB; room lists and vCards stay well under 100 KB.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

const READ_CHUNK: usize = 8192;

const STREAM_CLOSE: &[u8] = b"</stream:stream>";

/// One top-level unit cut out of the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// `<stream:stream ...>` header, possibly preceded by an XML declaration.
    StreamOpen(String),
    /// `</stream:stream>`
    StreamClose,
    /// A complete top-level stanza including its subtree.
    Stanza(String),
}

/// State machine for stanza boundary detection.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Waiting for a stanza to start (between stanzas, or before stream open).
    Idle,
    /// Inside a top-level stanza, collecting events.
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(e: &BytesStart<'_>) -> bool {
    e.name().local_name().as_ref() == b"stream" || e.name().as_ref() == b"stream:stream"
}

/// Extract a single complete frame from the given buffer slice.
///
/// Returns `Ok(Some((frame, bytes_consumed)))` if a complete frame was found and
/// `Ok(None)` if the buffer does not hold one yet. Input that can never become
/// well-formed by reading more is a `MalformedStanza` error. The caller is
/// responsible for advancing past the consumed bytes.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(RawFrame, usize)>, XmppError> {
    // The closing tag appears alone without a matching opening tag in the buffer
    let trimmed = buffer.iter().position(|b| !b.is_ascii_whitespace());
    if let Some(start) = trimmed {
        if buffer[start..].starts_with(STREAM_CLOSE) {
            return Ok(Some((RawFrame::StreamClose, start + STREAM_CLOSE.len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && is_stream_tag(&e) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        RawFrame::StreamOpen(bytes_to_string(&buffer[..tag_end])),
                        tag_end,
                    )));
                }

                depth += 1;

                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && is_stream_tag(&e) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        RawFrame::StreamOpen(bytes_to_string(&buffer[..tag_end])),
                        tag_end,
                    )));
                }

                // Self-closing top-level stanza (e.g., <presence/>, <proceed/>)
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        RawFrame::Stanza(bytes_to_string(&buffer[pos..tag_end])),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                let local_name = e.name().local_name();

                if (local_name.as_ref() == b"stream" || e.name().as_ref() == b"stream:stream")
                    && depth == 0
                {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((RawFrame::StreamClose, tag_end)));
                }

                depth = depth.saturating_sub(1);

                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        RawFrame::Stanza(bytes_to_string(&buffer[stanza_start..tag_end])),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup)) => {
                return Err(XmppError::MalformedStanza("invalid markup declaration".to_string()));
            }
            // Unclosed tag/comment/CDATA: the rest arrives with the next read.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(XmppError::MalformedStanza(e.to_string())),
        }
    }
}

/// Start tag of a top-level element, available before its subtree is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartElement {
    /// Local name, without prefix.
    pub name: String,
    /// Resolved namespace, if declared on the element or implied by its prefix.
    pub namespace: Option<String>,
    pub attrs: Vec<(String, String)>,
}

impl StartElement {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, XmppError> {
    std::str::from_utf8(bytes).map_err(|e| XmppError::MalformedStanza(e.to_string()))
}

/// Resolve one start tag. `inherited` is the parent's namespace.
fn open_tag(e: &BytesStart<'_>, inherited: Option<&str>) -> Result<StartElement, XmppError> {
    let qname = e.name();
    let name = utf8(qname.local_name().as_ref())?.to_string();
    if name.is_empty() {
        return Err(XmppError::MalformedStanza("element with empty local name".to_string()));
    }
    let prefix = match qname.prefix() {
        Some(p) => Some(utf8(p.as_ref())?.to_string()),
        None => None,
    };

    let mut namespace = None;
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| XmppError::MalformedStanza(e.to_string()))?;
        let key = utf8(attr.key.as_ref())?;
        let value = attr
            .unescape_value()
            .map_err(|e| XmppError::MalformedStanza(e.to_string()))?
            .into_owned();

        if key == "xmlns" {
            if prefix.is_none() {
                namespace = Some(value);
            }
        } else if let Some(declared) = key.strip_prefix("xmlns:") {
            if prefix.as_deref() == Some(declared) {
                namespace = Some(value);
            }
        } else {
            attrs.push((key.to_string(), value));
        }
    }

    if namespace.is_none() {
        namespace = match prefix.as_deref() {
            Some("stream") => Some(ns::STREAM.to_string()),
            Some(_) => None,
            None => inherited.map(str::to_string),
        };
    }

    Ok(StartElement { name, namespace, attrs })
}

/// Parse only the first start tag of a raw frame.
pub fn parse_start_tag(raw: &str) -> Result<StartElement, XmppError> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().check_end_names = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => return open_tag(&e, None),
            Ok(Event::Eof) => {
                return Err(XmppError::MalformedStanza("no start element in frame".to_string()))
            }
            Ok(Event::End(_)) => {
                return Err(XmppError::MalformedStanza("end tag where a start tag was required".to_string()))
            }
            Ok(_) => continue,
            Err(e) => return Err(XmppError::MalformedStanza(e.to_string())),
        }
    }
}

/// A decoded element subtree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated character data directly inside this element.
    pub text: String,
}

impl From<StartElement> for Element {
    fn from(start: StartElement) -> Self {
        Self {
            name: start.name,
            namespace: start.namespace,
            attrs: start.attrs,
            children: Vec::new(),
            text: String::new(),
        }
    }
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_ns(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    /// Like `with_attr`, but omits the attribute when the value is empty.
    pub fn with_opt_attr(self, key: impl Into<String>, value: &str) -> Self {
        if value.is_empty() {
            self
        } else {
            self.with_attr(key, value)
        }
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, or an empty string when absent.
    pub fn attr_or_empty(&self, key: &str) -> String {
        self.attr(key).unwrap_or_default().to_string()
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of a direct child, or an empty string.
    pub fn child_text(&self, name: &str) -> String {
        self.child(name).map(|c| c.text.clone()).unwrap_or_default()
    }

    /// Decode one complete element from its serialized form.
    pub fn parse(raw: &str) -> Result<Element, XmppError> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let inherited = stack.last().and_then(|p| p.namespace.as_deref());
                    stack.push(open_tag(&e, inherited)?.into());
                }
                Ok(Event::Empty(e)) => {
                    let inherited = stack.last().and_then(|p| p.namespace.as_deref());
                    let element: Element = open_tag(&e, inherited)?.into();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::End(_)) => {
                    let element = stack.pop().ok_or_else(|| {
                        XmppError::MalformedStanza("end tag without start".to_string())
                    })?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(current) = stack.last_mut() {
                        let text = t
                            .unescape()
                            .map_err(|e| XmppError::MalformedStanza(e.to_string()))?;
                        current.text.push_str(&text);
                    }
                }
                Ok(Event::CData(c)) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Ok(Event::Eof) => {
                    return Err(XmppError::MalformedStanza("element is not closed".to_string()))
                }
                Ok(_) => {}
                Err(e) => return Err(XmppError::MalformedStanza(e.to_string())),
            }
        }
    }

    /// Serialize to wire form. Attribute values and text are escaped.
    pub fn to_xml(&self) -> Result<Vec<u8>, XmppError> {
        let mut writer = Writer::new(Vec::new());
        self.write_to(&mut writer)?;
        Ok(writer.into_inner())
    }

    fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), XmppError> {
        let mut start = BytesStart::new(self.name.as_str());
        if let Some(namespace) = &self.namespace {
            start.push_attribute(("xmlns", namespace.as_str()));
        }
        for (key, value) in &self.attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() && self.text.is_empty() {
            return writer.write_event(Event::Empty(start)).map_err(encode_err);
        }

        writer.write_event(Event::Start(start)).map_err(encode_err)?;
        if !self.text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&self.text)))
                .map_err(encode_err)?;
        }
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(encode_err)
    }
}

fn encode_err(e: impl std::fmt::Display) -> XmppError {
    XmppError::MalformedStanza(e.to_string())
}

/// Streaming, element-at-a-time reader over the receive half of a connection.
pub struct StanzaReader<R> {
    inner: R,
    buffer: Vec<u8>,
    /// Raw subtree of the element last returned by `next_element`.
    pending: Option<String>,
}

impl<R: AsyncRead + Unpin> StanzaReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pending: None,
        }
    }

    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.buffer)
    }

    /// Block until the next top-level start tag arrives.
    ///
    /// Any element left pending from the previous call is skipped. A received
    /// `</stream:stream>` is reported as `EndOfStream`.
    pub async fn next_element(&mut self) -> Result<StartElement, XmppError> {
        self.pending = None;

        loop {
            match extract_frame(&self.buffer) {
                Ok(Some((frame, used))) => {
                    self.buffer.drain(..used);
                    return match frame {
                        RawFrame::StreamClose => Err(XmppError::EndOfStream),
                        RawFrame::StreamOpen(raw) => parse_start_tag(&raw),
                        RawFrame::Stanza(raw) => {
                            let start = parse_start_tag(&raw)?;
                            self.pending = Some(raw);
                            Ok(start)
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    // Garbled input cannot be resynchronized; drop what we have.
                    self.buffer.clear();
                    return Err(e);
                }
            }

            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                let buffered = self.buffer.len();
                self.buffer.clear();
                return Err(XmppError::MalformedStanza(format!(
                    "no complete stanza within {buffered} buffered bytes"
                )));
            }

            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<(), XmppError> {
        let mut read_buf = [0u8; READ_CHUNK];
        let n = self
            .inner
            .read(&mut read_buf)
            .await
            .map_err(XmppError::from_read)?;
        if n == 0 {
            return Err(XmppError::EndOfStream);
        }
        trace!(bytes = n, "Received from chat stream");
        self.buffer.extend_from_slice(&read_buf[..n]);
        Ok(())
    }

    /// Decode the subtree of the element last returned by `next_element`.
    pub fn decode(&mut self) -> Result<Element, XmppError> {
        let raw = self.pending.take().ok_or_else(|| {
            XmppError::MalformedStanza("no element pending decode".to_string())
        })?;
        debug!(stanza = %raw, "Decoding stanza");
        Element::parse(&raw)
    }

    /// Discard the unread subtree of the current element.
    pub fn skip(&mut self) {
        if let Some(raw) = self.pending.take() {
            trace!(bytes = raw.len(), "Skipped unhandled element");
        }
    }

    /// Read and decode the next top-level element. A stream header where an
    /// element was required is `MalformedStanza`.
    pub async fn read_element(&mut self) -> Result<Element, XmppError> {
        let start = self.next_element().await?;
        if start.is("stream", ns::STREAM) {
            return Err(XmppError::MalformedStanza(
                "unexpected stream header".to_string(),
            ));
        }
        self.decode()
    }
}

/// Append-only writer over the send half of a connection.
pub struct StanzaWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StanzaWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub async fn send(&mut self, element: &Element) -> Result<(), XmppError> {
        let bytes = element.to_xml()?;
        self.write_raw(&bytes).await
    }

    /// Write bytes that are not a structured stanza (stream header, keepalive).
    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), XmppError> {
        self.inner
            .write_all(bytes)
            .await
            .map_err(XmppError::from_read)?;
        self.inner.flush().await.map_err(XmppError::from_read)
    }

    pub async fn shutdown(&mut self) -> Result<(), XmppError> {
        self.inner.shutdown().await.map_err(XmppError::from_read)
    }
}
