// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental XMPP stream framing.
//!
//! [`XmppCodec`] turns the raw byte stream into [`Packet`] events and
//! back. It only deals with framing: a stream header becomes
//! [`Packet::StreamStart`], every complete top-level element becomes a
//! [`Packet::Stanza`] holding a [`minidom::Element`], and the closing
//! tag becomes [`Packet::StreamEnd`]. All parser state lives here, so
//! a stream restart is performed by re-framing the transport with a
//! fresh codec.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use minidom::Element;
use quick_xml::errors::SyntaxError;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, ProtocolError};
use crate::ns;

/// Refuse to buffer a single top-level element beyond this size.
const MAX_STANZA_SIZE: usize = 1_024 * 1_024;

/// One unit of the XML stream, as seen by the session core.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// An opening `<stream:stream>` header with its attributes
    StreamStart(HashMap<String, String>),
    /// A complete top-level element
    Stanza(Element),
    /// Plain text; only used outbound, for whitespace keepalives
    Text(String),
    /// The closing `</stream:stream>` tag
    StreamEnd,
}

/// Stateful encoder/decoder for one XML stream.
pub struct XmppCodec {
    /// Default namespace declared on the outgoing stream header and
    /// applied when parsing received fragments.
    ns: &'static str,
}

impl XmppCodec {
    pub fn new(ns: &'static str) -> Self {
        XmppCodec { ns }
    }

    /// Parse a complete top-level fragment into an [`Element`].
    ///
    /// The fragment is re-rooted under a wrapper that redeclares the
    /// stream namespaces, since on the wire those live on the
    /// `<stream:stream>` header we never hand to the DOM parser.
    fn parse_fragment(&self, fragment: &str) -> Result<Element, Error> {
        let wrapped = format!(
            "<wrapper xmlns='{}' xmlns:stream='{}'>{}</wrapper>",
            self.ns,
            ns::STREAM,
            fragment
        );
        let root: Element = wrapped
            .parse()
            .map_err(|e: minidom::Error| ProtocolError::Parser(e))?;
        root.children()
            .next()
            .cloned()
            .ok_or_else(|| ProtocolError::MalformedXml("empty fragment".to_owned()).into())
    }
}

fn is_stream_tag(name: &[u8]) -> bool {
    name == b"stream:stream"
}

fn header_attrs(e: &quick_xml::events::BytesStart) -> Result<HashMap<String, String>, Error> {
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| ProtocolError::MalformedXml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ProtocolError::MalformedXml(e.to_string()))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

/// Outcome of one scan over the buffered bytes.
enum Scan {
    /// Stream header; consume this many bytes
    Header(HashMap<String, String>, usize),
    /// Complete top-level element spanning `start..end`
    Fragment(usize, usize),
    /// Stream footer; consume this many bytes
    Footer(usize),
    /// Nothing complete yet
    Incomplete,
}

/// Walk the tokenizer over `input` until one complete top-level unit
/// is found. Borrows only; consumption happens in `decode`.
fn scan(input: &[u8]) -> Result<Scan, Error> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut stanza_start: Option<usize> = None;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            // Stream-level metadata before the header.
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,

            Ok(Event::Start(e)) => {
                if depth == 0 && stanza_start.is_none() && is_stream_tag(e.name().as_ref()) {
                    let attrs = header_attrs(&e)?;
                    return Ok(Scan::Header(attrs, reader.buffer_position() as usize));
                }
                if stanza_start.is_none() {
                    stanza_start = Some(pos);
                }
                depth += 1;
            }

            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref()) {
                        // A self-closing stream header is not a thing.
                        return Err(ProtocolError::InvalidStreamStart.into());
                    }
                    return Ok(Scan::Fragment(pos, reader.buffer_position() as usize));
                }
            }

            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}

            Ok(Event::End(e)) => {
                if depth == 0 {
                    if is_stream_tag(e.name().as_ref()) {
                        return Ok(Scan::Footer(reader.buffer_position() as usize));
                    }
                    return Err(ProtocolError::MalformedXml(
                        "unmatched end tag at stream level".to_owned(),
                    )
                    .into());
                }
                depth -= 1;
                if depth == 0 {
                    let start = stanza_start.take().expect("depth tracked without start");
                    return Ok(Scan::Fragment(start, reader.buffer_position() as usize));
                }
            }

            // Incomplete data; wait for the next read.
            Ok(Event::Eof) => return Ok(Scan::Incomplete),
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => {
                return Ok(Scan::Incomplete)
            }

            Err(e) => {
                return Err(ProtocolError::MalformedXml(e.to_string()).into());
            }
        }
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, Error> {
        // Inter-stanza whitespace (keepalives from the peer) carries no
        // information; drop it so it cannot accumulate.
        while src.first().map_or(false, |b| b.is_ascii_whitespace()) {
            src.advance(1);
        }
        if src.is_empty() {
            return Ok(None);
        }

        // The stream footer has no matching opening tag in the buffer;
        // recognize it before handing bytes to the tokenizer.
        if src.starts_with(b"</stream:stream>") {
            src.advance(b"</stream:stream>".len());
            return Ok(Some(Packet::StreamEnd));
        }

        match scan(&src[..])? {
            Scan::Header(attrs, consumed) => {
                src.advance(consumed);
                Ok(Some(Packet::StreamStart(attrs)))
            }
            Scan::Fragment(start, end) => {
                let fragment = core::str::from_utf8(&src[start..end])
                    .map_err(|e| ProtocolError::MalformedXml(e.to_string()))?;
                let element = self.parse_fragment(fragment)?;
                src.advance(end);
                Ok(Some(Packet::Stanza(element)))
            }
            Scan::Footer(consumed) => {
                src.advance(consumed);
                Ok(Some(Packet::StreamEnd))
            }
            Scan::Incomplete => {
                if src.len() > MAX_STANZA_SIZE {
                    return Err(ProtocolError::MalformedXml(format!(
                        "top-level element exceeds {} bytes",
                        MAX_STANZA_SIZE
                    ))
                    .into());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        match item {
            Packet::StreamStart(attrs) => {
                dst.extend_from_slice(b"<?xml version='1.0'?><stream:stream");
                // Deterministic order keeps the wire image stable: the
                // addressing attributes first, then the namespaces.
                fn rank(key: &str) -> u8 {
                    match key {
                        "to" => 0,
                        "version" => 1,
                        _ => 2,
                    }
                }
                let mut keys: Vec<&String> = attrs.keys().collect();
                keys.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
                for key in keys {
                    let value = escape(attrs[key].as_str());
                    dst.extend_from_slice(format!(" {}='{}'", key, value).as_bytes());
                }
                dst.extend_from_slice(b">");
            }
            Packet::Stanza(element) => {
                dst.extend_from_slice(String::from(&element).as_bytes());
            }
            Packet::Text(text) => {
                dst.extend_from_slice(text.as_bytes());
            }
            Packet::StreamEnd => {
                dst.extend_from_slice(b"</stream:stream>");
            }
        }
        Ok(())
    }
}
