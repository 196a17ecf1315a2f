// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Events delivered asynchronously to the owning client.

use minidom::Element;

use crate::error::StreamErrorCondition;
use crate::jid::Jid;

/// Top-level stanza classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    /// The wire name of this stanza kind.
    pub fn name(self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }
}

/// A received stanza, classified for the owner.
#[derive(Debug, Clone)]
pub struct StanzaEvent {
    /// message, presence or iq
    pub kind: StanzaKind,
    /// The `type` attribute, verbatim
    pub type_attr: Option<String>,
    /// Canonicalized sender; `None` when absent or empty
    pub from: Option<Jid>,
    /// The `id` attribute; empty string when absent
    pub id: String,
    /// For iq stanzas, the namespace of the payload child
    pub queryns: Option<String>,
    /// The stanza itself
    pub raw: Element,
}

/// Notification pushed from the session to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A classified stanza
    Stanza(StanzaEvent),
    /// A top-level element that is none of message/presence/iq,
    /// forwarded verbatim
    Raw(Element),
    /// The peer closed the stream with a `<stream:error/>`
    StreamError {
        /// The defined condition
        condition: StreamErrorCondition,
        /// Optional human-readable text
        text: Option<String>,
    },
    /// The session ended; no further events will arrive
    Closed {
        /// Why, if known
        reason: Option<String>,
    },
}
