// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Classification of inbound top-level elements.

use minidom::Element;

use crate::event::{SessionEvent, StanzaEvent, StanzaKind};
use crate::jid::Jid;
use crate::ns;

/// Classify a top-level element for delivery to the owner.
///
/// `message`, `presence` and `iq` in the client namespace become
/// [`StanzaEvent`]s; everything else is forwarded raw.
pub(crate) fn classify(element: Element) -> SessionEvent {
    let kind = if element.is("message", ns::JABBER_CLIENT) {
        StanzaKind::Message
    } else if element.is("presence", ns::JABBER_CLIENT) {
        StanzaKind::Presence
    } else if element.is("iq", ns::JABBER_CLIENT) {
        StanzaKind::Iq
    } else {
        return SessionEvent::Raw(element);
    };

    let from = element
        .attr("from")
        .filter(|from| !from.is_empty())
        .and_then(|from| Jid::new(&canonicalize(from)).ok());
    let id = element.attr("id").unwrap_or("").to_owned();
    let type_attr = element.attr("type").map(str::to_owned);
    let queryns = match kind {
        StanzaKind::Iq => element.children().next().map(|child| child.ns()),
        _ => None,
    };

    SessionEvent::Stanza(StanzaEvent {
        kind,
        type_attr,
        from,
        id,
        queryns,
        raw: element,
    })
}

/// Lowercase the node and domain parts; the resource is case
/// sensitive and kept as-is.
fn canonicalize(jid: &str) -> String {
    match jid.split_once('/') {
        Some((bare, resource)) => format!("{}/{}", bare.to_lowercase(), resource),
        None => jid.to_lowercase(),
    }
}
