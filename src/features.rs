// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Model of the `<stream:features/>` element.
//!
//! Unlike the strict parsers, this is deliberately tolerant: servers
//! put all sorts of extra children in their features element, and the
//! session core only cares about the five facilities it can act on.

use minidom::Element;

use crate::ns;

/// STARTTLS offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTls {
    /// Whether the server marked TLS as mandatory
    pub required: bool,
}

/// The subset of `<stream:features/>` the session core negotiates on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamFeatures {
    /// STARTTLS offer, if any
    pub starttls: Option<StartTls>,
    /// XEP-0138 compression methods offered by the server
    pub compression_methods: Vec<String>,
    /// SASL mechanism names offered by the server
    pub mechanisms: Vec<String>,
    /// Resource binding offered
    pub bind: bool,
    /// RFC 3921 session establishment offered
    pub session: bool,
}

impl StreamFeatures {
    /// Extract the recognized facilities; unknown children are ignored.
    pub fn parse(element: &Element) -> StreamFeatures {
        let mut features = StreamFeatures::default();
        for child in element.children() {
            if child.is("starttls", ns::TLS) {
                features.starttls = Some(StartTls {
                    required: child.has_child("required", ns::TLS),
                });
            } else if child.is("compression", ns::COMPRESS_FEATURE) {
                features.compression_methods = child
                    .children()
                    .filter(|method| method.name() == "method")
                    .map(|method| method.text())
                    .collect();
            } else if child.is("mechanisms", ns::SASL) {
                features.mechanisms = child
                    .children()
                    .filter(|mech| mech.name() == "mechanism")
                    .map(|mech| mech.text())
                    .collect();
            } else if child.is("bind", ns::BIND) {
                features.bind = true;
            } else if child.is("session", ns::SESSION) {
                features.session = true;
            }
        }
        features
    }

    /// Can you request STARTTLS?
    pub fn can_starttls(&self) -> bool {
        self.starttls.is_some()
    }

    /// Did the server mark STARTTLS as mandatory?
    pub fn tls_required(&self) -> bool {
        self.starttls
            .as_ref()
            .map(|tls| tls.required)
            .unwrap_or(false)
    }

    /// Is zlib compression on offer?
    pub fn offers_zlib(&self) -> bool {
        self.compression_methods.iter().any(|m| m == "zlib")
    }

    /// Does the server offer the named SASL mechanism?
    pub fn has_mechanism(&self, name: &str) -> bool {
        self.mechanisms.iter().any(|m| m == name)
    }

    /// Can you bind a resource?
    pub fn can_bind(&self) -> bool {
        self.bind
    }
}
