// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end scenarios against a scripted peer on the other side of
//! an in-memory duplex pipe.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::future::BoxFuture;
use futures::FutureExt;
use md5::{Digest, Md5};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

use xmpp_session::error::{AuthError, ProtocolError, StreamErrorCondition};
use xmpp_session::transport::compress::ZlibStream;
use xmpp_session::{
    AuthMethod, Connector, Error, PropertyValue, Session, SessionEvent, SessionOptions,
    StanzaKind, StreamVersion, Transport, UsePolicy,
};

const STREAM_NS: &str = "http://etherx.jabber.org/streams";
const SASL_NS: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";
const AUTH_NS: &str = "jabber:iq:auth";
const COMPRESS_NS: &str = "http://jabber.org/protocol/compress";

/// Hands a pre-established duplex pipe to the session.
#[derive(Debug)]
struct DuplexConnector(Mutex<Option<DuplexStream>>);

impl DuplexConnector {
    fn new(stream: DuplexStream) -> Box<DuplexConnector> {
        Box::new(DuplexConnector(Mutex::new(Some(stream))))
    }
}

impl Connector for DuplexConnector {
    fn connect<'a>(
        &'a self,
        _domain: &'a str,
        _options: &'a SessionOptions,
    ) -> BoxFuture<'a, Result<Transport, Error>> {
        let stream = self
            .0
            .lock()
            .unwrap()
            .take()
            .expect("connector used twice");
        async move { Ok(Transport::custom(Box::new(stream), "test", false, true)) }.boxed()
    }
}

/// Read until the accumulated bytes contain `pattern`; returns
/// everything read. Each negotiation phase has exactly one in-flight
/// client message, so phases never bleed into another.
async fn expect<S: AsyncRead + Unpin>(stream: &mut S, pattern: &str) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if collected.contains(pattern) {
            return collected;
        }
        let mut chunk = [0u8; 4096];
        let read = tokio::time::timeout_at(deadline, stream.read(&mut chunk))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}; got {:?}", pattern, collected))
            .expect("peer read failed");
        assert!(read > 0, "eof while waiting for {:?}; got {:?}", pattern, collected);
        collected.push_str(&String::from_utf8_lossy(&chunk[..read]));
    }
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &str) {
    stream.write_all(data.as_bytes()).await.expect("peer write failed");
    stream.flush().await.expect("peer flush failed");
}

/// The stream headers the engine emits end with the stream namespace
/// declaration; waiting for this suffix captures the complete tag.
const HEADER_END: &str = "http://etherx.jabber.org/streams'>";

/// The `<stream:stream ...>` part of a captured fragment, without the
/// XML declaration (whose `version='1.0'` would confuse attribute
/// checks).
fn stream_header_of(fragment: &str) -> &str {
    let start = fragment
        .find("<stream:stream")
        .expect("no stream header in fragment");
    &fragment[start..]
}

/// Value of `name='...'` or `name="..."` in a captured fragment.
fn attr(fragment: &str, name: &str) -> Option<String> {
    let key = format!("{}=", name);
    let start = fragment.find(&key)? + key.len();
    let rest = &fragment[start..];
    let quote = rest.chars().next()?;
    let rest = &rest[1..];
    let end = rest.find(quote)?;
    Some(rest[..end].to_owned())
}

/// Text content of the first `<name>...</name>` element, `""` for
/// `<name .../>`.
fn element_text(fragment: &str, name: &str) -> String {
    let open = format!("<{}", name);
    let start = fragment.find(&open).expect("element not found") + open.len();
    let rest = &fragment[start..];
    let tag_end = rest.find('>').expect("unterminated tag");
    if rest[..tag_end].ends_with('/') {
        return String::new();
    }
    let body = &rest[tag_end + 1..];
    let close = format!("</{}>", name);
    let end = body.find(&close).expect("element not closed");
    body[..end].to_owned()
}

fn header(id: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
         xmlns:stream='{}' id='{}' from='example.org' version='1.0'>",
        STREAM_NS, id
    )
}

fn features_sasl() -> String {
    format!(
        "<stream:features><mechanisms xmlns='{}'>\
         <mechanism>PLAIN</mechanism><mechanism>ANONYMOUS</mechanism>\
         <mechanism>DIGEST-MD5</mechanism></mechanisms></stream:features>",
        SASL_NS
    )
}

fn features_bind() -> String {
    format!(
        "<stream:features><bind xmlns='{}'/><session xmlns='{}'/></stream:features>",
        BIND_NS, SESSION_NS
    )
}

/// Serve resource binding and session establishment, assigning `jid`.
async fn serve_bind_and_session<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, jid: &str) {
    let bind_req = expect(stream, "</iq>").await;
    assert!(bind_req.contains("<bind"));
    let bind_id = attr(&bind_req, "id").expect("bind iq has no id");
    send(
        stream,
        &format!(
            "<iq type='result' id='{}'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
            bind_id, BIND_NS, jid
        ),
    )
    .await;

    let session_req = expect(stream, "</iq>").await;
    assert!(session_req.contains("<session"));
    let session_id = attr(&session_req, "id").expect("session iq has no id");
    send(
        stream,
        &format!("<iq type='result' id='{}'/>", session_id),
    )
    .await;
}

fn pair() -> (Box<DuplexConnector>, DuplexStream) {
    let (client_end, server_end) = tokio::io::duplex(65536);
    (DuplexConnector::new(client_end), server_end)
}

// S2: SASL PLAIN through bind and session establishment.
#[tokio::test]
async fn sasl_plain_happy_path() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        let client_header = expect(&mut server, HEADER_END).await;
        let client_header = stream_header_of(&client_header);
        assert_eq!(attr(client_header, "to").as_deref(), Some("example.org"));
        assert_eq!(attr(client_header, "version").as_deref(), Some("1.0"));
        send(&mut server, &header("s2-first")).await;
        send(&mut server, &features_sasl()).await;

        let auth = expect(&mut server, "</auth>").await;
        assert_eq!(attr(&auth, "mechanism").as_deref(), Some("PLAIN"));
        let payload = BASE64.decode(element_text(&auth, "auth")).unwrap();
        assert_eq!(payload, b"\0alice\0pw");
        send(&mut server, &format!("<success xmlns='{}'/>", SASL_NS)).await;

        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s2-second")).await;
        send(&mut server, &features_bind()).await;

        serve_bind_and_session(&mut server, "alice@example.org/balcony").await;
        server
    });

    let (session, _events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, "alice@example.org", "pw")
        .await
        .unwrap();
    let mut options = SessionOptions::default();
    options.domain = Some("example.org".to_owned());
    let connected = session.connect_with(connector, options).await.unwrap();
    assert_eq!(connected.stream_id, "s2-first");
    let features = connected.features.expect("features on a 1.0 stream");
    assert!(features.has_mechanism("PLAIN"));

    let jid = session.login().await.unwrap();
    assert_eq!(jid.to_string(), "alice@example.org/balcony");

    // Outbound stanzas get ids assigned and returned.
    let mut server = peer.await.unwrap();
    let stanza: minidom::Element =
        "<message xmlns='jabber:client' to='bob@example.org'><body>hello</body></message>"
            .parse()
            .unwrap();
    let id = session.send_packet(stanza).await.unwrap();
    assert!(id.starts_with("session-"));
    let on_wire = expect(&mut server, "</message>").await;
    assert_eq!(attr(&on_wire, "id").as_deref(), Some(id.as_str()));

    session.stop().await.unwrap();
    expect(&mut server, "</stream:stream>").await;
}

// S1: legacy version-(0,0) stream with plaintext jabber:iq:auth.
#[tokio::test]
async fn legacy_plaintext_login() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        let client_header = expect(&mut server, HEADER_END).await;
        assert!(!stream_header_of(&client_header).contains("version="));
        // Legacy server: no version attribute in the reply either.
        send(
            &mut server,
            &format!(
                "<stream:stream xmlns='jabber:client' xmlns:stream='{}' id='legacy-7'>",
                STREAM_NS
            ),
        )
        .await;

        let fields_req = expect(&mut server, "</iq>").await;
        assert_eq!(attr(&fields_req, "type").as_deref(), Some("get"));
        assert!(fields_req.contains("<username>user</username>"));
        let fields_id = attr(&fields_req, "id").unwrap();
        send(
            &mut server,
            &format!(
                "<iq type='result' id='{}'><query xmlns='{}'>\
                 <username/><password/><digest/><resource/></query></iq>",
                fields_id, AUTH_NS
            ),
        )
        .await;

        let submit = expect(&mut server, "</iq>").await;
        assert!(submit.contains("<password>secret</password>"));
        assert!(submit.contains("<resource>res</resource>"));
        let submit_id = attr(&submit, "id").unwrap();
        send(
            &mut server,
            &format!("<iq type='result' id='{}'/>", submit_id),
        )
        .await;
    });

    let (session, _events) = Session::start(StreamVersion::V0_0);
    session
        .set_auth(AuthMethod::Password, "user@legacy.example/res", "secret")
        .await
        .unwrap();
    let connected = session
        .connect_with(connector, SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(connected.stream_id, "legacy-7");
    assert!(connected.features.is_none());

    let jid = session.login().await.unwrap();
    assert_eq!(jid.to_string(), "user@legacy.example/res");
    peer.await.unwrap();
}

// S1 variant: digest over the stream id.
#[tokio::test]
async fn legacy_digest_login() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(
            &mut server,
            &format!(
                "<stream:stream xmlns='jabber:client' xmlns:stream='{}' id='stream-id-9'>",
                STREAM_NS
            ),
        )
        .await;

        let fields_req = expect(&mut server, "</iq>").await;
        let fields_id = attr(&fields_req, "id").unwrap();
        send(
            &mut server,
            &format!(
                "<iq type='result' id='{}'><query xmlns='{}'>\
                 <username/><digest/><resource/></query></iq>",
                fields_id, AUTH_NS
            ),
        )
        .await;

        let submit = expect(&mut server, "</iq>").await;
        // XEP-0078: lowercase hex SHA-1 over stream id concatenated
        // with the password.
        let expected = {
            let digest = Sha1::digest(b"stream-id-9secret");
            digest.iter().map(|b| format!("{:02x}", b)).collect::<String>()
        };
        assert_eq!(element_text(&submit, "digest"), expected);
        assert!(!submit.contains("<password>"));
        let submit_id = attr(&submit, "id").unwrap();
        send(
            &mut server,
            &format!("<iq type='result' id='{}'/>", submit_id),
        )
        .await;
    });

    let (session, _events) = Session::start(StreamVersion::V0_0);
    session
        .set_auth(AuthMethod::Digest, "user@legacy.example/res", "secret")
        .await
        .unwrap();
    session
        .connect_with(connector, SessionOptions::default())
        .await
        .unwrap();
    let jid = session.login().await.unwrap();
    assert_eq!(jid.to_string(), "user@legacy.example/res");
    peer.await.unwrap();
}

fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Independent RFC 2831 computation for the scripted server.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    digest_uri: &str,
    a2_prefix: &str,
) -> String {
    let mut a1 = Md5::digest(format!("{}:{}:{}", username, realm, password).as_bytes()).to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let ha1 = md5_hex(&a1);
    let ha2 = md5_hex(format!("{}:{}", a2_prefix, digest_uri).as_bytes());
    md5_hex(format!("{}:{}:00000001:{}:auth:{}", ha1, nonce, cnonce, ha2).as_bytes())
}

fn parse_directives(input: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for part in split_directives(input) {
        if let Some((key, value)) = part.split_once('=') {
            map.insert(key.trim().to_owned(), value.trim_matches('"').to_owned());
        }
    }
    map
}

fn split_directives(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in input.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

// S4: DIGEST-MD5 challenge, response, rspauth, empty final response.
#[tokio::test]
async fn digest_md5_login() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s4")).await;
        send(&mut server, &features_sasl()).await;

        // Server-first mechanism: the auth nonza carries no payload.
        let auth = expect(&mut server, "DIGEST-MD5").await;
        assert_eq!(attr(&auth, "mechanism").as_deref(), Some("DIGEST-MD5"));

        let challenge =
            "realm=\"example.org\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",\
             charset=utf-8,algorithm=md5-sess";
        send(
            &mut server,
            &format!(
                "<challenge xmlns='{}'>{}</challenge>",
                SASL_NS,
                BASE64.encode(challenge)
            ),
        )
        .await;

        let response = expect(&mut server, "</response>").await;
        let decoded = BASE64.decode(element_text(&response, "response")).unwrap();
        let directives = parse_directives(&String::from_utf8(decoded).unwrap());
        assert_eq!(directives["username"], "chris");
        assert_eq!(directives["realm"], "example.org");
        assert_eq!(directives["nonce"], "OA6MG9tEQGm2hh");
        assert_eq!(directives["nc"], "00000001");
        assert_eq!(directives["digest-uri"], "xmpp/example.org");
        let cnonce = &directives["cnonce"];
        let expected = digest_response(
            "chris",
            "example.org",
            "secret",
            "OA6MG9tEQGm2hh",
            cnonce,
            "xmpp/example.org",
            "AUTHENTICATE",
        );
        assert_eq!(directives["response"], expected);

        // Mutual authentication round.
        let rspauth = digest_response(
            "chris",
            "example.org",
            "secret",
            "OA6MG9tEQGm2hh",
            cnonce,
            "xmpp/example.org",
            "",
        );
        send(
            &mut server,
            &format!(
                "<challenge xmlns='{}'>{}</challenge>",
                SASL_NS,
                BASE64.encode(format!("rspauth={}", rspauth))
            ),
        )
        .await;

        let empty = expect(&mut server, "response").await;
        assert!(empty.contains("<response"));
        send(&mut server, &format!("<success xmlns='{}'/>", SASL_NS)).await;

        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s4-second")).await;
        send(&mut server, &features_bind()).await;
        serve_bind_and_session(&mut server, "chris@example.org/tty").await;
    });

    let (session, _events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::DigestMd5, "chris@example.org", "secret")
        .await
        .unwrap();
    session
        .connect_with(connector, SessionOptions::default())
        .await
        .unwrap();
    let jid = session.login().await.unwrap();
    assert_eq!(jid.to_string(), "chris@example.org/tty");
    peer.await.unwrap();
}

// S5: a SASL failure leaves the session usable; ANONYMOUS succeeds
// afterwards.
#[tokio::test]
async fn auth_failure_is_recoverable() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s5")).await;
        send(&mut server, &features_sasl()).await;

        expect(&mut server, "</auth>").await;
        send(
            &mut server,
            &format!(
                "<failure xmlns='{}'><not-authorized/></failure>",
                SASL_NS
            ),
        )
        .await;

        // Second attempt, anonymous this time.
        let auth = expect(&mut server, "ANONYMOUS").await;
        assert!(auth.contains("<auth"));
        assert_eq!(attr(&auth, "mechanism").as_deref(), Some("ANONYMOUS"));
        send(&mut server, &format!("<success xmlns='{}'/>", SASL_NS)).await;

        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s5-second")).await;
        send(&mut server, &features_bind()).await;
        serve_bind_and_session(&mut server, "ghost-1@example.org/anon").await;
    });

    let (session, _events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, "alice@example.org", "wrong")
        .await
        .unwrap();
    session
        .connect_with(connector, SessionOptions::default())
        .await
        .unwrap();

    match session.login().await {
        Err(Error::Auth(AuthError::Fail(condition))) => {
            assert_eq!(condition, "not-authorized")
        }
        other => panic!("unexpected login result: {:?}", other),
    }

    let jid = session
        .login_with(Some("ANONYMOUS"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(jid.to_string(), "ghost-1@example.org/anon");
    peer.await.unwrap();
}

// The compression half of S3: zlib negotiated, stream restarted, login
// completed over the compressed channel.
#[tokio::test]
async fn compression_then_login() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s3")).await;
        send(
            &mut server,
            &format!(
                "<stream:features><compression xmlns='http://jabber.org/features/compress'>\
                 <method>zlib</method></compression>\
                 <mechanisms xmlns='{}'><mechanism>PLAIN</mechanism></mechanisms>\
                 </stream:features>",
                SASL_NS
            ),
        )
        .await;

        let compress = expect(&mut server, "</compress>").await;
        assert!(compress.contains("<method>zlib</method>"));
        send(&mut server, &format!("<compressed xmlns='{}'/>", COMPRESS_NS)).await;

        // Everything from here on is deflated in both directions.
        let mut server = ZlibStream::new(server);
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s3-second")).await;
        send(
            &mut server,
            &format!(
                "<stream:features><mechanisms xmlns='{}'>\
                 <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
                SASL_NS
            ),
        )
        .await;

        expect(&mut server, "</auth>").await;
        send(&mut server, &format!("<success xmlns='{}'/>", SASL_NS)).await;

        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s3-third")).await;
        send(&mut server, &features_bind()).await;
        serve_bind_and_session(&mut server, "alice@example.org/flat").await;
    });

    let (session, _events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, "alice@example.org", "pw")
        .await
        .unwrap();
    session
        .connect_with(connector, SessionOptions::default())
        .await
        .unwrap();
    let jid = session.login().await.unwrap();
    assert_eq!(jid.to_string(), "alice@example.org/flat");

    assert_eq!(
        session.get_connection_property("compressed").await.unwrap(),
        PropertyValue::Bool(true)
    );
    assert_eq!(
        session.get_connection_property("encrypted").await.unwrap(),
        PropertyValue::Bool(false)
    );
    peer.await.unwrap();
}

// Law 7: mandatory TLS with STARTTLS disabled dies with
// policy-violation before any authentication.
#[tokio::test]
async fn required_tls_disabled_is_policy_violation() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s7")).await;
        send(
            &mut server,
            &format!(
                "<stream:features>\
                 <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
                 <mechanisms xmlns='{}'><mechanism>PLAIN</mechanism></mechanisms>\
                 </stream:features>",
                SASL_NS
            ),
        )
        .await;
        // The client walks away; nothing to serve.
    });

    let (session, mut events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, "alice@example.org", "pw")
        .await
        .unwrap();
    let mut options = SessionOptions::default();
    options.starttls = UsePolicy::Disabled;
    match session.connect_with(connector, options).await {
        Err(Error::Protocol(ProtocolError::Stream(StreamErrorCondition::PolicyViolation))) => {}
        other => panic!("unexpected connect result: {:?}", other),
    }
    match events.recv().await {
        Some(SessionEvent::StreamError { condition, .. }) => {
            assert_eq!(condition, StreamErrorCondition::PolicyViolation)
        }
        other => panic!("unexpected event: {:?}", other),
    }
    peer.await.unwrap();
}

// S6: exactly one space byte per idle interval, re-armed afterwards.
#[tokio::test]
async fn whitespace_ping_fires_when_idle() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s6")).await;
        send(&mut server, &features_sasl()).await;
        expect(&mut server, "</auth>").await;
        send(&mut server, &format!("<success xmlns='{}'/>", SASL_NS)).await;
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s6-second")).await;
        send(&mut server, &features_bind()).await;
        serve_bind_and_session(&mut server, "alice@example.org/idle").await;

        // Two pings, each a single space byte.
        for _ in 0..2 {
            let mut byte = [0u8; 1];
            server.read_exact(&mut byte).await.unwrap();
            assert_eq!(&byte, b" ");
        }
    });

    let (session, _events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, "alice@example.org", "pw")
        .await
        .unwrap();
    let mut options = SessionOptions::default();
    options.whitespace_ping = Some(Duration::from_millis(100));
    session.connect_with(connector, options).await.unwrap();
    session.login().await.unwrap();

    peer.await.unwrap();
}

// Law 5: owner notifications preserve wire order.
#[tokio::test]
async fn stanza_dispatch_preserves_order() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s8")).await;
        send(&mut server, &features_sasl()).await;
        expect(&mut server, "</auth>").await;
        send(&mut server, &format!("<success xmlns='{}'/>", SASL_NS)).await;
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s8-second")).await;
        send(&mut server, &features_bind()).await;
        serve_bind_and_session(&mut server, "alice@example.org/o").await;

        send(
            &mut server,
            "<message from='Bob@Example.Org' id='m1'><body>one</body></message>\
             <presence from='bob@example.org/couch' id='p1'/>\
             <iq type='get' id='q1' from='example.org'><query xmlns='jabber:iq:version'/></iq>\
             <r xmlns='urn:xmpp:sm:3'/>",
        )
        .await;
    });

    let (session, mut events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, "alice@example.org", "pw")
        .await
        .unwrap();
    session
        .connect_with(connector, SessionOptions::default())
        .await
        .unwrap();
    session.login().await.unwrap();

    match events.recv().await {
        Some(SessionEvent::Stanza(stanza)) => {
            assert_eq!(stanza.kind, StanzaKind::Message);
            assert_eq!(stanza.id, "m1");
            assert_eq!(stanza.from.unwrap().to_string(), "bob@example.org");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match events.recv().await {
        Some(SessionEvent::Stanza(stanza)) => {
            assert_eq!(stanza.kind, StanzaKind::Presence);
            assert_eq!(stanza.id, "p1");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match events.recv().await {
        Some(SessionEvent::Stanza(stanza)) => {
            assert_eq!(stanza.kind, StanzaKind::Iq);
            assert_eq!(stanza.id, "q1");
            assert_eq!(stanza.queryns.as_deref(), Some("jabber:iq:version"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    match events.recv().await {
        Some(SessionEvent::Raw(element)) => assert_eq!(element.name(), "r"),
        other => panic!("unexpected event: {:?}", other),
    }

    peer.await.unwrap();
}

// XEP-0077 in-band registration from StreamOpened.
#[tokio::test]
async fn register_account_roundtrip() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s9")).await;
        send(&mut server, &features_sasl()).await;

        let register = expect(&mut server, "</iq>").await;
        assert!(register.contains("jabber:iq:register"));
        assert!(register.contains("<username>newbie</username>"));
        assert!(register.contains("<password>pw1</password>"));
        let id = attr(&register, "id").unwrap();
        send(&mut server, &format!("<iq type='result' id='{}'/>", id)).await;
    });

    let (session, _events) = Session::start(StreamVersion::V1_0);
    let mut options = SessionOptions::default();
    options.domain = Some("example.org".to_owned());
    session.connect_with(connector, options).await.unwrap();
    session
        .register_account_as("newbie", "pw1")
        .await
        .unwrap();
    peer.await.unwrap();
}

// A stream error from the peer terminates the session and reaches the
// owner.
#[tokio::test]
async fn stream_error_reaches_owner() {
    let (connector, mut server) = pair();

    let peer = tokio::spawn(async move {
        expect(&mut server, HEADER_END).await;
        send(&mut server, &header("s10")).await;
        send(&mut server, &features_sasl()).await;
        send(
            &mut server,
            &format!(
                "<stream:error><system-shutdown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                 </stream:error></stream:stream>"
            ),
        )
        .await;
    });

    let (session, mut events) = Session::start(StreamVersion::V1_0);
    let mut options = SessionOptions::default();
    options.domain = Some("example.org".to_owned());
    session.connect_with(connector, options).await.unwrap();

    match events.recv().await {
        Some(SessionEvent::StreamError { condition, .. }) => {
            assert_eq!(condition, StreamErrorCondition::SystemShutdown)
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // Commands against the dead session fail cleanly; stop stays
    // idempotent.
    assert!(session.login().await.is_err());
    session.stop().await.unwrap();
    peer.await.unwrap();
}
