use std::env::args;
use std::process::exit;

use minidom::Element;
use xmpp_session::{
    AuthMethod, Session, SessionEvent, SessionOptions, StanzaKind, StreamVersion,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = args().collect();
    if args.len() != 3 {
        println!("Usage: {} <jid> <password>", args[0]);
        exit(1);
    }
    let jid = &args[1];
    let password = &args[2];
    let domain = jid
        .split('@')
        .nth(1)
        .map(|rest| rest.split('/').next().unwrap_or(rest))
        .expect("JID must contain a domain");

    let (session, mut events) = Session::start(StreamVersion::V1_0);
    session
        .set_auth(AuthMethod::Plain, jid, password)
        .await
        .expect("invalid credentials");
    session
        .connect_tcp(domain, 5222, SessionOptions::default())
        .await
        .expect("connect failed");
    let me = session.login().await.expect("login failed");
    println!("online as {}", me);

    let presence = Element::builder("presence", "jabber:client")
        .append(Element::builder("status", "jabber:client").append("Echoing messages."))
        .build();
    session.send_packet(presence).await.unwrap();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Stanza(stanza) if stanza.kind == StanzaKind::Message => {
                let Some(from) = stanza.from else { continue };
                let body = stanza
                    .raw
                    .get_child("body", "jabber:client")
                    .map(|body| body.text())
                    .unwrap_or_default();
                if body.is_empty() || stanza.type_attr.as_deref() == Some("error") {
                    continue;
                }
                println!("{}: {}", from, body);
                let reply = Element::builder("message", "jabber:client")
                    .attr("to", from.to_string())
                    .attr("type", stanza.type_attr.as_deref().unwrap_or("chat"))
                    .append(Element::builder("body", "jabber:client").append(body))
                    .build();
                session.send_packet(reply).await.unwrap();
            }
            SessionEvent::Closed { reason } => {
                println!("disconnected: {:?}", reason);
                break;
            }
            _ => (),
        }
    }
}
