// Copyright (c) 2025 xmpp-session contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The session actor.
//!
//! One task owns the transport, the codec and the state machine, and
//! serializes owner commands, parsed packets and timers through a
//! single `select!` loop. That loop is the total order the concurrency
//! model promises: exactly one input is processed to completion at a
//! time, and the writes a transition issues are finished before the
//! next input is looked at.

use core::pin::Pin;
use std::collections::HashMap;
use std::collections::VecDeque;

use futures::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Sleep};
use tokio_util::codec::Framed;

use crate::codec::{Packet, XmppCodec};
use crate::config::StreamVersion;
use crate::error::{CommandError, Error};
use crate::event::SessionEvent;
use crate::ns;
use crate::session::fsm::{Action, Command, Fsm, Input, Upgrade};
use crate::transport::Transport;

type FramedTransport = Framed<Transport, XmppCodec>;

pub(crate) struct Driver {
    fsm: Fsm,
    cmd_rx: mpsc::Receiver<Command>,
    owner: mpsc::Sender<SessionEvent>,
    framed: Option<FramedTransport>,
    pending_timer: Option<Pin<Box<Sleep>>>,
    running: bool,
}

impl Driver {
    pub(crate) fn new(
        fsm: Fsm,
        cmd_rx: mpsc::Receiver<Command>,
        owner: mpsc::Sender<SessionEvent>,
    ) -> Driver {
        Driver {
            fsm,
            cmd_rx,
            owner,
            framed: None,
            pending_timer: None,
            running: true,
        }
    }

    pub(crate) async fn run(mut self) {
        while self.running {
            let idle = self.fsm.idle_interval();
            let input = {
                let Driver {
                    cmd_rx,
                    framed,
                    pending_timer,
                    ..
                } = &mut self;
                tokio::select! {
                    biased;
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => Input::Cmd(cmd),
                        // All session handles dropped: terminate.
                        None => Input::Cmd(Command::Stop { reply: None }),
                    },
                    _ = async { pending_timer.as_mut().expect("guarded").await },
                        if pending_timer.is_some() =>
                    {
                        Input::PendingTimeout
                    }
                    packet = async { framed.as_mut().expect("guarded").next().await },
                        if framed.is_some() =>
                    {
                        match packet {
                            Some(Ok(packet)) => Input::Parsed(packet),
                            Some(Err(Error::Io(e))) => Input::Io(e),
                            Some(Err(e)) => Input::ParseError(e),
                            None => Input::Eof,
                        }
                    }
                    _ = sleep(idle.unwrap_or(Duration::ZERO)), if idle.is_some() => {
                        Input::IdleTimeout
                    }
                }
            };
            if let Input::PendingTimeout = input {
                self.pending_timer = None;
            }
            self.step(input).await;
            if !self.fsm.has_pending() {
                self.pending_timer = None;
            }
        }
        debug!("session driver finished");
    }

    /// Process one input and every follow-up input its actions
    /// generate.
    async fn step(&mut self, input: Input) {
        let mut inputs = VecDeque::new();
        inputs.push_back(input);
        while let Some(input) = inputs.pop_front() {
            trace!("fsm input: {:?}", input);
            let actions = self.fsm.handle(input);
            for action in actions {
                self.execute(action, &mut inputs).await;
            }
        }
    }

    async fn execute(&mut self, action: Action, inputs: &mut VecDeque<Input>) {
        match action {
            Action::Connect {
                connector,
                domain,
                options,
            } => {
                let attempt =
                    tokio::time::timeout(options.timeout, connector.connect(&domain, &options))
                        .await;
                match attempt {
                    Err(_elapsed) => inputs.push_back(Input::ConnectFailed(Error::Timeout)),
                    Ok(Err(error)) => inputs.push_back(Input::ConnectFailed(error)),
                    Ok(Ok(transport)) => {
                        let encrypted = transport.is_encrypted();
                        self.framed =
                            Some(Framed::new(transport, XmppCodec::new(ns::JABBER_CLIENT)));
                        inputs.push_back(Input::Connected { encrypted });
                    }
                }
            }

            Action::OpenStream { to, version } => {
                self.send(Packet::StreamStart(header_attrs(&to, version)), inputs)
                    .await;
            }

            Action::RestartStream { to, version } => {
                if let Some(framed) = self.framed.take() {
                    // A fresh codec is a fresh parser: everything the
                    // old stream buffered is gone.
                    let transport = framed.into_inner();
                    self.framed = Some(Framed::new(transport, XmppCodec::new(ns::JABBER_CLIENT)));
                }
                self.send(Packet::StreamStart(header_attrs(&to, version)), inputs)
                    .await;
            }

            Action::StartTls { domain } => match self.framed.take() {
                Some(framed) => {
                    let transport = framed.into_inner();
                    match transport.starttls(&domain).await {
                        Ok(upgraded) => {
                            self.framed =
                                Some(Framed::new(upgraded, XmppCodec::new(ns::JABBER_CLIENT)));
                            inputs.push_back(Input::UpgradeDone(Upgrade::Tls));
                        }
                        Err(error) => {
                            inputs.push_back(Input::UpgradeFailed(Upgrade::Tls, error));
                        }
                    }
                }
                None => inputs.push_back(Input::UpgradeFailed(
                    Upgrade::Tls,
                    Error::Disconnected,
                )),
            },

            Action::StartCompression => match self.framed.take() {
                Some(framed) => {
                    let transport = framed.into_inner();
                    match transport.compress() {
                        Ok(upgraded) => {
                            self.framed =
                                Some(Framed::new(upgraded, XmppCodec::new(ns::JABBER_CLIENT)));
                            inputs.push_back(Input::UpgradeDone(Upgrade::Compression));
                        }
                        Err(error) => {
                            inputs.push_back(Input::UpgradeFailed(Upgrade::Compression, error));
                        }
                    }
                }
                None => inputs.push_back(Input::UpgradeFailed(
                    Upgrade::Compression,
                    Error::Disconnected,
                )),
            },

            Action::Send(packet) => {
                self.send(packet, inputs).await;
            }

            Action::WhitespacePing => {
                // No-op on transports where a stray byte means nothing
                // (BOSH-style bindings).
                let payload = self
                    .framed
                    .as_ref()
                    .and_then(|framed| framed.get_ref().whitespace_ping_payload());
                if let Some(payload) = payload {
                    self.send(Packet::Text(payload.to_owned()), inputs).await;
                }
            }

            Action::Reply { reply, result } => {
                // The caller may have given up; that is its business.
                let _ = reply.send(result);
            }

            Action::QueryProperty { name, reply } => {
                let result = match &self.framed {
                    Some(framed) => framed.get_ref().get_property(&name),
                    None => Err(CommandError::NotConnected.into()),
                };
                let _ = reply.send(result.map(crate::session::fsm::Answer::Property));
            }

            Action::Dispatch(event) => {
                // Fire and forget: a slow or vanished owner must not
                // wedge the protocol.
                let _ = self.owner.send(event).await;
            }

            Action::SetOwner(owner) => {
                self.owner = owner;
            }

            Action::ArmPendingTimer(duration) => {
                self.pending_timer = Some(Box::pin(sleep(duration)));
            }

            Action::Close { send_footer } => {
                if let Some(mut framed) = self.framed.take() {
                    if send_footer {
                        let _ = framed.send(Packet::StreamEnd).await;
                    }
                    let _ = framed.close().await;
                }
                self.running = false;
            }
        }
    }

    async fn send(&mut self, packet: Packet, inputs: &mut VecDeque<Input>) {
        let Some(framed) = self.framed.as_mut() else {
            return;
        };
        if let Err(error) = framed.send(packet).await {
            match error {
                Error::Io(e) => inputs.push_back(Input::Io(e)),
                other => inputs.push_back(Input::ParseError(other)),
            }
        }
    }
}

fn header_attrs(to: &str, version: StreamVersion) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    attrs.insert("to".to_owned(), to.to_owned());
    if version == StreamVersion::V1_0 {
        attrs.insert("version".to_owned(), "1.0".to_owned());
    }
    attrs.insert("xmlns".to_owned(), ns::JABBER_CLIENT.to_owned());
    attrs.insert("xmlns:stream".to_owned(), ns::STREAM.to_owned());
    attrs
}
