// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use crate::auth;
use crate::cipher;
use crate::negotiation;
use crate::session::*;
use crate::ssh_read::{ServerIdentification, SshRead};
use crate::sshbuffer::*;
use crate::{
    ChannelId, ChannelMsg, ChannelOpenFailure, Disconnect, HostKeyCheck, Limits, Sig,
};
use crate::{msg, Error};
use cryptovec::CryptoVec;
use futures::task::{Context, Poll};
use futures::Future;
use skiff_keys::encoding::{Encoding, Reader};
use skiff_keys::key;
use skiff_keys::IdentitySet;
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::pin;
use tokio::sync::mpsc::*;
use tokio::sync::oneshot;

mod encrypted;
mod kex;
mod session;

/// The protocol side of a client connection, driven by the event
/// loop. Handlers receive it to queue outgoing messages.
pub struct Session {
    common: CommonSession,
    receiver: Receiver<Msg>,
    sender: UnboundedSender<Reply>,
    channels: HashMap<ChannelId, UnboundedSender<OpenChannelMsg>>,
    target_window_size: u32,
    pending_reads: Vec<CryptoVec>,
    pending_len: u32,
    /// Reply slots for in-flight global requests, FIFO per RFC 4254
    /// section 4.
    global_pending: VecDeque<GlobalReply>,
    server_id: Option<ServerIdentification>,
    alive_misses: u32,
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("drop session")
    }
}

enum GlobalReply {
    Caller(oneshot::Sender<bool>),
    Keepalive,
}

#[derive(Debug)]
enum Reply {
    AuthSuccess,
    AuthFailure {
        remaining: auth::MethodSet,
        partial_success: bool,
    },
    AuthBanner(String),
    AuthInfoRequest {
        name: String,
        instruction: String,
        prompts: Vec<auth::Prompt>,
    },
    AuthChangeRequest {
        prompt: String,
    },
}

#[derive(Debug)]
enum Msg {
    Authenticate {
        user: String,
        method: auth::Method,
    },
    AuthInfoResponse {
        responses: Vec<String>,
    },
    AuthChangeResponse {
        new_password: String,
    },
    ChannelOpenSession {
        sender: UnboundedSender<OpenChannelMsg>,
    },
    ChannelOpenX11 {
        originator_address: String,
        originator_port: u32,
        sender: UnboundedSender<OpenChannelMsg>,
    },
    ChannelOpenDirectTcpIp {
        host_to_connect: String,
        port_to_connect: u32,
        originator_address: String,
        originator_port: u32,
        sender: UnboundedSender<OpenChannelMsg>,
    },
    AbandonOpen {
        id: ChannelId,
    },
    TcpIpForward {
        address: String,
        port: u32,
        reply: Option<oneshot::Sender<bool>>,
    },
    CancelTcpIpForward {
        address: String,
        port: u32,
        reply: Option<oneshot::Sender<bool>>,
    },
    Disconnect {
        reason: Disconnect,
        description: String,
        language_tag: String,
    },
    Data {
        id: ChannelId,
        data: CryptoVec,
    },
    ExtendedData {
        id: ChannelId,
        data: CryptoVec,
        ext: u32,
    },
    Eof {
        id: ChannelId,
    },
    Close {
        id: ChannelId,
    },
    RequestPty {
        id: ChannelId,
        want_reply: bool,
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: Vec<(u8, u32)>,
    },
    RequestShell {
        id: ChannelId,
        want_reply: bool,
    },
    Exec {
        id: ChannelId,
        want_reply: bool,
        command: String,
    },
    Signal {
        id: ChannelId,
        signal: Sig,
    },
    RequestSubsystem {
        id: ChannelId,
        want_reply: bool,
        name: String,
    },
    RequestX11 {
        id: ChannelId,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: String,
        x11_authentication_cookie: String,
        x11_screen_number: u32,
    },
    RequestAgentForward {
        id: ChannelId,
        want_reply: bool,
    },
    SetEnv {
        id: ChannelId,
        want_reply: bool,
        variable_name: String,
        variable_value: String,
    },
    WindowChange {
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
}

#[derive(Debug)]
enum OpenChannelMsg {
    /// The loop allocated a local id; lets the opener abandon the
    /// open on timeout.
    Proposed { id: ChannelId },
    Open {
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
    },
    OpenFailure(ChannelOpenFailure),
    Msg(ChannelMsg),
}

/// A server-initiated channel open, submitted to the handler for
/// acceptance.
#[derive(Debug, Clone)]
pub enum RemoteOpen {
    ForwardedTcpIp {
        connected_address: String,
        connected_port: u32,
        originator_address: String,
        originator_port: u32,
    },
    X11 {
        originator_address: String,
        originator_port: u32,
    },
    AgentForward,
}

/// Handle to a session, used to send messages to a client outside of
/// the request/response cycle.
pub struct Handle<H: Handler> {
    sender: Sender<Msg>,
    receiver: UnboundedReceiver<Reply>,
    config: Arc<Config>,
    join: tokio::task::JoinHandle<Result<(), H::Error>>,
}

impl<H: Handler> Drop for Handle<H> {
    fn drop(&mut self) {
        debug!("drop handle")
    }
}

#[derive(Clone)]
pub struct ChannelSender {
    sender: Sender<Msg>,
    id: ChannelId,
}

/// A multiplexed bidirectional byte stream within the session.
pub struct Channel {
    sender: ChannelSender,
    receiver: UnboundedReceiver<OpenChannelMsg>,
    max_packet_size: u32,
    window_size: u32,
}

enum AuthOutcome {
    Success,
    Failure {
        remaining: auth::MethodSet,
        partial_success: bool,
    },
}

impl<H: Handler> Handle<H> {
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send_authenticate(&mut self, user: &str, method: auth::Method) -> Result<(), Error> {
        self.sender
            .send(Msg::Authenticate {
                user: user.to_string(),
                method,
            })
            .await
            .map_err(|_| Error::SendError)
    }

    /// Wait for the outcome of one authentication request,
    /// interacting with `ui` when the server asks for more.
    async fn wait_auth_outcome(
        &mut self,
        ui: Option<&mut dyn auth::UserInteraction>,
        cached_password: Option<&str>,
        autofill_used: &mut bool,
    ) -> Result<AuthOutcome, Error> {
        let mut ui = ui;
        let mut cancelled = false;
        loop {
            match self.receiver.recv().await {
                Some(Reply::AuthSuccess) => return Ok(AuthOutcome::Success),
                Some(Reply::AuthFailure {
                    remaining,
                    partial_success,
                }) => {
                    if cancelled {
                        return Err(Error::AuthCancelled);
                    }
                    return Ok(AuthOutcome::Failure {
                        remaining,
                        partial_success,
                    });
                }
                Some(Reply::AuthBanner(banner)) => {
                    if let Some(ref mut ui) = ui {
                        ui.show_message(&crate::sanitize(&banner));
                    }
                }
                Some(Reply::AuthInfoRequest {
                    name,
                    instruction,
                    prompts,
                }) => {
                    let responses = {
                        let single_password_prompt = prompts.len() == 1
                            && !prompts[0].echo
                            && prompts[0].prompt.to_lowercase().contains("password");
                        if single_password_prompt && !*autofill_used && cached_password.is_some()
                        {
                            *autofill_used = true;
                            Some(vec![cached_password.unwrap().to_string()])
                        } else if let Some(ref mut ui) = ui {
                            ui.prompt_keyboard_interactive(&name, &instruction, &prompts)
                        } else if prompts.is_empty() {
                            Some(Vec::new())
                        } else {
                            None
                        }
                    };
                    let responses = match responses {
                        Some(r) => r,
                        None => {
                            // Refusing the prompts: answer with an
                            // empty response so the round terminates,
                            // then surface the cancellation.
                            cancelled = true;
                            Vec::new()
                        }
                    };
                    self.sender
                        .send(Msg::AuthInfoResponse { responses })
                        .await
                        .map_err(|_| Error::SendError)?;
                }
                Some(Reply::AuthChangeRequest { prompt }) => {
                    let new_password = ui
                        .as_mut()
                        .and_then(|ui| ui.prompt_password(&crate::sanitize(&prompt)));
                    match new_password {
                        Some(new_password) => {
                            self.sender
                                .send(Msg::AuthChangeResponse { new_password })
                                .await
                                .map_err(|_| Error::SendError)?;
                        }
                        None => return Err(Error::AuthCancelled),
                    }
                }
                None => return Err(Error::Disconnect),
            }
        }
    }

    /// Try the `none` method. Expected to fail, yielding the server's
    /// method list.
    pub async fn authenticate_none<U: Into<String>>(&mut self, user: U) -> Result<bool, Error> {
        let user = user.into();
        self.send_authenticate(&user, auth::Method::None).await?;
        let mut unused = false;
        match self.wait_auth_outcome(None, None, &mut unused).await? {
            AuthOutcome::Success => Ok(true),
            AuthOutcome::Failure { .. } => Ok(false),
        }
    }

    /// Perform password-based SSH authentication.
    pub async fn authenticate_password<U: Into<String>, P: Into<String>>(
        &mut self,
        user: U,
        password: P,
    ) -> Result<bool, Error> {
        let user = user.into();
        self.send_authenticate(
            &user,
            auth::Method::Password {
                password: password.into(),
            },
        )
        .await?;
        let mut unused = false;
        match self.wait_auth_outcome(None, None, &mut unused).await? {
            AuthOutcome::Success => Ok(true),
            AuthOutcome::Failure { .. } => Ok(false),
        }
    }

    /// Perform public key-based SSH authentication.
    pub async fn authenticate_publickey<U: Into<String>>(
        &mut self,
        user: U,
        key: Arc<key::KeyPair>,
    ) -> Result<bool, Error> {
        let user = user.into();
        self.send_authenticate(&user, auth::Method::PublicKey { key })
            .await?;
        let mut unused = false;
        match self.wait_auth_outcome(None, None, &mut unused).await? {
            AuthOutcome::Success => Ok(true),
            AuthOutcome::Failure { .. } => Ok(false),
        }
    }

    /// Perform keyboard-interactive authentication, answering the
    /// server's prompts through `ui`.
    pub async fn authenticate_keyboard_interactive<U: Into<String>>(
        &mut self,
        user: U,
        submethods: &str,
        ui: &mut dyn auth::UserInteraction,
    ) -> Result<bool, Error> {
        let user = user.into();
        self.send_authenticate(
            &user,
            auth::Method::KeyboardInteractive {
                submethods: submethods.to_string(),
            },
        )
        .await?;
        let mut unused = false;
        match self.wait_auth_outcome(Some(&mut *ui), None, &mut unused).await? {
            AuthOutcome::Success => Ok(true),
            AuthOutcome::Failure { .. } => Ok(false),
        }
    }

    /// Perform GSS-API authentication with a caller-provided security
    /// context.
    pub async fn authenticate_gssapi<U: Into<String>>(
        &mut self,
        user: U,
        context: Box<dyn auth::GssContext>,
    ) -> Result<bool, Error> {
        let user = user.into();
        self.send_authenticate(&user, auth::Method::Gssapi { context })
            .await?;
        let mut unused = false;
        match self.wait_auth_outcome(None, None, &mut unused).await? {
            AuthOutcome::Success => Ok(true),
            AuthOutcome::Failure { .. } => Ok(false),
        }
    }

    /// The authentication driver: starts with `none`, then walks the
    /// configured method order intersected with what the server
    /// offers, until success, exhaustion ([`Error::AuthFailed`]) or
    /// cancellation ([`Error::AuthCancelled`]).
    pub async fn authenticate(
        &mut self,
        user: &str,
        identities: &IdentitySet,
        password: Option<String>,
        ui: &mut dyn auth::UserInteraction,
        mut gss: Option<Box<dyn auth::GssContext>>,
    ) -> Result<bool, Error> {
        let mut autofill_used = false;

        self.send_authenticate(user, auth::Method::None).await?;
        let mut remaining = match self
            .wait_auth_outcome(Some(&mut *ui), password.as_deref(), &mut autofill_used)
            .await?
        {
            AuthOutcome::Success => return Ok(true),
            AuthOutcome::Failure { remaining, .. } => remaining,
        };

        let order = self.config.preferred_authentications.clone();
        for method_name in order.iter() {
            let bit = match auth::MethodSet::from_name(method_name) {
                Some(b) => b,
                None => continue,
            };
            if !remaining.contains(bit) {
                continue;
            }
            match bit {
                auth::MethodSet::PUBLICKEY => {
                    for identity in identities.iter() {
                        debug!("trying identity {:?}", identity.name);
                        self.send_authenticate(
                            user,
                            auth::Method::PublicKey {
                                key: identity.key.clone(),
                            },
                        )
                        .await?;
                        match self
                            .wait_auth_outcome(Some(&mut *ui), password.as_deref(), &mut autofill_used)
                            .await?
                        {
                            AuthOutcome::Success => return Ok(true),
                            AuthOutcome::Failure {
                                remaining: r,
                                partial_success,
                            } => {
                                remaining = r;
                                if partial_success || !remaining.contains(bit) {
                                    break;
                                }
                            }
                        }
                    }
                }
                auth::MethodSet::PASSWORD => {
                    let mut attempts = 0;
                    while attempts < auth::MAX_PASSWORD_ATTEMPTS && remaining.contains(bit) {
                        let attempt = if attempts == 0 && password.is_some() {
                            password.clone().unwrap()
                        } else {
                            match ui.prompt_password(&format!("{}'s password:", user)) {
                                Some(p) => p,
                                None => return Err(Error::AuthCancelled),
                            }
                        };
                        attempts += 1;
                        self.send_authenticate(
                            user,
                            auth::Method::Password { password: attempt },
                        )
                        .await?;
                        match self
                            .wait_auth_outcome(Some(&mut *ui), password.as_deref(), &mut autofill_used)
                            .await?
                        {
                            AuthOutcome::Success => return Ok(true),
                            AuthOutcome::Failure { remaining: r, .. } => remaining = r,
                        }
                    }
                }
                auth::MethodSet::KEYBOARD_INTERACTIVE => {
                    self.send_authenticate(
                        user,
                        auth::Method::KeyboardInteractive {
                            submethods: String::new(),
                        },
                    )
                    .await?;
                    match self
                        .wait_auth_outcome(Some(&mut *ui), password.as_deref(), &mut autofill_used)
                        .await?
                    {
                        AuthOutcome::Success => return Ok(true),
                        AuthOutcome::Failure { remaining: r, .. } => remaining = r,
                    }
                }
                auth::MethodSet::GSSAPI_WITH_MIC => {
                    if let Some(context) = gss.take() {
                        self.send_authenticate(user, auth::Method::Gssapi { context })
                            .await?;
                        match self
                            .wait_auth_outcome(Some(&mut *ui), password.as_deref(), &mut autofill_used)
                            .await?
                        {
                            AuthOutcome::Success => return Ok(true),
                            AuthOutcome::Failure { remaining: r, .. } => remaining = r,
                        }
                    }
                }
                _ => {}
            }
        }
        Err(Error::AuthFailed)
    }

    async fn wait_channel_confirmation(
        &self,
        mut receiver: UnboundedReceiver<OpenChannelMsg>,
    ) -> Result<Channel, Error> {
        // The event loop announces the id it allocated before
        // anything goes on the wire.
        let proposed;
        loop {
            match receiver.recv().await {
                Some(OpenChannelMsg::Proposed { id }) => {
                    proposed = id;
                    break;
                }
                Some(OpenChannelMsg::OpenFailure(reason)) => {
                    return Err(Error::ChannelOpenFailure(reason));
                }
                None => return Err(Error::Disconnect),
                msg => {
                    debug!("msg = {:?}", msg);
                }
            }
        }

        let sender = self.sender.clone();
        let confirmation = async move {
            loop {
                match receiver.recv().await {
                    Some(OpenChannelMsg::Open {
                        id,
                        max_packet_size,
                        window_size,
                    }) => {
                        return Ok(Channel {
                            sender: ChannelSender { sender, id },
                            receiver,
                            max_packet_size,
                            window_size,
                        });
                    }
                    Some(OpenChannelMsg::OpenFailure(reason)) => {
                        return Err(Error::ChannelOpenFailure(reason));
                    }
                    None => {
                        return Err(Error::Disconnect);
                    }
                    msg => {
                        debug!("msg = {:?}", msg);
                    }
                }
            }
        };
        match self.config.channel_open_timeout {
            None => confirmation.await,
            Some(timeout) => match tokio::time::timeout(timeout, confirmation).await {
                Ok(result) => result,
                Err(_) => {
                    // Forget the half-open channel on our side.
                    self.sender
                        .send(Msg::AbandonOpen { id: proposed })
                        .await
                        .map_err(|_| Error::SendError)?;
                    Err(Error::ChannelOpenTimeout)
                }
            },
        }
    }

    /// Request a session channel (the most basic type of
    /// channel). The returned channel becomes usable once the server
    /// confirms it.
    pub async fn channel_open_session(&mut self) -> Result<Channel, Error> {
        let (sender, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenSession { sender })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Request an X11 channel, on which the X11 protocol may be
    /// tunneled.
    pub async fn channel_open_x11<A: Into<String>>(
        &mut self,
        originator_address: A,
        originator_port: u32,
    ) -> Result<Channel, Error> {
        let (sender, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenX11 {
                originator_address: originator_address.into(),
                originator_port,
                sender,
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Open a TCP/IP forwarding channel. This is usually done when a
    /// connection comes to a locally forwarded TCP/IP port. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-7).
    pub async fn channel_open_direct_tcpip<A: Into<String>, B: Into<String>>(
        &mut self,
        host_to_connect: A,
        port_to_connect: u32,
        originator_address: B,
        originator_port: u32,
    ) -> Result<Channel, Error> {
        let (sender, receiver) = unbounded_channel();
        self.sender
            .send(Msg::ChannelOpenDirectTcpIp {
                host_to_connect: host_to_connect.into(),
                port_to_connect,
                originator_address: originator_address.into(),
                originator_port,
                sender,
            })
            .await
            .map_err(|_| Error::SendError)?;
        self.wait_channel_confirmation(receiver).await
    }

    /// Ask the server to start forwarding a remote port to us. The
    /// server will open `forwarded-tcpip` channels for incoming
    /// connections. Returns the server's answer when `want_reply`.
    pub async fn tcpip_forward<A: Into<String>>(
        &mut self,
        want_reply: bool,
        address: A,
        port: u32,
    ) -> Result<bool, Error> {
        let (reply, confirm) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.sender
            .send(Msg::TcpIpForward {
                address: address.into(),
                port,
                reply,
            })
            .await
            .map_err(|_| Error::SendError)?;
        match confirm {
            Some(rx) => rx.await.map_err(|_| Error::Disconnect),
            None => Ok(true),
        }
    }

    /// Cancel a previous forwarding request.
    pub async fn cancel_tcpip_forward<A: Into<String>>(
        &mut self,
        want_reply: bool,
        address: A,
        port: u32,
    ) -> Result<bool, Error> {
        let (reply, confirm) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.sender
            .send(Msg::CancelTcpIpForward {
                address: address.into(),
                port,
                reply,
            })
            .await
            .map_err(|_| Error::SendError)?;
        match confirm {
            Some(rx) => rx.await.map_err(|_| Error::Disconnect),
            None => Ok(true),
        }
    }

    /// Sends a disconnect message.
    pub async fn disconnect(
        &mut self,
        reason: Disconnect,
        description: &str,
        language_tag: &str,
    ) -> Result<(), Error> {
        self.sender
            .send(Msg::Disconnect {
                reason,
                description: description.into(),
                language_tag: language_tag.into(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.sender.id
    }

    /// Returns the min between the maximum packet size and the
    /// remaining window size in the channel.
    pub fn writable_packet_size(&self) -> usize {
        self.max_packet_size.min(self.window_size) as usize
    }

    /// Request a pseudo-terminal with the given characteristics.
    /// `terminal_modes` are raw (opcode, value) pairs, RFC 4254
    /// section 8; the list terminator is appended here.
    pub async fn request_pty(
        &mut self,
        want_reply: bool,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        terminal_modes: &[(u8, u32)],
    ) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::RequestPty {
                id: self.sender.id,
                want_reply,
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                terminal_modes: terminal_modes.to_vec(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Request a remote shell.
    pub async fn request_shell(&mut self, want_reply: bool) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::RequestShell {
                id: self.sender.id,
                want_reply,
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Execute a remote program (will be passed to a shell). This can
    /// be used to implement scp (by calling a remote scp and
    /// tunneling to its standard input).
    pub async fn exec<A: Into<String>>(
        &mut self,
        want_reply: bool,
        command: A,
    ) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::Exec {
                id: self.sender.id,
                want_reply,
                command: command.into(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Signal a remote process.
    pub async fn signal(&mut self, signal: Sig) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::Signal {
                id: self.sender.id,
                signal,
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Request the start of a subsystem with the given name (`sftp`,
    /// for instance).
    pub async fn request_subsystem<A: Into<String>>(
        &mut self,
        want_reply: bool,
        name: A,
    ) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::RequestSubsystem {
                id: self.sender.id,
                want_reply,
                name: name.into(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Request X11 forwarding through an already opened X11
    /// channel. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.3.1)
    /// for security issues related to cookies.
    pub async fn request_x11<A: Into<String>, B: Into<String>>(
        &mut self,
        want_reply: bool,
        single_connection: bool,
        x11_authentication_protocol: A,
        x11_authentication_cookie: B,
        x11_screen_number: u32,
    ) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::RequestX11 {
                id: self.sender.id,
                want_reply,
                single_connection,
                x11_authentication_protocol: x11_authentication_protocol.into(),
                x11_authentication_cookie: x11_authentication_cookie.into(),
                x11_screen_number,
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Ask the server to forward the SSH agent connection over this
    /// session.
    pub async fn request_agent_forward(&mut self, want_reply: bool) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::RequestAgentForward {
                id: self.sender.id,
                want_reply,
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Set a remote environment variable.
    pub async fn set_env<A: Into<String>, B: Into<String>>(
        &mut self,
        want_reply: bool,
        variable_name: A,
        variable_value: B,
    ) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::SetEnv {
                id: self.sender.id,
                want_reply,
                variable_name: variable_name.into(),
                variable_value: variable_value.into(),
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Inform the server that our window size has changed.
    pub async fn window_change(
        &mut self,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    ) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::WindowChange {
                id: self.sender.id,
                col_width,
                row_height,
                pix_width,
                pix_height,
            })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Send data to a channel.
    pub async fn data<R: tokio::io::AsyncReadExt + std::marker::Unpin>(
        &mut self,
        data: R,
    ) -> Result<(), Error> {
        self.send_data(None, data).await
    }

    /// Send data to a channel on an extended stream (1 is stderr).
    pub async fn extended_data<R: tokio::io::AsyncReadExt + std::marker::Unpin>(
        &mut self,
        ext: u32,
        data: R,
    ) -> Result<(), Error> {
        self.send_data(Some(ext), data).await
    }

    async fn send_data<R: tokio::io::AsyncReadExt + std::marker::Unpin>(
        &mut self,
        ext: Option<u32>,
        mut data: R,
    ) -> Result<(), Error> {
        let mut total = 0;
        loop {
            // Wait for the window to be restored.
            while self.window_size == 0 {
                match self.receiver.recv().await {
                    Some(OpenChannelMsg::Msg(ChannelMsg::WindowAdjusted { new_size })) => {
                        debug!("window adjusted: {:?}", new_size);
                        self.window_size = new_size;
                        break;
                    }
                    Some(OpenChannelMsg::Msg(msg)) => {
                        debug!("unexpected channel msg: {:?}", msg);
                    }
                    Some(_) => debug!("unexpected channel msg"),
                    None => return Err(Error::Disconnect),
                }
            }
            debug!(
                "sending data, window = {:?}, max packet = {:?}, total = {:?}",
                self.window_size, self.max_packet_size, total
            );
            let sendable = self.window_size.min(self.max_packet_size) as usize;
            let mut c = CryptoVec::new_zeroed(sendable);
            let n = data.read(&mut c[..]).await?;
            total += n;
            c.resize(n);
            self.window_size -= n as u32;
            self.send_data_packet(ext, c).await?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn send_data_packet(&mut self, ext: Option<u32>, data: CryptoVec) -> Result<(), Error> {
        self.sender
            .sender
            .send(if let Some(ext) = ext {
                Msg::ExtendedData {
                    id: self.sender.id,
                    ext,
                    data,
                }
            } else {
                Msg::Data {
                    id: self.sender.id,
                    data,
                }
            })
            .await
            .map_err(|e| {
                error!("{:?}", e);
                Error::SendError
            })?;
        Ok(())
    }

    /// Signal that we will send no more data on this channel. The
    /// channel stays open.
    pub async fn eof(&mut self) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::Eof { id: self.sender.id })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Close this channel. It disappears once the server has closed
    /// its side too.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.sender
            .sender
            .send(Msg::Close { id: self.sender.id })
            .await
            .map_err(|_| Error::SendError)?;
        Ok(())
    }

    /// Wait for data to come.
    pub async fn wait(&mut self) -> Option<ChannelMsg> {
        loop {
            match self.receiver.recv().await {
                Some(OpenChannelMsg::Msg(ChannelMsg::WindowAdjusted { new_size })) => {
                    self.window_size += new_size;
                    return Some(ChannelMsg::WindowAdjusted { new_size });
                }
                Some(OpenChannelMsg::Msg(msg)) => return Some(msg),
                None => return None,
                _ => {}
            }
        }
    }

    /// Wait for the reply to the last request that asked for one.
    /// `CHANNEL_FAILURE` surfaces as [`Error::ChannelRequestFailure`];
    /// callers that prefer to observe failures silently can match on
    /// [`Channel::wait`] instead.
    pub async fn wait_reply(&mut self) -> Result<(), Error> {
        loop {
            match self.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => return Err(Error::ChannelRequestFailure),
                Some(msg) => debug!("awaiting reply, got {:?}", msg),
                None => return Err(Error::Disconnect),
            }
        }
    }
}

impl<H: Handler> Future for Handle<H> {
    type Output = Result<(), H::Error>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match Future::poll(Pin::new(&mut self.join), cx) {
            Poll::Ready(r) => Poll::Ready(match r {
                Ok(Ok(x)) => Ok(x),
                Err(e) => Err(crate::Error::from(e).into()),
                Ok(Err(e)) => Err(e),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

use std::net::ToSocketAddrs;

/// Connect to `addr`, run the version exchange, and spawn the
/// protocol event loop.
pub async fn connect<H: Handler + Send + 'static, T: ToSocketAddrs>(
    config: Arc<Config>,
    addr: T,
    handler: H,
) -> Result<Handle<H>, H::Error> {
    let addr = addr
        .to_socket_addrs()
        .map_err(crate::Error::Connect)?
        .next()
        .ok_or_else(|| {
            crate::Error::Connect(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no address found for host",
            ))
        })?;
    let socket = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| crate::Error::ConnectionTimeout)?,
        None => TcpStream::connect(addr).await,
    }
    .map_err(crate::Error::Connect)?;
    connect_stream(config, socket, handler).await
}

/// Run the protocol over an already-established stream.
pub async fn connect_stream<H, R>(
    config: Arc<Config>,
    mut stream: R,
    handler: H,
) -> Result<Handle<H>, H::Error>
where
    H: Handler + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Writing SSH id.
    let mut write_buffer = SSHBuffer::new();
    write_buffer.send_ssh_id(config.as_ref().client_id.as_bytes());
    stream
        .write_all(&write_buffer.buffer)
        .await
        .map_err(crate::Error::from)?;
    write_buffer.buffer.clear();

    // Reading SSH id and allocating a session if correct.
    let mut stream = SshRead::new(stream);
    let server_id = stream.read_ssh_id().await?;
    debug!("server id: {:?}", server_id);
    let (sender, receiver) = channel(10);
    let (sender2, receiver2) = unbounded_channel();
    if config.maximum_packet_size > 65535 {
        error!(
            "Maximum packet size ({:?}) should not be larger than a TCP packet (65535)",
            config.maximum_packet_size
        );
    }
    let mut session = Session {
        target_window_size: config.window_size,
        common: CommonSession {
            write_buffer,
            kex: None,
            auth_user: String::new(),
            auth_method: None,
            write_cipher: cipher::clear_sealing(),
            pending_opening: None,
            encrypted: None,
            config,
            disconnected: false,
            buffer: CryptoVec::new(),
        },
        receiver,
        sender: sender2,
        channels: HashMap::new(),
        pending_reads: Vec::new(),
        pending_len: 0,
        global_pending: VecDeque::new(),
        server_id: None,
        alive_misses: 0,
    };
    session.read_ssh_id(server_id)?;
    let config = session.common.config.clone();
    let (encrypted_signal, encrypted_recv) = tokio::sync::oneshot::channel();
    let join = tokio::spawn(session.run(stream, handler, Some(encrypted_signal)));
    encrypted_recv.await.unwrap_or(());
    Ok(Handle {
        sender,
        receiver: receiver2,
        config,
        join,
    })
}

async fn start_reading<R: AsyncRead + Unpin>(
    mut stream_read: R,
    mut buffer: SSHBuffer,
    mut cipher: cipher::OpeningCipher,
    socket_timeout: Option<std::time::Duration>,
) -> Result<(usize, R, SSHBuffer, cipher::OpeningCipher), Error> {
    buffer.buffer.clear();
    let n = match socket_timeout {
        Some(timeout) => {
            match tokio::time::timeout(
                timeout,
                cipher::read(&mut stream_read, &mut buffer, &mut cipher),
            )
            .await
            {
                Ok(r) => r?,
                Err(_) => return Err(Error::ConnectionTimeout),
            }
        }
        None => cipher::read(&mut stream_read, &mut buffer, &mut cipher).await?,
    };
    Ok((n, stream_read, buffer, cipher))
}

impl Session {
    async fn run<H: Handler + Send, R: AsyncRead + AsyncWrite + Unpin + Send>(
        mut self,
        stream: SshRead<R>,
        handler: H,
        mut encrypted_signal: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> Result<(), H::Error> {
        self.flush()?;
        let (stream_read, mut stream_write) = stream.split();
        if !self.common.write_buffer.buffer.is_empty() {
            debug!("writing {:?} bytes", self.common.write_buffer.buffer.len());
            stream_write
                .write_all(&self.common.write_buffer.buffer)
                .await
                .map_err(crate::Error::from)?;
            stream_write.flush().await.map_err(crate::Error::from)?;
        }
        self.common.write_buffer.buffer.clear();
        let mut decomp = CryptoVec::new();
        let mut handler = Some(handler);

        let socket_timeout = self.common.config.socket_timeout;
        let buffer = SSHBuffer::new();
        let reading = start_reading(
            stream_read,
            buffer,
            cipher::clear_opening(),
            socket_timeout,
        );
        pin!(reading);

        let keepalive_interval = self.common.config.server_alive_interval;
        let mut keepalive = keepalive_interval.map(|every| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        while !self.common.disconnected {
            tokio::select! {
                r = &mut reading => {
                    let (stream_read, mut buffer, mut opening) = match r {
                        Ok((_, stream_read, buffer, opening)) => (stream_read, buffer, opening),
                        Err(e) => {
                            // A corrupt packet is fatal: tell the peer
                            // why, best effort, then drop the stream.
                            let reason = match e {
                                Error::PacketAuth => Some(Disconnect::MACError),
                                Error::PacketSize(_) | Error::IndexOutOfBounds => {
                                    Some(Disconnect::ProtocolError)
                                }
                                _ => None,
                            };
                            if let Some(reason) = reason {
                                self.common.disconnect(reason, "packet error", "");
                                self.flush()?;
                                stream_write
                                    .write_all(&self.common.write_buffer.buffer)
                                    .await
                                    .unwrap_or(());
                            }
                            return Err(e.into())
                        }
                    };
                    if buffer.buffer.len() < 5 {
                        break
                    }
                    let seqn = buffer.seqn.0.wrapping_sub(1);
                    {
                        let buf = if let Some(ref mut enc) = self.common.encrypted {
                            if let Ok(buf) = enc.decompress.decompress(
                                &buffer.buffer[5..],
                                &mut decomp,
                            ) {
                                buf
                            } else {
                                break
                            }
                        } else {
                            &buffer.buffer[5..]
                        };
                        if !buf.is_empty() {
                            if buf[0] == msg::DISCONNECT {
                                let (code, message) = parse_disconnect(buf);
                                return Err(crate::Error::PeerDisconnect { code, message }.into());
                            } else if buf[0] == msg::DEBUG {
                                let mut r = buf.reader(1);
                                let always_display = r.read_bool().map_err(crate::Error::from)?;
                                let message = String::from_utf8_lossy(
                                    r.read_string().map_err(crate::Error::from)?,
                                ).into_owned();
                                let h = handler.take().unwrap();
                                let (h, s) = h.debug(always_display, &crate::sanitize(&message), self).await?;
                                handler = Some(h);
                                self = s;
                            } else if buf[0] > msg::DEBUG {
                                self = reply(self, &mut handler, &mut encrypted_signal, seqn, &buf[..]).await?;
                            }
                        }
                    }
                    if let Some(new_opening) = self.common.pending_opening.take() {
                        opening = new_opening;
                        buffer.reset_rekey_counters();
                    }
                    self.maybe_rekey_after_read(&buffer)?;
                    reading.set(start_reading(stream_read, buffer, opening, socket_timeout));
                }
                msg = self.receiver.recv(), if !self.is_rekeying() => {
                    match msg {
                        Some(Msg::Authenticate { user, method }) => {
                            self.write_auth_request_if_needed(&user, method);
                        }
                        Some(Msg::AuthInfoResponse { responses }) => {
                            self.write_auth_info_response(&responses);
                        }
                        Some(Msg::AuthChangeResponse { new_password }) => {
                            self.write_password_change(&new_password);
                        }
                        Some(Msg::ChannelOpenSession { sender }) => {
                            let id = self.channel_open_session()?;
                            sender.send(OpenChannelMsg::Proposed { id }).unwrap_or(());
                            self.channels.insert(id, sender);
                        }
                        Some(Msg::ChannelOpenX11 { originator_address, originator_port, sender }) => {
                            let id = self.channel_open_x11(&originator_address, originator_port)?;
                            sender.send(OpenChannelMsg::Proposed { id }).unwrap_or(());
                            self.channels.insert(id, sender);
                        }
                        Some(Msg::ChannelOpenDirectTcpIp { host_to_connect, port_to_connect, originator_address, originator_port, sender }) => {
                            let id = self.channel_open_direct_tcpip(&host_to_connect, port_to_connect, &originator_address, originator_port)?;
                            sender.send(OpenChannelMsg::Proposed { id }).unwrap_or(());
                            self.channels.insert(id, sender);
                        }
                        Some(Msg::AbandonOpen { id }) => {
                            self.abandon_channel_open(id);
                        }
                        Some(Msg::TcpIpForward { address, port, reply }) => {
                            self.tcpip_forward(&address, port, reply)
                        },
                        Some(Msg::CancelTcpIpForward { address, port, reply }) => {
                            self.cancel_tcpip_forward(&address, port, reply)
                        },
                        Some(Msg::Disconnect { reason, description, language_tag }) => {
                            self.disconnect(reason, &description, &language_tag)
                        },
                        Some(Msg::Data { data, id }) => { self.data(id, data) },
                        Some(Msg::Eof { id }) => { self.eof(id); },
                        Some(Msg::Close { id }) => { self.close(id); },
                        Some(Msg::ExtendedData { data, ext, id }) => { self.extended_data(id, ext, data); },
                        Some(Msg::RequestPty { id, want_reply, term, col_width, row_height, pix_width, pix_height, terminal_modes }) => {
                            self.request_pty(id, want_reply, &term, col_width, row_height, pix_width, pix_height, &terminal_modes)
                        },
                        Some(Msg::WindowChange { id, col_width, row_height, pix_width, pix_height }) => {
                            self.window_change(id, col_width, row_height, pix_width, pix_height)
                        },
                        Some(Msg::RequestX11 { id, want_reply, single_connection, x11_authentication_protocol, x11_authentication_cookie, x11_screen_number }) => {
                            self.request_x11(id, want_reply, single_connection, &x11_authentication_protocol, &x11_authentication_cookie, x11_screen_number)
                        },
                        Some(Msg::RequestAgentForward { id, want_reply }) => {
                            self.request_agent_forward(id, want_reply)
                        },
                        Some(Msg::SetEnv { id, want_reply, variable_name, variable_value }) => {
                            self.set_env(id, want_reply, &variable_name, &variable_value)
                        },
                        Some(Msg::RequestShell { id, want_reply }) => {
                            self.request_shell(want_reply, id)
                        },
                        Some(Msg::Exec { id, want_reply, command }) => {
                            self.exec(id, want_reply, &command)
                        },
                        Some(Msg::Signal { id, signal }) => {
                            self.signal(id, signal)
                        },
                        Some(Msg::RequestSubsystem { id, want_reply, name }) => {
                            self.request_subsystem(want_reply, id, &name)
                        },
                        None => {
                            self.common.disconnected = true;
                            break
                        }
                    }
                }
                _ = tick(&mut keepalive), if keepalive.is_some() => {
                    if self.alive_misses > self.common.config.server_alive_count_max {
                        debug!("keepalive misses exhausted");
                        return Err(crate::Error::KeepaliveTimeout.into());
                    }
                    self.send_keepalive();
                }
            }
            self.flush()?;
            if !self.common.write_buffer.buffer.is_empty() {
                debug!(
                    "writing to stream: {:?} bytes",
                    self.common.write_buffer.buffer.len()
                );
                stream_write
                    .write_all(&self.common.write_buffer.buffer)
                    .await
                    .map_err(crate::Error::from)?;
                stream_write.flush().await.map_err(crate::Error::from)?;
            }
            self.common.write_buffer.buffer.clear();
            if let Some(ref mut enc) = self.common.encrypted {
                if let EncryptedState::InitCompression = enc.state {
                    let level = self.common.config.compression_level;
                    enc.client_compression.init_compress(level, &mut enc.compress);
                    enc.state = EncryptedState::Authenticated;
                }
            }
        }
        debug!("disconnected");
        if self.common.disconnected {
            stream_write.shutdown().await.map_err(crate::Error::from)?;
        }
        Ok(())
    }

    fn is_rekeying(&self) -> bool {
        if let Some(ref enc) = self.common.encrypted {
            enc.rekey.is_some()
        } else {
            true
        }
    }

    fn read_ssh_id(&mut self, server_id: ServerIdentification) -> Result<(), Error> {
        let mut exchange = Exchange::new();
        exchange.server_id.extend(&server_id.raw);
        // Preparing the response
        exchange
            .client_id
            .extend(self.common.config.as_ref().client_id.as_bytes());
        self.server_id = Some(server_id);
        let mut kexinit = KexInit {
            exchange,
            algo: None,
            sent: false,
            session_id: None,
        };
        self.common.write_buffer.buffer.clear();
        kexinit.client_write(
            self.common.config.as_ref(),
            &mut self.common.write_cipher,
            &mut self.common.write_buffer,
        )?;
        self.common.kex = Some(Kex::KexInit(kexinit));
        Ok(())
    }

    /// The server's parsed identification line and pre-protocol
    /// banner.
    pub fn server_id(&self) -> Option<&ServerIdentification> {
        self.server_id.as_ref()
    }

    /// Flush the temporary cleartext buffer into the encryption
    /// buffer. This does *not* flush to the socket.
    fn flush(&mut self) -> Result<(), Error> {
        if let Some(ref mut enc) = self.common.encrypted {
            if enc.flush(
                &self.common.config.as_ref().limits,
                &mut self.common.write_cipher,
                &mut self.common.write_buffer,
            )? {
                info!("Re-exchanging keys");
                if enc.rekey.is_none() {
                    if let Some(exchange) = enc.exchange.take() {
                        let mut kexinit = KexInit::initiate_rekey(exchange, &enc.session_id);
                        kexinit.client_write(
                            self.common.config.as_ref(),
                            &mut self.common.write_cipher,
                            &mut self.common.write_buffer,
                        )?;
                        enc.rekey = Some(Kex::KexInit(kexinit))
                    }
                }
            }
        }
        Ok(())
    }

    /// Initiate a rekey if the inbound direction crossed its limits.
    fn maybe_rekey_after_read(&mut self, read_buffer: &SSHBuffer) -> Result<(), Error> {
        let limits = &self.common.config.as_ref().limits;
        if read_buffer.bytes < limits.rekey_read_limit
            && read_buffer.packets < limits.rekey_packet_limit
        {
            return Ok(());
        }
        if let Some(ref mut enc) = self.common.encrypted {
            if enc.rekey.is_none() {
                info!("Re-exchanging keys (inbound limit)");
                if let Some(exchange) = enc.exchange.take() {
                    let mut kexinit = KexInit::initiate_rekey(exchange, &enc.session_id);
                    kexinit.client_write(
                        self.common.config.as_ref(),
                        &mut self.common.write_cipher,
                        &mut self.common.write_buffer,
                    )?;
                    enc.rekey = Some(Kex::KexInit(kexinit))
                }
            }
        }
        Ok(())
    }

    fn send_keepalive(&mut self) {
        if let Some(ref mut enc) = self.common.encrypted {
            if let EncryptedState::Authenticated = enc.state {
                push_packet!(enc.write, {
                    enc.write.push(msg::GLOBAL_REQUEST);
                    enc.write.extend_ssh_string(b"keepalive@openssh.com");
                    enc.write.push(1);
                });
                self.global_pending.push_back(GlobalReply::Keepalive);
                self.alive_misses += 1;
            }
        }
    }

    pub(crate) fn keepalive_answered(&mut self) {
        self.alive_misses = 0;
    }

    /// Send a `ChannelMsg` from the background handler to the client.
    pub fn send_channel_msg(&self, channel: ChannelId, msg: ChannelMsg) -> bool {
        if let Some(chan) = self.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(msg)).unwrap_or(());
            true
        } else {
            false
        }
    }
}

async fn tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

fn parse_disconnect(buf: &[u8]) -> (u32, String) {
    let mut r = buf.reader(1);
    let code = r.read_u32().unwrap_or(0);
    let message = r
        .read_string()
        .map(|m| crate::sanitize(&String::from_utf8_lossy(m)))
        .unwrap_or_default();
    (code, message)
}

impl KexDhDone {
    async fn server_key_check<H: Handler>(
        mut self,
        rekey: bool,
        policy: crate::HostKeyCheck,
        handler: &mut Option<H>,
        buf: &[u8],
    ) -> Result<Kex, H::Error> {
        let mut reader = buf.reader(1);
        let host_key = reader.read_string().map_err(crate::Error::from)?; // server host key.
        let pubkey = key::PublicKey::parse(self.names.key.0.as_bytes(), host_key)
            .map_err(crate::Error::from)?;
        // The key is pinned by the first exchange; rekeys don't
        // consult the verifier again.
        if !rekey && policy != crate::HostKeyCheck::No {
            let h = handler.take().unwrap();
            let (h, check) = h.check_server_key(&pubkey).await?;
            *handler = Some(h);
            if !check {
                return Err(crate::Error::HostKeyRejected.into());
            }
        }
        self.exchange.server_host_key.clear();
        self.exchange.server_host_key.extend(host_key);
        let hash = {
            let server_ephemeral = reader.read_mpint().map_err(crate::Error::from)?;
            self.exchange.server_ephemeral.clear();
            self.exchange.server_ephemeral.extend(server_ephemeral);
            let signature = reader.read_string().map_err(crate::Error::from)?;

            self.kex
                .compute_shared_secret(&self.exchange.server_ephemeral)?;
            let mut buffer = CryptoVec::new();
            let hash = self
                .kex
                .compute_exchange_hash(&self.exchange, &mut buffer)?;
            debug!("exchange hash: {:?}", hash.len());
            let signature = {
                let mut sig_reader = signature.reader(0);
                let sig_type = sig_reader.read_string().map_err(crate::Error::from)?;
                debug!("sig_type: {:?}", std::str::from_utf8(sig_type));
                sig_reader.read_string().map_err(crate::Error::from)?
            };
            use skiff_keys::key::Verify;
            if !pubkey.verify_server_auth(&hash, signature) {
                debug!("wrong server sig");
                return Err(crate::Error::WrongServerSig.into());
            }
            hash
        };
        let mut newkeys = self.compute_keys(hash)?;
        newkeys.sent = true;
        Ok(Kex::NewKeys(newkeys))
    }
}

async fn reply<H: Handler>(
    mut session: Session,
    handler: &mut Option<H>,
    sender: &mut Option<tokio::sync::oneshot::Sender<()>>,
    seqn: u32,
    buf: &[u8],
) -> Result<Session, H::Error> {
    match session.common.kex.take() {
        Some(Kex::KexInit(kexinit)) => {
            if kexinit.algo.is_some()
                || buf[0] == msg::KEXINIT
                || session.common.encrypted.is_none()
            {
                session.common.kex = Some(kexinit.client_parse(
                    session.common.config.as_ref(),
                    &mut session.common.write_cipher,
                    buf,
                    &mut session.common.write_buffer,
                )?);
                session.flush()?;
            }
            Ok(session)
        }
        Some(Kex::DhGexGroup(gex)) => {
            if buf[0] == msg::KEX_DH_GEX_GROUP {
                session.common.kex = Some(gex.client_group(
                    &mut session.common.write_cipher,
                    buf,
                    &mut session.common.write_buffer,
                )?);
                Ok(session)
            } else {
                error!("Wrong packet received");
                Err(crate::Error::Inconsistent.into())
            }
        }
        Some(Kex::KexDhDone(mut kexdhdone)) => {
            if kexdhdone.names.ignore_guessed {
                kexdhdone.names.ignore_guessed = false;
                session.common.kex = Some(Kex::KexDhDone(kexdhdone));
                Ok(session)
            } else if buf[0] == msg::KEXDH_REPLY || buf[0] == msg::KEX_DH_GEX_REPLY {
                // We've sent our DH init, this is the reply.
                let policy = session.common.config.check_host_key;
                let kex = kexdhdone
                    .server_key_check(false, policy, handler, buf)
                    .await?;
                session.common.kex = Some(session.install_sent_newkeys(kex)?);
                session.flush()?;
                Ok(session)
            } else {
                error!("Wrong packet received");
                Err(crate::Error::Inconsistent.into())
            }
        }
        Some(Kex::NewKeys(newkeys)) => {
            debug!("newkeys received");
            if buf[0] != msg::NEWKEYS {
                return Err(crate::Error::Kex.into());
            }
            if let Some(sender) = sender.take() {
                sender.send(()).unwrap_or(());
            }
            session.common.encrypted(
                EncryptedState::WaitingServiceRequest {
                    accepted: false,
                    sent: false,
                },
                newkeys,
            );
            // Ok, NEWKEYS received, now encrypted.
            Ok(session)
        }
        None => session.client_read_encrypted(handler, seqn, buf).await,
    }
}

impl Session {
    /// Write our NEWKEYS and switch the outbound pipeline, as the
    /// barrier requires.
    pub(crate) fn install_sent_newkeys(&mut self, kex: Kex) -> Result<Kex, Error> {
        if let Kex::NewKeys(mut newkeys) = kex {
            self.common
                .write_cipher
                .write(&[msg::NEWKEYS], &mut self.common.write_buffer)?;
            if let Some(sealing) = newkeys.sealing.take() {
                self.common.write_cipher = sealing;
                self.common.write_buffer.reset_rekey_counters();
            }
            newkeys.sent = true;
            Ok(Kex::NewKeys(newkeys))
        } else {
            Ok(kex)
        }
    }
}

/// The configuration of clients.
pub struct Config {
    /// The client ID string sent at the beginning of the protocol.
    pub client_id: String,
    /// The bytes, packets and time limits before key re-exchange.
    pub limits: Limits,
    /// The initial size of a channel (used for flow control).
    pub window_size: u32,
    /// The maximal size of a single packet.
    pub maximum_packet_size: u32,
    /// Lists of preferred algorithms.
    pub preferred: negotiation::Preferred,
    /// The order in which authentication methods are tried.
    pub preferred_authentications: Cow<'static, [&'static str]>,
    /// Host key acceptance policy.
    pub check_host_key: HostKeyCheck,
    /// The deflate level used when compression is negotiated, 1-9.
    pub compression_level: u32,
    /// The algorithm registry. `None` selects the built-in provider.
    pub registry: Option<Arc<negotiation::Registry>>,
    /// Time allowed for the TCP connection to establish.
    pub connect_timeout: Option<std::time::Duration>,
    /// Maximum silence on the socket before the connection is
    /// considered dead.
    pub socket_timeout: Option<std::time::Duration>,
    /// Time allowed for the server to answer a channel open.
    pub channel_open_timeout: Option<std::time::Duration>,
    /// Interval between keepalive probes. `None` disables them.
    pub server_alive_interval: Option<std::time::Duration>,
    /// Unanswered keepalive probes tolerated before the connection is
    /// considered lost.
    pub server_alive_count_max: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_id: format!(
                "SSH-2.0-{}_{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            limits: Limits::default(),
            window_size: 1 << 20,
            maximum_packet_size: 16384,
            preferred: Default::default(),
            preferred_authentications: Cow::Borrowed(&[
                "gssapi-with-mic",
                "publickey",
                "keyboard-interactive",
                "password",
            ]),
            check_host_key: HostKeyCheck::Ask,
            compression_level: 6,
            registry: None,
            connect_timeout: None,
            socket_timeout: None,
            channel_open_timeout: Some(std::time::Duration::from_secs(60)),
            server_alive_interval: None,
            server_alive_count_max: 3,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("client_id", &self.client_id)
            .field("limits", &self.limits)
            .field("window_size", &self.window_size)
            .field("maximum_packet_size", &self.maximum_packet_size)
            .field("preferred", &self.preferred)
            .field("preferred_authentications", &self.preferred_authentications)
            .field("check_host_key", &self.check_host_key)
            .field("compression_level", &self.compression_level)
            .field("connect_timeout", &self.connect_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("channel_open_timeout", &self.channel_open_timeout)
            .field("server_alive_interval", &self.server_alive_interval)
            .field("server_alive_count_max", &self.server_alive_count_max)
            .finish()
    }
}

impl Config {
    pub(crate) fn registry(&self) -> &negotiation::Registry {
        match self.registry {
            Some(ref r) => r,
            None => negotiation::builtin_registry(),
        }
    }
}

/// A client handler. Note that messages can be received from the
/// server at any time during a session.
pub trait Handler: Sized {
    type Error: From<crate::Error> + Send;
    /// A future ultimately resolving into a boolean, which can be
    /// returned by some parts of this handler.
    type FutureBool: Future<Output = Result<(Self, bool), Self::Error>> + Send;

    /// A future ultimately resolving into unit, which can be
    /// returned by some parts of this handler.
    type FutureUnit: Future<Output = Result<(Self, Session), Self::Error>> + Send;

    /// Convert a `bool` to `Self::FutureBool`. This is used to
    /// produce the default handlers.
    fn finished_bool(self, b: bool) -> Self::FutureBool;

    /// Produce a `Self::FutureUnit`. This is used to produce the
    /// default handlers.
    fn finished(self, session: Session) -> Self::FutureUnit;

    /// Called when the server sends us an authentication banner. This
    /// is usually meant to be shown to the user, see
    /// [RFC4252](https://tools.ietf.org/html/rfc4252#section-5.4) for
    /// more details. The text is already sanitized.
    #[allow(unused_variables)]
    fn auth_banner(self, banner: &str, session: Session) -> Self::FutureUnit {
        self.finished(session)
    }

    /// Called when the server sends a debug message. The text is
    /// already sanitized.
    #[allow(unused_variables)]
    fn debug(self, always_display: bool, message: &str, session: Session) -> Self::FutureUnit {
        self.finished(session)
    }

    /// Called to check the server's public key. This is a very important
    /// step to help prevent man-in-the-middle attacks. The default
    /// implementation rejects all keys.
    #[allow(unused_variables)]
    fn check_server_key(self, server_public_key: &key::PublicKey) -> Self::FutureBool {
        self.finished_bool(false)
    }

    /// Called when the server asks to open a channel towards us
    /// (`forwarded-tcpip`, `x11`, `auth-agent@openssh.com`). Types
    /// not accepted here are refused as administratively
    /// prohibited. The default refuses everything.
    #[allow(unused_variables)]
    fn server_channel_open(self, open: &RemoteOpen) -> Self::FutureBool {
        self.finished_bool(false)
    }

    /// Called once a server-initiated channel has been accepted and
    /// confirmed, with its freshly allocated id. Data pumped by the
    /// server arrives through [`Handler::data`]; this is the place to
    /// schedule the worker that connects the channel to its external
    /// socket or pipe.
    #[allow(unused_variables)]
    fn server_channel_opened(
        self,
        id: ChannelId,
        open: RemoteOpen,
        session: Session,
    ) -> Self::FutureUnit {
        self.finished(session)
    }

    /// Called when the server confirmed our request to open a
    /// channel. A channel can only be written to after receiving this
    /// message (this library panics otherwise).
    #[allow(unused_variables)]
    fn channel_open_confirmation(
        self,
        id: ChannelId,
        max_packet_size: u32,
        window_size: u32,
        session: Session,
    ) -> Self::FutureUnit {
        if let Some(channel) = session.channels.get(&id) {
            channel
                .send(OpenChannelMsg::Open {
                    id,
                    max_packet_size,
                    window_size,
                })
                .unwrap_or(());
        } else {
            error!("no channel for id {:?}", id);
        }
        self.finished(session)
    }

    /// Called when the server signals success on a channel request.
    #[allow(unused_variables)]
    fn channel_success(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::Success))
                .unwrap_or(())
        }
        self.finished(session)
    }

    /// Called when the server signals failure on a channel request.
    #[allow(unused_variables)]
    fn channel_failure(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::Failure))
                .unwrap_or(())
        }
        self.finished(session)
    }

    /// Called when the server closes a channel.
    #[allow(unused_variables)]
    fn channel_close(self, channel: ChannelId, mut session: Session) -> Self::FutureUnit {
        if let Some(chan) = session.channels.remove(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::Close)).unwrap_or(());
        }
        self.finished(session)
    }

    /// Called when the server sends EOF to a channel.
    #[allow(unused_variables)]
    fn channel_eof(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::Eof))
                .unwrap_or(())
        }
        self.finished(session)
    }

    /// Called when the server rejected our request to open a channel.
    #[allow(unused_variables)]
    fn channel_open_failure(
        self,
        channel: ChannelId,
        reason: ChannelOpenFailure,
        description: &str,
        language: &str,
        mut session: Session,
    ) -> Self::FutureUnit {
        if let Some(chan) = session.channels.remove(&channel) {
            chan.send(OpenChannelMsg::OpenFailure(reason)).unwrap_or(());
        }
        self.finished(session)
    }

    /// Called when the server sends us data. The `extended_code`
    /// parameter is a stream identifier, `None` is usually the
    /// standard output, and `Some(1)` is the standard error. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-5.2).
    #[allow(unused_variables)]
    fn data(self, channel: ChannelId, data: &[u8], session: Session) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::Data {
                data: CryptoVec::from_slice(data),
            }))
            .unwrap_or(())
        }
        self.finished(session)
    }

    /// Called when the server sends us data on an extended stream
    /// (stream 1 is the standard error).
    #[allow(unused_variables)]
    fn extended_data(
        self,
        channel: ChannelId,
        ext: u32,
        data: &[u8],
        session: Session,
    ) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::ExtendedData {
                ext,
                data: CryptoVec::from_slice(data),
            }))
            .unwrap_or(())
        }
        self.finished(session)
    }

    /// The server informs this client of whether the client may
    /// perform control-S/control-Q flow control. See
    /// [RFC4254](https://tools.ietf.org/html/rfc4254#section-6.8).
    #[allow(unused_variables)]
    fn xon_xoff(
        self,
        channel: ChannelId,
        client_can_do: bool,
        session: Session,
    ) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::XonXoff { client_can_do }))
                .unwrap_or(())
        }
        self.finished(session)
    }

    /// The remote process has exited, with the given exit status.
    #[allow(unused_variables)]
    fn exit_status(
        self,
        channel: ChannelId,
        exit_status: u32,
        session: Session,
    ) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::ExitStatus { exit_status }))
                .unwrap_or(())
        }
        self.finished(session)
    }

    /// The remote process exited upon receiving a signal.
    #[allow(unused_variables)]
    fn exit_signal(
        self,
        channel: ChannelId,
        signal_name: Sig,
        core_dumped: bool,
        error_message: &str,
        lang_tag: &str,
        session: Session,
    ) -> Self::FutureUnit {
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message: error_message.to_string(),
                lang_tag: lang_tag.to_string(),
            }))
            .unwrap_or(())
        }
        self.finished(session)
    }

    /// Called when the network window is adjusted, meaning that we
    /// can send more bytes.
    #[allow(unused_variables)]
    fn window_adjusted(
        self,
        channel: ChannelId,
        mut new_size: u32,
        mut session: Session,
    ) -> Self::FutureUnit {
        if let Some(ref mut enc) = session.common.encrypted {
            new_size -= enc.flush_pending(channel) as u32;
        }
        if let Some(chan) = session.channels.get(&channel) {
            chan.send(OpenChannelMsg::Msg(ChannelMsg::WindowAdjusted { new_size }))
                .unwrap_or(())
        }
        self.finished(session)
    }

    /// Called when this client adjusts the network window. Return the
    /// next target window.
    #[allow(unused_variables)]
    fn adjust_window(&mut self, channel: ChannelId, window: u32) -> u32 {
        window
    }
}
