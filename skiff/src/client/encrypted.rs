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
use super::{GlobalReply, RemoteOpen, Reply};
use crate::auth;
use crate::msg;
use crate::negotiation;
use crate::session::*;
use crate::{ChannelId, ChannelOpenFailure, Error, Sig};
use cryptovec::CryptoVec;
use skiff_keys::encoding::{Encoding, Reader};
use skiff_keys::PublicKeyBase64;

impl super::Session {
    pub(crate) async fn client_read_encrypted<C: super::Handler>(
        mut self,
        client: &mut Option<C>,
        seqn: u32,
        buf: &[u8],
    ) -> Result<Self, C::Error> {
        debug!(
            "client_read_encrypted, buf = {:?}",
            &buf[..buf.len().min(20)]
        );
        // Either this packet is a KEXINIT, in which case we start a key re-exchange.
        if buf[0] == msg::KEXINIT {
            if self.common.encrypted.is_none() {
                unreachable!()
            }
            let rekey = self
                .common
                .encrypted
                .as_mut()
                .and_then(|enc| enc.rekey.take());
            let kexinit = match rekey {
                // We initiated the rekey and this is the server's
                // KEXINIT.
                Some(Kex::KexInit(kexinit)) => Some(kexinit),
                None => {
                    // The server initiates a rekey.
                    let (exchange, session_id) = {
                        let enc = self.common.encrypted.as_mut().unwrap();
                        (enc.exchange.take(), clone_vec(&enc.session_id))
                    };
                    if let Some(exchange) = exchange {
                        let names = negotiation::read_kex(
                            buf,
                            &self.common.config.as_ref().preferred,
                            self.common.config.registry(),
                        )?;
                        Some(KexInit::received_rekey(exchange, names, &session_id))
                    } else {
                        None
                    }
                }
                rekey => {
                    // A KEXINIT in the middle of a rekey is a
                    // protocol violation.
                    if let Some(ref mut enc) = self.common.encrypted {
                        enc.rekey = rekey;
                    }
                    return Err(Error::Inconsistent.into());
                }
            };
            if let Some(kexinit) = kexinit {
                let next = kexinit.client_parse(
                    self.common.config.as_ref(),
                    &mut self.common.write_cipher,
                    buf,
                    &mut self.common.write_buffer,
                )?;
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.rekey = Some(next);
                }
            }
            self.flush()?;
            return Ok(self);
        }

        let rekey = self
            .common
            .encrypted
            .as_mut()
            .and_then(|enc| enc.rekey.take());
        match rekey {
            Some(Kex::DhGexGroup(gex)) => {
                if buf[0] == msg::KEX_DH_GEX_GROUP {
                    let next = gex.client_group(
                        &mut self.common.write_cipher,
                        buf,
                        &mut self.common.write_buffer,
                    )?;
                    if let Some(ref mut enc) = self.common.encrypted {
                        enc.rekey = Some(next);
                    }
                    return Ok(self);
                } else {
                    error!("Wrong packet received");
                    return Err(Error::Inconsistent.into());
                }
            }
            Some(Kex::KexDhDone(mut kexdhdone)) => {
                if kexdhdone.names.ignore_guessed {
                    kexdhdone.names.ignore_guessed = false;
                    if let Some(ref mut enc) = self.common.encrypted {
                        enc.rekey = Some(Kex::KexDhDone(kexdhdone));
                    }
                    return Ok(self);
                } else if buf[0] == msg::KEXDH_REPLY || buf[0] == msg::KEX_DH_GEX_REPLY {
                    // We've sent our DH init, this is the reply.
                    let policy = self.common.config.check_host_key;
                    let kex = kexdhdone
                        .server_key_check(true, policy, client, buf)
                        .await?;
                    let kex = self.install_sent_newkeys(kex)?;
                    if let Some(ref mut enc) = self.common.encrypted {
                        enc.rekey = Some(kex);
                    }
                    self.flush()?;
                    return Ok(self);
                } else {
                    error!("Wrong packet received");
                    return Err(Error::Inconsistent.into());
                }
            }
            Some(Kex::NewKeys(newkeys)) => {
                if buf[0] != msg::NEWKEYS {
                    return Err(Error::Kex.into());
                }
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.last_rekey = std::time::Instant::now();
                    // Rekeying over: unblock the queued channel data.
                    enc.flush_all_pending();
                }
                let mut pending = std::mem::replace(&mut self.pending_reads, Vec::new());
                for p in pending.drain(..) {
                    self = self.process_packet(client, seqn, &p).await?
                }
                self.pending_reads = pending;
                self.pending_len = 0;
                self.common.newkeys(newkeys);
                self.flush()?;
                return Ok(self);
            }
            Some(Kex::KexInit(k)) => {
                // Any non-KEX packet read during a rekey is kept for
                // after the NEWKEYS barrier.
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.rekey = Some(Kex::KexInit(k));
                }
                self.pending_len += buf.len() as u32;
                if self.pending_len > 2 * self.target_window_size {
                    return Err(Error::Pending.into());
                }
                self.pending_reads.push(CryptoVec::from_slice(buf));
                return Ok(self);
            }
            None => {}
        }
        self.process_packet(client, seqn, buf).await
    }

    async fn process_packet<H: super::Handler>(
        mut self,
        client: &mut Option<H>,
        seqn: u32,
        buf: &[u8],
    ) -> Result<Self, H::Error> {
        let mut is_authenticated = false;
        if let Some(ref mut enc) = self.common.encrypted {
            match enc.state {
                EncryptedState::WaitingServiceRequest {
                    ref mut accepted, ..
                } => {
                    debug!("waiting service request, got {:?}", buf[0]);
                    if buf[0] == msg::SERVICE_ACCEPT {
                        let mut r = buf.reader(1);
                        if r.read_string().map_err(crate::Error::from)? == b"ssh-userauth" {
                            *accepted = true;
                            if let Some(ref meth) = self.common.auth_method {
                                enc.state =
                                    EncryptedState::WaitingAuthRequest(auth::AuthRequest::new());
                                enc.write_auth_request(&self.common.auth_user, meth);
                            } else {
                                debug!("no auth method")
                            }
                        }
                    } else {
                        debug!("unknown message: {:?}", buf);
                        return Err(Error::Inconsistent.into());
                    }
                }
                EncryptedState::WaitingAuthRequest(ref mut auth_request) => {
                    if buf[0] == msg::USERAUTH_SUCCESS {
                        debug!("userauth_success");
                        self.sender
                            .send(Reply::AuthSuccess)
                            .map_err(|_| Error::SendError)?;
                        enc.state = EncryptedState::InitCompression;
                        enc.server_compression.init_decompress(&mut enc.decompress);
                        return Ok(self);
                    } else if buf[0] == msg::USERAUTH_BANNER {
                        let mut r = buf.reader(1);
                        let banner = r.read_string().map_err(crate::Error::from)?;
                        if let Ok(banner) = std::str::from_utf8(banner) {
                            let banner = crate::sanitize(banner);
                            self.sender
                                .send(Reply::AuthBanner(banner.clone()))
                                .unwrap_or(());
                            let c = client.take().unwrap();
                            let (c, s) = c.auth_banner(&banner, self).await?;
                            *client = Some(c);
                            return Ok(s);
                        } else {
                            return Ok(self);
                        }
                    } else if buf[0] == msg::USERAUTH_FAILURE {
                        let mut r = buf.reader(1);
                        let remaining_methods = r.read_string().map_err(crate::Error::from)?;
                        let partial_success = r.read_bool().unwrap_or(false);
                        debug!(
                            "userauth_failure, remaining methods {:?}, partial {:?}",
                            std::str::from_utf8(remaining_methods),
                            partial_success
                        );
                        auth_request.methods = auth::MethodSet::empty();
                        for method in remaining_methods.split(|&c| c == b',') {
                            if let Some(m) = auth::MethodSet::from_bytes(method) {
                                auth_request.methods |= m
                            }
                        }
                        auth_request.partial_success = partial_success;
                        auth_request.rejection_count += 1;
                        let remaining = auth_request.methods;
                        self.common.auth_method = None;
                        self.sender
                            .send(Reply::AuthFailure {
                                remaining,
                                partial_success,
                            })
                            .map_err(|_| Error::SendError)?;
                    } else if (msg::USERAUTH_PK_OK..=msg::USERAUTH_GSSAPI_MIC).contains(&buf[0]) {
                        // Codes 60-66 are method-specific; the method
                        // in flight decides the meaning.
                        return self.client_auth_method_msg(client, buf).await;
                    } else {
                        debug!("unknown message: {:?}", buf);
                        return Err(Error::Inconsistent.into());
                    }
                }
                EncryptedState::InitCompression => unreachable!(),
                EncryptedState::Authenticated => is_authenticated = true,
            }
        }
        if is_authenticated {
            self.client_read_authenticated(client, seqn, buf).await
        } else {
            Ok(self)
        }
    }

    /// Method-specific authentication messages (codes 60-66).
    async fn client_auth_method_msg<H: super::Handler>(
        mut self,
        _client: &mut Option<H>,
        buf: &[u8],
    ) -> Result<Self, H::Error> {
        match self.common.auth_method {
            Some(auth::Method::PublicKey { .. }) if buf[0] == msg::USERAUTH_PK_OK => {
                debug!("userauth_pk_ok");
                if let Some(ref mut enc) = self.common.encrypted {
                    if let EncryptedState::WaitingAuthRequest(ref mut auth_request) = enc.state {
                        if let Some(auth::CurrentRequest::PublicKey {
                            ref mut sent_pk_ok, ..
                        }) = auth_request.current
                        {
                            *sent_pk_ok = true;
                        }
                    }
                }
                if let Some(auth_method @ auth::Method::PublicKey { .. }) =
                    self.common.auth_method.take()
                {
                    self.common.buffer.clear();
                    if let Some(ref mut enc) = self.common.encrypted {
                        enc.client_send_signature(
                            &self.common.auth_user,
                            &auth_method,
                            &mut self.common.buffer,
                        )?;
                    }
                    self.common.auth_method = Some(auth_method);
                }
                Ok(self)
            }
            Some(auth::Method::Password { .. }) if buf[0] == msg::USERAUTH_PASSWD_CHANGEREQ => {
                debug!("userauth_passwd_changereq");
                let mut r = buf.reader(1);
                let prompt = String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                    .into_owned();
                let _lang = r.read_string().map_err(crate::Error::from)?;
                self.sender
                    .send(Reply::AuthChangeRequest { prompt })
                    .map_err(|_| Error::SendError)?;
                Ok(self)
            }
            Some(auth::Method::KeyboardInteractive { .. })
                if buf[0] == msg::USERAUTH_INFO_REQUEST =>
            {
                debug!("userauth_info_request");
                let mut r = buf.reader(1);
                let name = String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                    .into_owned();
                let instruction =
                    String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                        .into_owned();
                let _lang = r.read_string().map_err(crate::Error::from)?;
                let n = r.read_u32().map_err(crate::Error::from)?;
                let mut prompts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let prompt =
                        String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                            .into_owned();
                    let echo = r.read_bool().map_err(crate::Error::from)?;
                    prompts.push(auth::Prompt {
                        prompt: crate::sanitize(&prompt),
                        echo,
                    });
                }
                self.sender
                    .send(Reply::AuthInfoRequest {
                        name: crate::sanitize(&name),
                        instruction: crate::sanitize(&instruction),
                        prompts,
                    })
                    .map_err(|_| Error::SendError)?;
                Ok(self)
            }
            Some(auth::Method::Gssapi { .. }) => {
                let session = self.client_gssapi_msg(buf)?;
                Ok(session)
            }
            _ => {
                debug!("unexpected method-specific message: {:?}", buf[0]);
                Err(Error::Inconsistent.into())
            }
        }
    }

    /// The RFC 4462 token loop.
    fn client_gssapi_msg(mut self, buf: &[u8]) -> Result<Self, Error> {
        let context = match self.common.auth_method {
            Some(auth::Method::Gssapi { ref mut context }) => context,
            _ => return Err(Error::Inconsistent),
        };
        match buf[0] {
            msg::USERAUTH_GSSAPI_RESPONSE => {
                // The server picked a mechanism; it must be ours.
                let mut r = buf.reader(1);
                let oid = r.read_string()?;
                if oid != context.oid() {
                    debug!("server selected an unexpected GSS mechanism");
                    return Err(Error::Inconsistent);
                }
                let token = context.init_token(None)?;
                if let Some(ref mut enc) = self.common.encrypted {
                    if let Some(token) = token {
                        push_packet!(enc.write, {
                            enc.write.push(msg::USERAUTH_GSSAPI_TOKEN);
                            enc.write.extend_ssh_string(&token);
                        });
                    }
                }
                Ok(self)
            }
            msg::USERAUTH_GSSAPI_TOKEN => {
                let mut r = buf.reader(1);
                let server_token = r.read_string()?;
                let token = context.init_token(Some(server_token))?;
                let established = context.established();
                if let Some(ref mut enc) = self.common.encrypted {
                    if let Some(token) = token {
                        push_packet!(enc.write, {
                            enc.write.push(msg::USERAUTH_GSSAPI_TOKEN);
                            enc.write.extend_ssh_string(&token);
                        });
                    }
                    if established {
                        // MIC over the session id and the userauth
                        // request header, RFC 4462 section 3.5.
                        let mut mic_input = CryptoVec::new();
                        mic_input.extend_ssh_string(&enc.session_id);
                        mic_input.push(msg::USERAUTH_REQUEST);
                        mic_input.extend_ssh_string(self.common.auth_user.as_bytes());
                        mic_input.extend_ssh_string(b"ssh-connection");
                        mic_input.extend_ssh_string(b"gssapi-with-mic");
                        let mic = match self.common.auth_method {
                            Some(auth::Method::Gssapi { ref mut context }) => {
                                context.mic(&mic_input)?
                            }
                            _ => unreachable!(),
                        };
                        push_packet!(enc.write, {
                            enc.write.push(msg::USERAUTH_GSSAPI_MIC);
                            enc.write.extend_ssh_string(&mic);
                        });
                    }
                }
                Ok(self)
            }
            msg::USERAUTH_GSSAPI_ERROR | msg::USERAUTH_GSSAPI_ERRTOK => {
                // The server reports a GSS failure; a USERAUTH_FAILURE
                // follows.
                debug!("gssapi error from server");
                Ok(self)
            }
            _ => {
                debug!("unexpected gssapi message: {:?}", buf[0]);
                Err(Error::Inconsistent)
            }
        }
    }

    async fn client_read_authenticated<C: super::Handler>(
        mut self,
        client: &mut Option<C>,
        seqn: u32,
        buf: &[u8],
    ) -> Result<Self, C::Error> {
        match buf[0] {
            msg::CHANNEL_OPEN_CONFIRMATION => {
                debug!("channel_open_confirmation");
                let mut reader = buf.reader(1);
                let id_send = ChannelId(reader.read_u32().map_err(crate::Error::from)?);
                let id_recv = reader.read_u32().map_err(crate::Error::from)?;
                let window = reader.read_u32().map_err(crate::Error::from)?;
                let max_packet = reader.read_u32().map_err(crate::Error::from)?;

                if let Some(ref mut enc) = self.common.encrypted {
                    if let Some(parameters) = enc.channels.get_mut(&id_send) {
                        parameters.recipient_channel = id_recv;
                        parameters.recipient_window_size = window;
                        parameters.recipient_maximum_packet_size = max_packet;
                        parameters.confirmed = true;
                    } else {
                        // We've not requested this channel, close connection.
                        return Err(Error::Inconsistent.into());
                    }
                } else {
                    return Err(Error::Inconsistent.into());
                };
                let c = client.take().unwrap();
                let (c, s) = c
                    .channel_open_confirmation(id_send, max_packet, window, self)
                    .await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_OPEN => self.server_channel_open(client, buf).await,
            msg::CHANNEL_CLOSE => {
                debug!("channel_close");
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.remote_close(channel_num);
                }
                let c = client.take().unwrap();
                let (c, s) = c.channel_close(channel_num, self).await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_EOF => {
                debug!("channel_eof");
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let c = client.take().unwrap();
                let (c, s) = c.channel_eof(channel_num, self).await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_OPEN_FAILURE => {
                debug!("channel_open_failure");
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let reason_code = ChannelOpenFailure::from_u32(
                    r.read_u32().map_err(crate::Error::from)?,
                )
                .unwrap_or(ChannelOpenFailure::AdministrativelyProhibited);
                let descr = std::str::from_utf8(r.read_string().map_err(crate::Error::from)?)
                    .map_err(crate::Error::from)?;
                let language = std::str::from_utf8(r.read_string().map_err(crate::Error::from)?)
                    .map_err(crate::Error::from)?;
                if let Some(ref mut enc) = self.common.encrypted {
                    enc.channels.remove(&channel_num);
                }
                let c = client.take().unwrap();
                let (c, s) = c
                    .channel_open_failure(channel_num, reason_code, descr, language, self)
                    .await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_DATA => {
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let data = r.read_string().map_err(crate::Error::from)?;
                let target = self.common.config.window_size;
                let mut c = client.take().unwrap();
                if let Some(ref mut enc) = self.common.encrypted {
                    if enc.adjust_window_size(channel_num, data, target) {
                        let next_window = c.adjust_window(channel_num, self.target_window_size);
                        if next_window > 0 {
                            self.target_window_size = next_window
                        }
                    }
                }
                let (c, s) = c.data(channel_num, data, self).await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_EXTENDED_DATA => {
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let extended_code = r.read_u32().map_err(crate::Error::from)?;
                let data = r.read_string().map_err(crate::Error::from)?;
                let target = self.common.config.window_size;
                let mut c = client.take().unwrap();
                if let Some(ref mut enc) = self.common.encrypted {
                    if enc.adjust_window_size(channel_num, data, target) {
                        let next_window = c.adjust_window(channel_num, self.target_window_size);
                        if next_window > 0 {
                            self.target_window_size = next_window
                        }
                    }
                }
                let (c, s) = c
                    .extended_data(channel_num, extended_code, data, self)
                    .await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_REQUEST => {
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let req = r.read_string().map_err(crate::Error::from)?;
                debug!(
                    "channel_request: {:?} {:?}",
                    channel_num,
                    std::str::from_utf8(req)
                );
                let cl = client.take().unwrap();
                let (c, s) = match req {
                    b"xon-xoff" => {
                        r.read_byte().map_err(crate::Error::from)?; // should be 0.
                        let client_can_do = r.read_byte().map_err(crate::Error::from)?;
                        cl.xon_xoff(channel_num, client_can_do != 0, self).await?
                    }
                    b"exit-status" => {
                        r.read_byte().map_err(crate::Error::from)?; // should be 0.
                        let exit_status = r.read_u32().map_err(crate::Error::from)?;
                        cl.exit_status(channel_num, exit_status, self).await?
                    }
                    b"exit-signal" => {
                        r.read_byte().map_err(crate::Error::from)?; // should be 0.
                        let signal_name =
                            Sig::from_name(r.read_string().map_err(crate::Error::from)?)?;
                        let core_dumped = r.read_byte().map_err(crate::Error::from)?;
                        let error_message =
                            std::str::from_utf8(r.read_string().map_err(crate::Error::from)?)
                                .map_err(crate::Error::from)?;
                        let lang_tag =
                            std::str::from_utf8(r.read_string().map_err(crate::Error::from)?)
                                .map_err(crate::Error::from)?;
                        cl.exit_signal(
                            channel_num,
                            signal_name,
                            core_dumped != 0,
                            error_message,
                            lang_tag,
                            self,
                        )
                        .await?
                    }
                    _ => {
                        info!("Unknown channel request {:?}", std::str::from_utf8(req));
                        let want_reply = r.read_byte().unwrap_or(0);
                        if want_reply != 0 {
                            if let Some(ref mut enc) = self.common.encrypted {
                                if let Some(channel) = enc.channels.get(&channel_num) {
                                    let recipient = channel.recipient_channel;
                                    push_packet!(enc.write, {
                                        enc.write.push(msg::CHANNEL_FAILURE);
                                        enc.write.push_u32_be(recipient);
                                    });
                                }
                            }
                        }
                        (cl, self)
                    }
                };
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_WINDOW_ADJUST => {
                debug!("channel_window_adjust");
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let amount = r.read_u32().map_err(crate::Error::from)?;
                let mut new_value = 0;
                debug!("amount: {:?}", amount);
                if let Some(ref mut enc) = self.common.encrypted {
                    if let Some(ref mut channel) = enc.channels.get_mut(&channel_num) {
                        channel.recipient_window_size =
                            channel.recipient_window_size.saturating_add(amount);
                        new_value = channel.recipient_window_size;
                    } else {
                        return Err(Error::WrongChannel.into());
                    }
                }
                let c = client.take().unwrap();
                let (c, s) = c.window_adjusted(channel_num, new_value, self).await?;
                *client = Some(c);
                Ok(s)
            }
            msg::GLOBAL_REQUEST => {
                let mut r = buf.reader(1);
                let req = r.read_string().map_err(crate::Error::from)?;
                let want_reply = r.read_byte().unwrap_or(0);
                info!(
                    "Unhandled global request: {:?} (want_reply {:?})",
                    std::str::from_utf8(req),
                    want_reply
                );
                if want_reply != 0 {
                    if let Some(ref mut enc) = self.common.encrypted {
                        push_packet!(enc.write, {
                            enc.write.push(msg::REQUEST_FAILURE);
                        });
                    }
                }
                Ok(self)
            }
            msg::REQUEST_SUCCESS | msg::REQUEST_FAILURE => {
                let success = buf[0] == msg::REQUEST_SUCCESS;
                match self.global_pending.pop_front() {
                    Some(GlobalReply::Caller(sender)) => {
                        sender.send(success).unwrap_or(());
                    }
                    Some(GlobalReply::Keepalive) => {
                        // Any reply, even a failure, proves the peer
                        // is alive.
                        self.keepalive_answered();
                    }
                    None => {
                        debug!("unsolicited global reply");
                    }
                }
                Ok(self)
            }
            msg::CHANNEL_SUCCESS => {
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let c = client.take().unwrap();
                let (c, s) = c.channel_success(channel_num, self).await?;
                *client = Some(c);
                Ok(s)
            }
            msg::CHANNEL_FAILURE => {
                let mut r = buf.reader(1);
                let channel_num = ChannelId(r.read_u32().map_err(crate::Error::from)?);
                let c = client.take().unwrap();
                let (c, s) = c.channel_failure(channel_num, self).await?;
                *client = Some(c);
                Ok(s)
            }
            _ => {
                info!("Unhandled packet: {:?}", buf[0]);
                // https://tools.ietf.org/html/rfc4253#section-11.4
                if let Some(ref mut enc) = self.common.encrypted {
                    push_packet!(enc.write, {
                        enc.write.push(msg::UNIMPLEMENTED);
                        enc.write.push_u32_be(seqn);
                    });
                }
                Ok(self)
            }
        }
    }

    /// A server-initiated CHANNEL_OPEN: consult the handler, then
    /// confirm or refuse.
    async fn server_channel_open<C: super::Handler>(
        mut self,
        client: &mut Option<C>,
        buf: &[u8],
    ) -> Result<Self, C::Error> {
        let mut r = buf.reader(1);
        let typ = r.read_string().map_err(crate::Error::from)?;
        let remote_id = r.read_u32().map_err(crate::Error::from)?;
        let remote_window = r.read_u32().map_err(crate::Error::from)?;
        let remote_max_packet = r.read_u32().map_err(crate::Error::from)?;
        debug!("server_channel_open: {:?}", std::str::from_utf8(typ));

        let open = match typ {
            b"forwarded-tcpip" => {
                let connected_address =
                    String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                        .into_owned();
                let connected_port = r.read_u32().map_err(crate::Error::from)?;
                let originator_address =
                    String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                        .into_owned();
                let originator_port = r.read_u32().map_err(crate::Error::from)?;
                Some(RemoteOpen::ForwardedTcpIp {
                    connected_address,
                    connected_port,
                    originator_address,
                    originator_port,
                })
            }
            b"x11" => {
                let originator_address =
                    String::from_utf8_lossy(r.read_string().map_err(crate::Error::from)?)
                        .into_owned();
                let originator_port = r.read_u32().map_err(crate::Error::from)?;
                Some(RemoteOpen::X11 {
                    originator_address,
                    originator_port,
                })
            }
            b"auth-agent@openssh.com" => Some(RemoteOpen::AgentForward),
            _ => None,
        };

        let accepted = match open {
            Some(ref open) => {
                let c = client.take().unwrap();
                let (c, accept) = c.server_channel_open(open).await?;
                *client = Some(c);
                accept
            }
            None => false,
        };

        if !accepted {
            // Either an unsolicited type or a handler refusal.
            if let Some(ref mut enc) = self.common.encrypted {
                push_packet!(enc.write, {
                    enc.write.push(msg::CHANNEL_OPEN_FAILURE);
                    enc.write.push_u32_be(remote_id);
                    enc.write
                        .push_u32_be(ChannelOpenFailure::AdministrativelyProhibited as u32);
                    enc.write.extend_ssh_string(b"administratively prohibited");
                    enc.write.extend_ssh_string(b"en");
                });
            }
            return Ok(self);
        }

        let window_size = self.common.config.window_size;
        let maximum_packet_size = self.common.config.maximum_packet_size;
        let id = if let Some(ref mut enc) = self.common.encrypted {
            let id = enc.new_remote_channel(
                remote_id,
                remote_window,
                remote_max_packet,
                window_size,
                maximum_packet_size,
            );
            push_packet!(enc.write, {
                enc.write.push(msg::CHANNEL_OPEN_CONFIRMATION);
                enc.write.push_u32_be(remote_id);
                enc.write.push_u32_be(id.0);
                enc.write.push_u32_be(window_size);
                enc.write.push_u32_be(maximum_packet_size);
            });
            id
        } else {
            return Err(Error::Inconsistent.into());
        };

        let c = client.take().unwrap();
        let (c, s) = c
            .server_channel_opened(id, open.unwrap(), self)
            .await?;
        *client = Some(c);
        Ok(s)
    }

    pub(crate) fn write_auth_request_if_needed(&mut self, user: &str, meth: auth::Method) -> bool {
        let mut is_waiting = false;
        if let Some(ref mut enc) = self.common.encrypted {
            is_waiting = match enc.state {
                EncryptedState::WaitingAuthRequest(_) => true,
                EncryptedState::WaitingServiceRequest {
                    accepted,
                    ref mut sent,
                } => {
                    debug!("sending ssh-userauth service request");
                    if !*sent {
                        let mut request = CryptoVec::new();
                        request.push(msg::SERVICE_REQUEST);
                        request.extend_ssh_string(b"ssh-userauth");
                        if self
                            .common
                            .write_cipher
                            .write(&request, &mut self.common.write_buffer)
                            .is_ok()
                        {
                            *sent = true
                        }
                    }
                    accepted
                }
                EncryptedState::InitCompression | EncryptedState::Authenticated => false,
            };
            debug!(
                "write_auth_request_if_needed: is_waiting = {:?}",
                is_waiting
            );
            if is_waiting {
                enc.state = EncryptedState::WaitingAuthRequest(auth::AuthRequest::new());
                enc.write_auth_request(user, &meth);
            }
        }
        self.common.auth_user.clear();
        self.common.auth_user.push_str(user);
        self.common.auth_method = Some(meth);
        is_waiting
    }

    /// Send a keyboard-interactive INFO_RESPONSE.
    pub(crate) fn write_auth_info_response(&mut self, responses: &[String]) {
        if let Some(ref mut enc) = self.common.encrypted {
            push_packet!(enc.write, {
                enc.write.push(msg::USERAUTH_INFO_RESPONSE);
                enc.write.push_u32_be(responses.len() as u32);
                for r in responses {
                    enc.write.extend_ssh_string(r.as_bytes());
                }
            });
        }
    }

    /// Re-send a password request carrying the change flag, answering
    /// a PASSWD_CHANGEREQ.
    pub(crate) fn write_password_change(&mut self, new_password: &str) {
        let user = std::mem::take(&mut self.common.auth_user);
        let old_password = match self.common.auth_method {
            Some(auth::Method::Password { ref mut password }) => {
                std::mem::replace(password, new_password.to_string())
            }
            _ => {
                self.common.auth_user = user;
                return;
            }
        };
        if let Some(ref mut enc) = self.common.encrypted {
            push_packet!(enc.write, {
                enc.write.push(msg::USERAUTH_REQUEST);
                enc.write.extend_ssh_string(user.as_bytes());
                enc.write.extend_ssh_string(b"ssh-connection");
                enc.write.extend_ssh_string(b"password");
                enc.write.push(1);
                enc.write.extend_ssh_string(old_password.as_bytes());
                enc.write.extend_ssh_string(new_password.as_bytes());
            });
        }
        self.common.auth_user = user;
    }
}

impl Encrypted {
    pub(crate) fn write_auth_request(&mut self, user: &str, auth_method: &auth::Method) -> bool {
        // The server is waiting for our USERAUTH_REQUEST.
        push_packet!(self.write, {
            self.write.push(msg::USERAUTH_REQUEST);

            match *auth_method {
                auth::Method::None => {
                    self.write.extend_ssh_string(user.as_bytes());
                    self.write.extend_ssh_string(b"ssh-connection");
                    self.write.extend_ssh_string(b"none");
                    true
                }
                auth::Method::Password { ref password } => {
                    self.write.extend_ssh_string(user.as_bytes());
                    self.write.extend_ssh_string(b"ssh-connection");
                    self.write.extend_ssh_string(b"password");
                    self.write.push(0);
                    self.write.extend_ssh_string(password.as_bytes());
                    true
                }
                auth::Method::PublicKey { ref key } => {
                    self.write.extend_ssh_string(user.as_bytes());
                    self.write.extend_ssh_string(b"ssh-connection");
                    self.write.extend_ssh_string(b"publickey");
                    self.write.push(0); // This is a probe
                    debug!("write_auth_request: {:?}", key.name());
                    self.write.extend_ssh_string(key.name().as_bytes());
                    self.write.extend_ssh_string(&key.public_key_bytes());
                    if let EncryptedState::WaitingAuthRequest(ref mut auth_request) = self.state {
                        auth_request.current =
                            Some(auth::CurrentRequest::PublicKey { sent_pk_ok: false });
                    }
                    true
                }
                auth::Method::KeyboardInteractive { ref submethods } => {
                    self.write.extend_ssh_string(user.as_bytes());
                    self.write.extend_ssh_string(b"ssh-connection");
                    self.write.extend_ssh_string(b"keyboard-interactive");
                    self.write.extend_ssh_string(b""); // language tag
                    self.write.extend_ssh_string(submethods.as_bytes());
                    if let EncryptedState::WaitingAuthRequest(ref mut auth_request) = self.state {
                        auth_request.current = Some(auth::CurrentRequest::KeyboardInteractive {
                            submethods: submethods.clone(),
                        });
                    }
                    true
                }
                auth::Method::Gssapi { ref context } => {
                    self.write.extend_ssh_string(user.as_bytes());
                    self.write.extend_ssh_string(b"ssh-connection");
                    self.write.extend_ssh_string(b"gssapi-with-mic");
                    self.write.push_u32_be(1); // one mechanism
                    self.write.extend_ssh_string(context.oid());
                    if let EncryptedState::WaitingAuthRequest(ref mut auth_request) = self.state {
                        auth_request.current =
                            Some(auth::CurrentRequest::Gssapi { accepted: false });
                    }
                    true
                }
            }
        })
    }

    fn client_send_signature(
        &mut self,
        user: &str,
        method: &auth::Method,
        buffer: &mut CryptoVec,
    ) -> Result<(), Error> {
        if let auth::Method::PublicKey { ref key } = *method {
            buffer.clear();
            // The signature covers the session id and the whole
            // signed request, RFC 4252 section 7.
            buffer.extend_ssh_string(&self.session_id);
            let i0 = buffer.len();
            buffer.push(msg::USERAUTH_REQUEST);
            buffer.extend_ssh_string(user.as_bytes());
            buffer.extend_ssh_string(b"ssh-connection");
            buffer.extend_ssh_string(b"publickey");
            buffer.push(1);
            buffer.extend_ssh_string(key.name().as_bytes());
            buffer.extend_ssh_string(&key.public_key_bytes());
            key.add_self_signature(buffer).map_err(crate::Error::from)?;
            push_packet!(self.write, {
                self.write.extend(&buffer[i0..]);
            })
        }
        Ok(())
    }
}
