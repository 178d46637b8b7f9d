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

use crate::cipher::{OpeningCipher, SealingCipher};
use crate::sshbuffer::SSHBuffer;
use crate::{auth, kex, msg, negotiation};
use crate::{ChannelId, Disconnect, Error, Limits};
use byteorder::{BigEndian, ByteOrder};
use cryptovec::CryptoVec;
use skiff_keys::encoding::Encoding;
use std::collections::{HashMap, VecDeque};
use std::num::Wrapping;
use std::sync::Arc;

/// The parameters of one channel in the table.
#[derive(Debug)]
pub(crate) struct Channel {
    pub recipient_channel: u32,
    pub sender_channel: ChannelId,
    pub recipient_window_size: u32,
    pub sender_window_size: u32,
    pub recipient_maximum_packet_size: u32,
    pub sender_maximum_packet_size: u32,
    /// Has the other side confirmed the channel?
    pub confirmed: bool,
    pub sent_eof: bool,
    pub sent_close: bool,
    pub received_close: bool,
    pub pending_data: VecDeque<(CryptoVec, Option<u32>, usize)>,
}

#[derive(Debug)]
pub(crate) struct Encrypted {
    pub state: EncryptedState,

    // It's always Some, except when we std::mem::replace it temporarily.
    pub exchange: Option<Exchange>,
    pub kex: kex::Algorithm,
    pub session_id: CryptoVec,
    pub rekey: Option<Kex>,
    pub channels: HashMap<ChannelId, Channel>,
    pub last_channel_id: Wrapping<u32>,
    pub write: CryptoVec,
    pub write_cursor: usize,
    pub last_rekey: std::time::Instant,
    pub server_compression: crate::compression::Compression,
    pub client_compression: crate::compression::Compression,
    pub compress: crate::compression::Compress,
    pub decompress: crate::compression::Decompress,
    pub compress_buffer: CryptoVec,
}

pub(crate) struct CommonSession {
    pub auth_user: String,
    pub config: Arc<crate::client::Config>,
    pub encrypted: Option<Encrypted>,
    pub auth_method: Option<auth::Method>,
    pub write_buffer: SSHBuffer,
    pub kex: Option<Kex>,
    /// The outbound pipeline; switched as soon as our NEWKEYS is on
    /// the wire.
    pub write_cipher: SealingCipher,
    /// The inbound pipeline derived by the last key exchange, waiting
    /// for the peer's NEWKEYS. The reader picks it up between
    /// packets.
    pub pending_opening: Option<OpeningCipher>,
    pub disconnected: bool,
    pub buffer: CryptoVec,
}

impl CommonSession {
    /// Install the result of the first key exchange.
    pub fn encrypted(&mut self, state: EncryptedState, mut newkeys: NewKeys) {
        self.pending_opening = newkeys.opening.take();
        self.encrypted = Some(Encrypted {
            exchange: Some(newkeys.exchange),
            kex: newkeys.kex,
            session_id: newkeys.session_id,
            state,
            rekey: None,
            channels: HashMap::new(),
            last_channel_id: Wrapping(1),
            write: CryptoVec::new(),
            write_cursor: 0,
            last_rekey: std::time::Instant::now(),
            server_compression: newkeys.names.server_compression,
            client_compression: newkeys.names.client_compression,
            compress: crate::compression::Compress::None,
            compress_buffer: CryptoVec::new(),
            decompress: crate::compression::Decompress::None,
        });
    }

    /// Install the result of a rekey.
    pub fn newkeys(&mut self, mut newkeys: NewKeys) {
        self.pending_opening = newkeys.opening.take();
        let level = self.config.compression_level;
        if let Some(ref mut enc) = self.encrypted {
            enc.exchange = Some(newkeys.exchange);
            enc.kex = newkeys.kex;
            enc.server_compression = newkeys.names.server_compression;
            enc.client_compression = newkeys.names.client_compression;
            // Compression contexts restart at the NEWKEYS barrier.
            if let EncryptedState::Authenticated = enc.state {
                enc.client_compression.init_compress(level, &mut enc.compress);
                enc.server_compression.init_decompress(&mut enc.decompress);
            }
        }
    }

    /// Send a disconnect message.
    pub fn disconnect(&mut self, reason: Disconnect, description: &str, language_tag: &str) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        if let Some(ref mut enc) = self.encrypted {
            push_packet!(enc.write, {
                enc.write.push(msg::DISCONNECT);
                enc.write.push_u32_be(reason as u32);
                enc.write.extend_ssh_string(description.as_bytes());
                enc.write.extend_ssh_string(language_tag.as_bytes());
            });
        } else {
            // Not encrypted yet: frame it through the clear pipeline.
            self.buffer.clear();
            self.buffer.push(msg::DISCONNECT);
            self.buffer.push_u32_be(reason as u32);
            self.buffer.extend_ssh_string(description.as_bytes());
            self.buffer.extend_ssh_string(language_tag.as_bytes());
            let buffer = &self.buffer;
            let _ = self.write_cipher.write(buffer, &mut self.write_buffer);
        }
    }

    /// Send a single byte message onto the channel.
    pub fn byte(&mut self, channel: ChannelId, msg: u8) {
        if let Some(ref mut enc) = self.encrypted {
            enc.byte(channel, msg)
        }
    }
}

impl Encrypted {
    pub fn byte(&mut self, channel: ChannelId, msg: u8) {
        if let Some(channel) = self.channels.get(&channel) {
            push_packet!(self.write, {
                self.write.push(msg);
                self.write.push_u32_be(channel.recipient_channel);
            });
        }
    }

    /// Send CHANNEL_EOF once. The channel stays open.
    pub fn eof(&mut self, channel: ChannelId) {
        if let Some(chan) = self.channels.get_mut(&channel) {
            if !chan.sent_eof && !chan.sent_close {
                chan.sent_eof = true;
                push_packet!(self.write, {
                    self.write.push(msg::CHANNEL_EOF);
                    self.write.push_u32_be(chan.recipient_channel);
                });
            }
        }
    }

    /// Send CHANNEL_CLOSE once. The table entry goes away when both
    /// sides have sent it.
    pub fn close(&mut self, channel: ChannelId) {
        let mut remove = false;
        if let Some(chan) = self.channels.get_mut(&channel) {
            if !chan.sent_close {
                chan.sent_close = true;
                push_packet!(self.write, {
                    self.write.push(msg::CHANNEL_CLOSE);
                    self.write.push_u32_be(chan.recipient_channel);
                });
            }
            remove = chan.received_close;
        }
        if remove {
            self.channels.remove(&channel);
        }
    }

    /// Handle a received CHANNEL_CLOSE: echo it unless already sent,
    /// and drop the entry once both sides have closed. Receiving it
    /// twice is harmless.
    pub fn remote_close(&mut self, channel: ChannelId) -> bool {
        if let Some(chan) = self.channels.get_mut(&channel) {
            chan.received_close = true;
            if !chan.sent_close {
                chan.sent_close = true;
                push_packet!(self.write, {
                    self.write.push(msg::CHANNEL_CLOSE);
                    self.write.push_u32_be(chan.recipient_channel);
                });
            }
            self.channels.remove(&channel);
            true
        } else {
            false
        }
    }

    pub fn sender_window_size(&self, channel: ChannelId) -> usize {
        if let Some(ref channel) = self.channels.get(&channel) {
            channel.sender_window_size as usize
        } else {
            0
        }
    }

    /// Account for received channel data, and top the local window
    /// back up once it falls below half of `target`.
    pub fn adjust_window_size(&mut self, channel: ChannelId, data: &[u8], target: u32) -> bool {
        if let Some(ref mut channel) = self.channels.get_mut(&channel) {
            // Ignore extra data.
            // https://tools.ietf.org/html/rfc4254#section-5.2
            if data.len() as u32 <= channel.sender_window_size {
                channel.sender_window_size -= data.len() as u32;
            }
            if channel.sender_window_size < target / 2 {
                push_packet!(self.write, {
                    self.write.push(msg::CHANNEL_WINDOW_ADJUST);
                    self.write.push_u32_be(channel.recipient_channel);
                    self.write.push_u32_be(target - channel.sender_window_size);
                });
                channel.sender_window_size = target;
                return true;
            }
        }
        false
    }

    pub fn flush_pending(&mut self, channel: ChannelId) -> usize {
        let mut pending_size = 0;
        if let Some(channel) = self.channels.get_mut(&channel) {
            while let Some((buf, a, from)) = channel.pending_data.pop_front() {
                let size = Self::data_noqueue(&mut self.write, channel, &buf, a, from);
                pending_size += size;
                if from + size < buf.len() {
                    channel.pending_data.push_front((buf, a, from + size));
                    break;
                }
            }
        }
        pending_size
    }

    pub fn flush_all_pending(&mut self) {
        for channel in self.channels.values_mut() {
            while let Some((buf, a, from)) = channel.pending_data.pop_front() {
                let size = Self::data_noqueue(&mut self.write, channel, &buf, a, from);
                if from + size < buf.len() {
                    channel.pending_data.push_front((buf, a, from + size));
                    break;
                }
            }
        }
    }

    pub fn has_pending_data(&self, channel: ChannelId) -> bool {
        if let Some(channel) = self.channels.get(&channel) {
            !channel.pending_data.is_empty()
        } else {
            false
        }
    }

    /// Push the largest amount of `&buf0[from..]` that can fit into
    /// the window, dividing it into packets if it is too large, and
    /// return the length that was written. The window is decremented
    /// as each packet is staged.
    fn data_noqueue(
        write: &mut CryptoVec,
        channel: &mut Channel,
        buf0: &[u8],
        ext: Option<u32>,
        from: usize,
    ) -> usize {
        let mut buf = if buf0.len() as u32 > from as u32 + channel.recipient_window_size {
            &buf0[from..from + channel.recipient_window_size as usize]
        } else {
            &buf0[from..]
        };
        let buf_len = buf.len();

        while !buf.is_empty() {
            // Compute the length we're allowed to send.
            let off = std::cmp::min(buf.len(), channel.recipient_maximum_packet_size as usize);
            push_packet!(write, {
                match ext {
                    None => {
                        write.push(msg::CHANNEL_DATA);
                        write.push_u32_be(channel.recipient_channel);
                    }
                    Some(ext) => {
                        write.push(msg::CHANNEL_EXTENDED_DATA);
                        write.push_u32_be(channel.recipient_channel);
                        write.push_u32_be(ext);
                    }
                }
                write.extend_ssh_string(&buf[..off]);
            });
            channel.recipient_window_size -= off as u32;
            buf = &buf[off..]
        }
        buf_len
    }

    pub fn data(&mut self, channel: ChannelId, buf0: CryptoVec) {
        if let Some(channel) = self.channels.get_mut(&channel) {
            assert!(channel.confirmed);
            if !channel.pending_data.is_empty() || self.rekey.is_some() {
                channel.pending_data.push_back((buf0, None, 0));
                return;
            }
            let buf_len = Self::data_noqueue(&mut self.write, channel, &buf0, None, 0);
            if buf_len < buf0.len() {
                channel.pending_data.push_back((buf0, None, buf_len))
            }
        }
    }

    pub fn extended_data(&mut self, channel: ChannelId, ext: u32, buf0: CryptoVec) {
        if let Some(channel) = self.channels.get_mut(&channel) {
            assert!(channel.confirmed);
            if !channel.pending_data.is_empty() || self.rekey.is_some() {
                channel.pending_data.push_back((buf0, Some(ext), 0));
                return;
            }
            let buf_len = Self::data_noqueue(&mut self.write, channel, &buf0, Some(ext), 0);
            if buf_len < buf0.len() {
                channel.pending_data.push_back((buf0, Some(ext), buf_len))
            }
        }
    }

    /// Compress, seal and move the staged packets to the wire
    /// buffer. Returns whether the rekey limits have been hit.
    pub fn flush(
        &mut self,
        limits: &Limits,
        cipher: &mut SealingCipher,
        write_buffer: &mut SSHBuffer,
    ) -> Result<bool, Error> {
        // If there are pending packets (and we've not started to rekey), flush them.
        while self.write_cursor < self.write.len() {
            // Read a single packet, compress, encrypt and send it.
            let len = BigEndian::read_u32(&self.write[self.write_cursor..]) as usize;
            let packet = self.compress.compress(
                &self.write[(self.write_cursor + 4)..(self.write_cursor + 4 + len)],
                &mut self.compress_buffer,
            )?;
            cipher.write(packet, write_buffer)?;
            self.write_cursor += 4 + len
        }
        if self.write_cursor >= self.write.len() {
            // If all packets have been written, clear.
            self.write_cursor = 0;
            self.write.clear();
        }
        let now = std::time::Instant::now();
        let dur = now.duration_since(self.last_rekey);
        Ok(write_buffer.bytes >= limits.rekey_write_limit
            || write_buffer.packets >= limits.rekey_packet_limit
            || dur >= limits.rekey_time_limit)
    }

    pub fn new_channel(&mut self, window_size: u32, maxpacket: u32) -> ChannelId {
        loop {
            self.last_channel_id += Wrapping(1);
            if let std::collections::hash_map::Entry::Vacant(vacant_entry) =
                self.channels.entry(ChannelId(self.last_channel_id.0))
            {
                vacant_entry.insert(Channel {
                    recipient_channel: 0,
                    sender_channel: ChannelId(self.last_channel_id.0),
                    sender_window_size: window_size,
                    recipient_window_size: 0,
                    sender_maximum_packet_size: maxpacket,
                    recipient_maximum_packet_size: 0,
                    confirmed: false,
                    sent_eof: false,
                    sent_close: false,
                    received_close: false,
                    pending_data: VecDeque::new(),
                });
                return ChannelId(self.last_channel_id.0);
            }
        }
    }

    /// Record a server-initiated channel, already confirmed on our
    /// side.
    pub fn new_remote_channel(
        &mut self,
        recipient_channel: u32,
        recipient_window_size: u32,
        recipient_maximum_packet_size: u32,
        window_size: u32,
        maxpacket: u32,
    ) -> ChannelId {
        let id = self.new_channel(window_size, maxpacket);
        if let Some(chan) = self.channels.get_mut(&id) {
            chan.recipient_channel = recipient_channel;
            chan.recipient_window_size = recipient_window_size;
            chan.recipient_maximum_packet_size = recipient_maximum_packet_size;
            chan.confirmed = true;
        }
        id
    }
}

#[derive(Debug)]
pub enum EncryptedState {
    WaitingServiceRequest { sent: bool, accepted: bool },
    WaitingAuthRequest(auth::AuthRequest),
    InitCompression,
    Authenticated,
}

/// The key exchange transcript: both identification lines, both
/// KEXINIT payloads, the server host key blob, and both ephemeral
/// public values.
#[derive(Debug)]
pub struct Exchange {
    pub client_id: CryptoVec,
    pub server_id: CryptoVec,
    pub client_kex_init: CryptoVec,
    pub server_kex_init: CryptoVec,
    pub server_host_key: CryptoVec,
    pub client_ephemeral: CryptoVec,
    pub server_ephemeral: CryptoVec,
}

impl Exchange {
    pub fn new() -> Self {
        Exchange {
            client_id: CryptoVec::new(),
            server_id: CryptoVec::new(),
            client_kex_init: CryptoVec::new(),
            server_kex_init: CryptoVec::new(),
            server_host_key: CryptoVec::new(),
            client_ephemeral: CryptoVec::new(),
            server_ephemeral: CryptoVec::new(),
        }
    }

    fn clear_kex_state(&mut self) {
        self.client_kex_init.clear();
        self.server_kex_init.clear();
        self.server_host_key.clear();
        self.client_ephemeral.clear();
        self.server_ephemeral.clear();
    }
}

/// The client-side key exchange state machine.
#[derive(Debug)]
pub enum Kex {
    /// Version number sent. `algo` and `sent` tell whether kexinit has
    /// been received, and sent, respectively.
    KexInit(KexInit),

    /// A group exchange: KEX_DH_GEX_REQUEST sent, waiting for the
    /// group.
    DhGexGroup(KexDhGex),

    /// The DH init has been sent, waiting for the reply.
    KexDhDone(KexDhDone),

    /// The DH is over, we've sent the NEWKEYS packet, and are waiting
    /// the NEWKEYS from the other side.
    NewKeys(NewKeys),
}

#[derive(Debug)]
pub struct KexInit {
    pub algo: Option<negotiation::Names>,
    pub exchange: Exchange,
    pub session_id: Option<CryptoVec>,
    pub sent: bool,
}

impl KexInit {
    pub fn received_rekey(
        ex: Exchange,
        algo: negotiation::Names,
        session_id: &CryptoVec,
    ) -> Self {
        let mut kexinit = KexInit {
            exchange: ex,
            algo: Some(algo),
            sent: false,
            session_id: Some(clone_vec(session_id)),
        };
        kexinit.exchange.clear_kex_state();
        kexinit
    }

    pub fn initiate_rekey(ex: Exchange, session_id: &CryptoVec) -> Self {
        let mut kexinit = KexInit {
            exchange: ex,
            algo: None,
            sent: true,
            session_id: Some(clone_vec(session_id)),
        };
        kexinit.exchange.clear_kex_state();
        kexinit
    }
}

pub(crate) fn clone_vec(v: &CryptoVec) -> CryptoVec {
    CryptoVec::from_slice(v)
}

#[derive(Debug)]
pub struct KexDhGex {
    pub exchange: Exchange,
    pub names: negotiation::Names,
    pub kex: kex::Algorithm,
    pub session_id: Option<CryptoVec>,
}

#[derive(Debug)]
pub struct KexDhDone {
    pub exchange: Exchange,
    pub kex: kex::Algorithm,
    pub session_id: Option<CryptoVec>,
    pub names: negotiation::Names,
}

impl KexDhDone {
    pub fn compute_keys(self, hash: CryptoVec) -> Result<NewKeys, Error> {
        let session_id = if let Some(session_id) = self.session_id {
            session_id
        } else {
            clone_vec(&hash)
        };
        // Now computing keys.
        let (sealing, opening) = self.kex.compute_keys(&session_id, &hash, &self.names)?;
        Ok(NewKeys {
            exchange: self.exchange,
            names: self.names,
            kex: self.kex,
            sealing: Some(sealing),
            opening: Some(opening),
            session_id,
            received: false,
            sent: false,
        })
    }
}

#[derive(Debug)]
pub struct NewKeys {
    pub exchange: Exchange,
    pub names: negotiation::Names,
    pub kex: kex::Algorithm,
    pub sealing: Option<SealingCipher>,
    pub opening: Option<OpeningCipher>,
    pub session_id: CryptoVec,
    pub received: bool,
    pub sent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::{builtin_registry, read_kex, write_kex, Preferred};

    fn encrypted() -> Encrypted {
        let mut buf = CryptoVec::new();
        write_kex(&Preferred::DEFAULT, &mut buf).unwrap();
        let names = read_kex(&buf, &Preferred::DEFAULT, builtin_registry()).unwrap();
        let mut ephemeral = CryptoVec::new();
        let mut init = CryptoVec::new();
        let algorithm =
            kex::Algorithm::client_dh(crate::kex::DH_GROUP14_SHA1, &mut ephemeral, &mut init)
                .unwrap();
        Encrypted {
            state: EncryptedState::Authenticated,
            exchange: Some(Exchange::new()),
            kex: algorithm,
            session_id: CryptoVec::new(),
            rekey: None,
            channels: HashMap::new(),
            last_channel_id: Wrapping(1),
            write: CryptoVec::new(),
            write_cursor: 0,
            last_rekey: std::time::Instant::now(),
            server_compression: crate::compression::Compression::None,
            client_compression: crate::compression::Compression::None,
            compress: crate::compression::Compress::None,
            decompress: crate::compression::Decompress::None,
            compress_buffer: CryptoVec::new(),
        }
    }

    fn confirmed_channel(enc: &mut Encrypted, window: u32, maxpacket: u32) -> ChannelId {
        let id = enc.new_channel(1 << 20, 16384);
        let chan = enc.channels.get_mut(&id).unwrap();
        chan.confirmed = true;
        chan.recipient_channel = 42;
        chan.recipient_window_size = window;
        chan.recipient_maximum_packet_size = maxpacket;
        id
    }

    #[test]
    fn data_blocks_on_window_and_resumes_after_adjust() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 4, 16384);

        enc.data(id, CryptoVec::from_slice(b"0123456789"));
        // Exactly 4 bytes went out, the rest is queued.
        {
            let chan = enc.channels.get(&id).unwrap();
            assert_eq!(chan.recipient_window_size, 0);
            assert_eq!(chan.pending_data.len(), 1);
        }
        let staged_before = enc.write.len();

        // WINDOW_ADJUST of 6 lets the remaining 6 bytes through.
        enc.channels.get_mut(&id).unwrap().recipient_window_size += 6;
        enc.flush_pending(id);
        {
            let chan = enc.channels.get(&id).unwrap();
            assert_eq!(chan.recipient_window_size, 0);
            assert!(chan.pending_data.is_empty());
        }
        assert!(enc.write.len() > staged_before);
    }

    #[test]
    fn data_splits_at_max_packet_size() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 4);
        enc.data(id, CryptoVec::from_slice(b"012345678"));
        // Three CHANNEL_DATA packets of at most 4 bytes each.
        let mut count = 0;
        let mut cursor = 0;
        while cursor < enc.write.len() {
            let len = BigEndian::read_u32(&enc.write[cursor..]) as usize;
            assert_eq!(enc.write[cursor + 4], msg::CHANNEL_DATA);
            let data_len = BigEndian::read_u32(&enc.write[cursor + 9..]) as usize;
            assert!(data_len <= 4);
            count += 1;
            cursor += 4 + len;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn data_queues_during_rekey() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 16384);
        enc.rekey = Some(Kex::KexInit(KexInit {
            algo: None,
            exchange: Exchange::new(),
            session_id: None,
            sent: true,
        }));
        enc.data(id, CryptoVec::from_slice(b"held back"));
        assert!(enc.write.is_empty());
        assert_eq!(enc.channels.get(&id).unwrap().pending_data.len(), 1);
    }

    #[test]
    fn local_window_adjust_at_half() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 16384);
        let target = 1 << 20;
        // Receiving less than half the window: no adjustment.
        let small = vec![0u8; 1000];
        assert!(!enc.adjust_window_size(id, &small, target));
        // Crossing the half-window mark sends an adjustment and
        // restores the full window.
        let big = vec![0u8; (target / 2) as usize];
        assert!(enc.adjust_window_size(id, &big, target));
        assert_eq!(
            enc.channels.get(&id).unwrap().sender_window_size,
            target
        );
        assert_eq!(enc.write[4], msg::CHANNEL_WINDOW_ADJUST);
    }

    #[test]
    fn eof_is_sent_once() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 16384);
        enc.eof(id);
        let len = enc.write.len();
        enc.eof(id);
        assert_eq!(enc.write.len(), len);
        assert!(enc.channels.get(&id).unwrap().sent_eof);
    }

    #[test]
    fn remote_close_is_echoed_and_idempotent() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 16384);
        assert!(enc.remote_close(id));
        // The echo is staged.
        assert_eq!(enc.write[4], msg::CHANNEL_CLOSE);
        assert!(enc.channels.get(&id).is_none());
        // Receiving it again is harmless.
        let len = enc.write.len();
        assert!(!enc.remote_close(id));
        assert_eq!(enc.write.len(), len);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut common = CommonSession {
            auth_user: String::new(),
            config: Arc::new(crate::client::Config::default()),
            encrypted: None,
            auth_method: None,
            write_buffer: SSHBuffer::new(),
            kex: None,
            write_cipher: crate::cipher::clear_sealing(),
            pending_opening: None,
            disconnected: false,
            buffer: CryptoVec::new(),
        };
        common.disconnect(crate::Disconnect::ByApplication, "bye", "en");
        let len = common.write_buffer.buffer.len();
        assert!(len > 0);
        common.disconnect(crate::Disconnect::ByApplication, "bye", "en");
        assert_eq!(common.write_buffer.buffer.len(), len);
    }

    #[test]
    fn flush_reports_rekey_when_write_limit_crossed() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 16384);
        let mut cipher = crate::cipher::clear_sealing();
        let mut write_buffer = SSHBuffer::new();

        enc.data(id, CryptoVec::from_slice(b"0123456789"));
        assert!(!enc
            .flush(&Limits::default(), &mut cipher, &mut write_buffer)
            .unwrap());

        let tight = Limits {
            rekey_write_limit: 1,
            ..Limits::default()
        };
        enc.data(id, CryptoVec::from_slice(b"x"));
        assert!(enc.flush(&tight, &mut cipher, &mut write_buffer).unwrap());
    }

    #[test]
    fn close_after_local_close_is_not_echoed() {
        let mut enc = encrypted();
        let id = confirmed_channel(&mut enc, 1 << 20, 16384);
        enc.close(id);
        let len = enc.write.len();
        // The entry survives until the peer closes too.
        assert!(enc.channels.get(&id).is_some());
        assert!(enc.remote_close(id));
        // No second CHANNEL_CLOSE went out.
        assert_eq!(enc.write.len(), len);
        assert!(enc.channels.get(&id).is_none());
    }
}
