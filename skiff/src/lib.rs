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

//! An asynchronous SSH-2 client library, based on tokio/futures.
//!
//! The library implements the binary packet protocol, the transport
//! state machine (version exchange, Diffie-Hellman key exchange,
//! encryption/MAC/compression pipeline, rekeying), user
//! authentication, and the connection-layer channel multiplexer with
//! per-channel flow control.
//!
//! The normal way to use it is to call [`client::connect`], which
//! runs the protocol event loop on a tokio task and hands back a
//! [`client::Handle`]. The handle authenticates the session and
//! opens [`client::Channel`]s; unsolicited server messages are
//! delivered to a caller-provided [`client::Handler`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! struct Client {}
//!
//! impl skiff::client::Handler for Client {
//!     type Error = skiff::Error;
//!     type FutureUnit = futures::future::Ready<Result<(Self, skiff::client::Session), Self::Error>>;
//!     type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;
//!
//!     fn finished_bool(self, b: bool) -> Self::FutureBool {
//!         futures::future::ready(Ok((self, b)))
//!     }
//!     fn finished(self, session: skiff::client::Session) -> Self::FutureUnit {
//!         futures::future::ready(Ok((self, session)))
//!     }
//!     fn check_server_key(self, key: &skiff_keys::key::PublicKey) -> Self::FutureBool {
//!         println!("host key fingerprint: {}", key.fingerprint());
//!         self.finished_bool(true)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), skiff::Error> {
//!     let config = Arc::new(skiff::client::Config::default());
//!     let mut session = skiff::client::connect(config, "localhost:22", Client {}).await?;
//!     if session.authenticate_password("user", "password").await? {
//!         let mut channel = session.channel_open_session().await?;
//!         channel.exec(true, "echo hi").await?;
//!         while let Some(msg) = channel.wait().await {
//!             if let skiff::ChannelMsg::Data { data } = msg {
//!                 print!("{}", String::from_utf8_lossy(&data));
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[macro_use]
extern crate thiserror;

use std::fmt::{Display, Formatter};

pub use cryptovec::CryptoVec;
mod auth;
mod cipher;
mod compression;
mod kex;
mod mac;
mod msg;
mod negotiation;
mod ssh_read;
mod sshbuffer;

pub use auth::{GssContext, MethodSet, Prompt, UserInteraction};
pub use cipher::MAX_PACKET_ENVELOPE;
pub use negotiation::{Named, Preferred, Registry, Slot};
pub use ssh_read::ServerIdentification;

macro_rules! push_packet {
    ( $buffer:expr, $x:expr ) => {{
        use byteorder::{BigEndian, ByteOrder};
        let i0 = $buffer.len();
        $buffer.extend(b"\0\0\0\0");
        let x = $x;
        let i1 = $buffer.len();
        use std::ops::DerefMut;
        let buf = $buffer.deref_mut();
        BigEndian::write_u32(&mut buf[i0..], (i1 - i0 - 4) as u32);
        x
    }};
}

mod session;

/// Client side of this library.
pub mod client;

#[derive(Debug, Error)]
pub enum Error {
    /// Could not reach the server.
    #[error("Connection failed")]
    Connect(#[source] std::io::Error),

    /// Unspecified problem with the beginning of key exchange.
    #[error("Key exchange init failed")]
    KexInit,

    /// No common algorithm for one proposal slot.
    #[error("No common algorithm for {0}")]
    NoCommonAlgorithm(Slot),

    /// Invalid SSH identification string.
    #[error("Invalid SSH identification string")]
    Version,

    /// The peer speaks an SSH protocol version we do not.
    #[error("Unsupported SSH protocol version {0}")]
    UnsupportedVersion(String),

    /// Error during key exchange.
    #[error("Key exchange failed")]
    Kex,

    /// Invalid packet authentication code.
    #[error("Wrong packet authentication code")]
    PacketAuth,

    /// A packet length outside the envelope.
    #[error("Bad packet length {0}")]
    PacketSize(usize),

    /// The protocol is in an inconsistent state.
    #[error("Inconsistent state of the protocol")]
    Inconsistent,

    /// The client is not yet authenticated.
    #[error("Not yet authenticated")]
    NotAuthenticated,

    /// Index out of bounds while decoding a packet.
    #[error("Index out of bounds")]
    IndexOutOfBounds,

    /// The host key was refused, either by the verifier or by the
    /// user.
    #[error("Host key rejected")]
    HostKeyRejected,

    /// The host key differs from the one recorded for this host.
    #[error("Host key changed")]
    HostKeyChanged,

    /// The server provided a wrong signature over the exchange hash.
    #[error("Wrong server signature")]
    WrongServerSig,

    /// Every configured authentication method was tried and failed.
    #[error("Authentication failed")]
    AuthFailed,

    /// The user cancelled authentication.
    #[error("Authentication cancelled by user")]
    AuthCancelled,

    /// Message received/sent on unopened channel.
    #[error("Channel not open")]
    WrongChannel,

    /// The server refused to open a channel.
    #[error("Channel open failure: {0:?}")]
    ChannelOpenFailure(ChannelOpenFailure),

    /// The server did not answer a channel open in time.
    #[error("Channel open timed out")]
    ChannelOpenTimeout,

    /// A channel request was answered with CHANNEL_FAILURE.
    #[error("Channel request failed")]
    ChannelRequestFailure,

    /// A status reported by the SFTP subsystem. Carried through
    /// unmodified; the core never produces or inspects it.
    #[error("SFTP status {code}: {message}")]
    SftpStatus { code: u32, message: String },

    /// The peer sent SSH_MSG_DISCONNECT.
    #[error("Disconnected by peer ({code}): {message}")]
    PeerDisconnect { code: u32, message: String },

    /// Disconnected locally, or connection closed by the remote side.
    #[error("Disconnected")]
    Disconnect,

    /// The operation was cancelled by `disconnect()`.
    #[error("Cancelled")]
    Cancelled,

    /// Connection or operation timeout.
    #[error("Timeout")]
    ConnectionTimeout,

    /// Keepalive probes went unanswered.
    #[error("No response to keepalive probes")]
    KeepaliveTimeout,

    #[error("Channel send error")]
    SendError,

    #[error("Pending buffer limit reached")]
    Pending,

    #[error(transparent)]
    Keys(#[from] skiff_keys::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),

    #[cfg(feature = "flate2")]
    #[error(transparent)]
    Compress(#[from] flate2::CompressError),

    #[cfg(feature = "flate2")]
    #[error(transparent)]
    Decompress(#[from] flate2::DecompressError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Elapsed(#[from] tokio::time::error::Elapsed),
}

/// The number of bytes and packets read/written, and the time, before
/// a key re-exchange is requested.
#[derive(Debug, Clone)]
pub struct Limits {
    pub rekey_write_limit: usize,
    pub rekey_read_limit: usize,
    /// Packets in either direction before a rekey. Must stay below
    /// the 2^32 sequence wrap.
    pub rekey_packet_limit: u64,
    pub rekey_time_limit: std::time::Duration,
}

impl Limits {
    /// Create a new `Limits`, checking that the given bounds cannot
    /// lead to sequence reuse.
    pub fn new(
        write_limit: usize,
        read_limit: usize,
        packet_limit: u64,
        time_limit: std::time::Duration,
    ) -> Limits {
        assert!(write_limit <= 1 << 30 && read_limit <= 1 << 30 && packet_limit < 1 << 32);
        Limits {
            rekey_write_limit: write_limit,
            rekey_read_limit: read_limit,
            rekey_packet_limit: packet_limit,
            rekey_time_limit: time_limit,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        // Following the recommendations of
        // https://tools.ietf.org/html/rfc4253#section-9
        Limits {
            rekey_write_limit: 1 << 30, // 1 GiB
            rekey_read_limit: 1 << 30,  // 1 GiB
            rekey_packet_limit: 1 << 31,
            rekey_time_limit: std::time::Duration::from_secs(3600),
        }
    }
}

/// A reason for disconnection.
#[allow(missing_docs)] // This should be relatively self-explanatory.
#[derive(Debug, Clone, Copy)]
pub enum Disconnect {
    HostNotAllowedToConnect = 1,
    ProtocolError = 2,
    KeyExchangeFailed = 3,
    #[doc(hidden)]
    Reserved = 4,
    MACError = 5,
    CompressionError = 6,
    ServiceNotAvailable = 7,
    ProtocolVersionNotSupported = 8,
    HostKeyNotVerifiable = 9,
    ConnectionLost = 10,
    ByApplication = 11,
    TooManyConnections = 12,
    AuthCancelledByUser = 13,
    NoMoreAuthMethodsAvailable = 14,
    IllegalUserName = 15,
}

/// The type of signals that can be sent to a remote process. If you
/// plan to use custom signals, read [the
/// RFC](https://tools.ietf.org/html/rfc4254#section-6.10) to
/// understand the encoding.
#[allow(missing_docs)]
// This should be relatively self-explanatory.
#[derive(Debug, Clone)]
pub enum Sig {
    ABRT,
    ALRM,
    FPE,
    HUP,
    ILL,
    INT,
    KILL,
    PIPE,
    QUIT,
    SEGV,
    TERM,
    USR1,
    Custom(String),
}

impl Sig {
    fn name(&self) -> &str {
        match *self {
            Sig::ABRT => "ABRT",
            Sig::ALRM => "ALRM",
            Sig::FPE => "FPE",
            Sig::HUP => "HUP",
            Sig::ILL => "ILL",
            Sig::INT => "INT",
            Sig::KILL => "KILL",
            Sig::PIPE => "PIPE",
            Sig::QUIT => "QUIT",
            Sig::SEGV => "SEGV",
            Sig::TERM => "TERM",
            Sig::USR1 => "USR1",
            Sig::Custom(ref c) => c,
        }
    }
    fn from_name(name: &[u8]) -> Result<Sig, Error> {
        match name {
            b"ABRT" => Ok(Sig::ABRT),
            b"ALRM" => Ok(Sig::ALRM),
            b"FPE" => Ok(Sig::FPE),
            b"HUP" => Ok(Sig::HUP),
            b"ILL" => Ok(Sig::ILL),
            b"INT" => Ok(Sig::INT),
            b"KILL" => Ok(Sig::KILL),
            b"PIPE" => Ok(Sig::PIPE),
            b"QUIT" => Ok(Sig::QUIT),
            b"SEGV" => Ok(Sig::SEGV),
            b"TERM" => Ok(Sig::TERM),
            b"USR1" => Ok(Sig::USR1),
            x => Ok(Sig::Custom(std::str::from_utf8(x)?.to_string())),
        }
    }
}

/// Reason for not being able to open a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelOpenFailure {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

impl ChannelOpenFailure {
    fn from_u32(x: u32) -> Option<ChannelOpenFailure> {
        match x {
            1 => Some(ChannelOpenFailure::AdministrativelyProhibited),
            2 => Some(ChannelOpenFailure::ConnectFailed),
            3 => Some(ChannelOpenFailure::UnknownChannelType),
            4 => Some(ChannelOpenFailure::ResourceShortage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The identifier of a channel.
pub struct ChannelId(u32);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message a channel can receive.
#[derive(Debug)]
pub enum ChannelMsg {
    Data {
        data: CryptoVec,
    },
    ExtendedData {
        data: CryptoVec,
        ext: u32,
    },
    Eof,
    Close,
    XonXoff {
        client_can_do: bool,
    },
    ExitStatus {
        exit_status: u32,
    },
    ExitSignal {
        signal_name: Sig,
        core_dumped: bool,
        error_message: String,
        lang_tag: String,
    },
    WindowAdjusted {
        new_size: u32,
    },
    /// Reply to a channel request that wanted one.
    Success,
    /// Negative reply to a channel request that wanted one.
    Failure,
}

/// Replace everything outside `[32..=126] ∪ {\t, \r, \n}` with
/// U+FFFD. Applied to banners and disconnect messages before they
/// reach a terminal.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if (' '..='~').contains(&c) || c == '\t' || c == '\r' || c == '\n' {
                c
            } else {
                '\u{FFFD}'
            }
        })
        .collect()
}

/// What the host key verifier knows about a host/key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// The key matches the recorded one.
    Ok,
    /// A different key is recorded for this host.
    Changed,
    /// Nothing is recorded for this host.
    Unknown,
}

/// A known-hosts database. Parsing and persistence are out of the
/// core; this is the contract it consults.
pub trait HostKeyVerifier: Send {
    fn verify(&mut self, host: &str, key_type: &str, key_blob: &[u8]) -> HostKeyStatus;
}

/// The `check_host_key` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// Only hosts already known to the verifier are accepted.
    Yes,
    /// Accept any host key.
    No,
    /// Unknown or changed keys are submitted to the user.
    Ask,
}

/// Apply the `check_host_key` policy to a verifier result. Returns
/// whether the connection may proceed; `Changed` under the strict
/// policy is a [`Error::HostKeyChanged`].
pub fn accept_host_key(
    policy: HostKeyCheck,
    status: HostKeyStatus,
    host: &str,
    fingerprint: &str,
    ui: &mut dyn UserInteraction,
) -> Result<bool, Error> {
    match (policy, status) {
        (HostKeyCheck::No, _) => Ok(true),
        (_, HostKeyStatus::Ok) => Ok(true),
        (HostKeyCheck::Yes, HostKeyStatus::Changed) => Err(Error::HostKeyChanged),
        (HostKeyCheck::Yes, HostKeyStatus::Unknown) => Ok(false),
        (HostKeyCheck::Ask, HostKeyStatus::Changed) => {
            ui.show_message(&format!(
                "WARNING: the host key of {} has changed (fingerprint {})",
                host, fingerprint
            ));
            Ok(ui.prompt_yes_no("Are you sure you want to continue connecting?"))
        }
        (HostKeyCheck::Ask, HostKeyStatus::Unknown) => Ok(ui.prompt_yes_no(&format!(
            "The authenticity of host {} can't be established ({}). Continue?",
            host, fingerprint
        ))),
    }
}

#[cfg(test)]
mod test_client {
    use super::*;
    use crate::cipher::{self, OpeningCipher, SealingCipher};
    use crate::sshbuffer::SSHBuffer;
    use crate::ssh_read::SshRead;
    use byteorder::{BigEndian, ByteOrder};
    use num_bigint::{BigUint, RandBigInt};
    use skiff_keys::encoding::{Encoding, Reader};
    use skiff_keys::key::{KeyPair, PublicKey, SignatureHash, Verify};
    use skiff_keys::PublicKeyBase64;
    use std::sync::Arc;
    use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

    struct TestClient {}

    impl client::Handler for TestClient {
        type Error = Error;
        type FutureUnit = futures::future::Ready<Result<(Self, client::Session), Self::Error>>;
        type FutureBool = futures::future::Ready<Result<(Self, bool), Self::Error>>;

        fn finished_bool(self, b: bool) -> Self::FutureBool {
            futures::future::ready(Ok((self, b)))
        }
        fn finished(self, session: client::Session) -> Self::FutureUnit {
            futures::future::ready(Ok((self, session)))
        }
        fn check_server_key(self, _: &PublicKey) -> Self::FutureBool {
            self.finished_bool(true)
        }
    }

    // An independent SHA-1 implementation of RFC 4253 section 7.2,
    // so the client's derivation is cross-checked rather than
    // mirrored.
    fn derive(k: &BigUint, h: &[u8], letter: u8, session_id: &[u8], len: usize) -> Vec<u8> {
        use sha1::{Digest, Sha1};
        let mut k_mpint = Vec::new();
        k_mpint.extend_ssh_mpint(&k.to_bytes_be());
        let mut out = {
            let mut hasher = Sha1::new();
            hasher.update(&k_mpint);
            hasher.update(h);
            hasher.update(&[letter]);
            hasher.update(session_id);
            hasher.finalize().to_vec()
        };
        while out.len() < len {
            let mut hasher = Sha1::new();
            hasher.update(&k_mpint);
            hasher.update(h);
            hasher.update(&out);
            out.extend(hasher.finalize());
        }
        out.truncate(len);
        out
    }

    async fn srv_write<W: AsyncWrite + Unpin>(
        wr: &mut W,
        sealing: &mut SealingCipher,
        write_buf: &mut SSHBuffer,
        payload: &[u8],
    ) -> Result<(), Error> {
        sealing.write(payload, write_buf)?;
        wr.write_all(&write_buf.buffer).await?;
        write_buf.buffer.clear();
        Ok(())
    }

    async fn srv_read<R: AsyncRead + Unpin>(
        rd: &mut R,
        opening: &mut OpeningCipher,
        read_buf: &mut SSHBuffer,
    ) -> Result<Vec<u8>, Error> {
        let n = cipher::read(rd, read_buf, opening).await?;
        Ok(read_buf.buffer[5..n].to_vec())
    }

    struct ServerSide<R, W> {
        rd: R,
        wr: W,
        read_buf: SSHBuffer,
        write_buf: SSHBuffer,
        opening: OpeningCipher,
        sealing: SealingCipher,
        host: KeyPair,
        client_id: Vec<u8>,
        server_id: Vec<u8>,
    }

    impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> ServerSide<R, W> {
        async fn write(&mut self, payload: &[u8]) -> Result<(), Error> {
            srv_write(&mut self.wr, &mut self.sealing, &mut self.write_buf, payload).await
        }

        async fn read(&mut self) -> Result<Vec<u8>, Error> {
            srv_read(&mut self.rd, &mut self.opening, &mut self.read_buf).await
        }

        /// One full key exchange from the server side, group 14 with
        /// an ssh-rsa host key. Returns the exchange hash.
        async fn kex(&mut self, session_id: Option<&[u8]>) -> Result<Vec<u8>, Error> {
            // Our KEXINIT.
            let mut server_kexinit = CryptoVec::new();
            server_kexinit.push(msg::KEXINIT);
            server_kexinit.extend(&[7u8; 16]);
            server_kexinit.extend_ssh_string(b"diffie-hellman-group14-sha1");
            server_kexinit.extend_ssh_string(b"ssh-rsa");
            server_kexinit.extend_ssh_string(b"aes128-ctr");
            server_kexinit.extend_ssh_string(b"aes128-ctr");
            server_kexinit.extend_ssh_string(b"hmac-sha2-256");
            server_kexinit.extend_ssh_string(b"hmac-sha2-256");
            server_kexinit.extend_ssh_string(b"none");
            server_kexinit.extend_ssh_string(b"none");
            server_kexinit.write_empty_list();
            server_kexinit.write_empty_list();
            server_kexinit.push(0);
            server_kexinit.extend(&[0, 0, 0, 0]);
            self.write(&server_kexinit).await?;

            let client_kexinit = self.read().await?;
            assert_eq!(client_kexinit[0], msg::KEXINIT);

            let dh_init = self.read().await?;
            assert_eq!(dh_init[0], msg::KEXDH_INIT);
            let mut r = dh_init.reader(1);
            let e = BigUint::from_bytes_be(r.read_mpint()?);

            let group = crate::kex::group14();
            let y = rand::thread_rng().gen_biguint(320);
            let f = group.g.modpow(&y, &group.p);
            let k = e.modpow(&y, &group.p);

            let ks = self.host.clone_public_key().public_key_bytes();

            // The exchange hash, RFC 4253 section 8.
            let h = {
                use sha1::{Digest, Sha1};
                let mut transcript = CryptoVec::new();
                transcript.extend_ssh_string(&self.client_id);
                transcript.extend_ssh_string(&self.server_id);
                transcript.extend_ssh_string(&client_kexinit);
                transcript.extend_ssh_string(&server_kexinit);
                transcript.extend_ssh_string(&ks);
                transcript.extend_ssh_mpint(&e.to_bytes_be());
                transcript.extend_ssh_mpint(&f.to_bytes_be());
                transcript.extend_ssh_mpint(&k.to_bytes_be());
                let mut hasher = Sha1::new();
                hasher.update(&transcript[..]);
                hasher.finalize().to_vec()
            };
            let sid = session_id.map(|s| s.to_vec()).unwrap_or_else(|| h.clone());

            let mut reply = CryptoVec::new();
            reply.push(msg::KEXDH_REPLY);
            reply.extend_ssh_string(&ks);
            reply.extend_ssh_mpint(&f.to_bytes_be());
            let signature = self.host.sign_detached(&h)?;
            signature.push_to(&mut reply);
            self.write(&reply).await?;
            self.write(&[msg::NEWKEYS]).await?;

            let newkeys = self.read().await?;
            assert_eq!(newkeys, [msg::NEWKEYS]);

            // Install the derived pipeline, crossed for the server
            // role.
            let registry = negotiation::builtin_registry();
            let aes = registry.cipher("aes128-ctr").unwrap();
            let mac = registry.mac("hmac-sha2-256").unwrap();
            let iv_c2s = derive(&k, &h, b'A', &sid, aes.iv_len);
            let iv_s2c = derive(&k, &h, b'B', &sid, aes.iv_len);
            let key_c2s = derive(&k, &h, b'C', &sid, aes.key_len);
            let key_s2c = derive(&k, &h, b'D', &sid, aes.key_len);
            let mac_c2s = derive(&k, &h, b'E', &sid, mac.key_len);
            let mac_s2c = derive(&k, &h, b'F', &sid, mac.key_len);
            self.opening = (aes.make_opening_key)(&key_c2s, &iv_c2s, (mac.make_mac)(&mac_c2s));
            self.sealing = (aes.make_sealing_key)(&key_s2c, &iv_s2c, (mac.make_mac)(&mac_s2c));
            self.read_buf.reset_rekey_counters();
            self.write_buf.reset_rekey_counters();
            Ok(h)
        }

        /// Accept the `ssh-userauth` service request.
        async fn accept_userauth_service(&mut self) -> Result<(), Error> {
            let p = self.read().await?;
            assert_eq!(p[0], msg::SERVICE_REQUEST);
            let mut accept = CryptoVec::new();
            accept.push(msg::SERVICE_ACCEPT);
            accept.extend_ssh_string(b"ssh-userauth");
            self.write(&accept).await
        }

        /// Serve the standard exec scenario on one session channel.
        async fn serve_exec_channel(&mut self) -> Result<(), Error> {
            let p = self.read().await?;
            assert_eq!(p[0], msg::CHANNEL_OPEN);
            let mut r = p.reader(1);
            assert_eq!(r.read_string()?, b"session");
            let client_channel = r.read_u32()?;
            let client_window = r.read_u32()?;
            let client_max_packet = r.read_u32()?;
            assert_eq!(client_window, 1 << 20);
            assert_eq!(client_max_packet, 16384);

            let mut confirm = CryptoVec::new();
            confirm.push(msg::CHANNEL_OPEN_CONFIRMATION);
            confirm.push_u32_be(client_channel);
            confirm.push_u32_be(7);
            confirm.push_u32_be(50000);
            confirm.push_u32_be(32768);
            self.write(&confirm).await?;

            let p = self.read().await?;
            assert_eq!(p[0], msg::CHANNEL_REQUEST);
            let mut r = p.reader(1);
            assert_eq!(r.read_u32()?, 7);
            assert_eq!(r.read_string()?, b"exec");
            assert!(r.read_bool()?);
            assert_eq!(r.read_string()?, b"echo hi");

            let mut out = CryptoVec::new();
            out.push(msg::CHANNEL_SUCCESS);
            out.push_u32_be(client_channel);
            self.write(&out).await?;

            out.clear();
            out.push(msg::CHANNEL_DATA);
            out.push_u32_be(client_channel);
            out.extend_ssh_string(b"hi\n");
            self.write(&out).await?;

            out.clear();
            out.push(msg::CHANNEL_REQUEST);
            out.push_u32_be(client_channel);
            out.extend_ssh_string(b"exit-status");
            out.push(0);
            out.push_u32_be(0);
            self.write(&out).await?;

            out.clear();
            out.push(msg::CHANNEL_EOF);
            out.push_u32_be(client_channel);
            self.write(&out).await?;

            out.clear();
            out.push(msg::CHANNEL_CLOSE);
            out.push_u32_be(client_channel);
            self.write(&out).await?;

            // The client must echo the close.
            let p = self.read().await?;
            assert_eq!(p[0], msg::CHANNEL_CLOSE);
            let mut r = p.reader(1);
            assert_eq!(r.read_u32()?, 7);
            Ok(())
        }
    }

    type ServerHalf<S> =
        ServerSide<SshRead<tokio::io::ReadHalf<S>>, tokio::io::WriteHalf<S>>;

    async fn handshake<S>(io: S) -> Result<ServerHalf<S>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        const SERVER_ID: &[u8] = b"SSH-2.0-Scripted_0.1";
        let mut io = io;
        io.write_all(b"SSH-2.0-Scripted_0.1\r\n").await?;
        let mut stream = SshRead::new(io);
        let client_id = stream.read_ssh_id().await?;
        let (rd, wr) = stream.split();
        Ok(ServerSide {
            rd,
            wr,
            read_buf: SSHBuffer::new(),
            write_buf: SSHBuffer::new(),
            opening: cipher::clear_opening(),
            sealing: cipher::clear_sealing(),
            host: KeyPair::generate_rsa(2048, SignatureHash::SHA1).unwrap(),
            client_id: client_id.raw,
            server_id: SERVER_ID.to_vec(),
        })
    }

    #[tokio::test]
    async fn exec_session_end_to_end() {
        let _ = env_logger::try_init();
        tokio::time::timeout(std::time::Duration::from_secs(60), async {
            let (client_io, server_io) = tokio::io::duplex(1 << 16);

            let server = tokio::spawn(async move {
                let mut server = handshake(server_io).await?;
                server.kex(None).await?;
                server.accept_userauth_service().await?;

                let p = server.read().await?;
                assert_eq!(p[0], msg::USERAUTH_REQUEST);
                let mut r = p.reader(1);
                assert_eq!(r.read_string()?, b"u");
                assert_eq!(r.read_string()?, b"ssh-connection");
                assert_eq!(r.read_string()?, b"none");
                server.write(&[msg::USERAUTH_SUCCESS]).await?;

                server.serve_exec_channel().await?;
                Ok::<(), Error>(())
            });

            let config = Arc::new(client::Config::default());
            let mut handle = client::connect_stream(config, client_io, TestClient {})
                .await
                .unwrap();
            assert!(handle.authenticate_none("u").await.unwrap());

            let mut channel = handle.channel_open_session().await.unwrap();
            channel.exec(true, "echo hi").await.unwrap();
            channel.wait_reply().await.unwrap();

            let mut data: Vec<u8> = Vec::new();
            let mut exit_status = None;
            let mut saw_eof = false;
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data: d } => data.extend(&d[..]),
                    ChannelMsg::ExitStatus { exit_status: s } => exit_status = Some(s),
                    ChannelMsg::Eof => saw_eof = true,
                    ChannelMsg::Close => break,
                    msg => panic!("unexpected message {:?}", msg),
                }
            }
            assert_eq!(data, b"hi\n");
            assert_eq!(exit_status, Some(0));
            assert!(saw_eof);

            server.await.unwrap().unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn publickey_auth_end_to_end() {
        let _ = env_logger::try_init();
        tokio::time::timeout(std::time::Duration::from_secs(60), async {
            let (client_io, server_io) = tokio::io::duplex(1 << 16);

            let server = tokio::spawn(async move {
                let mut server = handshake(server_io).await?;
                let h = server.kex(None).await?;
                server.accept_userauth_service().await?;

                // The probe, without a signature.
                let p = server.read().await?;
                assert_eq!(p[0], msg::USERAUTH_REQUEST);
                let mut r = p.reader(1);
                assert_eq!(r.read_string()?, b"u");
                assert_eq!(r.read_string()?, b"ssh-connection");
                assert_eq!(r.read_string()?, b"publickey");
                assert!(!r.read_bool()?);
                let algo = r.read_string()?.to_vec();
                let blob = r.read_string()?.to_vec();

                let mut pk_ok = CryptoVec::new();
                pk_ok.push(msg::USERAUTH_PK_OK);
                pk_ok.extend_ssh_string(&algo);
                pk_ok.extend_ssh_string(&blob);
                server.write(&pk_ok).await?;

                // The signed request. The signature covers
                // string(session_id) followed by the request up to
                // the key blob.
                let p = server.read().await?;
                assert_eq!(p[0], msg::USERAUTH_REQUEST);
                let mut r = p.reader(1);
                assert_eq!(r.read_string()?, b"u");
                assert_eq!(r.read_string()?, b"ssh-connection");
                assert_eq!(r.read_string()?, b"publickey");
                assert!(r.read_bool()?);
                assert_eq!(r.read_string()?, &algo[..]);
                assert_eq!(r.read_string()?, &blob[..]);
                let sig_start = r.position;
                let sig_blob = r.read_string()?;
                let mut sig_reader = sig_blob.reader(0);
                assert_eq!(sig_reader.read_string()?, &algo[..]);
                let sig = sig_reader.read_string()?;

                let mut signed = CryptoVec::new();
                signed.extend_ssh_string(&h);
                signed.extend(&p[..sig_start]);
                let key = PublicKey::parse(&algo, &blob)?;
                assert!(key.verify_client_auth(&signed, sig));

                server.write(&[msg::USERAUTH_SUCCESS]).await?;
                Ok::<(), Error>(())
            });

            let config = Arc::new(client::Config::default());
            let mut handle = client::connect_stream(config, client_io, TestClient {})
                .await
                .unwrap();
            let key = Arc::new(KeyPair::generate_rsa(2048, SignatureHash::SHA2_256).unwrap());
            assert!(handle.authenticate_publickey("u", key).await.unwrap());

            server.await.unwrap().unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn server_initiated_rekey_then_exec() {
        let _ = env_logger::try_init();
        tokio::time::timeout(std::time::Duration::from_secs(60), async {
            let (client_io, server_io) = tokio::io::duplex(1 << 16);

            let server = tokio::spawn(async move {
                let mut server = handshake(server_io).await?;
                let session_id = server.kex(None).await?;
                server.accept_userauth_service().await?;

                let p = server.read().await?;
                assert_eq!(p[0], msg::USERAUTH_REQUEST);

                // Rekey before answering: the client is parked on the
                // auth reply, so nothing else is in flight. Same
                // session id, fresh keys.
                let h2 = server.kex(Some(&session_id)).await?;
                assert_ne!(h2, session_id);

                // Traffic continues under the new keys.
                server.write(&[msg::USERAUTH_SUCCESS]).await?;
                server.serve_exec_channel().await?;
                Ok::<(), Error>(())
            });

            let config = Arc::new(client::Config::default());
            let mut handle = client::connect_stream(config, client_io, TestClient {})
                .await
                .unwrap();
            assert!(handle.authenticate_none("u").await.unwrap());

            let mut channel = handle.channel_open_session().await.unwrap();
            channel.exec(true, "echo hi").await.unwrap();
            channel.wait_reply().await.unwrap();
            let mut data: Vec<u8> = Vec::new();
            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { data: d } => data.extend(&d[..]),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            assert_eq!(data, b"hi\n");

            server.await.unwrap().unwrap();
        })
        .await
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_control_characters() {
        assert_eq!(sanitize("plain text"), "plain text");
        assert_eq!(sanitize("tab\tcr\rnl\n"), "tab\tcr\rnl\n");
        assert_eq!(sanitize("bell\x07"), "bell\u{FFFD}");
        assert_eq!(sanitize("esc\x1b[31m"), "esc\u{FFFD}[31m");
        assert_eq!(sanitize("tilde~del\x7f"), "tilde~del\u{FFFD}");
    }

    struct Always(bool, Vec<String>);
    impl UserInteraction for Always {
        fn prompt_password(&mut self, _: &str) -> Option<String> {
            None
        }
        fn prompt_yes_no(&mut self, _: &str) -> bool {
            self.0
        }
        fn show_message(&mut self, m: &str) {
            self.1.push(m.to_string());
        }
    }

    #[test]
    fn host_key_policy() {
        let mut ui = Always(true, Vec::new());
        assert!(accept_host_key(
            HostKeyCheck::No,
            HostKeyStatus::Changed,
            "h",
            "fp",
            &mut ui
        )
        .unwrap());
        assert!(accept_host_key(
            HostKeyCheck::Yes,
            HostKeyStatus::Ok,
            "h",
            "fp",
            &mut ui
        )
        .unwrap());
        assert!(!accept_host_key(
            HostKeyCheck::Yes,
            HostKeyStatus::Unknown,
            "h",
            "fp",
            &mut ui
        )
        .unwrap());
        assert!(matches!(
            accept_host_key(HostKeyCheck::Yes, HostKeyStatus::Changed, "h", "fp", &mut ui),
            Err(Error::HostKeyChanged)
        ));
        assert!(accept_host_key(
            HostKeyCheck::Ask,
            HostKeyStatus::Unknown,
            "h",
            "fp",
            &mut ui
        )
        .unwrap());
        let mut refuse = Always(false, Vec::new());
        assert!(!accept_host_key(
            HostKeyCheck::Ask,
            HostKeyStatus::Changed,
            "h",
            "fp",
            &mut refuse
        )
        .unwrap());
        assert!(!refuse.1.is_empty());
    }
}
