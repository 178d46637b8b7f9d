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
use crate::mac::MacKey;
use crate::sshbuffer::SSHBuffer;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use std::num::Wrapping;
use tokio::io::{AsyncRead, AsyncReadExt};

pub mod block;
pub mod clear;

/// Maximum size of the whole packet envelope (length field, padding,
/// payload, MAC).
pub const MAX_PACKET_ENVELOPE: usize = 256 * 1024;

pub const PACKET_LENGTH_LEN: usize = 4;

pub const MINIMUM_PACKET_LEN: usize = 16;

pub const PADDING_LENGTH_LEN: usize = 1;

/// Descriptor of a symmetric cipher: key material requirements and
/// factories producing keyed directions. The MAC is negotiated
/// independently and keyed separately.
pub struct Cipher {
    pub name: Name,
    pub key_len: usize,
    pub iv_len: usize,
    /// Block size already clamped to the padding granularity,
    /// `max(8, cipher block size)`.
    pub block_size: usize,
    pub make_opening_key: fn(key: &[u8], iv: &[u8], mac: MacKey) -> OpeningCipher,
    pub make_sealing_key: fn(key: &[u8], iv: &[u8], mac: MacKey) -> SealingCipher,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Name(pub(crate) &'static str);
impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        self.0
    }
}

pub enum OpeningCipher {
    Clear(clear::Key),
    Block(block::OpeningKey),
}

impl OpeningCipher {
    fn as_opening_key(&mut self) -> &mut dyn OpeningKey {
        match *self {
            OpeningCipher::Clear(ref mut key) => key,
            OpeningCipher::Block(ref mut key) => key,
        }
    }

    pub fn block_size(&mut self) -> usize {
        self.as_opening_key().block_size()
    }
}

pub enum SealingCipher {
    Clear(clear::Key),
    Block(block::SealingKey),
}

impl SealingCipher {
    fn as_sealing_key(&mut self) -> &mut dyn SealingKey {
        match *self {
            SealingCipher::Clear(ref mut key) => key,
            SealingCipher::Block(ref mut key) => key,
        }
    }
}

impl std::fmt::Debug for OpeningCipher {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

impl std::fmt::Debug for SealingCipher {
    fn fmt(&self, _: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        Ok(())
    }
}

pub fn clear_opening() -> OpeningCipher {
    OpeningCipher::Clear(clear::Key)
}

pub fn clear_sealing() -> SealingCipher {
    SealingCipher::Clear(clear::Key)
}

/// The inbound half of a packet pipeline. `decrypt` advances a
/// keystream, so it must be called over a packet's bytes in order,
/// exactly once.
pub trait OpeningKey: Send {
    fn block_size(&self) -> usize;

    fn tag_len(&self) -> usize;

    fn decrypt(&mut self, ciphertext_in_plaintext_out: &mut [u8]);

    fn verify(&self, seqn: u32, plaintext: &[u8], tag: &[u8]) -> Result<(), Error>;
}

/// The outbound half of a packet pipeline. The MAC is computed over
/// the cleartext before `encrypt` scrambles it in place.
pub trait SealingKey: Send {
    fn block_size(&self) -> usize;

    fn tag_len(&self) -> usize;

    fn padding_length(&self, payload: &[u8]) -> usize;

    fn fill_padding(&self, padding_out: &mut [u8]);

    fn compute_mac(&self, seqn: u32, plaintext: &[u8], tag_out: &mut [u8]);

    fn encrypt(&mut self, plaintext_in_ciphertext_out: &mut [u8]);
}

/// Read and open one packet. On success the buffer holds the
/// decrypted packet with its padding stripped; the payload starts at
/// offset 5.
pub async fn read<R: AsyncRead + Unpin>(
    stream: &mut R,
    buffer: &mut SSHBuffer,
    cipher: &mut OpeningCipher,
) -> Result<usize, Error> {
    let block_size = cipher.block_size();
    if buffer.len == 0 {
        buffer.buffer.clear();
        buffer.buffer.resize(block_size);
        stream.read_exact(&mut buffer.buffer[..]).await?;
        let key = cipher.as_opening_key();
        key.decrypt(&mut buffer.buffer[..block_size]);
        let packet_length = BigEndian::read_u32(&buffer.buffer) as usize;
        let total = packet_length + PACKET_LENGTH_LEN;
        if total < MINIMUM_PACKET_LEN || total > MAX_PACKET_ENVELOPE {
            debug!("bad packet length {:?}", packet_length);
            return Err(Error::PacketSize(packet_length));
        }
        buffer.len = total - block_size + key.tag_len();
    }
    buffer.buffer.resize(block_size + buffer.len);
    stream.read_exact(&mut buffer.buffer[block_size..]).await?;

    let key = cipher.as_opening_key();
    let seqn = buffer.seqn.0;
    let tag_len = key.tag_len();
    let ciphertext_end = buffer.buffer.len() - tag_len;
    key.decrypt(&mut buffer.buffer[block_size..ciphertext_end]);
    {
        let (plaintext, tag) = buffer.buffer.split_at(ciphertext_end);
        key.verify(seqn, plaintext, tag)?;
    }

    let padding_length = buffer.buffer[PACKET_LENGTH_LEN] as usize;
    let plaintext_end = ciphertext_end
        .checked_sub(padding_length)
        .filter(|&end| end >= PACKET_LENGTH_LEN + PADDING_LENGTH_LEN)
        .ok_or(Error::IndexOutOfBounds)?;

    // Sequence numbers are on 32 bits and wrap.
    // https://tools.ietf.org/html/rfc4253#section-6.4
    buffer.seqn += Wrapping(1);
    buffer.bytes += ciphertext_end;
    buffer.packets += 1;
    buffer.len = 0;

    // Remove the padding
    buffer.buffer.resize(plaintext_end);

    Ok(plaintext_end)
}

impl SealingCipher {
    /// Frame, MAC, encrypt and append one packet to the write buffer.
    pub fn write(&mut self, payload: &[u8], buffer: &mut SSHBuffer) -> Result<(), Error> {
        // https://tools.ietf.org/html/rfc4253#section-6
        //
        // The variables `payload`, `packet_length` and `padding_length` refer
        // to the protocol fields of the same names.
        let key = self.as_sealing_key();

        let padding_length = key.padding_length(payload);
        let packet_length = PADDING_LENGTH_LEN + payload.len() + padding_length;
        if packet_length + PACKET_LENGTH_LEN > MAX_PACKET_ENVELOPE {
            return Err(Error::PacketSize(packet_length));
        }
        debug_assert!(padding_length <= std::u8::MAX as usize);

        let offset = buffer.buffer.len();
        buffer.buffer.push_u32_be(packet_length as u32);
        buffer.buffer.push(padding_length as u8);
        buffer.buffer.extend(payload);
        key.fill_padding(buffer.buffer.resize_mut(padding_length));
        buffer.buffer.resize_mut(key.tag_len());

        let (plaintext, tag) =
            buffer.buffer[offset..].split_at_mut(PACKET_LENGTH_LEN + packet_length);
        key.compute_mac(buffer.seqn.0, plaintext, tag);
        key.encrypt(plaintext);

        buffer.bytes += payload.len();
        buffer.packets += 1;
        // Sequence numbers are on 32 bits and wrap.
        // https://tools.ietf.org/html/rfc4253#section-6.4
        buffer.seqn += Wrapping(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac;
    use crate::msg;

    #[test]
    fn clear_framing_of_ignore() {
        let mut buffer = SSHBuffer::new();
        let mut sealing = clear_sealing();
        sealing.write(&[msg::IGNORE], &mut buffer).unwrap();
        // 4-byte length, 1-byte padding length, 1-byte payload, 10
        // bytes of padding: 16 bytes, a multiple of 8.
        assert_eq!(buffer.buffer.len(), 16);
        assert_eq!(&buffer.buffer[..6], &[0, 0, 0, 12, 10, msg::IGNORE]);
        assert_eq!(buffer.seqn.0, 1);
    }

    #[tokio::test]
    async fn clear_read_recovers_payload() {
        let mut write_buffer = SSHBuffer::new();
        let mut sealing = clear_sealing();
        sealing.write(&[msg::IGNORE], &mut write_buffer).unwrap();

        let mut read_buffer = SSHBuffer::new();
        let mut opening = clear_opening();
        let mut stream = &write_buffer.buffer[..];
        let n = read(&mut stream, &mut read_buffer, &mut opening)
            .await
            .unwrap();
        assert_eq!(&read_buffer.buffer[5..n], &[msg::IGNORE]);
        assert_eq!(read_buffer.seqn.0, 1);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut buf = vec![0u8; 8];
        BigEndian::write_u32(&mut buf, (MAX_PACKET_ENVELOPE + 1) as u32);
        let mut read_buffer = SSHBuffer::new();
        let mut opening = clear_opening();
        let mut stream = &buf[..];
        match read(&mut stream, &mut read_buffer, &mut opening).await {
            Err(Error::PacketSize(_)) => {}
            r => panic!("expected a packet size error, got {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn undersized_length_is_rejected() {
        let mut buf = vec![0u8; 8];
        BigEndian::write_u32(&mut buf, 8);
        let mut read_buffer = SSHBuffer::new();
        let mut opening = clear_opening();
        let mut stream = &buf[..];
        assert!(read(&mut stream, &mut read_buffer, &mut opening)
            .await
            .is_err());
    }

    fn block_pair() -> (SealingCipher, OpeningCipher) {
        let cipher = &block::CIPHER_AES256_CTR;
        let key = vec![1u8; cipher.key_len];
        let iv = vec![2u8; cipher.iv_len];
        let mac_key = vec![3u8; mac::MAC_HMAC_SHA2_256.key_len];
        let sealing = (cipher.make_sealing_key)(
            &key,
            &iv,
            (mac::MAC_HMAC_SHA2_256.make_mac)(&mac_key),
        );
        let opening = (cipher.make_opening_key)(
            &key,
            &iv,
            (mac::MAC_HMAC_SHA2_256.make_mac)(&mac_key),
        );
        (sealing, opening)
    }

    #[tokio::test]
    async fn aes_ctr_seal_open_roundtrip() {
        let (mut sealing, mut opening) = block_pair();
        let mut write_buffer = SSHBuffer::new();
        let payload = b"\x5a some channel data";
        sealing.write(payload, &mut write_buffer).unwrap();
        sealing.write(b"\x02second", &mut write_buffer).unwrap();

        // Framed length is a multiple of the AES block size, plus tag.
        let first_len = {
            let mut opening2 = block_pair().1;
            let mut buffer = SSHBuffer::new();
            let mut stream = &write_buffer.buffer[..];
            let n = read(&mut stream, &mut buffer, &mut opening2).await.unwrap();
            assert_eq!(&buffer.buffer[5..n], &payload[..]);
            n
        };
        assert!(first_len > payload.len());

        let mut buffer = SSHBuffer::new();
        let mut stream = &write_buffer.buffer[..];
        let n = read(&mut stream, &mut buffer, &mut opening).await.unwrap();
        assert_eq!(&buffer.buffer[5..n], &payload[..]);
        let n = read(&mut stream, &mut buffer, &mut opening).await.unwrap();
        assert_eq!(&buffer.buffer[5..n], b"\x02second");
        assert_eq!(buffer.seqn.0, 2);
    }

    #[tokio::test]
    async fn corrupted_tag_is_rejected() {
        let (mut sealing, mut opening) = block_pair();
        let mut write_buffer = SSHBuffer::new();
        sealing.write(b"payload", &mut write_buffer).unwrap();
        let last = write_buffer.buffer.len() - 1;
        write_buffer.buffer[last..last + 1][0] ^= 1;
        let mut buffer = SSHBuffer::new();
        let mut stream = &write_buffer.buffer[..];
        match read(&mut stream, &mut buffer, &mut opening).await {
            Err(Error::PacketAuth) => {}
            r => panic!("expected PacketAuth, got {:?}", r.map(|_| ())),
        }
    }
}
