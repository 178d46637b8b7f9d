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

use crate::Error;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use cryptovec::CryptoVec;

#[doc(hidden)]
pub trait Bytes {
    fn bytes(&self) -> &[u8];
}

impl<A: AsRef<str>> Bytes for A {
    fn bytes(&self) -> &[u8] {
        self.as_ref().as_bytes()
    }
}

/// Encode in the SSH format.
pub trait Encoding {
    /// Push an SSH-encoded string to `self`.
    fn extend_ssh_string(&mut self, s: &[u8]);
    /// Push an SSH-encoded multiple-precision integer.
    fn extend_ssh_mpint(&mut self, s: &[u8]);
    /// Push an SSH-encoded list.
    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I);
    /// Push an SSH-encoded empty list.
    fn write_empty_list(&mut self);
    /// Push a big-endian `u64`.
    fn extend_u64_be(&mut self, u: u64);
}

/// Encoding length of the given mpint.
pub fn mpint_len(s: &[u8]) -> usize {
    let mut i = 0;
    while i < s.len() && s[i] == 0 {
        i += 1
    }
    if i >= s.len() {
        // Zero encodes as the empty string.
        return 4;
    }
    (if s[i] & 0x80 != 0 { 5 } else { 4 }) + s.len() - i
}

impl Encoding for Vec<u8> {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.write_u32::<BigEndian>(s.len() as u32).unwrap();
        self.extend(s);
    }
    fn extend_ssh_mpint(&mut self, s: &[u8]) {
        // Skip initial 0s.
        let mut i = 0;
        while i < s.len() && s[i] == 0 {
            i += 1
        }
        if i >= s.len() {
            self.write_u32::<BigEndian>(0).unwrap();
            return;
        }
        // If the first non-zero is >= 128, write its length (u32, BE), followed by 0.
        if s[i] & 0x80 != 0 {
            self.write_u32::<BigEndian>((s.len() - i + 1) as u32)
                .unwrap();
            self.push(0)
        } else {
            self.write_u32::<BigEndian>((s.len() - i) as u32).unwrap();
        }
        self.extend(&s[i..]);
    }

    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I) {
        let len0 = self.len();
        self.extend(&[0, 0, 0, 0]);
        let mut first = true;
        for i in list {
            if !first {
                self.push(b',')
            } else {
                first = false;
            }
            self.extend(i.bytes())
        }
        let len = (self.len() - len0 - 4) as u32;

        BigEndian::write_u32(&mut self[len0..], len);
    }

    fn write_empty_list(&mut self) {
        self.extend(&[0, 0, 0, 0]);
    }

    fn extend_u64_be(&mut self, u: u64) {
        self.write_u64::<BigEndian>(u).unwrap();
    }
}

impl Encoding for CryptoVec {
    fn extend_ssh_string(&mut self, s: &[u8]) {
        self.push_u32_be(s.len() as u32);
        self.extend(s);
    }
    fn extend_ssh_mpint(&mut self, s: &[u8]) {
        // Skip initial 0s.
        let mut i = 0;
        while i < s.len() && s[i] == 0 {
            i += 1
        }
        if i >= s.len() {
            self.push_u32_be(0);
            return;
        }
        // If the first non-zero is >= 128, write its length (u32, BE), followed by 0.
        if s[i] & 0x80 != 0 {
            self.push_u32_be((s.len() - i + 1) as u32);
            self.push(0)
        } else {
            self.push_u32_be((s.len() - i) as u32);
        }
        self.extend(&s[i..]);
    }

    fn extend_list<A: Bytes, I: Iterator<Item = A>>(&mut self, list: I) {
        let len0 = self.len();
        self.extend(&[0, 0, 0, 0]);
        let mut first = true;
        for i in list {
            if !first {
                self.push(b',')
            } else {
                first = false;
            }
            self.extend(i.bytes())
        }
        let len = (self.len() - len0 - 4) as u32;

        BigEndian::write_u32(&mut self[len0..], len);
    }

    fn write_empty_list(&mut self) {
        self.extend(&[0, 0, 0, 0]);
    }

    fn extend_u64_be(&mut self, u: u64) {
        let mut bytes = [0; 8];
        BigEndian::write_u64(&mut bytes, u);
        self.extend(&bytes);
    }
}

/// A cursor-like trait to read SSH-encoded things.
pub trait Reader {
    /// Create an SSH reader for `self`.
    fn reader(&self, starting_at: usize) -> Position;
}

impl Reader for CryptoVec {
    fn reader(&self, starting_at: usize) -> Position {
        Position {
            s: self,
            position: starting_at,
        }
    }
}

impl Reader for [u8] {
    fn reader(&self, starting_at: usize) -> Position {
        Position {
            s: self,
            position: starting_at,
        }
    }
}

/// A cursor-like type to read SSH-encoded values.
#[derive(Debug)]
pub struct Position<'a> {
    s: &'a [u8],
    #[doc(hidden)]
    pub position: usize,
}

impl<'a> Position<'a> {
    /// Read one string from this reader.
    pub fn read_string(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        if self.position + len <= self.s.len() {
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read a `u32` from this reader.
    pub fn read_u32(&mut self) -> Result<u32, Error> {
        if self.position + 4 <= self.s.len() {
            let u = BigEndian::read_u32(&self.s[self.position..]);
            self.position += 4;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read a `u64` from this reader.
    pub fn read_u64(&mut self) -> Result<u64, Error> {
        if self.position + 8 <= self.s.len() {
            let u = BigEndian::read_u64(&self.s[self.position..]);
            self.position += 8;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one byte from this reader.
    pub fn read_byte(&mut self) -> Result<u8, Error> {
        if self.position + 1 <= self.s.len() {
            let u = self.s[self.position];
            self.position += 1;
            Ok(u)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }

    /// Read one boolean from this reader.
    pub fn read_bool(&mut self) -> Result<bool, Error> {
        Ok(self.read_byte()? != 0)
    }

    /// Read an mpint from this reader. The returned slice keeps the
    /// sign byte, if any; it is suitable for `BigUint::from_bytes_be`.
    pub fn read_mpint(&mut self) -> Result<&'a [u8], Error> {
        let len = self.read_u32()? as usize;
        if self.position + len <= self.s.len() {
            let result = &self.s[self.position..(self.position + len)];
            self.position += len;
            Ok(result)
        } else {
            Err(Error::IndexOutOfBounds)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpint_top_bit_gets_sign_byte() {
        let mut buf = Vec::new();
        buf.extend_ssh_mpint(&[0x80, 0x01]);
        assert_eq!(&buf[..], &[0, 0, 0, 3, 0, 0x80, 0x01]);
        let mut r = buf.reader(0);
        let decoded = r.read_mpint().unwrap();
        assert_eq!(decoded, &[0, 0x80, 0x01]);
    }

    #[test]
    fn mpint_no_sign_byte() {
        let mut buf = Vec::new();
        buf.extend_ssh_mpint(&[0x7f, 0xff]);
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0x7f, 0xff]);
    }

    #[test]
    fn mpint_zero_is_empty() {
        let mut buf = Vec::new();
        buf.extend_ssh_mpint(&[0, 0, 0]);
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        assert_eq!(mpint_len(&[0, 0, 0]), 4);
    }

    #[test]
    fn string_roundtrip() {
        let mut buf = CryptoVec::new();
        buf.extend_ssh_string(b"ssh-rsa");
        let mut r = buf.reader(0);
        assert_eq!(r.read_string().unwrap(), b"ssh-rsa");
    }

    #[test]
    fn reader_out_of_bounds() {
        let buf = [0u8, 0, 0, 10, b'x'];
        let mut r = buf.reader(0);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn u64_and_bool() {
        let mut buf = CryptoVec::new();
        buf.extend_u64_be(0x0102030405060708);
        buf.push(1);
        let mut r = buf.reader(0);
        assert_eq!(r.read_u64().unwrap(), 0x0102030405060708);
        assert!(r.read_bool().unwrap());
    }
}
