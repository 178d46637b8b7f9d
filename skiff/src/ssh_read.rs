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
use cryptovec::CryptoVec;
use futures::task::*;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Servers may send informational lines before their identification,
/// RFC 4253 section 4.2. Both caps guard against a hostile peer.
pub const MAX_BANNER_LINES: usize = 50;
pub const MAX_BANNER_LINE_LEN: usize = 255;

/// The server's side of the version exchange: the raw identification
/// line (an input to the exchange hash) and its parsed fields.
#[derive(Debug, Clone)]
pub struct ServerIdentification {
    /// The identification line, CR/LF stripped.
    pub raw: Vec<u8>,
    /// `2.0` or `1.99`.
    pub protocol: String,
    pub software: String,
    pub comment: Option<String>,
    /// Informational lines received before the identification. Not
    /// sanitized; display code must pass them through
    /// [`crate::sanitize`].
    pub banner: Vec<String>,
}

/// Parse `SSH-protoversion-softwareversion [SP comment]`.
fn parse_server_id(line: &[u8], banner: Vec<String>) -> Result<ServerIdentification, Error> {
    let rest = &line[4..]; // after "SSH-"
    let dash = rest
        .iter()
        .position(|&c| c == b'-')
        .ok_or(Error::Version)?;
    let protocol = std::str::from_utf8(&rest[..dash])?.to_string();
    if protocol != "2.0" && protocol != "1.99" {
        return Err(Error::UnsupportedVersion(protocol));
    }
    let rest = &rest[dash + 1..];
    let (software, comment) = match rest.iter().position(|&c| c == b' ') {
        Some(sp) => (
            std::str::from_utf8(&rest[..sp])?.to_string(),
            Some(std::str::from_utf8(&rest[sp + 1..])?.to_string()),
        ),
        None => (std::str::from_utf8(rest)?.to_string(), None),
    };
    Ok(ServerIdentification {
        raw: line.to_vec(),
        protocol,
        software,
        comment,
        banner,
    })
}

/// The buffer to read the identification string (first line in the
/// protocol).
struct ReadSshIdBuffer {
    pub buf: CryptoVec,
    pub total: usize,
    pub bytes_read: usize,
}

impl ReadSshIdBuffer {
    pub fn new() -> ReadSshIdBuffer {
        let mut buf = CryptoVec::new();
        buf.resize(256);
        ReadSshIdBuffer {
            buf,
            bytes_read: 0,
            total: 0,
        }
    }
}

impl std::fmt::Debug for ReadSshIdBuffer {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "ReadSshId {:?} / {:?}", self.bytes_read, self.total)
    }
}

/// SshRead<R> is the same as R, plus a small buffer in the beginning to
/// read the identification string. After the first line in the
/// connection, the `id` parameter is never used again.
pub struct SshRead<R> {
    id: Option<ReadSshIdBuffer>,
    pub r: R,
}

impl<R: AsyncRead + AsyncWrite> SshRead<R> {
    pub fn split(self) -> (SshRead<tokio::io::ReadHalf<R>>, tokio::io::WriteHalf<R>) {
        let (r, w) = tokio::io::split(self.r);
        (SshRead { id: self.id, r }, w)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SshRead<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<Result<(), std::io::Error>> {
        if let Some(mut id) = self.id.take() {
            debug!("id {:?} {:?}", id.total, id.bytes_read);
            if id.total > id.bytes_read {
                // Serve the bytes read past the identification line
                // before touching the socket again.
                let total = id.total.min(id.bytes_read + buf.remaining());
                buf.put_slice(&id.buf[id.bytes_read..total]);
                id.bytes_read = total;
                self.id = Some(id);
                return Poll::Ready(Ok(()));
            }
        }
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().r), cx, buf)
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for SshRead<R> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        AsyncWrite::poll_write(Pin::new(&mut self.r), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), std::io::Error>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.r), cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Result<(), std::io::Error>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.r), cx)
    }
}

impl<R: AsyncRead + Unpin> SshRead<R> {
    pub fn new(r: R) -> Self {
        SshRead {
            id: Some(ReadSshIdBuffer::new()),
            r,
        }
    }

    /// Read the server identification, collecting any informational
    /// banner lines sent before it. Lines terminated by a bare LF are
    /// accepted.
    pub async fn read_ssh_id(&mut self) -> Result<ServerIdentification, Error> {
        let ssh_id = self.id.as_mut().unwrap();
        let mut banner = Vec::new();
        // Start of the line currently being scanned.
        let mut line_start = 0;
        loop {
            if ssh_id.total == ssh_id.buf.len() {
                let len = ssh_id.buf.len();
                ssh_id.buf.resize(len + 256);
            }
            let n = AsyncReadExt::read(&mut self.r, &mut ssh_id.buf[ssh_id.total..]).await?;
            if n == 0 {
                return Err(Error::Disconnect);
            }
            ssh_id.total += n;

            while let Some(nl) = ssh_id.buf[line_start..ssh_id.total]
                .iter()
                .position(|&c| c == b'\n')
            {
                let consumed = line_start + nl + 1;
                let mut line = &ssh_id.buf[line_start..line_start + nl];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                if line.len() > MAX_BANNER_LINE_LEN {
                    return Err(Error::Version);
                }
                if line.starts_with(b"SSH-") {
                    ssh_id.bytes_read = consumed;
                    return parse_server_id(line, banner);
                }
                // A preliminary line, RFC 4253 section 4.2.
                if banner.len() >= MAX_BANNER_LINES {
                    return Err(Error::Version);
                }
                banner.push(String::from_utf8_lossy(line).into_owned());
                line_start = consumed;
            }
            if ssh_id.total - line_start > MAX_BANNER_LINE_LEN + 2 {
                return Err(Error::Version);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_id(input: &[u8]) -> Result<ServerIdentification, Error> {
        let mut reader = SshRead::new(input);
        reader.read_ssh_id().await
    }

    #[tokio::test]
    async fn banner_then_identification() {
        let id = read_id(b"Some banner\r\nSSH-2.0-OpenSSH_8.9p1\r\n")
            .await
            .unwrap();
        assert_eq!(id.banner, vec!["Some banner".to_string()]);
        assert_eq!(id.protocol, "2.0");
        assert_eq!(id.software, "OpenSSH_8.9p1");
        assert_eq!(id.comment, None);
        assert_eq!(id.raw, b"SSH-2.0-OpenSSH_8.9p1".to_vec());
    }

    #[tokio::test]
    async fn lf_only_line_is_accepted() {
        let id = read_id(b"SSH-2.0-OpenSSH_7.4\n").await.unwrap();
        assert_eq!(id.software, "OpenSSH_7.4");
    }

    #[tokio::test]
    async fn comment_is_parsed() {
        let id = read_id(b"SSH-1.99-Serve 1.2 something\r\n").await.unwrap();
        assert_eq!(id.protocol, "1.99");
        assert_eq!(id.software, "Serve");
        assert_eq!(id.comment.as_deref(), Some("1.2 something"));
    }

    #[tokio::test]
    async fn old_protocol_is_rejected() {
        match read_id(b"SSH-1.5-OldServer\r\n").await {
            Err(Error::UnsupportedVersion(v)) => assert_eq!(v, "1.5"),
            r => panic!("expected UnsupportedVersion, got {:?}", r.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn too_many_banner_lines_is_an_error() {
        let mut input = Vec::new();
        for i in 0..51 {
            input.extend_from_slice(format!("line {}\r\n", i).as_bytes());
        }
        input.extend_from_slice(b"SSH-2.0-X\r\n");
        assert!(read_id(&input).await.is_err());
    }

    #[tokio::test]
    async fn overlong_line_is_an_error() {
        let mut input = vec![b'x'; 300];
        input.extend_from_slice(b"\r\nSSH-2.0-X\r\n");
        assert!(read_id(&input).await.is_err());
    }

    #[tokio::test]
    async fn bytes_after_id_are_replayed() {
        let mut reader = SshRead::new(&b"SSH-2.0-X\r\nREST"[..]);
        let id = reader.read_ssh_id().await.unwrap();
        assert_eq!(id.software, "X");
        let mut rest = Vec::new();
        AsyncReadExt::read_to_end(&mut reader, &mut rest).await.unwrap();
        assert_eq!(rest, b"REST");
    }
}
