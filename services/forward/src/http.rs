//! HTTP-aware relay.
//!
//! Responses flow back to the client untouched. Requests are parsed one
//! head at a time from the client side, rewritten with the node's host
//! override and extra headers, and forwarded with their bodies copied
//! verbatim. A websocket upgrade is forwarded once and the rest of the
//! client stream is then copied raw.
//!
//! ```text
//!   client ──read──> [rewrite task] ──write──> target
//!   client <──write── [passthrough task] <──read── target
//! ```
//!
//! The two tasks never read the same half. The first one to finish ends
//! the relay and the other is aborted.

use std::io;

use bytes::{BufMut, BytesMut};
use hopline_chain::HttpNodeSettings;
use tokio::io::{
    split, AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
    BufReader,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, Level};

use crate::relay::{copy_buffer, DEFAULT_BUFFER_SIZE};

/// Largest request head accepted from a client.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest chunk-size or trailer line accepted in a chunked body.
const MAX_LINE_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 100;

/// How a request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

/// A parsed HTTP/1.x request line and header block.
///
/// Header order and name casing are kept as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: u8,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl RequestHead {
    /// Parse a complete head, including the terminating blank line.
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(data) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(invalid_data("incomplete request head"));
            }
            Err(e) => return Err(invalid_data(format!("malformed request head: {}", e))),
        }

        Ok(Self {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or_default().to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| (h.name.to_string(), h.value.to_vec()))
                .collect(),
        })
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Set header `name` to `value`.
    ///
    /// The first existing occurrence is overwritten in place and any later
    /// duplicates are dropped. A new header is appended.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let mut found = false;
        self.headers.retain_mut(|(n, v)| {
            if !n.eq_ignore_ascii_case(name) {
                return true;
            }
            if found {
                return false;
            }
            found = true;
            *v = value.as_bytes().to_vec();
            true
        });
        if !found {
            self.headers
                .push((name.to_string(), value.as_bytes().to_vec()));
        }
    }

    /// Apply a node's rewrite settings.
    ///
    /// An absolute-form target is sent in origin form, with its authority
    /// moved into `Host` before the node's host override is applied.
    pub fn apply(&mut self, settings: &HttpNodeSettings) {
        if let Some((authority, origin)) = split_absolute_target(&self.target) {
            let authority = authority.to_string();
            self.target = origin;
            if !authority.is_empty() {
                self.put_host(&authority);
            }
        }
        if let Some(host) = settings.host.as_deref().filter(|h| !h.is_empty()) {
            self.put_host(host);
        }
        for (name, value) in &settings.headers {
            self.set_header(name, value);
        }
    }

    fn put_host(&mut self, host: &str) {
        if self.header("host").is_some() {
            self.set_header("Host", host);
        } else {
            self.headers
                .insert(0, ("Host".to_string(), host.as_bytes().to_vec()));
        }
    }

    pub fn body_framing(&self) -> io::Result<BodyFraming> {
        let chunked = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("transfer-encoding"))
            .filter_map(|(_, v)| std::str::from_utf8(v).ok())
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(BodyFraming::Chunked);
        }

        match self.header("content-length") {
            None => Ok(BodyFraming::None),
            Some(value) => std::str::from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(BodyFraming::Length)
                .ok_or_else(|| invalid_data("invalid Content-Length")),
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .is_some_and(|v| v.trim_ascii().eq_ignore_ascii_case(b"websocket"))
    }

    /// Serialize the head, terminated by a blank line.
    pub fn encode(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(self.method.as_bytes());
        out.put_u8(b' ');
        out.put_slice(self.target.as_bytes());
        out.put_slice(b" HTTP/1.");
        out.put_u8(b'0' + self.version.min(9));
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out
    }
}

/// Split `scheme://authority/path?query#fragment` into the authority
/// (userinfo dropped) and the origin-form target `/path?query`.
fn split_absolute_target(target: &str) -> Option<(&str, String)> {
    let (scheme, rest) = target.split_once("://")?;
    if scheme.is_empty()
        || !scheme
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
    {
        return None;
    }
    let rest = rest.split('#').next().unwrap_or_default();
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let (authority, path) = rest.split_at(end);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    let origin = match path.chars().next() {
        None => "/".to_string(),
        Some('?') => format!("/{}", path),
        Some(_) => path.to_string(),
    };
    Some((authority, origin))
}

/// Read one request head, or `None` on EOF before any request byte.
///
/// Empty lines ahead of the request line are skipped.
pub async fn read_head<R>(reader: &mut R) -> io::Result<Option<RequestHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let start = head.len();
        let limit = (MAX_HEAD_SIZE - start) as u64;
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            if head.len() >= MAX_HEAD_SIZE {
                return Err(invalid_data("request head too large"));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request head",
            ));
        }
        if !head.ends_with(b"\n") {
            if head.len() >= MAX_HEAD_SIZE {
                return Err(invalid_data("request head too large"));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request head",
            ));
        }

        let line = &head[start..];
        let blank = line == b"\r\n" || line == b"\n";
        if blank && start == 0 {
            head.clear();
            continue;
        }
        if blank {
            return RequestHead::parse(&head).map(Some);
        }
    }
}

/// Copy exactly `len` body bytes.
pub async fn copy_body<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut (&mut *reader).take(len), writer).await?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside request body",
        ));
    }
    Ok(())
}

/// Copy a chunked body, including the last chunk and any trailers.
pub async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::with_capacity(32);
    loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;

        let size = chunk_size(&line)?;
        if size == 0 {
            break;
        }
        copy_body(reader, writer, size).await?;

        read_line(reader, &mut line).await?;
        if line != b"\r\n" && line != b"\n" {
            return Err(invalid_data("missing CRLF after chunk data"));
        }
        writer.write_all(&line).await?;
    }

    // Trailer section ends with an empty line.
    loop {
        read_line(reader, &mut line).await?;
        writer.write_all(&line).await?;
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    (&mut *reader)
        .take(MAX_LINE_SIZE as u64)
        .read_until(b'\n', line)
        .await?;
    if !line.ends_with(b"\n") {
        if line.len() >= MAX_LINE_SIZE {
            return Err(invalid_data("chunk line too long"));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside chunked body",
        ));
    }
    Ok(())
}

fn chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| invalid_data("invalid chunk size"))?;
    let size = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(size, 16).map_err(|_| invalid_data("invalid chunk size"))
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Forward requests from `reader` to `writer`, rewriting each head.
///
/// Returns when the client closes between requests, or after the raw
/// copy that follows a websocket upgrade finishes.
pub async fn rewrite_requests<R, W>(
    reader: &mut R,
    writer: &mut W,
    settings: &HttpNodeSettings,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(mut head) = read_head(reader).await? else {
            return Ok(());
        };
        head.apply(settings);
        let framing = head.body_framing()?;
        let encoded = head.encode();

        if tracing::enabled!(Level::TRACE) {
            trace!(request = %String::from_utf8_lossy(&encoded), "Rewritten request");
        }

        writer.write_all(&encoded).await?;
        match framing {
            BodyFraming::None => {}
            BodyFraming::Length(len) => copy_body(reader, writer, len).await?,
            BodyFraming::Chunked => copy_chunked(reader, writer).await?,
        }
        writer.flush().await?;

        if head.is_websocket_upgrade() {
            debug!(target = %head.target, "Websocket upgrade, switching to raw copy");
            let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
            let mut copied = 0;
            return copy_buffer(reader, writer, &mut buf, &mut copied).await;
        }
    }
}

/// Run the HTTP-aware relay between `client` and `target`.
///
/// EOF in either direction is a normal end; the first I/O error is
/// returned.
pub async fn relay_http<C, T>(client: C, target: T, settings: HttpNodeSettings) -> io::Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_rd, mut client_wr) = split(client);
    let (mut target_rd, mut target_wr) = split(target);
    let (done_tx, mut done_rx) = mpsc::channel::<io::Result<()>>(2);

    let passthrough = {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
            let mut copied = 0;
            let result = copy_buffer(&mut target_rd, &mut client_wr, &mut buf, &mut copied).await;
            trace!(bytes = copied, "Response passthrough finished");
            let _ = done_tx.send(result).await;
        })
    };

    let rewrite = tokio::spawn(async move {
        let mut reader = BufReader::new(client_rd);
        let result = rewrite_requests(&mut reader, &mut target_wr, &settings).await;
        let _ = done_tx.send(result).await;
    });

    let result = done_rx.recv().await.unwrap_or(Ok(()));

    passthrough.abort();
    rewrite.abort();
    let _ = passthrough.await;
    let _ = rewrite.await;

    result
}
