//! Protocol sniffing.
//!
//! Reads the leading bytes of a stream and classifies them as an HTTP/1.x
//! request or as unknown. Every byte read while sniffing is handed back
//! as the prefix of a `PrefixedStream`, so the next consumer sees the
//! original byte sequence regardless of the outcome.
//!
//! Sniffing stops as soon as the bytes cannot be HTTP, when a complete
//! request head has been read, at EOF, when `max_bytes` is reached, after
//! `timeout`, or when the session token is cancelled.

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::prefixed::PrefixedStream;

/// Default time to wait for a classifiable request head.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(2);

/// Default maximum bytes buffered while sniffing.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const MAX_HEADERS: usize = 100;

const READ_CHUNK: usize = 4096;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"CONNECT", b"OPTIONS", b"TRACE", b"PATCH",
];

/// Sniffed application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Unknown,
}

impl Protocol {
    /// Hint string used for node selection; empty when unknown.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Unknown => "",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for sniffing.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    pub timeout: Duration,
    pub max_bytes: usize,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Outcome of sniffing a stream.
#[derive(Debug)]
pub struct Sniffed<S> {
    /// Reader replaying the sniffed bytes followed by the rest of the stream.
    pub stream: PrefixedStream<S>,
    /// `Host` of the request; empty unless `protocol` is HTTP.
    pub host: String,
    pub protocol: Protocol,
}

enum Verdict {
    Http(String),
    NotHttp,
    NeedMore,
}

/// Classifies the leading bytes of a stream.
#[derive(Debug, Clone, Default)]
pub struct Sniffer {
    config: SniffConfig,
}

impl Sniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniffConfig) -> Self {
        Self { config }
    }

    /// Sniff `stream`, returning the classification and a replaying reader.
    ///
    /// Never fails: read errors, timeouts and cancellation degrade to
    /// `Protocol::Unknown`, keeping whatever bytes were already read.
    pub async fn sniff<S: AsyncRead + Unpin>(
        &self,
        token: &CancellationToken,
        mut stream: S,
    ) -> Sniffed<S> {
        let mut buf = BytesMut::with_capacity(self.config.max_bytes.min(READ_CHUNK));

        let verdict = tokio::select! {
            _ = token.cancelled() => {
                debug!("Sniffing canceled");
                Verdict::NotHttp
            }
            result = timeout(self.config.timeout, self.read_head(&mut stream, &mut buf)) => {
                match result {
                    Ok(verdict) => verdict,
                    Err(_) => {
                        debug!(buffered = buf.len(), "Sniffing timeout");
                        Verdict::NotHttp
                    }
                }
            }
        };

        let (protocol, host) = match verdict {
            Verdict::Http(host) => (Protocol::Http, host),
            _ => (Protocol::Unknown, String::new()),
        };

        Sniffed {
            stream: PrefixedStream::new(buf.freeze(), stream),
            host,
            protocol,
        }
    }

    /// Read until the buffered bytes can be classified.
    ///
    /// Reads are cancel safe, so bytes appended to `buf` survive a timeout.
    async fn read_head<S: AsyncRead + Unpin>(&self, stream: &mut S, buf: &mut BytesMut) -> Verdict {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match classify(buf) {
                Verdict::NeedMore => {}
                verdict => return verdict,
            }
            let room = self.config.max_bytes.saturating_sub(buf.len());
            if room == 0 {
                return Verdict::NotHttp;
            }
            match stream.read(&mut chunk[..room.min(READ_CHUNK)]).await {
                Ok(0) => return Verdict::NotHttp,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "Sniffing read failed");
                    return Verdict::NotHttp;
                }
            }
        }
    }
}

/// Classify a buffered prefix.
fn classify(data: &[u8]) -> Verdict {
    if data.is_empty() {
        return Verdict::NeedMore;
    }
    if !could_be_method(data) {
        return Verdict::NotHttp;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => Verdict::Http(request_host(&req)),
        Ok(httparse::Status::Partial) => Verdict::NeedMore,
        Err(_) => Verdict::NotHttp,
    }
}

/// Whether `data` starts with, or is a prefix of, `METHOD SP`.
fn could_be_method(data: &[u8]) -> bool {
    HTTP_METHODS.iter().any(|method| {
        let n = data.len().min(method.len());
        if data[..n] != method[..n] {
            return false;
        }
        data.len() <= method.len() || data[method.len()] == b' '
    })
}

/// Host from the `Host` header, falling back to an absolute-form target.
fn request_host(req: &httparse::Request<'_, '_>) -> String {
    let header = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
        .filter(|h| !h.is_empty());
    if let Some(host) = header {
        return host.to_string();
    }

    req.path
        .and_then(|p| p.split_once("://"))
        .map(|(_, rest)| rest.split(['/', '?']).next().unwrap_or_default())
        .map(|authority| authority.rsplit('@').next().unwrap_or_default().to_string())
        .unwrap_or_default()
}
