//! Incremental HTTP/1 request-head reading and the parsed request model.
//!
//! Reads until the head is complete, parses it with `httparse`, and derives
//! the framing metadata (content length, chunked, keep-alive). The body is
//! left in the caller's buffer/stream.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt};
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::response::send_status;

const MAX_HEADERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// A parsed request head. Headers keep their wire order so the head can be
/// re-encoded for origin forwarding with minimal disturbance.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    headers: Vec<(String, String)>,
    pub content_length: usize,
    pub is_chunked: bool,
    pub close_after: bool,
}

impl Default for Request {
    /// An empty placeholder; a connection context holds one of these before
    /// its first request arrives.
    fn default() -> Self {
        Self {
            method: String::new(),
            target: String::new(),
            version: Version::Http11,
            headers: Vec::new(),
            content_length: 0,
            is_chunked: false,
            close_after: true,
        }
    }
}

impl Request {
    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The `Host` header exactly as sent (may include a port).
    pub fn host_raw(&self) -> Option<&str> {
        self.header("host")
    }

    /// The `Host` header with any port stripped. Virtual-host routing is
    /// defined on bare hostnames.
    pub fn host(&self) -> Option<&str> {
        self.host_raw().map(strip_port)
    }

    /// Replace (or insert) the `Host` header.
    pub fn set_host(&mut self, host: &str) {
        self.set_header("Host", host);
    }

    /// Append a header, keeping any existing ones with the same name.
    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Replace the first header with this name, or append it.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.add_header(name, value);
        }
    }

    pub fn has_body(&self) -> bool {
        self.is_chunked || self.content_length > 0
    }

    /// True when the request asks to upgrade the connection to `proto`
    /// (`Upgrade: <proto>` plus a `Connection` header listing `upgrade`).
    pub fn is_upgrade(&self, proto: &str) -> bool {
        let upgraded = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case(proto))
            .unwrap_or(false);
        upgraded
            && self
                .header("connection")
                .map(|v| split_header_tokens(v).any(|t| t == "upgrade"))
                .unwrap_or(false)
    }

    /// Credentials from an `Authorization: Basic` header, if present.
    pub fn basic_auth(&self) -> Option<(String, String)> {
        crate::auth::parse_basic(self.header("authorization")?)
    }

    /// Serialize the (possibly rewritten) head for origin forwarding.
    pub fn encode_head(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_str().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Strip a trailing `:port` from a host value, leaving IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        if let Some(end) = host.find(']') {
            return &host[..=end];
        }
        return host;
    }
    if let Some(idx) = host.rfind(':') {
        let port = &host[idx + 1..];
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            return &host[..idx];
        }
    }
    host
}

/// Read one full request head off the stream.
///
/// Returns `Ok(None)` when the connection should simply be dropped: clean
/// EOF between requests, idle timeout, or a malformed head for which the
/// error response has already been written.
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max_head_bytes: usize,
    idle_timeout: Duration,
    read_timeout: Duration,
) -> anyhow::Result<Option<Request>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    loop {
        if !buf.is_empty() {
            let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Request::new(&mut storage);
            match parsed.parse(&buf[..]) {
                Ok(httparse::Status::Complete(head_len)) => {
                    let built = build_request(&parsed);
                    buf.advance(head_len);
                    match built {
                        Ok(req) => return Ok(Some(req)),
                        Err(reason) => {
                            warn!(target: "narthex::http", %reason, "Rejecting malformed request head");
                            send_status(stream, 400).await?;
                            return Ok(None);
                        }
                    }
                }
                Ok(httparse::Status::Partial) => {}
                Err(err) => {
                    warn!(target: "narthex::http", error = %err, "Unparsable request head");
                    send_status(stream, 400).await?;
                    return Ok(None);
                }
            }
        }

        if max_head_bytes > 0 && buf.len() > max_head_bytes {
            send_status(stream, 431).await?;
            return Ok(None);
        }

        let timeout_dur = if buf.is_empty() { idle_timeout } else { read_timeout };
        let mut tmp = [0u8; 4096];
        match timeout(timeout_dur, stream.read(&mut tmp)).await {
            Ok(res) => {
                let n = res?;
                if n == 0 {
                    if !buf.is_empty() {
                        debug!(target: "narthex::http", "Client closed mid-head");
                    }
                    return Ok(None);
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            Err(_) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                send_status(stream, 408).await?;
                return Ok(None);
            }
        }
    }
}

fn build_request(parsed: &httparse::Request<'_, '_>) -> Result<Request, &'static str> {
    let method = parsed.method.ok_or("missing method")?.to_string();
    let target = parsed.path.ok_or("missing request target")?.to_string();
    let version = match parsed.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err("unsupported HTTP version"),
    };

    let mut headers = Vec::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let value = std::str::from_utf8(h.value).map_err(|_| "non-UTF8 header value")?;
        headers.push((h.name.to_string(), value.trim().to_string()));
    }

    let mut content_length = ContentLengthState::default();
    let mut connection_close = false;
    let mut connection_keep_alive = false;
    let mut is_chunked = false;
    let mut host_value: Option<&str> = None;
    let mut transfer_encoding_present = false;
    let mut transfer_encoding_last: Option<String> = None;

    for (name, value) in &headers {
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length.add(value),
            "host" => {
                if let Some(prev) = host_value {
                    if prev != value {
                        return Err("conflicting Host headers");
                    }
                } else {
                    host_value = Some(value);
                }
            }
            "connection" | "proxy-connection" => {
                for token in split_header_tokens(value) {
                    match token.as_str() {
                        "close" => connection_close = true,
                        "keep-alive" => connection_keep_alive = true,
                        _ => {}
                    }
                }
            }
            "transfer-encoding" => {
                transfer_encoding_present = true;
                for token in split_header_tokens(value) {
                    if token == "chunked" {
                        is_chunked = true;
                    }
                    transfer_encoding_last = Some(token);
                }
            }
            _ => {}
        }
    }

    if version == Version::Http11 {
        let host = host_value.ok_or("missing Host header")?;
        if !is_valid_host(host) {
            return Err("invalid Host header");
        }
    } else if let Some(host) = host_value {
        if !is_valid_host(host) {
            return Err("invalid Host header");
        }
    }

    if content_length.invalid {
        return Err(if content_length.conflict {
            "conflicting Content-Length"
        } else {
            "invalid Content-Length"
        });
    }

    if transfer_encoding_present {
        if transfer_encoding_last.as_deref() != Some("chunked") {
            return Err("unsupported Transfer-Encoding");
        }
        if content_length.value.is_some() {
            return Err("Transfer-Encoding with Content-Length");
        }
    }

    let close_after = match version {
        Version::Http10 => !connection_keep_alive || connection_close,
        Version::Http11 => connection_close,
    };

    Ok(Request {
        method,
        target,
        version,
        headers,
        content_length: content_length.value.unwrap_or(0),
        is_chunked,
        close_after,
    })
}

/// Tracks Content-Length parsing state for duplicate header detection.
#[derive(Default)]
struct ContentLengthState {
    value: Option<usize>,
    invalid: bool,
    conflict: bool,
}

impl ContentLengthState {
    fn add(&mut self, raw: &str) {
        let mut any = false;
        for part in raw.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            any = true;
            match trimmed.parse::<usize>() {
                Ok(len) => {
                    if let Some(prev) = self.value {
                        if prev != len {
                            self.conflict = true;
                            self.invalid = true;
                        }
                    } else {
                        self.value = Some(len);
                    }
                }
                Err(_) => self.invalid = true,
            }
        }
        if !any {
            self.invalid = true;
        }
    }
}

pub(crate) fn split_header_tokens(value: &str) -> impl Iterator<Item = String> + '_ {
    value.split(',').filter_map(|token| {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(
                trimmed
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_ascii_lowercase(),
            )
        }
    })
}

fn is_valid_host(host: &str) -> bool {
    let host = host.trim();
    if host.is_empty() {
        return false;
    }
    host.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']' | '_')
    })
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio::time::Duration;

    use super::{read_request, strip_port, Version};

    async fn parse(raw: &str) -> Option<super::Request> {
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::io::AsyncWriteExt::write_all(&mut client, raw.as_bytes())
            .await
            .unwrap();
        drop(client);
        let mut buf = BytesMut::new();
        read_request(
            &mut server,
            &mut buf,
            64 * 1024,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn parses_simple_get() {
        let req = parse("GET /a/b?x=1 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .await
            .expect("expected request");
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/a/b?x=1");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.host(), Some("example.com"));
        assert!(!req.close_after);
        assert!(!req.has_body());
    }

    #[tokio::test]
    async fn rejects_missing_host_on_http11() {
        assert!(parse("GET / HTTP/1.1\r\nUser-Agent: t\r\n\r\n").await.is_none());
    }

    #[tokio::test]
    async fn rejects_conflicting_content_length() {
        let raw = "POST / HTTP/1.1\r\nHost: e\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        assert!(parse(raw).await.is_none());
    }

    #[tokio::test]
    async fn accepts_duplicate_content_length() {
        let raw = "POST / HTTP/1.1\r\nHost: e\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n";
        let req = parse(raw).await.expect("expected request");
        assert_eq!(req.content_length, 5);
    }

    #[tokio::test]
    async fn http10_defaults_to_close() {
        let req = parse("GET / HTTP/1.0\r\n\r\n").await.expect("expected request");
        assert!(req.close_after);
        let req = parse("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
            .await
            .expect("expected request");
        assert!(!req.close_after);
    }

    #[tokio::test]
    async fn detects_websocket_upgrade() {
        let raw = "GET /ws HTTP/1.1\r\nHost: e\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n";
        let req = parse(raw).await.expect("expected request");
        assert!(req.is_upgrade("websocket"));
        assert!(!req.is_upgrade("h2c"));
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
    }
}
