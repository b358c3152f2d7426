//! Locally built responses and origin response-head parsing.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::request::{split_header_tokens, Request, Version};

const SERVER_TOKEN: &str = "narthex/0.1.0";

/// A locally synthesized response (redirect, file contents, error page).
///
/// Origin responses are not represented by this type; they are streamed
/// through with only their head parsed (see [`ResponseHead`]).
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// A response with a custom reason phrase, e.g. `503 host unavailable`.
    pub fn with_reason(status: u16, reason: &str) -> Self {
        let mut resp = Self::new(status);
        resp.reason = Some(reason.to_string());
        resp
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = None;
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) {
        self.set_header("Content-Type", content_type);
        self.body = body;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Keep-alive iff the effective `Connection` header is not `close`.
    pub fn is_keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) => !split_header_tokens(v).any(|t| t == "close"),
            None => true,
        }
    }

    /// Copy the request's connection type onto this response when it has
    /// none of its own, so keep-alive survives locally built responses.
    pub fn sync_connection(&mut self, request: &Request) {
        if self.header("connection").is_some() {
            return;
        }
        let value = match request.header("connection") {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => match request.version {
                Version::Http11 => "keep-alive".to_string(),
                Version::Http10 => "close".to_string(),
            },
        };
        self.set_header("Connection", &value);
    }

    pub fn encode(&self, head_only: bool) -> Vec<u8> {
        let reason = self
            .reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status));

        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason);
        if self.header("server").is_none() {
            head.push_str("Server: ");
            head.push_str(SERVER_TOKEN);
            head.push_str("\r\n");
        }
        if self.header("date").is_none() {
            head.push_str("Date: ");
            head.push_str(&httpdate::fmt_http_date(std::time::SystemTime::now()));
            head.push_str("\r\n");
        }
        if has_content_length(self.status) && self.header("content-length").is_none() {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        if !head_only && has_content_length(self.status) {
            out.extend_from_slice(&self.body);
        }
        out
    }

    pub async fn send<S>(&self, stream: &mut S, head_only: bool) -> anyhow::Result<()>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        stream.write_all(&self.encode(head_only)).await?;
        stream.flush().await?;
        Ok(())
    }
}

fn has_content_length(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Write a minimal text response for protocol-level rejections (400, 408,
/// 431). These always close the connection.
pub async fn send_status<S>(stream: &mut S, status: u16) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let mut resp = Response::new(status);
    resp.set_header("Connection", "close");
    let body = format!("{} {}\n", status, reason_phrase(status));
    resp.set_body(body.into_bytes(), "text/plain; charset=utf-8");
    resp.send(stream, false).await
}

/// Parsed metadata of an origin response head.
#[derive(Debug, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub is_http10: bool,
    pub content_length: Option<usize>,
    pub is_chunked: bool,
    pub connection_close: bool,
    pub connection_keep_alive: bool,
    pub upgrade_websocket: bool,
    /// Total head size in bytes, including the terminating blank line.
    pub head_len: usize,
}

impl ResponseHead {
    /// Whether the origin connection may be reused after this response.
    pub fn allows_reuse(&self) -> bool {
        if self.is_http10 {
            self.connection_keep_alive && !self.connection_close
        } else {
            !self.connection_close
        }
    }

    /// True for responses that never carry a body regardless of framing.
    pub fn has_no_body(&self, request_method: &str) -> bool {
        if request_method.eq_ignore_ascii_case("HEAD") {
            return true;
        }
        (100..200).contains(&self.status) || self.status == 204 || self.status == 304
    }
}

/// Parse an origin response head out of `buf`. Returns `Ok(None)` while the
/// head is still incomplete.
pub fn parse_response_head(buf: &[u8]) -> anyhow::Result<Option<ResponseHead>> {
    let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let head_str = String::from_utf8_lossy(&buf[..pos]);

    let mut head = ResponseHead {
        head_len: pos + 4,
        ..ResponseHead::default()
    };

    let mut content_length: Option<usize> = None;
    let mut upgrade_header = false;
    let mut connection_upgrade = false;

    let mut lines = head_str.lines();
    let status_line = lines.next().unwrap_or("");
    head.is_http10 = status_line.starts_with("HTTP/1.0");
    head.status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed status line: {status_line}"))?;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let parsed = value
                    .parse::<usize>()
                    .map_err(|_| anyhow::anyhow!("invalid Content-Length in response"))?;
                if let Some(prev) = content_length {
                    if prev != parsed {
                        anyhow::bail!("conflicting Content-Length in response");
                    }
                }
                content_length = Some(parsed);
            }
            "connection" => {
                for token in split_header_tokens(value) {
                    match token.as_str() {
                        "close" => head.connection_close = true,
                        "keep-alive" => head.connection_keep_alive = true,
                        "upgrade" => connection_upgrade = true,
                        _ => {}
                    }
                }
            }
            "transfer-encoding" => {
                for token in split_header_tokens(value) {
                    if token == "chunked" {
                        head.is_chunked = true;
                    }
                }
            }
            "upgrade" => {
                if value.eq_ignore_ascii_case("websocket") {
                    upgrade_header = true;
                }
            }
            _ => {}
        }
    }

    head.content_length = content_length;
    head.upgrade_websocket = head.status == 101 && upgrade_header && connection_upgrade;

    Ok(Some(head))
}

#[cfg(test)]
mod tests {
    use super::{parse_response_head, Response};
    use crate::request::{read_request, Request};

    async fn request(raw: &str) -> Request {
        let (mut client, mut server) = tokio::io::duplex(8192);
        tokio::io::AsyncWriteExt::write_all(&mut client, raw.as_bytes())
            .await
            .unwrap();
        drop(client);
        let mut buf = bytes::BytesMut::new();
        read_request(
            &mut server,
            &mut buf,
            0,
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap()
        .unwrap()
    }

    #[test]
    fn encode_sets_content_length_and_reason() {
        let mut resp = Response::new(404);
        resp.set_body(b"missing".to_vec(), "text/plain");
        let wire = String::from_utf8(resp.encode(false)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Content-Length: 7\r\n"));
        assert!(wire.ends_with("\r\n\r\nmissing"));
    }

    #[test]
    fn custom_reason_is_used() {
        let resp = Response::with_reason(503, "host unavailable");
        let wire = String::from_utf8(resp.encode(false)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 503 host unavailable\r\n"));
    }

    #[tokio::test]
    async fn sync_connection_copies_request_value() {
        let req = request("GET / HTTP/1.1\r\nHost: e\r\nConnection: keep-alive\r\n\r\n").await;
        let mut resp = Response::new(307);
        resp.sync_connection(&req);
        assert_eq!(resp.header("connection"), Some("keep-alive"));
        assert!(resp.is_keep_alive());
    }

    #[tokio::test]
    async fn sync_connection_defaults_by_version() {
        let req = request("GET / HTTP/1.0\r\n\r\n").await;
        let mut resp = Response::new(200);
        resp.sync_connection(&req);
        assert_eq!(resp.header("connection"), Some("close"));
        assert!(!resp.is_keep_alive());
    }

    #[test]
    fn parses_upgrade_head() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nxyz";
        let head = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 101);
        assert!(head.upgrade_websocket);
        assert_eq!(head.head_len, raw.len() - 3);
    }

    #[test]
    fn partial_head_returns_none() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\nConte").unwrap().is_none());
    }

    #[test]
    fn reuse_decision_follows_version() {
        let head = parse_response_head(b"HTTP/1.0 200 OK\r\n\r\n").unwrap().unwrap();
        assert!(!head.allows_reuse());
        let head = parse_response_head(b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.allows_reuse());
        let head = parse_response_head(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(!head.allows_reuse());
    }
}
