//! HTTP/1.1 codec for the gateway.
//!
//! Request heads are parsed incrementally off the client stream, responses
//! are either built locally (redirect, file, error) or streamed through from
//! an origin server. Bodies are never materialized here; the caller streams
//! them using the framing metadata (`content_length` / `is_chunked`).

pub mod auth;
pub mod request;
pub mod response;
pub mod uri;

pub use request::{read_request, Request, Version};
pub use response::{parse_response_head, reason_phrase, send_status, Response, ResponseHead};
pub use uri::{split_url, RequestUri, UrlParts, ELLIPSIS};
