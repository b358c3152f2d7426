//! Static file retrieval for file providers.
//!
//! Fills a [`Response`] with file contents, MIME type and validators. The
//! caller owns routing and transmission; this crate only touches the
//! filesystem below the configured root.

mod etag;
mod fs;

use tokio::fs as tokio_fs;
use tracing::debug;

use narthex_http::{Request, Response};

use crate::etag::{last_modified_header, weak_etag_size_mtime};
use crate::fs::resolve_below_root;

/// Retrieve a file for `sub_path` below `root` into `response`.
///
/// Behavior:
/// - GET/HEAD only; other methods get `405` with an `Allow` header.
/// - A directory target is retried with `default_file` appended.
/// - A missing extension gets `default_ext` appended (dot-normalized).
/// - Path traversal escaping the root is a `404` (never disclosed).
/// - `If-None-Match` on the weak ETag yields `304` without a body.
pub async fn retrieve_file(
    request: &Request,
    response: &mut Response,
    root: &str,
    sub_path: &str,
    default_file: Option<&str>,
    default_ext: Option<&str>,
) -> anyhow::Result<()> {
    if request.method != "GET" && request.method != "HEAD" {
        response.set_status(405);
        response.set_header("Allow", "GET, HEAD");
        return Ok(());
    }

    let root = root.trim_end_matches(['/', '\\']);
    let Some(mut path) = resolve_below_root(root, sub_path) else {
        debug!(target: "narthex::static", %sub_path, "Rejected path outside root");
        not_found(response);
        return Ok(());
    };

    let mut metadata = match tokio_fs::metadata(&path).await {
        Ok(m) => m,
        Err(_) => {
            // Retry with the default extension before giving up.
            match apply_default_ext(&path, default_ext) {
                Some(retry) => match tokio_fs::metadata(&retry).await {
                    Ok(m) => {
                        path = retry;
                        m
                    }
                    Err(_) => {
                        not_found(response);
                        return Ok(());
                    }
                },
                None => {
                    not_found(response);
                    return Ok(());
                }
            }
        }
    };

    if metadata.is_dir() {
        let Some(default_file) = default_file else {
            not_found(response);
            return Ok(());
        };
        path = path.join(default_file);
        metadata = match tokio_fs::metadata(&path).await {
            Ok(m) => m,
            Err(_) => {
                not_found(response);
                return Ok(());
            }
        };
    }

    let etag = weak_etag_size_mtime(&metadata);
    if request
        .header("if-none-match")
        .map(|v| v.split(',').any(|t| t.trim() == etag.header))
        .unwrap_or(false)
    {
        response.set_status(304);
        response.set_header("ETag", &etag.header);
        return Ok(());
    }

    let body = match tokio_fs::read(&path).await {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            not_found(response);
            return Ok(());
        }
        Err(err) => {
            debug!(target: "narthex::static", error = %err, "Failed to read file");
            response.set_status(500);
            response.set_body(b"500 Internal Server Error\n".to_vec(), TEXT_PLAIN);
            return Ok(());
        }
    };

    response.set_status(200);
    response.set_header("ETag", &etag.header);
    if let Some(last_modified) = last_modified_header(&metadata) {
        response.set_header("Last-Modified", &last_modified);
    }
    let content_type = content_type_for_path(&path);
    response.set_body(body, &content_type);

    Ok(())
}

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

fn not_found(response: &mut Response) {
    response.set_status(404);
    response.set_body(b"404 Not Found\n".to_vec(), TEXT_PLAIN);
}

fn apply_default_ext(
    path: &std::path::Path,
    default_ext: Option<&str>,
) -> Option<std::path::PathBuf> {
    let ext = default_ext?;
    if path.extension().is_some() {
        return None;
    }
    let ext = ext.trim_start_matches('.');
    let file_name = path.file_name()?.to_str()?;
    Some(path.with_file_name(format!("{file_name}.{ext}")))
}

fn content_type_for_path(path: &std::path::Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}
