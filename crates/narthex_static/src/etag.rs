use std::{fs::Metadata, time::UNIX_EPOCH};

pub(crate) struct EtagInfo {
    pub(crate) header: String,
}

/// Weak ETag derived from size and mtime, cheap enough to compute per hit.
pub(crate) fn weak_etag_size_mtime(metadata: &Metadata) -> EtagInfo {
    let size = metadata.len();
    let mtime_nanos = metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|dur| dur.as_nanos())
        .unwrap_or(0);

    EtagInfo {
        header: format!(r#"W/"{size}-{mtime_nanos}""#),
    }
}

pub(crate) fn last_modified_header(metadata: &Metadata) -> Option<String> {
    metadata.modified().ok().map(httpdate::fmt_http_date)
}
