//! Request-URI handling and the ellipsis rewrite templates.

/// The substitution token used in redirect and rewrite templates: a literal
/// `...` inside a template component means "take the corresponding component
/// of the incoming request".
pub const ELLIPSIS: &str = "...";

/// A decoded request URI plus the provider-local path-info position set by
/// path routing.
#[derive(Debug, Clone)]
pub struct RequestUri {
    path: String,
    query: String,
    path_info_pos: usize,
}

impl RequestUri {
    pub fn parse(target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        Self {
            path: percent_decode(path),
            query: query.to_string(),
            path_info_pos: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the leading `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Set by path routing: the offset where the matched provider prefix
    /// ends inside `path`.
    pub fn set_path_info_pos(&mut self, pos: usize) {
        self.path_info_pos = pos.min(self.path.len());
    }

    /// The sub-path below the matched provider prefix, without a leading
    /// slash. Empty when the request hit the prefix exactly.
    pub fn path_info(&self) -> &str {
        let mut off = self.path_info_pos;
        if off < self.path.len() && self.path.as_bytes()[off] == b'/' {
            off += 1;
        }
        &self.path[off..]
    }
}

/// Decode `%XX` escapes in a path component. Invalid escapes are kept
/// verbatim rather than rejected; routing operates on the literal bytes.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push(((hi << 4) | lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The components of a template URL such as `https://.../new/...?...`.
///
/// `path` is stored without its leading slash; `query` without the `?`.
/// Absent components are empty strings.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub query: String,
}

pub fn split_url(url: &str) -> UrlParts {
    let mut parts = UrlParts::default();

    let rest = match url.split_once("://") {
        Some((scheme, rest)) => {
            parts.scheme = scheme.to_string();
            rest
        }
        None => url,
    };

    let (authority, tail) = match rest.find(['/', '?']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    parts.host = authority.to_string();

    let (path, query) = match tail.split_once('?') {
        Some((p, q)) => (p, q),
        None => (tail, ""),
    };
    parts.path = path.trim_start_matches('/').to_string();
    parts.query = query.to_string();

    parts
}

/// Substitute every ellipsis token in `template` with `value`.
pub fn substitute(template: &str, value: &str) -> String {
    template.replace(ELLIPSIS, value)
}

#[cfg(test)]
mod tests {
    use super::{percent_decode, split_url, substitute, RequestUri};

    #[test]
    fn parse_splits_path_and_query() {
        let uri = RequestUri::parse("/a%20b/c?x=1&y=2");
        assert_eq!(uri.path(), "/a b/c");
        assert_eq!(uri.query(), "x=1&y=2");
    }

    #[test]
    fn path_info_skips_leading_slash() {
        let mut uri = RequestUri::parse("/api/v1/x");
        uri.set_path_info_pos(4);
        assert_eq!(uri.path_info(), "v1/x");
        uri.set_path_info_pos(9);
        assert_eq!(uri.path_info(), "");
    }

    #[test]
    fn path_info_on_root_prefix() {
        let mut uri = RequestUri::parse("/health");
        uri.set_path_info_pos(1);
        assert_eq!(uri.path_info(), "health");
    }

    #[test]
    fn percent_decode_keeps_invalid_escapes() {
        assert_eq!(percent_decode("/a%2Fb"), "/a/b");
        assert_eq!(percent_decode("/a%zzb"), "/a%zzb");
        assert_eq!(percent_decode("/a%2"), "/a%2");
    }

    #[test]
    fn split_url_full() {
        let parts = split_url("https://.../new/...?...");
        assert_eq!(parts.scheme, "https");
        assert_eq!(parts.host, "...");
        assert_eq!(parts.path, "new/...");
        assert_eq!(parts.query, "...");
    }

    #[test]
    fn split_url_no_path() {
        let parts = split_url("https://other.example.com");
        assert_eq!(parts.scheme, "https");
        assert_eq!(parts.host, "other.example.com");
        assert_eq!(parts.path, "");
        assert_eq!(parts.query, "");
    }

    #[test]
    fn split_url_query_without_path() {
        let parts = split_url("http://h?a=b");
        assert_eq!(parts.host, "h");
        assert_eq!(parts.path, "");
        assert_eq!(parts.query, "a=b");
    }

    #[test]
    fn substitute_replaces_token() {
        assert_eq!(substitute("new/...", "old"), "new/old");
        assert_eq!(substitute("fixed", "old"), "fixed");
    }
}
