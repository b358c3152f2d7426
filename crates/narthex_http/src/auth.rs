//! `Authorization: Basic` header parsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Extract `(user, password)` from a Basic authorization header value.
/// Returns `None` for any other scheme or malformed payload.
pub fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let mut parts = header_value.trim().splitn(2, ' ');
    let scheme = parts.next()?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let payload = parts.next()?.trim();
    let decoded = STANDARD.decode(payload).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, password) = text.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::parse_basic;

    #[test]
    fn parses_valid_credentials() {
        // "aladdin:opensesame"
        let value = "Basic YWxhZGRpbjpvcGVuc2VzYW1l";
        assert_eq!(
            parse_basic(value),
            Some(("aladdin".to_string(), "opensesame".to_string()))
        );
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert!(parse_basic("basic YWxhZGRpbjpvcGVuc2VzYW1l").is_some());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(parse_basic("Bearer abc.def").is_none());
        assert!(parse_basic("Basic ???").is_none());
        assert!(parse_basic("Basic").is_none());
        // no colon in payload: "useronly"
        assert!(parse_basic("Basic dXNlcm9ubHk=").is_none());
    }
}
