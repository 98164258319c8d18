use std::borrow::Cow;

const JWT_PREFIX: &str = "eyJ";
const TOKEN_FIELDS: [&str; 4] = [
    "\"access_token\":\"",
    "\"refresh_token\":\"",
    "\"accessToken\":\"",
    "\"refreshToken\":\"",
];

fn is_token_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.'
}

/// Masks JWT-shaped tokens and token-bearing JSON fields.
pub fn redact_tokens(input: &str) -> Cow<'_, str> {
    let mut redacted = input.to_string();

    for field in TOKEN_FIELDS {
        if !redacted.contains(field) {
            continue;
        }
        let mut out = String::with_capacity(redacted.len());
        let mut rest = redacted.as_str();
        while let Some(idx) = rest.find(field) {
            out.push_str(&rest[..idx + field.len()]);
            rest = &rest[idx + field.len()..];
            let end = rest.find('"').unwrap_or(rest.len());
            out.push_str("REDACTED");
            rest = &rest[end..];
        }
        out.push_str(rest);
        redacted = out;
    }

    if redacted.contains(JWT_PREFIX) {
        let mut out = String::with_capacity(redacted.len());
        let mut rest = redacted.as_str();
        while let Some(idx) = rest.find(JWT_PREFIX) {
            let preceded_by_token_char = rest[..idx].chars().next_back().is_some_and(is_token_char);
            out.push_str(&rest[..idx]);
            rest = &rest[idx..];

            let consumed: usize = rest
                .chars()
                .take_while(|ch| is_token_char(*ch))
                .map(char::len_utf8)
                .sum();
            // Only dotted tokens are JWTs; leave words that merely start with "eyJ" alone.
            if preceded_by_token_char || !rest[..consumed].contains('.') {
                out.push_str(&rest[..JWT_PREFIX.len()]);
                rest = &rest[JWT_PREFIX.len()..];
                continue;
            }
            out.push_str("REDACTED");
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        redacted = out;
    }

    if redacted == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(redacted)
    }
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }

    (0..=hay.len() - nee.len()).find(|&i| hay[i..i + nee.len()].eq_ignore_ascii_case(nee))
}

fn redact_header_value(text: String, header: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    loop {
        let Some(idx) = find_ascii_case_insensitive(rest, header) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..idx + header.len()]);
        rest = &rest[idx + header.len()..];

        if let Some(stripped) = rest.strip_prefix(' ') {
            out.push(' ');
            rest = stripped;
        }

        let end = rest.find(['\n', '\r']).unwrap_or(rest.len());
        if end > 0 {
            out.push_str(replacement);
        }
        rest = &rest[end..];
    }
    out
}

/// Everything that may end up in a log line or an error message goes through here.
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut value = redact_tokens(input).into_owned();

    value = redact_header_value(value, "Authorization: Bearer", "REDACTED");
    value = redact_header_value(value, "apikey:", "REDACTED");

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}
