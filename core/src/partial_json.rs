//! Tolerant extraction of fields from a *growing* JSON document.
//!
//! While the model streams tool-call arguments, hosts want to render the
//! plan's `message` (and finished `reasoning` entries) token by token
//! without waiting for the JSON to close. These scanners work on the raw
//! accumulated text: they find the last `"message"` key, then consume
//! quote-delimited content while tracking escapes, accepting truncated
//! `\uXXXX` sequences and a trailing backslash at the cut point.

/// Decoded value of the last `"message"` string field in `raw`, which may
/// still be mid-stream. `None` until the opening quote of the value has
/// arrived.
pub(crate) fn latest_message_value(raw: &str) -> Option<String> {
    let start = last_key_value_start(raw, "message")?;
    Some(decode_partial_string(&raw[start..]))
}

/// Fully closed elements of the `"reasoning"` string array. Partial
/// elements are never returned.
pub(crate) fn closed_reasoning_elements(raw: &str) -> Vec<String> {
    let Some(mut pos) = last_key_position(raw, "reasoning") else {
        return Vec::new();
    };
    let bytes = raw.as_bytes();
    // Skip to the opening bracket.
    while pos < bytes.len() && bytes[pos] != b'[' {
        if !matches!(bytes[pos], b' ' | b'\t' | b'\n' | b'\r' | b':') {
            return Vec::new();
        }
        pos += 1;
    }
    if pos >= bytes.len() {
        return Vec::new();
    }
    pos += 1;

    let mut elements = Vec::new();
    loop {
        // Skip separators and whitespace between elements.
        while pos < bytes.len() && matches!(bytes[pos], b' ' | b'\t' | b'\n' | b'\r' | b',') {
            pos += 1;
        }
        if pos >= bytes.len() || bytes[pos] == b']' {
            break;
        }
        if bytes[pos] != b'"' {
            break;
        }
        let Some((value, end)) = decode_closed_string(&raw[pos..]) else {
            // The element is still streaming; stop without emitting it.
            break;
        };
        elements.push(value);
        pos += end;
    }
    elements
}

/// Byte offset just past the opening quote of the value for the *last*
/// occurrence of `"key"` followed by a colon.
fn last_key_value_start(raw: &str, key: &str) -> Option<usize> {
    let mut pos = last_key_position(raw, key)?;
    let bytes = raw.as_bytes();
    while pos < bytes.len() && matches!(bytes[pos], b' ' | b'\t' | b'\n' | b'\r' | b':') {
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'"' {
        Some(pos + 1)
    } else {
        None
    }
}

/// Byte offset just past the closing quote of the last `"key"` occurrence
/// that is followed (modulo whitespace) by a colon.
fn last_key_position(raw: &str, key: &str) -> Option<usize> {
    let needle = format!("\"{key}\"");
    let mut best = None;
    let mut from = 0;
    while let Some(found) = raw[from..].find(&needle) {
        let idx = from + found;
        let after = idx + needle.len();
        let rest = raw[after..].trim_start();
        if rest.starts_with(':') || rest.is_empty() {
            best = Some(after);
        }
        from = idx + 1;
    }
    best
}

/// Decode a JSON string body that may be cut off anywhere, including in
/// the middle of an escape. Input starts just after the opening quote.
fn decode_partial_string(raw: &str) -> String {
    let mut out = String::new();
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => break,
            '\\' => {
                let Some(escaped) = chars.next() else {
                    // Trailing backslash at the cut point: drop it.
                    break;
                };
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{0008}'),
                    'f' => out.push('\u{000C}'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '/' => out.push('/'),
                    'u' => {
                        let hex: String = chars.clone().take(4).collect();
                        if hex.len() < 4 {
                            // Truncated \uXXXX: drop the incomplete escape.
                            break;
                        }
                        for _ in 0..4 {
                            chars.next();
                        }
                        match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                            Some(decoded) => out.push(decoded),
                            None => out.push('\u{FFFD}'),
                        }
                    }
                    other => out.push(other),
                }
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Decode a complete JSON string literal starting at the opening quote.
/// Returns the decoded value and the byte length consumed (including both
/// quotes), or `None` when the closing quote has not arrived yet.
fn decode_closed_string(raw: &str) -> Option<(String, usize)> {
    let mut out = String::new();
    let mut iter = raw.char_indices();
    let (_, first) = iter.next()?;
    if first != '"' {
        return None;
    }
    while let Some((idx, ch)) = iter.next() {
        match ch {
            '"' => return Some((out, idx + 1)),
            '\\' => {
                let (_, escaped) = iter.next()?;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{0008}'),
                    'f' => out.push('\u{000C}'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '/' => out.push('/'),
                    'u' => {
                        let mut hex = String::new();
                        for _ in 0..4 {
                            hex.push(iter.next()?.1);
                        }
                        match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                            Some(decoded) => out.push(decoded),
                            None => out.push('\u{FFFD}'),
                        }
                    }
                    other => out.push(other),
                }
            }
            _ => out.push(ch),
        }
    }
    None
}
