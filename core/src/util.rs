use std::time::Duration;

use tokio::sync::watch;

/// Resolve once the cancel flag flips to true. If the sender disappears
/// without canceling, never resolves.
pub(crate) async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Initial delay for model-request retries.
pub(crate) const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
/// Upper bound for model-request retry delays.
pub(crate) const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);

/// Exponential backoff for the n-th retry (1-based): 500ms, 1s, 2s, ...
/// capped at 8s.
pub(crate) fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(10);
    let delay = RETRY_INITIAL_DELAY.saturating_mul(1u32 << exp);
    delay.min(RETRY_MAX_DELAY)
}

/// Backoff before re-requesting a plan after a validation failure
/// (1-based attempt): 250ms, 500ms, 1s, 2s, then 4s forever.
pub(crate) fn validation_backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(250);
    let exp = attempt.saturating_sub(1).min(10);
    let delay = base.saturating_mul(1u32 << exp);
    delay.clamp(base, Duration::from_secs(4))
}

/// Truncate to a prefix of at most `maxb` bytes without splitting a char.
pub(crate) fn take_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut last_ok = 0;
    for (i, ch) in s.char_indices() {
        let nb = i + ch.len_utf8();
        if nb > maxb {
            break;
        }
        last_ok = nb;
    }
    &s[..last_ok]
}

/// Take a suffix of at most `maxb` bytes without splitting a char.
pub(crate) fn take_last_bytes_at_char_boundary(s: &str, maxb: usize) -> &str {
    if s.len() <= maxb {
        return s;
    }
    let mut start = s.len();
    let mut used = 0usize;
    for (i, ch) in s.char_indices().rev() {
        let nb = ch.len_utf8();
        if used + nb > maxb {
            break;
        }
        start = i;
        used += nb;
        if start == 0 {
            break;
        }
    }
    &s[start..]
}

/// Truncate to at most `max_chars` characters, appending an ellipsis when
/// anything was cut.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub(crate) fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
