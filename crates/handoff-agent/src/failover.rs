/// Determines whether a host-reported session error is transient, i.e. a
/// provider-side condition that another model may not share.
///
/// Returns `true` for rate limits (429), authentication (401), quota,
/// overload, timeouts and server errors (5xx). Returns `false` for client
/// errors like 400 which will fail the same way on any model.
pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    let has_code = |codes: &[&str]| status_tokens(&lower).any(|t| codes.iter().any(|c| *c == t));

    // Non-retryable patterns checked first
    if has_code(FATAL_CODES) || lower.contains("context length") {
        return false;
    }

    has_code(RETRYABLE_CODES)
        || lower.contains("rate limit")
        || lower.contains("quota")
        || lower.contains("overloaded")
        || lower.contains("timeout")
        || lower.contains("timed out")
}

const FATAL_CODES: &[&str] = &["400"];

const RETRYABLE_CODES: &[&str] = &["401", "429", "500", "502", "503", "504", "529", "5xx"];

/// Alphanumeric runs of the message. Status codes only match a whole run,
/// so `4000ms` is not a 400.
fn status_tokens(lower: &str) -> impl Iterator<Item = &str> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_retryable_classification() {
        // Retryable
        assert!(is_retryable("429 Too Many Requests"));
        assert!(is_retryable("401 Unauthorized"));
        assert!(is_retryable("Rate limit reached for gpt-5.2"));
        assert!(is_retryable("insufficient_quota"));
        assert!(is_retryable("Overloaded"));
        assert!(is_retryable("timeout waiting for response"));
        assert!(is_retryable("503 Service Unavailable"));
        assert!(is_retryable("529 overloaded_error"));

        // Not retryable
        assert!(!is_retryable("400 Bad Request"));
        assert!(!is_retryable("prompt exceeds context length"));
        assert!(!is_retryable("tool 'bash' exited with status 1"));
    }

    #[test]
    fn status_codes_match_whole_tokens() {
        assert!(is_retryable("request timed out after 4000ms"));
        assert!(is_retryable("HTTP_429: slow down"));
        assert!(is_retryable("upstream error (502)"));
        assert!(!is_retryable("response truncated at 5000 tokens"));
        assert!(!is_retryable("invalid request id 15290"));
        assert!(!is_retryable("status=400 bad tool schema"));
    }
}
