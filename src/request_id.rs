//! Idempotency-key embedding for order-submission requests (§3, §4.7, §8.9).
//!
//! Order comment fields are limited to 31 characters by the terminal, so the
//! request id is a compact 18-character token — `"RQ"` followed by 16 hex
//! digits (64 bits of entropy) — prefixed onto whatever comment the caller
//! supplied, truncated to fit.

use rand::RngCore;

use crate::error::BridgeError;

const PREFIX: &str = "RQ";
const ID_LEN: usize = 18;
const HEX_LEN: usize = 16;
const MAX_COMMENT_LEN: usize = 31;

/// Generates a fresh request id: `"RQ"` + 16 lowercase hex digits.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(ID_LEN);
    id.push_str(PREFIX);
    for b in bytes {
        id.push_str(&format!("{b:02x}"));
    }
    id
}

/// Embeds `request_id` into `comment`, truncating the caller's comment so the
/// combined field never exceeds the terminal's 31-character limit.
///
/// The id is always placed first so `extract_request_id` can find it
/// regardless of how much of the original comment survived truncation.
pub fn embed_request_id(request_id: &str, comment: &str) -> String {
    debug_assert_eq!(request_id.len(), ID_LEN);
    if comment.is_empty() {
        return request_id.to_string();
    }
    let budget = MAX_COMMENT_LEN.saturating_sub(ID_LEN + 1);
    let mut truncated = comment.to_string();
    if truncated.len() > budget {
        let mut boundary = budget;
        while boundary > 0 && !truncated.is_char_boundary(boundary) {
            boundary -= 1;
        }
        truncated.truncate(boundary);
    }
    format!("{request_id}|{truncated}")
}

/// Extracts a previously embedded request id from an order comment,
/// validating the exact length, prefix, and hex digits — returns `None` for
/// any comment that was not produced by [`embed_request_id`].
pub fn extract_request_id(comment: &str) -> Option<&str> {
    let candidate = comment.split('|').next().unwrap_or(comment);
    if candidate.len() != ID_LEN {
        return None;
    }
    if !candidate.starts_with(PREFIX) {
        return None;
    }
    let hex_part = &candidate[PREFIX.len()..];
    if hex_part.len() != HEX_LEN || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(candidate)
}

/// Validates that `request_id` has the exact shape [`generate_request_id`]
/// produces, without requiring it be embedded in a comment.
pub fn is_valid_request_id(request_id: &str) -> Result<(), BridgeError> {
    if extract_request_id(request_id) == Some(request_id) {
        Ok(())
    } else {
        Err(BridgeError::Operation(format!(
            "malformed request id: {request_id:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_have_expected_shape() {
        let id = generate_request_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.starts_with(PREFIX));
        assert!(is_valid_request_id(&id).is_ok());
    }

    #[test]
    fn generated_ids_are_collision_resistant_in_practice() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate_request_id()));
        }
    }

    #[test]
    fn embed_then_extract_roundtrips() {
        let id = generate_request_id();
        let embedded = embed_request_id(&id, "my strategy comment");
        assert_eq!(extract_request_id(&embedded), Some(id.as_str()));
    }

    #[test]
    fn embed_never_exceeds_terminal_comment_limit() {
        let id = generate_request_id();
        let long_comment = "x".repeat(100);
        let embedded = embed_request_id(&id, &long_comment);
        assert!(embedded.len() <= MAX_COMMENT_LEN);
    }

    #[test]
    fn embed_with_empty_comment_is_just_the_id() {
        let id = generate_request_id();
        assert_eq!(embed_request_id(&id, ""), id);
    }

    #[test]
    fn extract_rejects_foreign_comments() {
        assert_eq!(extract_request_id("just a normal comment"), None);
        assert_eq!(extract_request_id("RQshort"), None);
        assert_eq!(extract_request_id("XXdeadbeefdeadbeef"), None);
        assert_eq!(extract_request_id("RQdeadbeefdeadbezz"), None);
    }
}
