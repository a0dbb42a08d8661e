//! Property-based checks for idempotency-key embedding (§8.9): for any
//! comment a caller might supply, the embedded result must stay within the
//! terminal's comment limit and must still yield back the same request id.

use mt5_bridge::request_id::{embed_request_id, extract_request_id, generate_request_id};
use proptest::prelude::*;

proptest! {
    #[test]
    fn embed_always_fits_terminal_comment_limit(comment in "\\PC{0,200}") {
        let id = generate_request_id();
        let embedded = embed_request_id(&id, &comment);
        prop_assert!(embedded.len() <= 31);
    }

    #[test]
    fn embed_then_extract_always_recovers_the_request_id(comment in "[a-zA-Z0-9 ]{0,60}") {
        let id = generate_request_id();
        let embedded = embed_request_id(&id, &comment);
        prop_assert_eq!(extract_request_id(&embedded), Some(id.as_str()));
    }

    #[test]
    fn extract_never_panics_on_arbitrary_input(comment in "\\PC{0,200}") {
        let _ = extract_request_id(&comment);
    }
}
