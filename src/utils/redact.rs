//! Scrubbing of internal detail from text that is about to leave the process.
//!
//! Applied exactly at the gateway serialization boundary so internal logs stay
//! faithful: absolute filesystem paths collapse to `[path]`, UUIDs to `[id]`,
//! and anything authentication-flavoured to one generic message that does not
//! reveal whether the token, the client, or the method was the problem.

use crate::errors::{CodedError, ErrorCode};
use regex::Regex;
use std::sync::LazyLock;

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w.@~-]+){2,}").expect("path regex"));

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .expect("uuid regex")
});

/// Replace absolute paths and UUIDs in free text.
pub fn scrub_text(msg: &str) -> String {
    let no_paths = PATH_RE.replace_all(msg, "[path]");
    UUID_RE.replace_all(&no_paths, "[id]").into_owned()
}

/// Produce the outward-facing form of an error: scrubbed message, no internal
/// diagnostic, auth errors collapsed to a single generic message.
pub fn scrub_error(err: &CodedError) -> CodedError {
    match err.code {
        ErrorCode::AuthFailed | ErrorCode::Unauthorized => CodedError::new(
            ErrorCode::AuthFailed,
            "authentication failed",
        ),
        code => CodedError::new(code, scrub_text(&err.message)),
    }
}
