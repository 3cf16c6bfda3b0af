//! Command gating for process tools.
//!
//! An argv-style command is admitted only when its program is allowlisted,
//! the joined command matches no deny pattern, and the working directory is
//! inside the workspace. Raw shell strings additionally forbid shell
//! metacharacters outside quoted regions and are always approval-gated by
//! the runtime.

use crate::errors::{CodedError, ErrorCode};
use crate::safety::path;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// Deny patterns matched against the joined command string. The allowlist is
/// the primary gate; these catch destructive payloads smuggled through an
/// allowlisted program.
const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[a-zA-Z]*[rf][a-zA-Z]*\b",
    r"\brm\s+--(?:recursive|force)\b",
    r"\b(mkfs|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/(?:sd|nv|hd|vd)",
    r"\b(shutdown|reboot|poweroff)\b",
    r":\(\)\s*\{.{0,100}\};\s*:",
    r"\bsudo\b",
    r"\bdoas\b",
    r"\bchmod\b.*\b[0-7]*7[0-7]{2}\b",
    r"\bchmod\s+777\b",
    r"\bchown\b",
    r"\b(curl|wget)\b.*\|\s*(sh|bash|zsh|python)\b",
    r"\bbase64\b.*\|\s*(sh|bash|zsh)\b",
    r"\b(nc|ncat|netcat)\b.*-[elp]",
    r"\$\(",
    r"`[^`]+`",
];

static COMPILED_DENY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DENY_PATTERNS
        .iter()
        .map(|p| Regex::new(p).expect("deny pattern"))
        .collect()
});

fn command_blocked(reason: impl Into<String>, detail: impl Into<String>) -> CodedError {
    CodedError::new(ErrorCode::CommandBlocked, reason.into()).with_internal(detail.into())
}

pub struct CommandGuard {
    allowed: Vec<String>,
    deny: &'static [Regex],
}

impl CommandGuard {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed,
            deny: &COMPILED_DENY,
        }
    }

    pub fn allowed_commands(&self) -> &[String] {
        &self.allowed
    }

    /// Gate an argv-style invocation. `argv[0]` must be allowlisted (by
    /// basename), the joined command must clear the deny patterns, and `cwd`
    /// must resolve inside `workspace`.
    pub fn check_argv(
        &self,
        argv: &[String],
        cwd: &Path,
        workspace: &Path,
    ) -> Result<(), CodedError> {
        let Some(program) = argv.first() else {
            return Err(CodedError::new(ErrorCode::InvalidInput, "empty argv"));
        };
        let name = program.rsplit('/').next().unwrap_or(program);

        if !self.allowed.iter().any(|a| a == name) {
            return Err(command_blocked(
                format!("command '{}' is not allowed", name),
                format!("allowlist: {}", self.allowed.join(", ")),
            ));
        }

        let joined = argv.join(" ");
        self.check_deny(&joined)?;

        let cwd_str = cwd.to_string_lossy();
        if path::contain(&cwd_str, workspace).is_err() {
            return Err(command_blocked(
                "working directory is outside the workspace",
                format!("cwd: {}", cwd.display()),
            ));
        }

        Ok(())
    }

    /// Gate a raw shell string: deny patterns plus a scan for shell
    /// metacharacters outside quoted regions.
    pub fn check_shell(&self, command: &str) -> Result<(), CodedError> {
        // Line continuations would otherwise split tokens across the patterns.
        let command = command.replace("\\\n", " ");
        self.check_deny(&command)?;

        if let Some(ch) = unquoted_metacharacter(&command) {
            return Err(command_blocked(
                format!("shell metacharacter '{}' is not allowed", ch),
                command,
            ));
        }
        Ok(())
    }

    fn check_deny(&self, command: &str) -> Result<(), CodedError> {
        for pattern in self.deny {
            if pattern.is_match(command) {
                return Err(command_blocked(
                    "command blocked by security policy",
                    format!("pattern '{}' matched: {}", pattern.as_str(), command),
                ));
            }
        }
        Ok(())
    }
}

/// Find the first shell metacharacter outside single or double quotes,
/// honouring backslash escapes outside single quotes.
fn unquoted_metacharacter(command: &str) -> Option<char> {
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    for ch in command.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if !in_single => escaped = true,
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' | '&' | '|' | '`' | '$' | '(' | ')' | '<' | '>' | '\n'
                if !in_single && !in_double =>
            {
                return Some(ch)
            }
            _ => {}
        }
    }
    None
}
