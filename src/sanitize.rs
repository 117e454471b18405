#![forbid(unsafe_code)]

// Input sanitization - length and character constraints for free-text fields.
// All room-registry and chat operations pass their inputs through this gate
// before use; a None here surfaces to the sender as a validation error.

/// Maximum chat message length after trimming.
pub const MAX_MSG_LEN: usize = 500;
/// Maximum nickname length after trimming.
pub const MAX_NICK_LEN: usize = 20;
/// Maximum room name length after trimming.
pub const MAX_ROOM_LEN: usize = 30;
/// Maximum room password length. Passwords are length-checked only.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Nickname used when the client sends none.
pub const DEFAULT_NICKNAME: &str = "Anonymous";

/// Trims whitespace, rejects empty or over-length input, and strips angle
/// brackets so stored text can never smuggle markup into a client.
pub fn sanitize(input: &str, max_len: usize) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed.chars().count() > max_len {
        return None;
    }
    Some(trimmed.replace(['<', '>'], ""))
}

/// Nickname gate: absent or blank nicknames fall back to the placeholder.
pub fn sanitize_nickname(input: Option<&str>) -> Option<String> {
    match input {
        Some(s) if !s.trim().is_empty() => sanitize(s, MAX_NICK_LEN),
        _ => Some(DEFAULT_NICKNAME.to_string()),
    }
}

/// Passwords are not content-filtered, only bounded.
pub fn password_ok(password: &str) -> bool {
    !password.is_empty() && password.len() <= MAX_PASSWORD_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_strips_angle_brackets() {
        assert_eq!(sanitize("  hi <b>there</b>  ", 50).unwrap(), "hi bthere/b");
    }

    #[test]
    fn rejects_empty_and_whitespace_only() {
        assert!(sanitize("", 10).is_none());
        assert!(sanitize("   \t  ", 10).is_none());
    }

    #[test]
    fn rejects_over_length_after_trim() {
        assert!(sanitize("abcdef", 5).is_none());
        assert!(sanitize("  abcde  ", 5).is_some());
    }

    #[test]
    fn length_checked_before_stripping() {
        // Stripping happens after the length check, matching the original
        // behavior: a string of 6 brackets over a cap of 5 is rejected even
        // though it would strip to nothing.
        assert!(sanitize("<<<>>>", 5).is_none());
    }

    #[test]
    fn nickname_defaults_when_absent_or_blank() {
        assert_eq!(sanitize_nickname(None).unwrap(), DEFAULT_NICKNAME);
        assert_eq!(sanitize_nickname(Some("   ")).unwrap(), DEFAULT_NICKNAME);
        assert_eq!(sanitize_nickname(Some("ada")).unwrap(), "ada");
    }

    #[test]
    fn nickname_too_long_is_rejected_not_defaulted() {
        assert!(sanitize_nickname(Some(&"x".repeat(MAX_NICK_LEN + 1))).is_none());
    }

    #[test]
    fn password_bounds() {
        assert!(!password_ok(""));
        assert!(password_ok("p"));
        assert!(password_ok(&"p".repeat(MAX_PASSWORD_LEN)));
        assert!(!password_ok(&"p".repeat(MAX_PASSWORD_LEN + 1)));
    }
}
