//! Input normalization and bound checks for aliases, channel names and
//! message bodies. Everything else on the wire is trim-only.

pub const MAX_ALIAS_LEN: usize = 24;
pub const MAX_BODY_LEN: usize = 2000;
pub const MAX_CHANNEL_LEN: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateError {
    Empty,
    TooLong,
    ControlChars,
    BadFormat,
}

impl ValidateError {
    pub fn message(&self, what: &str) -> String {
        match self {
            Self::Empty => format!("{what} must not be empty"),
            Self::TooLong => format!("{what} is too long"),
            Self::ControlChars => format!("{what} contains control characters"),
            Self::BadFormat => format!("{what} is malformed"),
        }
    }
}

/// Alias: trimmed, non-empty, at most 24 runes, no C0 controls or DEL.
pub fn alias(input: &str) -> Result<String, ValidateError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidateError::Empty);
    }
    if trimmed.chars().count() > MAX_ALIAS_LEN {
        return Err(ValidateError::TooLong);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ValidateError::ControlChars);
    }
    Ok(trimmed.to_string())
}

/// Channel: trimmed, `#` followed by 1..=48 of `[A-Za-z0-9_-]`, lowercased.
pub fn channel(input: &str) -> Result<String, ValidateError> {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix('#') else {
        return Err(ValidateError::BadFormat);
    };
    if rest.is_empty() {
        return Err(ValidateError::Empty);
    }
    if rest.len() > MAX_CHANNEL_LEN {
        return Err(ValidateError::TooLong);
    }
    if !rest
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(ValidateError::BadFormat);
    }
    Ok(trimmed.to_lowercase())
}

/// Message body: trimmed, non-empty, at most 2000 runes, no C0 controls
/// except TAB.
pub fn message_body(input: &str) -> Result<String, ValidateError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ValidateError::Empty);
    }
    if trimmed.chars().count() > MAX_BODY_LEN {
        return Err(ValidateError::TooLong);
    }
    if trimmed.chars().any(|c| c.is_control() && c != '\t') {
        return Err(ValidateError::ControlChars);
    }
    Ok(trimmed.to_string())
}

/// Generic text: trim only, never fails.
pub fn text(input: &str) -> String {
    input.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_boundary_at_24_runes() {
        let ok = "a".repeat(24);
        assert_eq!(alias(&ok).unwrap(), ok);
        assert_eq!(alias(&"a".repeat(25)).unwrap_err(), ValidateError::TooLong);
    }

    #[test]
    fn alias_counts_runes_not_bytes() {
        // 24 multi-byte characters are fine even though they exceed 24 bytes.
        let unicode = "é".repeat(24);
        assert!(alias(&unicode).is_ok());
    }

    #[test]
    fn alias_rejects_controls_and_empties() {
        assert_eq!(alias("   ").unwrap_err(), ValidateError::Empty);
        assert_eq!(alias("a\x01b").unwrap_err(), ValidateError::ControlChars);
        assert_eq!(alias("a\x7fb").unwrap_err(), ValidateError::ControlChars);
    }

    #[test]
    fn channel_lowercases_and_checks_charset() {
        assert_eq!(channel("  #Lobby ").unwrap(), "#lobby");
        assert_eq!(channel("#a-b_c9").unwrap(), "#a-b_c9");
        assert_eq!(channel("lobby").unwrap_err(), ValidateError::BadFormat);
        assert_eq!(channel("#").unwrap_err(), ValidateError::Empty);
        assert_eq!(channel("#with space").unwrap_err(), ValidateError::BadFormat);
        assert_eq!(
            channel(&format!("#{}", "x".repeat(49))).unwrap_err(),
            ValidateError::TooLong
        );
        assert!(channel(&format!("#{}", "x".repeat(48))).is_ok());
    }

    #[test]
    fn body_boundary_at_2000_runes() {
        assert!(message_body(&"x".repeat(2000)).is_ok());
        assert_eq!(
            message_body(&"x".repeat(2001)).unwrap_err(),
            ValidateError::TooLong
        );
    }

    #[test]
    fn body_allows_tab_but_no_other_controls() {
        assert!(message_body("col1\tcol2").is_ok());
        assert_eq!(
            message_body("line1\nline2").unwrap_err(),
            ValidateError::ControlChars
        );
        assert_eq!(message_body("").unwrap_err(), ValidateError::Empty);
    }

    #[test]
    fn text_trims_and_never_fails() {
        assert_eq!(text("  hi  "), "hi");
        assert_eq!(text(""), "");
    }
}
