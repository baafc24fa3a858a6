//! Slash-command tokenizer. Interpretation lives in [`crate::commands`].

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Lowercased command name, without the leading slash.
    pub name: String,
    /// Whitespace-split arguments after the command name.
    pub args: Vec<String>,
    /// Everything after the command name with original spacing preserved,
    /// for search terms and free-text tails.
    pub raw_args: String,
}

/// `None` when the trimmed input does not start with `/` — the caller then
/// treats it as plain channel text.
pub fn parse(raw: &str) -> Option<ParsedCommand> {
    let trimmed = raw.trim();
    let rest = trimmed.strip_prefix('/')?;

    let mut tokens = rest.split_whitespace();
    let name = tokens.next().unwrap_or("").to_lowercase();
    let args: Vec<String> = tokens.map(str::to_string).collect();

    let raw_args = rest
        .split_once(char::is_whitespace)
        .map(|(_, tail)| tail.trim_start().to_string())
        .unwrap_or_default();

    Some(ParsedCommand {
        name,
        args,
        raw_args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_slash_input_is_not_a_command() {
        assert!(parse("hello world").is_none());
        assert!(parse("  plain text  ").is_none());
    }

    #[test]
    fn name_is_lowercased_and_args_split() {
        let cmd = parse("/JOIN #Lobby now").unwrap();
        assert_eq!(cmd.name, "join");
        assert_eq!(cmd.args, vec!["#Lobby", "now"]);
    }

    #[test]
    fn raw_args_preserves_inner_spacing() {
        let cmd = parse("/search two  spaced   words").unwrap();
        assert_eq!(cmd.raw_args, "two  spaced   words");
        assert_eq!(cmd.args.len(), 3);
    }

    #[test]
    fn bare_slash_parses_to_empty_name() {
        let cmd = parse("/").unwrap();
        assert_eq!(cmd.name, "");
        assert!(cmd.args.is_empty());
        assert_eq!(cmd.raw_args, "");
    }

    #[test]
    fn leading_whitespace_is_tolerated() {
        let cmd = parse("   /me waves").unwrap();
        assert_eq!(cmd.name, "me");
        assert_eq!(cmd.raw_args, "waves");
    }
}
