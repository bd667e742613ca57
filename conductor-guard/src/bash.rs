/// Characters that delimit a token inside a shell command line. Quoting,
/// redirection, assignment and path separators all count as boundaries so
/// that `cat ./config.yaml` matches a `config.yaml` deny token while
/// `myconfig.yaml` does not.
fn is_boundary(c: char) -> bool {
    c.is_whitespace()
        || matches!(
            c,
            '/' | '"' | '\'' | '`' | '=' | '>' | '<' | '|' | ';' | '&' | '(' | ')' | ','
        )
}

fn normalize(s: &str) -> String {
    s.to_lowercase().replace(['-', '_'], "")
}

/// Word-boundary deny-token match over a raw command string. Comparison is
/// case-insensitive and treats `-` and `_` as equivalent.
pub fn command_matches_deny_token(command: &str, token: &str) -> bool {
    let token = token.trim();
    if token.is_empty() || command.trim().is_empty() {
        return false;
    }
    let normalized_token = normalize(token);
    command
        .split(is_boundary)
        .filter(|word| !word.is_empty())
        .any(|word| normalize(word) == normalized_token)
}

/// First deny token matched by any word of the command, if any.
pub fn first_denied_token<'a>(command: &str, deny_tokens: &'a [String]) -> Option<&'a str> {
    deny_tokens
        .iter()
        .map(String::as_str)
        .find(|token| command_matches_deny_token(command, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_through_path_separators() {
        assert!(command_matches_deny_token("cat ./config.yaml", "config.yaml"));
        assert!(command_matches_deny_token("cat /etc/config.yaml", "config.yaml"));
    }

    #[test]
    fn does_not_match_inside_longer_words() {
        assert!(!command_matches_deny_token("cat myconfig.yaml", "config.yaml"));
        assert!(!command_matches_deny_token("cat config.yaml.bak", "config.yaml"));
    }

    #[test]
    fn matches_through_quoting_redirection_and_assignment() {
        assert!(command_matches_deny_token("cat \"config.yaml\"", "config.yaml"));
        assert!(command_matches_deny_token("cat 'config.yaml'", "config.yaml"));
        assert!(command_matches_deny_token("cat x > config.yaml", "config.yaml"));
        assert!(command_matches_deny_token("FILE=config.yaml cat", "config.yaml"));
        assert!(command_matches_deny_token("a;config.yaml;b", "config.yaml"));
    }

    #[test]
    fn stable_under_case_and_separator_swaps() {
        assert!(command_matches_deny_token("cat API_KEY.txt", "api-key.txt"));
        assert!(command_matches_deny_token("cat Config.YAML", "config.yaml"));
        assert!(command_matches_deny_token("cat config_yaml", "CONFIG-YAML"));
    }

    #[test]
    fn empty_inputs_never_match() {
        assert!(!command_matches_deny_token("", "config.yaml"));
        assert!(!command_matches_deny_token("cat config.yaml", ""));
        assert!(!command_matches_deny_token("   ", "  "));
    }

    #[test]
    fn first_denied_token_reports_the_match() {
        let tokens = vec!["secrets.env".to_string(), "config.yaml".to_string()];
        assert_eq!(
            first_denied_token("cat ./config.yaml", &tokens),
            Some("config.yaml")
        );
        assert_eq!(first_denied_token("ls -la", &tokens), None);
    }
}
