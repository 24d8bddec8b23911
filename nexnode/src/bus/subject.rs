//! Subject grammar: dot-separated tokens. In subscription patterns `*`
//! matches exactly one token and `>` matches one or more trailing tokens.
//! Published subjects are always literal.

/// A literal subject: non-empty tokens, no wildcards.
pub fn valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">")
}

/// A subscription pattern: non-empty tokens, `>` only in last position.
pub fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    tokens
        .iter()
        .enumerate()
        .all(|(i, t)| !t.is_empty() && (*t != ">" || i == tokens.len() - 1))
}

/// Whether a literal subject is covered by a subscription pattern.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects() {
        assert!(valid_subject("agentint.vm-1.deploy"));
        assert!(valid_subject("t.a"));
        assert!(!valid_subject(""));
        assert!(!valid_subject("t..b"));
        assert!(!valid_subject("t.*"));
        assert!(!valid_subject("t.>"));
    }

    #[test]
    fn patterns() {
        assert!(valid_pattern("agentint.*.events.*"));
        assert!(valid_pattern("$NEX.events.>"));
        assert!(valid_pattern("t.a"));
        assert!(!valid_pattern(""));
        assert!(!valid_pattern("a..b"));
        assert!(!valid_pattern(">.a"));
    }

    #[test]
    fn exact_match() {
        assert!(subject_matches("t.a", "t.a"));
        assert!(!subject_matches("t.a", "t.b"));
        assert!(!subject_matches("t.a", "t.a.c"));
        assert!(!subject_matches("t.a.c", "t.a"));
    }

    #[test]
    fn star_matches_one_token() {
        assert!(subject_matches("agentint.*.deploy", "agentint.vm-1.deploy"));
        assert!(!subject_matches("agentint.*.deploy", "agentint.vm-1.undeploy"));
        assert!(!subject_matches("agentint.*.deploy", "agentint.deploy"));
        assert!(subject_matches("agentint.*.events.*", "agentint.vm-1.events.started"));
        assert!(!subject_matches("agentint.*.events.*", "agentint.vm-1.events"));
    }

    #[test]
    fn gt_matches_remainder() {
        assert!(subject_matches("$NEX.events.>", "$NEX.events.default.machine_stopped"));
        assert!(subject_matches("$NEX.events.>", "$NEX.events.x"));
        assert!(!subject_matches("$NEX.events.>", "$NEX.events"));
        assert!(subject_matches(">", "anything.at.all"));
    }
}
