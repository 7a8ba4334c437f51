//! Compiled regex patterns for parsing agent runtime artifacts.
//!
//! Compiled once on first use. Update these when the runtime's log line
//! format, title conventions or CLI flags change.

use once_cell::sync::Lazy;
use regex::Regex;

// ═══════════════════════════════════════════════════════════════════════════════
// Activity Log Regexes
// ═══════════════════════════════════════════════════════════════════════════════

/// `INFO  2026-02-24T20:34:51 +499ms service=bus type=message.updated publishing`
pub static RE_LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\w+)\s+(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})\s+\+(\d+)m?s\s+(.*)$").unwrap()
});
pub static RE_COMMAND_QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bcommand="([^"]+)""#).unwrap());
pub static RE_COMMAND_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bcommand=(\S+)").unwrap());
pub static RE_CMD_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bcmd="([^"]+)""#).unwrap());
pub static RE_CMD_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bcmd=(\S+)").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Session Title Regexes
// ═══════════════════════════════════════════════════════════════════════════════

/// `Refactor parser (fork #2)` -> base title `Refactor parser`
pub static RE_FORK_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?)\s*\(fork #(\d+)\)$").unwrap());
/// `Scan for callers (@explore subagent)` -> agent type `explore`
pub static RE_SUBAGENT_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(@(\S+)\s+subagent\)\s*$").unwrap());

// ═══════════════════════════════════════════════════════════════════════════════
// Process Command Line Regexes
// ═══════════════════════════════════════════════════════════════════════════════

pub static RE_SESSION_ARG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(?:-s|--session)[\s=]+(ses_[A-Za-z0-9_\-]+)").unwrap());

/// Splits `"Title (fork #3)"` into its base title, if it is a fork title.
pub fn fork_base_title(title: &str) -> Option<&str> {
    RE_FORK_TITLE
        .captures(title)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Splits a subagent title into `(agent_type, description)`.
pub fn parse_subagent_title(title: &str) -> Option<(String, String)> {
    let caps = RE_SUBAGENT_TITLE.captures(title)?;
    let whole = caps.get(0)?;
    let agent_type = caps.get(1)?.as_str().to_string();
    let description = title[..whole.start()].trim().to_string();
    Some((agent_type, description))
}

/// Extracts the session id passed on an agent command line.
pub fn session_id_from_command(command: &str) -> Option<String> {
    RE_SESSION_ARG
        .captures(command)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_titles_split_into_base() {
        assert_eq!(
            fork_base_title("Refactor parser (fork #2)"),
            Some("Refactor parser")
        );
        assert_eq!(fork_base_title("Refactor parser"), None);
    }

    #[test]
    fn subagent_titles_yield_type_and_description() {
        let (kind, desc) =
            parse_subagent_title("Scan for callers (@explore subagent)").expect("subagent");
        assert_eq!(kind, "explore");
        assert_eq!(desc, "Scan for callers");
        assert!(parse_subagent_title("Plain title").is_none());
    }

    #[test]
    fn session_argument_is_found_in_either_flag_form() {
        assert_eq!(
            session_id_from_command("/usr/bin/opencode -s ses_abc123 --port 4000"),
            Some("ses_abc123".to_string())
        );
        assert_eq!(
            session_id_from_command("opencode --session ses_X-9"),
            Some("ses_X-9".to_string())
        );
        assert_eq!(session_id_from_command("opencode serve"), None);
    }
}
