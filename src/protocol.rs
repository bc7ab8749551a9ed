//! NNTP streaming-subset protocol tables and canned replies.

use std::borrow::Cow;

/// Response codes used by the transit subset, per RFC 3977 and RFC 4644.
pub mod codes {
    /// Help text follows (multi-line)
    pub const HELP_FOLLOWS: u16 = 100;
    /// Capability list follows (multi-line)
    pub const CAPABILITIES_FOLLOW: u16 = 101;
    /// Server ready, transit banner
    pub const SERVICE_READY: u16 = 200;
    /// MODE STREAM accepted
    pub const STREAMING_OK: u16 = 203;
    /// Connection closing
    pub const CLOSING: u16 = 205;
    /// Article transferred OK (IHAVE)
    pub const TRANSFER_OK: u16 = 235;
    /// Article transferred OK (TAKETHIS), or send it (CHECK)
    pub const TAKETHIS_OK: u16 = 239;
    /// Send article to be transferred (IHAVE continuation)
    pub const SEND_ARTICLE: u16 = 335;
    /// No article with that message-id (STAT/ARTICLE family)
    pub const NO_SUCH_ARTICLE: u16 = 430;
    /// Try again later (TAKETHIS/CHECK tempfail)
    pub const TRY_LATER: u16 = 431;
    /// Article not wanted, or syntax error in this dialect
    pub const NOT_WANTED: u16 = 435;
    /// Transfer failed, try again / do not pipeline IHAVE
    pub const TRANSFER_FAILED: u16 = 436;
    /// Article rejected, do not retry (IHAVE)
    pub const REJECTED: u16 = 437;
    /// Article not wanted (CHECK)
    pub const CHECK_NOT_WANTED: u16 = 438;
    /// Article rejected (TAKETHIS)
    pub const TAKETHIS_REJECTED: u16 = 439;
    /// Unknown command
    pub const UNKNOWN_COMMAND: u16 = 500;
    /// Unknown MODE variant
    pub const UNKNOWN_MODE: u16 = 501;
}

/// How the dispatcher handles a recognized command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Help,
    Capabilities,
    Mode,
    Quit,
    /// Forward to the hashed backend; reply only (CHECK, STAT)
    Simple,
    /// Forward, then expect the 335 send-now / body sequence
    Ihave,
    /// Forward the line followed immediately by its inline body
    Takethis,
}

/// One entry of the command table.
#[derive(Debug)]
pub struct CommandSpec {
    pub name: &'static str,
    pub kind: CommandKind,
    pub min_args: usize,
    pub max_args: usize,
    pub help: &'static str,
}

/// The streaming transit command set. HELP enumerates this table.
pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "help", kind: CommandKind::Help, min_args: 0, max_args: 0, help: "" },
    CommandSpec {
        name: "capabilities",
        kind: CommandKind::Capabilities,
        min_args: 0,
        max_args: 1,
        help: "[keyword]",
    },
    CommandSpec { name: "mode", kind: CommandKind::Mode, min_args: 1, max_args: 1, help: "stream" },
    CommandSpec { name: "quit", kind: CommandKind::Quit, min_args: 0, max_args: 0, help: "" },
    CommandSpec {
        name: "check",
        kind: CommandKind::Simple,
        min_args: 1,
        max_args: 1,
        help: "message-id",
    },
    CommandSpec {
        name: "ihave",
        kind: CommandKind::Ihave,
        min_args: 1,
        max_args: 1,
        help: "message-id",
    },
    CommandSpec {
        name: "stat",
        kind: CommandKind::Simple,
        min_args: 1,
        max_args: 1,
        help: "message-id",
    },
    CommandSpec {
        name: "takethis",
        kind: CommandKind::Takethis,
        min_args: 1,
        max_args: 1,
        help: "message-id",
    },
];

/// Look up a (lowercased) command keyword in the table.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.name == name)
}

/// Parse the 3-digit status prefix of a reply line. Returns 0 when the line
/// is too short or the prefix is not numeric; callers log that case but
/// still relay the line verbatim.
pub fn parse_status_code(line: &[u8]) -> u16 {
    if line.len() < 3 {
        return 0;
    }
    let mut code = 0u16;
    for &b in &line[..3] {
        if !b.is_ascii_digit() {
            return 0;
        }
        code = code * 10 + u16::from(b - b'0');
    }
    code
}

/// Multi-line `100` reply enumerating the command table.
pub fn help_reply() -> String {
    let mut reply = String::from("100 Legal commands\r\n");
    for spec in COMMANDS {
        let spc = if spec.help.is_empty() { "" } else { " " };
        reply.push_str(&format!("  {}{}{}\r\n", spec.name, spc, spec.help));
    }
    reply.push_str(".\r\n");
    reply
}

/// Fixed `101` capability block: transit mode offers ihave and streaming.
pub fn capabilities_reply() -> String {
    concat!(
        "101 Capability list:\r\n",
        "version 2\r\n",
        "implementation nntp-slb\r\n",
        "ihave\r\n",
        "streaming\r\n",
        ".\r\n"
    )
    .to_string()
}

/// Reply to `MODE <variant>`; only `stream` is understood.
pub fn mode_reply(variant: &str) -> &'static str {
    if variant.eq_ignore_ascii_case("stream") {
        "203 Streaming permitted\r\n"
    } else {
        "501 Unknown MODE variant\r\n"
    }
}

/// Strip trailing CR/LF for log display.
pub fn chomp(line: &[u8]) -> Cow<'_, str> {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\r' || line[end - 1] == b'\n') {
        end -= 1;
    }
    String::from_utf8_lossy(&line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_commands() {
        for name in ["help", "capabilities", "mode", "quit", "check", "ihave", "stat", "takethis"] {
            assert!(lookup(name).is_some(), "missing {name}");
        }
        assert!(lookup("article").is_none());
        // Lookup is on the already-lowercased keyword
        assert!(lookup("CHECK").is_none());
    }

    #[test]
    fn test_command_arities() {
        let check = lookup("check").unwrap();
        assert_eq!((check.min_args, check.max_args), (1, 1));
        let capa = lookup("capabilities").unwrap();
        assert_eq!((capa.min_args, capa.max_args), (0, 1));
        let quit = lookup("quit").unwrap();
        assert_eq!((quit.min_args, quit.max_args), (0, 0));
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code(b"238 <a@x>\r\n"), 238);
        assert_eq!(parse_status_code(b"335 send it\r\n"), 335);
        assert_eq!(parse_status_code(b"205\r\n"), 205);
    }

    #[test]
    fn test_parse_status_code_unparsable_is_zero() {
        assert_eq!(parse_status_code(b""), 0);
        assert_eq!(parse_status_code(b"2\r\n"), 0);
        assert_eq!(parse_status_code(b"ok then\r\n"), 0);
        assert_eq!(parse_status_code(b"2x8 nope\r\n"), 0);
    }

    #[test]
    fn test_help_reply_lists_every_command() {
        let help = help_reply();
        assert!(help.starts_with("100 Legal commands\r\n"));
        assert!(help.ends_with(".\r\n"));
        for spec in COMMANDS {
            assert!(help.contains(spec.name));
        }
        assert!(help.contains("  capabilities [keyword]\r\n"));
        assert!(help.contains("  quit\r\n"));
    }

    #[test]
    fn test_capabilities_reply_advertises_streaming() {
        let capa = capabilities_reply();
        assert!(capa.starts_with("101 "));
        assert!(capa.contains("ihave\r\n"));
        assert!(capa.contains("streaming\r\n"));
        assert!(capa.ends_with(".\r\n"));
    }

    #[test]
    fn test_mode_reply() {
        assert_eq!(mode_reply("stream"), "203 Streaming permitted\r\n");
        assert_eq!(mode_reply("STREAM"), "203 Streaming permitted\r\n");
        assert_eq!(mode_reply("reader"), "501 Unknown MODE variant\r\n");
    }

    #[test]
    fn test_chomp() {
        assert_eq!(chomp(b"200 ready\r\n"), "200 ready");
        assert_eq!(chomp(b"bare"), "bare");
        assert_eq!(chomp(b"\r\n"), "");
    }
}
