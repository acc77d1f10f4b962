use tracing::{debug, error, info, trace, warn};

pub const NODE_LOG_TARGET: &str = "reader::node";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl NodeLogLevel {
    fn parse(token: &str) -> Option<Self> {
        let token = token.trim_matches(|c: char| c == '[' || c == ']' || c == ':');
        match token.to_ascii_uppercase().as_str() {
            "TRACE" => Some(Self::Trace),
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERROR" | "ERRO" | "CRIT" | "FATAL" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A node log line with its own timestamp and colouring removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLogLine {
    pub level: NodeLogLevel,
    pub message: String,
}

impl NodeLogLine {
    pub fn parse(raw: &str) -> Self {
        let clean = strip_ansi(raw);
        let mut rest = clean.trim();

        if let Some((first, tail)) = split_token(rest) {
            if looks_like_timestamp(first) {
                rest = tail;
            }
        }

        let mut level = NodeLogLevel::Info;
        if let Some((first, tail)) = split_token(rest) {
            if let Some(parsed) = NodeLogLevel::parse(first) {
                level = parsed;
                rest = tail;
            }
        }

        Self {
            level,
            message: rest.to_string(),
        }
    }

    pub fn emit(&self) {
        let message = self.message.as_str();
        match self.level {
            NodeLogLevel::Trace => trace!(target: NODE_LOG_TARGET, "{message}"),
            NodeLogLevel::Debug => debug!(target: NODE_LOG_TARGET, "{message}"),
            NodeLogLevel::Info => info!(target: NODE_LOG_TARGET, "{message}"),
            NodeLogLevel::Warn => warn!(target: NODE_LOG_TARGET, "{message}"),
            NodeLogLevel::Error => error!(target: NODE_LOG_TARGET, "{message}"),
        }
    }
}

fn split_token(s: &str) -> Option<(&str, &str)> {
    if s.is_empty() {
        return None;
    }
    match s.split_once(char::is_whitespace) {
        Some((first, tail)) => Some((first, tail.trim_start())),
        None => Some((s, "")),
    }
}

fn looks_like_timestamp(token: &str) -> bool {
    let token = token.trim_start_matches('[');
    token.starts_with(|c: char| c.is_ascii_digit())
        && token.contains(|c: char| c == '-' || c == ':')
}

/// Removes CSI escape sequences such as colour codes.
fn strip_ansi(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            // parameters and intermediates run until a final byte in '@'..='~'
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_line() {
        let line = NodeLogLine::parse(
            "2024-03-01T10:00:00.123456Z  WARN sui_node::checkpoints: lagging behind peers=3",
        );
        assert_eq!(line.level, NodeLogLevel::Warn);
        assert_eq!(line.message, "sui_node::checkpoints: lagging behind peers=3");
    }

    #[test]
    fn test_parse_coloured_line() {
        let line = NodeLogLine::parse(
            "\u{1b}[2m2024-03-01T10:00:00Z\u{1b}[0m \u{1b}[31mERROR\u{1b}[0m state sync failed",
        );
        assert_eq!(line.level, NodeLogLevel::Error);
        assert_eq!(line.message, "state sync failed");
    }

    #[test]
    fn test_parse_plain_line_defaults_to_info() {
        let line = NodeLogLine::parse("starting node version 1.22.0");
        assert_eq!(line.level, NodeLogLevel::Info);
        assert_eq!(line.message, "starting node version 1.22.0");

        let line = NodeLogLine::parse("[2024-03-01T10:00:00Z] debug: dialing peer");
        assert_eq!(line.level, NodeLogLevel::Debug);
        assert_eq!(line.message, "dialing peer");
    }

    #[test]
    fn test_parse_empty_line() {
        let line = NodeLogLine::parse("   ");
        assert_eq!(line.level, NodeLogLevel::Info);
        assert_eq!(line.message, "");
    }
}
