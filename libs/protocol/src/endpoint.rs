//! Endpoint Address Parsing
//!
//! Endpoints are hierarchical `/`-separated strings. The leading segment may
//! name a destination environment (`"browser/ui/refresh"`); anything else is
//! an ordinary local address (`"commands/ping"`). All prefix sniffing lives
//! in this module so the local-vs-forward decision has exactly one home.

use crate::context::Environment;

/// Path separator for endpoint segments
pub const SEPARATOR: char = '/';

/// Where an envelope should be dispatched relative to a local environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Dispatch through the local matcher
    Local,
    /// Forward to the named environment
    Remote(Environment),
}

impl Destination {
    pub fn is_local(&self) -> bool {
        matches!(self, Destination::Local)
    }
}

/// Get the leading path segment of an endpoint, if any
pub fn leading_segment(endpoint: &str) -> Option<&str> {
    endpoint
        .split(SEPARATOR)
        .next()
        .filter(|segment| !segment.is_empty())
}

/// Classify an endpoint's destination relative to the local environment
///
/// A missing prefix, an unknown leading name, or a prefix naming the local
/// environment itself all dispatch locally; only a prefix naming a different
/// environment forwards.
pub fn classify(endpoint: &str, local: Environment) -> Destination {
    match leading_segment(endpoint).and_then(Environment::parse) {
        Some(env) if env != local => Destination::Remote(env),
        _ => Destination::Local,
    }
}

/// Strip a leading environment segment, leaving the handler-relative path
///
/// `"server/commands/ping"` becomes `"commands/ping"`; endpoints without an
/// environment prefix are returned unchanged.
pub fn local_path(endpoint: &str) -> &str {
    match leading_segment(endpoint) {
        Some(segment) if Environment::parse(segment).is_some() => endpoint
            .strip_prefix(segment)
            .map(|rest| rest.trim_start_matches(SEPARATOR))
            .unwrap_or(endpoint),
        _ => endpoint,
    }
}

/// Iterate the proper prefixes of an endpoint, longest first
///
/// `"a/b/c"` yields `"a/b"` then `"a"`. The matcher walks this order when no
/// exact registration exists, dropping trailing segments until a registered
/// prefix is found.
pub fn proper_prefixes(endpoint: &str) -> impl Iterator<Item = &str> {
    endpoint
        .char_indices()
        .rev()
        .filter(|(_, c)| *c == SEPARATOR)
        .map(|(i, _)| &endpoint[..i])
        .filter(|prefix| !prefix.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_segment() {
        assert_eq!(leading_segment("commands/ping"), Some("commands"));
        assert_eq!(leading_segment("commands"), Some("commands"));
        assert_eq!(leading_segment(""), None);
        assert_eq!(leading_segment("/commands"), None);
    }

    #[test]
    fn test_classify_missing_prefix() {
        assert_eq!(
            classify("commands/ping", Environment::Server),
            Destination::Local
        );
        assert_eq!(classify("", Environment::Server), Destination::Local);
    }

    #[test]
    fn test_classify_unknown_environment_name() {
        // "commands" is not an environment, so the endpoint is local
        assert_eq!(
            classify("commands/ping", Environment::Browser),
            Destination::Local
        );
        assert_eq!(
            classify("mainframe/ping", Environment::Server),
            Destination::Local
        );
    }

    #[test]
    fn test_classify_own_environment() {
        assert_eq!(
            classify("server/commands/ping", Environment::Server),
            Destination::Local
        );
    }

    #[test]
    fn test_classify_remote_environment() {
        assert_eq!(
            classify("browser/ui/refresh", Environment::Server),
            Destination::Remote(Environment::Browser)
        );
        assert_eq!(
            classify("server/commands/ping", Environment::Cli),
            Destination::Remote(Environment::Server)
        );
    }

    #[test]
    fn test_local_path_strips_environment_only() {
        assert_eq!(local_path("server/commands/ping"), "commands/ping");
        assert_eq!(local_path("commands/ping"), "commands/ping");
        assert_eq!(local_path("server"), "");
    }

    #[test]
    fn test_proper_prefixes_longest_first() {
        let prefixes: Vec<&str> = proper_prefixes("a/b/c").collect();
        assert_eq!(prefixes, vec!["a/b", "a"]);

        let none: Vec<&str> = proper_prefixes("a").collect();
        assert!(none.is_empty());
    }
}
