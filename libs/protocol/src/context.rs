//! Execution Context Identity
//!
//! A context is one running instance of the system: the backend process, a
//! UI runtime, or a command-line client. Contexts are immutable after
//! creation and travel inside every envelope so receivers know who sent it.

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Environment kind a context runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Backend process
    Server,
    /// UI runtime
    Browser,
    /// Command-line client
    Cli,
}

impl Environment {
    /// Wire-format name of this environment
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Server => "server",
            Environment::Browser => "browser",
            Environment::Cli => "cli",
        }
    }

    /// Parse an environment name, returning `None` for unknown names
    ///
    /// Endpoint classification uses this to distinguish an environment
    /// prefix from an ordinary path segment, so unknown names are not an
    /// error here.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "server" => Some(Environment::Server),
            "browser" => Some(Environment::Browser),
            "cli" => Some(Environment::Cli),
            _ => None,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ProtocolError::UnknownEnvironment(s.to_string()))
    }
}

/// Identity of one running instance: a unique id plus its environment kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    uuid: Uuid,
    environment: Environment,
}

impl Context {
    /// Create a context with a fresh random id
    pub fn new(environment: Environment) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            environment,
        }
    }

    /// Create a context with a known id (peer contexts reconstructed from
    /// the wire)
    pub fn with_uuid(uuid: Uuid, environment: Environment) -> Self {
        Self { uuid, environment }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.environment, self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_round_trip() {
        for env in [Environment::Server, Environment::Browser, Environment::Cli] {
            assert_eq!(Environment::parse(env.as_str()), Some(env));
        }
    }

    #[test]
    fn test_unknown_environment() {
        assert_eq!(Environment::parse("mainframe"), None);

        let err = "mainframe".parse::<Environment>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEnvironment(_)));
    }

    #[test]
    fn test_environment_serde_lowercase() {
        let json = serde_json::to_string(&Environment::Browser).unwrap();
        assert_eq!(json, "\"browser\"");

        let parsed: Environment = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(parsed, Environment::Server);
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = Context::new(Environment::Server);
        let b = Context::new(Environment::Server);
        assert_ne!(a.uuid(), b.uuid());
    }

    #[test]
    fn test_context_wire_shape() {
        let ctx = Context::new(Environment::Cli);
        let value = serde_json::to_value(&ctx).unwrap();
        assert!(value.get("uuid").is_some());
        assert_eq!(value["environment"], "cli");
    }
}
