use std::fmt;
use std::hash::{Hash, Hasher};

use federa_error::{ConnectorError, Result};
use serde::{Deserialize, Serialize};

/// How a connector buckets pooled connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// Every caller shares one bucket.
    #[default]
    Singleton,
    /// One bucket per authenticated principal.
    PerPrincipal,
}

impl IdentityMode {
    /// Derive the identity for a caller.
    ///
    /// Per-principal connectors require a non-blank principal. The name is
    /// used as given, surrounding whitespace included.
    pub fn identity_for(&self, principal: Option<&str>) -> Result<ConnectorIdentity> {
        match self {
            IdentityMode::Singleton => Ok(ConnectorIdentity::Singleton),
            IdentityMode::PerPrincipal => match principal {
                Some(name) if !name.trim().is_empty() => Ok(ConnectorIdentity::principal(name)),
                _ => Err(ConnectorError::Security(
                    "Per-principal connector requires an authenticated principal".to_string(),
                )),
            },
        }
    }
}

/// Key used to bucket pooled connections.
///
/// Principal names compare case-insensitively. The original spelling is kept
/// for display.
#[derive(Debug, Clone)]
pub enum ConnectorIdentity {
    Singleton,
    Principal(String),
}

impl ConnectorIdentity {
    pub fn principal(name: impl Into<String>) -> Self {
        ConnectorIdentity::Principal(name.into())
    }

    fn folded(name: &str) -> impl Iterator<Item = char> + '_ {
        name.chars().flat_map(char::to_lowercase)
    }
}

impl PartialEq for ConnectorIdentity {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConnectorIdentity::Singleton, ConnectorIdentity::Singleton) => true,
            (ConnectorIdentity::Principal(a), ConnectorIdentity::Principal(b)) => {
                Self::folded(a).eq(Self::folded(b))
            }
            _ => false,
        }
    }
}

impl Eq for ConnectorIdentity {}

impl Hash for ConnectorIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ConnectorIdentity::Singleton => state.write_u8(0),
            ConnectorIdentity::Principal(name) => {
                state.write_u8(1);
                for c in Self::folded(name) {
                    c.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for ConnectorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorIdentity::Singleton => write!(f, "<singleton>"),
            ConnectorIdentity::Principal(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::collections::hash_map::RandomState;
    use std::hash::BuildHasher;

    use super::*;

    #[test]
    fn principal_equality_ignores_case() {
        let a = ConnectorIdentity::principal("Alice");
        let b = ConnectorIdentity::principal("aLICE");
        let c = ConnectorIdentity::principal("bob");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ConnectorIdentity::Singleton);

        let state = RandomState::new();
        assert_eq!(state.hash_one(&a), state.hash_one(&b));
    }

    #[test]
    fn set_collapses_equal_principals() {
        let set: HashSet<_> = ["ALICE", "alice", "Alice", "bob"]
            .into_iter()
            .map(ConnectorIdentity::principal)
            .collect();
        assert_eq!(2, set.len());
    }

    #[test]
    fn identity_for_mode() {
        assert_eq!(
            ConnectorIdentity::Singleton,
            IdentityMode::Singleton.identity_for(Some("alice")).unwrap()
        );
        assert_eq!(
            ConnectorIdentity::principal("alice"),
            IdentityMode::PerPrincipal.identity_for(Some("Alice")).unwrap()
        );
        let err = IdentityMode::PerPrincipal.identity_for(None).unwrap_err();
        assert!(matches!(err, ConnectorError::Security(_)));
        let err = IdentityMode::PerPrincipal.identity_for(Some("  ")).unwrap_err();
        assert!(matches!(err, ConnectorError::Security(_)));
    }

    #[test]
    fn whitespace_distinguishes_principals() {
        let padded = IdentityMode::PerPrincipal.identity_for(Some(" ann")).unwrap();
        let plain = IdentityMode::PerPrincipal.identity_for(Some("ann")).unwrap();
        let upper = IdentityMode::PerPrincipal.identity_for(Some("ANN")).unwrap();
        assert_ne!(padded, plain);
        assert_eq!(plain, upper);
        assert_eq!(" ann", padded.to_string());
    }
}
