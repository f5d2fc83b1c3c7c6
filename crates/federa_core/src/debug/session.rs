//! Expiring session tokens for the debug web services.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use federa_error::{ConnectorError, Result};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub value: String,
    pub validity: TimeDelta,
    pub created_at: DateTime<Utc>,
    /// Issuer generation the token was minted in.
    generation: u64,
}

impl SessionToken {
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.created_at + self.validity
    }
}

/// Issues tokens and rejects expired or revoked ones.
#[derive(Debug)]
pub struct SessionIssuer {
    validity: TimeDelta,
    generation: AtomicU64,
    issued: AtomicU64,
}

impl SessionIssuer {
    pub fn new(validity: TimeDelta) -> Self {
        SessionIssuer {
            validity,
            generation: AtomicU64::new(0),
            issued: AtomicU64::new(0),
        }
    }

    pub fn issue(&self) -> SessionToken {
        self.issued.fetch_add(1, Ordering::SeqCst);
        SessionToken {
            value: Uuid::new_v4().to_string(),
            validity: self.validity,
            created_at: Utc::now(),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Revoke every token issued so far.
    pub fn expire_all(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of tokens issued.
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn check(&self, token: &SessionToken) -> Result<()> {
        if token.generation != self.generation.load(Ordering::SeqCst) {
            return Err(ConnectorError::AuthExpired(format!(
                "Session {} was revoked",
                token.value
            )));
        }
        if !token.is_valid() {
            return Err(ConnectorError::AuthExpired(format!(
                "Session {} expired at {}",
                token.value,
                token.created_at + token.validity
            )));
        }
        Ok(())
    }
}
