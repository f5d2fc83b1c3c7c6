use std::fmt;

use federa_error::{ConnectorError, Result};

pub const MAX_GTRID_SIZE: usize = 64;
pub const MAX_BQUAL_SIZE: usize = 64;

/// Distributed transaction branch identifier.
///
/// Equality and hashing are structural over the triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xid {
    format_id: i32,
    gtrid: Vec<u8>,
    bqual: Vec<u8>,
}

impl Xid {
    pub fn new(format_id: i32, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Result<Self> {
        let gtrid = gtrid.into();
        let bqual = bqual.into();
        if gtrid.is_empty() || gtrid.len() > MAX_GTRID_SIZE {
            return Err(ConnectorError::InvalidArgument(format!(
                "Global transaction id must be 1 to {MAX_GTRID_SIZE} bytes, got {}",
                gtrid.len()
            )));
        }
        if bqual.len() > MAX_BQUAL_SIZE {
            return Err(ConnectorError::InvalidArgument(format!(
                "Branch qualifier must be at most {MAX_BQUAL_SIZE} bytes, got {}",
                bqual.len()
            )));
        }
        Ok(Xid {
            format_id,
            gtrid,
            bqual,
        })
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid(&self) -> &[u8] {
        &self.gtrid
    }

    pub fn bqual(&self) -> &[u8] {
        &self.bqual
    }

    /// Stable string key, `{format_id}-{hex(gtrid)}-{hex(bqual)}`.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.format_id,
            hex::encode(&self.gtrid),
            hex::encode(&self.bqual)
        )
    }

    pub fn from_key(key: &str) -> Result<Self> {
        let invalid = || ConnectorError::InvalidArgument(format!("Invalid transaction key '{key}'"));

        // Format id may be negative so split from the right.
        let mut parts = key.rsplitn(3, '-');
        let bqual = parts.next().ok_or_else(invalid)?;
        let gtrid = parts.next().ok_or_else(invalid)?;
        let format_id = parts.next().ok_or_else(invalid)?;

        let format_id = format_id.parse().map_err(|_| invalid())?;
        let gtrid = hex::decode(gtrid).map_err(|_| invalid())?;
        let bqual = hex::decode(bqual).map_err(|_| invalid())?;
        Xid::new(format_id, gtrid, bqual)
    }

    /// Xid for the `ordinal`th branch of this transaction. Keeps the format id
    /// and global id, appends the ordinal to the qualifier.
    pub fn branch(&self, ordinal: u16) -> Result<Xid> {
        let mut bqual = self.bqual.clone();
        bqual.extend_from_slice(&ordinal.to_be_bytes());
        Xid::new(self.format_id, self.gtrid.clone(), bqual)
    }

    /// Whether both ids belong to the same global transaction.
    pub fn same_global(&self, other: &Xid) -> bool {
        self.format_id == other.format_id && self.gtrid == other.gtrid
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
