//! Disk quotas.
//!
//! Space is charged to the owner of an inode before it is allocated, and given back when the
//! allocation fails or is undone. Amounts are in device sectors.

use std::collections::HashMap;

use crate::Error;

/// A quota subsystem.
pub trait Quota {
    /// Charge `sectors` sectors to the owner of inode `ino`.
    ///
    /// If the limit would be exceeded, nothing is charged and `Error::QuotaExceeded` is returned.
    fn charge(&mut self, ino: u64, sectors: u64) -> Result<(), Error>;
    /// Give `sectors` sectors back to the owner of inode `ino`.
    ///
    /// This never fails.
    fn restore(&mut self, ino: u64, sectors: u64);
}

/// No quotas. Every charge succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuota;

impl Quota for NoQuota {
    fn charge(&mut self, _: u64, _: u64) -> Result<(), Error> {
        Ok(())
    }

    fn restore(&mut self, _: u64, _: u64) {}
}

/// An in-memory quota, with a single sector limit per inode.
#[derive(Debug, Clone, Default)]
pub struct MemQuota {
    /// The limit in sectors, `None` for unlimited.
    limit: Option<u64>,
    /// The sectors charged to each inode.
    usage: HashMap<u64, u64>,
}

impl MemQuota {
    /// Create a quota allowing every inode `limit` sectors.
    pub fn with_limit(limit: u64) -> MemQuota {
        MemQuota {
            limit: Some(limit),
            usage: HashMap::new(),
        }
    }

    /// The sectors charged to inode `ino`.
    pub fn usage(&self, ino: u64) -> u64 {
        self.usage.get(&ino).cloned().unwrap_or(0)
    }
}

impl Quota for MemQuota {
    fn charge(&mut self, ino: u64, sectors: u64) -> Result<(), Error> {
        let used = self.usage(ino);
        if self.limit.map_or(false, |limit| used + sectors > limit) {
            return Err(Error::QuotaExceeded { ino: ino });
        }

        self.usage.insert(ino, used + sectors);
        Ok(())
    }

    fn restore(&mut self, ino: u64, sectors: u64) {
        let used = self.usage.entry(ino).or_insert(0);
        // Restoring more than charged is clamped, like a forced quota update.
        *used = used.saturating_sub(sectors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit() {
        let mut quota = MemQuota::with_limit(16);
        quota.charge(2, 8).unwrap();
        quota.charge(2, 8).unwrap();
        assert_eq!(quota.charge(2, 1), Err(Error::QuotaExceeded { ino: 2 }));
        assert_eq!(quota.usage(2), 16);

        // Other inodes are accounted separately.
        quota.charge(3, 16).unwrap();

        quota.restore(2, 8);
        assert_eq!(quota.usage(2), 8);
        quota.charge(2, 8).unwrap();
    }

    #[test]
    fn unlimited() {
        let mut quota = MemQuota::default();
        quota.charge(2, 1 << 40).unwrap();
        assert_eq!(quota.usage(2), 1 << 40);
        assert!(NoQuota.charge(2, 1 << 40).is_ok());
    }
}
