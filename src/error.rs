//! Errors.

use crate::io::disk;

/// The category of an error.
///
/// This enum contains variants representing general categories of allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// No more space to use, either on the disk or in the quota.
    OutOfSpace,
    /// The underlying device failed.
    Io,
    /// The request addressed something outside the representable range.
    Range,
    /// Implementation or configuration issue.
    Implementation,
}

quick_error! {
    /// A block allocation error.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        /// No free blocks or fragments left.
        ///
        /// This is the equivalent to OOM, but with disk space.
        OutOfSpace {
            display("file system full")
        }
        /// The quota of the owner of inode `ino` would be exceeded.
        QuotaExceeded { ino: u64 } {
            display("disk quota exceeded for inode {}", ino)
        }
        /// The logical block `lbn` lies beyond the largest addressable file offset.
        FileTooBig { lbn: i64 } {
            display("logical block {} is beyond the maximum file size", lbn)
        }
        /// The allocator handed out an address which the on-disk pointer width cannot store.
        AddressOverflow { blkno: u64 } {
            display("block {} does not fit into an on-disk block pointer", blkno)
        }
        /// The snapshot copy-on-write hook refused the buffer of block `blkno`.
        Snapshot { blkno: u64 } {
            display("snapshot copy-on-write failed for block {}", blkno)
        }
        /// The file system geometry is unusable.
        InvalidGeometry { reason: &'static str } {
            display("invalid file system geometry: {}", reason)
        }
        /// A disk error.
        Disk(err: disk::Error) {
            from()
            display("disk I/O error: {}", err)
            source(err)
        }
    }
}

impl Error {
    /// Get the category of this error.
    pub fn kind(&self) -> Kind {
        match *self {
            Error::OutOfSpace | Error::QuotaExceeded { .. } => Kind::OutOfSpace,
            Error::Disk(_) | Error::Snapshot { .. } => Kind::Io,
            Error::FileTooBig { .. } => Kind::Range,
            Error::AddressOverflow { .. } | Error::InvalidGeometry { .. } => Kind::Implementation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(Error::OutOfSpace.kind(), Kind::OutOfSpace);
        assert_eq!(Error::QuotaExceeded { ino: 2 }.kind(), Kind::OutOfSpace);
        assert_eq!(Error::FileTooBig { lbn: -1 }.kind(), Kind::Range);
        assert_eq!(Error::from(disk::Error::OutOfBounds { blkno: 9 }).kind(), Kind::Io);
    }

    #[test]
    fn display() {
        assert_eq!(Error::FileTooBig { lbn: 7 }.to_string(),
                   "logical block 7 is beyond the maximum file size");
        assert_eq!(Error::from(disk::Error::Failed { blkno: 3 }).to_string(),
                   "disk I/O error: disk block 3 failed to transfer");
    }
}
