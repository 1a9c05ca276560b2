//! The block-pointer part of an inode.

use crate::geometry::{NDADDR, NIADDR};
use crate::pointer::BlockPointer;
use crate::Error;

/// An in-core inode.
///
/// Only the fields the block allocator reads or writes are represented. The caller holds the
/// per-inode lock for as long as a `&mut Inode` is lent out.
#[derive(Debug, Clone, PartialEq)]
pub struct Inode<P> {
    /// The inode number.
    pub number: u64,
    /// The file size in bytes.
    pub size: u64,
    /// The number of device sectors held by the file, indirect blocks included.
    pub blocks: u64,
    /// Is this inode a snapshot?
    ///
    /// Snapshots try to keep their indirect blocks contiguous.
    pub snapshot: bool,
    /// The direct block pointers.
    direct: [P; NDADDR],
    /// The single, double and triple indirect block pointers.
    indirect: [P; NIADDR],
    /// Has the allocator changed the inode since the flag was last cleared?
    modified: bool,
}

impl<P: BlockPointer> Inode<P> {
    /// Create an empty inode.
    pub fn new(number: u64) -> Inode<P> {
        Inode {
            number: number,
            size: 0,
            blocks: 0,
            snapshot: false,
            direct: [P::default(); NDADDR],
            indirect: [P::default(); NIADDR],
            modified: false,
        }
    }

    /// Get the `n`'th direct block, or zero if unallocated.
    pub fn direct(&self, n: usize) -> u64 {
        self.direct[n].blkno()
    }

    /// Get the indirect block of level `n + 1`, or zero if unallocated.
    pub fn indirect(&self, n: usize) -> u64 {
        self.indirect[n].blkno()
    }

    /// Set the `n`'th direct block.
    pub fn set_direct(&mut self, n: usize, blkno: u64) -> Result<(), Error> {
        self.direct[n] = P::from_blkno(blkno).ok_or(Error::AddressOverflow { blkno: blkno })?;
        self.modified = true;
        Ok(())
    }

    /// Set the indirect block of level `n + 1`.
    pub fn set_indirect(&mut self, n: usize, blkno: u64) -> Result<(), Error> {
        self.indirect[n] = P::from_blkno(blkno).ok_or(Error::AddressOverflow { blkno: blkno })?;
        self.modified = true;
        Ok(())
    }

    /// Mark the inode as changed.
    pub fn touch(&mut self) {
        self.modified = true;
    }

    /// Has the inode been changed and not yet written back?
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Clear the modified flag, after the inode was written back.
    pub fn clear_modified(&mut self) {
        self.modified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty() {
        let inode = Inode::<u32>::new(5);
        assert!((0..NDADDR).all(|n| inode.direct(n) == 0));
        assert!((0..NIADDR).all(|n| inode.indirect(n) == 0));
        assert!(!inode.is_modified());
    }

    #[test]
    fn pointer_width_is_checked() {
        let mut inode = Inode::<u32>::new(5);
        assert_eq!(inode.set_direct(0, 1 << 32), Err(Error::AddressOverflow { blkno: 1 << 32 }));
        assert!(!inode.is_modified());

        inode.set_indirect(2, 77).unwrap();
        assert_eq!(inode.indirect(2), 77);
        assert!(inode.is_modified());

        let mut inode = Inode::<u64>::new(5);
        inode.set_direct(0, 1 << 32).unwrap();
        assert_eq!(inode.direct(0), 1 << 32);
    }
}
