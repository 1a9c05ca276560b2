//! On-disk block pointers.
//!
//! UFS1 stores block addresses as 32-bit integers, UFS2 as 64-bit integers. Everything above this
//! module is written once, generically over `BlockPointer`, so the two formats share the same
//! allocation logic.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::convert::TryFrom;
use std::fmt;

/// The on-disk format, determining the pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// 32-bit block pointers.
    Ufs1,
    /// 64-bit block pointers.
    Ufs2,
}

impl Format {
    /// The size (in bytes) of a block pointer in this format.
    pub fn pointer_size(self) -> usize {
        match self {
            Format::Ufs1 => 4,
            Format::Ufs2 => 8,
        }
    }
}

/// The byte order of the file system.
///
/// Images can be moved between machines of different endianness, so the byte order is a property
/// of the file system, not of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl Default for Endian {
    fn default() -> Endian {
        Endian::Little
    }
}

/// A block pointer as stored in inodes and indirect blocks.
///
/// The null pointer (zero) denotes an unallocated block.
pub trait BlockPointer: Copy + Default + PartialEq + fmt::Debug + 'static {
    /// The format using this pointer width.
    const FORMAT: Format;

    /// Narrow a block address to this pointer width.
    ///
    /// This returns `None` if `blkno` cannot be represented.
    fn from_blkno(blkno: u64) -> Option<Self>;
    /// Widen the pointer to a block address.
    fn blkno(self) -> u64;

    /// Read the `slot`'th pointer of an indirect block.
    fn load(buf: &[u8], slot: usize, endian: Endian) -> u64;
    /// Write the `slot`'th pointer of an indirect block.
    fn store(buf: &mut [u8], slot: usize, ptr: Self, endian: Endian);
}

impl BlockPointer for u32 {
    const FORMAT: Format = Format::Ufs1;

    fn from_blkno(blkno: u64) -> Option<u32> {
        u32::try_from(blkno).ok()
    }

    fn blkno(self) -> u64 {
        u64::from(self)
    }

    fn load(buf: &[u8], slot: usize, endian: Endian) -> u64 {
        let at = &buf[slot * 4..];
        u64::from(match endian {
            Endian::Little => LittleEndian::read_u32(at),
            Endian::Big => BigEndian::read_u32(at),
        })
    }

    fn store(buf: &mut [u8], slot: usize, ptr: u32, endian: Endian) {
        let at = &mut buf[slot * 4..];
        match endian {
            Endian::Little => LittleEndian::write_u32(at, ptr),
            Endian::Big => BigEndian::write_u32(at, ptr),
        }
    }
}

impl BlockPointer for u64 {
    const FORMAT: Format = Format::Ufs2;

    fn from_blkno(blkno: u64) -> Option<u64> {
        Some(blkno)
    }

    fn blkno(self) -> u64 {
        self
    }

    fn load(buf: &[u8], slot: usize, endian: Endian) -> u64 {
        let at = &buf[slot * 8..];
        match endian {
            Endian::Little => LittleEndian::read_u64(at),
            Endian::Big => BigEndian::read_u64(at),
        }
    }

    fn store(buf: &mut [u8], slot: usize, ptr: u64, endian: Endian) {
        let at = &mut buf[slot * 8..];
        match endian {
            Endian::Little => LittleEndian::write_u64(at, ptr),
            Endian::Big => BigEndian::write_u64(at, ptr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing() {
        assert_eq!(u32::from_blkno(0xFFFF_FFFF), Some(0xFFFF_FFFF));
        assert_eq!(u32::from_blkno(0x1_0000_0000), None);
        assert_eq!(u64::from_blkno(0x1_0000_0000), Some(0x1_0000_0000));
    }

    #[test]
    fn ufs1_slots() {
        let mut buf = [0; 16];
        u32::store(&mut buf, 1, 0x0102_0304, Endian::Little);
        assert_eq!(&buf[4..8], &[4, 3, 2, 1]);
        assert_eq!(u32::load(&buf, 1, Endian::Little), 0x0102_0304);
        // Neighbouring slots are untouched.
        assert_eq!(u32::load(&buf, 0, Endian::Little), 0);
        assert_eq!(u32::load(&buf, 2, Endian::Little), 0);
    }

    #[test]
    fn ufs2_big_endian() {
        let mut buf = [0; 24];
        u64::store(&mut buf, 2, 0x0102_0304_0506_0708, Endian::Big);
        assert_eq!(&buf[16..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(u64::load(&buf, 2, Endian::Big), 0x0102_0304_0506_0708);
        assert_ne!(u64::load(&buf, 2, Endian::Little), 0x0102_0304_0506_0708);
    }

    #[test]
    fn pointer_sizes() {
        assert_eq!(<u32 as BlockPointer>::FORMAT.pointer_size(), 4);
        assert_eq!(<u64 as BlockPointer>::FORMAT.pointer_size(), 8);
    }
}
