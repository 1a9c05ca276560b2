//! File system geometry and configuration.
//!
//! The allocator only needs a handful of constants from the superblock: the block and fragment
//! sizes, the pointer width, and the byte order. They are gathered into `Geometry`, which also
//! provides the usual size conversions (`lblkno`, `blkoff`, `fragroundup`, ...).

use crate::pointer::{Endian, Format};
use crate::Error;

/// The number of direct block pointers in an inode.
pub const NDADDR: usize = 12;
/// The number of indirect block pointers in an inode (single, double, triple).
pub const NIADDR: usize = 3;
/// The size of a device sector, the unit of inode block counts and quotas.
pub const DEV_BSIZE: usize = 512;
/// The smallest supported block size.
pub const MIN_BSIZE: usize = 4096;
/// The largest supported block size.
pub const MAX_BSIZE: usize = 65536;
/// The largest number of fragments in a block.
pub const MAX_FRAG: usize = 8;

/// Geometry options.
///
/// These are the tunables which do not follow from the block and fragment sizes alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// The byte order of on-disk pointers.
    pub endian: Endian,
    /// The maximal number of blocks of a file laid out contiguously in one cylinder group before
    /// the placement heuristic moves on.
    ///
    /// `None` defaults to the number of pointers in an indirect block.
    pub max_blocks_per_group: Option<usize>,
}

/// The file system geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    format: Format,
    endian: Endian,
    bsize: usize,
    fsize: usize,
    bshift: u32,
    fshift: u32,
    nindir: usize,
    lognindir: u32,
    maxbpg: usize,
}

impl Geometry {
    /// Construct and validate a geometry.
    ///
    /// `bsize` and `fsize` are the block and fragment sizes in bytes.
    pub fn new(format: Format, bsize: usize, fsize: usize, options: Options)
        -> Result<Geometry, Error> {
        if !fsize.is_power_of_two() || fsize < DEV_BSIZE {
            return Err(Error::InvalidGeometry {
                reason: "fragment size must be a power of two of at least one sector",
            });
        }
        if !bsize.is_power_of_two() || bsize < MIN_BSIZE || bsize > MAX_BSIZE {
            return Err(Error::InvalidGeometry {
                reason: "block size must be a power of two between 4096 and 65536",
            });
        }
        if bsize < fsize || bsize / fsize > MAX_FRAG {
            return Err(Error::InvalidGeometry {
                reason: "a block must hold between one and eight fragments",
            });
        }
        if options.max_blocks_per_group == Some(0) {
            return Err(Error::InvalidGeometry {
                reason: "max blocks per group must be positive",
            });
        }

        let nindir = bsize / format.pointer_size();
        Ok(Geometry {
            format: format,
            endian: options.endian,
            bsize: bsize,
            fsize: fsize,
            bshift: bsize.trailing_zeros(),
            fshift: fsize.trailing_zeros(),
            nindir: nindir,
            lognindir: nindir.trailing_zeros(),
            maxbpg: options.max_blocks_per_group.unwrap_or(nindir),
        })
    }

    /// The on-disk format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// The byte order of block pointers.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The block size in bytes.
    pub fn bsize(&self) -> usize {
        self.bsize
    }

    /// The fragment size in bytes.
    pub fn fsize(&self) -> usize {
        self.fsize
    }

    /// The number of fragments in a block.
    pub fn frag(&self) -> usize {
        self.bsize >> self.fshift
    }

    /// The number of block pointers in an indirect block.
    pub fn nindir(&self) -> usize {
        self.nindir
    }

    /// `log2(nindir)`.
    pub fn lognindir(&self) -> u32 {
        self.lognindir
    }

    /// The maximal number of contiguous blocks per cylinder group.
    pub fn maxbpg(&self) -> usize {
        self.maxbpg
    }

    /// The logical block containing byte `off`.
    pub fn lblkno(&self, off: u64) -> i64 {
        (off >> self.bshift) as i64
    }

    /// The byte offset of logical block `lbn`.
    pub fn lblktosize(&self, lbn: i64) -> u64 {
        (lbn as u64) << self.bshift
    }

    /// The offset of byte `off` within its block.
    pub fn blkoff(&self, off: u64) -> usize {
        (off & (self.bsize as u64 - 1)) as usize
    }

    /// Round `size` up to a whole number of fragments.
    pub fn fragroundup(&self, size: usize) -> usize {
        (size + self.fsize - 1) & !(self.fsize - 1)
    }

    /// The number of fragments in `size` bytes.
    pub fn numfrags(&self, size: usize) -> u64 {
        (size >> self.fshift) as u64
    }

    /// The number of device sectors in `size` bytes.
    pub fn sectors(&self, size: usize) -> u64 {
        (size / DEV_BSIZE) as u64
    }

    /// The allocated size of logical block `lbn` of a file of `file_size` bytes.
    ///
    /// Every block is a full block, except a direct block at the end of the file, which holds just
    /// enough fragments for the tail.
    pub fn blksize(&self, file_size: u64, lbn: i64) -> usize {
        if lbn >= NDADDR as i64 || file_size >= self.lblktosize(lbn + 1) {
            self.bsize
        } else {
            self.fragroundup(self.blkoff(file_size))
        }
    }

    /// The largest logical block whose byte offset is representable.
    pub fn max_offset_lbn(&self) -> i64 {
        i64::max_value() >> self.bshift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ufs1() -> Geometry {
        Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap()
    }

    #[test]
    fn derived_constants() {
        let fs = ufs1();
        assert_eq!(fs.frag(), 8);
        assert_eq!(fs.nindir(), 1024);
        assert_eq!(fs.lognindir(), 10);
        assert_eq!(fs.maxbpg(), 1024);

        let fs = Geometry::new(Format::Ufs2, 16384, 2048, Options::default()).unwrap();
        assert_eq!(fs.frag(), 8);
        assert_eq!(fs.nindir(), 2048);
    }

    #[test]
    fn conversions() {
        let fs = ufs1();
        assert_eq!(fs.lblkno(5000), 1);
        assert_eq!(fs.lblktosize(2), 8192);
        assert_eq!(fs.blkoff(5000), 904);
        assert_eq!(fs.fragroundup(904), 1024);
        assert_eq!(fs.fragroundup(1024), 1024);
        assert_eq!(fs.numfrags(4096), 8);
        assert_eq!(fs.sectors(4096), 8);
    }

    #[test]
    fn trailing_block_size() {
        let fs = ufs1();
        assert_eq!(fs.blksize(300, 0), 512);
        assert_eq!(fs.blksize(5000, 0), 4096);
        assert_eq!(fs.blksize(5000, 1), 1024);
        // A file ending on a block boundary has no tail.
        assert_eq!(fs.blksize(4096, 1), 0);
        // Indirect blocks are never fragments.
        assert_eq!(fs.blksize(300, NDADDR as i64), 4096);
    }

    #[test]
    fn rejects_bad_geometry() {
        let opts = Options::default();
        assert!(Geometry::new(Format::Ufs1, 4096, 256, opts).is_err());
        assert!(Geometry::new(Format::Ufs1, 3000, 512, opts).is_err());
        assert!(Geometry::new(Format::Ufs1, 8192, 512, opts).is_err());
        assert!(Geometry::new(Format::Ufs1, 4096, 8192, opts).is_err());
        assert!(Geometry::new(Format::Ufs1, 131072, 16384, opts).is_err());

        let opts = Options { max_blocks_per_group: Some(0), ..Options::default() };
        assert!(Geometry::new(Format::Ufs1, 4096, 512, opts).is_err());
    }
}
