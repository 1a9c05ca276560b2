//! Block placement preference.
//!
//! New blocks of a file should land close to the blocks logically preceding them. The first blocks
//! of a file go into the cylinder group of its inode. Once a file grows large, its data is spread
//! over the groups in sections of `maxbpg` blocks, each section going into the next group with an
//! above-average number of free blocks, so a single file cannot fill up a group.

use crate::geometry::{Geometry, NDADDR};
use crate::io::alloc::Allocator;

/// Select the preferred address of a new block.
///
/// `lbn` is the logical block to allocate, `indx` its slot in the pointer array holding it, and
/// `prev` the content of the previous slot (zero if `indx` is zero or the slot is unallocated).
/// Returns zero if there is no preference.
pub fn blkpref<A: Allocator + ?Sized>(fs: &Geometry, alloc: &A, ino: u64, lbn: i64, indx: usize,
                                      prev: u64) -> u64 {
    let frag = fs.frag() as u64;

    // We just always try to lay things out contiguously.
    if indx % fs.maxbpg() != 0 && prev != 0 {
        return prev + frag;
    }

    let ncg = alloc.group_count();
    if lbn < (NDADDR + fs.nindir()) as i64 {
        return alloc.group_base(alloc.inode_group(ino)) + frag;
    }

    // Find a cylinder group with at least the average number of unused data blocks.
    let start = if prev == 0 {
        u64::from(alloc.inode_group(ino)) + lbn as u64 / fs.maxbpg() as u64
    } else {
        // The group of the fragment following the previous block.
        u64::from(alloc.block_group(prev + 1))
    };
    let start = (start % u64::from(ncg)) as u32;

    let avg = alloc.average_free_blocks();
    (start..ncg)
        .chain(0..start)
        .find(|&cg| alloc.group_free_blocks(cg) >= avg)
        .map_or(0, |cg| alloc.group_base(cg) + frag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Options;
    use crate::io::alloc::MemAllocator;
    use crate::pointer::Format;
    use crate::Flags;

    fn setup(maxbpg: usize) -> (Geometry, MemAllocator) {
        let options = Options {
            max_blocks_per_group: Some(maxbpg),
            ..Options::default()
        };
        let fs = Geometry::new(Format::Ufs1, 4096, 512, options).unwrap();
        let alloc = MemAllocator::new(fs, 4, 2048).unwrap();
        (fs, alloc)
    }

    #[test]
    fn contiguous() {
        let (fs, alloc) = setup(1024);
        assert_eq!(blkpref(&fs, &alloc, 2, 5, 5, 800), 808);
    }

    #[test]
    fn small_files_stay_with_their_inode() {
        let (fs, alloc) = setup(1024);
        // No previous block.
        assert_eq!(blkpref(&fs, &alloc, 2, 0, 0, 0), 8);
        assert_eq!(blkpref(&fs, &alloc, 70, 3, 3, 0), 2048 + 8);
        // First block of the single indirect block.
        assert_eq!(blkpref(&fs, &alloc, 130, 12, 0, 0), 2 * 2048 + 8);
    }

    #[test]
    fn sections_move_to_the_next_group() {
        let (fs, alloc) = setup(16);
        // Slot 16 starts a new section, swept from the group following the previous block.
        assert_eq!(blkpref(&fs, &alloc, 2, 2000, 16, 2048 + 100), 2048 + 8);
        assert_eq!(blkpref(&fs, &alloc, 2, 2000, 16, 2 * 2048 - 1), 2 * 2048 + 8);
        // The last group wraps around.
        assert_eq!(blkpref(&fs, &alloc, 2, 2000, 16, 4 * 2048 - 1), 8);
    }

    #[test]
    fn skips_crowded_groups() {
        let (fs, mut alloc) = setup(16);
        // Without a previous block, the section number picks the group: 2000 / 16 % 4 = 1.
        assert_eq!(blkpref(&fs, &alloc, 2, 2000, 0, 0), 2048 + 8);

        // Fill up most of group 1.
        for _ in 0..200 {
            alloc.alloc(70, 0, 2048 + 8, 4096, Flags::default()).unwrap();
        }

        // Group 1 is below average now, so group 2 is taken.
        assert_eq!(blkpref(&fs, &alloc, 2, 2000, 0, 0), 2 * 2048 + 8);
        assert_eq!(blkpref(&fs, &alloc, 2, 2000, 16, 2048 + 100), 2 * 2048 + 8);
        // Group 0 is fine.
        assert_eq!(blkpref(&fs, &alloc, 2, 1998, 0, 0), 8);
    }
}
