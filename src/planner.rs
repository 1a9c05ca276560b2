//! The indirection planner.
//!
//! A logical block of a file is reached either through one of the direct pointers of the inode,
//! or through a chain of up to three indirect blocks. This module computes that chain.
//!
//! Indirect blocks are given logical block numbers too. They are negative, so they never collide
//! with data blocks: an indirect block at level `k` mapping the data starting at logical block
//! `b` has the logical block number `-(b + k - 1)`, counting the levels from the bottom (the
//! single indirect block of the inode is `-NDADDR`).

use crate::geometry::{Geometry, NDADDR, NIADDR};
use crate::Error;

/// One step of an indirection chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Indir {
    /// The logical block number of the indirect block to step into.
    pub lbn: i64,
    /// The slot to follow.
    ///
    /// For the first step, this is the index into the indirect pointers of the inode. For the
    /// others, it is the index into the indirect block of the previous step.
    pub off: usize,
}

/// The path from an inode to a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    /// The number of steps in use.
    len: usize,
    /// The steps, root first.
    indirs: [Indir; NIADDR + 1],
}

impl Plan {
    /// The number of indirect blocks between the inode and the block.
    ///
    /// Zero means a direct block.
    pub fn depth(&self) -> usize {
        self.len.saturating_sub(1)
    }

    /// The steps of the chain, root first.
    ///
    /// This is empty for direct blocks. Otherwise step 0 addresses the indirect pointers of the
    /// inode and step `i` (for `1 <= i <= depth`) a slot in the indirect block of level `i`.
    pub fn indirs(&self) -> &[Indir] {
        &self.indirs[..self.len]
    }

    /// The `i`'th step.
    pub fn step(&self, i: usize) -> Indir {
        self.indirs()[i]
    }
}

/// Compute the indirection chain of logical block `lbn`.
///
/// Negative `lbn`s address indirect blocks themselves; their chain ends at the pointer to the
/// indirect block. `Error::FileTooBig` is returned if the block lies beyond triple indirection or
/// its byte offset is not representable.
pub fn plan(fs: &Geometry, lbn: i64) -> Result<Plan, Error> {
    let mut plan = Plan {
        len: 0,
        indirs: [Indir::default(); NIADDR + 1],
    };

    let too_big = Error::FileTooBig { lbn: lbn };
    if lbn == i64::min_value() || lbn > fs.max_offset_lbn() {
        return Err(too_big);
    }

    let mut bn = lbn.abs();
    if bn < NDADDR as i64 {
        return Ok(plan);
    }

    // Determine the number of levels of indirection. After this loop is done, `blockcnt`
    // indicates the number of data blocks possible at the previous level of indirection, and
    // `NIADDR - i` is the number of levels of indirection needed to locate the requested block.
    let lognindir = fs.lognindir();
    let mut lbc = 0;
    let mut i = NIADDR;
    bn -= NDADDR as i64;
    loop {
        if i == 0 {
            return Err(too_big);
        }

        lbc += lognindir;
        let blockcnt = 1i64 << lbc;
        if bn < blockcnt {
            break;
        }

        i -= 1;
        bn -= blockcnt;
    }

    // Calculate the address of the first meta-block.
    let mut metalbn = -(lbn.abs() - bn + (NIADDR - i) as i64);

    // At each iteration, `off` is the offset into the block at `metalbn`, and the next
    // `metalbn` is the logical block number of the block pointed to by that slot.
    plan.indirs[0] = Indir {
        lbn: metalbn,
        off: NIADDR - i,
    };
    plan.len = 1;

    while i <= NIADDR {
        if metalbn == lbn {
            break;
        }

        lbc -= lognindir;
        let off = ((bn >> lbc) & (fs.nindir() as i64 - 1)) as usize;

        plan.indirs[plan.len] = Indir {
            lbn: metalbn,
            off: off,
        };
        plan.len += 1;

        metalbn -= -1 + ((off as i64) << lbc);
        i += 1;
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Options;
    use crate::pointer::Format;

    fn fs() -> Geometry {
        Geometry::new(Format::Ufs1, 4096, 512, Options::default()).unwrap()
    }

    fn steps(plan: &Plan) -> Vec<(i64, usize)> {
        plan.indirs().iter().map(|x| (x.lbn, x.off)).collect()
    }

    #[test]
    fn direct() {
        let fs = fs();
        for lbn in 0..NDADDR as i64 {
            let plan = plan(&fs, lbn).unwrap();
            assert_eq!(plan.depth(), 0);
            assert!(plan.indirs().is_empty());
        }
    }

    #[test]
    fn single_indirect() {
        let fs = fs();
        let first = plan(&fs, 12).unwrap();
        assert_eq!(first.depth(), 1);
        assert_eq!(steps(&first), vec![(-12, 0), (-12, 0)]);

        let last = plan(&fs, 12 + 1023).unwrap();
        assert_eq!(steps(&last), vec![(-12, 0), (-12, 1023)]);
    }

    #[test]
    fn double_indirect() {
        let fs = fs();
        let plan = plan(&fs, 2000).unwrap();
        assert_eq!(plan.depth(), 2);
        assert_eq!(steps(&plan), vec![(-1037, 1), (-1037, 0), (-1036, 964)]);

        // The first block of the second single indirect block below the double indirect block.
        let plan = super::plan(&fs, 12 + 1024 + 1024).unwrap();
        assert_eq!(steps(&plan), vec![(-1037, 1), (-1037, 1), (-2060, 0)]);
    }

    #[test]
    fn triple_indirect() {
        let fs = fs();
        let first = 12 + 1024 + 1024 * 1024;
        let plan = plan(&fs, first).unwrap();
        assert_eq!(plan.depth(), 3);
        assert_eq!(plan.step(0), Indir { lbn: -(first + 2), off: 2 });
        assert_eq!(plan.step(3), Indir { lbn: -first, off: 0 });

        let last = first + (1 << 30) - 1;
        let plan = super::plan(&fs, last).unwrap();
        assert_eq!(plan.step(3).off, 1023);
        assert_eq!(super::plan(&fs, last + 1), Err(Error::FileTooBig { lbn: last + 1 }));
    }

    #[test]
    fn indirect_blocks_themselves() {
        let fs = fs();
        let plan = plan(&fs, -12).unwrap();
        assert_eq!(plan.depth(), 0);
        assert_eq!(steps(&plan), vec![(-12, 0)]);

        let plan = super::plan(&fs, -1037).unwrap();
        assert_eq!(steps(&plan), vec![(-1037, 1)]);

        // The single indirect block below the double indirect block.
        let plan = super::plan(&fs, -1036).unwrap();
        assert_eq!(steps(&plan), vec![(-1037, 1), (-1037, 0)]);
    }

    #[test]
    fn unrepresentable() {
        let fs = Geometry::new(Format::Ufs2, 65536, 8192, Options::default()).unwrap();
        let lbn = fs.max_offset_lbn() + 1;
        assert_eq!(plan(&fs, lbn), Err(Error::FileTooBig { lbn: lbn }));
        assert!(plan(&fs, i64::min_value()).is_err());
    }
}
