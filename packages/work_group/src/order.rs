use std::num::NonZero;
use std::ops::Range;

/// Determines the order in which the loops of a batch execute.
///
/// The order never changes which indices are visited: every index of every loop is visited
/// exactly once under every policy.
///
/// # Examples
///
/// ```rust
/// use new_zealand::nz;
/// use work_group::{OrderPolicy, WorkPool};
///
/// let pool = WorkPool::<u32, ()>::builder()
///     .order(OrderPolicy::distributed(nz!(64)))
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.order(), OrderPolicy::distributed(nz!(64)));
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum OrderPolicy {
    /// Loops execute in the order they were enqueued. This is the default.
    #[default]
    Ordered,

    /// Loops execute in the reverse of the order they were enqueued.
    ///
    /// Indices within each loop still execute in segment order.
    ReverseOrdered,

    /// Loops are split into blocks that are spread over a grid of work items, balancing long and
    /// short loops against each other. A loop of average length gets blocks of `block_size`
    /// indices.
    ///
    /// Every loop gets the same number of blocks, derived from the average loop length, and each
    /// block covers one contiguous run of its loop. Work items run block by block across loops,
    /// so loops interleave, but the indices of one loop are still visited in segment order when
    /// the batch runs sequentially. Every index is visited exactly once.
    Distributed {
        /// Indices per block of a loop of average length.
        block_size: NonZero<usize>,
    },
}

impl OrderPolicy {
    /// Distributed order with the given block size.
    #[must_use]
    pub fn distributed(block_size: NonZero<usize>) -> Self {
        Self::Distributed { block_size }
    }
}

/// Assignment of loops to the work items of a distributed batch.
///
/// Work item `w` handles block `w / num_loops` of loop `w % num_loops`, so consecutive work items
/// belong to different loops.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Grid {
    num_loops: usize,
    blocks_per_loop: usize,
}

impl Grid {
    pub(crate) fn new(num_loops: usize, total_indices: usize, block_size: NonZero<usize>) -> Self {
        let average_len = total_indices.div_ceil(num_loops.max(1));

        Self {
            num_loops,
            blocks_per_loop: average_len.div_ceil(block_size.get()).max(1),
        }
    }

    pub(crate) fn blocks_per_loop(&self) -> usize {
        self.blocks_per_loop
    }

    pub(crate) fn work_items(&self) -> usize {
        self.num_loops.saturating_mul(self.blocks_per_loop)
    }

    /// The `(block, loop)` pair handled by a work item.
    pub(crate) fn work_item(&self, item: usize) -> (usize, usize) {
        debug_assert!(item < self.work_items());

        (
            item.checked_div(self.num_loops).unwrap_or_default(),
            item.checked_rem(self.num_loops).unwrap_or_default(),
        )
    }

    /// The positions within a loop of `loop_len` indices that one block visits.
    ///
    /// Blocks split the loop into consecutive runs of equal length (the last ones may be shorter
    /// or empty), so block `b` always ends where block `b + 1` starts.
    pub(crate) fn positions(&self, block: usize, loop_len: usize) -> Range<usize> {
        let per_block = loop_len.div_ceil(self.blocks_per_loop);

        let start = block.saturating_mul(per_block).min(loop_len);
        let end = start.saturating_add(per_block).min(loop_len);

        start..end
    }
}
