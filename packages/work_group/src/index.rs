use std::fmt::Debug;

use num_traits::{NumCast, PrimInt};

/// A primitive integer type that can index the iterations of a loop.
///
/// This is implemented for every primitive integer type (`i32`, `i64`, `usize` and so on).
/// All loops in one pool share the same index type.
pub trait LoopIndex: PrimInt + Debug + Send + Sync + 'static {}

impl<T> LoopIndex for T where T: PrimInt + Debug + Send + Sync + 'static {}

/// Returns the number of indices in the half-open range `[begin, end)`.
///
/// # Panics
///
/// Panics if the span does not fit in `usize`.
pub(crate) fn span<I: LoopIndex>(begin: I, end: I) -> usize {
    if end <= begin {
        return 0;
    }

    end.checked_sub(&begin)
        .and_then(|distance| distance.to_usize())
        .or_else(|| {
            // Signed ranges spanning both extremes overflow the index type itself.
            let distance = end.to_i128()?.checked_sub(begin.to_i128()?)?;
            usize::try_from(distance).ok()
        })
        .expect("loop index range span must fit in usize")
}

/// Returns the index `offset` steps after `begin`.
///
/// The caller guarantees that the result is within a range that starts at `begin`, so it is
/// representable in `I`.
pub(crate) fn advance<I: LoopIndex>(begin: I, offset: usize) -> I {
    <I as NumCast>::from(offset)
        .and_then(|offset| begin.checked_add(&offset))
        .or_else(|| {
            let offset = i128::try_from(offset).ok()?;
            <I as NumCast>::from(begin.to_i128()?.checked_add(offset)?)
        })
        .expect("offset is within a range that starts at begin, so the index is representable")
}
