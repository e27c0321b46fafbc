use std::iter::FusedIterator;
use std::ops::Range;
use std::slice;

use crate::LoopIndex;
use crate::index::{advance, span};

/// The set of indices that one enqueued loop iterates over.
///
/// A segment is either a contiguous half-open range `[begin, end)` or an explicit list of
/// indices. Iteration is lazy and restartable: every call to [`iter()`](Self::iter) starts again
/// from the first index.
///
/// # Examples
///
/// ```rust
/// use work_group::Segment;
///
/// let range = Segment::range(2_i64, 5);
/// assert_eq!(range.iter().collect::<Vec<_>>(), vec![2, 3, 4]);
///
/// let list = Segment::list(vec![7_i64, 1, 4]);
/// assert_eq!(list.len(), 3);
/// assert_eq!(list.get(1), Some(1));
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment<I> {
    repr: Repr<I>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Repr<I> {
    Range { begin: I, end: I, len: usize },
    List(Vec<I>),
}

impl<I: LoopIndex> Segment<I> {
    /// Creates a segment covering the half-open range `[begin, end)`.
    ///
    /// An inverted range (`end < begin`) is empty.
    ///
    /// # Panics
    ///
    /// Panics if the number of indices in the range does not fit in `usize`.
    #[must_use]
    pub fn range(begin: I, end: I) -> Self {
        Self {
            repr: Repr::Range {
                begin,
                end,
                len: span(begin, end),
            },
        }
    }

    /// Creates a segment that visits the given indices in the given order.
    #[must_use]
    pub fn list(indices: Vec<I>) -> Self {
        Self {
            repr: Repr::List(indices),
        }
    }

    /// The number of indices in the segment.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Range { len, .. } => *len,
            Repr::List(indices) => indices.len(),
        }
    }

    /// Whether the segment contains no indices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the index at `position` in iteration order, if the segment is long enough.
    #[must_use]
    pub fn get(&self, position: usize) -> Option<I> {
        match &self.repr {
            Repr::Range { begin, len, .. } => {
                (position < *len).then(|| advance(*begin, position))
            }
            Repr::List(indices) => indices.get(position).copied(),
        }
    }

    /// Iterates over the indices of the segment in order.
    #[must_use]
    pub fn iter(&self) -> SegmentIter<'_, I> {
        let inner = match &self.repr {
            Repr::Range { begin, end, .. } => IterInner::Range {
                next: *begin,
                end: *end,
                remaining: self.len(),
            },
            Repr::List(indices) => IterInner::List(indices.iter()),
        };

        SegmentIter { inner }
    }
}

impl<I: LoopIndex> From<Range<I>> for Segment<I> {
    fn from(range: Range<I>) -> Self {
        Self::range(range.start, range.end)
    }
}

impl<I: LoopIndex> From<Vec<I>> for Segment<I> {
    fn from(indices: Vec<I>) -> Self {
        Self::list(indices)
    }
}

impl<'a, I: LoopIndex> IntoIterator for &'a Segment<I> {
    type Item = I;
    type IntoIter = SegmentIter<'a, I>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the indices of a [`Segment`].
#[derive(Debug)]
pub struct SegmentIter<'a, I> {
    inner: IterInner<'a, I>,
}

#[derive(Debug)]
enum IterInner<'a, I> {
    Range { next: I, end: I, remaining: usize },
    List(slice::Iter<'a, I>),
}

impl<I: LoopIndex> Iterator for SegmentIter<'_, I> {
    type Item = I;

    fn next(&mut self) -> Option<I> {
        match &mut self.inner {
            IterInner::Range {
                next,
                end,
                remaining,
            } => {
                if *next >= *end {
                    return None;
                }

                let current = *next;

                // The last index of the range is `end - 1`, so the step below can only reach
                // `end`, which is representable.
                *next = current + I::one();
                *remaining = remaining.saturating_sub(1);

                Some(current)
            }
            IterInner::List(indices) => indices.next().copied(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match &self.inner {
            IterInner::Range { remaining, .. } => *remaining,
            IterInner::List(indices) => indices.len(),
        };

        (remaining, Some(remaining))
    }
}

impl<I: LoopIndex> ExactSizeIterator for SegmentIter<'_, I> {}

impl<I: LoopIndex> FusedIterator for SegmentIter<'_, I> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Segment<i32>: Send, Sync, Clone);

    #[test]
    fn range_iterates_in_order() {
        let segment = Segment::range(0_i32, 5);

        assert_eq!(segment.len(), 5);
        assert!(!segment.is_empty());
        assert_eq!(segment.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn range_iteration_is_restartable() {
        let segment = Segment::range(10_u32, 13);

        let first = segment.iter().collect::<Vec<_>>();
        let second = segment.iter().collect::<Vec<_>>();

        assert_eq!(first, second);
    }

    #[test]
    fn inverted_range_is_empty() {
        let segment = Segment::range(5_i64, 2);

        assert!(segment.is_empty());
        assert_eq!(segment.iter().next(), None);
        assert_eq!(segment.get(0), None);
    }

    #[test]
    fn range_reaching_type_maximum_terminates() {
        let segment = Segment::range(u8::MAX - 2, u8::MAX);

        assert_eq!(segment.iter().collect::<Vec<_>>(), vec![253, 254]);
    }

    #[test]
    fn range_get_matches_iteration() {
        let segment = Segment::range(-3_i32, 4);

        for (position, index) in segment.iter().enumerate() {
            assert_eq!(segment.get(position), Some(index));
        }

        assert_eq!(segment.get(segment.len()), None);
    }

    #[test]
    fn list_keeps_given_order() {
        let segment = Segment::list(vec![9_usize, 2, 5]);

        assert_eq!(segment.len(), 3);
        assert_eq!(segment.iter().collect::<Vec<_>>(), vec![9, 2, 5]);
        assert_eq!(segment.get(2), Some(5));
        assert_eq!(segment.get(3), None);
    }

    #[test]
    fn conversions_from_std_types() {
        let from_range: Segment<i32> = (1..4).into();
        let from_vec: Segment<i32> = vec![1, 2, 3].into();

        assert_eq!(
            from_range.iter().collect::<Vec<_>>(),
            from_vec.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn size_hint_tracks_remaining() {
        let segment = Segment::range(0_i32, 3);
        let mut iter = segment.iter();

        assert_eq!(iter.len(), 3);
        iter.next();
        assert_eq!(iter.len(), 2);
    }
}
