use std::sync::Arc;

use itertools::Itertools;

use crate::shape::ShapeError;

/// Kernel-facing encoding of the whole-array sentinel.
pub const WHOLE_DIMENSION: i64 = i64::MAX;

/// A canonical reduction/broadcast dimension set: ascending, deduplicated,
/// every index within `[0, rank)`.
///
/// `Whole` is distinct from an explicit full-range list because it changes
/// the output-shape rules: reducing over everything yields a `[1, 1]`
/// result, never a zero-rank one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimensionSet {
    Whole,
    Dims(Arc<[usize]>),
}

impl std::fmt::Display for DimensionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimensionSet::Whole => write!(f, "[*]"),
            DimensionSet::Dims(dims) => write!(f, "[{}]", dims.iter().format(", ")),
        }
    }
}

impl DimensionSet {
    #[inline]
    pub fn is_whole(&self) -> bool {
        matches!(self, DimensionSet::Whole)
    }

    /// Encoding handed to kernel entry points.
    pub fn to_kernel(&self) -> Vec<i64> {
        match self {
            DimensionSet::Whole => vec![WHOLE_DIMENSION],
            DimensionSet::Dims(dims) => dims.iter().map(|&d| d as i64).collect(),
        }
    }
}

/// Resolve a requested dimension list against an array of the given rank.
///
/// Negative indices count from the end. An empty request, the sentinel
/// value, or a set covering every dimension all collapse to
/// [`DimensionSet::Whole`]. Returns the canonical set together with the
/// shape a reduction over it produces.
pub fn normalize(
    rank: usize,
    requested: &[i64],
    shape: &[usize],
) -> Result<(DimensionSet, Vec<usize>), ShapeError> {
    debug_assert_eq!(rank, shape.len());

    if requested.is_empty() || requested.contains(&WHOLE_DIMENSION) {
        return Ok((DimensionSet::Whole, vec![1, 1]));
    }

    let mut resolved = Vec::with_capacity(requested.len());
    for &dim in requested {
        let d = if dim < 0 { dim + rank as i64 } else { dim };
        if d < 0 || d >= rank as i64 {
            return Err(ShapeError::InvalidDimension { dim, rank });
        }
        resolved.push(d as usize);
    }
    resolved.sort_unstable();
    resolved.dedup();

    if resolved.len() == rank {
        return Ok((DimensionSet::Whole, vec![1, 1]));
    }

    let output = output_shape(shape, &resolved);
    Ok((DimensionSet::Dims(resolved.into()), output))
}

/// Shape left after removing the selected dimensions.
///
/// A single remaining dimension keeps its row/column orientation: removing
/// the leading dimension yields a row `[1, n]`, anything else a column
/// `[n, 1]`. Nothing remaining yields `[1, 1]`.
fn output_shape(shape: &[usize], selected: &[usize]) -> Vec<usize> {
    let remaining = shape
        .iter()
        .enumerate()
        .filter(|(i, _)| !selected.contains(i))
        .map(|(_, &d)| d)
        .collect_vec();
    match remaining.as_slice() {
        [] => vec![1, 1],
        [n] if selected[0] == 0 => vec![1, *n],
        [n] => vec![*n, 1],
        _ => remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::{DimensionSet, WHOLE_DIMENSION, normalize};

    #[test]
    fn reduce_trailing_dimension() {
        let (set, shape) = normalize(2, &[1], &[3, 4]).unwrap();
        assert_eq!(set, DimensionSet::Dims([1].into()));
        assert_eq!(shape, [3, 1]);
    }

    #[test]
    fn reduce_leading_dimension() {
        let (set, shape) = normalize(2, &[0], &[3, 4]).unwrap();
        assert_eq!(set, DimensionSet::Dims([0].into()));
        assert_eq!(shape, [1, 4]);
    }

    #[test]
    fn full_cover_collapses_to_whole() {
        let (set, shape) = normalize(1, &[0], &[5]).unwrap();
        assert_eq!(set, DimensionSet::Whole);
        assert_eq!(shape, [1, 1]);
    }

    #[test]
    fn negative_dimension_counts_from_end() {
        let (set, _) = normalize(3, &[-1], &[2, 3, 4]).unwrap();
        assert_eq!(set, DimensionSet::Dims([2].into()));
    }

    #[test]
    fn out_of_range_dimension_is_rejected() {
        assert!(normalize(2, &[2], &[3, 4]).is_err());
        assert!(normalize(2, &[-3], &[3, 4]).is_err());
    }

    #[test]
    fn duplicates_collapse_and_order_is_ascending() {
        let (set, shape) = normalize(3, &[2, 0, 2], &[2, 3, 4]).unwrap();
        assert_eq!(set, DimensionSet::Dims([0, 2].into()));
        assert_eq!(shape, [1, 3]);
    }

    #[test]
    fn empty_request_means_whole_array() {
        let (set, shape) = normalize(3, &[], &[2, 3, 4]).unwrap();
        assert_eq!(set, DimensionSet::Whole);
        assert_eq!(shape, [1, 1]);
    }

    #[test]
    fn sentinel_passes_through() {
        let (set, _) = normalize(3, &[WHOLE_DIMENSION], &[2, 3, 4]).unwrap();
        assert_eq!(set, DimensionSet::Whole);
    }

    #[test]
    fn normalize_is_idempotent() {
        for rank in 1..6usize {
            let shape: Vec<usize> = (0..rank).map(|i| i + 2).collect();
            for mask in 1..(1u32 << rank) {
                let requested: Vec<i64> = (0..rank)
                    .filter(|&i| mask & (1 << i) != 0)
                    .map(|i| i as i64)
                    .collect();
                let (set, _) = normalize(rank, &requested, &shape).unwrap();
                let (again, _) = normalize(rank, &set.to_kernel(), &shape).unwrap();
                assert_eq!(set, again);
            }
        }
    }
}
