use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap as HashMap;

use crate::{
    dims::DimensionSet,
    shape::{ShapeDescriptor, ShapeError, ShapeId, detect_ews},
};

/// Per-slice base offsets of a TAD plan.
///
/// The closed form covers complements of at most one dimension; larger
/// complements get an explicit table. Both address identical elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TadOffsets {
    Linear { stride: isize },
    Table(Arc<[isize]>),
}

/// How to walk an array one tensor-along-dimension at a time: the geometry
/// of a single slice plus the base offset of every slice.
///
/// Plans for the two sides of an operation are always derived independently
/// from their own descriptors; slice `i` of one corresponds to slice `i` of
/// the other because both enumerate their complement dimensions ascending,
/// last varying fastest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TadPlan {
    dims: Vec<usize>,
    strides: Vec<isize>,
    ews: Option<isize>,
    num_slices: usize,
    offsets: TadOffsets,
}

impl TadPlan {
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Element-wise stride of one slice, if it is linearly addressable.
    #[inline]
    pub fn elementwise_stride(&self) -> Option<isize> {
        self.ews
    }

    /// Element count of one slice.
    #[inline]
    pub fn slice_len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn num_slices(&self) -> usize {
        self.num_slices
    }

    #[inline]
    pub fn offsets(&self) -> &TadOffsets {
        &self.offsets
    }

    /// Base offset of slice `index`, in elements.
    #[inline]
    pub fn offset(&self, index: usize) -> isize {
        debug_assert!(index < self.num_slices);
        match &self.offsets {
            TadOffsets::Linear { stride } => index as isize * stride,
            TadOffsets::Table(table) => table[index],
        }
    }
}

/// Compute the TAD plan for holding `set` fixed and varying the rest.
///
/// Only touches shape metadata; `InvalidDimension` is the single failure
/// mode.
pub fn plan(shape: &ShapeDescriptor, set: &DimensionSet) -> Result<TadPlan, ShapeError> {
    let rank = shape.rank();
    let selected = match set {
        DimensionSet::Whole => {
            // one slice covering the whole array
            return Ok(TadPlan {
                dims: shape.dims().to_vec(),
                strides: shape.strides().to_vec(),
                ews: shape.elementwise_stride(),
                num_slices: 1,
                offsets: TadOffsets::Linear { stride: 0 },
            });
        }
        DimensionSet::Dims(selected) => selected,
    };
    for &dim in selected.iter() {
        if dim >= rank {
            return Err(ShapeError::InvalidDimension {
                dim: dim as i64,
                rank,
            });
        }
    }

    let dims: Vec<usize> = selected.iter().map(|&d| shape.dims()[d]).collect();
    let strides: Vec<isize> = selected.iter().map(|&d| shape.strides()[d]).collect();
    let ews = detect_ews(&dims, &strides, shape.order());

    let complement: Vec<usize> = (0..rank).filter(|d| !selected.contains(d)).collect();
    let num_slices = complement.iter().map(|&d| shape.dims()[d]).product();

    let offsets = match complement.as_slice() {
        [] => TadOffsets::Linear { stride: 0 },
        [d] => TadOffsets::Linear {
            stride: shape.strides()[*d],
        },
        _ => TadOffsets::Table(offset_table(shape, &complement, num_slices).into()),
    };

    Ok(TadPlan {
        dims,
        strides,
        ews,
        num_slices,
        offsets,
    })
}

/// Enumerate complement indices, last dimension varying fastest.
fn offset_table(shape: &ShapeDescriptor, complement: &[usize], num_slices: usize) -> Vec<isize> {
    let mut table = Vec::with_capacity(num_slices);
    let mut index = vec![0usize; complement.len()];
    for _ in 0..num_slices {
        let offset = complement
            .iter()
            .zip(index.iter())
            .map(|(&d, &i)| i as isize * shape.strides()[d])
            .sum();
        table.push(offset);

        for k in (0..complement.len()).rev() {
            index[k] += 1;
            if index[k] < shape.dims()[complement[k]] {
                break;
            }
            index[k] = 0;
        }
    }
    table
}

/// Process-wide cache of TAD plans, keyed by shape identity and dimension
/// set.
///
/// Populated lazily, never evicted within a run. Racing misses may compute
/// the same plan twice; exactly one result is stored.
#[derive(Debug, Default)]
pub struct TadCache {
    plans: RwLock<HashMap<(uid::Id<ShapeId>, DimensionSet), Arc<TadPlan>>>,
}

impl TadCache {
    pub fn plan(
        &self,
        shape: &ShapeDescriptor,
        set: &DimensionSet,
    ) -> Result<Arc<TadPlan>, ShapeError> {
        let key = (shape.id(), set.clone());
        if let Some(plan) = self.plans.read().expect("tad cache poisoned").get(&key) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(plan(shape, set)?);
        let mut plans = self.plans.write().expect("tad cache poisoned");
        Ok(plans.entry(key).or_insert(plan).clone())
    }

    pub fn len(&self) -> usize {
        self.plans.read().expect("tad cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached plan. Intended for context teardown only.
    pub fn clear(&self) {
        self.plans.write().expect("tad cache poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::{TadOffsets, plan};
    use crate::{
        dims::{DimensionSet, normalize},
        num::DataType,
        shape::{Order, ShapeDescriptor},
        tad::TadCache,
    };

    fn dim_sets(rank: usize) -> impl Iterator<Item = Vec<usize>> {
        (1..(1u32 << rank)).map(move |mask| {
            (0..rank).filter(|&i| mask & (1 << i) != 0).collect()
        })
    }

    #[test]
    fn slice_count_times_slice_len_equals_total() {
        let shapes = [vec![3, 4], vec![2, 3, 4], vec![5, 1, 2, 3]];
        for dims in shapes {
            for order in [Order::RowMajor, Order::ColMajor] {
                let shape = ShapeDescriptor::contiguous(dims.clone(), order, DataType::F32);
                for selected in dim_sets(shape.rank()) {
                    let requested: Vec<i64> = selected.iter().map(|&d| d as i64).collect();
                    let (set, _) = normalize(shape.rank(), &requested, shape.dims()).unwrap();
                    let tad = plan(&shape, &set).unwrap();
                    assert_eq!(tad.num_slices() * tad.slice_len(), shape.len());
                }
            }
        }
    }

    #[test]
    fn whole_array_is_one_slice() {
        let shape = ShapeDescriptor::contiguous([2, 3, 4], Order::RowMajor, DataType::F64);
        let tad = plan(&shape, &DimensionSet::Whole).unwrap();
        assert_eq!(tad.num_slices(), 1);
        assert_eq!(tad.slice_len(), 24);
        assert_eq!(tad.offset(0), 0);
    }

    #[test]
    fn single_complement_dimension_is_closed_form() {
        let shape = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        let (set, _) = normalize(2, &[1], shape.dims()).unwrap();
        let tad = plan(&shape, &set).unwrap();
        assert_eq!(tad.num_slices(), 3);
        assert_eq!(tad.slice_len(), 4);
        assert!(matches!(tad.offsets(), TadOffsets::Linear { stride: 4 }));
        assert_eq!([tad.offset(0), tad.offset(1), tad.offset(2)], [0, 4, 8]);
    }

    #[test]
    fn offset_table_matches_index_arithmetic() {
        // reduce [2, 3, 4] over dim 1: complement dims {0, 2}
        let shape = ShapeDescriptor::contiguous([2, 3, 4], Order::RowMajor, DataType::F32);
        let (set, _) = normalize(3, &[1], shape.dims()).unwrap();
        let tad = plan(&shape, &set).unwrap();
        assert_eq!(tad.num_slices(), 8);
        assert_eq!(tad.dims(), &[3]);
        assert_eq!(tad.strides(), &[4]);

        let mut expected = Vec::new();
        for i in 0..2isize {
            for k in 0..4isize {
                expected.push(i * 12 + k);
            }
        }
        let actual: Vec<isize> = (0..8).map(|i| tad.offset(i)).collect();
        assert_eq!(actual, expected);
    }

    #[test]
    fn plans_cover_every_element_once() {
        for order in [Order::RowMajor, Order::ColMajor] {
            let shape = ShapeDescriptor::contiguous([2, 3, 4], order, DataType::F32);
            for selected in dim_sets(3) {
                let requested: Vec<i64> = selected.iter().map(|&d| d as i64).collect();
                let (set, _) = normalize(3, &requested, shape.dims()).unwrap();
                let tad = plan(&shape, &set).unwrap();

                let mut seen = vec![false; shape.len()];
                for slice in 0..tad.num_slices() {
                    let base = tad.offset(slice);
                    let mut index = vec![0usize; tad.dims().len()];
                    for _ in 0..tad.slice_len() {
                        let offset: isize = base
                            + index
                                .iter()
                                .zip(tad.strides())
                                .map(|(&i, &s)| i as isize * s)
                                .sum::<isize>();
                        assert!(!seen[offset as usize], "element addressed twice");
                        seen[offset as usize] = true;

                        for k in (0..index.len()).rev() {
                            index[k] += 1;
                            if index[k] < tad.dims()[k] {
                                break;
                            }
                            index[k] = 0;
                        }
                    }
                }
                assert!(seen.iter().all(|&s| s), "element never addressed");
            }
        }
    }

    #[test]
    fn random_shapes_partition_cleanly() {
        fastrand::seed(42);
        for _ in 0..100 {
            let rank = fastrand::usize(1..=4);
            let dims: Vec<usize> = (0..rank).map(|_| fastrand::usize(1..=5)).collect();
            let order = if fastrand::bool() {
                Order::RowMajor
            } else {
                Order::ColMajor
            };
            let shape = ShapeDescriptor::contiguous(dims, order, DataType::F32);
            let requested: Vec<i64> = (0..rank as i64).filter(|_| fastrand::bool()).collect();

            let (set, _) = normalize(rank, &requested, shape.dims()).unwrap();
            let tad = plan(&shape, &set).unwrap();
            assert_eq!(tad.num_slices() * tad.slice_len(), shape.len());

            let mut offsets: Vec<isize> = (0..tad.num_slices()).map(|i| tad.offset(i)).collect();
            offsets.sort_unstable();
            offsets.dedup();
            assert_eq!(offsets.len(), tad.num_slices(), "duplicate slice base");
        }
    }

    #[test]
    fn cache_returns_shared_plans() {
        let cache = TadCache::default();
        let shape = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        let (set, _) = normalize(2, &[1], shape.dims()).unwrap();

        let a = cache.plan(&shape, &set).unwrap();
        let b = cache.plan(&shape, &set).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        // a fresh descriptor with identical geometry has its own identity
        let other = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        let _ = cache.plan(&other, &set).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn out_of_range_dimension_is_rejected() {
        let shape = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        let set = DimensionSet::Dims([2].into());
        assert!(plan(&shape, &set).is_err());
    }
}
