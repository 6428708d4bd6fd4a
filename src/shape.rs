use derive_more::Display;
use itertools::Itertools;
use thiserror::Error;

use crate::num::DataType;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error("dimension {dim} out of range for rank {rank}")]
    InvalidDimension { dim: i64, rank: usize },
    #[error("stride count {strides} does not match dimension count {dims}")]
    StrideCount { dims: usize, strides: usize },
}

/// Storage ordering of a strided array.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Order {
    #[default]
    #[display("c")]
    RowMajor,
    #[display("f")]
    ColMajor,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeId;

/// Immutable view of an array's logical shape and physical layout.
///
/// The descriptor never owns element data; it is the unit of metadata the
/// planner validates and hands to kernel entry points. Its [`uid::Id`]
/// identity keys the TAD plan cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDescriptor {
    dims: Vec<usize>,
    strides: Vec<isize>,
    order: Order,
    r#type: DataType,
    ews: Option<isize>,
    id: uid::Id<ShapeId>,
}

impl std::fmt::Display for ShapeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]:{}:{}",
            self.dims.iter().format(", "),
            self.order,
            self.r#type
        )
    }
}

impl ShapeDescriptor {
    /// Create a descriptor with contiguous strides for the given ordering.
    pub fn contiguous(dims: impl Into<Vec<usize>>, order: Order, r#type: DataType) -> Self {
        let dims = dims.into();
        let strides = contiguous_strides(&dims, order);
        let ews = Some(1);
        let id = uid::Id::new();
        Self {
            dims,
            strides,
            order,
            r#type,
            ews,
            id,
        }
    }

    /// Create a descriptor from explicit strides.
    ///
    /// The element-wise stride is detected from the layout; arrays that are
    /// not linearly addressable get none.
    pub fn from_strides(
        dims: impl Into<Vec<usize>>,
        strides: impl Into<Vec<isize>>,
        order: Order,
        r#type: DataType,
    ) -> Result<Self, ShapeError> {
        let dims = dims.into();
        let strides = strides.into();
        if dims.len() != strides.len() {
            return Err(ShapeError::StrideCount {
                dims: dims.len(),
                strides: strides.len(),
            });
        }
        let ews = detect_ews(&dims, &strides, order);
        let id = uid::Id::new();
        Ok(Self {
            dims,
            strides,
            order,
            r#type,
            ews,
            id,
        })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    #[inline]
    pub fn order(&self) -> Order {
        self.order
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.r#type
    }

    /// The single element-wise stride, if the array is linearly addressable.
    #[inline]
    pub fn elementwise_stride(&self) -> Option<isize> {
        self.ews
    }

    #[inline]
    pub fn id(&self) -> uid::Id<ShapeId> {
        self.id
    }

    /// Total element count.
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length-one arrays of any rank count as scalars.
    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.len() == 1
    }

    #[inline]
    pub fn is_row_vector(&self) -> bool {
        match self.dims.as_slice() {
            [_] => true,
            [1, _] => true,
            _ => false,
        }
    }

    #[inline]
    pub fn is_column_vector(&self) -> bool {
        matches!(self.dims.as_slice(), [_, 1])
    }

    #[inline]
    pub fn is_vector(&self) -> bool {
        self.is_row_vector() || self.is_column_vector()
    }
}

fn contiguous_strides(dims: &[usize], order: Order) -> Vec<isize> {
    let mut strides = vec![1isize; dims.len()];
    match order {
        Order::RowMajor => {
            for i in (0..dims.len().saturating_sub(1)).rev() {
                strides[i] = strides[i + 1] * dims[i + 1] as isize;
            }
        }
        Order::ColMajor => {
            for i in 1..dims.len() {
                strides[i] = strides[i - 1] * dims[i - 1] as isize;
            }
        }
    }
    strides
}

/// Detect whether a layout is walkable with one constant stride.
///
/// Dimensions of size one never constrain the walk and are ignored. A layout
/// qualifies when its strides are a constant multiple of either ordering's
/// contiguous strides; the multiple is the element-wise stride.
pub(crate) fn detect_ews(dims: &[usize], strides: &[isize], order: Order) -> Option<isize> {
    let active = dims
        .iter()
        .zip_eq(strides.iter())
        .filter(|&(&d, _)| d > 1)
        .map(|(&d, &s)| (d, s))
        .collect_vec();
    match active.as_slice() {
        [] => return Some(1),
        [(_, s)] => return Some(*s),
        _ => {}
    }

    let orders = match order {
        Order::RowMajor => [Order::RowMajor, Order::ColMajor],
        Order::ColMajor => [Order::ColMajor, Order::RowMajor],
    };
    let dense: Vec<usize> = active.iter().map(|&(d, _)| d).collect();
    for candidate in orders {
        let contiguous = contiguous_strides(&dense, candidate);
        let innermost = match candidate {
            Order::RowMajor => active[active.len() - 1].1,
            Order::ColMajor => active[0].1,
        };
        if innermost != 0
            && active
                .iter()
                .zip_eq(contiguous.iter())
                .all(|(&(_, s), &c)| s == c * innermost)
        {
            return Some(innermost);
        }
    }
    None
}
