use derive_more::Display;

use crate::shape::ShapeDescriptor;

/// Addressing strategy for one kernel call.
///
/// `Linear` hands the kernel a flat stride and count per operand, the
/// cheapest addressing mode. `Strided` hands it full shape/stride metadata.
/// The choice is re-derived on every call and never cached: the same logical
/// operation may see differently laid out arrays next time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ExecPath {
    #[display("linear({len})")]
    Linear { len: usize },
    #[display("strided")]
    Strided,
}

#[inline]
fn ews(shape: &ShapeDescriptor) -> Option<isize> {
    shape.elementwise_stride().filter(|&s| s >= 1)
}

/// Path selection for two-operand (pairwise) transforms.
///
/// Linear addressing needs x and y to share one stride and all three
/// orderings to agree; the one exception is three row vectors walked with
/// the same stride, which are linear regardless of ordering tags.
pub fn select_pairwise(
    special: bool,
    x: &ShapeDescriptor,
    y: &ShapeDescriptor,
    z: &ShapeDescriptor,
) -> ExecPath {
    if special {
        return ExecPath::Strided;
    }
    let (Some(xs), Some(ys), Some(zs)) = (ews(x), ews(y), ews(z)) else {
        return ExecPath::Strided;
    };
    let aligned = xs == ys && x.order() == y.order() && x.order() == z.order();
    let rows = xs == ys && xs == zs && x.is_row_vector() && y.is_row_vector() && z.is_row_vector();
    if aligned || rows {
        ExecPath::Linear { len: x.len() }
    } else {
        ExecPath::Strided
    }
}

/// Path selection for one-operand transforms.
pub fn select_unary(special: bool, x: &ShapeDescriptor, z: &ShapeDescriptor) -> ExecPath {
    if special {
        return ExecPath::Strided;
    }
    match (ews(x), ews(z)) {
        (Some(_), Some(_)) if x.order() == z.order() => ExecPath::Linear { len: x.len() },
        _ => ExecPath::Strided,
    }
}

/// Path selection for scalar ops: orderings do not matter, only linear
/// addressability of both sides.
pub fn select_scalar(special: bool, x: &ShapeDescriptor, z: &ShapeDescriptor) -> ExecPath {
    if special {
        return ExecPath::Strided;
    }
    match (ews(x), ews(z)) {
        (Some(_), Some(_)) => ExecPath::Linear { len: x.len() },
        _ => ExecPath::Strided,
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecPath, select_pairwise, select_scalar, select_unary};
    use crate::{
        num::DataType,
        shape::{Order, ShapeDescriptor},
    };

    fn vec100() -> ShapeDescriptor {
        ShapeDescriptor::contiguous([100], Order::RowMajor, DataType::F32)
    }

    #[test]
    fn equal_stride_vectors_go_linear() {
        let (x, y, z) = (vec100(), vec100(), vec100());
        assert_eq!(
            select_pairwise(false, &x, &y, &z),
            ExecPath::Linear { len: 100 }
        );
    }

    #[test]
    fn special_ops_always_go_strided() {
        let (x, y, z) = (vec100(), vec100(), vec100());
        assert_eq!(select_pairwise(true, &x, &y, &z), ExecPath::Strided);
        assert_eq!(select_unary(true, &x, &z), ExecPath::Strided);
        assert_eq!(select_scalar(true, &x, &z), ExecPath::Strided);
    }

    #[test]
    fn ordering_mismatch_goes_strided() {
        let x = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        let y = ShapeDescriptor::contiguous([3, 4], Order::ColMajor, DataType::F32);
        let z = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        assert_eq!(select_pairwise(false, &x, &y, &z), ExecPath::Strided);
        assert_eq!(select_unary(false, &x, &y), ExecPath::Strided);
    }

    #[test]
    fn row_vectors_ignore_ordering_tags() {
        let x = ShapeDescriptor::contiguous([1, 64], Order::RowMajor, DataType::F32);
        let y = ShapeDescriptor::contiguous([1, 64], Order::ColMajor, DataType::F32);
        let z = ShapeDescriptor::contiguous([1, 64], Order::ColMajor, DataType::F32);
        assert_eq!(
            select_pairwise(false, &x, &y, &z),
            ExecPath::Linear { len: 64 }
        );
    }

    #[test]
    fn missing_elementwise_stride_goes_strided() {
        let x = ShapeDescriptor::from_strides([3, 4], [4, 3], Order::RowMajor, DataType::F32)
            .unwrap();
        let z = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        assert_eq!(select_unary(false, &x, &z), ExecPath::Strided);
        assert_eq!(select_scalar(false, &x, &z), ExecPath::Strided);
    }

    #[test]
    fn stride_mismatch_between_operands_goes_strided() {
        let x = vec100();
        let y = ShapeDescriptor::from_strides([100], [2], Order::RowMajor, DataType::F32).unwrap();
        let z = vec100();
        assert_eq!(select_pairwise(false, &x, &y, &z), ExecPath::Strided);
    }

    #[test]
    fn scalar_path_ignores_ordering() {
        let x = ShapeDescriptor::contiguous([3, 4], Order::RowMajor, DataType::F32);
        let z = ShapeDescriptor::contiguous([3, 4], Order::ColMajor, DataType::F32);
        assert_eq!(select_scalar(false, &x, &z), ExecPath::Linear { len: 12 });
    }
}
