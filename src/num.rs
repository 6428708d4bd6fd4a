use bytemuck::Pod;
use derive_more::Display;
use half::f16;

/// The fixed set of element precisions the planner knows how to route.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DataType {
    F16,
    #[default]
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }
}

pub trait Scalar: Sized + Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;

    fn from_f64(value: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    fn from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }

    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    const DATA_TYPE: DataType = DataType::F64;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}

mod sealed {
    use half::f16;

    pub trait Sealed {}

    impl Sealed for f16 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}
