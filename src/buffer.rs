use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::From;
use half::f16;
use thiserror::Error;

use crate::{
    num::{DataType, Scalar},
    shape::ShapeDescriptor,
};

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("array creation error: shape of {0} elements not match data len {1}")]
    Create(usize, usize),
    #[error("array type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
}

#[derive(Debug, Clone, PartialEq, From)]
pub enum Storage {
    F16(Box<[f16]>),
    F32(Box<[f32]>),
    F64(Box<[f64]>),
}

impl Storage {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Storage::F16(data) => data.len(),
            Storage::F32(data) => data.len(),
            Storage::F64(data) => data.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            Storage::F16(_) => DataType::F16,
            Storage::F32(_) => DataType::F32,
            Storage::F64(_) => DataType::F64,
        }
    }

    pub fn fill(&mut self, value: f64) {
        match self {
            Storage::F16(data) => data.fill(f16::from_f64(value)),
            Storage::F32(data) => data.fill(value as f32),
            Storage::F64(data) => data.fill(value),
        }
    }

    /// Typed view of the elements; `None` when `T` is not the stored type.
    pub fn as_slice<T: Scalar>(&self) -> Option<&[T]> {
        if self.data_type() != T::DATA_TYPE {
            return None;
        }
        match self {
            Storage::F16(data) => Some(bytemuck::cast_slice(data)),
            Storage::F32(data) => Some(bytemuck::cast_slice(data)),
            Storage::F64(data) => Some(bytemuck::cast_slice(data)),
        }
    }

    pub fn as_slice_mut<T: Scalar>(&mut self) -> Option<&mut [T]> {
        if self.data_type() != T::DATA_TYPE {
            return None;
        }
        match self {
            Storage::F16(data) => Some(bytemuck::cast_slice_mut(data)),
            Storage::F32(data) => Some(bytemuck::cast_slice_mut(data)),
            Storage::F64(data) => Some(bytemuck::cast_slice_mut(data)),
        }
    }
}

/// A shared handle to one flat element buffer.
///
/// The planner never reads element values; it validates lengths, compares
/// identities, and passes the handle through to kernel entry points.
#[derive(Debug, Clone)]
pub struct Buffer(Arc<RwLock<Storage>>);

impl From<Storage> for Buffer {
    fn from(value: Storage) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }
}

impl From<Vec<f16>> for Buffer {
    fn from(value: Vec<f16>) -> Self {
        Storage::F16(value.into()).into()
    }
}

impl From<Vec<f32>> for Buffer {
    fn from(value: Vec<f32>) -> Self {
        Storage::F32(value.into()).into()
    }
}

impl From<Vec<f64>> for Buffer {
    fn from(value: Vec<f64>) -> Self {
        Storage::F64(value.into()).into()
    }
}

impl Buffer {
    pub fn zeros(r#type: DataType, len: usize) -> Self {
        Self::filled(r#type, len, 0.0)
    }

    pub fn filled(r#type: DataType, len: usize, value: f64) -> Self {
        match r#type {
            DataType::F16 => vec![f16::from_f64(value); len].into(),
            DataType::F32 => vec![value as f32; len].into(),
            DataType::F64 => vec![value; len].into(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.read().data_type()
    }

    pub fn fill(&self, value: f64) {
        self.write().fill(value);
    }

    /// Whether two handles refer to the same underlying storage.
    #[inline]
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A stable word-sized identity for this buffer, used when packing
    /// buffer-argument regions of aggregate batches.
    #[inline]
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.0.read().expect("buffer poisoned")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.0.write().expect("buffer poisoned")
    }
}

/// A shape descriptor paired with the buffer backing it.
#[derive(Debug, Clone)]
pub struct NdArray {
    shape: Arc<ShapeDescriptor>,
    data: Buffer,
}

impl NdArray {
    pub fn new(shape: Arc<ShapeDescriptor>, data: Buffer) -> Result<Self, ArrayError> {
        if shape.len() != data.len() {
            return Err(ArrayError::Create(shape.len(), data.len()));
        }
        if shape.data_type() != data.data_type() {
            return Err(ArrayError::Type(data.data_type(), shape.data_type()));
        }
        Ok(Self { shape, data })
    }

    /// Create an array of `value` over a fresh contiguous buffer.
    pub fn filled(shape: Arc<ShapeDescriptor>, value: f64) -> Self {
        let data = Buffer::filled(shape.data_type(), shape.len(), value);
        Self { shape, data }
    }

    pub fn zeros(shape: Arc<ShapeDescriptor>) -> Self {
        Self::filled(shape, 0.0)
    }

    #[inline]
    pub fn shape(&self) -> &Arc<ShapeDescriptor> {
        &self.shape
    }

    #[inline]
    pub fn data(&self) -> &Buffer {
        &self.data
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.shape.data_type()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Buffer, NdArray, Storage};
    use crate::{
        num::DataType,
        shape::{Order, ShapeDescriptor},
    };

    #[test]
    fn create_validates_length_and_type() {
        let shape = Arc::new(ShapeDescriptor::contiguous(
            [3, 4],
            Order::RowMajor,
            DataType::F32,
        ));
        assert!(NdArray::new(shape.clone(), Buffer::zeros(DataType::F32, 12)).is_ok());
        assert!(NdArray::new(shape.clone(), Buffer::zeros(DataType::F32, 10)).is_err());
        assert!(NdArray::new(shape, Buffer::zeros(DataType::F64, 12)).is_err());
    }

    #[test]
    fn handles_share_storage() {
        let buffer = Buffer::zeros(DataType::F32, 4);
        let alias = buffer.clone();
        assert!(buffer.ptr_eq(&alias));
        assert_eq!(buffer.address(), alias.address());

        alias.fill(2.0);
        match &*buffer.read() {
            Storage::F32(data) => assert_eq!(data.as_ref(), &[2.0; 4]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn typed_views_check_the_element_type() {
        let buffer = Buffer::filled(DataType::F32, 3, 1.5);
        let storage = buffer.read();
        assert_eq!(storage.as_slice::<f32>(), Some([1.5f32; 3].as_slice()));
        assert_eq!(storage.as_slice::<f64>(), None);
        drop(storage);

        buffer
            .write()
            .as_slice_mut::<f32>()
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0]);
        match &*buffer.read() {
            Storage::F32(data) => assert_eq!(data.as_ref(), &[1.0, 2.0, 3.0]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn distinct_buffers_have_distinct_addresses() {
        let a = Buffer::zeros(DataType::F32, 4);
        let b = Buffer::zeros(DataType::F32, 4);
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.address(), b.address());
    }
}
