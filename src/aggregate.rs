use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use crate::{buffer::Buffer, num::DataType, shape::ShapeDescriptor};

/// Maximum number of operations packed into one batch buffer.
pub const BATCH_LIMIT: usize = 512;

/// Integers in the per-operation counts header.
pub const HEADER_INTS: usize = 5;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("aggregate kind {kind}: {category} count {actual} exceeds declared maximum {max}")]
    CapacityExceeded {
        kind: u32,
        category: &'static str,
        actual: usize,
        max: usize,
    },
    #[error("no aggregate kernel for {0} precision")]
    UnsupportedPrecision(DataType),
    #[error("aggregate kind {actual} staged into a block keyed for kind {expected}")]
    KindMismatch { expected: u32, actual: u32 },
}

/// Per-kind maxima for every argument category.
///
/// These are fixed per operation kind, not per instance; batch regions are
/// sized from them so each operation's slot is independently addressable.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AggregateLimits {
    pub max_arguments: usize,
    pub max_shapes: usize,
    pub max_int_arrays: usize,
    pub max_int_array_size: usize,
    pub max_index_arguments: usize,
    pub max_real_arguments: usize,
}

/// One unit of batched composite/random work.
#[derive(Debug, Clone)]
pub struct AggregateOp {
    pub kind: u32,
    pub limits: AggregateLimits,
    pub arguments: Vec<Option<Buffer>>,
    pub shapes: Vec<Arc<ShapeDescriptor>>,
    pub index_arguments: Vec<i32>,
    pub real_arguments: Vec<f64>,
    pub int_array_arguments: Vec<Vec<i32>>,
}

impl AggregateOp {
    /// Check every argument count against the kind's declared maxima.
    pub fn validate(&self) -> Result<(), AggregateError> {
        self.validate_against(&self.limits)
    }

    fn validate_against(&self, limits: &AggregateLimits) -> Result<(), AggregateError> {
        let checks = [
            ("argument", self.arguments.len(), limits.max_arguments),
            ("shape", self.shapes.len(), limits.max_shapes),
            ("int array", self.int_array_arguments.len(), limits.max_int_arrays),
            (
                "indexing argument",
                self.index_arguments.len(),
                limits.max_index_arguments,
            ),
            (
                "real argument",
                self.real_arguments.len(),
                limits.max_real_arguments,
            ),
        ];
        for (category, actual, max) in checks {
            if actual > max {
                return Err(AggregateError::CapacityExceeded {
                    kind: self.kind,
                    category,
                    actual,
                    max,
                });
            }
        }
        for array in &self.int_array_arguments {
            if array.len() > limits.max_int_array_size {
                return Err(AggregateError::CapacityExceeded {
                    kind: self.kind,
                    category: "int array size",
                    actual: array.len(),
                    max: limits.max_int_array_size,
                });
            }
        }
        Ok(())
    }
}

/// Real-argument scratch at the configured precision.
#[derive(Debug, Clone)]
pub enum RealScratch {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Actual argument counts of one staged operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct AggregateCounts {
    pub arguments: usize,
    pub shapes: usize,
    pub index_arguments: usize,
    pub real_arguments: usize,
    pub int_arrays: usize,
}

/// Reusable scratch sized to one aggregate kind's maxima.
///
/// One block is allocated per distinct kind per execution context and lives
/// as long as the context. It is reused across calls of the same kind only;
/// staging a different kind requires a different block.
#[derive(Debug, Clone)]
pub struct AggregateMemoryBlock {
    kind: u32,
    limits: AggregateLimits,
    index_arguments: Vec<i32>,
    real_arguments: RealScratch,
    int_arrays: Vec<Vec<i32>>,
    argument_addresses: Vec<usize>,
    shape_addresses: Vec<usize>,
}

impl AggregateMemoryBlock {
    pub fn new(
        kind: u32,
        limits: AggregateLimits,
        precision: DataType,
    ) -> Result<Self, AggregateError> {
        let real_arguments = match precision {
            DataType::F32 => RealScratch::F32(vec![0.0; limits.max_real_arguments]),
            DataType::F64 => RealScratch::F64(vec![0.0; limits.max_real_arguments]),
            DataType::F16 => return Err(AggregateError::UnsupportedPrecision(precision)),
        };
        Ok(Self {
            kind,
            limits,
            index_arguments: vec![0; limits.max_index_arguments],
            real_arguments,
            int_arrays: vec![vec![0; limits.max_int_array_size]; limits.max_int_arrays],
            argument_addresses: vec![0; limits.max_arguments],
            shape_addresses: vec![0; limits.max_shapes],
        })
    }

    #[inline]
    pub fn kind(&self) -> u32 {
        self.kind
    }

    #[inline]
    pub fn limits(&self) -> AggregateLimits {
        self.limits
    }

    /// Copy one operation's arguments into the block's storage.
    ///
    /// An operation whose counts exceed the block's original maxima is a
    /// programming-contract violation, never a silent truncation.
    pub fn stage(&mut self, op: &AggregateOp) -> Result<AggregateCounts, AggregateError> {
        if op.kind != self.kind {
            return Err(AggregateError::KindMismatch {
                expected: self.kind,
                actual: op.kind,
            });
        }
        op.validate_against(&self.limits)?;

        for (slot, argument) in self.argument_addresses.iter_mut().zip(op.arguments.iter()) {
            *slot = argument.as_ref().map_or(0, Buffer::address);
        }
        for (slot, shape) in self.shape_addresses.iter_mut().zip(op.shapes.iter()) {
            *slot = Arc::as_ptr(shape) as usize;
        }
        self.index_arguments[..op.index_arguments.len()].copy_from_slice(&op.index_arguments);
        match &mut self.real_arguments {
            RealScratch::F32(reals) => {
                for (slot, &real) in reals.iter_mut().zip(op.real_arguments.iter()) {
                    *slot = real as f32;
                }
            }
            RealScratch::F64(reals) => {
                reals[..op.real_arguments.len()].copy_from_slice(&op.real_arguments);
            }
        }
        for (slot, array) in self.int_arrays.iter_mut().zip(op.int_array_arguments.iter()) {
            slot[..array.len()].copy_from_slice(array);
        }

        Ok(AggregateCounts {
            arguments: op.arguments.len(),
            shapes: op.shapes.len(),
            index_arguments: op.index_arguments.len(),
            real_arguments: op.real_arguments.len(),
            int_arrays: op.int_array_arguments.len(),
        })
    }

    #[inline]
    pub fn argument_addresses(&self) -> &[usize] {
        &self.argument_addresses
    }

    #[inline]
    pub fn shape_addresses(&self) -> &[usize] {
        &self.shape_addresses
    }

    #[inline]
    pub fn index_arguments(&self) -> &[i32] {
        &self.index_arguments
    }

    #[inline]
    pub fn real_arguments(&self) -> &RealScratch {
        &self.real_arguments
    }

    #[inline]
    pub fn int_arrays(&self) -> &[Vec<i32>] {
        &self.int_arrays
    }
}

/// Byte offset and per-operation byte stride of one batch region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: usize,
    pub stride: usize,
}

impl Region {
    /// Byte offset of operation `index`'s slot.
    #[inline]
    pub fn slot(&self, index: usize) -> usize {
        self.base + index * self.stride
    }
}

/// Fixed region layout of one batch buffer.
///
/// Regions in order: counts header, indexing arguments, flattened int
/// arrays, real arguments (element size follows the configured precision),
/// buffer-argument addresses, shape-metadata addresses. Every region is
/// sized by the kind's maxima times [`BATCH_LIMIT`], not by actual counts,
/// which wastes some space but keeps every slot independently addressable.
#[derive(Debug, Clone, Copy)]
pub struct BatchLayout {
    pub header: Region,
    pub index: Region,
    pub int_arrays: Region,
    pub real: Region,
    pub arguments: Region,
    pub shapes: Region,
    pub total: usize,
}

impl BatchLayout {
    pub fn new(limits: AggregateLimits, precision: DataType) -> Self {
        const WORD: usize = size_of::<usize>();
        let header = Region {
            base: 0,
            stride: HEADER_INTS * 4,
        };
        let index = Region {
            base: header.base + BATCH_LIMIT * header.stride,
            stride: limits.max_index_arguments * 4,
        };
        let int_arrays = Region {
            base: index.base + BATCH_LIMIT * index.stride,
            stride: limits.max_int_arrays * limits.max_int_array_size * 4,
        };
        let real = Region {
            base: int_arrays.base + BATCH_LIMIT * int_arrays.stride,
            stride: limits.max_real_arguments * precision.size(),
        };
        let arguments = Region {
            base: real.base + BATCH_LIMIT * real.stride,
            stride: limits.max_arguments * WORD,
        };
        let shapes = Region {
            base: arguments.base + BATCH_LIMIT * arguments.stride,
            stride: limits.max_shapes * WORD,
        };
        let total = shapes.base + BATCH_LIMIT * shapes.stride;
        Self {
            header,
            index,
            int_arrays,
            real,
            arguments,
            shapes,
            total,
        }
    }
}

/// One flat buffer holding up to [`BATCH_LIMIT`] operations of one kind,
/// ready for a single downstream batched kernel call.
#[derive(Debug, Clone)]
pub struct PackedBatch {
    kind: u32,
    limits: AggregateLimits,
    precision: DataType,
    len: usize,
    layout: BatchLayout,
    data: Vec<u8>,
}

impl PackedBatch {
    #[inline]
    pub fn kind(&self) -> u32 {
        self.kind
    }

    #[inline]
    pub fn limits(&self) -> AggregateLimits {
        self.limits
    }

    #[inline]
    pub fn precision(&self) -> DataType {
        self.precision
    }

    /// Number of operations in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.data[offset..offset + 4].try_into().expect("batch read"))
    }

    fn read_word(&self, offset: usize) -> usize {
        const WORD: usize = size_of::<usize>();
        usize::from_le_bytes(
            self.data[offset..offset + WORD]
                .try_into()
                .expect("batch read"),
        )
    }

    /// Counts header of operation `index`: arguments, shapes, indexing
    /// arguments, real arguments, int-array arguments.
    pub fn counts(&self, index: usize) -> [i32; HEADER_INTS] {
        let slot = self.layout.header.slot(index);
        std::array::from_fn(|i| self.read_i32(slot + i * 4))
    }

    pub fn index_arguments(&self, index: usize) -> Vec<i32> {
        let count = self.counts(index)[2] as usize;
        let slot = self.layout.index.slot(index);
        (0..count).map(|e| self.read_i32(slot + e * 4)).collect()
    }

    pub fn int_array(&self, index: usize, array: usize) -> Vec<i32> {
        let slot = self.layout.int_arrays.slot(index) + array * self.limits.max_int_array_size * 4;
        (0..self.limits.max_int_array_size)
            .map(|e| self.read_i32(slot + e * 4))
            .collect()
    }

    pub fn real_arguments(&self, index: usize) -> Vec<f64> {
        let count = self.counts(index)[3] as usize;
        let slot = self.layout.real.slot(index);
        (0..count)
            .map(|e| match self.precision {
                DataType::F32 => {
                    let offset = slot + e * 4;
                    f32::from_le_bytes(
                        self.data[offset..offset + 4].try_into().expect("batch read"),
                    ) as f64
                }
                _ => {
                    let offset = slot + e * 8;
                    f64::from_le_bytes(
                        self.data[offset..offset + 8].try_into().expect("batch read"),
                    )
                }
            })
            .collect()
    }

    pub fn argument_addresses(&self, index: usize) -> Vec<usize> {
        const WORD: usize = size_of::<usize>();
        let count = self.counts(index)[0] as usize;
        let slot = self.layout.arguments.slot(index);
        (0..count).map(|e| self.read_word(slot + e * WORD)).collect()
    }

    pub fn shape_addresses(&self, index: usize) -> Vec<usize> {
        const WORD: usize = size_of::<usize>();
        let count = self.counts(index)[1] as usize;
        let slot = self.layout.shapes.slot(index);
        (0..count).map(|e| self.read_word(slot + e * WORD)).collect()
    }
}

fn write_i32(data: &mut [u8], offset: usize, value: i32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_word(data: &mut [u8], offset: usize, value: usize) {
    const WORD: usize = size_of::<usize>();
    data[offset..offset + WORD].copy_from_slice(&value.to_le_bytes());
}

/// Lay out a list of heterogeneous aggregate operations into flat batch
/// buffers.
///
/// Operations are grouped by kind in encounter order; each group splits into
/// chunks of at most [`BATCH_LIMIT`]. Operations of different kinds never
/// share a batch.
pub fn pack(ops: &[AggregateOp], precision: DataType) -> Result<Vec<PackedBatch>, AggregateError> {
    if matches!(precision, DataType::F16) {
        return Err(AggregateError::UnsupportedPrecision(precision));
    }

    let mut batches = Vec::new();
    for (kind, group) in &ops.iter().chunk_by(|op| op.kind) {
        let group = group.collect_vec();
        for chunk in group.chunks(BATCH_LIMIT) {
            batches.push(pack_chunk(kind, chunk, precision)?);
        }
    }
    Ok(batches)
}

fn pack_chunk(
    kind: u32,
    chunk: &[&AggregateOp],
    precision: DataType,
) -> Result<PackedBatch, AggregateError> {
    const WORD: usize = size_of::<usize>();
    let limits = chunk[0].limits;
    let layout = BatchLayout::new(limits, precision);
    let mut data = vec![0u8; layout.total];

    for (i, op) in chunk.iter().enumerate() {
        op.validate_against(&limits)?;

        let slot = layout.header.slot(i);
        write_i32(&mut data, slot, op.arguments.len() as i32);
        write_i32(&mut data, slot + 4, op.shapes.len() as i32);
        write_i32(&mut data, slot + 8, op.index_arguments.len() as i32);
        write_i32(&mut data, slot + 12, op.real_arguments.len() as i32);
        write_i32(&mut data, slot + 16, op.int_array_arguments.len() as i32);

        let slot = layout.index.slot(i);
        for (e, &value) in op.index_arguments.iter().enumerate() {
            write_i32(&mut data, slot + e * 4, value);
        }

        let slot = layout.int_arrays.slot(i);
        for (e, array) in op.int_array_arguments.iter().enumerate() {
            let step = slot + e * limits.max_int_array_size * 4;
            for (x, &value) in array.iter().enumerate() {
                write_i32(&mut data, step + x * 4, value);
            }
        }

        let slot = layout.real.slot(i);
        for (e, &value) in op.real_arguments.iter().enumerate() {
            match precision {
                DataType::F32 => data[slot + e * 4..slot + e * 4 + 4]
                    .copy_from_slice(&(value as f32).to_le_bytes()),
                _ => data[slot + e * 8..slot + e * 8 + 8].copy_from_slice(&value.to_le_bytes()),
            }
        }

        let slot = layout.arguments.slot(i);
        for (e, argument) in op.arguments.iter().enumerate() {
            write_word(
                &mut data,
                slot + e * WORD,
                argument.as_ref().map_or(0, Buffer::address),
            );
        }

        let slot = layout.shapes.slot(i);
        for (e, shape) in op.shapes.iter().enumerate() {
            write_word(&mut data, slot + e * WORD, Arc::as_ptr(shape) as usize);
        }
    }

    Ok(PackedBatch {
        kind,
        limits,
        precision,
        len: chunk.len(),
        layout,
        data,
    })
}
