use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    aggregate::{AggregateCounts, AggregateMemoryBlock, PackedBatch},
    buffer::{Buffer, NdArray},
    shape::ShapeDescriptor,
    tad::TadPlan,
};

/// One operand of a generic-path kernel call: the raw buffer plus its full
/// shape/stride metadata.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub data: &'a Buffer,
    pub shape: &'a Arc<ShapeDescriptor>,
}

impl<'a> From<&'a NdArray> for Operand<'a> {
    fn from(array: &'a NdArray) -> Self {
        Self {
            data: array.data(),
            shape: array.shape(),
        }
    }
}

/// TAD metadata riding along with a dimension-aware kernel call.
#[derive(Debug, Default, Clone)]
pub struct TadArgs {
    pub x: Option<Arc<TadPlan>>,
    pub z: Option<Arc<TadPlan>>,
}

/// Opaque random-generator state shared with the kernel library.
#[derive(Debug, Clone)]
pub struct RngState(Arc<RwLock<Box<[u64]>>>);

impl RngState {
    pub fn new(words: impl Into<Box<[u64]>>) -> Self {
        Self(Arc::new(RwLock::new(words.into())))
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u64]>> {
        self.0.read().expect("rng state poisoned")
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u64]>> {
        self.0.write().expect("rng state poisoned")
    }
}

/// The external kernel catalogue.
///
/// Implementations perform the actual arithmetic; the planner only prepares
/// and validates what they receive. Linear entry points take flat
/// stride/count pairs, the rest take full shape metadata. Argument order per
/// entry point belongs to the catalogue, not to the planner.
#[allow(clippy::too_many_arguments)]
pub trait Kernels: Send + Sync {
    fn pairwise_transform_linear(
        &self,
        op: u32,
        x: &Buffer,
        x_stride: isize,
        y: &Buffer,
        y_stride: isize,
        z: &Buffer,
        z_stride: isize,
        extras: &[f64],
        len: usize,
    );

    fn pairwise_transform(&self, op: u32, x: Operand, y: Operand, z: Operand, extras: &[f64]);

    fn transform_linear(
        &self,
        op: u32,
        x: &Buffer,
        x_stride: isize,
        z: &Buffer,
        z_stride: isize,
        extras: &[f64],
        len: usize,
    );

    fn transform(&self, op: u32, x: Operand, z: Operand, extras: &[f64], tads: &TadArgs);

    fn scalar_linear(
        &self,
        op: u32,
        x: &Buffer,
        x_stride: isize,
        z: &Buffer,
        z_stride: isize,
        scalar: f64,
        extras: &[f64],
        len: usize,
    );

    fn scalar(&self, op: u32, x: Operand, z: Operand, scalar: f64, extras: &[f64]);

    fn scalar_along(
        &self,
        op: u32,
        x: Operand,
        z: Operand,
        scalar: f64,
        extras: &[f64],
        dims: &[i64],
        tads: &TadArgs,
    );

    fn reduce_scalar(&self, op: u32, x: Operand, extras: &[f64]) -> f64;

    fn reduce(&self, op: u32, x: Operand, extras: &[f64], z: Operand, dims: &[i64], tads: &TadArgs);

    fn reduce3_scalar(&self, op: u32, x: Operand, extras: &[f64], y: Operand) -> f64;

    fn reduce3(
        &self,
        op: u32,
        x: Operand,
        extras: &[f64],
        y: Operand,
        z: Operand,
        dims: &[i64],
        tads: &TadArgs,
    );

    fn summary_stats_scalar(&self, op: u32, x: Operand, extras: &[f64], bias_corrected: bool)
    -> f64;

    fn summary_stats(
        &self,
        op: u32,
        x: Operand,
        extras: &[f64],
        z: Operand,
        dims: &[i64],
        tads: &TadArgs,
        bias_corrected: bool,
    );

    fn index_reduce_scalar(&self, op: u32, x: Operand, extras: &[f64]) -> f64;

    fn index_reduce(
        &self,
        op: u32,
        x: Operand,
        extras: &[f64],
        z: Operand,
        dims: &[i64],
        tads: &TadArgs,
    );

    fn broadcast(&self, op: u32, x: Operand, y: Operand, z: Operand, dims: &[i64], tads: &TadArgs);

    fn random_one(&self, op: u32, state: &RngState, z: Operand, extras: &[f64]);

    fn random_two(&self, op: u32, state: &RngState, x: Operand, z: Operand, extras: &[f64]);

    fn random_three(
        &self,
        op: u32,
        state: &RngState,
        x: Operand,
        y: Operand,
        z: Operand,
        extras: &[f64],
    );

    fn aggregate(&self, kind: u32, block: &AggregateMemoryBlock, counts: AggregateCounts);

    fn aggregate_batch(&self, batch: &PackedBatch);

    fn max_threads(&self) -> usize;

    fn set_debug(&self, _enabled: bool) {}

    fn set_verbose(&self, _enabled: bool) {}
}
