use std::{collections::hash_map::Entry, sync::Arc};

use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;

use crate::{
    aggregate::{AggregateError, AggregateMemoryBlock, AggregateOp, pack},
    buffer::{ArrayError, NdArray},
    dims::normalize,
    kernel::{Kernels, RngState, TadArgs},
    num::DataType,
    path::{ExecPath, select_pairwise, select_scalar, select_unary},
    scratch::{ConstantBuffers, ScratchPool},
    shape::{ShapeDescriptor, ShapeError},
    tad::TadCache,
};

/// Transform writing an indicator at the maximum position; its target
/// dimensions ride inside the extra-argument list (slot 0 holds the count).
pub const IS_MAX: u32 = 41;

const DEBUG_ENABLED: &str = "WEFT_DEBUG";
const VERBOSE: &str = "WEFT_VERBOSE";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("target array shape {actual:?} doesn't match expected {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("x length {x} should be equal to z length {z}")]
    LengthMismatch { x: usize, z: usize },
    #[error("in-place operation requested on a view with a different layout")]
    IllegalInPlace,
    #[error("reference execution requested with no reference executor")]
    NoReferenceExecutor,
}

/// Scalar op: applies `scalar` to every element of `x` into `z`.
///
/// An attached dimension list routes the op through the TAD path instead of
/// the flat elementwise one.
#[derive(Debug, Clone)]
pub struct ScalarOp {
    pub num: u32,
    pub x: NdArray,
    pub z: NdArray,
    pub scalar: f64,
    pub dims: Option<Vec<i64>>,
    pub extras: Vec<f64>,
    pub special: bool,
}

/// Unary (`y` absent) or pairwise (`y` present) elementwise transform.
#[derive(Debug, Clone)]
pub struct TransformOp {
    pub num: u32,
    pub x: NdArray,
    pub y: Option<NdArray>,
    pub z: NdArray,
    pub extras: Vec<f64>,
    pub special: bool,
}

#[derive(Debug, Clone)]
pub enum ReduceVariant {
    Plain,
    /// Pairwise reduction against a second operand, e.g. a distance.
    Pairwise { y: NdArray },
    /// Summary-statistics reduction; the flag changes the numeric formula
    /// but not the shape or dispatch logic.
    Variance { bias_corrected: bool },
}

/// Reduction over a dimension subset of `x`.
///
/// `initial` seeds the destination buffer before the kernel accumulates
/// into it. An absent `z`, or one aliasing `x`'s buffer, means a fresh
/// destination of the planned output shape.
#[derive(Debug, Clone)]
pub struct ReduceOp {
    pub num: u32,
    pub x: NdArray,
    pub z: Option<NdArray>,
    pub dims: Vec<i64>,
    pub variant: ReduceVariant,
    pub extras: Vec<f64>,
    pub initial: f64,
}

/// Reduction yielding element indices rather than values.
#[derive(Debug, Clone)]
pub struct IndexReduceOp {
    pub num: u32,
    pub x: NdArray,
    pub z: Option<NdArray>,
    pub dims: Vec<i64>,
    pub extras: Vec<f64>,
    pub initial: f64,
}

/// Applies `y` across `x` along the requested dimensions into `z`.
#[derive(Debug, Clone)]
pub struct BroadcastOp {
    pub num: u32,
    pub x: NdArray,
    pub y: NdArray,
    pub z: NdArray,
    pub dims: Vec<i64>,
}

/// Random-number fill; operand arity selects the kernel entry point.
///
/// `y` participates only together with `x`: a lone `y` is ignored and the
/// call routes as zero-operand.
#[derive(Debug, Clone)]
pub struct RandomOp {
    pub num: u32,
    pub x: Option<NdArray>,
    pub y: Option<NdArray>,
    pub z: NdArray,
    pub extras: Vec<f64>,
    pub state: RngState,
}

/// The closed set of operation kinds the dispatcher routes.
#[derive(Debug, Clone)]
pub enum Op {
    Scalar(ScalarOp),
    Transform(TransformOp),
    Reduce(ReduceOp),
    IndexReduce(IndexReduceOp),
    Broadcast(BroadcastOp),
    Random(RandomOp),
    Aggregate(AggregateOp),
    AggregateBatch(Vec<AggregateOp>),
}

/// Which executor handles array ops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Native,
    /// Bypass planning entirely and hand every op to the reference
    /// executor.
    Reference,
}

/// The non-optimized generic executor used in [`Mode::Reference`].
pub trait Fallback: Send + Sync {
    fn exec(&self, op: &Op) -> Result<NdArray, ExecError>;
}

/// Environment capability report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub backend: &'static str,
    pub max_threads: usize,
}

/// Per-worker mutable state: scratch storage plus one aggregate memory
/// block per kind encountered.
///
/// A context belongs to exactly one worker and is passed by reference into
/// every call; it must never be shared between workers.
#[derive(Debug, Default)]
pub struct ExecContext {
    pub scratch: ScratchPool,
    blocks: HashMap<u32, AggregateMemoryBlock>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of aggregate kinds this context has allocated blocks for.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

pub struct DispatcherBuilder {
    kernels: Arc<dyn Kernels>,
    fallback: Option<Arc<dyn Fallback>>,
    mode: Mode,
    precision: DataType,
}

impl DispatcherBuilder {
    pub fn new(kernels: impl Kernels + 'static) -> Self {
        Self {
            kernels: Arc::new(kernels),
            fallback: None,
            mode: Mode::default(),
            precision: DataType::default(),
        }
    }

    pub fn fallback(mut self, fallback: impl Fallback + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Numeric precision used when packing aggregate real arguments.
    pub fn precision(mut self, precision: DataType) -> Self {
        self.precision = precision;
        self
    }

    pub fn build(self) -> Dispatcher {
        if let Ok(value) = std::env::var(DEBUG_ENABLED) {
            match value.parse() {
                Ok(enabled) => self.kernels.set_debug(enabled),
                Err(_) => log::error!("can't parse {DEBUG_ENABLED}: [{value}]"),
            }
        }
        if let Ok(value) = std::env::var(VERBOSE) {
            match value.parse() {
                Ok(enabled) => self.kernels.set_verbose(enabled),
                Err(_) => log::error!("can't parse {VERBOSE}: [{value}]"),
            }
        }
        Dispatcher {
            kernels: self.kernels,
            fallback: self.fallback,
            mode: self.mode,
            precision: self.precision,
            tads: TadCache::default(),
            constants: ConstantBuffers::default(),
        }
    }
}

/// The top-level entry point: classifies each operation, plans its shapes,
/// TADs and addressing, and issues exactly one validated kernel call.
///
/// The dispatcher itself is immutable and shareable; all per-call mutable
/// state lives in the caller's [`ExecContext`].
pub struct Dispatcher {
    kernels: Arc<dyn Kernels>,
    fallback: Option<Arc<dyn Fallback>>,
    mode: Mode,
    precision: DataType,
    tads: TadCache,
    constants: ConstantBuffers,
}

impl Dispatcher {
    /// Classify and execute one operation. Array ops return their
    /// destination; aggregates return nothing.
    pub fn exec(&self, ctx: &mut ExecContext, op: Op) -> Result<Option<NdArray>, ExecError> {
        match op {
            Op::Scalar(op) => self.exec_scalar(ctx, op).map(Some),
            Op::Transform(op) => self.exec_transform(ctx, op).map(Some),
            Op::Reduce(op) => self.exec_reduce(ctx, op).map(Some),
            Op::IndexReduce(op) => self.exec_index_reduce(ctx, op).map(Some),
            Op::Broadcast(op) => self.exec_broadcast(ctx, op).map(Some),
            Op::Random(op) => self.exec_random(ctx, op).map(Some),
            Op::Aggregate(op) => self.exec_aggregate(ctx, &op).map(|()| None),
            Op::AggregateBatch(ops) => self.exec_aggregates(&ops).map(|()| None),
        }
    }

    fn reference(&self, op: Op) -> Result<NdArray, ExecError> {
        log::debug!("routing op to the reference executor");
        match &self.fallback {
            Some(fallback) => fallback.exec(&op),
            None => Err(ExecError::NoReferenceExecutor),
        }
    }

    pub fn exec_reduce(&self, ctx: &mut ExecContext, op: ReduceOp) -> Result<NdArray, ExecError> {
        if self.mode == Mode::Reference {
            return self.reference(Op::Reduce(op));
        }
        let ReduceOp {
            num,
            x,
            z,
            dims,
            variant,
            extras,
            initial,
        } = op;

        let (set, out_shape) = normalize(x.shape().rank(), &dims, x.shape().dims())?;
        let out_len: usize = out_shape.iter().product();

        // a reduction that would not actually reduce a vector is a no-op,
        // preserved as a compatibility contract
        if x.shape().is_vector() && x.len() == out_len && out_len > 1 {
            return Ok(x);
        }

        let z = self.reduce_destination(&x, z, &out_shape, initial)?;
        let tads = TadArgs {
            x: Some(self.tads.plan(x.shape(), &set)?),
            z: None,
        };
        let dim_buffer = self.constants.get(&set);
        let extras = ctx.scratch.stage_extras(&extras);

        if z.shape().is_scalar() {
            let value = match &variant {
                ReduceVariant::Plain => self.kernels.reduce_scalar(num, (&x).into(), extras),
                ReduceVariant::Pairwise { y } => {
                    self.kernels
                        .reduce3_scalar(num, (&x).into(), extras, y.into())
                }
                ReduceVariant::Variance { bias_corrected } => {
                    self.kernels
                        .summary_stats_scalar(num, (&x).into(), extras, *bias_corrected)
                }
            };
            z.data().fill(value);
        } else {
            match &variant {
                ReduceVariant::Plain => self.kernels.reduce(
                    num,
                    (&x).into(),
                    extras,
                    (&z).into(),
                    &dim_buffer,
                    &tads,
                ),
                ReduceVariant::Pairwise { y } => self.kernels.reduce3(
                    num,
                    (&x).into(),
                    extras,
                    y.into(),
                    (&z).into(),
                    &dim_buffer,
                    &tads,
                ),
                ReduceVariant::Variance { bias_corrected } => self.kernels.summary_stats(
                    num,
                    (&x).into(),
                    extras,
                    (&z).into(),
                    &dim_buffer,
                    &tads,
                    *bias_corrected,
                ),
            }
        }
        Ok(z)
    }

    pub fn exec_index_reduce(
        &self,
        ctx: &mut ExecContext,
        op: IndexReduceOp,
    ) -> Result<NdArray, ExecError> {
        if self.mode == Mode::Reference {
            return self.reference(Op::IndexReduce(op));
        }
        let IndexReduceOp {
            num,
            x,
            z,
            dims,
            extras,
            initial,
        } = op;

        let (set, out_shape) = normalize(x.shape().rank(), &dims, x.shape().dims())?;
        let out_len: usize = out_shape.iter().product();
        if x.shape().is_vector() && x.len() == out_len && out_len > 1 {
            return Ok(x);
        }

        let z = self.reduce_destination(&x, z, &out_shape, initial)?;
        let tads = TadArgs {
            x: Some(self.tads.plan(x.shape(), &set)?),
            z: None,
        };
        let dim_buffer = self.constants.get(&set);
        let extras = ctx.scratch.stage_extras(&extras);

        if z.shape().is_scalar() {
            let result = self.kernels.index_reduce_scalar(num, (&x).into(), extras);
            z.data().fill(result);
        } else {
            self.kernels.index_reduce(
                num,
                (&x).into(),
                extras,
                (&z).into(),
                &dim_buffer,
                &tads,
            );
        }
        Ok(z)
    }

    /// Validate or allocate the destination of a reduction.
    ///
    /// An explicit destination distinct from the source must hold exactly
    /// the planned element count; it is re-seeded with the op's initial
    /// value. Otherwise a fresh contiguous destination is allocated.
    fn reduce_destination(
        &self,
        x: &NdArray,
        z: Option<NdArray>,
        out_shape: &[usize],
        initial: f64,
    ) -> Result<NdArray, ExecError> {
        let out_len: usize = out_shape.iter().product();
        match z {
            Some(z) if !z.data().ptr_eq(x.data()) => {
                if z.len() != out_len {
                    return Err(ExecError::ShapeMismatch {
                        expected: out_shape.to_vec(),
                        actual: z.shape().dims().to_vec(),
                    });
                }
                z.data().fill(initial);
                Ok(z)
            }
            _ => {
                let shape = Arc::new(ShapeDescriptor::contiguous(
                    out_shape.to_vec(),
                    x.shape().order(),
                    x.data_type(),
                ));
                Ok(NdArray::filled(shape, initial))
            }
        }
    }

    pub fn exec_broadcast(
        &self,
        _ctx: &mut ExecContext,
        op: BroadcastOp,
    ) -> Result<NdArray, ExecError> {
        if self.mode == Mode::Reference {
            return self.reference(Op::Broadcast(op));
        }
        let BroadcastOp { num, x, y, z, dims } = op;

        let (set, _) = normalize(x.shape().rank(), &dims, x.shape().dims())?;
        // the destination may differ from the source in stride and order,
        // so each side gets its own independently derived plan
        let tads = TadArgs {
            x: Some(self.tads.plan(x.shape(), &set)?),
            z: Some(self.tads.plan(z.shape(), &set)?),
        };
        let dim_buffer = self.constants.get(&set);

        self.kernels
            .broadcast(num, (&x).into(), (&y).into(), (&z).into(), &dim_buffer, &tads);
        Ok(z)
    }

    pub fn exec_scalar(&self, ctx: &mut ExecContext, op: ScalarOp) -> Result<NdArray, ExecError> {
        if self.mode == Mode::Reference {
            return self.reference(Op::Scalar(op));
        }
        let ScalarOp {
            num,
            x,
            z,
            scalar,
            dims,
            extras,
            special,
        } = op;

        if x.len() != z.len() {
            return Err(ExecError::LengthMismatch {
                x: x.len(),
                z: z.len(),
            });
        }
        check_in_place(&x, &z)?;

        let extras = ctx.scratch.stage_extras(&extras);
        if let Some(dims) = dims {
            let (set, _) = normalize(x.shape().rank(), &dims, x.shape().dims())?;
            let tads = TadArgs {
                x: Some(self.tads.plan(x.shape(), &set)?),
                z: Some(self.tads.plan(z.shape(), &set)?),
            };
            let dim_buffer = self.constants.get(&set);
            self.kernels.scalar_along(
                num,
                (&x).into(),
                (&z).into(),
                scalar,
                extras,
                &dim_buffer,
                &tads,
            );
            return Ok(z);
        }

        match select_scalar(special, x.shape(), z.shape()) {
            ExecPath::Linear { len } => self.kernels.scalar_linear(
                num,
                x.data(),
                x.shape().elementwise_stride().unwrap_or(1),
                z.data(),
                z.shape().elementwise_stride().unwrap_or(1),
                scalar,
                extras,
                len,
            ),
            ExecPath::Strided => self
                .kernels
                .scalar(num, (&x).into(), (&z).into(), scalar, extras),
        }
        Ok(z)
    }

    pub fn exec_transform(
        &self,
        ctx: &mut ExecContext,
        op: TransformOp,
    ) -> Result<NdArray, ExecError> {
        if self.mode == Mode::Reference {
            return self.reference(Op::Transform(op));
        }
        let TransformOp {
            num,
            x,
            y,
            z,
            extras,
            special,
        } = op;

        check_in_place(&x, &z)?;

        // the index-of-maximum transform smuggles its target dimensions
        // through the extra-argument list: slot 0 is the count, the
        // following slots are the dimension indices
        let mut tads = TadArgs::default();
        if num == IS_MAX && !extras.is_empty() {
            let count = extras[0] as usize;
            if extras.len() < count + 1 {
                return Err(ShapeError::InvalidDimension {
                    dim: count as i64,
                    rank: z.shape().rank(),
                }
                .into());
            }
            let dims = ctx
                .scratch
                .stage_dims(extras[1..1 + count].iter().map(|&d| d as i64));
            let (set, _) = normalize(z.shape().rank(), dims, z.shape().dims())?;
            tads.z = Some(self.tads.plan(z.shape(), &set)?);
        }

        let extras = ctx.scratch.stage_extras(&extras);
        match y {
            Some(y) => match select_pairwise(special, x.shape(), y.shape(), z.shape()) {
                ExecPath::Linear { len } => self.kernels.pairwise_transform_linear(
                    num,
                    x.data(),
                    x.shape().elementwise_stride().unwrap_or(1),
                    y.data(),
                    y.shape().elementwise_stride().unwrap_or(1),
                    z.data(),
                    z.shape().elementwise_stride().unwrap_or(1),
                    extras,
                    len,
                ),
                ExecPath::Strided => {
                    self.kernels
                        .pairwise_transform(num, (&x).into(), (&y).into(), (&z).into(), extras)
                }
            },
            None => match select_unary(special, x.shape(), z.shape()) {
                ExecPath::Linear { len } => self.kernels.transform_linear(
                    num,
                    x.data(),
                    x.shape().elementwise_stride().unwrap_or(1),
                    z.data(),
                    z.shape().elementwise_stride().unwrap_or(1),
                    extras,
                    len,
                ),
                ExecPath::Strided => {
                    self.kernels
                        .transform(num, (&x).into(), (&z).into(), extras, &tads)
                }
            },
        }
        Ok(z)
    }

    pub fn exec_random(&self, ctx: &mut ExecContext, op: RandomOp) -> Result<NdArray, ExecError> {
        if self.mode == Mode::Reference {
            return self.reference(Op::Random(op));
        }
        let RandomOp {
            num,
            x,
            y,
            z,
            extras,
            state,
        } = op;

        let extras = ctx.scratch.stage_extras(&extras);
        match (&x, &y) {
            (Some(x), Some(y)) => {
                self.kernels
                    .random_three(num, &state, x.into(), y.into(), (&z).into(), extras)
            }
            (Some(x), None) => self.kernels.random_two(num, &state, x.into(), (&z).into(), extras),
            (None, Some(_)) => {
                log::warn!("random op {num} carries y without x; y is ignored");
                self.kernels.random_one(num, &state, (&z).into(), extras)
            }
            (None, None) => self.kernels.random_one(num, &state, (&z).into(), extras),
        }
        Ok(z)
    }

    /// Execute a single aggregate through this context's reusable memory
    /// block for its kind.
    pub fn exec_aggregate(
        &self,
        ctx: &mut ExecContext,
        op: &AggregateOp,
    ) -> Result<(), ExecError> {
        let block = match ctx.blocks.entry(op.kind) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(AggregateMemoryBlock::new(op.kind, op.limits, self.precision)?)
            }
        };
        let counts = block.stage(op)?;
        self.kernels.aggregate(op.kind, block, counts);
        Ok(())
    }

    /// Pack an arbitrary list of aggregates into batches and execute each
    /// with one downstream kernel call.
    pub fn exec_aggregates(&self, ops: &[AggregateOp]) -> Result<(), ExecError> {
        if ops.is_empty() {
            return Ok(());
        }
        for batch in pack(ops, self.precision)? {
            self.kernels.aggregate_batch(&batch);
        }
        Ok(())
    }

    pub fn environment(&self) -> Environment {
        Environment {
            backend: "cpu",
            max_threads: self.kernels.max_threads(),
        }
    }

    #[inline]
    pub fn tad_cache(&self) -> &TadCache {
        &self.tads
    }
}

/// An in-place destination is only legal when it shares the source's exact
/// layout; a view with different geometry cannot be mutated independently.
fn check_in_place(x: &NdArray, z: &NdArray) -> Result<(), ExecError> {
    if z.data().ptr_eq(x.data())
        && (z.shape().dims() != x.shape().dims()
            || z.shape().strides() != x.shape().strides()
            || z.shape().order() != x.shape().order())
    {
        return Err(ExecError::IllegalInPlace);
    }
    Ok(())
}
