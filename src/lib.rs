//! `weft` is the host-side dispatch layer of an n-dimensional array engine.
//! It classifies operations, plans their shapes and addressing, and issues
//! exactly one validated call per operation into an external kernel
//! catalogue.
//!
//! ## Key Components
//! 1. **Shape Metadata**:
//!    - Immutable [`shape::ShapeDescriptor`]s with cached element-wise
//!      stride detection and a process-unique identity.
//!    - Dimension-list normalization ([`dims::normalize`]) with a whole-array
//!      sentinel encoding.
//! 2. **Execution Planning**:
//!    - Tensor-along-dimension plans ([`tad::TadPlan`]) with closed-form or
//!      tabulated slice offsets, memoized per shape identity.
//!    - Flat/strided path selection ([`path`]) re-derived on every call.
//! 3. **Batched Aggregates**:
//!    - Fixed-layout batch packing ([`aggregate`]) with per-kind capacity
//!      limits and reusable per-worker memory blocks.
//! 4. **Dispatch**:
//!    - The [`dispatch::Dispatcher`] entry point, a closed operation sum
//!      type, and an optional reference executor for bypassing planning.
//!
//! The crate performs no arithmetic itself; implementations of
//! [`kernel::Kernels`] do.

pub mod aggregate;
pub mod buffer;
pub mod dims;
pub mod dispatch;
pub mod kernel;
pub mod num;
pub mod path;
pub mod scratch;
pub mod shape;
pub mod tad;

pub use aggregate::{AggregateLimits, AggregateOp, BATCH_LIMIT, PackedBatch};
pub use buffer::{Buffer, NdArray};
pub use dims::{DimensionSet, WHOLE_DIMENSION};
pub use dispatch::{
    Dispatcher, DispatcherBuilder, Environment, ExecContext, ExecError, Mode, Op,
};
pub use kernel::Kernels;
pub use num::DataType;
pub use shape::{Order, ShapeDescriptor};
pub use tad::{TadCache, TadPlan};
