use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap as HashMap;

use crate::dims::DimensionSet;

/// Reusable per-worker storage for transient kernel arguments.
///
/// One pool belongs to exactly one execution context and is reused across
/// calls on that context purely to avoid per-call allocation. It must never
/// be shared between workers.
#[derive(Debug, Default)]
pub struct ScratchPool {
    extras: Vec<f64>,
    dims: Vec<i64>,
}

impl ScratchPool {
    /// Stage an operation's extra arguments into reused storage.
    pub fn stage_extras(&mut self, extras: &[f64]) -> &[f64] {
        self.extras.clear();
        self.extras.extend_from_slice(extras);
        &self.extras
    }

    /// Stage a dimension index list into reused storage.
    pub fn stage_dims(&mut self, dims: impl IntoIterator<Item = i64>) -> &[i64] {
        self.dims.clear();
        self.dims.extend(dims);
        &self.dims
    }
}

/// Process-wide cache of kernel-facing dimension buffers.
///
/// Dimension lists are immutable once canonicalized, so every operation over
/// the same set shares one buffer. Lazily populated, never evicted; a racing
/// miss may build the buffer twice but stores exactly one.
#[derive(Debug, Default)]
pub struct ConstantBuffers {
    buffers: RwLock<HashMap<DimensionSet, Arc<[i64]>>>,
}

impl ConstantBuffers {
    pub fn get(&self, set: &DimensionSet) -> Arc<[i64]> {
        if let Some(buffer) = self.buffers.read().expect("constant cache poisoned").get(set) {
            return buffer.clone();
        }
        let buffer: Arc<[i64]> = set.to_kernel().into();
        let mut buffers = self.buffers.write().expect("constant cache poisoned");
        buffers.entry(set.clone()).or_insert(buffer).clone()
    }

    pub fn len(&self) -> usize {
        self.buffers.read().expect("constant cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached buffer. Intended for context teardown only.
    pub fn clear(&self) {
        self.buffers.write().expect("constant cache poisoned").clear();
    }
}
