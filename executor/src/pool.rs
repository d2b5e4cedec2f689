use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use engine::{Context, DType, Shape, Tensor};
use log::warn;
use parking_lot::Mutex;

use crate::{ExecErr, Result};

/// The data and label buffers of a single device, shared by every executor bound on it.
///
/// Callers must never assume exclusive ownership of a buffer handed out by the pool.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Mutex<HashMap<String, Tensor>>,
    warned: AtomicBool,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a buffer named `name` with `shape`, reusing the pooled one when it's big enough.
    ///
    /// # Arguments
    /// * `name` - The input name.
    /// * `shape` - The shape the executor needs.
    /// * `dtype` - The element type the executor needs.
    /// * `ctx` - The device of this pool.
    ///
    /// # Returns
    /// A view over the pooled buffer, a fresh buffer, or `TypeMismatch` if the pooled
    /// buffer holds another element type.
    pub fn get_or_alloc(&self, name: &str, shape: &Shape, dtype: DType, ctx: Context) -> Result<Tensor> {
        let mut buffers = self.buffers.lock();

        if let Some(pooled) = buffers.get(name) {
            if pooled.capacity() >= shape.size() {
                if pooled.dtype() != dtype {
                    return Err(ExecErr::TypeMismatch(format!(
                        "buffer {name} holds {}, the executor needs {dtype}",
                        pooled.dtype()
                    )));
                }

                return Ok(pooled.reshape(shape.clone())?);
            }

            if !self.warned.swap(true, Ordering::Relaxed) {
                warn!(
                    "input {name} of shape {shape} is larger than the pooled {}, reallocating. \
                     Bind the largest bucket first to share memory",
                    pooled.shape()
                );
            }
        }

        let tensor = Tensor::zeros(shape.clone(), ctx, dtype)?;
        buffers.insert(name.to_string(), tensor.clone());
        Ok(tensor)
    }

    /// The amount of pooled buffers.
    pub fn len(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
