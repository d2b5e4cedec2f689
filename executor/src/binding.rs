use std::collections::{HashMap, HashSet};

use engine::{BoundGraph, Context, DType, Graph, Shape, Tensor};
use log::debug;

use crate::{ExecErr, Result, pool::BufferPool};

/// A graph bound to the tensors of a single device.
///
/// Parameters and gradients may be shared with the executor of another bucket, inputs
/// come from the device's `BufferPool`.
pub struct DeviceExecutor {
    ctx: Context,
    arg_names: Vec<String>,
    arg_arrays: Vec<Tensor>,
    grad_arrays: Vec<Option<Tensor>>,
    aux_arrays: Vec<Tensor>,
    bound: Box<dyn BoundGraph>,
}

impl DeviceExecutor {
    /// Binds `graph` on `ctx`.
    ///
    /// # Arguments
    /// * `graph` - The graph to bind.
    /// * `ctx` - The device.
    /// * `input_shapes` - The shapes of the data and label inputs of this device.
    /// * `input_types` - The types of the inputs, `float32` when missing.
    /// * `param_names` - The arguments that are learned parameters.
    /// * `need_grad` - Whether to allocate gradients for the parameters.
    /// * `base` - The executor to share parameters, gradients and auxiliary states with.
    /// * `pool` - The device's shared input buffers.
    ///
    /// # Returns
    /// The executor or the error of the first tensor that couldn't be bound.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        graph: &dyn Graph,
        ctx: Context,
        input_shapes: &HashMap<String, Shape>,
        input_types: &HashMap<String, DType>,
        param_names: &HashSet<String>,
        need_grad: bool,
        base: Option<&DeviceExecutor>,
        pool: &BufferPool,
    ) -> Result<Self> {
        let shapes = graph.infer_shape(input_shapes)?;
        let arg_names = graph.list_arguments();

        if shapes.args.len() != arg_names.len() {
            return Err(ExecErr::InvalidConfiguration(format!(
                "the graph inferred {} argument shapes for {} arguments",
                shapes.args.len(),
                arg_names.len()
            )));
        }

        let mut arg_arrays = Vec::with_capacity(arg_names.len());
        let mut grad_arrays = Vec::with_capacity(arg_names.len());

        for (name, shape) in arg_names.iter().zip(&shapes.args) {
            if !param_names.contains(name) {
                let dtype = input_types.get(name).copied().unwrap_or_default();
                arg_arrays.push(pool.get_or_alloc(name, shape, dtype, ctx)?);
                grad_arrays.push(None);
                continue;
            }

            match base {
                None => {
                    arg_arrays.push(Tensor::zeros(shape.clone(), ctx, DType::F32)?);
                    grad_arrays.push(match need_grad {
                        true => Some(Tensor::zeros(shape.clone(), ctx, DType::F32)?),
                        false => None,
                    });
                }
                Some(base) => {
                    let (arg, grad) = base.shared_param(name, shape)?;
                    arg_arrays.push(arg);
                    grad_arrays.push(if need_grad { grad } else { None });
                }
            }
        }

        let aux_arrays = match base {
            None => shapes
                .aux
                .iter()
                .map(|shape| Tensor::zeros(shape.clone(), ctx, DType::F32))
                .collect::<engine::Result<Vec<_>>>()?,
            Some(base) => base.aux_arrays.clone(),
        };

        let bound = graph.bind(ctx, arg_arrays.clone(), grad_arrays.clone(), aux_arrays.clone())?;
        debug!(args = arg_names.len(); "bound executor on {ctx}");

        Ok(Self {
            ctx,
            arg_names,
            arg_arrays,
            grad_arrays,
            aux_arrays,
            bound,
        })
    }

    fn shared_param(&self, name: &str, shape: &Shape) -> Result<(Tensor, Option<Tensor>)> {
        let i = self
            .arg_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| {
                ExecErr::InvalidConfiguration(format!("the shared executor has no parameter {name}"))
            })?;

        let arg = &self.arg_arrays[i];
        if arg.shape() != shape {
            return Err(ExecErr::InvalidConfiguration(format!(
                "shared parameter {name} is {}, the graph needs {shape}",
                arg.shape()
            )));
        }

        Ok((arg.clone(), self.grad_arrays[i].clone()))
    }

    pub fn context(&self) -> Context {
        self.ctx
    }

    pub fn forward(&mut self, is_train: bool) -> Result<()> {
        Ok(self.bound.forward(is_train)?)
    }

    pub fn backward(&mut self) -> Result<()> {
        Ok(self.bound.backward()?)
    }

    pub fn outputs(&self) -> &[Tensor] {
        self.bound.outputs()
    }

    pub fn arg_arrays(&self) -> &[Tensor] {
        &self.arg_arrays
    }

    pub fn grad_arrays(&self) -> &[Option<Tensor>] {
        &self.grad_arrays
    }

    pub fn aux_arrays(&self) -> &[Tensor] {
        &self.aux_arrays
    }

    /// Maps every argument name to it's tensor.
    pub fn arg_dict(&self) -> HashMap<&str, &Tensor> {
        self.arg_names
            .iter()
            .map(String::as_str)
            .zip(&self.arg_arrays)
            .collect()
    }

    /// Overwrites the named parameters and auxiliary states present in the given maps.
    pub fn copy_params_from(
        &self,
        arg_params: &HashMap<String, Tensor>,
        aux_params: &HashMap<String, Tensor>,
        aux_names: &[String],
    ) -> Result<()> {
        for (name, dst) in self.arg_names.iter().zip(&self.arg_arrays) {
            if let Some(src) = arg_params.get(name) {
                src.copy_to(dst)?;
            }
        }

        for (name, dst) in aux_names.iter().zip(&self.aux_arrays) {
            if let Some(src) = aux_params.get(name) {
                src.copy_to(dst)?;
            }
        }

        Ok(())
    }
}
