use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
};

use engine::{Context, Graph, Tensor};
use log::{debug, info};
use rayon::prelude::*;

use crate::{
    DataBatch, DataDesc, EvalMetric, ExecErr, Result, binding::DeviceExecutor,
    pool::BufferPool, slice::split_input_slice,
};

fn gather<'a>(
    execs: &[DeviceExecutor],
    arg_names: &[String],
    names: impl IntoIterator<Item = &'a String>,
) -> Vec<Vec<Tensor>> {
    names
        .into_iter()
        .filter_map(|name| arg_names.iter().position(|n| n == name))
        .map(|i| execs.iter().map(|e| e.arg_arrays()[i].clone()).collect())
        .collect()
}

/// Checks that no argument and no auxiliary state is listed twice.
///
/// # Returns
/// `DuplicateArgument` naming the first repeated name.
pub fn check_arguments(graph: &dyn Graph) -> Result<()> {
    for names in [graph.list_arguments(), graph.list_auxiliary_states()] {
        let mut seen = HashSet::new();

        if let Some(name) = names.iter().find(|name| !seen.insert(name.as_str())) {
            return Err(ExecErr::DuplicateArgument(name.clone()));
        }
    }

    Ok(())
}

/// A graph replicated on several devices, each one working on it's slice of the batch.
pub struct ExecutorGroup {
    contexts: Vec<Context>,
    slices: Vec<Range<usize>>,
    batch_size: usize,
    param_names: Vec<String>,
    aux_names: Vec<String>,
    execs: Vec<DeviceExecutor>,
    data_arrays: Vec<Vec<Tensor>>,
    label_arrays: Vec<Vec<Tensor>>,
    param_arrays: Vec<Vec<Tensor>>,
    grad_arrays: Vec<Vec<Tensor>>,
    aux_arrays: Vec<Vec<Tensor>>,
    pools: Vec<Arc<BufferPool>>,
}

impl ExecutorGroup {
    /// Binds `graph` once per device.
    ///
    /// # Arguments
    /// * `graph` - The graph to replicate.
    /// * `contexts` - The devices.
    /// * `work_load` - The relative work load of every device.
    /// * `data_shapes` - The data inputs of a whole batch.
    /// * `label_shapes` - The label inputs of a whole batch.
    /// * `param_names` - The arguments that are learned parameters.
    /// * `for_training` - Whether to allocate gradients.
    /// * `shared_group` - A group to share parameters, gradients and buffers with.
    ///
    /// # Returns
    /// The group, or the first binding error, no partially bound group is returned.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        graph: &dyn Graph,
        contexts: &[Context],
        work_load: &[f64],
        data_shapes: &[DataDesc],
        label_shapes: &[DataDesc],
        param_names: &[String],
        for_training: bool,
        shared_group: Option<&ExecutorGroup>,
    ) -> Result<Self> {
        check_arguments(graph)?;

        if contexts.len() != work_load.len() {
            return Err(ExecErr::InvalidConfiguration(format!(
                "{} work loads for {} devices",
                work_load.len(),
                contexts.len()
            )));
        }

        let batch_size = data_shapes.first().map(|d| d.shape.rows()).ok_or_else(|| {
            ExecErr::InvalidConfiguration("the group needs at least one data input".into())
        })?;

        if let Some(desc) = data_shapes
            .iter()
            .chain(label_shapes)
            .find(|d| d.shape.rows() != batch_size)
        {
            return Err(ExecErr::InvalidConfiguration(format!(
                "input {} has {} samples, the batch has {batch_size}",
                desc.name,
                desc.shape.rows()
            )));
        }

        let arg_names = graph.list_arguments();
        let inputs = data_shapes.iter().chain(label_shapes).map(|d| &d.name);

        if let Some(name) = param_names.iter().chain(inputs).find(|n| !arg_names.contains(*n)) {
            return Err(ExecErr::InvalidConfiguration(format!(
                "{name} isn't an argument of the graph"
            )));
        }

        if let Some(shared) = shared_group {
            if shared.contexts != contexts {
                return Err(ExecErr::InvalidConfiguration(
                    "the shared group runs on other devices".into(),
                ));
            }
        }

        let slices = split_input_slice(batch_size, work_load)?;
        let params: HashSet<_> = param_names.iter().cloned().collect();
        let input_types: HashMap<_, _> = data_shapes
            .iter()
            .chain(label_shapes)
            .map(|d| (d.name.clone(), d.dtype))
            .collect();

        let pools = match shared_group {
            Some(shared) => shared.pools.clone(),
            None => contexts.iter().map(|_| Arc::new(BufferPool::new())).collect(),
        };

        let mut execs = Vec::with_capacity(contexts.len());

        for (i, (&ctx, slice)) in contexts.iter().zip(&slices).enumerate() {
            let input_shapes: HashMap<_, _> = data_shapes
                .iter()
                .chain(label_shapes)
                .map(|d| (d.name.clone(), d.shape.with_rows(slice.len())))
                .collect();

            let base = shared_group.map(|shared| &shared.execs[i]);
            let exec = DeviceExecutor::bind(
                graph,
                ctx,
                &input_shapes,
                &input_types,
                &params,
                for_training,
                base,
                &pools[i],
            )?;

            execs.push(exec);
        }

        let data_arrays = gather(&execs, &arg_names, data_shapes.iter().map(|d| &d.name));
        let label_arrays = gather(&execs, &arg_names, label_shapes.iter().map(|d| &d.name));

        // Parameters keep the order of the graph's arguments.
        let param_names: Vec<String> = arg_names
            .iter()
            .filter(|name| params.contains(*name))
            .cloned()
            .collect();
        let param_arrays = gather(&execs, &arg_names, &param_names);

        let grad_arrays = match for_training {
            true => param_names
                .iter()
                .filter_map(|name| arg_names.iter().position(|n| n == name))
                .map(|i| {
                    execs
                        .iter()
                        .filter_map(|e| e.grad_arrays()[i].clone())
                        .collect()
                })
                .collect(),
            false => Vec::new(),
        };

        let aux_names = graph.list_auxiliary_states();
        let aux_arrays = (0..aux_names.len())
            .map(|i| execs.iter().map(|e| e.aux_arrays()[i].clone()).collect())
            .collect();

        info!(devices = contexts.len(), batch_size = batch_size; "bound executor group {slices:?}");

        Ok(Self {
            contexts: contexts.to_vec(),
            slices,
            batch_size,
            param_names,
            aux_names,
            execs,
            data_arrays,
            label_arrays,
            param_arrays,
            grad_arrays,
            aux_arrays,
            pools,
        })
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn slices(&self) -> &[Range<usize>] {
        &self.slices
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn aux_names(&self) -> &[String] {
        &self.aux_names
    }

    pub fn execs(&self) -> &[DeviceExecutor] {
        &self.execs
    }

    /// One entry per parameter, holding the parameter of every device.
    pub fn param_arrays(&self) -> &[Vec<Tensor>] {
        &self.param_arrays
    }

    /// One entry per parameter, holding the gradient of every device. Empty when the
    /// group wasn't bound for training.
    pub fn grad_arrays(&self) -> &[Vec<Tensor>] {
        &self.grad_arrays
    }

    pub fn aux_arrays(&self) -> &[Vec<Tensor>] {
        &self.aux_arrays
    }

    /// Copies every device's slice of the batch into the device's input buffers.
    ///
    /// # Returns
    /// `InvalidConfiguration` if the batch has another amount of inputs than the group.
    pub fn load_batch(&self, batch: &DataBatch) -> Result<()> {
        Self::load(&batch.data, &self.data_arrays, &self.slices, "data")?;
        Self::load(&batch.label, &self.label_arrays, &self.slices, "label")
    }

    fn load(
        sources: &[Tensor],
        targets: &[Vec<Tensor>],
        slices: &[Range<usize>],
        what: &str,
    ) -> Result<()> {
        if sources.len() != targets.len() {
            return Err(ExecErr::InvalidConfiguration(format!(
                "the batch has {} {what} inputs, the group binds {}",
                sources.len(),
                targets.len()
            )));
        }

        for (src, devices) in sources.iter().zip(targets) {
            for (dst, slice) in devices.iter().zip(slices) {
                src.slice(slice.clone())?.copy_to(dst)?;
            }
        }

        Ok(())
    }

    /// Runs the forward pass on every device in parallel.
    pub fn forward(&mut self, is_train: bool) -> Result<()> {
        self.execs
            .par_iter_mut()
            .try_for_each(|exec| exec.forward(is_train))
    }

    /// Runs the backward pass on every device in parallel, filling the gradients.
    pub fn backward(&mut self) -> Result<()> {
        self.execs.par_iter_mut().try_for_each(DeviceExecutor::backward)
    }

    /// Feeds each device's outputs and the matching rows of `labels` to `metric`.
    pub fn update_metric(&self, metric: &mut dyn EvalMetric, labels: &[Tensor]) -> Result<()> {
        for (exec, slice) in self.execs.iter().zip(&self.slices) {
            let labels = labels
                .iter()
                .map(|label| label.slice(slice.clone()))
                .collect::<engine::Result<Vec<_>>>()?;

            metric.update(&labels, exec.outputs())?;
        }

        Ok(())
    }

    /// Replaces every device's gradients with their sum across devices.
    pub fn sum_grads(&self) -> Result<()> {
        self.grad_arrays.par_iter().try_for_each(|grads| {
            let Some((first, rest)) = grads.split_first() else {
                return Ok(());
            };

            let mut sum = first.to_vec()?;
            for grad in rest {
                grad.with_data(|g| sum.iter_mut().zip(g).for_each(|(s, v)| *s += v))?;
            }

            for grad in grads {
                grad.copy_from_slice(&sum)?;
            }

            debug!(devices = grads.len(); "summed gradients of shape {}", first.shape());
            Ok(())
        })
    }
}
