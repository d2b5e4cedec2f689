use std::collections::HashMap;

use engine::{Context, Graph, Tensor};
use log::debug;

use crate::{DataBatch, DataDesc, DataIter, EvalMetric, ExecErr, ExecutorGroup, Result};

/// Builds the graph of a bucket given it's key.
pub type SymGen = Box<dyn Fn(u64) -> Box<dyn Graph> + Send + Sync>;

/// Drives the executor groups of a training session.
///
/// Without a graph generator every batch runs on the main group. With one, every
/// bucket key gets it's own group, sharing parameters, gradients and input buffers
/// with the main group.
pub struct ExecutorManager {
    contexts: Vec<Context>,
    work_load: Vec<f64>,
    param_names: Vec<String>,
    data_shapes: Vec<DataDesc>,
    label_shapes: Vec<DataDesc>,
    main: ExecutorGroup,
    sym_gen: Option<SymGen>,
    default_bucket_key: Option<u64>,
    buckets: HashMap<u64, ExecutorGroup>,
    current: Option<u64>,
}

impl ExecutorManager {
    /// Creates a new `ExecutorManager` and binds it's main group for training.
    ///
    /// # Arguments
    /// * `graph` - The graph of the default bucket.
    /// * `contexts` - The devices.
    /// * `work_load` - The relative work load of every device, even when `None`.
    /// * `data` - The iterator whose inputs the main group binds.
    /// * `param_names` - The arguments that are learned parameters.
    /// * `sym_gen` - The generator of the other buckets' graphs.
    ///
    /// # Returns
    /// The manager or the main group's binding error.
    pub fn new(
        graph: &dyn Graph,
        contexts: &[Context],
        work_load: Option<&[f64]>,
        data: &dyn DataIter,
        param_names: &[String],
        sym_gen: Option<SymGen>,
    ) -> Result<Self> {
        let work_load = match work_load {
            Some(work_load) => work_load.to_vec(),
            None => vec![1.; contexts.len()],
        };

        if work_load.len() != contexts.len() {
            return Err(ExecErr::InvalidConfiguration(format!(
                "{} work loads for {} devices",
                work_load.len(),
                contexts.len()
            )));
        }

        let data_shapes = data.provide_data().to_vec();
        let label_shapes = data.provide_label().to_vec();

        let main = ExecutorGroup::bind(
            graph,
            contexts,
            &work_load,
            &data_shapes,
            &label_shapes,
            param_names,
            true,
            None,
        )?;

        Ok(Self {
            contexts: contexts.to_vec(),
            work_load,
            param_names: main.param_names().to_vec(),
            data_shapes,
            label_shapes,
            main,
            sym_gen,
            default_bucket_key: data.default_bucket_key(),
            buckets: HashMap::new(),
            current: None,
        })
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// The main group, every bucket shares it's parameters.
    pub fn main_group(&self) -> &ExecutorGroup {
        &self.main
    }

    /// The group the last loaded batch runs on.
    pub fn current_group(&self) -> &ExecutorGroup {
        self.current
            .and_then(|key| self.buckets.get(&key))
            .unwrap_or(&self.main)
    }

    fn current_group_mut(&mut self) -> &mut ExecutorGroup {
        match self.current.and_then(|key| self.buckets.get_mut(&key)) {
            Some(group) => group,
            None => &mut self.main,
        }
    }

    /// The amount of bound bucket groups besides the main one.
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn param_arrays(&self) -> &[Vec<Tensor>] {
        self.main.param_arrays()
    }

    pub fn grad_arrays(&self) -> &[Vec<Tensor>] {
        self.main.grad_arrays()
    }

    pub fn aux_arrays(&self) -> &[Vec<Tensor>] {
        self.main.aux_arrays()
    }

    /// Copies the given parameters and auxiliary states into every device.
    ///
    /// Names missing from the maps keep their current value.
    pub fn set_params(
        &self,
        arg_params: &HashMap<String, Tensor>,
        aux_params: &HashMap<String, Tensor>,
    ) -> Result<()> {
        for exec in self.main.execs() {
            exec.copy_params_from(arg_params, aux_params, self.main.aux_names())?;
        }

        Ok(())
    }

    /// Writes the average across devices of every parameter and auxiliary state into
    /// the given maps.
    ///
    /// # Returns
    /// `InvalidConfiguration` if a map lacks one of the names.
    pub fn copy_to(
        &self,
        arg_params: &HashMap<String, Tensor>,
        aux_params: &HashMap<String, Tensor>,
    ) -> Result<()> {
        let params = self.param_names.iter().zip(self.main.param_arrays());
        let aux = self.main.aux_names().iter().zip(self.main.aux_arrays());

        for (name, block) in params {
            average_into(name, block, arg_params)?;
        }

        for (name, block) in aux {
            average_into(name, block, aux_params)?;
        }

        Ok(())
    }

    /// Switches to the group of the batch's bucket, binding it on first use, and loads
    /// the batch into it.
    pub fn load_data_batch(&mut self, batch: &DataBatch) -> Result<()> {
        self.current = match (&self.sym_gen, batch.bucket_key) {
            (Some(sym_gen), Some(key)) if Some(key) != self.default_bucket_key => {
                if !self.buckets.contains_key(&key) {
                    let graph = sym_gen(key);
                    let data_shapes = batch.provide_data.as_ref().unwrap_or(&self.data_shapes);
                    let label_shapes = batch.provide_label.as_ref().unwrap_or(&self.label_shapes);

                    let group = ExecutorGroup::bind(
                        graph.as_ref(),
                        &self.contexts,
                        &self.work_load,
                        data_shapes,
                        label_shapes,
                        &self.param_names,
                        true,
                        Some(&self.main),
                    )?;

                    debug!(bucket = key; "bound a new bucket");
                    self.buckets.insert(key, group);
                }

                Some(key)
            }
            _ => None,
        };

        self.current_group().load_batch(batch)
    }

    pub fn forward(&mut self, is_train: bool) -> Result<()> {
        self.current_group_mut().forward(is_train)
    }

    pub fn backward(&mut self) -> Result<()> {
        self.current_group_mut().backward()
    }

    pub fn update_metric(&self, metric: &mut dyn EvalMetric, labels: &[Tensor]) -> Result<()> {
        self.current_group().update_metric(metric, labels)
    }

    pub fn sum_grads(&self) -> Result<()> {
        self.current_group().sum_grads()
    }
}

fn average_into(name: &str, block: &[Tensor], dst: &HashMap<String, Tensor>) -> Result<()> {
    let dst = dst.get(name).ok_or_else(|| {
        ExecErr::InvalidConfiguration(format!("no destination for parameter {name}"))
    })?;

    let Some((first, rest)) = block.split_first() else {
        return Ok(());
    };

    let mut sum = first.to_vec()?;
    for tensor in rest {
        tensor.with_data(|values| sum.iter_mut().zip(values).for_each(|(s, v)| *s += v))?;
    }

    let devices = block.len() as f32;
    sum.iter_mut().for_each(|s| *s /= devices);

    Ok(dst.copy_from_slice(&sum)?)
}
