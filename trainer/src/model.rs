use std::{
    collections::{HashMap, HashSet},
    iter,
    sync::Arc,
    time::Instant,
};

use comms::specs::OptimizerSpec;
use engine::{Context, DType, Graph, Shape, Tensor};
use executor::{DataIter, EvalMetric, ExecutorManager, SymGen};
use kvstore::{
    KVStore,
    optimization::{Optimizer, Updater},
    synchronization::StaleWait,
};
use log::{debug, info, warn};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    Result, TrainErr,
    callback::{BatchEndCallback, BatchEndParam},
    config::TrainingConfig,
    recorder::{Phase, TrainingMetricsRecorder},
    store::{self, StoreChoice},
};

type GraphGen = Arc<dyn Fn(u64) -> Box<dyn Graph> + Send + Sync>;

/// Trains a graph with data parallelism across the configured devices.
///
/// The parameters live in `arg_params`, missing ones are filled by the configured
/// initializer on the first call to `fit`. They are written back after every epoch.
pub struct Trainer {
    graph: Box<dyn Graph>,
    config: TrainingConfig,
    kvstore: Option<KVStore>,
    sym_gen: Option<GraphGen>,
    arg_params: HashMap<String, Tensor>,
    aux_params: HashMap<String, Tensor>,
    rng: StdRng,
}

impl Trainer {
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `graph` - The graph to train, it's default bucket when bucketing.
    /// * `config` - The training configuration.
    ///
    /// # Returns
    /// The trainer or `InvalidConfiguration` if the configuration doesn't validate.
    pub fn new(graph: Box<dyn Graph>, config: &TrainingConfig) -> Result<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            graph,
            config: config.clone(),
            kvstore: None,
            sym_gen: None,
            arg_params: HashMap::new(),
            aux_params: HashMap::new(),
            rng,
        })
    }

    /// Synchronizes through an already connected store instead of the configured kind.
    pub fn with_kvstore(mut self, kv: KVStore) -> Self {
        self.kvstore = Some(kv);
        self
    }

    /// Trains the batches of other bucket keys on the graphs `sym_gen` builds.
    pub fn with_sym_gen<F>(mut self, sym_gen: F) -> Self
    where
        F: Fn(u64) -> Box<dyn Graph> + Send + Sync + 'static,
    {
        self.sym_gen = Some(Arc::new(sym_gen));
        self
    }

    /// Starts from these parameters instead of initializing them.
    pub fn with_params(
        mut self,
        arg_params: HashMap<String, Tensor>,
        aux_params: HashMap<String, Tensor>,
    ) -> Self {
        self.arg_params = arg_params;
        self.aux_params = aux_params;
        self
    }

    pub fn arg_params(&self) -> &HashMap<String, Tensor> {
        &self.arg_params
    }

    pub fn aux_params(&self) -> &HashMap<String, Tensor> {
        &self.aux_params
    }

    /// A recorder writing to the configured metrics path, in memory when there's none.
    pub fn recorder(&self) -> Result<TrainingMetricsRecorder> {
        match &self.config.metrics_path {
            Some(path) => TrainingMetricsRecorder::open(path),
            None => Ok(TrainingMetricsRecorder::new()),
        }
    }

    /// Runs the configured epochs over `train`.
    ///
    /// # Arguments
    /// * `train` - The training batches.
    /// * `eval` - The validation batches, evaluated after every epoch.
    /// * `metric` - The metric to evaluate.
    /// * `callbacks` - Called after every training batch.
    /// * `recorder` - Records the metric's values.
    ///
    /// # Returns
    /// The first binding, store, engine or recording error.
    pub fn fit(
        &mut self,
        train: &mut dyn DataIter,
        mut eval: Option<&mut dyn DataIter>,
        metric: &mut dyn EvalMetric,
        callbacks: &mut [Box<dyn BatchEndCallback>],
        recorder: &mut TrainingMetricsRecorder,
    ) -> Result<()> {
        let contexts = self.config.contexts();
        let num_device = contexts.len();
        let param_names = self.param_names(train);

        self.init_params(train, &param_names)?;

        let provided = self.kvstore.is_some();
        let choice = match self.kvstore.take() {
            Some(kv) => StoreChoice::Store(kv),
            None => self.config.kvstore.into(),
        };

        let (kv, update_on_kvstore) = store::create_kvstore(choice, num_device, &self.arg_params)?;

        let mut spec = optimizer_spec(&self.config.optimizer, train.batch_size());

        let sym_gen = self.sym_gen.clone().map(|generate| -> SymGen {
            Box::new(move |key| generate(key))
        });

        let mut manager = ExecutorManager::new(
            self.graph.as_ref(),
            &contexts,
            self.config.work_load.as_deref(),
            &*train,
            &param_names,
            sym_gen,
        )?;

        manager.set_params(&self.arg_params, &self.aux_params)?;

        let mut updater = None;

        if let Some(kv) = &kv {
            store::initialize_kvstore(
                kv,
                manager.param_arrays(),
                &self.arg_params,
                &param_names,
                update_on_kvstore,
            )?;
        }

        match &kv {
            Some(kv) if update_on_kvstore => {
                spec.base_mut().param_names = param_names.clone();
                kv.set_optimizer(&spec)?;
            }
            _ => {
                spec.base_mut().param_names = param_names
                    .iter()
                    .flat_map(|name| iter::repeat_n(name.clone(), num_device))
                    .collect();

                updater = Some(Updater::new(Optimizer::from_spec(&spec)?));
            }
        }

        info!(
            devices = num_device,
            update_on_kvstore = update_on_kvstore;
            "start training with {} parameters", param_names.len()
        );

        let dist = kv.as_ref().is_some_and(|kv| kv.kind().is_dist());
        let mut iteration: u64 = 0;

        for epoch in self.config.begin_epoch..self.config.num_epoch {
            let tic = Instant::now();
            metric.reset();
            let mut nbatch = 0;

            loop {
                let mut do_reset = true;
                let start = nbatch;

                while let Some(batch) = train.next_batch() {
                    if let Some(kv) = &kv {
                        if kv.wait_for_staleness(iteration)? == StaleWait::TimedOut {
                            debug!(iteration = iteration; "proceeding past the staleness bound");
                        }
                    }

                    manager.load_data_batch(&batch)?;
                    manager.forward(true)?;
                    manager.backward()?;

                    match (updater.as_mut(), &kv) {
                        (Some(updater), kv) => store::update_params(
                            manager.param_arrays(),
                            manager.grad_arrays(),
                            updater,
                            num_device,
                            kv.as_ref(),
                        )?,
                        (None, Some(kv)) => store::update_params_on_kvstore(
                            manager.param_arrays(),
                            manager.grad_arrays(),
                            kv,
                        )?,
                        (None, None) => {}
                    }

                    manager.update_metric(metric, &batch.label)?;

                    iteration += 1;
                    if dist {
                        if let Some(kv) = &kv {
                            kv.report_progress(iteration)?;
                        }
                    }

                    nbatch += 1;

                    let param = BatchEndParam {
                        epoch,
                        nbatch,
                        eval_metric: Some(&*metric),
                    };
                    for callback in callbacks.iter_mut() {
                        callback.call(&param);
                    }

                    let (name, value) = metric.get();
                    recorder.record(Phase::Batch, epoch, nbatch, &name, value)?;

                    if self.config.epoch_size.is_some_and(|size| nbatch >= size) {
                        do_reset = false;
                        break;
                    }
                }

                if do_reset {
                    info!("Epoch[{epoch}] Resetting Data Iterator");
                    train.reset();
                }

                if nbatch == start {
                    warn!(epoch = epoch; "the data iterator yielded no batches");
                    break;
                }

                if self.config.epoch_size.is_none_or(|size| nbatch >= size) {
                    break;
                }
            }

            let (name, value) = metric.get();
            info!("Epoch[{epoch}] Train-{name}={value}");
            recorder.record(Phase::Train, epoch, nbatch, &name, value)?;

            let elapsed = tic.elapsed();
            info!("Epoch[{epoch}] Time cost={:.3}", elapsed.as_secs_f64());
            recorder.record_epoch_time(elapsed);

            manager.copy_to(&self.arg_params, &self.aux_params)?;

            if let Some(eval) = eval.as_deref_mut() {
                metric.reset();
                eval.reset();

                while let Some(batch) = eval.next_batch() {
                    manager.load_data_batch(&batch)?;
                    manager.forward(false)?;
                    manager.update_metric(metric, &batch.label)?;
                }

                let (name, value) = metric.get();
                info!("Epoch[{epoch}] Validation-{name}={value}");
                recorder.record(Phase::Validation, epoch, nbatch, &name, value)?;
            }
        }

        if provided {
            self.kvstore = kv;
        }

        Ok(())
    }

    /// The arguments that aren't inputs of `data`.
    fn param_names(&self, data: &dyn DataIter) -> Vec<String> {
        let inputs: HashSet<&str> = data
            .provide_data()
            .iter()
            .chain(data.provide_label())
            .map(|desc| desc.name.as_str())
            .collect();

        self.graph
            .list_arguments()
            .into_iter()
            .filter(|name| !inputs.contains(name.as_str()))
            .collect()
    }

    /// Initializes the parameters and auxiliary states missing from the maps.
    fn init_params(&mut self, data: &dyn DataIter, param_names: &[String]) -> Result<()> {
        let known: HashMap<String, Shape> = data
            .provide_data()
            .iter()
            .chain(data.provide_label())
            .map(|desc| (desc.name.clone(), desc.shape.clone()))
            .collect();

        let shapes = self.graph.infer_shape(&known)?;
        let arg_names = self.graph.list_arguments();

        if shapes.args.len() != arg_names.len() {
            return Err(TrainErr::InvalidConfiguration(format!(
                "inferred {} shapes for {} arguments",
                shapes.args.len(),
                arg_names.len()
            )));
        }

        let params: HashSet<&String> = param_names.iter().collect();
        let args = arg_names.into_iter().zip(shapes.args);
        for (name, shape) in args.filter(|(name, _)| params.contains(name)) {
            if !self.arg_params.contains_key(&name) {
                let tensor = Tensor::zeros(shape, Context::default(), DType::F32)?;
                self.config.initializer.init(&name, &tensor, &mut self.rng)?;
                self.arg_params.insert(name, tensor);
            }
        }

        let aux = self.graph.list_auxiliary_states().into_iter().zip(shapes.aux);
        for (name, shape) in aux {
            if !self.aux_params.contains_key(&name) {
                let tensor = Tensor::zeros(shape, Context::default(), DType::F32)?;
                self.config.initializer.init(&name, &tensor, &mut self.rng)?;
                self.aux_params.insert(name, tensor);
            }
        }

        Ok(())
    }
}

/// The optimizer to train with, gradients are averaged over the batch unless a rescale
/// was configured.
fn optimizer_spec(spec: &OptimizerSpec, batch_size: usize) -> OptimizerSpec {
    let mut spec = spec.clone();

    let base = spec.base_mut();
    if base.rescale_grad.is_none() {
        base.rescale_grad = Some(1. / batch_size.max(1) as f32);
    }

    spec
}
