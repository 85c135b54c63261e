//! Models and the training loop.
//!
//! A [`Model`] owns its layers in order. Layers are addressed by [`LayerId`]; during a pass each
//! layer is handed views of its neighbors' outputs, so no layer holds a reference to another.
//!
//! The model is the synchronization point for device execution: after a device layer computes,
//! its streams are synchronized before the next layer consumes the output.
use crate::{
    callback::Callback,
    comm::Comm,
    data::{ExecutionMode, ReaderSharing},
    error::{config_bail, Error, Result},
    layer::{
        BackwardContext, ForwardContext, InputLayer, Layer, LayerId, LayerOutput, Neighbor,
        SetupContext, TargetLayer,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    mem,
    sync::Arc,
    time::{Duration, Instant},
};

/// Statistics of a phase.
#[derive(Default, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    steps: usize,
    objective_sum: f64,
}

impl Stats {
    /// The number of local samples.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The number of minibatches.
    pub fn steps(&self) -> usize {
        self.steps
    }
    /// The mean of the objective over local samples, or None if this rank saw no samples.
    pub fn objective(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.objective_sum / self.count as f64)
        } else {
            None
        }
    }
    fn accumulate(&mut self, objective_sum: f64, count: usize) {
        self.objective_sum += objective_sum;
        self.count += count;
        self.steps += 1;
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    train: Stats,
    validation: Option<Stats>,
}

impl Summary {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and
    /// the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, mut f: F) -> Result<(Stats, Option<Stats>)>
    where
        F: FnMut(&Self) -> Result<(Stats, Option<Stats>)>,
    {
        let start = Instant::now();
        let (train, validation) = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.train = train;
        self.validation = validation;
        Ok((train, validation))
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The duration of all epochs.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// Training statistics of the last epoch.
    pub fn train(&self) -> &Stats {
        &self.train
    }
    /// Validation statistics of the last epoch, if there is a validation reader.
    pub fn validation(&self) -> Option<&Stats> {
        self.validation.as_ref()
    }
}

/// A chain of layers, from an [`InputLayer`] to a [`TargetLayer`].
#[derive(Debug)]
pub struct Model {
    comm: Comm,
    mini_batch_size: usize,
    layers: Vec<Box<dyn Layer>>,
    callbacks: Vec<Box<dyn Callback>>,
    mode: ExecutionMode,
    stats: Stats,
    summary: Summary,
    is_setup: bool,
}

impl Model {
    /// Creates an empty model.
    ///
    /// **Errors**
    /// - `mini_batch_size` is 0.
    pub fn new(comm: Comm, mini_batch_size: usize) -> Result<Self> {
        if mini_batch_size == 0 {
            config_bail!("mini_batch_size must be positive");
        }
        Ok(Self {
            comm,
            mini_batch_size,
            layers: Vec::new(),
            callbacks: Vec::new(),
            mode: ExecutionMode::Training,
            stats: Stats::default(),
            summary: Summary::default(),
            is_setup: false,
        })
    }
    /// Appends `layer`, returning its id.
    pub fn add(&mut self, layer: impl Layer + 'static) -> LayerId {
        self.add_boxed(Box::new(layer))
    }
    /// Appends `layer`, returning its id.
    pub fn add_boxed(&mut self, layer: Box<dyn Layer>) -> LayerId {
        let id = LayerId(self.layers.len());
        self.layers.push(layer);
        self.is_setup = false;
        id
    }
    /// The id the next added layer will have.
    pub fn next_id(&self) -> LayerId {
        LayerId(self.layers.len())
    }
    /// Appends `callback`.
    pub fn add_callback(&mut self, callback: impl Callback + 'static) {
        self.callbacks.push(Box::new(callback));
    }
    /// The communicator.
    pub fn comm(&self) -> &Comm {
        &self.comm
    }
    /// The global minibatch size.
    pub fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }
    /// The mode of the current or last pass.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.summary.epoch
    }
    /// Summary of training.
    pub fn summary(&self) -> &Summary {
        &self.summary
    }
    /// Whether [`.setup()`](Self::setup) has completed since the last change.
    pub fn is_setup(&self) -> bool {
        self.is_setup
    }
    /// The layers, in order.
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }
    /// The layer with `id`.
    pub fn layer(&self, id: LayerId) -> Option<&dyn Layer> {
        self.layers.get(id.0).map(|layer| &**layer)
    }
    /// The callbacks.
    pub fn callbacks(&self) -> &[Box<dyn Callback>] {
        &self.callbacks
    }
    /// The first layer, if it is an input layer.
    pub fn input_layer(&self) -> Option<&InputLayer> {
        self.layers.first().and_then(|layer| layer.as_input())
    }
    /// The last layer, if it is a target layer.
    pub fn target_layer(&self) -> Option<&TargetLayer> {
        self.layers.last().and_then(|layer| layer.as_target())
    }
    /// The layer whose activations are compared with the ground truth.
    pub fn output_layer(&self) -> Option<&dyn Layer> {
        self.layers
            .len()
            .checked_sub(2)
            .and_then(|i| self.layer(LayerId(i)))
    }
    /// Whether the input layer has a reader for `mode`.
    pub fn has_reader(&self, mode: ExecutionMode) -> bool {
        self.input_layer()
            .map_or(false, |input| input.io_buffer().has_reader(mode))
    }
    fn validate(&self) -> Result<()> {
        let input = self
            .input_layer()
            .ok_or_else(|| Error::config("the first layer must be an input layer"))?;
        let target = self
            .target_layer()
            .ok_or_else(|| Error::config("the last layer must be a target layer"))?;
        if target.input_layer() != LayerId(0) {
            config_bail!(
                "the target layer is paired with {}, not the input layer",
                target.input_layer()
            );
        }
        let inner = self.layers.iter().skip(1).take(self.layers.len().saturating_sub(2));
        for (i, layer) in inner.enumerate() {
            if layer.as_input().is_some() || layer.as_target().is_some() {
                config_bail!("{} ({}) must be first or last", LayerId(i + 1), layer.name());
            }
        }
        let (input_buffer, target_buffer) = (input.io_buffer(), target.io_buffer());
        match target_buffer.sharing() {
            ReaderSharing::Shared if !target_buffer.shares_readers_with(input_buffer) => {
                config_bail!(
                    "the target layer shares readers with the input layer, \
                     but was not given the same reader for every mode"
                )
            }
            ReaderSharing::PerLayer if target_buffer.shares_any_reader_with(input_buffer) => {
                config_bail!(
                    "the target layer has its own readers, \
                     but was given a reader of the input layer"
                )
            }
            _ => (),
        }
        for (i, pair) in self.layers.windows(2).enumerate() {
            let managers = (pair[0].executor().manager(), pair[1].executor().manager());
            if let (Some(a), Some(b)) = managers {
                if !Arc::ptr_eq(a, b) {
                    config_bail!(
                        "adjacent device layers {} and {} use different device managers",
                        LayerId(i),
                        LayerId(i + 1)
                    );
                }
            }
        }
        Ok(())
    }
    /// Sets up every layer in order.
    ///
    /// **Errors**
    /// - The first layer is not an input layer, or the last is not a target layer paired with it.
    /// - The reader sharing of the target layer does not match its readers.
    /// - Adjacent device layers use different device managers.
    /// - See [`Layer::setup()`].
    pub fn setup(&mut self) -> Result<()> {
        self.is_setup = false;
        self.validate()?;
        let distribution = self
            .input_layer()
            .map(InputLayer::distribution)
            .ok_or_else(|| Error::config("the first layer must be an input layer"))?;
        for i in 0..self.layers.len() {
            let prev = i.checked_sub(1).map(|j| neighbor(j, &*self.layers[j]));
            let next = self.layers.get(i + 1).map(|layer| neighbor(i + 1, &**layer));
            let ctx = SetupContext {
                id: LayerId(i),
                comm: &self.comm,
                mini_batch_size: self.mini_batch_size,
                distribution,
                prev,
                next,
            };
            self.layers[i].setup(&ctx)?;
            if self.comm.is_model_master() {
                let description = self.layers[i].describe();
                log::info!("{}: {description}", LayerId(i));
            }
        }
        self.is_setup = true;
        Ok(())
    }
    fn check_setup(&self) -> Result<()> {
        if !self.is_setup {
            config_bail!("the model is not set up");
        }
        Ok(())
    }
    /// Computes the forward pass of every layer in order.
    ///
    /// **Errors**
    /// - The model is not set up.
    /// - See [`Layer::forward_compute()`].
    pub fn forward_prop(&mut self, mode: ExecutionMode) -> Result<()> {
        self.check_setup()?;
        self.mode = mode;
        for i in 0..self.layers.len() {
            let (before, rest) = self.layers.split_at_mut(i);
            let layer = &mut rest[0];
            let input = before.last().map(|prev| LayerOutput::activations(&**prev));
            layer.forward_compute(ForwardContext { mode, input })?;
            if layer.using_gpus() {
                layer.executor().synchronize()?;
            }
            layer.forward_complete()?;
        }
        Ok(())
    }
    /// Computes the backward pass of every layer in reverse order.
    ///
    /// **Errors**
    /// - The model is not set up.
    /// - See [`Layer::backward_compute()`].
    pub fn backward_prop(&mut self, mode: ExecutionMode) -> Result<()> {
        self.check_setup()?;
        for i in (0..self.layers.len()).rev() {
            let (before, rest) = self.layers.split_at_mut(i);
            let Some((layer, after)) = rest.split_first_mut() else {
                continue;
            };
            let input = before.last().map(|prev| LayerOutput::activations(&**prev));
            let gradient = after.first().map(|next| LayerOutput::error_signal(&**next));
            layer.backward_compute(BackwardContext {
                mode,
                input,
                gradient,
            })?;
            if layer.using_gpus() {
                layer.executor().synchronize()?;
            }
            layer.backward_complete()?;
        }
        Ok(())
    }
    fn step(&mut self, mode: ExecutionMode) -> Result<bool> {
        self.forward_prop(mode)?;
        if mode == ExecutionMode::Training {
            self.backward_prop(mode)?;
        }
        if let Some((objective_sum, count)) = self.target_layer().map(TargetLayer::objective_sum) {
            self.stats.accumulate(objective_sum, count);
        }
        let mut more = true;
        for layer in self.layers.iter_mut() {
            more &= layer.update(mode)?;
        }
        Ok(more)
    }
    /// Trains on one minibatch.
    ///
    /// Returns false once the training epoch is complete.
    ///
    /// **Errors**
    /// - See [`.forward_prop()`](Self::forward_prop) and [`.backward_prop()`](Self::backward_prop).
    /// - There is no training reader.
    pub fn train_step(&mut self) -> Result<bool> {
        self.step(ExecutionMode::Training)
    }
    fn invoke_callbacks(&mut self, mut f: impl FnMut(&mut dyn Callback, &Model)) {
        let mut callbacks = mem::take(&mut self.callbacks);
        for callback in callbacks.iter_mut() {
            f(callback.as_mut(), self);
        }
        self.callbacks = callbacks;
    }
    fn run_phase(&mut self, mode: ExecutionMode) -> Result<Stats> {
        self.stats = Stats::default();
        while self.step(mode)? {}
        let stats = self.stats;
        log::debug!(
            "epoch {} {mode}: {} steps, {} local samples",
            self.summary.epoch,
            stats.steps,
            stats.count
        );
        self.invoke_callbacks(|callback, model| callback.on_phase_end(model, mode, &stats));
        Ok(stats)
    }
    /// Trains for `num_epochs` epochs, validating after each epoch if there is a validation
    /// reader.
    ///
    /// Sets up the model first if needed.
    ///
    /// **Errors**
    /// - See [`.setup()`](Self::setup) and [`.train_step()`](Self::train_step).
    pub fn train(&mut self, num_epochs: usize) -> Result<Summary> {
        if !self.is_setup {
            self.setup()?;
        }
        self.invoke_callbacks(|callback, model| callback.on_train_begin(model));
        let validate = self.has_reader(ExecutionMode::Validation);
        for _ in 0..num_epochs {
            let mut summary = mem::take(&mut self.summary);
            let result = summary.run_epoch(|_| {
                let train = self.run_phase(ExecutionMode::Training)?;
                let validation = if validate {
                    Some(self.run_phase(ExecutionMode::Validation)?)
                } else {
                    None
                };
                Ok((train, validation))
            });
            self.summary = summary;
            result?;
            let summary = self.summary.clone();
            self.invoke_callbacks(|callback, model| callback.on_epoch_end(model, &summary));
        }
        self.invoke_callbacks(|callback, model| callback.on_train_end(model));
        Ok(self.summary.clone())
    }
    /// Runs the forward pass over an epoch of `mode`, without training.
    ///
    /// Sets up the model first if needed.
    ///
    /// **Errors**
    /// - There is no reader for `mode`.
    /// - See [`.forward_prop()`](Self::forward_prop).
    pub fn evaluate(&mut self, mode: ExecutionMode) -> Result<Stats> {
        if !self.is_setup {
            self.setup()?;
        }
        if !self.has_reader(mode) {
            config_bail!("no data reader for {mode}");
        }
        self.run_phase(mode)
    }
    /// An independent copy of the model, sharing its data readers.
    ///
    /// The copy must be set up before use.
    pub fn copy(&self) -> Self {
        Self {
            comm: self.comm,
            mini_batch_size: self.mini_batch_size,
            layers: self.layers.iter().map(|layer| layer.copy()).collect(),
            callbacks: self.callbacks.iter().map(|callback| callback.copy()).collect(),
            mode: self.mode,
            stats: self.stats,
            summary: self.summary.clone(),
            is_setup: false,
        }
    }
}

fn neighbor(index: usize, layer: &dyn Layer) -> Neighbor {
    Neighbor {
        id: LayerId(index),
        num_neurons: layer.num_neurons(),
        using_gpus: layer.using_gpus(),
    }
}
