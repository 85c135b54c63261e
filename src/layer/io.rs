//! Input and target layers.
//!
//! Both bind a [`PartitionedIoBuffer`] and fetch their shard of every minibatch from the reader of
//! the current [`ExecutionMode`].
use super::{BackwardContext, ForwardContext, Layer, LayerId, SetupContext};
use crate::{
    comm::Comm,
    data::{
        ExecutionMode, FetchData, PartitionedIoBuffer, ReaderHandle, ReaderSharing,
        UpdateDataReader,
    },
    device::Executor,
    error::{config_bail, Error, Result},
    matrix::{DistMat, Distribution},
    objective::Objective,
};
use std::collections::BTreeMap;

fn common_size(io_buffer: &PartitionedIoBuffer, what: &str) -> Result<usize> {
    let mut sizes = io_buffer
        .modes()
        .map(|mode| Ok((mode, io_buffer.linearized_size(mode)?)))
        .collect::<Result<Vec<_>>>()?;
    sizes.dedup_by_key(|(_, size)| *size);
    match sizes.as_slice() {
        [(_, size)] => Ok(*size),
        _ => Err(Error::config(format!(
            "{what} readers disagree on the sample size: {sizes:?}"
        ))),
    }
}

fn set_reader_mini_batch_size(io_buffer: &PartitionedIoBuffer, mini_batch_size: usize) {
    for reader in io_buffer.readers().values() {
        reader.write().set_mini_batch_size(mini_batch_size);
    }
}

fn check_distribution(ctx: &SetupContext, io_buffer: &PartitionedIoBuffer) -> Result<()> {
    if ctx.distribution != io_buffer.distribution() {
        config_bail!(
            "{}: model distribution {:?} does not match the I/O buffer distribution {:?}",
            ctx.id,
            ctx.distribution,
            io_buffer.distribution()
        );
    }
    Ok(())
}

/// Supplies samples to the model.
#[derive(Clone, Debug)]
pub struct InputLayer {
    io_buffer: PartitionedIoBuffer,
    executor: Executor,
    num_neurons: usize,
    activations: DistMat,
    error_signal: DistMat,
    is_setup: bool,
}

impl InputLayer {
    /// Creates an input layer.
    ///
    /// **Errors**
    /// - The readers disagree on the sample size.
    /// - See [`PartitionedIoBuffer::new()`].
    pub fn new(
        comm: Comm,
        num_parallel_readers: usize,
        readers: BTreeMap<ExecutionMode, ReaderHandle>,
        sharing: ReaderSharing,
    ) -> Result<Self> {
        let io_buffer = PartitionedIoBuffer::new(
            comm,
            num_parallel_readers,
            readers,
            sharing,
            FetchData::new(true, false),
            UpdateDataReader::new(true),
        )?;
        let num_neurons = common_size(&io_buffer, "input")?;
        let empty = DistMat::zeros(0, 0, io_buffer.distribution());
        Ok(Self {
            io_buffer,
            executor: Executor::Cpu,
            num_neurons,
            activations: empty.clone(),
            error_signal: empty,
            is_setup: false,
        })
    }
    /// The I/O buffer.
    pub fn io_buffer(&self) -> &PartitionedIoBuffer {
        &self.io_buffer
    }
    /// The distribution of every layer of the model.
    pub fn distribution(&self) -> Distribution {
        self.io_buffer.distribution()
    }
}

impl Layer for InputLayer {
    fn name(&self) -> &str {
        "input:partitioned"
    }
    fn describe(&self) -> String {
        format!(
            "input_layer_partitioned_minibatch neurons: {} num_parallel_readers: {} sharing: {:?}",
            self.num_neurons,
            self.io_buffer.num_parallel_readers(),
            self.io_buffer.sharing()
        )
    }
    fn num_neurons(&self) -> usize {
        self.num_neurons
    }
    fn executor(&self) -> &Executor {
        &self.executor
    }
    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        if let Some(prev) = ctx.prev {
            config_bail!("{}: input layer follows {}", ctx.id, prev.id);
        }
        check_distribution(ctx, &self.io_buffer)?;
        set_reader_mini_batch_size(&self.io_buffer, ctx.mini_batch_size);
        self.activations = DistMat::zeros(self.num_neurons, ctx.mini_batch_size, ctx.distribution);
        self.error_signal = DistMat::zeros(self.num_neurons, ctx.mini_batch_size, ctx.distribution);
        self.is_setup = true;
        Ok(())
    }
    fn is_setup(&self) -> bool {
        self.is_setup
    }
    fn forward_compute(&mut self, ctx: ForwardContext) -> Result<()> {
        self.io_buffer
            .fetch_to_local_matrix(ctx.mode, &mut self.activations)?;
        self.error_signal.resize_width(self.activations.width());
        Ok(())
    }
    fn backward_compute(&mut self, _ctx: BackwardContext) -> Result<()> {
        Ok(())
    }
    fn update(&mut self, mode: ExecutionMode) -> Result<bool> {
        self.io_buffer.update_data_reader(mode)
    }
    fn activations(&self) -> &DistMat {
        &self.activations
    }
    fn error_signal(&self) -> &DistMat {
        &self.error_signal
    }
    fn as_input(&self) -> Option<&InputLayer> {
        Some(self)
    }
    fn copy(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}

/// Supplies ground truth and seeds the backward pass with the gradient of the objective.
///
/// Ground truth is one hot labels, or regression responses if `for_regression`.
#[derive(Clone, Debug)]
pub struct TargetLayer {
    io_buffer: PartitionedIoBuffer,
    input_layer: LayerId,
    for_regression: bool,
    objective: Objective,
    executor: Executor,
    num_neurons: usize,
    prediction: DistMat,
    ground_truth: DistMat,
    error_signal: DistMat,
    objective_sum: f64,
    num_samples: usize,
    is_setup: bool,
}

impl TargetLayer {
    /// Creates a target layer, paired with `input_layer`.
    ///
    /// **Errors**
    /// - The readers disagree on the ground truth size.
    /// - See [`PartitionedIoBuffer::new()`].
    pub fn new(
        comm: Comm,
        input_layer: LayerId,
        num_parallel_readers: usize,
        readers: BTreeMap<ExecutionMode, ReaderHandle>,
        sharing: ReaderSharing,
        for_regression: bool,
    ) -> Result<Self> {
        let io_buffer = PartitionedIoBuffer::new(
            comm,
            num_parallel_readers,
            readers,
            sharing,
            FetchData::new(false, for_regression),
            UpdateDataReader::new(false),
        )?;
        let num_neurons = common_size(&io_buffer, "target")?;
        let empty = DistMat::zeros(0, 0, io_buffer.distribution());
        Ok(Self {
            io_buffer,
            input_layer,
            for_regression,
            objective: Objective::default(),
            executor: Executor::Cpu,
            num_neurons,
            prediction: empty.clone(),
            ground_truth: empty.clone(),
            error_signal: empty,
            objective_sum: 0.,
            num_samples: 0,
            is_setup: false,
        })
    }
    /// Sets the objective. Default is mean squared error.
    pub fn with_objective(self, objective: Objective) -> Self {
        Self { objective, ..self }
    }
    /// The paired input layer.
    pub fn input_layer(&self) -> LayerId {
        self.input_layer
    }
    /// The I/O buffer.
    pub fn io_buffer(&self) -> &PartitionedIoBuffer {
        &self.io_buffer
    }
    /// Whether ground truth is a regression response.
    pub fn is_for_regression(&self) -> bool {
        self.for_regression
    }
    /// The objective.
    pub fn objective(&self) -> Objective {
        self.objective
    }
    /// The prediction of the last forward pass.
    pub fn prediction(&self) -> &DistMat {
        &self.prediction
    }
    /// The ground truth of the last forward pass.
    pub fn ground_truth(&self) -> &DistMat {
        &self.ground_truth
    }
    /// The sum of the objective over the local samples of the last forward pass, and the number
    /// of those samples.
    pub fn objective_sum(&self) -> (f64, usize) {
        (self.objective_sum, self.num_samples)
    }
}

impl Layer for TargetLayer {
    fn name(&self) -> &str {
        "target:partitioned"
    }
    fn describe(&self) -> String {
        format!(
            "target_layer_partitioned_minibatch neurons: {} input: {} regression: {} \
             objective: {:?} num_parallel_readers: {} sharing: {:?}",
            self.num_neurons,
            self.input_layer,
            self.for_regression,
            self.objective,
            self.io_buffer.num_parallel_readers(),
            self.io_buffer.sharing(),
        )
    }
    fn num_neurons(&self) -> usize {
        self.num_neurons
    }
    fn executor(&self) -> &Executor {
        &self.executor
    }
    fn setup(&mut self, ctx: &SetupContext) -> Result<()> {
        let prev = ctx.prev.ok_or_else(|| {
            Error::config(format!("{}: target layer requires a previous layer", ctx.id))
        })?;
        if let Some(next) = ctx.next {
            config_bail!("{}: target layer is followed by {}", ctx.id, next.id);
        }
        if prev.num_neurons != self.num_neurons {
            config_bail!(
                "{}: target expects {} neurons but {} has {}",
                ctx.id,
                self.num_neurons,
                prev.id,
                prev.num_neurons
            );
        }
        check_distribution(ctx, &self.io_buffer)?;
        set_reader_mini_batch_size(&self.io_buffer, ctx.mini_batch_size);
        let zeros = DistMat::zeros(self.num_neurons, ctx.mini_batch_size, ctx.distribution);
        self.prediction = zeros.clone();
        self.ground_truth = zeros.clone();
        self.error_signal = zeros;
        self.is_setup = true;
        Ok(())
    }
    fn is_setup(&self) -> bool {
        self.is_setup
    }
    fn forward_compute(&mut self, ctx: ForwardContext) -> Result<()> {
        let input = ctx
            .input
            .ok_or_else(|| Error::config("target layer requires a previous layer"))?;
        self.io_buffer
            .fetch_to_local_matrix(ctx.mode, &mut self.ground_truth)?;
        if !input.host.is_aligned_with(&self.ground_truth) {
            config_bail!(
                "prediction of {} x {} does not match ground truth of {} x {}",
                input.host.height(),
                input.host.width(),
                self.ground_truth.height(),
                self.ground_truth.width()
            );
        }
        self.prediction.resize_width(input.host.width());
        self.prediction.local_mut().assign(&input.host.local());
        self.objective_sum = self
            .objective
            .value(self.prediction.local(), self.ground_truth.local());
        self.num_samples = self.prediction.local_width();
        Ok(())
    }
    fn backward_compute(&mut self, _ctx: BackwardContext) -> Result<()> {
        self.error_signal.resize_width(self.prediction.width());
        self.objective.gradient(
            self.prediction.local(),
            self.ground_truth.local(),
            self.prediction.width(),
            self.error_signal.local_mut(),
        );
        Ok(())
    }
    fn update(&mut self, mode: ExecutionMode) -> Result<bool> {
        self.io_buffer.update_data_reader(mode)
    }
    fn activations(&self) -> &DistMat {
        &self.ground_truth
    }
    fn error_signal(&self) -> &DistMat {
        &self.error_signal
    }
    fn as_target(&self) -> Option<&TargetLayer> {
        Some(self)
    }
    fn copy(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
