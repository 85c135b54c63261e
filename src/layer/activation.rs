//! Entrywise activation layers.
use super::{BackwardContext, ForwardContext, Layer, LayerOutput, SetupContext};
use crate::{
    device::{
        mini_batch_size_per_gpu, ActivationDescriptor, ActivationMode, DeviceManager,
        DeviceMatrix, Descriptors, Executor, TensorDescriptor,
    },
    error::{config_bail, Error, Result},
    matrix::{DataType, DistMat, Distribution},
};
use ndarray::Zip;
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// An entrywise function and its derivative.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Activation {
    /// Rectified linear unit, `max(x, 0)`.
    ///
    /// The gradient at 0 is 0.
    Relu,
    /// `x` if positive, else `alpha * x`.
    LeakyRelu {
        /// The slope for negative inputs.
        alpha: DataType,
    },
    /// `1 / (1 + e^-x)`
    Sigmoid,
    /// `tanh(x)`
    Tanh,
    /// `ln(1 + e^x)`
    Softplus,
    /// `x`
    Identity,
    /// A function pair.
    Custom {
        /// The name of the layer.
        name: &'static str,
        /// The function.
        f: fn(DataType) -> DataType,
        /// Its derivative.
        df: fn(DataType) -> DataType,
    },
}

impl Activation {
    /// Applies the function.
    pub fn function(&self, x: DataType) -> DataType {
        match *self {
            Self::Relu => {
                if x > 0. {
                    x
                } else {
                    0.
                }
            }
            Self::LeakyRelu { alpha } => {
                if x > 0. {
                    x
                } else {
                    alpha * x
                }
            }
            Self::Sigmoid => 1. / (1. + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Softplus => {
                // ln(1 + e^x) = max(x, 0) + ln(1 + e^-|x|)
                x.max(0.) + (-x.abs()).exp().ln_1p()
            }
            Self::Identity => x,
            Self::Custom { f, .. } => f(x),
        }
    }
    /// Applies the derivative.
    pub fn gradient(&self, x: DataType) -> DataType {
        match *self {
            Self::Relu => {
                if x > 0. {
                    1.
                } else {
                    0.
                }
            }
            Self::LeakyRelu { alpha } => {
                if x > 0. {
                    1.
                } else {
                    alpha
                }
            }
            Self::Sigmoid => {
                let y = Self::Sigmoid.function(x);
                y * (1. - y)
            }
            Self::Tanh => {
                let y = x.tanh();
                1. - y * y
            }
            Self::Softplus => Self::Sigmoid.function(x),
            Self::Identity => 1.,
            Self::Custom { df, .. } => df(x),
        }
    }
    /// The name of the layer.
    pub fn name(&self) -> &'static str {
        match *self {
            Self::Relu => "relu",
            Self::LeakyRelu { .. } => "leaky_relu",
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Softplus => "softplus",
            Self::Identity => "identity",
            Self::Custom { name, .. } => name,
        }
    }
    /// The device activation descriptor.
    pub fn descriptor(&self) -> ActivationDescriptor {
        let (mode, coef) = match *self {
            Self::Relu => (ActivationMode::Relu, 0.),
            Self::LeakyRelu { alpha } => (ActivationMode::LeakyRelu, alpha),
            Self::Sigmoid => (ActivationMode::Sigmoid, 0.),
            Self::Tanh => (ActivationMode::Tanh, 0.),
            Self::Softplus => (ActivationMode::Softplus, 0.),
            Self::Identity => (ActivationMode::Identity, 0.),
            Self::Custom { .. } => (ActivationMode::Custom, 0.),
        };
        ActivationDescriptor {
            mode,
            propagate_nan: true,
            coef,
        }
    }
}

/// A device buffer of a layer, tagged with its owner.
///
/// Buffers shared with an adjacent device layer are owned by that layer, so they are freed
/// exactly once.
#[derive(Debug)]
pub enum DeviceSlot {
    /// Allocated by this layer.
    OwnedHere(DeviceMatrix),
    /// The activations of the previous layer.
    BorrowedFromPrev,
    /// The error signal of the next layer.
    BorrowedFromNext,
}

impl DeviceSlot {
    /// Whether the buffer is owned by this layer.
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::OwnedHere(_))
    }
    fn resolve<'a>(
        &'a self,
        manager: &DeviceManager,
        neighbor: LayerOutput<'a>,
        what: &str,
    ) -> Result<&'a DeviceMatrix> {
        match self {
            Self::OwnedHere(matrix) => {
                manager.copy_to_device(neighbor.host.local(), matrix)?;
                Ok(matrix)
            }
            Self::BorrowedFromPrev | Self::BorrowedFromNext => neighbor.device.ok_or_else(|| {
                Error::resource(format!("{what} is borrowed but the neighbor has no device buffer"))
            }),
        }
    }
}

// Fields drop in order, so the descriptors are destroyed before device memory is freed.
struct DeviceState {
    descriptors: Descriptors,
    manager: Arc<DeviceManager>,
    mini_batch_size_per_gpu: usize,
    activations_d: DeviceMatrix,
    error_signal_d: DeviceMatrix,
    prev_activations_d: DeviceSlot,
    prev_error_signal_d: DeviceSlot,
}

impl Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("descriptors", &self.descriptors)
            .field("mini_batch_size_per_gpu", &self.mini_batch_size_per_gpu)
            .field("activations_d", &self.activations_d)
            .field("error_signal_d", &self.error_signal_d)
            .field("prev_activations_d", &self.prev_activations_d)
            .field("prev_error_signal_d", &self.prev_error_signal_d)
            .finish()
    }
}

/// Applies an [`Activation`] to every entry of its input.
///
/// The output has as many neurons as the input. On a device executor, the function is applied by
/// one kernel per device.
#[derive(Debug)]
pub struct ActivationLayer {
    activation: Activation,
    executor: Executor,
    num_neurons: usize,
    prev_activations: DistMat,
    activations: DistMat,
    error_signal: DistMat,
    device: Option<DeviceState>,
    is_setup: bool,
}

impl ActivationLayer {
    /// A layer applying `activation` on `executor`.
    pub fn new(activation: Activation, executor: Executor) -> Self {
        let empty = DistMat::zeros(0, 0, Distribution::local());
        Self {
            activation,
            executor,
            num_neurons: 0,
            prev_activations: empty.clone(),
            activations: empty.clone(),
            error_signal: empty,
            device: None,
            is_setup: false,
        }
    }
    /// A rectified linear unit layer.
    pub fn relu(executor: Executor) -> Self {
        Self::new(Activation::Relu, executor)
    }
    /// The activation.
    pub fn activation(&self) -> Activation {
        self.activation
    }
    /// The device buffers for the previous activations and the previous error signal.
    pub fn device_slots(&self) -> Option<(&DeviceSlot, &DeviceSlot)> {
        self.device
            .as_ref()
            .map(|state| (&state.prev_activations_d, &state.prev_error_signal_d))
    }
    /// The number of samples each device holds.
    pub fn mini_batch_size_per_gpu(&self) -> Option<usize> {
        self.device.as_ref().map(|state| state.mini_batch_size_per_gpu)
    }
    fn setup_device(&mut self, manager: &Arc<DeviceManager>, ctx: &SetupContext) -> Result<()> {
        // Sized by the ranks that read, not procs_per_model. With fewer readers than processes,
        // a reading rank holds more than mini_batch_size / procs_per_model samples.
        let mini_batch_size_per_gpu = mini_batch_size_per_gpu(
            ctx.mini_batch_size,
            ctx.distribution.degree(),
            manager.num_gpus(),
        );
        let descriptors = Descriptors::new(
            manager.clone(),
            TensorDescriptor::new(mini_batch_size_per_gpu, &[self.num_neurons]),
            self.activation.descriptor(),
        );
        let activations_d = manager.allocate(self.num_neurons, mini_batch_size_per_gpu)?;
        let error_signal_d = manager.allocate(self.num_neurons, mini_batch_size_per_gpu)?;
        let prev_activations_d = if ctx.prev.map_or(false, |prev| prev.using_gpus) {
            DeviceSlot::BorrowedFromPrev
        } else {
            DeviceSlot::OwnedHere(manager.allocate(self.num_neurons, mini_batch_size_per_gpu)?)
        };
        let prev_error_signal_d = if ctx.next.map_or(false, |next| next.using_gpus) {
            DeviceSlot::BorrowedFromNext
        } else {
            DeviceSlot::OwnedHere(manager.allocate(self.num_neurons, mini_batch_size_per_gpu)?)
        };
        log::debug!(
            "{}: {} x {mini_batch_size_per_gpu} on {} device(s), prev {:?}, next {:?}",
            ctx.id,
            self.num_neurons,
            manager.num_gpus(),
            prev_activations_d,
            prev_error_signal_d,
        );
        self.device.replace(DeviceState {
            descriptors,
            manager: manager.clone(),
            mini_batch_size_per_gpu,
            activations_d,
            error_signal_d,
            prev_activations_d,
            prev_error_signal_d,
        });
        Ok(())
    }
    fn device_state(&self) -> Result<&DeviceState> {
        self.device.as_ref().ok_or_else(|| {
            Error::unsupported(format!(
                "{} has no device state (executor {:?}, setup {})",
                self.activation.name(),
                self.executor,
                self.is_setup
            ))
        })
    }
    fn check_input<'a>(&self, input: Option<LayerOutput<'a>>) -> Result<&'a DistMat> {
        let input = input.ok_or_else(|| {
            Error::config(format!("{} requires a previous layer", self.activation.name()))
        })?;
        if input.host.height() != self.num_neurons {
            config_bail!(
                "{} expects {} neurons, found {}",
                self.activation.name(),
                self.num_neurons,
                input.host.height()
            );
        }
        if input.host.distribution() != self.activations.distribution() {
            config_bail!(
                "{} input distribution {:?} does not match {:?}",
                self.activation.name(),
                input.host.distribution(),
                self.activations.distribution()
            );
        }
        Ok(input.host)
    }
    fn fp_compute_cpu(&mut self, input: &DistMat) {
        self.prev_activations.local_mut().assign(&input.local());
        let activation = self.activation;
        Zip::from(self.activations.local_mut())
            .and(input.local())
            .par_for_each(|y, &x| *y = activation.function(x));
    }
    fn bp_compute_cpu(&mut self, gradient: &DistMat) {
        let activation = self.activation;
        Zip::from(self.error_signal.local_mut())
            .and(self.prev_activations.local())
            .and(gradient.local())
            .par_for_each(|dx, &x, &dy| *dx = dy * activation.gradient(x));
    }
    fn fp_compute_device(&self, input: LayerOutput) -> Result<()> {
        let state = self.device_state()?;
        let manager = &state.manager;
        let x = state
            .prev_activations_d
            .resolve(manager, input, "prev_activations_d")?;
        let y = &state.activations_d;
        let local_width = input.host.local_width();
        for device in manager.devices() {
            let len = x.device_columns(local_width, device.index()).len() * self.num_neurons;
            let (Some(x), Some(y)) = (x.buffer(device.index()), y.buffer(device.index())) else {
                return Err(Error::resource("device buffer missing"));
            };
            let activation = self.activation;
            device.launch(move |memory| {
                memory.with_buffers(&[x], y, |inputs, y| {
                    y[..len]
                        .iter_mut()
                        .zip(&inputs[0][..len])
                        .for_each(|(y, &x)| *y = activation.function(x));
                })
            })?;
        }
        Ok(())
    }
    fn bp_compute_device(&self, input: LayerOutput, gradient: LayerOutput) -> Result<()> {
        let state = self.device_state()?;
        let manager = &state.manager;
        // The previous activations were uploaded during the forward pass.
        let x = match &state.prev_activations_d {
            DeviceSlot::OwnedHere(x) => x,
            _ => input.device.ok_or_else(|| {
                Error::resource(
                    "prev_activations_d is borrowed but the neighbor has no device buffer",
                )
            })?,
        };
        let dy = state
            .prev_error_signal_d
            .resolve(manager, gradient, "prev_error_signal_d")?;
        let dx = &state.error_signal_d;
        let local_width = gradient.host.local_width();
        for device in manager.devices() {
            let index = device.index();
            let len = x.device_columns(local_width, index).len() * self.num_neurons;
            let buffers = (x.buffer(index), dy.buffer(index), dx.buffer(index));
            let (Some(x), Some(dy), Some(dx)) = buffers else {
                return Err(Error::resource("device buffer missing"));
            };
            let activation = self.activation;
            device.launch(move |memory| {
                memory.with_buffers(&[x, dy], dx, |inputs, dx| {
                    dx[..len]
                        .iter_mut()
                        .zip(inputs[0][..len].iter().zip(&inputs[1][..len]))
                        .for_each(|(dx, (&x, &dy))| *dx = dy * activation.gradient(x));
                })
            })?;
        }
        Ok(())
    }
}

impl Clone for ActivationLayer {
    fn clone(&self) -> Self {
        Self {
            activation: self.activation,
            executor: self.executor.clone(),
            num_neurons: self.num_neurons,
            prev_activations: self.prev_activations.clone(),
            activations: self.activations.clone(),
            error_signal: self.error_signal.clone(),
            device: None,
            is_setup: false,
        }
    }
}

impl Layer for ActivationLayer {
    fn name(&self) -> &str {
        self.activation.name()
    }
    fn describe(&self) -> String {
        let executor = match &self.executor {
            Executor::Cpu => "cpu".to_string(),
            Executor::Device(manager) => format!("{} device(s)", manager.num_gpus()),
        };
        format!(
            "{} neurons: {} executor: {executor}",
            self.activation.name(),
            self.num_neurons
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
            Error::config(format!("{}: {} requires a previous layer", ctx.id, self.name()))
        })?;
        if prev.num_neurons == 0 {
            config_bail!("{}: previous {} has no neurons", ctx.id, prev.id);
        }
        self.num_neurons = prev.num_neurons;
        self.prev_activations =
            DistMat::zeros(self.num_neurons, ctx.mini_batch_size, ctx.distribution);
        self.activations = self.prev_activations.clone();
        self.error_signal = self.prev_activations.clone();
        self.device.take();
        if let Executor::Device(manager) = &self.executor {
            let manager = manager.clone();
            self.setup_device(&manager, ctx)?;
        }
        self.is_setup = true;
        Ok(())
    }
    fn is_setup(&self) -> bool {
        self.is_setup
    }
    fn forward_compute(&mut self, ctx: ForwardContext) -> Result<()> {
        let input = self.check_input(ctx.input)?;
        self.prev_activations.resize_width(input.width());
        self.activations.resize_width(input.width());
        if self.using_gpus() {
            self.fp_compute_device(ctx.input.ok_or_else(|| Error::config("missing input"))?)
        } else {
            self.fp_compute_cpu(input);
            Ok(())
        }
    }
    fn forward_complete(&mut self) -> Result<()> {
        if let Some(state) = self.device.as_ref() {
            state
                .manager
                .copy_to_host(&state.activations_d, self.activations.local_mut())?;
        }
        Ok(())
    }
    fn backward_compute(&mut self, ctx: BackwardContext) -> Result<()> {
        let gradient = ctx.gradient.ok_or_else(|| {
            Error::config(format!("{} requires a next layer", self.activation.name()))
        })?;
        if !gradient.host.is_aligned_with(&self.activations) {
            config_bail!(
                "{} error signal of {} x {} does not match activations of {} x {}",
                self.activation.name(),
                gradient.host.height(),
                gradient.host.width(),
                self.activations.height(),
                self.activations.width()
            );
        }
        self.error_signal.resize_width(gradient.host.width());
        if self.using_gpus() {
            let input = ctx.input.ok_or_else(|| Error::config("missing input"))?;
            self.bp_compute_device(input, gradient)
        } else {
            self.bp_compute_cpu(gradient.host);
            Ok(())
        }
    }
    fn backward_complete(&mut self) -> Result<()> {
        if let Some(state) = self.device.as_ref() {
            state
                .manager
                .copy_to_host(&state.error_signal_d, self.error_signal.local_mut())?;
        }
        Ok(())
    }
    fn activations(&self) -> &DistMat {
        &self.activations
    }
    fn error_signal(&self) -> &DistMat {
        &self.error_signal
    }
    fn device_activations(&self) -> Option<&DeviceMatrix> {
        self.device.as_ref().map(|state| &state.activations_d)
    }
    fn device_error_signal(&self) -> Option<&DeviceMatrix> {
        self.device.as_ref().map(|state| &state.error_signal_d)
    }
    fn copy(&self) -> Box<dyn Layer> {
        Box::new(self.clone())
    }
}
