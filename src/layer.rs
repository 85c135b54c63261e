//! Layers.
//!
//! A [`Layer`] computes a forward and a backward pass. Layers are owned by a
//! [`Model`](crate::model::Model), which stores them in order and hands each layer views of its
//! neighbors when it computes. Layers never hold references to each other.
use crate::{
    comm::Comm,
    data::ExecutionMode,
    device::{DeviceMatrix, Executor},
    error::Result,
    matrix::{DistMat, Distribution},
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

pub mod activation;
pub use activation::{Activation, ActivationLayer, DeviceSlot};

pub mod io;
pub use io::{InputLayer, TargetLayer};

#[cfg(test)]
mod tests;

/// The position of a layer in its model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    /// The index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "layer {}", self.0)
    }
}

/// What a layer knows about an adjacent layer during setup.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Neighbor {
    /// The neighbor.
    pub id: LayerId,
    /// Its output size. Zero if it has not been set up yet.
    pub num_neurons: usize,
    /// Whether it computes on devices.
    pub using_gpus: bool,
}

/// Arguments to [`Layer::setup()`].
#[derive(Clone, Copy, Debug)]
pub struct SetupContext<'a> {
    /// The layer being set up.
    pub id: LayerId,
    /// The communicator.
    pub comm: &'a Comm,
    /// The global minibatch size.
    pub mini_batch_size: usize,
    /// How columns are split among ranks.
    pub distribution: Distribution,
    /// The previous layer.
    pub prev: Option<Neighbor>,
    /// The next layer.
    pub next: Option<Neighbor>,
}

/// The output of an adjacent layer.
#[derive(Clone, Copy, Debug)]
pub struct LayerOutput<'a> {
    /// On the host.
    pub host: &'a DistMat,
    /// On the devices, if the adjacent layer computes there.
    pub device: Option<&'a DeviceMatrix>,
}

/// Arguments to [`Layer::forward_compute()`].
#[derive(Clone, Copy, Debug)]
pub struct ForwardContext<'a> {
    /// The execution mode.
    pub mode: ExecutionMode,
    /// The activations of the previous layer.
    pub input: Option<LayerOutput<'a>>,
}

/// Arguments to [`Layer::backward_compute()`].
#[derive(Clone, Copy, Debug)]
pub struct BackwardContext<'a> {
    /// The execution mode.
    pub mode: ExecutionMode,
    /// The activations of the previous layer.
    pub input: Option<LayerOutput<'a>>,
    /// The error signal of the next layer.
    pub gradient: Option<LayerOutput<'a>>,
}

/// A unit of computation.
///
/// # Lifecycle
/// - Constructed during model assembly, with its [`Executor`].
/// - [`.setup()`](Layer::setup) is called once, in model order, to size buffers from the
///   neighbors.
/// - [`.forward_compute()`](Layer::forward_compute) and
///   [`.backward_compute()`](Layer::backward_compute) are called every step. Device layers only
///   enqueue work; the model synchronizes and then calls the matching `_complete` method.
/// - Dropping the layer frees the device buffers it owns.
pub trait Layer: Send + Sync + Debug {
    /// A short type name, ie "relu".
    fn name(&self) -> &str;
    /// A description of the layer and its configuration.
    fn describe(&self) -> String;
    /// The output size. Zero before setup for layers that take it from a neighbor.
    fn num_neurons(&self) -> usize;
    /// Where the layer computes.
    fn executor(&self) -> &Executor;
    /// Whether the layer computes on devices.
    fn using_gpus(&self) -> bool {
        self.executor().is_device()
    }
    /// Sizes and allocates buffers.
    ///
    /// **Errors**
    /// - The neighbors are incompatible, ie their dimensions do not match.
    /// - Device buffers could not be allocated.
    fn setup(&mut self, ctx: &SetupContext) -> Result<()>;
    /// Whether [`.setup()`](Layer::setup) has completed.
    fn is_setup(&self) -> bool;
    /// Computes the activations.
    fn forward_compute(&mut self, ctx: ForwardContext) -> Result<()>;
    /// Finishes the forward pass after devices are synchronized.
    fn forward_complete(&mut self) -> Result<()> {
        Ok(())
    }
    /// Computes the error signal.
    fn backward_compute(&mut self, ctx: BackwardContext) -> Result<()>;
    /// Finishes the backward pass after devices are synchronized.
    fn backward_complete(&mut self) -> Result<()> {
        Ok(())
    }
    /// Advances data readers, returning false once the epoch of `mode` is complete.
    fn update(&mut self, mode: ExecutionMode) -> Result<bool> {
        let _ = mode;
        Ok(true)
    }
    /// The output of the forward pass.
    fn activations(&self) -> &DistMat;
    /// The output of the backward pass.
    fn error_signal(&self) -> &DistMat;
    /// The activations on the devices.
    fn device_activations(&self) -> Option<&DeviceMatrix> {
        None
    }
    /// The error signal on the devices.
    fn device_error_signal(&self) -> Option<&DeviceMatrix> {
        None
    }
    /// Downcast to an input layer.
    fn as_input(&self) -> Option<&InputLayer> {
        None
    }
    /// Downcast to a target layer.
    fn as_target(&self) -> Option<&TargetLayer> {
        None
    }
    /// An independent copy for model replication.
    ///
    /// Owned state is copied; shared resources like data readers are shared. Device buffers are
    /// not copied, so the copy must be set up before use.
    fn copy(&self) -> Box<dyn Layer>;
}

impl<'a> LayerOutput<'a> {
    /// The output of `layer`.
    pub fn activations(layer: &'a dyn Layer) -> Self {
        Self {
            host: layer.activations(),
            device: layer.device_activations(),
        }
    }
    /// The error signal of `layer`.
    pub fn error_signal(layer: &'a dyn Layer) -> Self {
        Self {
            host: layer.error_signal(),
            device: layer.device_error_signal(),
        }
    }
}
