use super::DeviceManager;
use std::sync::Arc;

/// Device activation functions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ActivationMode {
    /// `max(x, 0)`
    Relu,
    /// `x` if positive, else `alpha * x`.
    LeakyRelu,
    /// Logistic sigmoid.
    Sigmoid,
    /// Hyperbolic tangent.
    Tanh,
    /// `ln(1 + e^x)`
    Softplus,
    /// `x`
    Identity,
    /// A user supplied function pair.
    Custom,
}

/// Describes the shape and layout of a device tensor.
///
/// Dimensions are padded with leading ones to at least 4, with packed (row major) strides.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TensorDescriptor {
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl TensorDescriptor {
    /// A descriptor for `mini_batch_size_per_gpu` samples of `neuron_dims`.
    pub fn new(mini_batch_size_per_gpu: usize, neuron_dims: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(neuron_dims.len().max(3) + 1);
        dims.push(mini_batch_size_per_gpu);
        dims.extend_from_slice(neuron_dims);
        while dims.len() < 4 {
            dims.insert(0, 1);
        }
        let mut strides = vec![1; dims.len()];
        for i in (0..dims.len() - 1).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        Self { dims, strides }
    }
    /// The dimensions.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }
    /// The strides.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }
}

/// Describes an activation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActivationDescriptor {
    /// The function.
    pub mode: ActivationMode,
    /// Whether NaN inputs propagate to the output.
    pub propagate_nan: bool,
    /// Extra parameter, ie the slope of leaky relu.
    pub coef: f32,
}

/// The tensor and activation descriptors of a device layer.
///
/// Created and destroyed together, so they are either both valid or both absent. Registered with
/// the manager while alive.
#[derive(Debug)]
pub struct Descriptors {
    manager: Arc<DeviceManager>,
    tensor: TensorDescriptor,
    activation: ActivationDescriptor,
}

impl Descriptors {
    /// Creates the descriptors.
    pub fn new(
        manager: Arc<DeviceManager>,
        tensor: TensorDescriptor,
        activation: ActivationDescriptor,
    ) -> Self {
        manager.descriptor_created();
        Self {
            manager,
            tensor,
            activation,
        }
    }
    /// The tensor descriptor.
    pub fn tensor(&self) -> &TensorDescriptor {
        &self.tensor
    }
    /// The activation descriptor.
    pub fn activation(&self) -> &ActivationDescriptor {
        &self.activation
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        self.manager.descriptor_destroyed();
    }
}
