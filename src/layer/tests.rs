use super::*;
use crate::{data::ExecutionMode, matrix::DataType};
use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{array, Array2};

fn setup_ctx(
    comm: &Comm,
    id: usize,
    mini_batch_size: usize,
    prev: Option<Neighbor>,
    next: Option<Neighbor>,
) -> SetupContext<'_> {
    SetupContext {
        id: LayerId(id),
        comm,
        mini_batch_size,
        distribution: Distribution::local(),
        prev,
        next,
    }
}

fn neighbor(id: usize, num_neurons: usize, using_gpus: bool) -> Neighbor {
    Neighbor {
        id: LayerId(id),
        num_neurons,
        using_gpus,
    }
}

fn dist_mat(x: Array2<DataType>) -> DistMat {
    let mut output = DistMat::zeros(x.nrows(), x.ncols(), Distribution::local());
    output.local_mut().assign(&x);
    output
}

fn host(x: &DistMat) -> LayerOutput {
    LayerOutput {
        host: x,
        device: None,
    }
}

#[test]
fn relu_gradient_at_zero() {
    assert_eq!(Activation::Relu.function(-1.), 0.);
    assert_eq!(Activation::Relu.function(2.5), 2.5);
    assert_eq!(Activation::Relu.gradient(0.), 0.);
    assert_eq!(Activation::Relu.gradient(-3.), 0.);
    assert_eq!(Activation::Relu.gradient(1e-3), 1.);
}

#[test]
fn activation_gradients_match_finite_differences() {
    let activations = [
        Activation::Relu,
        Activation::LeakyRelu { alpha: 0.1 },
        Activation::Sigmoid,
        Activation::Tanh,
        Activation::Softplus,
        Activation::Identity,
    ];
    let h = 1e-3f64;
    for activation in activations {
        for x in [-2.5f64, -0.7, 0.3, 1.9] {
            let f = |x: f64| f64::from(activation.function(x as DataType));
            let numeric = (f(x + h) - f(x - h)) / (2. * h);
            let analytic = f64::from(activation.gradient(x as DataType));
            assert_relative_eq!(numeric, analytic, epsilon = 1e-2);
        }
    }
}

#[test]
fn custom_activation() {
    let square = Activation::Custom {
        name: "square",
        f: |x| x * x,
        df: |x| 2. * x,
    };
    assert_eq!(square.name(), "square");
    assert_eq!(square.function(3.), 9.);
    assert_eq!(square.gradient(3.), 6.);
    let layer = ActivationLayer::new(square, Executor::Cpu);
    assert_eq!(layer.name(), "square");
}

#[test]
fn relu_cpu_forward_backward() {
    let comm = Comm::single();
    let mut relu = ActivationLayer::relu(Executor::Cpu);
    relu.setup(&setup_ctx(&comm, 1, 3, Some(neighbor(0, 2, false)), None))
        .unwrap();
    assert!(relu.is_setup());
    assert_eq!(relu.num_neurons(), 2);
    let x = dist_mat(array![[-1., 0., 2.], [3., -4., 0.5]]);
    relu.forward_compute(ForwardContext {
        mode: ExecutionMode::Training,
        input: Some(host(&x)),
    })
    .unwrap();
    relu.forward_complete().unwrap();
    assert_eq!(relu.activations().local(), array![[0f32, 0., 2.], [3., 0., 0.5]]);
    let dy = dist_mat(Array2::from_elem((2, 3), 2.));
    relu.backward_compute(BackwardContext {
        mode: ExecutionMode::Training,
        input: Some(host(&x)),
        gradient: Some(host(&dy)),
    })
    .unwrap();
    relu.backward_complete().unwrap();
    assert_eq!(relu.error_signal().local(), array![[0f32, 0., 2.], [2., 0., 2.]]);
}

#[test]
fn sigmoid_cpu_forward_backward() {
    let comm = Comm::single();
    let mut sigmoid = ActivationLayer::new(Activation::Sigmoid, Executor::Cpu);
    sigmoid
        .setup(&setup_ctx(&comm, 1, 2, Some(neighbor(0, 2, false)), None))
        .unwrap();
    let x = dist_mat(array![[0., 2.], [-1., 4.]]);
    sigmoid
        .forward_compute(ForwardContext {
            mode: ExecutionMode::Training,
            input: Some(host(&x)),
        })
        .unwrap();
    sigmoid.forward_complete().unwrap();
    let y = x.local().mapv(|x| 1. / (1. + (-x).exp()));
    assert_abs_diff_eq!(sigmoid.activations().local(), y.view(), epsilon = 1e-6);
    let dy = dist_mat(Array2::ones((2, 2)));
    sigmoid
        .backward_compute(BackwardContext {
            mode: ExecutionMode::Training,
            input: Some(host(&x)),
            gradient: Some(host(&dy)),
        })
        .unwrap();
    sigmoid.backward_complete().unwrap();
    let dx = y.mapv(|y| y * (1. - y));
    assert_abs_diff_eq!(sigmoid.error_signal().local(), dx.view(), epsilon = 1e-6);
}

#[test]
fn activation_requires_prev() {
    let comm = Comm::single();
    let mut relu = ActivationLayer::relu(Executor::Cpu);
    let error = relu.setup(&setup_ctx(&comm, 0, 3, None, None)).unwrap_err();
    assert!(error.is_config());
    assert!(!relu.is_setup());
}

#[test]
fn activation_input_mismatch() {
    let comm = Comm::single();
    let mut relu = ActivationLayer::relu(Executor::Cpu);
    relu.setup(&setup_ctx(&comm, 1, 3, Some(neighbor(0, 2, false)), None))
        .unwrap();
    let x = dist_mat(Array2::zeros((4, 3)));
    let error = relu
        .forward_compute(ForwardContext {
            mode: ExecutionMode::Training,
            input: Some(host(&x)),
        })
        .unwrap_err();
    assert!(error.is_config());
}

#[test]
fn copy_is_independent() {
    let comm = Comm::single();
    let mut relu = ActivationLayer::relu(Executor::Cpu);
    relu.setup(&setup_ctx(&comm, 1, 2, Some(neighbor(0, 1, false)), None))
        .unwrap();
    let copy = relu.copy();
    let x = dist_mat(array![[1., 2.]]);
    relu.forward_compute(ForwardContext {
        mode: ExecutionMode::Training,
        input: Some(host(&x)),
    })
    .unwrap();
    assert_eq!(relu.activations().local(), array![[1f32, 2.]]);
    assert_eq!(copy.activations().local(), array![[0f32, 0.]]);
    assert_eq!(copy.name(), "relu");
}

#[cfg(not(feature = "device"))]
#[test]
fn device_without_support() {
    let error = Executor::device(1).unwrap_err();
    assert!(error.is_config());
}

#[cfg(feature = "device")]
mod device {
    use super::*;
    use crate::device::DeviceManager;
    use std::sync::Arc;

    fn device_executor(num_gpus: usize) -> (Executor, Arc<DeviceManager>) {
        let executor = Executor::device(num_gpus).unwrap();
        let manager = executor.manager().unwrap().clone();
        (executor, manager)
    }

    #[test]
    fn zero_gpus_is_config_error() {
        assert!(Executor::device(0).unwrap_err().is_config());
    }

    #[test]
    fn relu_device_matches_cpu() {
        let comm = Comm::single();
        let (executor, manager) = device_executor(2);
        let mut cpu = ActivationLayer::relu(Executor::Cpu);
        let mut gpu = ActivationLayer::relu(executor);
        let ctx = setup_ctx(&comm, 1, 3, Some(neighbor(0, 2, false)), None);
        cpu.setup(&ctx).unwrap();
        gpu.setup(&ctx).unwrap();
        assert_eq!(gpu.mini_batch_size_per_gpu(), Some(2));
        let x = dist_mat(array![[-1., 0., 2.], [3., -4., 0.5]]);
        let dy = dist_mat(array![[1., 2., 3.], [4., 5., 6.]]);
        for layer in [&mut cpu, &mut gpu] {
            layer
                .forward_compute(ForwardContext {
                    mode: ExecutionMode::Training,
                    input: Some(host(&x)),
                })
                .unwrap();
            layer.executor().synchronize().unwrap();
            layer.forward_complete().unwrap();
            layer
                .backward_compute(BackwardContext {
                    mode: ExecutionMode::Training,
                    input: Some(host(&x)),
                    gradient: Some(host(&dy)),
                })
                .unwrap();
            layer.executor().synchronize().unwrap();
            layer.backward_complete().unwrap();
        }
        assert_eq!(gpu.activations(), cpu.activations());
        assert_eq!(gpu.error_signal(), cpu.error_signal());
        drop(gpu);
        let stats = manager.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.live_descriptors, 0);
    }

    #[test]
    fn fewer_readers_than_procs() {
        // 4 procs per model, but only 2 read: rank 0 holds 4 of the 8 samples
        let comm = Comm::new(0, 4, 4).unwrap();
        let (executor, _manager) = device_executor(2);
        let mut layer = ActivationLayer::relu(executor);
        let ctx = SetupContext {
            distribution: Distribution::new(2, 0).unwrap(),
            ..setup_ctx(&comm, 1, 8, Some(neighbor(0, 3, false)), None)
        };
        layer.setup(&ctx).unwrap();
        let per_gpu = layer.mini_batch_size_per_gpu().unwrap();
        assert_eq!(per_gpu, 2);
        assert_eq!(layer.activations().local_width(), 4);
        assert!(per_gpu * 2 >= layer.activations().local_width());
    }

    // cpu -> gpu a -> gpu b -> cpu c -> gpu d
    #[test]
    fn shared_buffers_freed_once() {
        let comm = Comm::single();
        let (executor, manager) = device_executor(2);
        let mut a = ActivationLayer::relu(executor.clone());
        let mut b = ActivationLayer::new(Activation::Identity, executor.clone());
        let mut c = ActivationLayer::relu(Executor::Cpu);
        let mut d = ActivationLayer::new(Activation::Tanh, executor);
        a.setup(&setup_ctx(&comm, 1, 4, Some(neighbor(0, 3, false)), Some(neighbor(2, 0, true))))
            .unwrap();
        b.setup(&setup_ctx(&comm, 2, 4, Some(neighbor(1, 3, true)), Some(neighbor(3, 0, false))))
            .unwrap();
        c.setup(&setup_ctx(&comm, 3, 4, Some(neighbor(2, 3, true)), Some(neighbor(4, 0, true))))
            .unwrap();
        d.setup(&setup_ctx(&comm, 4, 4, Some(neighbor(3, 3, false)), None))
            .unwrap();

        let (prev, next) = a.device_slots().unwrap();
        assert!(prev.is_owned());
        assert!(matches!(next, DeviceSlot::BorrowedFromNext));
        let (prev, next) = b.device_slots().unwrap();
        assert!(matches!(prev, DeviceSlot::BorrowedFromPrev));
        assert!(next.is_owned());
        assert!(c.device_slots().is_none());
        let (prev, next) = d.device_slots().unwrap();
        assert!(prev.is_owned() && next.is_owned());

        // a: 3 matrices, b: 3, d: 4, on 2 devices each
        let stats = manager.stats();
        assert_eq!(stats.live_buffers, 20);
        assert_eq!(stats.live_descriptors, 3);

        let x = dist_mat(array![
            [-1., 2., -3., 4.],
            [0.5, -0.5, 1.5, -1.5],
            [0., 1., 0., -1.]
        ]);
        a.forward_compute(ForwardContext {
            mode: ExecutionMode::Training,
            input: Some(host(&x)),
        })
        .unwrap();
        manager.synchronize().unwrap();
        a.forward_complete().unwrap();
        b.forward_compute(ForwardContext {
            mode: ExecutionMode::Training,
            input: Some(LayerOutput::activations(&a)),
        })
        .unwrap();
        manager.synchronize().unwrap();
        b.forward_complete().unwrap();
        let expected = x.local().mapv(|x| x.max(0.));
        assert_eq!(b.activations().local(), expected);

        let dy = dist_mat(Array2::ones((3, 4)));
        b.backward_compute(BackwardContext {
            mode: ExecutionMode::Training,
            input: Some(LayerOutput::activations(&a)),
            gradient: Some(host(&dy)),
        })
        .unwrap();
        manager.synchronize().unwrap();
        b.backward_complete().unwrap();
        a.backward_compute(BackwardContext {
            mode: ExecutionMode::Training,
            input: Some(host(&x)),
            gradient: Some(LayerOutput::error_signal(&b)),
        })
        .unwrap();
        manager.synchronize().unwrap();
        a.backward_complete().unwrap();
        let expected = x.local().mapv(|x| if x > 0. { 1. } else { 0. });
        assert_eq!(a.error_signal().local(), expected);

        drop((a, b, c, d));
        let stats = manager.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.allocations, 20);
        assert_eq!(stats.frees, 20);
        assert_eq!(stats.invalid_frees, 0);
        assert_eq!(stats.live_descriptors, 0);
    }

    #[test]
    fn device_copy_drops_device_state() {
        let comm = Comm::single();
        let (executor, manager) = device_executor(1);
        let mut relu = ActivationLayer::relu(executor);
        relu.setup(&setup_ctx(&comm, 1, 2, Some(neighbor(0, 2, false)), None))
            .unwrap();
        let live = manager.stats().live_buffers;
        let copy = relu.copy();
        assert!(!copy.is_setup());
        assert!(copy.device_activations().is_none());
        assert_eq!(manager.stats().live_buffers, live);
    }
}
