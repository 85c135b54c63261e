use libtest_mimic::{Arguments, Failed, Trial};
use ndarray::Array2;
use shardnet::{
    callback::{Callback, SaveImages},
    comm::Comm,
    data::{reader_handle, ArrayReader, DataReader, ExecutionMode, ReaderHandle, ReaderSharing},
    device::Executor,
    layer::{Activation, ActivationLayer, InputLayer, Layer, TargetLayer},
    matrix::DataType,
    model::{Model, Stats},
    proto::{load_prototext, PrototextArgs, TrainingConfig},
    Result,
};
use std::{collections::BTreeMap, fs, path::Path};

fn main() {
    let args = Arguments::from_args();
    let tests = if cfg!(feature = "device") {
        tests(false).into_iter().chain(tests(true)).collect()
    } else {
        tests(false)
    };
    libtest_mimic::run(&args, tests).exit()
}

fn device_test(
    device: bool,
    name: &str,
    f: impl Fn(bool) -> Result<(), Failed> + Send + Sync + 'static,
) -> Trial {
    let name = format!("{name}_{}", if device { "device" } else { "host" });
    Trial::test(name, move || f(device))
}

fn tests(device: bool) -> Vec<Trial> {
    let mut tests = vec![
        device_test(device, "identity_autoencoder", identity_autoencoder),
        device_test(device, "partial_last_minibatch", partial_last_minibatch),
        device_test(device, "partition_is_disjoint", partition_is_disjoint),
        device_test(device, "idle_reader_ranks", idle_reader_ranks),
        device_test(device, "per_layer_readers", per_layer_readers),
        device_test(device, "model_copy", model_copy),
        device_test(device, "save_images_leaves_state", save_images_leaves_state),
    ];
    if device {
        tests.push(Trial::test("device_matches_host", device_matches_host));
        tests.push(Trial::test("device_buffers_released", device_buffers_released));
    } else {
        tests.extend([
            Trial::test("reader_sharing_mismatch", reader_sharing_mismatch),
            Trial::test("partly_shared_readers", partly_shared_readers),
            Trial::test("prototext_end_to_end", prototext_end_to_end),
            Trial::test("save_images_writes_files", save_images_writes_files),
            Trial::test("save_images_missing_dir", save_images_missing_dir),
        ]);
    }
    tests
}

fn data(num_samples: usize, num_features: usize) -> Array2<DataType> {
    let len = (num_samples * num_features) as DataType;
    Array2::from_shape_fn((num_samples, num_features), |(i, j)| {
        (i * num_features + j) as DataType / len
    })
}

fn reader(num_samples: usize, num_features: usize) -> ArrayReader {
    ArrayReader::new(data(num_samples, num_features), vec![0; num_samples], 1).unwrap()
}

fn executor(device: bool) -> Result<Executor> {
    if device {
        Executor::device(2)
    } else {
        Ok(Executor::Cpu)
    }
}

fn handles(reader: &ArrayReader) -> BTreeMap<ExecutionMode, ReaderHandle> {
    [(ExecutionMode::Training, reader_handle(reader.clone()))]
        .into_iter()
        .collect()
}

// input -> activations... -> target, regressing the input.
fn autoencoder(
    comm: Comm,
    reader: &ArrayReader,
    mini_batch_size: usize,
    num_parallel_readers: usize,
    activations: &[Activation],
    executor: &Executor,
) -> Result<Model> {
    let readers = handles(reader);
    let mut model = Model::new(comm, mini_batch_size)?;
    let input = model.add(InputLayer::new(
        comm,
        num_parallel_readers,
        readers.clone(),
        ReaderSharing::Shared,
    )?);
    for activation in activations {
        model.add(ActivationLayer::new(*activation, executor.clone()));
    }
    model.add(TargetLayer::new(
        comm,
        input,
        num_parallel_readers,
        readers,
        ReaderSharing::Shared,
        true,
    )?);
    Ok(model)
}

fn identity_autoencoder(device: bool) -> Result<(), Failed> {
    let executor = executor(device)?;
    let activations = [Activation::Relu, Activation::Identity];
    let mut model = autoencoder(Comm::single(), &reader(8, 3), 4, 1, &activations, &executor)?;
    let summary = model.train(3)?;
    assert_eq!(summary.epoch(), 3);
    assert_eq!(summary.train().count(), 8);
    assert_eq!(summary.train().steps(), 2);
    assert_eq!(summary.train().objective(), Some(0.));
    assert!(summary.validation().is_none());
    Ok(())
}

fn partial_last_minibatch(device: bool) -> Result<(), Failed> {
    let executor = executor(device)?;
    let mut model = autoencoder(
        Comm::single(),
        &reader(5, 2),
        2,
        1,
        &[Activation::Sigmoid],
        &executor,
    )?;
    let summary = model.train(2)?;
    assert_eq!(summary.train().count(), 5);
    assert_eq!(summary.train().steps(), 3);
    assert!(summary.train().objective().unwrap() > 0.);
    Ok(())
}

fn partition_is_disjoint(device: bool) -> Result<(), Failed> {
    let executor = executor(device)?;
    let reader = reader(7, 2);
    let expected = data(7, 2);
    let mut covered = vec![0; 7];
    for comm in Comm::model_ranks(3)? {
        let mut model = autoencoder(comm, &reader, 7, 3, &[Activation::Identity], &executor)?;
        model.setup()?;
        model.forward_prop(ExecutionMode::Training)?;
        let input = model.input_layer().unwrap().activations();
        assert_eq!(input.width(), 7);
        for (k, column) in input.columns().enumerate() {
            covered[column] += 1;
            assert_eq!(input.local().column(k), expected.row(column));
        }
        let target = model.target_layer().unwrap();
        assert_eq!(target.prediction().local(), target.ground_truth().local());
    }
    assert_eq!(covered, vec![1; 7]);
    Ok(())
}

fn idle_reader_ranks(device: bool) -> Result<(), Failed> {
    let executor = executor(device)?;
    let reader = reader(6, 2);
    let mut counts = Vec::new();
    for comm in Comm::model_ranks(3)? {
        let mut model = autoencoder(comm, &reader, 4, 2, &[Activation::Tanh], &executor)?;
        let summary = model.train(1)?;
        assert_eq!(summary.train().steps(), 2);
        counts.push(summary.train().count());
    }
    // minibatches of 4 and 2, split among 2 readers
    assert_eq!(counts, [3, 3, 0]);
    Ok(())
}

fn per_layer_readers(device: bool) -> Result<(), Failed> {
    let executor = executor(device)?;
    let reader = reader(6, 2).with_shuffle(7);
    let comm = Comm::single();
    let mut model = Model::new(comm, 4)?;
    let input = model.add(InputLayer::new(
        comm,
        1,
        handles(&reader),
        ReaderSharing::PerLayer,
    )?);
    model.add(ActivationLayer::relu(executor));
    model.add(TargetLayer::new(
        comm,
        input,
        1,
        handles(&reader),
        ReaderSharing::PerLayer,
        true,
    )?);
    for _ in 0..3 {
        let summary = model.train(1)?;
        assert_eq!(summary.train().count(), 6);
        // each layer shuffles its own reader with the same seed
        assert_eq!(summary.train().objective(), Some(0.));
    }
    Ok(())
}

fn model_copy(device: bool) -> Result<(), Failed> {
    let executor = executor(device)?;
    let activations = [Activation::Softplus];
    let mut model = autoencoder(Comm::single(), &reader(4, 2), 2, 1, &activations, &executor)?;
    let first = model.train(1)?;
    let mut copy = model.copy();
    assert!(!copy.is_setup());
    let second = copy.train(1)?;
    assert_eq!(second.epoch(), 2);
    assert_eq!(second.train().count(), first.train().count());
    assert_eq!(model.epoch(), 1);
    Ok(())
}

fn reader_sharing_mismatch() -> Result<(), Failed> {
    let reader = reader(4, 2);
    let comm = Comm::single();
    let cases = [(ReaderSharing::Shared, false), (ReaderSharing::PerLayer, true)];
    for (sharing, same_readers) in cases {
        let readers = handles(&reader);
        let target_readers = if same_readers {
            readers.clone()
        } else {
            handles(&reader)
        };
        let mut model = Model::new(comm, 2)?;
        let input = model.add(InputLayer::new(comm, 1, readers, sharing)?);
        model.add(ActivationLayer::relu(Executor::Cpu));
        model.add(TargetLayer::new(comm, input, 1, target_readers, sharing, true)?);
        assert!(model.setup().unwrap_err().is_config());
    }
    Ok(())
}

fn partly_shared_readers() -> Result<(), Failed> {
    let comm = Comm::single();
    let train = reader_handle(reader(4, 2));
    let mut input_readers = BTreeMap::new();
    input_readers.insert(ExecutionMode::Training, train.clone());
    input_readers.insert(ExecutionMode::Testing, reader_handle(reader(4, 2)));
    let mut target_readers = BTreeMap::new();
    target_readers.insert(ExecutionMode::Training, train);
    target_readers.insert(ExecutionMode::Testing, reader_handle(reader(4, 2)));
    let sharing = ReaderSharing::Shared;
    let mut model = Model::new(comm, 2)?;
    let input = model.add(InputLayer::new(comm, 1, input_readers.clone(), sharing)?);
    model.add(ActivationLayer::relu(Executor::Cpu));
    model.add(TargetLayer::new(comm, input, 1, target_readers, sharing, true)?);
    assert!(model.setup().unwrap_err().is_config());
    // a target missing the input layer's testing reader
    let mut model = Model::new(comm, 2)?;
    let mut training_only = input_readers.clone();
    training_only.remove(&ExecutionMode::Testing);
    let input = model.add(InputLayer::new(comm, 1, input_readers.clone(), sharing)?);
    model.add(ActivationLayer::relu(Executor::Cpu));
    model.add(TargetLayer::new(comm, input, 1, training_only, sharing, true)?);
    assert!(model.setup().unwrap_err().is_config());
    // per layer readers may not reuse any of the input layer's readers
    let sharing = ReaderSharing::PerLayer;
    let mut target_readers = input_readers.clone();
    target_readers.insert(ExecutionMode::Testing, reader_handle(reader(4, 2)));
    let mut model = Model::new(comm, 2)?;
    let input = model.add(InputLayer::new(comm, 1, input_readers, sharing)?);
    model.add(ActivationLayer::relu(Executor::Cpu));
    model.add(TargetLayer::new(comm, input, 1, target_readers, sharing, true)?);
    assert!(model.setup().unwrap_err().is_config());
    Ok(())
}

fn write_csv(path: &Path, num_samples: usize) -> Result<(), Failed> {
    let mut csv = String::new();
    for i in 0..num_samples {
        let x = i as f32 / num_samples as f32;
        csv.push_str(&format!("{}, {x}, {}, {}, {}\n", i % 3, 1. - x, x * x, 0.5));
    }
    fs::write(path, csv)?;
    Ok(())
}

fn prototext_end_to_end() -> Result<(), Failed> {
    let dir = tempfile::tempdir()?;
    let train = dir.path().join("train.csv");
    let test = dir.path().join("test.csv");
    write_csv(&train, 20)?;
    write_csv(&test, 6)?;
    let model = dir.path().join("model.prototext");
    let reader = dir.path().join("reader.prototext");
    let optimizer = dir.path().join("optimizer.prototext");
    fs::write(
        &model,
        r#"
# an autoencoder
model {
  mini_batch_size: 8
  num_epochs: 2
  num_parallel_readers: 4
  layer { input {} }
  layer { leaky_relu { alpha: 0.2 } }
  layer { identity {} }
  layer { target { shared_data_reader: false for_regression: true } }
  callback { print {} }
}
"#,
    )?;
    fs::write(
        &reader,
        format!(
            r#"
data_reader {{
  reader {{ role: "train" data_filename: "{}" num_labels: 3 validation_percent: 25 }}
  reader {{ role: "test" data_filename: "{}" }}
}}
"#,
            train.display(),
            test.display()
        ),
    )?;
    fs::write(&optimizer, "optimizer { adam { learn_rate: 0.001 } }")?;
    let args = PrototextArgs {
        model: Some(model.display().to_string()),
        reader: Some(reader.display().to_string()),
        data_set_metadata: None,
        optimizer: Some(optimizer.display().to_string()),
    };
    let docs = load_prototext(true, &args)?;
    assert_eq!(docs.len(), 1);
    let config = TrainingConfig::from_document(&docs[0])?;
    assert_eq!(config.optimizer.name, "adam");
    assert_eq!(config.readers.len(), 2);
    let mut model = config.build_model(Comm::single())?;
    let summary = model.train(config.model.num_epochs)?;
    assert_eq!(summary.epoch(), 2);
    assert_eq!(summary.train().count(), 15);
    assert_eq!(summary.validation().map(|x| x.count()), Some(5));
    let test = model.evaluate(ExecutionMode::Testing)?;
    assert_eq!(test.count(), 6);
    assert_eq!(test.objective(), Some(0.));
    Ok(())
}

fn save_images_writes_files() -> Result<(), Failed> {
    let dir = tempfile::tempdir()?;
    let mut model = autoencoder(
        Comm::single(),
        &reader(6, 4),
        4,
        1,
        &[Activation::Sigmoid],
        &Executor::Cpu,
    )?;
    model.add_callback(SaveImages::new(dir.path()).with_num_images(3));
    model.train(1)?;
    // the last minibatch holds 2 samples
    let mut names: Vec<_> = fs::read_dir(dir.path())?
        .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
        .collect::<Result<_, _>>()?;
    names.sort();
    assert_eq!(names, ["training-0000.pgm", "training-0001.pgm"]);
    let pgm = fs::read(dir.path().join("training-0000.pgm"))?;
    assert!(pgm.starts_with(b"P5\n4 2\n255\n"));
    Ok(())
}

// Every host and device matrix of every layer as raw bits, plus the reader position.
fn model_state(model: &Model) -> Result<(Vec<Array2<u32>>, usize), Failed> {
    let mut matrices = Vec::new();
    for layer in model.layers() {
        matrices.push(layer.activations().local().mapv(DataType::to_bits));
        matrices.push(layer.error_signal().local().mapv(DataType::to_bits));
        let device = [layer.device_activations(), layer.device_error_signal()];
        for matrix in device.into_iter().flatten() {
            let manager = layer.executor().manager().unwrap();
            manager.synchronize()?;
            let cols = matrix.cols_per_gpu() * matrix.buffers().len();
            let mut host = Array2::zeros((matrix.rows(), cols));
            manager.copy_to_host(matrix, host.view_mut())?;
            matrices.push(host.mapv(DataType::to_bits));
        }
    }
    let input = model.input_layer().unwrap().io_buffer();
    let position = input.reader(ExecutionMode::Training)?.read().position();
    Ok((matrices, position))
}

fn save_images_leaves_state(device: bool) -> Result<(), Failed> {
    let dir = tempfile::tempdir()?;
    let executor = executor(device)?;
    let activations = [Activation::Sigmoid, Activation::Relu];
    let mut model = autoencoder(Comm::single(), &reader(6, 4), 4, 1, &activations, &executor)?;
    model.setup()?;
    model.forward_prop(ExecutionMode::Training)?;
    model.backward_prop(ExecutionMode::Training)?;
    let before = model_state(&model)?;
    let mut callback = SaveImages::new(dir.path()).with_num_images(2);
    callback.on_phase_end(&model, ExecutionMode::Training, &Stats::default());
    assert!(dir.path().join("training-0000.pgm").exists());
    assert!(dir.path().join("training-0001.pgm").exists());
    assert!(!dir.path().join("training-0002.pgm").exists());
    assert_eq!(model_state(&model)?, before);
    assert_eq!(model.epoch(), 0);
    Ok(())
}

fn save_images_missing_dir() -> Result<(), Failed> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("missing");
    let mut model = autoencoder(
        Comm::single(),
        &reader(4, 4),
        2,
        1,
        &[Activation::Relu],
        &Executor::Cpu,
    )?;
    model.add_callback(SaveImages::new(&missing));
    let summary = model.train(2)?;
    assert_eq!(summary.epoch(), 2);
    assert!(!missing.exists());
    Ok(())
}

fn device_matches_host() -> Result<(), Failed> {
    let activations = [Activation::Sigmoid, Activation::LeakyRelu { alpha: 0.1 }, Activation::Tanh];
    let reader = reader(10, 3);
    let mut objectives = Vec::new();
    for executor in [Executor::Cpu, Executor::device(3)?] {
        let mut model = autoencoder(Comm::single(), &reader, 4, 1, &activations, &executor)?;
        let summary = model.train(1)?;
        objectives.push(summary.train().objective().unwrap());
    }
    approx::assert_relative_eq!(objectives[0], objectives[1], epsilon = 1e-6);
    Ok(())
}

fn device_buffers_released() -> Result<(), Failed> {
    let executor = Executor::device(2)?;
    let manager = executor.manager().unwrap().clone();
    {
        let activations = [Activation::Relu, Activation::Sigmoid];
        let mut model = autoencoder(Comm::single(), &reader(6, 2), 4, 1, &activations, &executor)?;
        model.train(2)?;
        let copy = model.copy();
        assert!(manager.stats().live_buffers > 0);
        drop(copy);
        assert!(manager.stats().live_buffers > 0);
    }
    let stats = manager.stats();
    assert_eq!(stats.live_buffers, 0);
    assert_eq!(stats.allocations, stats.frees);
    assert_eq!(stats.invalid_frees, 0);
    assert_eq!(stats.live_descriptors, 0);
    Ok(())
}
