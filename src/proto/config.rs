//! Typed configuration read from a verified document.
use super::{Message, Value};
use crate::{
    callback::{PrintStatistics, SaveImages},
    comm::Comm,
    data::{reader_handle, ArrayReader, ExecutionMode, ReaderHandle, ReaderSharing},
    device::Executor,
    error::{config_bail, Error, Result},
    layer::{Activation, ActivationLayer, InputLayer, TargetLayer},
    matrix::DataType,
    model::Model,
    objective::Objective,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

fn required<T>(value: Option<T>, section: &str, name: &str) -> Result<T> {
    value.ok_or_else(|| Error::config(format!("{section}: missing {name}")))
}

// A message with exactly one field naming its kind, ie `layer { relu {} }`.
fn kind<'a>(message: &'a Message, section: &str) -> Result<(&'a str, &'a Message)> {
    match message.fields() {
        [(name, Value::Message(body))] => Ok((name.as_str(), body)),
        [(name, _)] => Err(Error::config(format!("{section}: {name:?} must be a message"))),
        fields => Err(Error::config(format!(
            "{section}: expected exactly one kind, found {}",
            fields.len()
        ))),
    }
}

/// A layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerConfig {
    /// `input {}`
    Input,
    /// `relu {}`
    Relu,
    /// `leaky_relu { alpha }`, alpha defaults to 0.01.
    LeakyRelu {
        /// The slope for negative inputs.
        alpha: DataType,
    },
    /// `sigmoid {}`
    Sigmoid,
    /// `tanh {}`
    Tanh,
    /// `softplus {}`
    Softplus,
    /// `identity {}`
    Identity,
    /// `target { shared_data_reader, for_regression }`.
    ///
    /// `shared_data_reader` has no default. `for_regression` defaults to false.
    Target {
        /// Whether the target layer observes the input layer's readers.
        shared_data_reader: bool,
        /// Whether the ground truth is a regression response.
        for_regression: bool,
    },
}

impl LayerConfig {
    fn from_message(message: &Message) -> Result<Self> {
        let (name, body) = kind(message, "layer")?;
        let config = match name {
            "input" => Self::Input,
            "relu" => Self::Relu,
            "leaky_relu" => Self::LeakyRelu {
                alpha: body.get_f64("alpha")?.unwrap_or(0.01) as DataType,
            },
            "sigmoid" => Self::Sigmoid,
            "tanh" => Self::Tanh,
            "softplus" => Self::Softplus,
            "identity" => Self::Identity,
            "target" => Self::Target {
                shared_data_reader: required(
                    body.get_bool("shared_data_reader")?,
                    "target",
                    "shared_data_reader",
                )?,
                for_regression: body.get_bool("for_regression")?.unwrap_or(false),
            },
            name => config_bail!("unknown layer {name:?}"),
        };
        Ok(config)
    }
    /// The activation of an activation layer.
    pub fn activation(&self) -> Option<Activation> {
        match *self {
            Self::Relu => Some(Activation::Relu),
            Self::LeakyRelu { alpha } => Some(Activation::LeakyRelu { alpha }),
            Self::Sigmoid => Some(Activation::Sigmoid),
            Self::Tanh => Some(Activation::Tanh),
            Self::Softplus => Some(Activation::Softplus),
            Self::Identity => Some(Activation::Identity),
            Self::Input | Self::Target { .. } => None,
        }
    }
}

/// A callback.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackConfig {
    /// `save_images { image_dir, num_images, phase }`
    SaveImages {
        /// The output directory.
        image_dir: PathBuf,
        /// The number of images.
        num_images: usize,
        /// The phase after which images are saved.
        phase: ExecutionMode,
    },
    /// `print {}`
    Print,
}

impl CallbackConfig {
    fn from_message(message: &Message) -> Result<Self> {
        let (name, body) = kind(message, "callback")?;
        let config = match name {
            "save_images" => {
                let phase = match body.get_str("phase")? {
                    Some(role) => ExecutionMode::from_role(role).ok_or_else(|| {
                        Error::config(format!("save_images: unknown phase {role:?}"))
                    })?,
                    None => ExecutionMode::Training,
                };
                let image_dir = required(body.get_str("image_dir")?, "save_images", "image_dir")?;
                Self::SaveImages {
                    image_dir: image_dir.into(),
                    num_images: body
                        .get_usize("num_images")?
                        .unwrap_or(SaveImages::DEFAULT_NUM_IMAGES),
                    phase,
                }
            }
            "print" => Self::Print,
            name => config_bail!("unknown callback {name:?}"),
        };
        Ok(config)
    }
}

/// The `model` section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// The global minibatch size.
    pub mini_batch_size: usize,
    /// Defaults to 1.
    pub num_epochs: usize,
    /// Defaults to the number of processes per model.
    pub num_parallel_readers: Option<usize>,
    /// Defaults to mean squared error.
    pub objective_function: Objective,
    /// Whether activation layers compute on devices.
    pub use_device: bool,
    /// Devices per process, defaults to 1.
    pub num_gpus: usize,
    /// The layers, in order.
    pub layers: Vec<LayerConfig>,
    /// The callbacks.
    pub callbacks: Vec<CallbackConfig>,
}

impl ModelConfig {
    fn from_message(model: &Message) -> Result<Self> {
        let objective_function = match model.get_str("objective_function")? {
            Some(name) => name.parse()?,
            None => Objective::default(),
        };
        let mini_batch_size = model.get_usize("mini_batch_size")?;
        Ok(Self {
            mini_batch_size: required(mini_batch_size, "model", "mini_batch_size")?,
            num_epochs: model.get_usize("num_epochs")?.unwrap_or(1),
            num_parallel_readers: model.get_usize("num_parallel_readers")?,
            objective_function,
            use_device: model.get_bool("use_device")?.unwrap_or(false),
            num_gpus: model.get_usize("num_gpus")?.unwrap_or(1),
            layers: model
                .messages("layer")
                .map(LayerConfig::from_message)
                .collect::<Result<_>>()?,
            callbacks: model
                .messages("callback")
                .map(CallbackConfig::from_message)
                .collect::<Result<_>>()?,
        })
    }
}

/// A `data_reader { reader { .. } }` entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// "train", "validate" or "test".
    pub role: ExecutionMode,
    /// The reader type. Only "csv" is supported.
    pub name: String,
    /// The data file.
    pub data_filename: PathBuf,
    /// The column holding the class label.
    pub label_column: usize,
    /// The number of classes, defaults to one more than the largest label.
    pub num_labels: Option<usize>,
    /// Whether samples are shuffled every epoch.
    pub shuffle: bool,
    /// The shuffle seed, shared by every process.
    pub seed: u64,
    /// Percent of a training set held out for validation.
    pub validation_percent: f64,
}

impl ReaderConfig {
    fn from_message(reader: &Message) -> Result<Self> {
        let role = required(reader.get_str("role")?, "reader", "role")?;
        let role = ExecutionMode::from_role(role)
            .ok_or_else(|| Error::config(format!("reader: unknown role {role:?}")))?;
        Ok(Self {
            role,
            name: reader.get_str("name")?.unwrap_or("csv").to_string(),
            data_filename: required(reader.get_str("data_filename")?, "reader", "data_filename")?
                .into(),
            label_column: reader.get_usize("label_column")?.unwrap_or(0),
            num_labels: reader.get_usize("num_labels")?,
            shuffle: reader.get_bool("shuffle")?.unwrap_or(false),
            seed: reader.get_usize("seed")?.unwrap_or(0) as u64,
            validation_percent: reader.get_f64("validation_percent")?.unwrap_or(0.),
        })
    }
    fn build(&self) -> Result<ArrayReader> {
        if self.name != "csv" {
            config_bail!("unknown data reader {:?}", self.name);
        }
        let mut reader = ArrayReader::from_csv(&self.data_filename, self.label_column)?;
        if let Some(num_labels) = self.num_labels {
            reader = reader.with_num_labels(num_labels)?;
        }
        if self.shuffle {
            reader = reader.with_shuffle(self.seed);
        }
        Ok(reader)
    }
}

/// The `optimizer` section.
///
/// Models have no weights, so the optimizer is recorded but not applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// The optimizer, ie "sgd".
    pub name: String,
    /// The learning rate.
    pub learn_rate: Option<f64>,
}

/// A verified document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// The model.
    pub model: ModelConfig,
    /// The data readers.
    pub readers: Vec<ReaderConfig>,
    /// The optimizer.
    pub optimizer: OptimizerConfig,
}

impl TrainingConfig {
    /// Reads the `model`, `data_reader` and `optimizer` sections of `doc`.
    ///
    /// **Errors**
    /// - A section or a required field is missing.
    /// - A field has the wrong type, or names an unknown layer, callback, role or objective.
    pub fn from_document(doc: &Message) -> Result<Self> {
        let model = doc
            .message("model")
            .ok_or_else(|| Error::config("missing model"))?;
        let readers = doc
            .messages("data_reader")
            .flat_map(|data_reader| data_reader.messages("reader"))
            .map(ReaderConfig::from_message)
            .collect::<Result<_>>()?;
        let optimizer = doc
            .message("optimizer")
            .ok_or_else(|| Error::config("missing optimizer"))?;
        let optimizer = match optimizer.fields() {
            [] => OptimizerConfig {
                name: "none".to_string(),
                learn_rate: None,
            },
            _ => {
                let (name, body) = kind(optimizer, "optimizer")?;
                OptimizerConfig {
                    name: name.to_string(),
                    learn_rate: body.get_f64("learn_rate")?,
                }
            }
        };
        Ok(Self {
            model: ModelConfig::from_message(model)?,
            readers,
            optimizer,
        })
    }
    fn build_readers(&self) -> Result<BTreeMap<ExecutionMode, ArrayReader>> {
        let mut readers = BTreeMap::new();
        let mut insert = |mode: ExecutionMode, reader: ArrayReader| {
            if readers.insert(mode, reader).is_some() {
                config_bail!("more than one {mode} reader");
            }
            Ok(())
        };
        for config in self.readers.iter() {
            let reader = config.build()?;
            if config.validation_percent > 0. {
                if config.role != ExecutionMode::Training {
                    config_bail!(
                        "validation_percent requires a training reader, not {}",
                        config.role
                    );
                }
                let (train, validation) = reader.split_validation(config.validation_percent)?;
                insert(ExecutionMode::Training, train)?;
                insert(ExecutionMode::Validation, validation)?;
            } else {
                insert(config.role, reader)?;
            }
        }
        Ok(readers)
    }
    /// Builds the model for the process `comm`.
    ///
    /// Every process builds the same model and reads the same files; the I/O buffers select each
    /// process's samples.
    ///
    /// **Errors**
    /// - A reader could not be built.
    /// - A target layer precedes the input layer.
    /// - See [`Executor::device()`], [`InputLayer::new()`] and [`TargetLayer::new()`].
    pub fn build_model(&self, comm: Comm) -> Result<Model> {
        let config = &self.model;
        let readers = self.build_readers()?;
        let handles = || -> BTreeMap<ExecutionMode, ReaderHandle> {
            readers
                .iter()
                .map(|(mode, reader)| (*mode, reader_handle(reader.clone())))
                .collect()
        };
        let input_handles = handles();
        let sharing = match config.layers.iter().find_map(|layer| match layer {
            LayerConfig::Target {
                shared_data_reader, ..
            } => Some(*shared_data_reader),
            _ => None,
        }) {
            Some(false) => ReaderSharing::PerLayer,
            _ => ReaderSharing::Shared,
        };
        let executor = if config.use_device {
            Executor::device(config.num_gpus)?
        } else {
            Executor::Cpu
        };
        let num_parallel_readers = config
            .num_parallel_readers
            .unwrap_or(comm.procs_per_model());
        let mut model = Model::new(comm, config.mini_batch_size)?;
        let mut input = None;
        for layer in config.layers.iter() {
            match layer {
                LayerConfig::Input => {
                    let layer = InputLayer::new(
                        comm,
                        num_parallel_readers,
                        input_handles.clone(),
                        sharing,
                    )?;
                    input.replace(model.add(layer));
                }
                LayerConfig::Target {
                    shared_data_reader,
                    for_regression,
                } => {
                    let input = input.ok_or_else(|| {
                        let id = model.next_id();
                        Error::config(format!("{id}: target layer precedes the input layer"))
                    })?;
                    let readers = if *shared_data_reader {
                        input_handles.clone()
                    } else {
                        handles()
                    };
                    let layer = TargetLayer::new(
                        comm,
                        input,
                        num_parallel_readers,
                        readers,
                        sharing,
                        *for_regression,
                    )?
                    .with_objective(config.objective_function);
                    model.add(layer);
                }
                layer => {
                    if let Some(activation) = layer.activation() {
                        model.add(ActivationLayer::new(activation, executor.clone()));
                    }
                }
            }
        }
        for callback in config.callbacks.iter() {
            match callback {
                CallbackConfig::SaveImages {
                    image_dir,
                    num_images,
                    phase,
                } => model.add_callback(
                    SaveImages::new(image_dir)
                        .with_num_images(*num_images)
                        .with_phase(*phase),
                ),
                CallbackConfig::Print => model.add_callback(PrintStatistics),
            }
        }
        Ok(model)
    }
}
