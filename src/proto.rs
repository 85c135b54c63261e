//! Prototext configuration.
//!
//! A run is described by a model file, optionally completed by reader, data set metadata and
//! optimizer files. Each is a text format protobuf document:
//!
//! ```text
//! model {
//!   mini_batch_size: 64
//!   layer { input {} }
//!   layer { relu {} }
//!   layer { target { shared_data_reader: true } }
//!   callback { print {} }
//! }
//! data_reader {
//!   reader { role: "train" data_filename: "train.csv" }
//! }
//! optimizer { sgd { learn_rate: 0.01 } }
//! ```
//!
//! [`load_prototext()`] reads and verifies one document per model, and
//! [`TrainingConfig::from_document()`] turns a document into a buildable configuration.

mod text_format;
pub use text_format::{Message, Value};

mod loader;
pub use loader::{
    load_prototext, parse_prototext_filenames_from_command_line, read_in_prototext_files,
    verify_prototext, PrototextArgs, PrototextFnTriple,
};

mod config;
pub use config::{
    CallbackConfig, LayerConfig, ModelConfig, OptimizerConfig, ReaderConfig, TrainingConfig,
};
