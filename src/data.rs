//! Data readers and minibatch distribution.
//!
//! A [`DataReader`] walks a data set one minibatch at a time. The
//! [`PartitionedIoBuffer`](io_buffer::PartitionedIoBuffer) splits each minibatch among the ranks
//! of a model and fetches each rank's shard.
use crate::{error::Result, matrix::DataType};
use derive_more::Display;
use ndarray::ArrayViewMut2;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, ops::Range, sync::Arc};

mod array_reader;
pub use array_reader::ArrayReader;

pub mod io_buffer;
pub use io_buffer::{FetchData, PartitionedIoBuffer, ReaderSharing, UpdateDataReader};

/// Selects the active data reader.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Training.
    #[display(fmt = "training")]
    Training,
    /// Validation.
    #[display(fmt = "validation")]
    Validation,
    /// Testing.
    #[display(fmt = "testing")]
    Testing,
}

impl ExecutionMode {
    /// All modes.
    pub const ALL: [Self; 3] = [Self::Training, Self::Validation, Self::Testing];
    /// Parses "train", "validate", "test" and their long forms.
    pub fn from_role(role: &str) -> Option<Self> {
        match role {
            "train" | "training" => Some(Self::Training),
            "validate" | "validation" => Some(Self::Validation),
            "test" | "testing" => Some(Self::Testing),
            _ => None,
        }
    }
}

/// A source of samples.
///
/// Samples are visited one minibatch at a time. Fetches address samples relative to the start of
/// the current minibatch, so every rank of a model, holding its own reader in lock step, can fetch
/// a different part of the same minibatch.
///
/// Fetched samples are written as columns of the output.
pub trait DataReader: Send + Sync + Debug {
    /// The number of samples in an epoch.
    fn num_samples(&self) -> usize;
    /// The number of features of a sample.
    fn linearized_data_size(&self) -> usize;
    /// The number of classes.
    fn num_labels(&self) -> usize;
    /// The size of a regression response.
    fn linearized_response_size(&self) -> usize;
    /// The configured minibatch size.
    fn mini_batch_size(&self) -> usize;
    /// Sets the minibatch size.
    fn set_mini_batch_size(&mut self, mini_batch_size: usize);
    /// The index of the first sample of the current minibatch.
    fn position(&self) -> usize;
    /// The number of completed epochs.
    fn epoch(&self) -> usize;
    /// The size of the current minibatch, which is short at the end of an epoch.
    fn current_mini_batch_size(&self) -> usize {
        self.mini_batch_size()
            .min(self.num_samples().saturating_sub(self.position()))
    }
    /// Whether the current minibatch is the last of the epoch.
    fn is_done(&self) -> bool {
        self.position() + self.current_mini_batch_size() >= self.num_samples()
    }
    /// Writes the features of `samples` of the current minibatch into the columns of `output`.
    ///
    /// Returns the number of samples written.
    ///
    /// **Errors**
    /// - `samples` extends past the current minibatch.
    /// - `output` has the wrong number of rows or too few columns.
    fn fetch_data(&self, samples: Range<usize>, output: ArrayViewMut2<DataType>) -> Result<usize>;
    /// Writes one hot labels of `samples`. See [`.fetch_data()`](Self::fetch_data).
    fn fetch_labels(&self, samples: Range<usize>, output: ArrayViewMut2<DataType>)
        -> Result<usize>;
    /// Writes regression responses of `samples`. See [`.fetch_data()`](Self::fetch_data).
    fn fetch_responses(
        &self,
        samples: Range<usize>,
        output: ArrayViewMut2<DataType>,
    ) -> Result<usize>;
    /// Advances to the next minibatch.
    ///
    /// Returns false when the epoch is complete, in which case the reader starts the next epoch.
    fn update(&mut self) -> bool;
    /// Restarts the current epoch.
    fn reset(&mut self);
}

/// A data reader shared between layers.
pub type ReaderHandle = Arc<RwLock<dyn DataReader>>;

/// Wraps `reader` in a [`ReaderHandle`].
pub fn reader_handle(reader: impl DataReader + 'static) -> ReaderHandle {
    Arc::new(RwLock::new(reader))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn execution_mode_serde() {
        assert_tokens(
            &ExecutionMode::Validation,
            &[Token::UnitVariant {
                name: "ExecutionMode",
                variant: "validation",
            }],
        );
    }

    #[test]
    fn execution_mode_roles() {
        assert_eq!(ExecutionMode::from_role("train"), Some(ExecutionMode::Training));
        assert_eq!(ExecutionMode::from_role("testing"), Some(ExecutionMode::Testing));
        assert_eq!(ExecutionMode::from_role("predict"), None);
        assert_eq!(ExecutionMode::Validation.to_string(), "validation");
    }
}
