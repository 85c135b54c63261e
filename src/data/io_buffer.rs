//! Partitioned minibatch I/O.
//!
//! Every rank of a model holds a [`PartitionedIoBuffer`]. Of the `procs_per_model` ranks, the
//! first `num_parallel_readers` take part: each fetches a disjoint, contiguous shard of the
//! current minibatch. The remaining ranks fetch nothing.
use super::{DataReader, ExecutionMode, ReaderHandle};
use crate::{
    comm::Comm,
    error::{config_bail, Error, Result},
    matrix::{DataType, DistMat, Distribution},
};
use ndarray::ArrayViewMut2;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::{self, Debug}, ops::Range, sync::Arc};

/// Whether the input and target layers share reader instances.
///
/// With [`Shared`](Self::Shared), the input layer advances the reader and the target layer only
/// observes it. With [`PerLayer`](Self::PerLayer), each layer advances its own reader, so the
/// readers must be distinct instances.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderSharing {
    /// One reader per mode for both layers.
    Shared,
    /// Separate readers for the input and target layers.
    PerLayer,
}

/// Fetch strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FetchData {
    input_not_target: bool,
    regression: bool,
}

impl FetchData {
    /// Fetches samples for an input layer, or ground truth for a target layer.
    ///
    /// Ground truth is one hot labels, or responses if `regression`.
    pub fn new(input_not_target: bool, regression: bool) -> Self {
        Self {
            input_not_target,
            regression,
        }
    }
    /// Whether samples are fetched for an input layer.
    pub fn is_input(&self) -> bool {
        self.input_not_target
    }
    /// Whether ground truth is a regression response.
    pub fn is_regression(&self) -> bool {
        self.regression
    }
    /// The number of rows fetched per sample.
    pub fn linearized_size(&self, reader: &dyn DataReader) -> usize {
        if self.input_not_target {
            reader.linearized_data_size()
        } else if self.regression {
            reader.linearized_response_size()
        } else {
            reader.num_labels()
        }
    }
    /// Fetches `samples` of the current minibatch of `reader` into `output`.
    ///
    /// Returns the number of samples fetched.
    pub fn fetch(
        &self,
        reader: &dyn DataReader,
        samples: Range<usize>,
        output: ArrayViewMut2<DataType>,
    ) -> Result<usize> {
        if self.input_not_target {
            reader.fetch_data(samples, output)
        } else if self.regression {
            reader.fetch_responses(samples, output)
        } else {
            reader.fetch_labels(samples, output)
        }
    }
}

/// Update strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UpdateDataReader {
    input_not_target: bool,
}

impl UpdateDataReader {
    /// Updates on behalf of an input or target layer.
    pub fn new(input_not_target: bool) -> Self {
        Self { input_not_target }
    }
    /// Advances `reader` past the current minibatch.
    ///
    /// Returns false once the epoch is complete. A target layer sharing the input layer's reader
    /// does not move it; the epoch is complete when the input layer has wrapped it around.
    pub fn update(&self, reader: &mut dyn DataReader, sharing: ReaderSharing) -> bool {
        match (self.input_not_target, sharing) {
            (false, ReaderSharing::Shared) => reader.position() != 0,
            _ => reader.update(),
        }
    }
}

/// Splits minibatches among the ranks of a model.
#[derive(Clone)]
pub struct PartitionedIoBuffer {
    comm: Comm,
    num_parallel_readers: usize,
    distribution: Distribution,
    readers: BTreeMap<ExecutionMode, ReaderHandle>,
    sharing: ReaderSharing,
    fetch_data_fn: FetchData,
    update_data_reader_fn: UpdateDataReader,
}

impl PartitionedIoBuffer {
    /// Creates an I/O buffer.
    ///
    /// The number of parallel readers is `min(requested_readers, procs_per_model)`; requesting
    /// more readers than processes is not an error.
    ///
    /// **Errors**
    /// - `requested_readers` is 0.
    /// - `readers` is empty.
    pub fn new(
        comm: Comm,
        requested_readers: usize,
        readers: BTreeMap<ExecutionMode, ReaderHandle>,
        sharing: ReaderSharing,
        fetch_data_fn: FetchData,
        update_data_reader_fn: UpdateDataReader,
    ) -> Result<Self> {
        if requested_readers == 0 {
            config_bail!("num_parallel_readers must be positive");
        }
        if readers.is_empty() {
            config_bail!("at least one data reader is required");
        }
        let num_parallel_readers = requested_readers.min(comm.procs_per_model());
        if num_parallel_readers < requested_readers {
            log::debug!(
                "requested {requested_readers} parallel readers, \
                 using {num_parallel_readers} (procs_per_model)"
            );
        }
        let distribution = Distribution::new(num_parallel_readers, comm.rank_in_model())?;
        Ok(Self {
            comm,
            num_parallel_readers,
            distribution,
            readers,
            sharing,
            fetch_data_fn,
            update_data_reader_fn,
        })
    }
    /// The number of ranks that fetch data.
    pub fn num_parallel_readers(&self) -> usize {
        self.num_parallel_readers
    }
    /// The reader sharing policy.
    pub fn sharing(&self) -> ReaderSharing {
        self.sharing
    }
    /// The communicator.
    pub fn comm(&self) -> &Comm {
        &self.comm
    }
    /// The fetch strategy.
    pub fn fetch_data_fn(&self) -> FetchData {
        self.fetch_data_fn
    }
    /// The update strategy.
    pub fn update_data_reader_fn(&self) -> UpdateDataReader {
        self.update_data_reader_fn
    }
    /// The distribution of fetched columns.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }
    /// The modes with a reader.
    pub fn modes(&self) -> impl Iterator<Item = ExecutionMode> + '_ {
        self.readers.keys().copied()
    }
    /// Whether there is a reader for `mode`.
    pub fn has_reader(&self, mode: ExecutionMode) -> bool {
        self.readers.contains_key(&mode)
    }
    /// The reader for `mode`.
    ///
    /// **Errors**
    /// - There is no reader for `mode`.
    pub fn reader(&self, mode: ExecutionMode) -> Result<&ReaderHandle> {
        self.readers
            .get(&mode)
            .ok_or_else(|| Error::config(format!("no data reader for {mode}")))
    }
    /// The readers.
    pub fn readers(&self) -> &BTreeMap<ExecutionMode, ReaderHandle> {
        &self.readers
    }
    /// Whether this buffer has readers for the same modes as `other`, each the same instance.
    pub fn shares_readers_with(&self, other: &Self) -> bool {
        self.readers.len() == other.readers.len()
            && self.readers.iter().all(|(mode, reader)| {
                other
                    .readers
                    .get(mode)
                    .map_or(false, |x| Arc::ptr_eq(x, reader))
            })
    }
    /// Whether any reader of this buffer is also a reader of `other`, in any mode.
    pub fn shares_any_reader_with(&self, other: &Self) -> bool {
        self.readers
            .values()
            .any(|reader| other.readers.values().any(|x| Arc::ptr_eq(x, reader)))
    }
    /// The number of rows fetched per sample for `mode`.
    ///
    /// **Errors**
    /// - There is no reader for `mode`.
    pub fn linearized_size(&self, mode: ExecutionMode) -> Result<usize> {
        let reader = self.reader(mode)?.read();
        Ok(self.fetch_data_fn.linearized_size(&*reader))
    }
    /// The samples of the current minibatch of `mode` assigned to this rank.
    ///
    /// Empty for ranks that do not fetch.
    ///
    /// **Errors**
    /// - There is no reader for `mode`.
    pub fn partition(&self, mode: ExecutionMode) -> Result<Range<usize>> {
        let width = self.reader(mode)?.read().current_mini_batch_size();
        Ok(self.distribution().columns(width))
    }
    /// Fetches this rank's shard of the current minibatch of `mode` into `output`.
    ///
    /// `output` is resized to the width of the current minibatch. Returns the number of samples
    /// fetched, which is 0 on ranks that do not fetch.
    ///
    /// **Errors**
    /// - There is no reader for `mode`.
    /// - `output` is not distributed like this buffer, or has the wrong height.
    /// - See [`FetchData::fetch()`].
    pub fn fetch_to_local_matrix(
        &self,
        mode: ExecutionMode,
        output: &mut DistMat,
    ) -> Result<usize> {
        if output.distribution() != self.distribution() {
            config_bail!(
                "output distribution {:?} does not match {:?}",
                output.distribution(),
                self.distribution()
            );
        }
        let reader = self.reader(mode)?.read();
        let width = reader.current_mini_batch_size();
        output.resize_width(width);
        let samples = output.columns();
        if samples.is_empty() {
            return Ok(0);
        }
        let fetched = self
            .fetch_data_fn
            .fetch(&*reader, samples.clone(), output.local_mut())?;
        debug_assert_eq!(fetched, samples.len());
        Ok(fetched)
    }
    /// Advances the reader of `mode`.
    ///
    /// Returns false once the epoch is complete.
    ///
    /// **Errors**
    /// - There is no reader for `mode`.
    pub fn update_data_reader(&self, mode: ExecutionMode) -> Result<bool> {
        let mut reader = self.reader(mode)?.write();
        Ok(self.update_data_reader_fn.update(&mut *reader, self.sharing))
    }
    /// The number of samples in an epoch of `mode`.
    pub fn num_samples(&self, mode: ExecutionMode) -> Result<usize> {
        Ok(self.reader(mode)?.read().num_samples())
    }
}

impl Debug for PartitionedIoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PartitionedIoBuffer")
            .field("comm", &self.comm)
            .field("num_parallel_readers", &self.num_parallel_readers)
            .field("modes", &self.readers.keys().collect::<Vec<_>>())
            .field("sharing", &self.sharing)
            .field("fetch_data_fn", &self.fetch_data_fn)
            .field("update_data_reader_fn", &self.update_data_reader_fn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{reader_handle, ArrayReader};
    use ndarray::Array2;

    fn readers(
        num_samples: usize,
        mini_batch_size: usize,
    ) -> BTreeMap<ExecutionMode, ReaderHandle> {
        let data = Array2::from_shape_fn((num_samples, 1), |(i, _)| i as DataType);
        let reader = ArrayReader::new(data, vec![0; num_samples], 1)
            .unwrap()
            .with_mini_batch_size(mini_batch_size);
        [(ExecutionMode::Training, reader_handle(reader))]
            .into_iter()
            .collect()
    }

    fn input_buffer(
        comm: Comm,
        requested: usize,
        readers: BTreeMap<ExecutionMode, ReaderHandle>,
    ) -> PartitionedIoBuffer {
        PartitionedIoBuffer::new(
            comm,
            requested,
            readers,
            ReaderSharing::Shared,
            FetchData::new(true, false),
            UpdateDataReader::new(true),
        )
        .unwrap()
    }

    #[test]
    fn clamp_not_error() {
        let comm = Comm::new(0, 4, 4).unwrap();
        let buffer = input_buffer(comm, 16, readers(10, 4));
        assert_eq!(buffer.num_parallel_readers(), 4);
        let buffer = input_buffer(comm, 2, readers(10, 4));
        assert_eq!(buffer.num_parallel_readers(), 2);
    }

    #[test]
    fn zero_readers_is_error() {
        let result = PartitionedIoBuffer::new(
            Comm::single(),
            0,
            readers(4, 2),
            ReaderSharing::Shared,
            FetchData::new(true, false),
            UpdateDataReader::new(true),
        );
        assert!(result.unwrap_err().is_config());
    }

    #[test]
    fn ranks_fetch_disjoint_shards() {
        let procs = 3;
        let readers = readers(10, 7);
        let mut fetched = Vec::new();
        for comm in Comm::model_ranks(procs).unwrap() {
            let buffer = input_buffer(comm, procs, readers.clone());
            let mut output = DistMat::zeros(1, 7, buffer.distribution());
            let n = buffer.fetch_to_local_matrix(ExecutionMode::Training, &mut output).unwrap();
            assert_eq!(n, output.local_width());
            fetched.extend(output.local().iter().copied());
        }
        assert_eq!(fetched, (0..7).map(|x| x as DataType).collect::<Vec<_>>());
    }

    #[test]
    fn inactive_rank_fetches_nothing() {
        let comm = Comm::new(2, 3, 3).unwrap();
        let buffer = input_buffer(comm, 2, readers(10, 4));
        let mut output = DistMat::zeros(1, 4, buffer.distribution());
        assert_eq!(buffer.fetch_to_local_matrix(ExecutionMode::Training, &mut output).unwrap(), 0);
        assert!(buffer.partition(ExecutionMode::Training).unwrap().is_empty());
    }

    #[test]
    fn final_short_minibatch() {
        let comm = Comm::new(1, 2, 2).unwrap();
        let buffer = input_buffer(comm, 2, readers(10, 4));
        let mut output = DistMat::zeros(1, 4, buffer.distribution());
        assert!(buffer.update_data_reader(ExecutionMode::Training).unwrap());
        assert!(buffer.update_data_reader(ExecutionMode::Training).unwrap());
        assert_eq!(buffer.fetch_to_local_matrix(ExecutionMode::Training, &mut output).unwrap(), 1);
        assert_eq!(output.width(), 2);
        assert_eq!(output.local()[[0, 0]], 9.);
        assert!(!buffer.update_data_reader(ExecutionMode::Training).unwrap());
    }

    #[test]
    fn shared_target_does_not_advance() {
        let readers = readers(4, 2);
        let input = input_buffer(Comm::single(), 1, readers.clone());
        let target = PartitionedIoBuffer::new(
            Comm::single(),
            1,
            readers,
            ReaderSharing::Shared,
            FetchData::new(false, false),
            UpdateDataReader::new(false),
        )
        .unwrap();
        assert!(target.shares_readers_with(&input));
        assert!(input.update_data_reader(ExecutionMode::Training).unwrap());
        assert!(target.update_data_reader(ExecutionMode::Training).unwrap());
        assert_eq!(target.reader(ExecutionMode::Training).unwrap().read().position(), 2);
        assert!(!input.update_data_reader(ExecutionMode::Training).unwrap());
        assert!(!target.update_data_reader(ExecutionMode::Training).unwrap());
    }

    #[test]
    fn partly_shared_readers() {
        let mut input_readers = readers(4, 2);
        let mut target_readers = input_readers.clone();
        input_readers.extend(readers(4, 2).into_iter().map(|(_, x)| (ExecutionMode::Testing, x)));
        target_readers.extend(readers(4, 2).into_iter().map(|(_, x)| (ExecutionMode::Testing, x)));
        let input = input_buffer(Comm::single(), 1, input_readers.clone());
        let target = input_buffer(Comm::single(), 1, target_readers);
        assert!(!target.shares_readers_with(&input));
        assert!(target.shares_any_reader_with(&input));
        input_readers.remove(&ExecutionMode::Testing);
        let input = input_buffer(Comm::single(), 1, input_readers);
        assert!(!target.shares_readers_with(&input));
        assert!(!input.shares_readers_with(&target));
    }

    #[test]
    fn missing_mode() {
        let buffer = input_buffer(Comm::single(), 1, readers(4, 2));
        assert!(buffer.reader(ExecutionMode::Testing).is_err());
    }
}
