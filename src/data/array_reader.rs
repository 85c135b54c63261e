use super::DataReader;
use crate::{
    error::{config_bail, Error, Result},
    matrix::DataType,
};
use ndarray::{Array2, ArrayViewMut2, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    fs,
    ops::Range,
    path::Path,
};

/// An in memory data reader.
///
/// Samples are the rows of `data`. Without explicit responses, the responses of a sample are its
/// features, ie the target of an autoencoder.
///
/// Shuffling is seeded, so readers constructed alike on every rank visit samples in the same
/// order.
#[derive(Clone, Debug)]
pub struct ArrayReader {
    data: Array2<DataType>,
    labels: Vec<usize>,
    num_labels: usize,
    responses: Option<Array2<DataType>>,
    indices: Vec<usize>,
    mini_batch_size: usize,
    position: usize,
    epoch: usize,
    rng: Option<StdRng>,
}

impl ArrayReader {
    /// A reader over the rows of `data`, with class `labels`.
    ///
    /// **Errors**
    /// - The number of labels differs from the number of samples.
    /// - A label is not less than `num_labels`.
    pub fn new(data: Array2<DataType>, labels: Vec<usize>, num_labels: usize) -> Result<Self> {
        if labels.len() != data.nrows() {
            config_bail!(
                "{} labels provided for {} samples",
                labels.len(),
                data.nrows()
            );
        }
        if let Some(label) = labels.iter().find(|x| **x >= num_labels) {
            config_bail!("label {label} is out of range for {num_labels} labels");
        }
        let indices = (0..data.nrows()).collect();
        Ok(Self {
            data,
            labels,
            num_labels,
            responses: None,
            indices,
            mini_batch_size: 1,
            position: 0,
            epoch: 0,
            rng: None,
        })
    }
    /// Adds regression responses, one row per sample.
    ///
    /// **Errors**
    /// - The number of rows differs from the number of samples.
    pub fn with_responses(self, responses: Array2<DataType>) -> Result<Self> {
        if responses.nrows() != self.data.nrows() {
            config_bail!(
                "{} responses provided for {} samples",
                responses.nrows(),
                self.data.nrows()
            );
        }
        Ok(Self {
            responses: Some(responses),
            ..self
        })
    }
    /// Sets the number of classes, ie when a data file does not contain every class.
    ///
    /// **Errors**
    /// - A label is not less than `num_labels`.
    pub fn with_num_labels(self, num_labels: usize) -> Result<Self> {
        if let Some(label) = self.labels.iter().find(|x| **x >= num_labels) {
            config_bail!("label {label} is out of range for {num_labels} labels");
        }
        Ok(Self { num_labels, ..self })
    }
    /// Shuffles samples at the start of every epoch.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.indices.shuffle(&mut rng);
        self.rng.replace(rng);
        self
    }
    /// Sets the minibatch size.
    pub fn with_mini_batch_size(mut self, mini_batch_size: usize) -> Self {
        self.set_mini_batch_size(mini_batch_size);
        self
    }
    /// Moves the last `percent` of the samples into a separate validation reader.
    ///
    /// **Errors**
    /// - `percent` is not in [0, 100).
    pub fn split_validation(mut self, percent: f64) -> Result<(Self, Self)> {
        if !(0. ..100.).contains(&percent) {
            config_bail!("validation percent {percent} is not in [0, 100)");
        }
        let num_validation = (self.indices.len() as f64 * percent / 100.).round() as usize;
        let split = self.indices.len() - num_validation;
        let mut validation = self.clone();
        validation.indices = self.indices.split_off(split);
        validation.reset();
        self.reset();
        Ok((self, validation))
    }
    /// Reads a numeric csv file, one sample per line.
    ///
    /// Column `label_column` holds the integer class label; the remaining columns are features.
    /// Empty lines and lines starting with '#' are skipped.
    ///
    /// **Errors**
    /// - The file could not be read.
    /// - A value is not a number or rows have different lengths.
    pub fn from_csv(path: impl AsRef<Path>, label_column: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut features = Vec::new();
        let mut labels = Vec::new();
        let mut width = None;
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let values: Vec<&str> = line.split(',').map(str::trim).collect();
            if *width.get_or_insert(values.len()) != values.len() {
                config_bail!(
                    "{path:?} line {}: expected {} values, found {}",
                    i + 1,
                    width.unwrap_or_default(),
                    values.len()
                );
            }
            if label_column >= values.len() {
                config_bail!(
                    "{path:?} line {}: label column {label_column} is out of range",
                    i + 1
                );
            }
            for (j, value) in values.iter().enumerate() {
                if j == label_column {
                    let label = value.parse::<usize>().map_err(|_| {
                        Error::config(format!(
                            "{path:?} line {}: label {value:?} is not a class index",
                            i + 1
                        ))
                    })?;
                    labels.push(label);
                } else {
                    let x = value.parse::<DataType>().map_err(|_| {
                        Error::config(format!(
                            "{path:?} line {}: {value:?} is not a number",
                            i + 1
                        ))
                    })?;
                    features.push(x);
                }
            }
        }
        let num_features = width.map_or(0, |w| w - 1);
        let data = Array2::from_shape_vec((labels.len(), num_features), features)
            .map_err(|e| Error::config(format!("{path:?}: {e}")))?;
        let num_labels = labels.iter().max().map_or(0, |x| x + 1);
        log::debug!(
            "read {} samples of {num_features} features from {path:?}",
            labels.len()
        );
        Self::new(data, labels, num_labels)
    }
    fn sample_indices(&self, samples: &Range<usize>) -> Result<&[usize]> {
        let len = self.current_mini_batch_size();
        if samples.start > samples.end || samples.end > len {
            config_bail!(
                "samples {samples:?} are out of range for a minibatch of {len} at position {}",
                self.position
            );
        }
        Ok(&self.indices[self.position + samples.start..self.position + samples.end])
    }
}

fn check_output(output: &ArrayViewMut2<DataType>, rows: usize, cols: usize) -> Result<()> {
    if output.nrows() != rows || output.ncols() < cols {
        config_bail!(
            "cannot fetch {cols} samples of size {rows} into a {:?} matrix",
            output.dim()
        );
    }
    Ok(())
}

impl DataReader for ArrayReader {
    fn num_samples(&self) -> usize {
        self.indices.len()
    }
    fn linearized_data_size(&self) -> usize {
        self.data.ncols()
    }
    fn num_labels(&self) -> usize {
        self.num_labels
    }
    fn linearized_response_size(&self) -> usize {
        self.responses
            .as_ref()
            .map_or(self.data.ncols(), Array2::ncols)
    }
    fn mini_batch_size(&self) -> usize {
        self.mini_batch_size
    }
    fn set_mini_batch_size(&mut self, mini_batch_size: usize) {
        self.mini_batch_size = mini_batch_size.max(1);
    }
    fn position(&self) -> usize {
        self.position
    }
    fn epoch(&self) -> usize {
        self.epoch
    }
    fn fetch_data(
        &self,
        samples: Range<usize>,
        mut output: ArrayViewMut2<DataType>,
    ) -> Result<usize> {
        let indices = self.sample_indices(&samples)?;
        check_output(&output, self.data.ncols(), indices.len())?;
        for (mut column, &index) in output.axis_iter_mut(Axis(1)).zip(indices) {
            column.assign(&self.data.row(index));
        }
        Ok(indices.len())
    }
    fn fetch_labels(
        &self,
        samples: Range<usize>,
        mut output: ArrayViewMut2<DataType>,
    ) -> Result<usize> {
        let indices = self.sample_indices(&samples)?;
        check_output(&output, self.num_labels, indices.len())?;
        for (mut column, &index) in output.axis_iter_mut(Axis(1)).zip(indices) {
            column.fill(0.);
            column[self.labels[index]] = 1.;
        }
        Ok(indices.len())
    }
    fn fetch_responses(
        &self,
        samples: Range<usize>,
        mut output: ArrayViewMut2<DataType>,
    ) -> Result<usize> {
        let indices = self.sample_indices(&samples)?;
        let responses = self.responses.as_ref().unwrap_or(&self.data);
        check_output(&output, responses.ncols(), indices.len())?;
        for (mut column, &index) in output.axis_iter_mut(Axis(1)).zip(indices) {
            column.assign(&responses.row(index));
        }
        Ok(indices.len())
    }
    fn update(&mut self) -> bool {
        self.position += self.mini_batch_size;
        if self.position < self.indices.len() {
            return true;
        }
        self.epoch += 1;
        self.reset();
        if let Some(rng) = self.rng.as_mut() {
            self.indices.shuffle(rng);
        }
        false
    }
    fn reset(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;

    fn reader() -> ArrayReader {
        let data = Array2::from_shape_fn((5, 2), |(i, j)| (i * 10 + j) as DataType);
        ArrayReader::new(data, vec![0, 1, 2, 1, 0], 3)
            .unwrap()
            .with_mini_batch_size(2)
    }

    #[test]
    fn epoch_walk() {
        let mut reader = reader();
        let mut sizes = vec![reader.current_mini_batch_size()];
        while reader.update() {
            sizes.push(reader.current_mini_batch_size());
        }
        assert_eq!(sizes, [2, 2, 1]);
        assert_eq!(reader.epoch(), 1);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn fetch_columns() {
        let mut reader = reader();
        reader.update();
        let mut data = Array2::zeros((2, 2));
        assert_eq!(reader.fetch_data(1..2, data.view_mut()).unwrap(), 1);
        assert_eq!(data, array![[30f32, 0.], [31., 0.]]);
        let mut labels = Array2::zeros((3, 2));
        reader.fetch_labels(0..2, labels.view_mut()).unwrap();
        assert_eq!(labels, array![[0f32, 0.], [0., 1.], [1., 0.]]);
    }

    #[test]
    fn fetch_out_of_minibatch() {
        let reader = reader();
        let mut data = Array2::zeros((2, 3));
        assert!(reader.fetch_data(0..3, data.view_mut()).is_err());
    }

    #[test]
    fn responses_default_to_data() {
        let reader = reader();
        let mut responses = Array2::zeros((2, 1));
        reader.fetch_responses(0..1, responses.view_mut()).unwrap();
        assert_eq!(responses, array![[0f32], [1.]]);
    }

    #[test]
    fn shuffle_is_deterministic() {
        let a = reader().with_shuffle(7);
        let b = reader().with_shuffle(7);
        assert_eq!(a.indices, b.indices);
    }

    #[test]
    fn split_validation() {
        let (train, validation) = reader().split_validation(40.).unwrap();
        assert_eq!(train.num_samples(), 3);
        assert_eq!(validation.num_samples(), 2);
        assert!(reader().split_validation(100.).is_err());
    }

    #[test]
    fn csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# x0, x1, label\n1.5, 2, 1\n\n-1, 0.25, 0").unwrap();
        let reader = ArrayReader::from_csv(file.path(), 2).unwrap();
        assert_eq!(reader.num_samples(), 2);
        assert_eq!(reader.linearized_data_size(), 2);
        assert_eq!(reader.num_labels(), 2);
        assert_eq!(reader.data, array![[1.5f32, 2.], [-1., 0.25]]);
    }

    #[test]
    fn csv_bad_value() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1, x, 0").unwrap();
        assert!(ArrayReader::from_csv(file.path(), 2).unwrap_err().is_config());
    }
}
