use super::Callback;
use crate::{
    data::ExecutionMode,
    error::{Error, Result},
    layer::Layer,
    matrix::DataType,
    model::{Model, Stats},
};
use ndarray::ArrayView1;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Saves input and output samples as images at the end of a phase.
///
/// Each image is a binary PGM with the input on the left and the model output on the right,
/// written to `{image_dir}/{phase}-{index:04}.pgm` where `index` is the position of the sample in
/// the minibatch. Samples whose length is a perfect square are drawn square, others as a single
/// row. Values are clamped to [0, 1].
///
/// Only the model master writes, from the last minibatch of the phase. The directory is not
/// created. Write failures are logged.
#[derive(Clone, Debug)]
pub struct SaveImages {
    image_dir: PathBuf,
    num_images: usize,
    phase: ExecutionMode,
}

impl SaveImages {
    /// The default number of images.
    pub const DEFAULT_NUM_IMAGES: usize = 10;
    /// Saves [`DEFAULT_NUM_IMAGES`](Self::DEFAULT_NUM_IMAGES) images into `image_dir` at the end
    /// of every training phase.
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            num_images: Self::DEFAULT_NUM_IMAGES,
            phase: ExecutionMode::Training,
        }
    }
    /// Sets the number of images.
    pub fn with_num_images(self, num_images: usize) -> Self {
        Self { num_images, ..self }
    }
    /// Sets the phase after which images are saved.
    pub fn with_phase(self, phase: ExecutionMode) -> Self {
        Self { phase, ..self }
    }
    /// The output directory.
    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }
    /// The number of images.
    pub fn num_images(&self) -> usize {
        self.num_images
    }
    /// The phase after which images are saved.
    pub fn phase(&self) -> ExecutionMode {
        self.phase
    }
    /// Writes images of the last minibatch of `model`.
    ///
    /// Returns the number of images written, which is 0 if this rank is not the model master.
    ///
    /// **Errors**
    /// - The model has no input or output layer.
    /// - A file could not be written.
    pub fn save(&self, model: &Model, mode: ExecutionMode) -> Result<usize> {
        if !model.comm().is_model_master() {
            return Ok(0);
        }
        let input = model
            .input_layer()
            .ok_or_else(|| Error::config("save_images requires an input layer"))?
            .activations();
        let output = model
            .output_layer()
            .ok_or_else(|| Error::config("save_images requires an output layer"))?
            .activations();
        let num_images = self
            .num_images
            .min(input.local_width())
            .min(output.local_width());
        for (i, index) in input.columns().take(num_images).enumerate() {
            let path = self.image_dir.join(format!("{mode}-{index:04}.pgm"));
            let pgm = encode_pgm(input.local().column(i), output.local().column(i));
            fs::write(&path, pgm).map_err(|e| Error::io(&path, e))?;
        }
        Ok(num_images)
    }
}

impl Callback for SaveImages {
    fn name(&self) -> &str {
        "save_images"
    }
    fn on_phase_end(&mut self, model: &Model, mode: ExecutionMode, _stats: &Stats) {
        if mode != self.phase {
            return;
        }
        match self.save(model, mode) {
            Ok(0) => (),
            Ok(n) => log::debug!("saved {n} images to {:?}", self.image_dir),
            Err(e) => log::warn!("save_images: {e}"),
        }
    }
    fn copy(&self) -> Box<dyn Callback> {
        Box::new(self.clone())
    }
}

fn image_shape(len: usize) -> (usize, usize) {
    let side = (len as f64).sqrt().round() as usize;
    if side * side == len {
        (side, side)
    } else {
        (1, len)
    }
}

fn encode_pgm<'a>(input: ArrayView1<'a, DataType>, output: ArrayView1<'a, DataType>) -> Vec<u8> {
    let (input_rows, input_cols) = image_shape(input.len());
    let (output_rows, output_cols) = image_shape(output.len());
    let rows = input_rows.max(output_rows);
    let cols = input_cols + output_cols;
    let mut pgm = format!("P5\n{cols} {rows}\n255\n").into_bytes();
    pgm.reserve(rows * cols);
    let pixel = |x: Option<&DataType>| x.map_or(0, |x| (x.clamp(0., 1.) * 255.).round() as u8);
    for r in 0..rows {
        let images = [
            (&input, input_rows, input_cols),
            (&output, output_rows, output_cols),
        ];
        for (x, x_rows, x_cols) in images {
            for c in 0..x_cols {
                let value = if r < x_rows { x.get(r * x_cols + c) } else { None };
                pgm.push(pixel(value));
            }
        }
    }
    pgm
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn pgm_side_by_side() {
        let input = array![0f32, 1., 0.5, 2.];
        let output = array![1f32, 0., -1., 0.];
        let pgm = encode_pgm(input.view(), output.view());
        let header = b"P5\n4 2\n255\n";
        assert_eq!(&pgm[..header.len()], header);
        assert_eq!(&pgm[header.len()..], [0, 255, 255, 0, 128, 255, 0, 0]);
    }

    #[test]
    fn non_square_is_one_row() {
        assert_eq!(image_shape(784), (28, 28));
        assert_eq!(image_shape(6), (1, 6));
        let pgm = encode_pgm(Array1::zeros(3).view(), Array1::zeros(4).view());
        assert!(pgm.starts_with(b"P5\n5 2\n255\n"));
        assert_eq!(pgm.len(), b"P5\n5 2\n255\n".len() + 10);
    }

    #[test]
    fn defaults() {
        let callback = SaveImages::new("images");
        assert_eq!(callback.num_images(), 10);
        assert_eq!(callback.phase(), ExecutionMode::Training);
        assert_eq!(callback.name(), "save_images");
    }
}
