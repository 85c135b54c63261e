//! Objective functions.
use crate::{
    error::{Error, Result},
    matrix::DataType,
};
use ndarray::{ArrayView2, ArrayViewMut2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const EPSILON: DataType = 1e-7;

/// The objective minimized by training.
///
/// Matrices hold one sample per column.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Mean over neurons of the squared error, per sample.
    #[default]
    MeanSquaredError,
    /// Categorical cross entropy against one hot ground truth, per sample.
    CrossEntropy,
}

impl Objective {
    /// The sum over samples of the objective.
    pub fn value(
        &self,
        prediction: ArrayView2<DataType>,
        ground_truth: ArrayView2<DataType>,
    ) -> f64 {
        match self {
            Self::MeanSquaredError => {
                let height = prediction.nrows().max(1) as f64;
                let sum = Zip::from(&prediction)
                    .and(&ground_truth)
                    .fold(0f64, |acc, &p, &t| acc + f64::from(p - t).powi(2));
                sum / height
            }
            Self::CrossEntropy => Zip::from(&prediction)
                .and(&ground_truth)
                .fold(0f64, |acc, &p, &t| {
                    acc - f64::from(t) * f64::from(p.max(EPSILON)).ln()
                }),
        }
    }
    /// Writes the gradient of the mean over `mini_batch_size` samples into `gradient`.
    pub fn gradient(
        &self,
        prediction: ArrayView2<DataType>,
        ground_truth: ArrayView2<DataType>,
        mini_batch_size: usize,
        gradient: ArrayViewMut2<DataType>,
    ) {
        let scale = 1. / mini_batch_size.max(1) as DataType;
        match self {
            Self::MeanSquaredError => {
                let scale = 2. * scale / prediction.len_of(Axis(0)).max(1) as DataType;
                Zip::from(gradient)
                    .and(&prediction)
                    .and(&ground_truth)
                    .par_for_each(|dx, &p, &t| *dx = scale * (p - t));
            }
            Self::CrossEntropy => {
                Zip::from(gradient)
                    .and(&prediction)
                    .and(&ground_truth)
                    .par_for_each(|dx, &p, &t| *dx = -scale * t / p.max(EPSILON));
            }
        }
    }
}

impl FromStr for Objective {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean_squared_error" | "mse" => Ok(Self::MeanSquaredError),
            "cross_entropy" => Ok(Self::CrossEntropy),
            _ => Err(Error::config(format!("unknown objective function {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn mean_squared_error() {
        let p = array![[1., 0.], [3., 2.]];
        let t = array![[0., 0.], [1., 2.]];
        assert_relative_eq!(Objective::MeanSquaredError.value(p.view(), t.view()), 2.5);
        let mut dx = Array2::zeros((2, 2));
        Objective::MeanSquaredError.gradient(p.view(), t.view(), 2, dx.view_mut());
        assert_eq!(dx, array![[0.5f32, 0.], [1., 0.]]);
    }

    #[test]
    fn cross_entropy() {
        let p = array![[0.5], [0.5]];
        let t = array![[1.], [0.]];
        assert_relative_eq!(
            Objective::CrossEntropy.value(p.view(), t.view()),
            2f64.ln(),
            epsilon = 1e-6
        );
        let mut dx = Array2::zeros((2, 1));
        Objective::CrossEntropy.gradient(p.view(), t.view(), 1, dx.view_mut());
        assert_eq!(dx, array![[-2f32], [0.]]);
    }

    #[test]
    fn from_str() {
        assert_eq!("cross_entropy".parse::<Objective>().unwrap(), Objective::CrossEntropy);
        assert!("hinge".parse::<Objective>().is_err());
    }
}
