//! Distributed matrices.
//!
//! Matrices are stored data parallel: rows are neurons and columns are samples of the minibatch.
//! Each participating rank owns a contiguous block of columns, computed by [`partition()`]. The
//! same partition is used by the I/O buffer, so the samples a rank fetches are exactly the
//! columns it owns.
use crate::error::{config_bail, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The scalar type of activations and error signals.
pub type DataType = f32;

/// Splits `len` items into `degree` contiguous, disjoint ranges.
///
/// The first `len % degree` ranges have one extra item, so sizes differ by at most one and no
/// range is empty unless `len < degree`.
///
/// **Panics**
/// - `degree` is 0.
pub fn partition(len: usize, degree: usize) -> Vec<Range<usize>> {
    assert!(degree > 0, "partition degree must be positive");
    let base = len / degree;
    let rem = len % degree;
    let mut start = 0;
    (0..degree)
        .map(|i| {
            let size = base + usize::from(i < rem);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}

/// How columns are split among ranks.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Distribution {
    degree: usize,
    rank: usize,
}

impl Distribution {
    /// A distribution of `degree` participating ranks, viewed from `rank`.
    ///
    /// Ranks not less than `degree` do not participate and own no columns.
    ///
    /// **Errors**
    /// - `degree` is 0.
    pub fn new(degree: usize, rank: usize) -> Result<Self> {
        if degree == 0 {
            config_bail!("distribution degree must be positive");
        }
        Ok(Self { degree, rank })
    }
    /// Every column on one rank.
    pub fn local() -> Self {
        Self { degree: 1, rank: 0 }
    }
    /// The number of participating ranks.
    pub fn degree(&self) -> usize {
        self.degree
    }
    /// The rank within the model.
    pub fn rank(&self) -> usize {
        self.rank
    }
    /// Whether the rank owns columns.
    pub fn participates(&self) -> bool {
        self.rank < self.degree
    }
    /// The global columns owned by the rank, for a matrix of `width` columns.
    pub fn columns(&self, width: usize) -> Range<usize> {
        if self.participates() {
            partition(width, self.degree)[self.rank].clone()
        } else {
            0..0
        }
    }
}

/// A data parallel distributed matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistMat {
    height: usize,
    width: usize,
    distribution: Distribution,
    columns: Range<usize>,
    local: Array2<DataType>,
}

impl DistMat {
    /// A zeroed matrix of `height` x `width`.
    pub fn zeros(height: usize, width: usize, distribution: Distribution) -> Self {
        let columns = distribution.columns(width);
        let local = Array2::zeros((height, columns.len()));
        Self {
            height,
            width,
            distribution,
            columns,
            local,
        }
    }
    /// The global number of rows.
    pub fn height(&self) -> usize {
        self.height
    }
    /// The global number of columns.
    pub fn width(&self) -> usize {
        self.width
    }
    /// The number of columns owned by this rank.
    pub fn local_width(&self) -> usize {
        self.columns.len()
    }
    /// The global columns owned by this rank.
    pub fn columns(&self) -> Range<usize> {
        self.columns.clone()
    }
    /// The distribution.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }
    /// The local shard.
    pub fn local(&self) -> ArrayView2<'_, DataType> {
        self.local.view()
    }
    /// The local shard, mutably.
    pub fn local_mut(&mut self) -> ArrayViewMut2<'_, DataType> {
        self.local.view_mut()
    }
    /// Changes the global width, ie for the short final minibatch of an epoch.
    ///
    /// The local shard is reallocated (and zeroed) only if its width changes.
    pub fn resize_width(&mut self, width: usize) {
        if width == self.width {
            return;
        }
        let columns = self.distribution.columns(width);
        if columns.len() != self.local.ncols() {
            self.local = Array2::zeros((self.height, columns.len()));
        }
        self.width = width;
        self.columns = columns;
    }
    /// Whether `other` has the same global shape and distribution.
    pub fn is_aligned_with(&self, other: &Self) -> bool {
        self.height == other.height
            && self.width == other.width
            && self.distribution == other.distribution
    }
}
