//! Training callbacks.
//!
//! A [`Callback`] observes a [`Model`] at fixed points of [`Model::train()`]. Callbacks receive the
//! model by shared reference and cannot modify it. Their failures are logged and never abort
//! training.
use crate::{
    data::ExecutionMode,
    model::{Model, Stats, Summary},
};
use std::fmt::Debug;

mod print;
pub use print::PrintStatistics;

mod save_images;
pub use save_images::SaveImages;

/// Hooks invoked by the training loop.
///
/// Every hook defaults to doing nothing.
pub trait Callback: Send + Sync + Debug {
    /// The name of the callback.
    fn name(&self) -> &str;
    /// Invoked before the first epoch.
    fn on_train_begin(&mut self, model: &Model) {
        let _ = model;
    }
    /// Invoked after every epoch of a phase, ie after training or validation.
    fn on_phase_end(&mut self, model: &Model, mode: ExecutionMode, stats: &Stats) {
        let _ = (model, mode, stats);
    }
    /// Invoked after every epoch, including validation.
    fn on_epoch_end(&mut self, model: &Model, summary: &Summary) {
        let _ = (model, summary);
    }
    /// Invoked after the last epoch.
    fn on_train_end(&mut self, model: &Model) {
        let _ = model;
    }
    /// A copy for model replication.
    fn copy(&self) -> Box<dyn Callback>;
}
