use super::Callback;
use crate::{
    data::ExecutionMode,
    model::{Model, Stats, Summary},
};

/// Logs the objective at the end of every phase and epoch.
///
/// Only the model master logs.
#[derive(Clone, Copy, Default, Debug)]
pub struct PrintStatistics;

impl Callback for PrintStatistics {
    fn name(&self) -> &str {
        "print"
    }
    fn on_phase_end(&mut self, model: &Model, mode: ExecutionMode, stats: &Stats) {
        if !model.comm().is_model_master() {
            return;
        }
        match stats.objective() {
            Some(objective) => log::info!(
                "model {} epoch {} {mode} objective: {objective:.6} ({} samples, {} steps)",
                model.comm().model_index(),
                model.epoch(),
                stats.count(),
                stats.steps()
            ),
            None => log::info!(
                "model {} epoch {} {mode}: no local samples ({} steps)",
                model.comm().model_index(),
                model.epoch(),
                stats.steps()
            ),
        }
    }
    fn on_epoch_end(&mut self, model: &Model, summary: &Summary) {
        if model.comm().is_model_master() {
            log::info!(
                "model {} epoch {} finished in {:.2?} (total {:.2?})",
                model.comm().model_index(),
                summary.epoch(),
                summary.epoch_time(),
                summary.total_time()
            );
        }
    }
    fn copy(&self) -> Box<dyn Callback> {
        Box::new(*self)
    }
}
