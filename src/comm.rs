//! Process topology.
//!
//! The world is split into `num_models` models of `procs_per_model` ranks each. Ranks within a
//! model share the work of a minibatch; models are trained independently (ie ensembles).
use crate::error::{config_bail, Error, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable for the world rank.
pub const RANK_VAR: &str = "SHARDNET_RANK";
/// Environment variable for the world size.
pub const WORLD_SIZE_VAR: &str = "SHARDNET_WORLD_SIZE";
/// Environment variable for the number of processes per model.
pub const PROCS_PER_MODEL_VAR: &str = "SHARDNET_PROCS_PER_MODEL";

/// A communicator.
///
/// Only carries the topology; collectives are provided by the distributed matrix library and
/// are not modelled here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Comm {
    rank: usize,
    world_size: usize,
    procs_per_model: usize,
}

impl Comm {
    /// Creates a new communicator.
    ///
    /// **Errors**
    /// - `world_size` or `procs_per_model` is 0.
    /// - `rank` is not less than `world_size`.
    /// - `procs_per_model` does not divide `world_size`.
    pub fn new(rank: usize, world_size: usize, procs_per_model: usize) -> Result<Self> {
        if world_size == 0 || procs_per_model == 0 {
            config_bail!(
                "world_size ({world_size}) and procs_per_model ({procs_per_model}) must be positive"
            );
        }
        if rank >= world_size {
            config_bail!("rank {rank} is out of bounds for world_size {world_size}");
        }
        if world_size % procs_per_model != 0 {
            config_bail!(
                "procs_per_model ({procs_per_model}) does not divide world_size ({world_size})"
            );
        }
        Ok(Self {
            rank,
            world_size,
            procs_per_model,
        })
    }
    /// A single process world.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            procs_per_model: 1,
        }
    }
    /// Reads the topology from the environment.
    ///
    /// Defaults to rank 0 of a world of 1, with all ranks in one model.
    ///
    /// **Errors**
    /// - A variable is set but is not a number.
    /// - See [`Comm::new()`].
    pub fn from_env() -> Result<Self> {
        let rank = Self::env_rank()?;
        let world_size = env_usize(WORLD_SIZE_VAR)?.unwrap_or(1);
        let procs_per_model = env_usize(PROCS_PER_MODEL_VAR)?.unwrap_or(world_size);
        Self::new(rank, world_size, procs_per_model)
    }
    /// The world rank from the environment, defaulting to 0.
    ///
    /// Available even when the rest of the topology is invalid.
    ///
    /// **Errors**
    /// - The variable is set but is not a number.
    pub fn env_rank() -> Result<usize> {
        Ok(env_usize(RANK_VAR)?.unwrap_or(0))
    }
    /// Communicators for every rank of one model, useful for simulating a model in process.
    pub fn model_ranks(procs_per_model: usize) -> Result<Vec<Self>> {
        (0..procs_per_model)
            .map(|rank| Self::new(rank, procs_per_model, procs_per_model))
            .collect()
    }
    /// The world rank.
    pub fn rank(&self) -> usize {
        self.rank
    }
    /// The number of processes.
    pub fn world_size(&self) -> usize {
        self.world_size
    }
    /// The number of processes per model.
    pub fn procs_per_model(&self) -> usize {
        self.procs_per_model
    }
    /// The number of models.
    pub fn num_models(&self) -> usize {
        self.world_size / self.procs_per_model
    }
    /// The model this rank belongs to.
    pub fn model_index(&self) -> usize {
        self.rank / self.procs_per_model
    }
    /// The rank within the model.
    pub fn rank_in_model(&self) -> usize {
        self.rank % self.procs_per_model
    }
    /// Whether this is the coordinating rank of the world.
    pub fn is_world_master(&self) -> bool {
        self.rank == 0
    }
    /// Whether this is the first rank of its model.
    pub fn is_model_master(&self) -> bool {
        self.rank_in_model() == 0
    }
}

impl Default for Comm {
    fn default() -> Self {
        Self::single()
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::config(format!("{key}={value:?} is not a non-negative integer"))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(value)) => {
            config_bail!("{key}={value:?} is not valid unicode")
        }
    }
}
