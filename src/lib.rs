//! # shardnet
//! Data-parallel layer execution and minibatch distribution for neural network training.
//!
//! A [`Model`](model::Model) is a chain of [layers](layer), beginning with an
//! [`InputLayer`](layer::InputLayer) and ending with a [`TargetLayer`](layer::TargetLayer). The
//! ranks of a model, described by a [`Comm`](comm::Comm), each hold a shard of every minibatch;
//! the [`PartitionedIoBuffer`](data::PartitionedIoBuffer) decides which samples a rank fetches
//! from its [`DataReader`](data::DataReader).
//!
//! Activation layers compute on the host or, with the `device` feature, on a set of
//! [devices](device). Adjacent device layers share buffers instead of copying through the host.
//!
//! Models are usually built from [prototext](proto) files by the `shardnet` binary.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub use error::{Error, Result};

pub mod comm;
pub mod matrix;
pub mod device;
pub mod data;
pub mod layer;
pub mod objective;
pub mod model;
pub mod callback;
pub mod proto;
