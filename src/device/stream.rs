use super::{Kernel, Memory};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

enum Op {
    Launch(Kernel),
    Fence(Sender<Option<String>>),
}

/// An in order queue of kernels, drained by a worker thread.
pub(super) struct Stream {
    index: usize,
    sender: Option<Sender<Op>>,
    handle: Option<JoinHandle<()>>,
}

impl Stream {
    pub(super) fn new(index: usize, memory: Arc<Mutex<Memory>>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(format!("shardnet-stream-{index}"))
            .spawn(move || run(receiver, memory))
            .map_err(|e| Error::resource(format!("failed to start stream {index}: {e}")))?;
        Ok(Self {
            index,
            sender: Some(sender),
            handle: Some(handle),
        })
    }
    fn send(&self, op: Op) -> Result<()> {
        self.sender
            .as_ref()
            .and_then(|sender| sender.send(op).ok())
            .ok_or_else(|| Error::resource(format!("device {} lost", self.index)))
    }
    pub(super) fn launch(&self, kernel: Kernel) -> Result<()> {
        self.send(Op::Launch(kernel))
    }
    pub(super) fn synchronize(&self) -> Result<()> {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        self.send(Op::Fence(sender))?;
        match receiver.recv() {
            Ok(None) => Ok(()),
            Ok(Some(message)) => Err(Error::resource(format!(
                "device {}: kernel failed: {message}",
                self.index
            ))),
            Err(_) => Err(Error::resource(format!("device {} lost", self.index))),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Disconnecting the channel stops the worker once the queue is drained.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("device {} stream panicked", self.index);
            }
        }
    }
}

fn run(receiver: Receiver<Op>, memory: Arc<Mutex<Memory>>) {
    let mut error: Option<String> = None;
    for op in receiver.iter() {
        match op {
            Op::Launch(kernel) => {
                let result = kernel(&mut memory.lock());
                if let Err(e) = result {
                    error.get_or_insert_with(|| e.to_string());
                }
            }
            Op::Fence(sender) => {
                sender.send(error.take()).ok();
            }
        }
    }
}
