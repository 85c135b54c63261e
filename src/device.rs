//! Device execution.
//!
//! A [`DeviceManager`] owns one [`Device`] per logical gpu. Each device has its own memory and a
//! compute stream; kernels are enqueued on the stream and run asynchronously in submission order.
//! Nothing here waits on a stream unless [`DeviceManager::synchronize()`] is called, which is the
//! responsibility of the training loop.
//!
//! Devices are executed by host worker threads, one per stream. Device support is compiled in
//! with the `device` feature; without it [`Executor::device()`] fails.
use crate::{
    error::{Error, Result},
    matrix::DataType,
};
use ndarray::{ArrayView2, ArrayViewMut2};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::{self, Debug},
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

mod descriptor;
pub use descriptor::{ActivationDescriptor, ActivationMode, Descriptors, TensorDescriptor};

mod stream;
use stream::Stream;

/// Device buffer handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

/// The memory of one device.
#[derive(Default)]
pub struct Memory {
    buffers: HashMap<BufferId, Vec<DataType>>,
}

impl Memory {
    /// The contents of a buffer.
    ///
    /// **Errors**
    /// - The buffer does not exist on this device.
    pub fn get(&self, id: BufferId) -> Result<&[DataType]> {
        self.buffers
            .get(&id)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::resource(format!("{id:?} is not allocated on this device")))
    }
    /// The contents of a buffer, mutably.
    ///
    /// **Errors**
    /// - The buffer does not exist on this device.
    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut [DataType]> {
        self.buffers
            .get_mut(&id)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| Error::resource(format!("{id:?} is not allocated on this device")))
    }
    /// Calls `f` with the contents of `inputs` and `output`.
    ///
    /// **Errors**
    /// - A buffer does not exist.
    /// - `output` is also an input.
    pub fn with_buffers<F>(&mut self, inputs: &[BufferId], output: BufferId, f: F) -> Result<()>
    where
        F: FnOnce(&[&[DataType]], &mut [DataType]),
    {
        if inputs.contains(&output) {
            return Err(Error::resource(format!("{output:?} aliases an input")));
        }
        let mut output_data = self.buffers.remove(&output).ok_or_else(|| {
            Error::resource(format!("{output:?} is not allocated on this device"))
        })?;
        let result = inputs
            .iter()
            .map(|&id| self.get(id))
            .collect::<Result<Vec<_>>>()
            .map(|inputs| f(&inputs, &mut output_data));
        self.buffers.insert(output, output_data);
        result
    }
}

/// A kernel, run on the device's stream with exclusive access to its memory.
pub type Kernel = Box<dyn FnOnce(&mut Memory) -> Result<()> + Send + 'static>;

/// A logical gpu.
pub struct Device {
    index: usize,
    memory: Arc<Mutex<Memory>>,
    stream: Stream,
}

impl Device {
    fn new(index: usize) -> Result<Self> {
        let memory = Arc::new(Mutex::new(Memory::default()));
        let stream = Stream::new(index, memory.clone())?;
        Ok(Self {
            index,
            memory,
            stream,
        })
    }
    /// The index of the device.
    pub fn index(&self) -> usize {
        self.index
    }
    /// Enqueues `kernel` on the compute stream.
    ///
    /// Returns immediately. Errors raised by the kernel are reported by the next
    /// [`.synchronize()`](Self::synchronize).
    ///
    /// **Errors**
    /// - The stream has stopped.
    pub fn launch(
        &self,
        kernel: impl FnOnce(&mut Memory) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        self.stream.launch(Box::new(kernel))
    }
    /// Blocks until all enqueued kernels have finished.
    ///
    /// **Errors**
    /// - A kernel failed.
    /// - The stream has stopped.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device").field("index", &self.index).finish()
    }
}

/// Allocation counters.
#[derive(Clone, Copy, Default, Debug, Eq, PartialEq)]
pub struct DeviceStats {
    /// Buffers allocated and not yet freed.
    pub live_buffers: usize,
    /// Total buffers allocated.
    pub allocations: usize,
    /// Total buffers freed.
    pub frees: usize,
    /// Frees of buffers that were not allocated (ie double frees).
    pub invalid_frees: usize,
    /// Descriptors created and not yet destroyed.
    pub live_descriptors: usize,
}

/// Manages the devices of one process.
pub struct DeviceManager {
    devices: Vec<Device>,
    next_id: AtomicU64,
    stats: Mutex<DeviceStats>,
}

impl DeviceManager {
    /// Creates a manager for `num_gpus` devices.
    ///
    /// **Errors**
    /// - `num_gpus` is 0.
    /// - Device support is not compiled in.
    /// - A stream could not be started.
    pub fn new(num_gpus: usize) -> Result<Arc<Self>> {
        if !cfg!(feature = "device") {
            return Err(Error::unsupported(
                "device support is not compiled in (enable the \"device\" feature)",
            ));
        }
        if num_gpus == 0 {
            return Err(Error::config("num_gpus must be positive"));
        }
        let devices = (0..num_gpus)
            .map(Device::new)
            .collect::<Result<Vec<_>>>()?;
        log::debug!("initialized {num_gpus} device(s)");
        Ok(Arc::new(Self {
            devices,
            next_id: AtomicU64::new(1),
            stats: Mutex::default(),
        }))
    }
    /// The number of managed devices.
    pub fn num_gpus(&self) -> usize {
        self.devices.len()
    }
    /// The device at `index`.
    ///
    /// **Errors**
    /// - `index` is out of bounds.
    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).ok_or_else(|| {
            Error::resource(format!(
                "device {index} is out of bounds for {} device(s)",
                self.devices.len()
            ))
        })
    }
    /// The devices.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
    /// Blocks until every stream is idle.
    ///
    /// **Errors**
    /// - See [`Device::synchronize()`].
    pub fn synchronize(&self) -> Result<()> {
        for device in self.devices.iter() {
            device.synchronize()?;
        }
        Ok(())
    }
    /// Allocation counters.
    pub fn stats(&self) -> DeviceStats {
        *self.stats.lock()
    }
    /// Allocates a `rows` x `cols_per_gpu` buffer on every device.
    ///
    /// The buffer is freed when the returned [`DeviceMatrix`] is dropped.
    ///
    /// **Errors**
    /// - The size overflows.
    pub fn allocate(self: &Arc<Self>, rows: usize, cols_per_gpu: usize) -> Result<DeviceMatrix> {
        let len = rows.checked_mul(cols_per_gpu).ok_or_else(|| {
            Error::resource(format!(
                "device allocation of {rows} x {cols_per_gpu} overflows"
            ))
        })?;
        let mut buffers = Vec::with_capacity(self.devices.len());
        for device in self.devices.iter() {
            let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
            device.memory.lock().buffers.insert(id, vec![0.; len]);
            buffers.push(id);
        }
        {
            let mut stats = self.stats.lock();
            stats.live_buffers += buffers.len();
            stats.allocations += buffers.len();
        }
        log::trace!("allocated {rows} x {cols_per_gpu} on {} device(s)", buffers.len());
        Ok(DeviceMatrix {
            manager: self.clone(),
            buffers,
            rows,
            cols_per_gpu,
        })
    }
    fn deallocate(&self, buffers: &[BufferId]) {
        let mut freed = 0;
        let mut invalid = 0;
        for (device, id) in self.devices.iter().zip(buffers) {
            if device.memory.lock().buffers.remove(id).is_some() {
                freed += 1;
            } else {
                log::error!("device {}: {id:?} freed but not allocated", device.index);
                invalid += 1;
            }
        }
        let mut stats = self.stats.lock();
        stats.live_buffers -= freed;
        stats.frees += freed;
        stats.invalid_frees += invalid;
    }
    pub(crate) fn descriptor_created(&self) {
        self.stats.lock().live_descriptors += 1;
    }
    pub(crate) fn descriptor_destroyed(&self) {
        self.stats.lock().live_descriptors -= 1;
    }
    /// Copies the columns of `host` into `matrix`, splitting them among devices.
    ///
    /// Enqueued on each device's stream, so kernels launched afterwards see the data.
    ///
    /// **Errors**
    /// - The number of rows differs.
    /// - `host` has more columns than fit on the devices.
    pub fn copy_to_device(&self, host: ArrayView2<DataType>, matrix: &DeviceMatrix) -> Result<()> {
        matrix.check_host_dim(host.dim())?;
        for (device, &id) in self.devices.iter().zip(matrix.buffers.iter()) {
            let columns = matrix.device_columns(host.ncols(), device.index);
            let mut data = Vec::with_capacity(columns.len() * matrix.rows);
            for col in columns {
                data.extend(host.column(col).iter().copied());
            }
            device.launch(move |memory| {
                memory.get_mut(id)?[..data.len()].copy_from_slice(&data);
                Ok(())
            })?;
        }
        Ok(())
    }
    /// Copies `matrix` into the columns of `host`.
    ///
    /// # Note
    /// Reads device memory directly; the devices must be synchronized first.
    ///
    /// **Errors**
    /// - The number of rows differs.
    /// - `host` has more columns than fit on the devices.
    pub fn copy_to_host(
        &self,
        matrix: &DeviceMatrix,
        mut host: ArrayViewMut2<DataType>,
    ) -> Result<()> {
        matrix.check_host_dim(host.dim())?;
        let rows = matrix.rows;
        for (device, &id) in self.devices.iter().zip(matrix.buffers.iter()) {
            let columns = matrix.device_columns(host.ncols(), device.index);
            let memory = device.memory.lock();
            let data = memory.get(id)?;
            for (i, col) in columns.enumerate() {
                host.column_mut(col)
                    .iter_mut()
                    .zip(&data[i * rows..(i + 1) * rows])
                    .for_each(|(y, x)| *y = *x);
            }
        }
        Ok(())
    }
}

impl Debug for DeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceManager")
            .field("num_gpus", &self.devices.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A matrix resident on every device of a [`DeviceManager`].
///
/// Each device holds `rows` x `cols_per_gpu` entries, stored column major (sample contiguous).
/// Freed exactly once, on drop.
pub struct DeviceMatrix {
    manager: Arc<DeviceManager>,
    buffers: Vec<BufferId>,
    rows: usize,
    cols_per_gpu: usize,
}

impl DeviceMatrix {
    /// The number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }
    /// The number of columns on each device.
    pub fn cols_per_gpu(&self) -> usize {
        self.cols_per_gpu
    }
    /// The buffer on device `index`.
    pub fn buffer(&self, index: usize) -> Option<BufferId> {
        self.buffers.get(index).copied()
    }
    /// The buffers, one per device.
    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }
    /// The local columns handled by device `index`, for `local_width` local columns.
    pub fn device_columns(&self, local_width: usize, index: usize) -> Range<usize> {
        let start = (index * self.cols_per_gpu).min(local_width);
        let end = ((index + 1) * self.cols_per_gpu).min(local_width);
        start..end
    }
    fn check_host_dim(&self, (rows, cols): (usize, usize)) -> Result<()> {
        if rows != self.rows || cols > self.cols_per_gpu * self.buffers.len() {
            return Err(Error::resource(format!(
                "host matrix of {rows} x {cols} does not fit \
                 device matrix of {} x {} on {} device(s)",
                self.rows,
                self.cols_per_gpu,
                self.buffers.len()
            )));
        }
        Ok(())
    }
}

impl Drop for DeviceMatrix {
    fn drop(&mut self) {
        self.manager.deallocate(&self.buffers);
    }
}

impl Debug for DeviceMatrix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DeviceMatrix")
            .field("buffers", &self.buffers)
            .field("rows", &self.rows)
            .field("cols_per_gpu", &self.cols_per_gpu)
            .finish()
    }
}

/// Where a layer computes.
///
/// Chosen once per layer at model assembly.
#[derive(Clone, Default, Debug)]
pub enum Executor {
    /// On the host.
    #[default]
    Cpu,
    /// On the devices of the manager.
    Device(Arc<DeviceManager>),
}

impl Executor {
    /// A device executor over `num_gpus` devices.
    ///
    /// **Errors**
    /// - Device support is not compiled in, reported as a configuration error.
    /// - See [`DeviceManager::new()`].
    pub fn device(num_gpus: usize) -> Result<Self> {
        match DeviceManager::new(num_gpus) {
            Ok(manager) => Ok(Self::Device(manager)),
            Err(Error::Unsupported(message)) => Err(Error::config(format!(
                "device execution was requested but {message}"
            ))),
            Err(e) => Err(e),
        }
    }
    /// Whether this is a device executor.
    pub fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
    /// The device manager.
    pub fn manager(&self) -> Option<&Arc<DeviceManager>> {
        match self {
            Self::Cpu => None,
            Self::Device(manager) => Some(manager),
        }
    }
    /// Waits for all enqueued device work. A no-op on the host.
    pub fn synchronize(&self) -> Result<()> {
        match self {
            Self::Cpu => Ok(()),
            Self::Device(manager) => manager.synchronize(),
        }
    }
}

/// `ceil(ceil(mini_batch_size / num_processes) / num_gpus)`
pub fn mini_batch_size_per_gpu(
    mini_batch_size: usize,
    num_processes: usize,
    num_gpus: usize,
) -> usize {
    let local = (mini_batch_size + num_processes - 1) / num_processes;
    (local + num_gpus - 1) / num_gpus
}
