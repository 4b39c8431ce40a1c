use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::{Device, Freshness};
use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};

#[cfg(feature = "cuda")]
use crate::cuda::{self, GpuBuffer};

// SynchronizedMemory: one logical buffer, up to two physical copies
//
// A buffer of `len` elements of one dtype that may live on the host, on a
// GPU, or both. Two flags say which copies hold the latest values:
//
//   cpu_fresh  gpu_fresh   meaning
//   ---------  ---------   -------------------------------------------
//   false      false       "lazy zero": logically all zeros, nothing
//                          needs to be read (copies may or may not exist)
//   true       false       host copy authoritative
//   false      true        device copy authoritative
//   true       true        both copies agree
//
// Read accessors make the requested copy fresh (allocating and/or
// transferring first); mutable accessors additionally mark the other copy
// stale. Allocation is lazy: a zeros buffer allocates nothing until it is
// first touched, and then only on the device that touched it.

/// Unique identifier of a memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId(u64);

impl MemoryId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        MemoryId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Host-side storage, one variant per dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
}

impl HostBuffer {
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => HostBuffer::F32(vec![0.0; len]),
            DType::F64 => HostBuffer::F64(vec![0.0; len]),
            DType::I32 => HostBuffer::I32(vec![0; len]),
        }
    }

    fn empty(dtype: DType) -> Self {
        HostBuffer::zeros(dtype, 0)
    }

    /// Convert f64 values into a buffer of `dtype` (integers truncate).
    pub fn from_f64(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::F32 => HostBuffer::F32(values.iter().map(|&v| v as f32).collect()),
            DType::F64 => HostBuffer::F64(values.to_vec()),
            DType::I32 => HostBuffer::I32(values.iter().map(|&v| v as i32).collect()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            HostBuffer::F32(_) => DType::F32,
            HostBuffer::F64(_) => DType::F64,
            HostBuffer::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostBuffer::F32(v) => v.len(),
            HostBuffer::F64(v) => v.len(),
            HostBuffer::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get_f64(&self, i: usize) -> f64 {
        match self {
            HostBuffer::F32(v) => v[i] as f64,
            HostBuffer::F64(v) => v[i],
            HostBuffer::I32(v) => v[i] as f64,
        }
    }

    #[inline]
    pub fn set_f64(&mut self, i: usize, value: f64) {
        match self {
            HostBuffer::F32(v) => v[i] = value as f32,
            HostBuffer::F64(v) => v[i] = value,
            HostBuffer::I32(v) => v[i] = value as i32,
        }
    }

    pub fn to_vec_f64(&self) -> Vec<f64> {
        match self {
            HostBuffer::F32(v) => v.iter().map(|&x| x as f64).collect(),
            HostBuffer::F64(v) => v.clone(),
            HostBuffer::I32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    /// Borrow the typed slice if this buffer holds `T`.
    pub fn as_slice<T: WithDType>(&self) -> Option<&[T]> {
        T::slice_of(self)
    }

    fn fill_zero(&mut self) {
        match self {
            HostBuffer::F32(v) => v.iter_mut().for_each(|x| *x = 0.0),
            HostBuffer::F64(v) => v.iter_mut().for_each(|x| *x = 0.0),
            HostBuffer::I32(v) => v.iter_mut().for_each(|x| *x = 0),
        }
    }
}

struct MemoryState {
    /// Empty until the host copy is allocated.
    cpu: HostBuffer,
    cpu_fresh: bool,
    #[cfg(feature = "cuda")]
    gpu: Option<(usize, GpuBuffer)>,
    gpu_fresh: bool,
}

impl MemoryState {
    fn cpu_allocated(&self) -> bool {
        !self.cpu.is_empty()
    }

    #[cfg(feature = "cuda")]
    fn gpu_ordinal(&self) -> Option<usize> {
        self.gpu.as_ref().map(|(ordinal, _)| *ordinal)
    }

    #[cfg(not(feature = "cuda"))]
    fn gpu_ordinal(&self) -> Option<usize> {
        None
    }
}

/// A reference-counted (via `Arc` in [`crate::Array`]) buffer that keeps a
/// host copy and an optional GPU copy in sync.
pub struct SynchronizedMemory {
    id: MemoryId,
    len: usize,
    dtype: DType,
    preferred: Device,
    state: RwLock<MemoryState>,
}

impl SynchronizedMemory {
    /// A lazily allocated all-zeros buffer.
    pub fn zeros(len: usize, dtype: DType, preferred: Device) -> Self {
        SynchronizedMemory {
            id: MemoryId::new(),
            len,
            dtype,
            preferred,
            state: RwLock::new(MemoryState {
                cpu: HostBuffer::empty(dtype),
                cpu_fresh: false,
                #[cfg(feature = "cuda")]
                gpu: None,
                gpu_fresh: false,
            }),
        }
    }

    /// A buffer whose host copy is `data` (fresh on the CPU).
    pub fn from_host(data: HostBuffer, preferred: Device) -> Self {
        let len = data.len();
        let dtype = data.dtype();
        SynchronizedMemory {
            id: MemoryId::new(),
            len,
            dtype,
            preferred,
            state: RwLock::new(MemoryState {
                cpu_fresh: len > 0,
                cpu: data,
                #[cfg(feature = "cuda")]
                gpu: None,
                gpu_fresh: false,
            }),
        }
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn preferred_device(&self) -> Device {
        self.preferred
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| Error::msg("memory lock poisoned"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| Error::msg("memory lock poisoned"))
    }

    /// Whether a physical copy exists on `device`. Never allocates.
    pub fn is_allocated(&self, device: Device) -> Result<bool> {
        let state = self.read_state()?;
        Ok(match device {
            Device::Cpu => state.cpu_allocated(),
            Device::Gpu(ordinal) => state.gpu_ordinal() == Some(ordinal),
        })
    }

    pub fn is_any_allocated(&self) -> Result<bool> {
        let state = self.read_state()?;
        Ok(state.cpu_allocated() || state.gpu_ordinal().is_some())
    }

    /// Whether the copy on `device` holds the latest values.
    pub fn is_fresh(&self, device: Device) -> Result<bool> {
        let state = self.read_state()?;
        Ok(match device {
            Device::Cpu => state.cpu_fresh,
            Device::Gpu(ordinal) => state.gpu_fresh && state.gpu_ordinal() == Some(ordinal),
        })
    }

    pub fn freshness(&self) -> Result<Freshness> {
        let state = self.read_state()?;
        Ok(Freshness {
            cpu_fresh: state.cpu_fresh,
            gpu_fresh: if state.gpu_fresh {
                state.gpu_ordinal()
            } else {
                None
            },
            preferred: self.preferred,
        })
    }

    /// Forget the contents: the buffer reads as zeros again, without touching
    /// (or allocating) either copy until the next access.
    pub fn lazy_clear(&self) -> Result<()> {
        let mut state = self.write_state()?;
        state.cpu_fresh = false;
        state.gpu_fresh = false;
        Ok(())
    }

    fn make_cpu_fresh(&self, state: &mut MemoryState) -> Result<()> {
        if state.cpu_fresh {
            return Ok(());
        }
        if !state.cpu_allocated() {
            state.cpu = HostBuffer::zeros(self.dtype, self.len);
        }
        if state.gpu_fresh {
            self.download(state)?;
        } else {
            state.cpu.fill_zero();
        }
        state.cpu_fresh = true;
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn download(&self, state: &mut MemoryState) -> Result<()> {
        let MemoryState { cpu, gpu, .. } = state;
        match gpu {
            Some((ordinal, buffer)) => {
                let ctx = cuda::context(*ordinal)?;
                buffer.download_into(&ctx, cpu)
            }
            None => Err(Error::msg("gpu copy marked fresh but not allocated")),
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn download(&self, _state: &mut MemoryState) -> Result<()> {
        Err(Error::gpu_unavailable(Device::Gpu(0)))
    }

    /// Read access to the host copy, syncing it first if needed.
    pub fn cpu_data(&self) -> Result<HostRead<'_>> {
        {
            let state = self.read_state()?;
            if state.cpu_fresh {
                return Ok(HostRead(state));
            }
        }
        {
            let mut state = self.write_state()?;
            self.make_cpu_fresh(&mut state)?;
        }
        Ok(HostRead(self.read_state()?))
    }

    /// Write access to the host copy. Marks any GPU copy stale.
    pub fn mutable_cpu_data(&self) -> Result<HostWrite<'_>> {
        let mut state = self.write_state()?;
        self.make_cpu_fresh(&mut state)?;
        state.gpu_fresh = false;
        Ok(HostWrite(state))
    }

    /// Write access to the host copy without syncing its old contents
    /// (the caller overwrites every element). Marks any GPU copy stale.
    pub fn overwrite_cpu_data(&self) -> Result<HostWrite<'_>> {
        let mut state = self.write_state()?;
        if !state.cpu_allocated() {
            state.cpu = HostBuffer::zeros(self.dtype, self.len);
        }
        state.cpu_fresh = true;
        state.gpu_fresh = false;
        Ok(HostWrite(state))
    }
}

#[cfg(feature = "cuda")]
impl SynchronizedMemory {
    fn make_gpu_fresh(&self, state: &mut MemoryState, ordinal: usize) -> Result<()> {
        if state.gpu_fresh && state.gpu_ordinal() == Some(ordinal) {
            return Ok(());
        }
        if state.gpu_fresh {
            // fresh on another GPU: route through the host copy
            self.make_cpu_fresh(state)?;
        }
        let ctx = cuda::context(ordinal)?;
        if state.gpu_ordinal() != Some(ordinal) {
            state.gpu = Some((ordinal, GpuBuffer::zeros(&ctx, self.dtype, self.len)?));
        }
        let MemoryState {
            cpu, gpu, cpu_fresh, ..
        } = state;
        if let Some((_, buffer)) = gpu {
            if *cpu_fresh {
                buffer.upload_from(&ctx, cpu)?;
            } else {
                buffer.fill_zero(&ctx)?;
            }
        }
        state.gpu_fresh = true;
        Ok(())
    }

    /// Read access to the copy on GPU `ordinal`, syncing it first if needed.
    pub fn gpu_data(&self, ordinal: usize) -> Result<GpuRead<'_>> {
        {
            let mut state = self.write_state()?;
            self.make_gpu_fresh(&mut state, ordinal)?;
        }
        Ok(GpuRead(self.read_state()?))
    }

    /// Write access to the copy on GPU `ordinal`. Marks the host copy stale.
    pub fn mutable_gpu_data(&self, ordinal: usize) -> Result<GpuWrite<'_>> {
        let mut state = self.write_state()?;
        self.make_gpu_fresh(&mut state, ordinal)?;
        state.cpu_fresh = false;
        Ok(GpuWrite(state))
    }
}

#[cfg(not(feature = "cuda"))]
impl SynchronizedMemory {
    /// Always a configuration error in a CPU-only build.
    pub fn gpu_data(&self, ordinal: usize) -> Result<GpuRead<'_>> {
        Err(Error::gpu_unavailable(Device::Gpu(ordinal)))
    }

    /// Always a configuration error in a CPU-only build.
    pub fn mutable_gpu_data(&self, ordinal: usize) -> Result<GpuWrite<'_>> {
        Err(Error::gpu_unavailable(Device::Gpu(ordinal)))
    }
}

impl fmt::Debug for SynchronizedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("SynchronizedMemory");
        s.field("id", &self.id.0)
            .field("len", &self.len)
            .field("dtype", &self.dtype);
        match self.state.try_read() {
            Ok(state) => s
                .field("cpu_fresh", &state.cpu_fresh)
                .field("gpu_fresh", &state.gpu_fresh)
                .finish(),
            Err(_) => s.finish_non_exhaustive(),
        }
    }
}

/// Shared borrow of a host copy that is guaranteed allocated and fresh at
/// the time it was taken.
pub struct HostRead<'a>(RwLockReadGuard<'a, MemoryState>);

impl Deref for HostRead<'_> {
    type Target = HostBuffer;
    fn deref(&self) -> &HostBuffer {
        &self.0.cpu
    }
}

/// Exclusive borrow of an allocated, fresh host copy.
pub struct HostWrite<'a>(RwLockWriteGuard<'a, MemoryState>);

impl Deref for HostWrite<'_> {
    type Target = HostBuffer;
    fn deref(&self) -> &HostBuffer {
        &self.0.cpu
    }
}

impl DerefMut for HostWrite<'_> {
    fn deref_mut(&mut self) -> &mut HostBuffer {
        &mut self.0.cpu
    }
}

/// Shared borrow of a fresh GPU copy.
#[cfg(feature = "cuda")]
pub struct GpuRead<'a>(RwLockReadGuard<'a, MemoryState>);

#[cfg(feature = "cuda")]
impl GpuRead<'_> {
    pub(crate) fn buffer(&self) -> Result<&GpuBuffer> {
        self.0
            .gpu
            .as_ref()
            .map(|(_, buffer)| buffer)
            .ok_or_else(|| Error::msg("gpu copy not allocated"))
    }
}

/// Exclusive borrow of a fresh GPU copy.
#[cfg(feature = "cuda")]
pub struct GpuWrite<'a>(RwLockWriteGuard<'a, MemoryState>);

#[cfg(feature = "cuda")]
impl GpuWrite<'_> {
    pub(crate) fn buffer_mut(&mut self) -> Result<&mut GpuBuffer> {
        self.0
            .gpu
            .as_mut()
            .map(|(_, buffer)| buffer)
            .ok_or_else(|| Error::msg("gpu copy not allocated"))
    }
}

/// Shared borrow of a GPU copy. Cannot be obtained in a CPU-only build.
#[cfg(not(feature = "cuda"))]
pub struct GpuRead<'a> {
    _never: std::convert::Infallible,
    _marker: std::marker::PhantomData<&'a ()>,
}

/// Exclusive borrow of a GPU copy. Cannot be obtained in a CPU-only build.
#[cfg(not(feature = "cuda"))]
pub struct GpuWrite<'a> {
    _never: std::convert::Infallible,
    _marker: std::marker::PhantomData<&'a ()>,
}
