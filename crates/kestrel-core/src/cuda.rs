// CUDA plumbing for the `cuda` feature
//
// - GpuContext wraps a cudarc device handle per ordinal, created on first use
//   and shared by every buffer on that GPU
// - GpuBuffer is an enum over CudaSlice<T> for each supported dtype
// - Generated kernels are compiled with NVRTC once per distinct source text
//   and cached in the context under a module name derived from the source

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock};

use cudarc::driver::{CudaFunction, CudaSlice, DevicePtr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::memory::HostBuffer;

/// Name of the entry point every generated kernel defines.
pub(crate) const ENTRY: &str = "kestrel_kernel";

/// A CUDA device plus the set of generated modules already loaded on it.
pub(crate) struct GpuContext {
    dev: Arc<cudarc::driver::CudaDevice>,
    ordinal: usize,
    arch: &'static str,
    loaded: Mutex<HashSet<String>>,
}

// Safety: cudarc's device is thread-safe (CUDA runtime is thread-safe)
unsafe impl Send for GpuContext {}
unsafe impl Sync for GpuContext {}

static CONTEXTS: OnceLock<Mutex<HashMap<usize, Arc<GpuContext>>>> = OnceLock::new();

/// The shared context for GPU `ordinal`, created on first request.
pub(crate) fn context(ordinal: usize) -> Result<Arc<GpuContext>> {
    let contexts = CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut contexts = contexts
        .lock()
        .map_err(|_| Error::msg("gpu context lock poisoned"))?;
    if let Some(ctx) = contexts.get(&ordinal) {
        return Ok(Arc::clone(ctx));
    }
    let dev = cudarc::driver::CudaDevice::new(ordinal).map_err(|e| Error::DeviceUnavailable {
        device: Device::Gpu(ordinal),
        reason: format!("CUDA device creation failed: {e}"),
    })?;
    let major = dev
        .attribute(
            cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
        )
        .unwrap_or(7);
    let minor = dev
        .attribute(
            cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
        )
        .unwrap_or(0);
    let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
    let ctx = Arc::new(GpuContext {
        dev,
        ordinal,
        arch,
        loaded: Mutex::new(HashSet::new()),
    });
    contexts.insert(ordinal, Arc::clone(&ctx));
    Ok(ctx)
}

impl GpuContext {
    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    /// Compile (once) and fetch the entry point of a generated kernel.
    pub(crate) fn kernel(&self, source: &str) -> Result<CudaFunction> {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        let module = format!("kestrel_{:016x}", hasher.finish());

        let mut loaded = self
            .loaded
            .lock()
            .map_err(|_| Error::msg("gpu module cache lock poisoned"))?;
        if !loaded.contains(&module) {
            let opts = CompileOptions {
                arch: Some(self.arch),
                ..Default::default()
            };
            let ptx = compile_ptx_with_opts(source, opts)
                .map_err(|e| Error::msg(format!("NVRTC compilation failed: {e}")))?;
            self.dev
                .load_ptx(ptx, &module, &[ENTRY])
                .map_err(|e| Error::msg(format!("PTX load failed: {e}")))?;
            loaded.insert(module.clone());
        }
        self.dev
            .get_func(&module, ENTRY)
            .ok_or_else(|| Error::msg(format!("CUDA kernel '{module}' not found")))
    }

    pub(crate) fn alloc_f64(&self, n: usize) -> Result<CudaSlice<f64>> {
        self.dev
            .alloc_zeros::<f64>(n.max(1))
            .map_err(|e| Error::msg(format!("alloc f64: {e}")))
    }

    /// Launch `func` over `n` threads with raw device-pointer/scalar params.
    ///
    /// # Safety
    /// `params` must point at values whose types match the kernel signature
    /// and stay alive until the launch returns.
    pub(crate) unsafe fn launch(
        &self,
        func: CudaFunction,
        n: usize,
        params: &mut [*mut c_void],
    ) -> Result<()> {
        func.launch(launch_cfg(n), params)
            .map_err(|e| Error::msg(format!("kernel launch failed: {e}")))?;
        self.dev
            .synchronize()
            .map_err(|e| Error::msg(format!("device synchronize failed: {e}")))
    }
}

/// Raw device address of an f64 scratch buffer.
pub(crate) fn device_ptr_f64(slice: &CudaSlice<f64>) -> u64 {
    *slice.device_ptr()
}

/// Standard CUDA launch configuration for N elements.
fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Device-side storage. Each variant wraps a cudarc CudaSlice for the
/// corresponding dtype.
pub enum GpuBuffer {
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
    I32(CudaSlice<i32>),
}

unsafe impl Send for GpuBuffer {}
unsafe impl Sync for GpuBuffer {}

impl GpuBuffer {
    pub(crate) fn zeros(ctx: &GpuContext, dtype: DType, len: usize) -> Result<Self> {
        let map = |e: cudarc::driver::DriverError| Error::msg(format!("gpu alloc: {e}"));
        Ok(match dtype {
            DType::F32 => GpuBuffer::F32(ctx.dev.alloc_zeros::<f32>(len).map_err(map)?),
            DType::F64 => GpuBuffer::F64(ctx.dev.alloc_zeros::<f64>(len).map_err(map)?),
            DType::I32 => GpuBuffer::I32(ctx.dev.alloc_zeros::<i32>(len).map_err(map)?),
        })
    }

    pub(crate) fn dtype(&self) -> DType {
        match self {
            GpuBuffer::F32(_) => DType::F32,
            GpuBuffer::F64(_) => DType::F64,
            GpuBuffer::I32(_) => DType::I32,
        }
    }

    pub(crate) fn upload_from(&mut self, ctx: &GpuContext, host: &HostBuffer) -> Result<()> {
        let map = |e: cudarc::driver::DriverError| Error::msg(format!("htod: {e}"));
        match (self, host) {
            (GpuBuffer::F32(dst), HostBuffer::F32(src)) => {
                ctx.dev.htod_sync_copy_into(src, dst).map_err(map)
            }
            (GpuBuffer::F64(dst), HostBuffer::F64(src)) => {
                ctx.dev.htod_sync_copy_into(src, dst).map_err(map)
            }
            (GpuBuffer::I32(dst), HostBuffer::I32(src)) => {
                ctx.dev.htod_sync_copy_into(src, dst).map_err(map)
            }
            (dst, src) => Err(Error::DTypeMismatch {
                expected: dst.dtype(),
                got: src.dtype(),
            }),
        }
    }

    pub(crate) fn download_into(&self, ctx: &GpuContext, host: &mut HostBuffer) -> Result<()> {
        let map = |e: cudarc::driver::DriverError| Error::msg(format!("dtoh: {e}"));
        match (self, host) {
            (GpuBuffer::F32(src), HostBuffer::F32(dst)) => {
                ctx.dev.dtoh_sync_copy_into(src, dst).map_err(map)
            }
            (GpuBuffer::F64(src), HostBuffer::F64(dst)) => {
                ctx.dev.dtoh_sync_copy_into(src, dst).map_err(map)
            }
            (GpuBuffer::I32(src), HostBuffer::I32(dst)) => {
                ctx.dev.dtoh_sync_copy_into(src, dst).map_err(map)
            }
            (src, dst) => Err(Error::DTypeMismatch {
                expected: dst.dtype(),
                got: src.dtype(),
            }),
        }
    }

    pub(crate) fn fill_zero(&mut self, ctx: &GpuContext) -> Result<()> {
        let map = |e: cudarc::driver::DriverError| Error::msg(format!("memset: {e}"));
        match self {
            GpuBuffer::F32(s) => ctx.dev.memset_zeros(s).map_err(map),
            GpuBuffer::F64(s) => ctx.dev.memset_zeros(s).map_err(map),
            GpuBuffer::I32(s) => ctx.dev.memset_zeros(s).map_err(map),
        }
    }

    /// Raw device address, for kernel parameter lists.
    pub(crate) fn device_ptr(&self) -> u64 {
        match self {
            GpuBuffer::F32(s) => *s.device_ptr(),
            GpuBuffer::F64(s) => *s.device_ptr(),
            GpuBuffer::I32(s) => *s.device_ptr(),
        }
    }
}
