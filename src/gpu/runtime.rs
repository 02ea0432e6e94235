//! GPU Runtime for kernel execution
//!
//! Provides a safe wrapper around the available devices for:
//! - Device memory allocation
//! - Data transfer
//! - Kernel load and launch
//!
//! Two backends exist: the CUDA driver (cargo feature `cuda`) and an
//! in-process simulated device that interprets the GPU IR directly.

use std::fmt;

use thiserror::Error;

use super::ir::{GpuKernel, GpuModule, GpuParam, GpuType};
use super::sim::SimDevice;

#[cfg(feature = "cuda")]
use super::cuda::CudaDevice;

/// GPU Runtime abstraction
pub struct GpuRuntime {
    /// Backend type
    backend: GpuBackend,

    /// Device ID
    device: u32,

    /// Device properties
    device_info: DeviceInfo,

    /// Backend state
    inner: DeviceImpl,
}

enum DeviceImpl {
    Simulated(SimDevice),
    #[cfg(feature = "cuda")]
    Cuda(CudaDevice),
}

/// GPU Backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBackend {
    Cuda,
    /// Simulated backend for testing and GPU-less hosts
    Simulated,
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuBackend::Cuda => write!(f, "CUDA"),
            GpuBackend::Simulated => write!(f, "Simulated"),
        }
    }
}

/// Backend requested by the user
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// CUDA when a device initializes, otherwise the simulated device
    #[default]
    Auto,
    /// Require the CUDA driver
    Cuda,
    /// Always use the simulated device
    Simulated,
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendChoice::Auto => write!(f, "auto"),
            BackendChoice::Cuda => write!(f, "cuda"),
            BackendChoice::Simulated => write!(f, "simulated"),
        }
    }
}

/// Address in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn offset(&self, bytes: u64) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device buffer handle
///
/// The memory is owned by the [`GpuRuntime`] that allocated it; dropping the
/// handle does not release it. Call [`GpuRuntime::free`], or let the runtime
/// release everything when it is dropped.
#[derive(Debug)]
pub struct DeviceBuffer {
    /// Device address of the first byte
    ptr: DevicePtr,

    /// Size in bytes
    size: usize,

    /// Backend
    backend: GpuBackend,
}

impl DeviceBuffer {
    /// Get the size of the buffer in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn backend(&self) -> GpuBackend {
        self.backend
    }
}

/// Loaded kernel handle
pub struct Kernel {
    /// Kernel name
    name: String,

    /// Backend the kernel was loaded on
    backend: GpuBackend,

    /// Parameter signature, used to check launch arguments
    params: Vec<GpuParam>,

    handle: KernelHandle,
}

enum KernelHandle {
    Simulated(GpuKernel),
    #[cfg(feature = "cuda")]
    Cuda(cust::module::Module),
}

impl Kernel {
    /// Get the kernel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the parameter count
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[GpuParam] {
        &self.params
    }

    pub fn backend(&self) -> GpuBackend {
        self.backend
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Launch configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Grid dimensions (blocks)
    pub grid: (u32, u32, u32),

    /// Block dimensions (threads)
    pub block: (u32, u32, u32),

    /// Dynamic shared memory size
    pub shared_mem: u32,
}

impl LaunchConfig {
    pub fn new(grid: (u32, u32, u32), block: (u32, u32, u32)) -> Self {
        Self {
            grid,
            block,
            shared_mem: 0,
        }
    }

    /// Create a 1D launch configuration
    pub fn new_1d(grid_size: u32, block_size: u32) -> Self {
        Self::new((grid_size, 1, 1), (block_size, 1, 1))
    }

    /// One block of one thread
    pub fn single() -> Self {
        Self::new_1d(1, 1)
    }

    pub fn with_shared_mem(mut self, size: u32) -> Self {
        self.shared_mem = size;
        self
    }

    pub fn total_threads(&self) -> u64 {
        self.total_blocks() * self.threads_per_block()
    }

    pub fn total_blocks(&self) -> u64 {
        self.grid.0 as u64 * self.grid.1 as u64 * self.grid.2 as u64
    }

    pub fn threads_per_block(&self) -> u64 {
        self.block.0 as u64 * self.block.1 as u64 * self.block.2 as u64
    }

    /// Validate the launch configuration against device limits
    pub fn validate(&self, device_info: &DeviceInfo) -> Result<(), GpuError> {
        if self.total_blocks() == 0 || self.threads_per_block() == 0 {
            return Err(GpuError::InvalidConfig(format!(
                "Grid {:?} and block {:?} must be non-zero in every dimension",
                self.grid, self.block
            )));
        }

        let threads = self.threads_per_block();
        if threads > device_info.max_threads_per_block as u64 {
            return Err(GpuError::InvalidConfig(format!(
                "Threads per block ({}) exceeds maximum ({})",
                threads, device_info.max_threads_per_block
            )));
        }

        if self.shared_mem > device_info.shared_mem_per_block {
            return Err(GpuError::InvalidConfig(format!(
                "Shared memory ({}) exceeds maximum ({})",
                self.shared_mem, device_info.shared_mem_per_block
            )));
        }

        Ok(())
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self::new((1, 1, 1), (256, 1, 1))
    }
}

/// Kernel argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Ptr(DevicePtr),
}

impl KernelArg {
    /// Create a pointer argument from a DeviceBuffer
    pub fn from_buffer(buffer: &DeviceBuffer) -> Self {
        KernelArg::Ptr(buffer.ptr)
    }

    /// Raw value, zero-extended to 64 bits
    pub fn bits(&self) -> u64 {
        match *self {
            KernelArg::I32(v) => v as u32 as u64,
            KernelArg::U32(v) => v as u64,
            KernelArg::I64(v) => v as u64,
            KernelArg::U64(v) => v,
            KernelArg::Ptr(p) => p.0,
        }
    }

    /// Whether this argument can be bound to a parameter of type `ty`
    pub fn matches(&self, ty: &GpuType) -> bool {
        matches!(
            (self, ty),
            (KernelArg::I32(_), GpuType::I32)
                | (KernelArg::U32(_), GpuType::U32)
                | (KernelArg::I64(_), GpuType::I64)
                | (KernelArg::U64(_), GpuType::U64)
                | (KernelArg::Ptr(_), GpuType::Ptr(_, _))
        )
    }

    fn type_name(&self) -> &'static str {
        match self {
            KernelArg::I32(_) => "i32",
            KernelArg::U32(_) => "u32",
            KernelArg::I64(_) => "i64",
            KernelArg::U64(_) => "u64",
            KernelArg::Ptr(_) => "pointer",
        }
    }
}

/// Plain scalar that can be copied between host and device memory.
///
/// Device memory is little-endian on every supported backend.
pub trait DeviceScalar: Copy + Default + 'static {
    const SIZE: usize;

    fn write_le(self, out: &mut Vec<u8>);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_device_scalar {
    ($($ty:ty),* $(,)?) => {
        $(
            impl DeviceScalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn write_le(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_device_scalar!(u8, i32, u32, i64, u64, f32, f64);

impl GpuRuntime {
    /// Initialize GPU runtime
    pub fn new(backend: GpuBackend, device_id: u32) -> Result<Self, GpuError> {
        match backend {
            GpuBackend::Cuda => Self::init_cuda(device_id),
            GpuBackend::Simulated => Self::init_simulated(device_id),
        }
    }

    /// Initialize the runtime the user asked for; `Auto` prefers CUDA
    pub fn select(choice: BackendChoice, device_id: u32) -> Result<Self, GpuError> {
        match choice {
            BackendChoice::Cuda => Self::new(GpuBackend::Cuda, device_id),
            BackendChoice::Simulated => Self::new(GpuBackend::Simulated, device_id),
            BackendChoice::Auto => match Self::new(GpuBackend::Cuda, device_id) {
                Ok(runtime) => Ok(runtime),
                Err(err) => {
                    tracing::debug!(error = %err, "CUDA unavailable, using the simulated device");
                    Self::new(GpuBackend::Simulated, device_id)
                }
            },
        }
    }

    /// Get the backend type
    pub fn backend(&self) -> GpuBackend {
        self.backend
    }

    /// Get the device ID
    pub fn device_id(&self) -> u32 {
        self.device
    }

    /// Get device properties
    pub fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    /// Allocate device memory
    pub fn alloc(&self, size: usize) -> Result<DeviceBuffer, GpuError> {
        if size == 0 {
            return Err(GpuError::InvalidSize);
        }

        let ptr = match &self.inner {
            DeviceImpl::Simulated(sim) => sim.alloc(size)?,
            #[cfg(feature = "cuda")]
            DeviceImpl::Cuda(cuda) => cuda.alloc(size)?,
        };
        tracing::trace!(%ptr, size, backend = %self.backend, "allocated device buffer");

        Ok(DeviceBuffer {
            ptr,
            size,
            backend: self.backend,
        })
    }

    /// Allocate typed device memory
    pub fn alloc_typed<T: DeviceScalar>(&self, count: usize) -> Result<DeviceBuffer, GpuError> {
        let size = count.checked_mul(T::SIZE).ok_or(GpuError::InvalidSize)?;
        self.alloc(size)
    }

    /// Free device memory
    pub fn free(&self, buffer: DeviceBuffer) -> Result<(), GpuError> {
        match &self.inner {
            DeviceImpl::Simulated(sim) => sim.free(buffer.ptr),
            #[cfg(feature = "cuda")]
            DeviceImpl::Cuda(cuda) => cuda.free(buffer.ptr),
        }
    }

    /// Copy data to device
    pub fn copy_to_device<T: DeviceScalar>(
        &self,
        dst: &DeviceBuffer,
        src: &[T],
    ) -> Result<(), GpuError> {
        let size = src.len() * T::SIZE;
        if size > dst.size {
            return Err(GpuError::BufferTooSmall {
                needed: size,
                available: dst.size,
            });
        }

        let mut bytes = Vec::with_capacity(size);
        for value in src {
            value.write_le(&mut bytes);
        }

        match &self.inner {
            DeviceImpl::Simulated(sim) => sim.write(dst.ptr, &bytes),
            #[cfg(feature = "cuda")]
            DeviceImpl::Cuda(cuda) => cuda.write(dst.ptr, dst.size, &bytes),
        }
    }

    /// Copy data from device
    pub fn copy_to_host<T: DeviceScalar>(
        &self,
        dst: &mut [T],
        src: &DeviceBuffer,
    ) -> Result<(), GpuError> {
        let size = dst.len() * T::SIZE;
        if size > src.size {
            return Err(GpuError::BufferTooSmall {
                needed: size,
                available: src.size,
            });
        }

        let mut bytes = vec![0u8; size];
        match &self.inner {
            DeviceImpl::Simulated(sim) => sim.read(src.ptr, &mut bytes)?,
            #[cfg(feature = "cuda")]
            DeviceImpl::Cuda(cuda) => cuda.read(src.ptr, src.size, &mut bytes)?,
        }

        for (out, chunk) in dst.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
            *out = T::read_le(chunk);
        }
        Ok(())
    }

    /// Load `kernel_name` from an IR module
    ///
    /// The CUDA backend lowers the whole module to PTX and JIT-loads it; the
    /// simulated backend keeps the kernel's IR.
    pub fn load_module(&self, module: &GpuModule, kernel_name: &str) -> Result<Kernel, GpuError> {
        let kernel = module.kernel(kernel_name).ok_or_else(|| {
            GpuError::KernelLoadFailed(format!(
                "module `{}` has no kernel named `{}`",
                module.name, kernel_name
            ))
        })?;
        kernel
            .value_types()
            .map_err(|e| GpuError::KernelLoadFailed(e.to_string()))?;

        let handle = match &self.inner {
            DeviceImpl::Simulated(_) => KernelHandle::Simulated(kernel.clone()),
            #[cfg(feature = "cuda")]
            DeviceImpl::Cuda(cuda) => KernelHandle::Cuda(cuda.load(module)?),
        };
        tracing::debug!(kernel = kernel_name, backend = %self.backend, "loaded kernel");

        Ok(Kernel {
            name: kernel.name.clone(),
            backend: self.backend,
            params: kernel.params.clone(),
            handle,
        })
    }

    /// Launch kernel
    pub fn launch(
        &self,
        kernel: &Kernel,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> Result<(), GpuError> {
        // Validate configuration
        config.validate(&self.device_info)?;
        check_args(kernel, args)?;

        tracing::debug!(
            kernel = kernel.name(),
            grid = ?config.grid,
            block = ?config.block,
            "launching kernel"
        );

        match (&self.inner, &kernel.handle) {
            (DeviceImpl::Simulated(sim), KernelHandle::Simulated(ir)) => {
                let params: Vec<u64> = args.iter().map(KernelArg::bits).collect();
                sim.execute(ir, config, &params)
            }
            #[cfg(feature = "cuda")]
            (DeviceImpl::Cuda(cuda), KernelHandle::Cuda(module)) => {
                cuda.launch(module, &kernel.name, config, args)
            }
            #[allow(unreachable_patterns)]
            _ => Err(GpuError::KernelBackendMismatch {
                kernel: kernel.name.clone(),
                kernel_backend: kernel.backend,
                runtime_backend: self.backend,
            }),
        }
    }

    /// Synchronize device
    pub fn synchronize(&self) -> Result<(), GpuError> {
        match &self.inner {
            DeviceImpl::Simulated(_) => Ok(()),
            #[cfg(feature = "cuda")]
            DeviceImpl::Cuda(cuda) => cuda.synchronize(),
        }
    }

    // === CUDA Implementation ===

    #[cfg(feature = "cuda")]
    fn init_cuda(device_id: u32) -> Result<Self, GpuError> {
        let (device, device_info) = CudaDevice::open(device_id)?;
        tracing::info!(device = device_id, name = %device_info.name, "initialized CUDA device");
        Ok(Self {
            backend: GpuBackend::Cuda,
            device: device_id,
            device_info,
            inner: DeviceImpl::Cuda(device),
        })
    }

    #[cfg(not(feature = "cuda"))]
    fn init_cuda(_device_id: u32) -> Result<Self, GpuError> {
        Err(GpuError::BackendUnavailable {
            backend: GpuBackend::Cuda,
            reason: "built without the `cuda` feature".to_string(),
        })
    }

    // === Simulated Implementation ===

    fn init_simulated(device_id: u32) -> Result<Self, GpuError> {
        if device_id != 0 {
            return Err(GpuError::DeviceNotFound(device_id));
        }
        let device_info = DeviceInfo::default_simulated();
        Ok(Self {
            backend: GpuBackend::Simulated,
            device: device_id,
            inner: DeviceImpl::Simulated(SimDevice::new(device_info.total_memory)),
            device_info,
        })
    }
}

fn check_args(kernel: &Kernel, args: &[KernelArg]) -> Result<(), GpuError> {
    if args.len() != kernel.params.len() {
        return Err(GpuError::ArgumentCount {
            kernel: kernel.name.clone(),
            expected: kernel.params.len(),
            found: args.len(),
        });
    }

    for (index, (param, arg)) in kernel.params.iter().zip(args).enumerate() {
        if !arg.matches(&param.ty) {
            return Err(GpuError::ArgumentType {
                kernel: kernel.name.clone(),
                index,
                expected: param.ty.to_string(),
                found: arg.type_name(),
            });
        }
    }

    Ok(())
}

/// Device information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub compute_capability: (u32, u32),
    pub total_memory: u64,
    pub multiprocessors: u32,
    pub max_threads_per_block: u32,
    pub warp_size: u32,
    pub shared_mem_per_block: u32,
    pub clock_rate_khz: u32,
}

impl DeviceInfo {
    pub(crate) fn default_simulated() -> Self {
        Self {
            name: "Simulated GPU".to_string(),
            compute_capability: (7, 5),
            total_memory: 64 * 1024 * 1024, // 64 MiB
            multiprocessors: 1,
            max_threads_per_block: 1024,
            warp_size: 32,
            shared_mem_per_block: 48 * 1024,
            clock_rate_khz: 1000000,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(
            f,
            "  Compute capability: {}.{}",
            self.compute_capability.0, self.compute_capability.1
        )?;
        writeln!(f, "  Total memory:       {} MiB", self.total_memory / (1024 * 1024))?;
        writeln!(f, "  Multiprocessors:    {}", self.multiprocessors)?;
        writeln!(f, "  Max threads/block:  {}", self.max_threads_per_block)?;
        writeln!(f, "  Warp size:          {}", self.warp_size)?;
        writeln!(f, "  Shared mem/block:   {} KiB", self.shared_mem_per_block / 1024)?;
        write!(f, "  Clock rate:         {} MHz", self.clock_rate_khz / 1000)
    }
}

/// GPU errors
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU initialization failed: {0}")]
    InitFailed(String),

    #[error("GPU device {0} not found")]
    DeviceNotFound(u32),

    #[error("{backend} backend is not available: {reason}")]
    BackendUnavailable { backend: GpuBackend, reason: String },

    #[error("GPU memory allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Out of GPU memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: u64 },

    #[error("GPU memory copy failed: {0}")]
    CopyFailed(String),

    #[error("Buffer too small for operation: need {needed} bytes, buffer holds {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Invalid device address {address:#x} (+{len} bytes)")]
    InvalidAddress { address: u64, len: usize },

    #[error("Invalid size")]
    InvalidSize,

    #[error("Failed to load GPU kernel: {0}")]
    KernelLoadFailed(String),

    #[error("Kernel `{kernel}` was loaded on {kernel_backend}, runtime is {runtime_backend}")]
    KernelBackendMismatch {
        kernel: String,
        kernel_backend: GpuBackend,
        runtime_backend: GpuBackend,
    },

    #[error("Kernel `{kernel}` takes {expected} arguments, {found} given")]
    ArgumentCount {
        kernel: String,
        expected: usize,
        found: usize,
    },

    #[error("Kernel `{kernel}` argument {index}: expected `{expected}`, found {found}")]
    ArgumentType {
        kernel: String,
        index: usize,
        expected: String,
        found: &'static str,
    },

    #[error("Invalid launch configuration: {0}")]
    InvalidConfig(String),

    #[error("Kernel launch failed: {0}")]
    LaunchFailed(String),

    #[error("GPU synchronization failed: {0}")]
    SyncFailed(String),

    #[error("GPU driver error: {0}")]
    Driver(String),
}
