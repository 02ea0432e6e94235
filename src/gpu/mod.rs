//! GPU support for the smoke test
//!
//! Architecture:
//! ```text
//! kernels -> GpuIR -> PTX -> CUDA driver -> GPU
//!                  \-> simulated device (IR interpreter)
//! ```

pub mod ir;
pub mod kernels;
pub mod ptx;
pub mod runtime;
mod sim;
#[cfg(feature = "cuda")]
mod cuda;

pub use ir::{
    BlockId, GpuBlock, GpuKernel, GpuModule, GpuOp, GpuParam, GpuTarget, GpuTerminator, GpuType,
    IrError, KernelBuilder, MemorySpace, ValueId,
};
pub use kernels::{ADD_KERNEL, IOTA_KERNEL, add_kernel, iota_kernel, smoke_module};
pub use ptx::{PtxCodegen, PtxError, min_ptx_version};
pub use runtime::{
    BackendChoice, DeviceBuffer, DeviceInfo, DevicePtr, DeviceScalar, GpuBackend, GpuError,
    GpuRuntime, Kernel, KernelArg, LaunchConfig,
};
