//! Built-in kernels
//!
//! The smoke test needs exactly one kernel:
//!
//! ```text
//! __global__ void add(int a, int b, int *c) { *c = a + b; }
//! ```
//!
//! `iota` is a second, grid-strided kernel used to exercise the launch path
//! with more than one thread.

use super::ir::{GpuKernel, GpuModule, GpuOp, GpuTarget, GpuTerminator, GpuType, KernelBuilder, MemorySpace};

/// Name of the addition kernel
pub const ADD_KERNEL: &str = "add";

/// Name of the index-fill kernel
pub const IOTA_KERNEL: &str = "iota";

/// `add(a: i32, b: i32, c: *global i32)`: stores `a + b` into `*c`
pub fn add_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new(ADD_KERNEL);
    b.param("a", GpuType::I32);
    b.param("b", GpuType::I32);
    b.param("c", GpuType::global_ptr(GpuType::I32));

    let a = b.push(GpuOp::Param(0));
    let rhs = b.push(GpuOp::Param(1));
    let c = b.push(GpuOp::Param(2));
    let c = b.push(GpuOp::ToGlobal(c));
    let sum = b.push(GpuOp::Add(a, rhs));
    b.push(GpuOp::Store(c, sum, MemorySpace::Global));
    b.terminate(GpuTerminator::ReturnVoid);

    b.finish()
}

/// `iota(out: *global u32, n: u32)`: `out[i] = i` for every global thread `i < n`
pub fn iota_kernel() -> GpuKernel {
    let mut b = KernelBuilder::new(IOTA_KERNEL);
    b.param("out", GpuType::global_ptr(GpuType::U32));
    b.param("n", GpuType::U32);

    let store = b.block("store");
    let done = b.block("done");

    let out = b.push(GpuOp::Param(0));
    let n = b.push(GpuOp::Param(1));
    let tid = b.push(GpuOp::ThreadIdX);
    let bid = b.push(GpuOp::BlockIdX);
    let bdim = b.push(GpuOp::BlockDimX);
    let base = b.push(GpuOp::Mul(bid, bdim));
    let i = b.push(GpuOp::Add(base, tid));
    let in_bounds = b.push(GpuOp::Lt(i, n));
    b.terminate(GpuTerminator::CondBr(in_bounds, store, done));

    b.switch_to(store);
    let out = b.push(GpuOp::ToGlobal(out));
    let slot = b.push(GpuOp::GetElementPtr(out, i, GpuType::U32));
    b.push(GpuOp::Store(slot, i, MemorySpace::Global));
    b.terminate(GpuTerminator::Br(done));

    b.switch_to(done);
    b.terminate(GpuTerminator::ReturnVoid);

    b.finish()
}

/// Module holding every built-in kernel for `target`
pub fn smoke_module(target: GpuTarget) -> GpuModule {
    let mut module = GpuModule::new("smoke", target);
    module.add_kernel(add_kernel());
    module.add_kernel(iota_kernel());
    module
}
