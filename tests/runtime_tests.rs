//! GPU runtime tests against the simulated device

use proptest::prelude::*;
use ptxsmoke::gpu::{
    ADD_KERNEL, DeviceInfo, GpuBackend, GpuError, GpuModule, GpuOp, GpuRuntime, GpuTarget,
    GpuTerminator, GpuType, IOTA_KERNEL, KernelArg, KernelBuilder, LaunchConfig, MemorySpace,
    smoke_module,
};

fn runtime() -> GpuRuntime {
    GpuRuntime::new(GpuBackend::Simulated, 0).expect("simulated runtime")
}

fn run_add(runtime: &GpuRuntime, a: i32, b: i32) -> Result<i32, GpuError> {
    let module = smoke_module(GpuTarget::Simulated);
    let kernel = runtime.load_module(&module, ADD_KERNEL)?;
    let c = runtime.alloc_typed::<i32>(1)?;
    runtime.launch(
        &kernel,
        &LaunchConfig::single(),
        &[KernelArg::I32(a), KernelArg::I32(b), KernelArg::from_buffer(&c)],
    )?;
    runtime.synchronize()?;
    let mut out = [0i32];
    runtime.copy_to_host(&mut out, &c)?;
    runtime.free(c)?;
    Ok(out[0])
}

#[test]
fn test_add_kernel() {
    assert_eq!(run_add(&runtime(), 2, 7).unwrap(), 9);
}

#[test]
fn test_copy_roundtrip() {
    let rt = runtime();
    let buf = rt.alloc_typed::<u32>(4).unwrap();
    assert_eq!(buf.size(), 16);
    assert_eq!(buf.backend(), GpuBackend::Simulated);

    rt.copy_to_device(&buf, &[1u32, 2, 3, 4]).unwrap();
    let mut host = [0u32; 4];
    rt.copy_to_host(&mut host, &buf).unwrap();
    assert_eq!(host, [1, 2, 3, 4]);
}

#[test]
fn test_partial_copy() {
    let rt = runtime();
    let buf = rt.alloc_typed::<i64>(4).unwrap();
    rt.copy_to_device(&buf, &[-5i64]).unwrap();

    let mut host = [0i64; 2];
    rt.copy_to_host(&mut host, &buf).unwrap();
    assert_eq!(host, [-5, 0]);
}

#[test]
fn test_copy_larger_than_buffer() {
    let rt = runtime();
    let buf = rt.alloc_typed::<i32>(1).unwrap();

    let err = rt.copy_to_device(&buf, &[1i32, 2]).unwrap_err();
    assert!(matches!(
        err,
        GpuError::BufferTooSmall {
            needed: 8,
            available: 4
        }
    ));

    let mut host = [0i32; 3];
    assert!(matches!(
        rt.copy_to_host(&mut host, &buf),
        Err(GpuError::BufferTooSmall { .. })
    ));
}

#[test]
fn test_double_free() {
    let rt = runtime();
    let buf = rt.alloc(8).unwrap();
    let ptr = buf.ptr();
    rt.free(buf).unwrap();

    let err = rt.launch(
        &rt.load_module(&smoke_module(GpuTarget::Simulated), ADD_KERNEL)
            .unwrap(),
        &LaunchConfig::single(),
        &[KernelArg::I32(1), KernelArg::I32(2), KernelArg::Ptr(ptr)],
    );
    assert!(matches!(err, Err(GpuError::InvalidAddress { .. })));
}

#[test]
fn test_launch_rejects_oversized_block() {
    let rt = runtime();
    let kernel = rt
        .load_module(&smoke_module(GpuTarget::Simulated), ADD_KERNEL)
        .unwrap();
    let c = rt.alloc_typed::<i32>(1).unwrap();
    let limit = rt.device_info().max_threads_per_block;

    let err = rt
        .launch(
            &kernel,
            &LaunchConfig::new_1d(1, limit + 1),
            &[KernelArg::I32(2), KernelArg::I32(7), KernelArg::from_buffer(&c)],
        )
        .unwrap_err();
    assert!(matches!(err, GpuError::InvalidConfig(_)));
}

#[test]
fn test_iota_over_grid() {
    let rt = runtime();
    let kernel = rt
        .load_module(&smoke_module(GpuTarget::Simulated), IOTA_KERNEL)
        .unwrap();

    // 3 blocks of 4 threads cover 12 slots; only the first 10 are written.
    let n = 10u32;
    let out = rt.alloc_typed::<u32>(12).unwrap();
    rt.copy_to_device(&out, &[u32::MAX; 12]).unwrap();
    rt.launch(
        &kernel,
        &LaunchConfig::new_1d(3, 4),
        &[KernelArg::from_buffer(&out), KernelArg::U32(n)],
    )
    .unwrap();

    let mut host = [0u32; 12];
    rt.copy_to_host(&mut host, &out).unwrap();
    assert_eq!(host, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, u32::MAX, u32::MAX]);
}

#[test]
fn test_kernel_reads_device_memory() {
    // double(p: *global i64) { *p = *p + *p; }
    let mut b = KernelBuilder::new("double");
    b.param("p", GpuType::global_ptr(GpuType::I64));
    let p = b.push(GpuOp::Param(0));
    let v = b.push(GpuOp::Load(p, GpuType::I64, MemorySpace::Global));
    let sum = b.push(GpuOp::Add(v, v));
    b.push(GpuOp::Store(p, sum, MemorySpace::Global));
    b.terminate(GpuTerminator::ReturnVoid);

    let mut module = GpuModule::new("double", GpuTarget::Simulated);
    module.add_kernel(b.finish());

    let rt = runtime();
    let kernel = rt.load_module(&module, "double").unwrap();
    let buf = rt.alloc_typed::<i64>(1).unwrap();
    rt.copy_to_device(&buf, &[-21i64]).unwrap();
    rt.launch(&kernel, &LaunchConfig::single(), &[KernelArg::from_buffer(&buf)])
        .unwrap();

    let mut host = [0i64];
    rt.copy_to_host(&mut host, &buf).unwrap();
    assert_eq!(host, [-42]);
}

#[test]
fn test_load_rejects_invalid_kernel() {
    let mut b = KernelBuilder::new("broken");
    b.push(GpuOp::Add(ptxsmoke::gpu::ValueId(40), ptxsmoke::gpu::ValueId(41)));
    b.terminate(GpuTerminator::ReturnVoid);
    let mut module = GpuModule::new("broken", GpuTarget::Simulated);
    module.add_kernel(b.finish());

    let err = runtime().load_module(&module, "broken").unwrap_err();
    assert!(matches!(err, GpuError::KernelLoadFailed(_)));
}

#[test]
fn test_device_info_limits() {
    let rt = runtime();
    let info: &DeviceInfo = rt.device_info();
    assert_eq!(info.compute_capability, (7, 5));
    assert_eq!(info.warp_size, 32);
    assert!(info.max_threads_per_block >= 1);
}

proptest! {
    #[test]
    fn prop_add_wraps(a in any::<i32>(), b in any::<i32>()) {
        let rt = runtime();
        prop_assert_eq!(run_add(&rt, a, b).unwrap(), a.wrapping_add(b));
    }
}
