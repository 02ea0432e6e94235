//! CUDA driver backend, built with the `cuda` feature.
//!
//! Kernels are lowered to PTX by [`PtxCodegen`] and JIT-loaded by the driver.

use std::cell::RefCell;
use std::ffi::c_void;

use cust::context::Context;
use cust::device::{Device, DeviceAttribute};
use cust::error::CudaError;
use cust::memory::{CopyDestination, DeviceBuffer};
use cust::module::Module;
use cust::stream::{Stream, StreamFlags};
use cust::CudaFlags;
use rustc_hash::FxHashMap;

use super::ir::{GpuModule, GpuTarget};
use super::ptx::PtxCodegen;
use super::runtime::{DeviceInfo, DevicePtr, GpuError, KernelArg, LaunchConfig};

/// One CUDA device with its own context and stream
pub(crate) struct CudaDevice {
    // Dropped before the context they belong to.
    buffers: RefCell<FxHashMap<u64, DeviceBuffer<u8>>>,
    stream: Stream,
    compute_capability: (u32, u32),
    _context: Context,
}

impl CudaDevice {
    pub fn open(device_id: u32) -> Result<(Self, DeviceInfo), GpuError> {
        cust::init(CudaFlags::empty()).map_err(init_failed)?;

        let count = Device::num_devices().map_err(init_failed)?;
        if device_id >= count {
            return Err(GpuError::DeviceNotFound(device_id));
        }

        let device = Device::get_device(device_id).map_err(init_failed)?;
        let context = Context::new(device).map_err(init_failed)?;
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None).map_err(init_failed)?;
        let info = query_device(&device)?;

        Ok((
            Self {
                buffers: RefCell::new(FxHashMap::default()),
                stream,
                compute_capability: info.compute_capability,
                _context: context,
            },
            info,
        ))
    }

    pub fn alloc(&self, size: usize) -> Result<DevicePtr, GpuError> {
        let buffer = DeviceBuffer::<u8>::zeroed(size).map_err(|e| match e {
            CudaError::OutOfMemory => GpuError::OutOfMemory {
                requested: size,
                available: cust::memory::mem_get_info()
                    .map(|(free, _)| free as u64)
                    .unwrap_or(0),
            },
            other => GpuError::AllocationFailed(other.to_string()),
        })?;
        let address = buffer.as_device_ptr().as_raw();
        self.buffers.borrow_mut().insert(address, buffer);
        Ok(DevicePtr(address))
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<(), GpuError> {
        let buffer = self
            .buffers
            .borrow_mut()
            .remove(&ptr.0)
            .ok_or(GpuError::InvalidAddress {
                address: ptr.0,
                len: 0,
            })?;
        DeviceBuffer::drop(buffer).map_err(|(e, _)| GpuError::Driver(e.to_string()))
    }

    /// Write `bytes` at the start of the `size`-byte buffer at `ptr`
    pub fn write(&self, ptr: DevicePtr, size: usize, bytes: &[u8]) -> Result<(), GpuError> {
        let mut buffers = self.buffers.borrow_mut();
        let buffer = buffers.get_mut(&ptr.0).ok_or(GpuError::InvalidAddress {
            address: ptr.0,
            len: bytes.len(),
        })?;

        // Driver copies move whole buffers.
        let mut staging = vec![0u8; size];
        if bytes.len() < size {
            buffer.copy_to(&mut staging[..]).map_err(copy_failed)?;
        }
        staging[..bytes.len()].copy_from_slice(bytes);
        buffer.copy_from(&staging[..]).map_err(copy_failed)
    }

    /// Read the first `out.len()` bytes of the `size`-byte buffer at `ptr`
    pub fn read(&self, ptr: DevicePtr, size: usize, out: &mut [u8]) -> Result<(), GpuError> {
        let buffers = self.buffers.borrow();
        let buffer = buffers.get(&ptr.0).ok_or(GpuError::InvalidAddress {
            address: ptr.0,
            len: out.len(),
        })?;

        let mut staging = vec![0u8; size];
        buffer.copy_to(&mut staging[..]).map_err(copy_failed)?;
        out.copy_from_slice(&staging[..out.len()]);
        Ok(())
    }

    pub fn load(&self, module: &GpuModule) -> Result<Module, GpuError> {
        let target = GpuTarget::Cuda {
            compute_capability: self.compute_capability,
        };
        let ptx = PtxCodegen::for_target(target)
            .generate(module)
            .map_err(|e| GpuError::KernelLoadFailed(e.to_string()))?;
        tracing::trace!(module = %module.name, bytes = ptx.len(), "JIT-loading PTX");
        Module::from_ptx(&ptx, &[]).map_err(|e| GpuError::KernelLoadFailed(e.to_string()))
    }

    pub fn launch(
        &self,
        module: &Module,
        name: &str,
        config: &LaunchConfig,
        args: &[KernelArg],
    ) -> Result<(), GpuError> {
        let function = module
            .get_function(name)
            .map_err(|e| GpuError::KernelLoadFailed(format!("{}: {}", name, e)))?;

        // The driver reads each parameter's width from the front of its slot,
        // which holds the low bytes on a little-endian host.
        let mut slots: Vec<u64> = args.iter().map(KernelArg::bits).collect();
        let params: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut u64 as *mut c_void)
            .collect();

        let result = unsafe {
            self.stream.launch(
                &function,
                config.grid,
                config.block,
                config.shared_mem,
                &params,
            )
        };
        result.map_err(|e| GpuError::LaunchFailed(e.to_string()))
    }

    pub fn synchronize(&self) -> Result<(), GpuError> {
        self.stream
            .synchronize()
            .map_err(|e| GpuError::SyncFailed(e.to_string()))
    }
}

fn query_device(device: &Device) -> Result<DeviceInfo, GpuError> {
    let attr = |attribute: DeviceAttribute| {
        device
            .get_attribute(attribute)
            .map(|v| v as u32)
            .map_err(|e| GpuError::Driver(e.to_string()))
    };

    Ok(DeviceInfo {
        name: device.name().map_err(|e| GpuError::Driver(e.to_string()))?,
        compute_capability: (
            attr(DeviceAttribute::ComputeCapabilityMajor)?,
            attr(DeviceAttribute::ComputeCapabilityMinor)?,
        ),
        total_memory: device
            .total_memory()
            .map_err(|e| GpuError::Driver(e.to_string()))? as u64,
        multiprocessors: attr(DeviceAttribute::MultiprocessorCount)?,
        max_threads_per_block: attr(DeviceAttribute::MaxThreadsPerBlock)?,
        warp_size: attr(DeviceAttribute::WarpSize)?,
        shared_mem_per_block: attr(DeviceAttribute::MaxSharedMemoryPerBlock)?,
        clock_rate_khz: attr(DeviceAttribute::ClockRate)?,
    })
}

fn init_failed(e: CudaError) -> GpuError {
    GpuError::InitFailed(e.to_string())
}

fn copy_failed(e: CudaError) -> GpuError {
    GpuError::CopyFailed(e.to_string())
}
