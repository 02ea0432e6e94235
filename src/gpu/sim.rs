//! Simulated GPU device
//!
//! Runs kernels on the host by interpreting their IR one thread at a time,
//! block by block. Device memory is a table of host allocations handed out at
//! 256-byte aligned addresses, so a null or stale pointer faults the launch
//! instead of touching host memory.

use std::cell::RefCell;
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::ir::{BlockId, GpuBlock, GpuKernel, GpuOp, GpuTerminator, GpuType, MemorySpace, ValueId};
use super::runtime::{DevicePtr, GpuError, LaunchConfig};

/// First address handed out; above 4 GiB so truncated pointers fault
const BASE_ADDRESS: u64 = 0x1_0000_0000;

/// Allocation granularity
const ALIGNMENT: u64 = 256;

/// Per-thread bound on executed instructions and branches
pub(crate) const MAX_STEPS_PER_THREAD: u64 = 1_000_000;

/// Device memory of the simulated GPU
#[derive(Debug)]
pub(crate) struct SimMemory {
    allocations: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    capacity: u64,
    in_use: u64,
}

impl SimMemory {
    pub fn new(capacity: u64) -> Self {
        Self {
            allocations: BTreeMap::new(),
            next_address: BASE_ADDRESS,
            capacity,
            in_use: 0,
        }
    }

    pub fn alloc(&mut self, size: usize) -> Result<DevicePtr, GpuError> {
        let available = self.capacity - self.in_use;
        if size as u64 > available {
            return Err(GpuError::OutOfMemory {
                requested: size,
                available,
            });
        }

        let address = self.next_address;
        // Leave a gap after every allocation so overruns hit unmapped memory.
        // Freed ranges are not reused; an exhausted address space is out of memory.
        let next = (size as u64)
            .div_ceil(ALIGNMENT)
            .checked_mul(ALIGNMENT)
            .and_then(|span| span.checked_add(ALIGNMENT))
            .and_then(|span| address.checked_add(span))
            .ok_or(GpuError::OutOfMemory {
                requested: size,
                available,
            })?;
        self.next_address = next;
        self.in_use += size as u64;
        self.allocations.insert(address, vec![0; size]);

        Ok(DevicePtr(address))
    }

    pub fn free(&mut self, ptr: DevicePtr) -> Result<(), GpuError> {
        match self.allocations.remove(&ptr.0) {
            Some(data) => {
                self.in_use -= data.len() as u64;
                Ok(())
            }
            None => Err(GpuError::InvalidAddress {
                address: ptr.0,
                len: 0,
            }),
        }
    }

    pub fn read(&self, ptr: DevicePtr, out: &mut [u8]) -> Result<(), GpuError> {
        let fault = || GpuError::InvalidAddress {
            address: ptr.0,
            len: out.len(),
        };
        let (base, data) = self.allocations.range(..=ptr.0).next_back().ok_or_else(fault)?;
        let start = (ptr.0 - base) as usize;
        let bytes = data.get(start..start + out.len()).ok_or_else(fault)?;
        out.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write(&mut self, ptr: DevicePtr, bytes: &[u8]) -> Result<(), GpuError> {
        let fault = || GpuError::InvalidAddress {
            address: ptr.0,
            len: bytes.len(),
        };
        let (base, data) = self
            .allocations
            .range_mut(..=ptr.0)
            .next_back()
            .ok_or_else(fault)?;
        let start = (ptr.0 - base) as usize;
        let slot = data.get_mut(start..start + bytes.len()).ok_or_else(fault)?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    #[cfg(test)]
    pub fn in_use(&self) -> u64 {
        self.in_use
    }

    #[cfg(test)]
    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }
}

/// In-process device that executes GPU IR
#[derive(Debug)]
pub(crate) struct SimDevice {
    memory: RefCell<SimMemory>,
}

impl SimDevice {
    pub fn new(capacity: u64) -> Self {
        Self {
            memory: RefCell::new(SimMemory::new(capacity)),
        }
    }

    pub fn alloc(&self, size: usize) -> Result<DevicePtr, GpuError> {
        self.memory.borrow_mut().alloc(size)
    }

    pub fn free(&self, ptr: DevicePtr) -> Result<(), GpuError> {
        self.memory.borrow_mut().free(ptr)
    }

    pub fn read(&self, ptr: DevicePtr, out: &mut [u8]) -> Result<(), GpuError> {
        self.memory.borrow().read(ptr, out)
    }

    pub fn write(&self, ptr: DevicePtr, bytes: &[u8]) -> Result<(), GpuError> {
        self.memory.borrow_mut().write(ptr, bytes)
    }

    #[cfg(test)]
    pub fn memory(&self) -> std::cell::Ref<'_, SimMemory> {
        self.memory.borrow()
    }

    /// Run `kernel` over the whole grid. `params` holds the raw bits of each
    /// argument, already checked against the kernel signature.
    pub fn execute(
        &self,
        kernel: &GpuKernel,
        config: &LaunchConfig,
        params: &[u64],
    ) -> Result<(), GpuError> {
        let types = kernel
            .value_types()
            .map_err(|e| GpuError::LaunchFailed(e.to_string()))?;
        let blocks: FxHashMap<BlockId, &GpuBlock> =
            kernel.blocks.iter().map(|b| (b.id, b)).collect();
        let mut memory = self.memory.borrow_mut();

        let (gx, gy, gz) = config.grid;
        let (bx, by, bz) = config.block;
        for block_z in 0..gz {
            for block_y in 0..gy {
                for block_x in 0..gx {
                    for thread_z in 0..bz {
                        for thread_y in 0..by {
                            for thread_x in 0..bx {
                                let mut thread = Thread {
                                    kernel,
                                    blocks: &blocks,
                                    types: &types,
                                    params,
                                    memory: &mut *memory,
                                    tid: (thread_x, thread_y, thread_z),
                                    ctaid: (block_x, block_y, block_z),
                                    ntid: config.block,
                                    nctaid: config.grid,
                                    values: FxHashMap::default(),
                                    steps: 0,
                                };
                                thread.run()?;
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Execution state of one GPU thread
struct Thread<'a> {
    kernel: &'a GpuKernel,
    blocks: &'a FxHashMap<BlockId, &'a GpuBlock>,
    types: &'a FxHashMap<ValueId, GpuType>,
    params: &'a [u64],
    memory: &'a mut SimMemory,
    tid: (u32, u32, u32),
    ctaid: (u32, u32, u32),
    ntid: (u32, u32, u32),
    nctaid: (u32, u32, u32),
    /// Register file; every value is kept truncated to its type's width
    values: FxHashMap<ValueId, u64>,
    steps: u64,
}

impl Thread<'_> {
    fn run(&mut self) -> Result<(), GpuError> {
        let blocks = self.blocks;
        let mut current = self.kernel.entry;
        loop {
            let block = match blocks.get(&current) {
                Some(block) => *block,
                None => {
                    return Err(self.fault(format!("branch to unknown block {}", current)));
                }
            };

            for (id, op) in &block.instructions {
                self.step()?;
                let value = self.eval(*id, op)?;
                self.values.insert(*id, value);
            }

            self.step()?;
            match &block.terminator {
                GpuTerminator::Br(target) => current = *target,
                GpuTerminator::CondBr(cond, then_block, else_block) => {
                    current = if self.get(*cond)? != 0 {
                        *then_block
                    } else {
                        *else_block
                    };
                }
                GpuTerminator::ReturnVoid => return Ok(()),
                GpuTerminator::Unreachable => {
                    return Err(self.fault(format!("reached unreachable code in {}", block.id)));
                }
            }
        }
    }

    fn eval(&mut self, id: ValueId, op: &GpuOp) -> Result<u64, GpuError> {
        let value = match op {
            GpuOp::ConstInt(v, ty) => truncate(*v as u64, ty),
            GpuOp::Add(a, b) => self.arith(id, *a, *b, u64::wrapping_add)?,
            GpuOp::Sub(a, b) => self.arith(id, *a, *b, u64::wrapping_sub)?,
            GpuOp::Mul(a, b) => self.arith(id, *a, *b, u64::wrapping_mul)?,
            GpuOp::Eq(a, b) => (self.get(*a)? == self.get(*b)?) as u64,
            GpuOp::Lt(a, b) => {
                let ty = self.type_of(*a)?;
                let (a, b) = (self.get(*a)?, self.get(*b)?);
                let less = match ty {
                    GpuType::I32 => (a as u32 as i32) < (b as u32 as i32),
                    GpuType::I64 => (a as i64) < (b as i64),
                    _ => a < b,
                };
                less as u64
            }
            GpuOp::Load(ptr, ty, space) => {
                self.check_space(*space)?;
                let address = self.get(*ptr)?;
                let mut bytes = [0u8; 8];
                let size = ty.size_bytes() as usize;
                self.memory.read(DevicePtr(address), &mut bytes[..size])?;
                u64::from_le_bytes(bytes)
            }
            GpuOp::Store(ptr, value, space) => {
                self.check_space(*space)?;
                let address = self.get(*ptr)?;
                let size = self.type_of(*value)?.size_bytes() as usize;
                let bytes = self.get(*value)?.to_le_bytes();
                self.memory.write(DevicePtr(address), &bytes[..size])?;
                0
            }
            GpuOp::GetElementPtr(ptr, index, elem) => {
                let base = self.get(*ptr)?;
                let raw = self.get(*index)?;
                let index = match self.type_of(*index)? {
                    GpuType::I32 => raw as u32 as i32 as i64 as u64,
                    _ => raw,
                };
                base.wrapping_add(index.wrapping_mul(elem.size_bytes() as u64))
            }
            // The simulated device has a single flat address space.
            GpuOp::ToGlobal(ptr) => self.get(*ptr)?,
            GpuOp::ThreadIdX => self.tid.0 as u64,
            GpuOp::BlockIdX => self.ctaid.0 as u64,
            GpuOp::BlockDimX => self.ntid.0 as u64,
            GpuOp::GridDimX => self.nctaid.0 as u64,
            GpuOp::Param(index) => {
                let raw = *self.params.get(*index as usize).ok_or_else(|| {
                    self.fault(format!("parameter {} was not bound", index))
                })?;
                truncate(raw, self.type_of(id)?)
            }
        };
        Ok(value)
    }

    fn arith(
        &self,
        id: ValueId,
        a: ValueId,
        b: ValueId,
        op: fn(u64, u64) -> u64,
    ) -> Result<u64, GpuError> {
        let result = op(self.get(a)?, self.get(b)?);
        Ok(truncate(result, self.type_of(id)?))
    }

    fn get(&self, id: ValueId) -> Result<u64, GpuError> {
        self.values
            .get(&id)
            .copied()
            .ok_or_else(|| self.fault(format!("read of {} before it was defined", id)))
    }

    fn type_of(&self, id: ValueId) -> Result<&GpuType, GpuError> {
        self.types
            .get(&id)
            .ok_or_else(|| self.fault(format!("{} has no type", id)))
    }

    fn check_space(&self, space: MemorySpace) -> Result<(), GpuError> {
        match space {
            MemorySpace::Global | MemorySpace::Generic => Ok(()),
            other => Err(self.fault(format!(
                "{} memory is not supported by the simulated device",
                other
            ))),
        }
    }

    fn step(&mut self) -> Result<(), GpuError> {
        self.steps += 1;
        if self.steps > MAX_STEPS_PER_THREAD {
            return Err(self.fault(format!(
                "exceeded {} steps without returning",
                MAX_STEPS_PER_THREAD
            )));
        }
        Ok(())
    }

    fn fault(&self, message: String) -> GpuError {
        GpuError::LaunchFailed(format!(
            "kernel `{}` thread {:?} block {:?}: {}",
            self.kernel.name, self.tid, self.ctaid, message
        ))
    }
}

/// Keep only the bits that fit in `ty`
fn truncate(value: u64, ty: &GpuType) -> u64 {
    match ty.size_bytes() {
        1 => value & 1,
        4 => value & 0xffff_ffff,
        _ => value,
    }
}
